//! Scheduler facade.
//!
//! The surface the transport layer drives: node connect handling, the
//! report authentication path, validation result ingest, election control,
//! and the record queries operators use. The facade owns no transport;
//! callers hand it transport-authenticated node ids and raw bodies.
//!
//! # Report Authentication
//!
//! Node workload reports arrive as a bincode `{cipher_text, sign}` envelope.
//! The signature is verified under the reporting node's stored public key
//! over the ciphertext, the ciphertext is decrypted with the scheduler's
//! private key, and the plaintext is handed to the workload handler with the
//! node snapshot. User workload reports carry ciphertext only; the TLS
//! channel authenticates the client, but the reporting node must still be
//! known to the registry. Nothing is committed on any failure.

use common::{
    crypto, ConnectOptions, MinioConfig, NodeType, ValidationInfo, ValidationResult,
    WorkloadRecord,
};
use rsa::RsaPrivateKey;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::assets::AssetManager;
use crate::config::SchedulerConfig;
use crate::node::{Node, NodeManager};
use crate::persist::{PersistError, Persistence};
use crate::rpc::{MeteredNodeApi, NodeApi};
use crate::metrics::Metrics;
use crate::validation::ValidationManager;
use crate::workload::WorkloadHandler;

/// Failures on the node-to-scheduler report ingress.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("node {0} not found")]
    UnknownNode(String),
    #[error("scheduler private key not exist")]
    MissingKey,
    #[error("decode report: {0}")]
    Decode(String),
    #[error("verify sign: {0}")]
    Signature(String),
    #[error("decrypt report: {0}")]
    Decrypt(String),
    #[error("workload handler: {0}")]
    Handler(String),
}

pub struct Scheduler {
    pub nodes: Arc<NodeManager>,
    pub assets: Arc<AssetManager>,
    pub validation: Arc<ValidationManager>,
    pub persistence: Arc<dyn Persistence>,
    pub workload: Arc<dyn WorkloadHandler>,
    pub metrics: Metrics,
    pub config: SchedulerConfig,
    /// Key for decrypting report ciphertexts; its public half is served to
    /// nodes for encrypting them
    pub private_key: Option<RsaPrivateKey>,
}

impl Scheduler {
    /// Process a node connect: fetch and verify the node's self-reported
    /// identity, reconcile persisted attributes, and publish it.
    pub async fn node_connect(
        &self,
        node_id: &str,
        remote_addr: &str,
        opts: ConnectOptions,
        node_type: NodeType,
        api: Arc<dyn NodeApi>,
    ) -> anyhow::Result<()> {
        // Reconnects only refresh the session token.
        if let Some(node) = self.nodes.get_node(node_id) {
            node.set_token(opts.token);
            info!(node_id, "node already connected, token refreshed");
            return Ok(());
        }

        let api: Arc<dyn NodeApi> = Arc::new(MeteredNodeApi::new(api, self.metrics.clone()));

        let mut node_info = api
            .get_node_info()
            .await
            .map_err(|e| anyhow::anyhow!("get node info {node_id}: {e}"))?;
        if node_info.node_id != node_id {
            anyhow::bail!("node id mismatch {}, {}", node_id, node_info.node_id);
        }

        let pem = self
            .nodes
            .load_node_public_key(node_id)
            .await
            .map_err(|e| anyhow::anyhow!("load node public key {node_id}: {e}"))?;
        let public_key = crypto::public_key_from_pem(&pem)
            .map_err(|e| anyhow::anyhow!("parse node public key {node_id}: {e}"))?;

        // Carry persisted attributes across sessions.
        match self.nodes.load_node_info(node_id).await {
            Ok(old_info) => {
                node_info.port_mapping = old_info.port_mapping;
                node_info.online_duration = old_info.online_duration;
            }
            Err(PersistError::NotFound) => {}
            Err(e) => anyhow::bail!("load node info {node_id}: {e}"),
        }

        node_info.node_type = Some(node_type);
        node_info.external_ip = split_host(remote_addr)?;

        let node = Node::new(
            node_id.to_string(),
            node_type,
            public_key,
            remote_addr.to_string(),
            opts.tcp_server_port,
            api,
            node_info.clone(),
            opts.token,
        );
        self.nodes.node_online(node, &node_info).await
    }

    /// Process a node disconnect: drop it from the registry and let asset
    /// machines replenish replicas it held.
    pub fn node_disconnect(&self, node_id: &str) {
        if self.nodes.node_offline(node_id).is_some() {
            self.assets.notify_node_offline(node_id);
        }
    }

    /// Ingest a signed and encrypted workload report from a node.
    pub async fn submit_node_workload_report(
        &self,
        node_id: &str,
        body: &[u8],
    ) -> Result<(), ReportError> {
        let node = self
            .nodes
            .get_node(node_id)
            .ok_or_else(|| ReportError::UnknownNode(node_id.to_string()))?;

        let report = common::NodeWorkloadReport::from_bytes(body)
            .map_err(|e| ReportError::Decode(e.to_string()))?;

        crypto::verify_sign(&node.public_key, &report.sign, &report.cipher_text)
            .map_err(|e| self.rejected(ReportError::Signature(e.to_string())))?;

        let private_key = self.private_key.as_ref().ok_or(ReportError::MissingKey)?;
        let plaintext = crypto::decrypt(private_key, &report.cipher_text)
            .map_err(|e| self.rejected(ReportError::Decrypt(e.to_string())))?;

        self.workload
            .handle_node_workload(&plaintext, node)
            .await
            .map_err(|e| ReportError::Handler(e.to_string()))
    }

    /// Ingest a user workload report. The channel authenticates the client,
    /// so there is no per-message signature, but the reporting node must
    /// still be known.
    pub async fn submit_user_workload_report(
        &self,
        node_id: &str,
        cipher_text: &[u8],
    ) -> Result<(), ReportError> {
        let node = self
            .nodes
            .get_node(node_id)
            .ok_or_else(|| ReportError::UnknownNode(node_id.to_string()))?;

        let private_key = self.private_key.as_ref().ok_or(ReportError::MissingKey)?;
        let plaintext = crypto::decrypt(private_key, cipher_text)
            .map_err(|e| self.rejected(ReportError::Decrypt(e.to_string())))?;

        self.workload
            .handle_user_workload(&plaintext, node)
            .await
            .map_err(|e| ReportError::Handler(e.to_string()))
    }

    /// Ingest a validation result: raw body plus a hex signature header,
    /// verified under the submitting validator's key.
    pub async fn node_validation_result(
        &self,
        node_id: &str,
        body: &[u8],
        sign_hex: &str,
    ) -> Result<(), ReportError> {
        let node = self
            .nodes
            .get_node(node_id)
            .ok_or_else(|| ReportError::UnknownNode(node_id.to_string()))?;

        let sign = hex::decode(sign_hex).map_err(|e| ReportError::Decode(e.to_string()))?;
        crypto::verify_sign(&node.public_key, &sign, body)
            .map_err(|e| self.rejected(ReportError::Signature(e.to_string())))?;

        let mut result = ValidationResult::from_bytes(body)
            .map_err(|e| ReportError::Decode(e.to_string()))?;
        result.validator = node_id.to_string();

        self.validation
            .push_result(result)
            .await
            .map_err(|e| ReportError::Handler(e.to_string()))
    }

    /// PEM of the scheduler's public key, which nodes encrypt reports under.
    pub fn get_scheduler_public_key(&self) -> Result<String, ReportError> {
        let private_key = self.private_key.as_ref().ok_or(ReportError::MissingKey)?;
        crypto::public_key_to_pem(&private_key.to_public_key())
            .map_err(|e| ReportError::Decode(e.to_string()))
    }

    /// Request an early validator election. Never blocks.
    pub fn trigger_election(&self) {
        self.validation.start_election();
    }

    pub fn get_validation_info(&self) -> ValidationInfo {
        ValidationInfo {
            next_election_time: self.validation.next_election_time(),
        }
    }

    /// Object-store credentials candidates fetch on demand.
    pub fn minio_config(&self) -> MinioConfig {
        self.config.minio.clone()
    }

    pub async fn get_workload_records(
        &self,
        node_id: &str,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<WorkloadRecord>> {
        Ok(self
            .persistence
            .load_workload_records(node_id, limit, offset)
            .await?)
    }

    pub async fn get_workload_record(&self, token_id: &str) -> anyhow::Result<WorkloadRecord> {
        Ok(self.persistence.load_workload_record(token_id).await?)
    }

    pub async fn get_validation_results(
        &self,
        node_id: &str,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<ValidationResult>> {
        Ok(self
            .persistence
            .load_validation_results(node_id, limit, offset)
            .await?)
    }

    fn rejected(&self, err: ReportError) -> ReportError {
        warn!(error = %err, "report rejected");
        self.metrics.record_report("rejected");
        err
    }
}

/// Host part of a "host:port" remote address, with IPv6 bracket support.
fn split_host(remote_addr: &str) -> anyhow::Result<String> {
    if let Some(rest) = remote_addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return Ok(host.to_string());
        }
        anyhow::bail!("malformed remote address {remote_addr}");
    }
    match remote_addr.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => Ok(host.to_string()),
        _ => anyhow::bail!("malformed remote address {remote_addr}"),
    }
}
