//! Node registry.
//!
//! The registry is the authoritative in-memory directory of currently
//! connected nodes and the single synchronization point for node existence.
//! It exclusively owns [`Node`] records; everything handed out is either an
//! `Arc` snapshot or a plain-data [`NodeSnapshot`] for the placement engine.
//!
//! # Concurrency Model
//!
//! - `DashMap` for the directory: many concurrent readers, one writer per
//!   node id (connect/disconnect)
//! - `parking_lot::RwLock` for the validator role lists, rewritten wholesale
//!   by each election

use common::{NodeId, NodeInfo, NodeType};
use dashmap::DashMap;
use parking_lot::RwLock;
use rsa::RsaPublicKey;
use std::sync::Arc;
use tracing::info;

use crate::metrics::Metrics;
use crate::persist::{Persistence, Result as PersistResult};
use crate::rpc::NodeApi;

/// A connected node.
///
/// Identity, role, key material, and the transport capability handle are
/// fixed for the connected lifetime; the advertised capability facts and the
/// session token sit behind locks because keep-alives may refresh them.
pub struct Node {
    pub node_id: NodeId,
    pub node_type: NodeType,
    /// Verification key for this node's report signatures
    pub public_key: RsaPublicKey,
    /// Remote address of the node's connection, "host:port"
    pub remote_addr: String,
    /// Port of the node's TCP file server
    pub tcp_port: u16,
    /// Opaque dispatcher handle to the node's RPC transport
    pub api: Arc<dyn NodeApi>,
    /// Unix timestamp of the connect
    pub connected_at: u64,
    token: RwLock<String>,
    info: RwLock<NodeInfo>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        node_type: NodeType,
        public_key: RsaPublicKey,
        remote_addr: String,
        tcp_port: u16,
        api: Arc<dyn NodeApi>,
        info: NodeInfo,
        token: String,
    ) -> Self {
        Self {
            node_id,
            node_type,
            public_key,
            remote_addr,
            tcp_port,
            api,
            connected_at: common::now_secs(),
            token: RwLock::new(token),
            info: RwLock::new(info),
        }
    }

    /// Read-only snapshot of the node's advertised facts.
    pub fn info(&self) -> NodeInfo {
        self.info.read().clone()
    }

    pub fn bandwidth_up(&self) -> u64 {
        self.info.read().bandwidth_up
    }

    pub fn external_ip(&self) -> String {
        self.info.read().external_ip.clone()
    }

    /// "host:port" a destination uses to pull from this node.
    pub fn download_address(&self) -> String {
        format!("{}:{}", self.external_ip(), self.tcp_port)
    }

    pub fn set_token(&self, token: String) {
        *self.token.write() = token;
    }

    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    /// Plain-data snapshot for the placement engine.
    pub fn snapshot(&self) -> NodeSnapshot {
        let info = self.info.read();
        NodeSnapshot {
            node_id: self.node_id.clone(),
            node_type: self.node_type,
            bandwidth_up: info.bandwidth_up,
            available_disk_space: info.available_disk_space,
            external_ip: info.external_ip.clone(),
            tcp_port: self.tcp_port,
        }
    }
}

/// Placement-relevant facts of one node, detached from the registry.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub bandwidth_up: u64,
    pub available_disk_space: f64,
    pub external_ip: String,
    pub tcp_port: u16,
}

/// Authoritative directory of connected nodes plus the validator role lists.
pub struct NodeManager {
    nodes: DashMap<NodeId, Arc<Node>>,
    validators: RwLock<Vec<NodeId>>,
    validatables: RwLock<Vec<NodeId>>,
    persistence: Arc<dyn Persistence>,
    metrics: Metrics,
    pub server_id: String,
}

impl NodeManager {
    pub fn new(persistence: Arc<dyn Persistence>, metrics: Metrics, server_id: String) -> Self {
        Self {
            nodes: DashMap::new(),
            validators: RwLock::new(Vec::new()),
            validatables: RwLock::new(Vec::new()),
            persistence,
            metrics,
            server_id,
        }
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    pub fn get_candidate_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.get_node(node_id)
            .filter(|n| n.node_type == NodeType::Candidate)
    }

    pub fn get_edge_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.get_node(node_id)
            .filter(|n| n.node_type == NodeType::Edge)
    }

    /// Candidate nodes currently healthy enough to bear replicas or validate.
    pub fn all_valid_candidates(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Candidate)
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// Placement snapshots of every connected node with the given role.
    pub fn snapshots(&self, node_type: NodeType) -> Vec<NodeSnapshot> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == node_type)
            .map(|n| n.snapshot())
            .collect()
    }

    /// Publish a node, reconciling against its persisted record.
    ///
    /// The caller is responsible for having verified that the node id
    /// matches the identity the node itself advertises; this re-checks the
    /// invariant before anything is committed.
    pub async fn node_online(&self, node: Node, info: &NodeInfo) -> anyhow::Result<()> {
        if node.node_id != info.node_id {
            anyhow::bail!("node id mismatch: {} vs {}", node.node_id, info.node_id);
        }

        self.persistence
            .node_online(&node.node_id, info)
            .await
            .map_err(|e| anyhow::anyhow!("persist node online {}: {e}", node.node_id))?;

        info!(
            node_id = %node.node_id,
            node_type = %node.node_type,
            address = %node.remote_addr,
            "node connected"
        );
        self.nodes.insert(node.node_id.clone(), Arc::new(node));
        self.update_node_gauges();
        Ok(())
    }

    /// Drop a node from the directory on disconnect.
    pub fn node_offline(&self, node_id: &str) -> Option<Arc<Node>> {
        let removed = self.nodes.remove(node_id).map(|(_, n)| n);
        if let Some(node) = &removed {
            info!(node_id = %node.node_id, node_type = %node.node_type, "node disconnected");
            self.update_node_gauges();
        }
        removed
    }

    pub async fn load_node_public_key(&self, node_id: &str) -> PersistResult<String> {
        self.persistence.load_node_public_key(node_id).await
    }

    pub async fn load_node_info(&self, node_id: &str) -> PersistResult<NodeInfo> {
        self.persistence.load_node_info(node_id).await
    }

    pub async fn load_validators(&self) -> PersistResult<Vec<NodeId>> {
        self.persistence.load_validators().await
    }

    pub async fn update_validators(&self, validators: &[NodeId]) -> PersistResult<()> {
        self.persistence.update_validators(validators).await
    }

    /// Replace both validator role lists with an election's output.
    pub fn reset_validator_group(&self, validators: Vec<NodeId>, validatables: Vec<NodeId>) {
        *self.validators.write() = validators;
        *self.validatables.write() = validatables;
    }

    pub fn validators(&self) -> Vec<NodeId> {
        self.validators.read().clone()
    }

    pub fn validatables(&self) -> Vec<NodeId> {
        self.validatables.read().clone()
    }

    pub fn node_count(&self, node_type: NodeType) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.node_type == node_type)
            .count()
    }

    fn update_node_gauges(&self) {
        for node_type in [NodeType::Edge, NodeType::Candidate] {
            self.metrics
                .node_count
                .get_or_create(&[("type".to_string(), node_type.as_str().to_string())])
                .set(self.node_count(node_type) as i64);
        }
    }
}
