//! Persistence collaborator.
//!
//! The scheduler does not own storage. Everything durable flows through the
//! [`Persistence`] trait: replica rows, token payloads, asset machine state,
//! validator lists, node records, and workload records. Each call is
//! synchronous at its own granularity; recovery relies on idempotent
//! re-dispatch rather than multi-call transactions.
//!
//! [`MemStore`] is the bundled in-memory backend. It keeps the scheduler
//! runnable without external storage and backs the test suites; deployments
//! wanting durability across process restarts plug in their own
//! implementation.

use async_trait::async_trait;
use common::{
    NodeId, NodeInfo, ReplicaInfo, ReplicaStatus, TokenPayload, ValidationResult, WorkloadRecord,
};
use dashmap::DashMap;
use thiserror::Error;

use crate::assets::state::AssetPullingInfo;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("not found")]
    NotFound,
    #[error("storage: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, PersistError>;

/// Storage operations the scheduler core depends on.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ---- Replica rows ----
    async fn save_replica_information(&self, replicas: &[ReplicaInfo]) -> Result<()>;
    async fn update_replica_status(
        &self,
        hash: &str,
        node_id: &str,
        status: ReplicaStatus,
    ) -> Result<()>;
    /// Load replica rows for an asset, filtered to the given statuses.
    /// An empty filter loads all rows.
    async fn load_replicas_by_status(
        &self,
        hash: &str,
        statuses: &[ReplicaStatus],
    ) -> Result<Vec<ReplicaInfo>>;
    /// Drop every row for the asset that is not `Succeeded`.
    async fn delete_unfinished_replicas(&self, hash: &str) -> Result<()>;
    async fn remove_replica(&self, cid: &str, hash: &str, node_id: &str) -> Result<()>;

    // ---- Token payloads / workload records ----
    async fn save_token_payloads(&self, payloads: &[TokenPayload]) -> Result<()>;
    async fn load_token_payload(&self, token_id: &str) -> Result<TokenPayload>;
    async fn save_workload_record(&self, record: &WorkloadRecord) -> Result<()>;
    async fn load_workload_record(&self, token_id: &str) -> Result<WorkloadRecord>;
    async fn load_workload_records(
        &self,
        node_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WorkloadRecord>>;

    // ---- Asset machine state ----
    async fn save_asset_state(&self, info: &AssetPullingInfo) -> Result<()>;
    async fn load_asset_states(&self) -> Result<Vec<AssetPullingInfo>>;
    async fn delete_asset_state(&self, hash: &str) -> Result<()>;

    // ---- Validators ----
    async fn load_validators(&self) -> Result<Vec<NodeId>>;
    async fn update_validators(&self, validators: &[NodeId]) -> Result<()>;

    // ---- Node records ----
    async fn load_node_public_key(&self, node_id: &str) -> Result<String>;
    async fn load_node_info(&self, node_id: &str) -> Result<NodeInfo>;
    async fn node_online(&self, node_id: &str, info: &NodeInfo) -> Result<()>;

    // ---- Validation results ----
    async fn save_validation_result(&self, result: &ValidationResult) -> Result<()>;
    async fn load_validation_results(
        &self,
        node_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ValidationResult>>;
}

// ============================================================================
// In-Memory Backend
// ============================================================================

/// In-memory [`Persistence`] backend.
#[derive(Default)]
pub struct MemStore {
    /// hash -> replica rows
    replicas: DashMap<String, Vec<ReplicaInfo>>,
    tokens: DashMap<String, TokenPayload>,
    workloads: DashMap<String, WorkloadRecord>,
    assets: DashMap<String, AssetPullingInfo>,
    validators: parking_lot::RwLock<Vec<NodeId>>,
    node_keys: DashMap<String, String>,
    node_infos: DashMap<String, NodeInfo>,
    validation_results: parking_lot::RwLock<Vec<ValidationResult>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a node's public key PEM, normally done out of band at node
    /// registration time.
    pub fn insert_node_public_key(&self, node_id: &str, pem: &str) {
        self.node_keys.insert(node_id.to_string(), pem.to_string());
    }
}

#[async_trait]
impl Persistence for MemStore {
    async fn save_replica_information(&self, replicas: &[ReplicaInfo]) -> Result<()> {
        for replica in replicas {
            let mut rows = self.replicas.entry(replica.hash.clone()).or_default();
            match rows.iter_mut().find(|r| r.node_id == replica.node_id) {
                Some(existing) => *existing = replica.clone(),
                None => rows.push(replica.clone()),
            }
        }
        Ok(())
    }

    async fn update_replica_status(
        &self,
        hash: &str,
        node_id: &str,
        status: ReplicaStatus,
    ) -> Result<()> {
        let mut rows = self.replicas.get_mut(hash).ok_or(PersistError::NotFound)?;
        let row = rows
            .iter_mut()
            .find(|r| r.node_id == node_id)
            .ok_or(PersistError::NotFound)?;
        row.status = status;
        Ok(())
    }

    async fn load_replicas_by_status(
        &self,
        hash: &str,
        statuses: &[ReplicaStatus],
    ) -> Result<Vec<ReplicaInfo>> {
        let rows = match self.replicas.get(hash) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        Ok(rows
            .iter()
            .filter(|r| statuses.is_empty() || statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn delete_unfinished_replicas(&self, hash: &str) -> Result<()> {
        if let Some(mut rows) = self.replicas.get_mut(hash) {
            rows.retain(|r| r.status == ReplicaStatus::Succeeded);
        }
        Ok(())
    }

    async fn remove_replica(&self, _cid: &str, hash: &str, node_id: &str) -> Result<()> {
        if let Some(mut rows) = self.replicas.get_mut(hash) {
            rows.retain(|r| r.node_id != node_id);
        }
        Ok(())
    }

    async fn save_token_payloads(&self, payloads: &[TokenPayload]) -> Result<()> {
        for payload in payloads {
            self.tokens.insert(payload.id.clone(), payload.clone());
            // A fresh workload record is opened alongside each token so
            // later reports have something to match against.
            self.workloads
                .insert(payload.id.clone(), WorkloadRecord::new(payload.clone()));
        }
        Ok(())
    }

    async fn load_token_payload(&self, token_id: &str) -> Result<TokenPayload> {
        self.tokens
            .get(token_id)
            .map(|p| p.clone())
            .ok_or(PersistError::NotFound)
    }

    async fn save_workload_record(&self, record: &WorkloadRecord) -> Result<()> {
        self.workloads
            .insert(record.payload.id.clone(), record.clone());
        Ok(())
    }

    async fn load_workload_record(&self, token_id: &str) -> Result<WorkloadRecord> {
        self.workloads
            .get(token_id)
            .map(|r| r.clone())
            .ok_or(PersistError::NotFound)
    }

    async fn load_workload_records(
        &self,
        node_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WorkloadRecord>> {
        Ok(self
            .workloads
            .iter()
            .filter(|r| r.payload.node_id == node_id || r.payload.client_id == node_id)
            .map(|r| r.clone())
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn save_asset_state(&self, info: &AssetPullingInfo) -> Result<()> {
        self.assets.insert(info.hash.clone(), info.clone());
        Ok(())
    }

    async fn load_asset_states(&self) -> Result<Vec<AssetPullingInfo>> {
        Ok(self.assets.iter().map(|a| a.clone()).collect())
    }

    async fn delete_asset_state(&self, hash: &str) -> Result<()> {
        self.assets.remove(hash);
        Ok(())
    }

    async fn load_validators(&self) -> Result<Vec<NodeId>> {
        Ok(self.validators.read().clone())
    }

    async fn update_validators(&self, validators: &[NodeId]) -> Result<()> {
        *self.validators.write() = validators.to_vec();
        Ok(())
    }

    async fn load_node_public_key(&self, node_id: &str) -> Result<String> {
        self.node_keys
            .get(node_id)
            .map(|k| k.clone())
            .ok_or(PersistError::NotFound)
    }

    async fn load_node_info(&self, node_id: &str) -> Result<NodeInfo> {
        self.node_infos
            .get(node_id)
            .map(|i| i.clone())
            .ok_or(PersistError::NotFound)
    }

    async fn node_online(&self, node_id: &str, info: &NodeInfo) -> Result<()> {
        self.node_infos.insert(node_id.to_string(), info.clone());
        Ok(())
    }

    async fn save_validation_result(&self, result: &ValidationResult) -> Result<()> {
        self.validation_results.write().push(result.clone());
        Ok(())
    }

    async fn load_validation_results(
        &self,
        node_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ValidationResult>> {
        Ok(self
            .validation_results
            .read()
            .iter()
            .filter(|r| r.node_id == node_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
