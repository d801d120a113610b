//! Workload report handling.
//!
//! After the authentication path has verified and decrypted a report, the
//! plaintext lands here: a list of [`Workload`] entries, each referencing
//! the token it was served under. Entries are matched against the persisted
//! token payloads, checked against the reporting party, and folded into the
//! workload record opened when the token was minted.

use async_trait::async_trait;
use common::{now_secs, Workload, WorkloadStatus};
use quick_cache::sync::Cache;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::node::Node;
use crate::persist::Persistence;

/// Receives authenticated, decrypted workload plaintext together with the
/// reporting node.
#[async_trait]
pub trait WorkloadHandler: Send + Sync {
    /// Report filed by the node that served the bytes.
    async fn handle_node_workload(&self, data: &[u8], node: Arc<Node>) -> anyhow::Result<()>;
    /// Report filed by the client that downloaded them.
    async fn handle_user_workload(&self, data: &[u8], node: Arc<Node>) -> anyhow::Result<()>;
}

/// Which side of a transfer a report came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReportSide {
    Node,
    Client,
}

/// Default workload handler: matches entries to token payloads and settles
/// workload records.
pub struct WorkloadManager {
    persistence: Arc<dyn Persistence>,
    metrics: Metrics,
    /// Dedupe of already-folded entries: "token_id:reporter" -> timestamp
    processed: Cache<String, u64>,
}

impl WorkloadManager {
    pub fn new(persistence: Arc<dyn Persistence>, metrics: Metrics) -> Self {
        Self {
            persistence,
            metrics,
            processed: Cache::new(10_000),
        }
    }

    async fn handle(&self, data: &[u8], node: Arc<Node>, side: ReportSide) -> anyhow::Result<()> {
        let workloads: Vec<Workload> = bincode::deserialize(data)
            .map_err(|e| anyhow::anyhow!("decode workload list: {e}"))?;

        for workload in workloads {
            let dedupe_key = format!("{}:{}", workload.token_id, node.node_id);
            if self.processed.get(&dedupe_key).is_some() {
                debug!(token_id = %workload.token_id, node_id = %node.node_id,
                    "skipping duplicate workload entry");
                continue;
            }

            let mut record = match self.persistence.load_workload_record(&workload.token_id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(token_id = %workload.token_id, node_id = %node.node_id, error = %e,
                        "workload entry references unknown token");
                    self.metrics.record_report("unknown_token");
                    continue;
                }
            };

            // The reporter must be a party to the token.
            let expected = match side {
                ReportSide::Node => &record.payload.node_id,
                ReportSide::Client => &record.payload.client_id,
            };
            if expected != &node.node_id {
                warn!(token_id = %workload.token_id, node_id = %node.node_id,
                    expected = %expected, "workload entry from a node foreign to the token");
                self.metrics.record_report("wrong_party");
                continue;
            }

            if now_secs() > record.payload.expiration {
                warn!(token_id = %workload.token_id, node_id = %node.node_id,
                    "workload entry against an expired token");
                self.metrics.record_report("expired_token");
                continue;
            }

            match side {
                ReportSide::Node => record.node_workload = Some(workload.clone()),
                ReportSide::Client => record.client_workload = Some(workload.clone()),
            }
            record.status = WorkloadStatus::Succeeded;
            self.persistence
                .save_workload_record(&record)
                .await
                .map_err(|e| anyhow::anyhow!("save workload record: {e}"))?;

            self.processed.insert(dedupe_key, now_secs());
            self.metrics.record_report("accepted");
            debug!(token_id = %workload.token_id, node_id = %node.node_id,
                download_size = workload.download_size, "workload entry recorded");
        }

        Ok(())
    }
}

#[async_trait]
impl WorkloadHandler for WorkloadManager {
    async fn handle_node_workload(&self, data: &[u8], node: Arc<Node>) -> anyhow::Result<()> {
        self.handle(data, node, ReportSide::Node).await
    }

    async fn handle_user_workload(&self, data: &[u8], node: Arc<Node>) -> anyhow::Result<()> {
        self.handle(data, node, ReportSide::Client).await
    }
}
