//! Asset replication management.
//!
//! The [`AssetManager`] owns one replication machine per asset hash. Many
//! machines advance in parallel; within one machine, handlers run
//! sequentially. Admission spawns a machine, pull-progress reports and
//! removal are delivered into its mailbox, and the manager respawns every
//! persisted machine after a restart.

pub mod machine;
pub mod placement;
pub mod state;
pub mod token;

use anyhow::{anyhow, bail};
use common::{AssetHash, NodeId, ReplicaStatus};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::config::AssetsConfig;
use crate::metrics::Metrics;
use crate::node::NodeManager;
use crate::persist::Persistence;
use machine::AssetMachine;
use state::{AssetEvent, AssetPullingInfo, AssetState, SEED_REPLICA_COUNT};
use token::TokenMint;

/// Dependencies shared by every machine.
pub(crate) struct AssetContext {
    pub nodes: Arc<NodeManager>,
    pub persistence: Arc<dyn Persistence>,
    pub config: AssetsConfig,
    pub metrics: Metrics,
    pub mint: TokenMint,
    pub machines: DashMap<AssetHash, MachineHandle>,
}

/// Mailbox and cancellation signal of one live machine.
pub(crate) struct MachineHandle {
    tx: mpsc::UnboundedSender<AssetEvent>,
    cancel: watch::Sender<bool>,
}

/// Admission request for an asset the fleet pulls from origin.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PullAssetRequest {
    pub cid: String,
    pub hash: AssetHash,
    /// Asset size in bytes
    pub size: i64,
    /// Target aggregate edge upload bandwidth, MiB/s
    pub bandwidth: i64,
    pub candidate_replicas: i64,
    pub edge_replicas: i64,
}

/// Admission request for an asset a client uploads to a named seed node.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct UploadAssetRequest {
    pub cid: String,
    pub hash: AssetHash,
    pub size: i64,
    pub bandwidth: i64,
    pub candidate_replicas: i64,
    pub edge_replicas: i64,
    pub seed_node_id: NodeId,
}

pub struct AssetManager {
    ctx: Arc<AssetContext>,
}

impl AssetManager {
    pub fn new(
        nodes: Arc<NodeManager>,
        persistence: Arc<dyn Persistence>,
        config: AssetsConfig,
        metrics: Metrics,
    ) -> Self {
        let mint = TokenMint::new(config.token_expiration());
        Self {
            ctx: Arc::new(AssetContext {
                nodes,
                persistence,
                config,
                metrics,
                mint,
                machines: DashMap::new(),
            }),
        }
    }

    /// Respawn machines for every persisted asset row. Handlers re-derive
    /// their work from the durable state, so this is safe to run on every
    /// start.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let infos = self
            .ctx
            .persistence
            .load_asset_states()
            .await
            .map_err(|e| anyhow!("load asset states: {e}"))?;

        let mut restored = 0;
        for info in infos {
            if self.ctx.machines.contains_key(&info.hash) {
                continue;
            }
            self.spawn_machine(info);
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "asset machines restored from persisted state");
        }
        Ok(restored)
    }

    /// Admit an asset that the fleet pulls from origin.
    pub async fn pull_asset(&self, req: PullAssetRequest) -> anyhow::Result<()> {
        self.validate_targets(&req.cid, &req.hash, req.candidate_replicas, req.edge_replicas)?;
        if self.ctx.machines.contains_key(&req.hash) {
            bail!("asset {} already exists", req.hash);
        }

        let info = AssetPullingInfo {
            state: AssetState::SeedSelect,
            hash: req.hash,
            cid: req.cid,
            size: req.size,
            bandwidth: req.bandwidth,
            candidate_replicas: req.candidate_replicas,
            edge_replicas: req.edge_replicas,
            seed_node_id: None,
            candidate_replica_succeeds: Vec::new(),
            edge_replica_succeeds: Vec::new(),
            candidate_waitings: 0,
            edge_waitings: 0,
            replenish_replicas: 0,
            retry_count: 0,
        };
        self.ctx
            .persistence
            .save_asset_state(&info)
            .await
            .map_err(|e| anyhow!("save asset state {}: {e}", info.hash))?;
        self.spawn_machine(info);
        Ok(())
    }

    /// Admit an asset a client uploads to the named candidate.
    pub async fn create_asset_upload(&self, req: UploadAssetRequest) -> anyhow::Result<()> {
        self.validate_targets(&req.cid, &req.hash, req.candidate_replicas, req.edge_replicas)?;
        if req.seed_node_id.is_empty() {
            bail!("upload admission requires a seed node");
        }
        if self.ctx.machines.contains_key(&req.hash) {
            bail!("asset {} already exists", req.hash);
        }

        let info = AssetPullingInfo {
            state: AssetState::UploadInit,
            hash: req.hash,
            cid: req.cid,
            size: req.size,
            bandwidth: req.bandwidth,
            candidate_replicas: req.candidate_replicas,
            edge_replicas: req.edge_replicas,
            seed_node_id: Some(req.seed_node_id),
            candidate_replica_succeeds: Vec::new(),
            edge_replica_succeeds: Vec::new(),
            candidate_waitings: 0,
            edge_waitings: 0,
            replenish_replicas: 0,
            retry_count: 0,
        };
        self.ctx
            .persistence
            .save_asset_state(&info)
            .await
            .map_err(|e| anyhow!("save asset state {}: {e}", info.hash))?;
        self.spawn_machine(info);
        Ok(())
    }

    /// Ingest a node's pull completion report and forward it to the machine.
    pub async fn push_pull_result(
        &self,
        hash: &str,
        node_id: &str,
        is_candidate: bool,
        succeeded: bool,
    ) -> anyhow::Result<()> {
        let status = if succeeded {
            ReplicaStatus::Succeeded
        } else {
            ReplicaStatus::Failed
        };
        self.ctx
            .persistence
            .update_replica_status(hash, node_id, status)
            .await
            .map_err(|e| anyhow!("update replica {hash}/{node_id}: {e}"))?;

        self.send_event(
            hash,
            AssetEvent::PullResult {
                node_id: node_id.to_string(),
                is_candidate,
                succeeded,
            },
        )
    }

    /// Remove the asset: tear down replicas, drop durable state, stop the
    /// machine. Surfaces the first replica-removal error; the remainder can
    /// be retried with another call.
    pub async fn remove_asset(&self, hash: &str) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_event(
            hash,
            AssetEvent::Remove {
                reply: Some(reply_tx),
            },
        )?;
        reply_rx
            .await
            .map_err(|_| anyhow!("asset {hash} remove reply dropped"))?
    }

    /// Tell every machine that a node disappeared. Machines holding one of
    /// its edge replicas in service schedule a replenishment.
    pub fn notify_node_offline(&self, node_id: &str) {
        debug!(node_id, "notifying asset machines of offline node");
        for entry in self.ctx.machines.iter() {
            let _ = entry.tx.send(AssetEvent::EdgeOffline {
                node_id: node_id.to_string(),
            });
        }
    }

    pub fn asset_count(&self) -> usize {
        self.ctx.machines.len()
    }

    /// Cancel every machine. Cool-downs abort immediately; in-flight
    /// dispatches are left to time out on their own.
    pub fn shutdown(&self) {
        for entry in self.ctx.machines.iter() {
            let _ = entry.cancel.send(true);
        }
    }

    fn validate_targets(
        &self,
        cid: &str,
        hash: &str,
        candidate_replicas: i64,
        edge_replicas: i64,
    ) -> anyhow::Result<()> {
        if cid.is_empty() || hash.is_empty() {
            bail!("asset admission requires cid and hash");
        }
        if candidate_replicas < SEED_REPLICA_COUNT as i64 {
            bail!("candidate replica target must cover the seed copy");
        }
        if edge_replicas < 0 {
            bail!("edge replica target must not be negative");
        }
        Ok(())
    }

    fn send_event(&self, hash: &str, event: AssetEvent) -> anyhow::Result<()> {
        let handle = self
            .ctx
            .machines
            .get(hash)
            .ok_or_else(|| anyhow!("asset {hash} not found"))?;
        handle
            .tx
            .send(event)
            .map_err(|_| anyhow!("asset {hash} machine stopped"))
    }

    fn spawn_machine(&self, info: AssetPullingInfo) {
        let hash = info.hash.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.ctx
            .machines
            .insert(hash.clone(), MachineHandle { tx, cancel: cancel_tx });
        self.ctx.metrics.assets_active.inc();

        let machine = AssetMachine::new(self.ctx.clone(), info, cancel_rx);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            machine.run(rx).await;
            ctx.machines.remove(&hash);
            ctx.metrics.assets_active.dec();
        });
    }
}
