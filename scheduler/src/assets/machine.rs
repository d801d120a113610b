//! Per-asset replication machine.
//!
//! One machine task runs per asset hash. Each loop iteration runs the
//! handler for the current state; the handler either emits the next event
//! itself (select steps, completed pulls) or yields back to the mailbox,
//! where external events arrive: pull reports, removal, and the per-asset
//! timeout. State handlers run sequentially, so all transitions for one
//! asset are linearizable; side-effect fan-out (pull dispatch) is spawned
//! and never blocks a transition.
//!
//! Durable state is persisted after every accepted event, and handlers only
//! re-derive work from that state, so a machine respawned from its persisted
//! row continues where it left off.

use anyhow::anyhow;
use common::{DownloadSource, NodeType, ReplicaInfo, ReplicaStatus, SourceDownloadInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::placement;
use super::state::{plan, AssetEvent, AssetPullingInfo, AssetState, SEED_REPLICA_COUNT};
use super::AssetContext;
use crate::node::NodeSnapshot;

pub(crate) struct AssetMachine {
    ctx: Arc<AssetContext>,
    info: AssetPullingInfo,
    cancel: watch::Receiver<bool>,
    /// Armed while pulls are outstanding; expiry drains the waitings
    deadline: Option<Instant>,
    remove_reply: Option<tokio::sync::oneshot::Sender<anyhow::Result<()>>>,
    done: bool,
}

impl AssetMachine {
    pub(crate) fn new(
        ctx: Arc<AssetContext>,
        info: AssetPullingInfo,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            info,
            cancel,
            deadline: None,
            remove_reply: None,
            done: false,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<AssetEvent>) {
        debug!(hash = %self.info.hash, state = %self.info.state, "asset machine started");

        loop {
            if *self.cancel.borrow() {
                return;
            }

            let emitted = match self.dispatch_state().await {
                Ok(ev) => ev,
                Err(e) => {
                    error!(hash = %self.info.hash, state = %self.info.state, error = %e,
                        "asset state handler failed");
                    None
                }
            };
            if self.done {
                return;
            }

            let event = match emitted {
                Some(ev) => ev,
                None => {
                    let deadline = self.deadline;
                    let timeout = async move {
                        match deadline {
                            Some(d) => tokio::time::sleep_until(d).await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        _ = self.cancel.changed() => return,
                        ev = events.recv() => match ev {
                            Some(ev) => ev,
                            None => return,
                        },
                        _ = timeout => AssetEvent::PullTimeout,
                    }
                }
            };

            if let Err(e) = self.apply(event).await {
                error!(hash = %self.info.hash, error = %e, "failed to apply asset event");
            }
        }
    }

    /// Apply one event: mutate the durable record, transition per the plan,
    /// persist.
    async fn apply(&mut self, event: AssetEvent) -> anyhow::Result<()> {
        let next = plan(&self.info, &event);

        match event {
            AssetEvent::PullResult {
                node_id,
                is_candidate,
                succeeded,
            } => {
                if is_candidate {
                    if self.info.candidate_waitings > 0 {
                        self.info.candidate_waitings -= 1;
                    }
                    if succeeded && !self.info.candidate_replica_succeeds.contains(&node_id) {
                        self.info.candidate_replica_succeeds.push(node_id);
                    }
                } else {
                    if self.info.edge_waitings > 0 {
                        self.info.edge_waitings -= 1;
                    }
                    if succeeded && !self.info.edge_replica_succeeds.contains(&node_id) {
                        self.info.edge_replica_succeeds.push(node_id);
                    }
                }
            }
            AssetEvent::PullTimeout => {
                warn!(hash = %self.info.hash, state = %self.info.state,
                    candidate_waitings = self.info.candidate_waitings,
                    edge_waitings = self.info.edge_waitings,
                    "asset pull timed out, draining waitings");
                self.deadline = None;
                self.info.candidate_waitings = 0;
                self.info.edge_waitings = 0;
            }
            AssetEvent::EdgeOffline { node_id } => {
                if next.is_some() {
                    info!(hash = %self.info.hash, node_id = %node_id,
                        "edge replica lost, scheduling replenishment");
                    self.info.edge_replica_succeeds.retain(|n| n != &node_id);
                    self.info.replenish_replicas += 1;
                }
            }
            AssetEvent::Remove { reply } => {
                self.remove_reply = reply;
            }
            AssetEvent::AssetRePull => {
                self.info.retry_count += 1;
                self.info.candidate_waitings = 0;
                self.info.edge_waitings = 0;
            }
            AssetEvent::SelectFailed { error } | AssetEvent::PullFailed { error } => {
                warn!(hash = %self.info.hash, state = %self.info.state, error = %error,
                    "asset replication step failed");
            }
            AssetEvent::PullRequestSent | AssetEvent::SkipStep | AssetEvent::PullSucceed => {}
        }

        if let Some(next) = next {
            debug!(hash = %self.info.hash, from = %self.info.state, to = %next,
                "asset state transition");
            self.info.state = next;
            self.ctx.metrics.record_transition(next.as_str());
        }

        self.save_state().await
    }

    async fn dispatch_state(&mut self) -> anyhow::Result<Option<AssetEvent>> {
        match self.info.state {
            AssetState::SeedSelect => self.handle_seed_select().await,
            AssetState::SeedPulling => self.handle_seed_pulling(),
            AssetState::UploadInit => self.handle_upload_init().await,
            AssetState::SeedUploading => self.handle_seed_uploading(),
            AssetState::CandidatesSelect => self.handle_candidates_select().await,
            AssetState::CandidatesPulling => self.handle_candidates_pulling(),
            AssetState::EdgesSelect => self.handle_edges_select().await,
            AssetState::EdgesPulling => self.handle_edges_pulling(),
            AssetState::Servicing => self.handle_servicing().await,
            AssetState::PullsFailed => self.handle_pulls_failed().await,
            AssetState::UploadFailed => self.handle_upload_failed(),
            AssetState::Remove => self.handle_remove().await,
        }
    }

    // ---- Select states ----

    async fn handle_seed_select(&mut self) -> anyhow::Result<Option<AssetEvent>> {
        debug!(cid = %self.info.cid, "handle seed select");

        if self.info.candidate_replica_succeeds.len() >= SEED_REPLICA_COUNT {
            return Ok(Some(AssetEvent::SkipStep));
        }

        let candidates = self.ctx.nodes.snapshots(NodeType::Candidate);
        let (nodes, diagnostic) = placement::choose_candidate_nodes(
            &candidates,
            SEED_REPLICA_COUNT,
            &self.info.candidate_replica_succeeds,
        );
        if nodes.is_empty() {
            return Ok(Some(AssetEvent::SelectFailed {
                error: format!("node not found; {diagnostic}"),
            }));
        }

        if let Err(e) = self.save_replicas(&nodes, true).await {
            return Ok(Some(AssetEvent::SelectFailed {
                error: e.to_string(),
            }));
        }

        self.info.candidate_waitings += nodes.len() as i64;
        self.start_timeout();
        self.dispatch_pulls(nodes, None);

        Ok(Some(AssetEvent::PullRequestSent))
    }

    async fn handle_upload_init(&mut self) -> anyhow::Result<Option<AssetEvent>> {
        debug!(cid = %self.info.cid, seed_node = ?self.info.seed_node_id, "handle upload init");

        if self.info.candidate_replica_succeeds.len() >= SEED_REPLICA_COUNT {
            return Ok(Some(AssetEvent::SkipStep));
        }

        let seed_node_id = match &self.info.seed_node_id {
            Some(id) => id.clone(),
            None => {
                return Ok(Some(AssetEvent::SelectFailed {
                    error: "no seed node bound for upload".to_string(),
                }))
            }
        };
        let node = match self.ctx.nodes.get_candidate_node(&seed_node_id) {
            Some(node) => node,
            None => {
                return Ok(Some(AssetEvent::SelectFailed {
                    error: format!("seed candidate {seed_node_id} not online"),
                }))
            }
        };

        if let Err(e) = self.save_replicas(&[node.snapshot()], true).await {
            return Ok(Some(AssetEvent::SelectFailed {
                error: e.to_string(),
            }));
        }

        self.info.candidate_waitings += 1;
        self.start_timeout();
        // No pull dispatch: the client uploads straight to the bound seed.

        Ok(Some(AssetEvent::PullRequestSent))
    }

    async fn handle_candidates_select(&mut self) -> anyhow::Result<Option<AssetEvent>> {
        debug!(cid = %self.info.cid, "handle candidates select");

        let sources = placement::get_download_sources(
            &self.ctx.nodes,
            &self.info.cid,
            &self.info.candidate_replica_succeeds,
        );
        if sources.is_empty() {
            return Ok(Some(AssetEvent::SelectFailed {
                error: "source node not found".to_string(),
            }));
        }

        let need = self.info.candidate_need();
        if need < 1 {
            return Ok(Some(AssetEvent::SkipStep));
        }

        let candidates = self.ctx.nodes.snapshots(NodeType::Candidate);
        let (nodes, diagnostic) = placement::choose_candidate_nodes(
            &candidates,
            need as usize,
            &self.info.candidate_replica_succeeds,
        );
        if nodes.is_empty() {
            return Ok(Some(AssetEvent::SelectFailed {
                error: format!("node not found; {diagnostic}"),
            }));
        }

        match self.mint_and_save(&sources, &nodes, true).await {
            Ok(download_sources) => {
                self.info.candidate_waitings += nodes.len() as i64;
                self.start_timeout();
                self.dispatch_pulls(nodes, Some(download_sources));
                Ok(Some(AssetEvent::PullRequestSent))
            }
            Err(e) => Ok(Some(AssetEvent::SelectFailed {
                error: e.to_string(),
            })),
        }
    }

    async fn handle_edges_select(&mut self) -> anyhow::Result<Option<AssetEvent>> {
        debug!(cid = %self.info.cid, "handle edges select");

        let need = self.info.edge_need();
        let need_bandwidth = self.info.bandwidth - self.current_edge_bandwidth_mib();
        if need < 1 && need_bandwidth <= 0 {
            return Ok(Some(AssetEvent::SkipStep));
        }

        let sources = placement::get_download_sources(
            &self.ctx.nodes,
            &self.info.cid,
            &self.info.candidate_replica_succeeds,
        );
        if sources.is_empty() {
            return Ok(Some(AssetEvent::SelectFailed {
                error: "source node not found".to_string(),
            }));
        }

        let edges = self.ctx.nodes.snapshots(NodeType::Edge);
        let (nodes, diagnostic) = placement::choose_edge_nodes(
            &edges,
            need,
            need_bandwidth,
            &self.info.edge_replica_succeeds,
            self.info.size as f64,
        );
        if nodes.is_empty() {
            return Ok(Some(AssetEvent::SelectFailed {
                error: format!("node not found; {diagnostic}"),
            }));
        }

        match self.mint_and_save(&sources, &nodes, false).await {
            Ok(download_sources) => {
                self.info.edge_waitings += nodes.len() as i64;
                self.start_timeout();
                self.dispatch_pulls(nodes, Some(download_sources));
                Ok(Some(AssetEvent::PullRequestSent))
            }
            Err(e) => Ok(Some(AssetEvent::SelectFailed {
                error: e.to_string(),
            })),
        }
    }

    // ---- Pulling states ----

    fn handle_seed_pulling(&self) -> anyhow::Result<Option<AssetEvent>> {
        if self.info.candidate_replica_succeeds.len() >= SEED_REPLICA_COUNT {
            return Ok(Some(AssetEvent::PullSucceed));
        }
        if self.info.candidate_waitings == 0 {
            return Ok(Some(AssetEvent::PullFailed {
                error: "seed pull failed".to_string(),
            }));
        }
        Ok(None)
    }

    fn handle_seed_uploading(&self) -> anyhow::Result<Option<AssetEvent>> {
        if self.info.candidate_replica_succeeds.len() >= SEED_REPLICA_COUNT {
            return Ok(Some(AssetEvent::PullSucceed));
        }
        if self.info.candidate_waitings == 0 {
            return Ok(Some(AssetEvent::PullFailed {
                error: "user upload failed".to_string(),
            }));
        }
        Ok(None)
    }

    fn handle_candidates_pulling(&self) -> anyhow::Result<Option<AssetEvent>> {
        if self.info.candidate_replica_succeeds.len() as i64 >= self.info.candidate_replicas {
            return Ok(Some(AssetEvent::PullSucceed));
        }
        if self.info.candidate_waitings == 0 {
            return Ok(Some(AssetEvent::PullFailed {
                error: "candidate pulls failed".to_string(),
            }));
        }
        Ok(None)
    }

    fn handle_edges_pulling(&self) -> anyhow::Result<Option<AssetEvent>> {
        let need_bandwidth = self.info.bandwidth - self.current_edge_bandwidth_mib();
        if self.info.edge_replica_succeeds.len() as i64 >= self.info.edge_replicas
            && need_bandwidth <= 0
        {
            return Ok(Some(AssetEvent::PullSucceed));
        }
        if self.info.edge_waitings == 0 {
            return Ok(Some(AssetEvent::PullFailed {
                error: "edge pulls failed".to_string(),
            }));
        }
        Ok(None)
    }

    // ---- Terminal and retry states ----

    async fn handle_servicing(&mut self) -> anyhow::Result<Option<AssetEvent>> {
        info!(cid = %self.info.cid,
            candidates = self.info.candidate_replica_succeeds.len(),
            edges = self.info.edge_replica_succeeds.len(),
            "asset servicing");
        self.stop_timeout();

        if self.info.replenish_replicas > 0 {
            self.info.replenish_replicas = 0;
            self.save_state().await?;
        }

        // Remove rows for pulls that never finished.
        self.ctx
            .persistence
            .delete_unfinished_replicas(&self.info.hash)
            .await
            .map_err(|e| anyhow!("delete unfinished replicas {}: {e}", self.info.hash))?;
        Ok(None)
    }

    async fn handle_pulls_failed(&mut self) -> anyhow::Result<Option<AssetEvent>> {
        self.stop_timeout();

        if self.info.retry_count >= self.ctx.config.max_retry_count {
            info!(cid = %self.info.cid, retry_count = self.info.retry_count,
                "asset pull retries exhausted, operator action required");
            return Ok(None);
        }

        debug!(cid = %self.info.cid, retry_count = self.info.retry_count,
            "asset pulls failed, cooling down before retry");

        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.ctx.config.min_retry_time()) => {
                Ok(Some(AssetEvent::AssetRePull))
            }
            _ = cancel.changed() => Ok(None),
        }
    }

    fn handle_upload_failed(&mut self) -> anyhow::Result<Option<AssetEvent>> {
        info!(cid = %self.info.cid, "asset upload failed");
        self.stop_timeout();
        Ok(None)
    }

    async fn handle_remove(&mut self) -> anyhow::Result<Option<AssetEvent>> {
        info!(cid = %self.info.cid, "handle asset remove");
        self.stop_timeout();

        let result = self.remove_replicas().await;
        match result {
            Ok(()) => {
                if let Err(e) = self.ctx.persistence.delete_asset_state(&self.info.hash).await {
                    warn!(hash = %self.info.hash, error = %e, "failed to delete asset state");
                }
                if let Some(reply) = self.remove_reply.take() {
                    let _ = reply.send(Ok(()));
                }
                self.done = true;
            }
            Err(e) => {
                error!(cid = %self.info.cid, error = %e, "asset remove failed");
                if let Some(reply) = self.remove_reply.take() {
                    let _ = reply.send(Err(e));
                }
                // Stay in Remove; a later Remove event retries the rest.
            }
        }
        Ok(None)
    }

    /// Best-effort replica teardown: the first failing row short-circuits so
    /// the caller sees a descriptive error and can retry the remainder.
    async fn remove_replicas(&self) -> anyhow::Result<()> {
        let replicas = self
            .ctx
            .persistence
            .load_replicas_by_status(&self.info.hash, &[])
            .await
            .map_err(|e| anyhow!("remove asset {}: load replicas: {e}", self.info.cid))?;

        for replica in replicas {
            self.ctx
                .persistence
                .remove_replica(&self.info.cid, &self.info.hash, &replica.node_id)
                .await
                .map_err(|e| {
                    anyhow!(
                        "remove asset {}: replica on {}: {e}",
                        self.info.cid,
                        replica.node_id
                    )
                })?;
        }
        Ok(())
    }

    // ---- Helpers ----

    /// Aggregate upload bandwidth of the succeeded edge replicas, MiB/s.
    fn current_edge_bandwidth_mib(&self) -> i64 {
        let total: u64 = self
            .info
            .edge_replica_succeeds
            .iter()
            .filter_map(|id| self.ctx.nodes.get_edge_node(id))
            .map(|n| n.bandwidth_up())
            .sum();
        placement::bytes_to_mib_ceil(total)
    }

    async fn save_replicas(&self, nodes: &[NodeSnapshot], is_candidate: bool) -> anyhow::Result<()> {
        let rows: Vec<ReplicaInfo> = nodes
            .iter()
            .map(|n| ReplicaInfo {
                hash: self.info.hash.clone(),
                node_id: n.node_id.clone(),
                is_candidate,
                status: ReplicaStatus::Pulling,
            })
            .collect();
        self.ctx
            .persistence
            .save_replica_information(&rows)
            .await
            .map_err(|e| anyhow!("save replica rows {}: {e}", self.info.hash))
    }

    /// Mint tokens for the planned pulls and persist payloads and replica
    /// rows. Payloads land in storage before the caller dispatches anything.
    async fn mint_and_save(
        &self,
        sources: &[DownloadSource],
        nodes: &[NodeSnapshot],
        is_candidate: bool,
    ) -> anyhow::Result<HashMap<String, Vec<SourceDownloadInfo>>> {
        let (download_sources, payloads) =
            self.ctx.mint.generate_token(&self.info.cid, sources, nodes);

        self.ctx
            .persistence
            .save_token_payloads(&payloads)
            .await
            .map_err(|e| anyhow!("save token payloads {}: {e}", self.info.cid))?;
        self.save_replicas(nodes, is_candidate).await?;

        Ok(download_sources)
    }

    /// Fire-and-forget concurrent pull dispatch. Errors are logged; the
    /// step's outcome is decided by reports and the timeout, not by these
    /// calls.
    fn dispatch_pulls(
        &self,
        nodes: Vec<NodeSnapshot>,
        sources: Option<HashMap<String, Vec<SourceDownloadInfo>>>,
    ) {
        let cid = self.info.cid.clone();
        let pull_timeout = self.ctx.config.pull_timeout();

        for snapshot in nodes {
            let node = match self.ctx.nodes.get_node(&snapshot.node_id) {
                Some(node) => node,
                None => {
                    warn!(node_id = %snapshot.node_id, "chosen node vanished before dispatch");
                    continue;
                }
            };
            let node_sources = sources
                .as_ref()
                .map(|m| m.get(&node.node_id).cloned().unwrap_or_default());
            let cid = cid.clone();
            self.ctx.metrics.pull_dispatch_total.inc();

            tokio::spawn(async move {
                match tokio::time::timeout(pull_timeout, node.api.pull_asset(&cid, node_sources))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(node_id = %node.node_id, cid = %cid, error = %e,
                            "pull asset dispatch failed");
                    }
                    Err(_) => {
                        warn!(node_id = %node.node_id, cid = %cid, "pull asset dispatch timed out");
                    }
                }
            });
        }
    }

    fn start_timeout(&mut self) {
        self.deadline = Some(Instant::now() + self.ctx.config.pull_timeout());
    }

    fn stop_timeout(&mut self) {
        self.deadline = None;
    }

    async fn save_state(&self) -> anyhow::Result<()> {
        self.ctx
            .persistence
            .save_asset_state(&self.info)
            .await
            .map_err(|e| anyhow!("save asset state {}: {e}", self.info.hash))
    }
}
