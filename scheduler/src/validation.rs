//! Validator election cycle.
//!
//! A periodic background loop elects a ratio of the currently connected
//! candidate nodes as validators and assigns the remainder as validatables.
//! Two wake sources drive it: the cycle ticker (one day by default) and a
//! manual trigger with at-most-one pending wake. The first election after a
//! cold start runs early when no validators are persisted yet.
//!
//! Election output is published to the node registry and persisted, so the
//! roles survive a scheduler restart.

use anyhow::anyhow;
use common::{now_nanos, now_secs, NodeId, ValidationResult};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info};

use crate::config::ElectionConfig;
use crate::metrics::Metrics;
use crate::node::NodeManager;
use crate::persist::Persistence;

/// Delay before the first election on a fleet with no persisted validators.
const FIRST_ELECTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct ValidationManager {
    nodes: Arc<NodeManager>,
    persistence: Arc<dyn Persistence>,
    config: ElectionConfig,
    metrics: Metrics,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    /// Unix timestamp of the next scheduled election
    next_election_time: RwLock<u64>,
}

impl ValidationManager {
    pub fn new(
        nodes: Arc<NodeManager>,
        persistence: Arc<dyn Persistence>,
        config: ElectionConfig,
        metrics: Metrics,
    ) -> Self {
        // Capacity 1: concurrent manual triggers collapse to one pending wake.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            nodes,
            persistence,
            config,
            metrics,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            next_election_time: RwLock::new(0),
        }
    }

    /// Run the election loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let validators = match self.persistence.load_validators().await {
            Ok(validators) => validators,
            Err(e) => {
                error!(error = %e, "election ticker: failed to load validators");
                return;
            }
        };
        let mut trigger_rx = match self.trigger_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("election ticker already running");
                return;
            }
        };

        let mut expiration = self.config.election_cycle();
        if validators.is_empty() {
            expiration = FIRST_ELECTION_INTERVAL;
        }
        self.set_next_election_time(expiration);

        info!(
            first_election_secs = expiration.as_secs(),
            validator_ratio = self.config.validator_ratio,
            "election ticker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(expiration) => {}
                wake = trigger_rx.recv() => {
                    if wake.is_none() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }

            expiration = self.config.election_cycle();
            self.set_next_election_time(expiration);
            if let Err(e) = self.elect().await {
                error!(error = %e, "election failed");
            }
        }
    }

    /// Run one election and publish the outcome.
    pub async fn elect(&self) -> anyhow::Result<()> {
        debug!("start elect");
        let candidates = self.nodes.all_valid_candidates();
        let (validators, validatables) =
            split_validators(candidates, self.config.validator_ratio, now_nanos());

        info!(
            validators = validators.len(),
            validatables = validatables.len(),
            "election complete"
        );
        self.metrics.elections_total.inc();
        self.publish(validators, validatables).await
    }

    /// Install a caller-provided validator set verbatim; the complementary
    /// candidates become validatables.
    pub async fn compulsory_election(&self, validators: Vec<NodeId>) -> anyhow::Result<()> {
        let validatables: Vec<NodeId> = self
            .nodes
            .all_valid_candidates()
            .into_iter()
            .filter(|id| !validators.contains(id))
            .collect();

        info!(validators = validators.len(), "compulsory election");
        self.publish(validators, validatables).await
    }

    /// Request an early election. Never blocks; when a wake is already
    /// pending the request is dropped because the in-flight election will
    /// observe the latest fleet state anyway.
    pub fn start_election(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Record a validation result submitted by a validator node.
    pub async fn push_result(&self, result: ValidationResult) -> anyhow::Result<()> {
        self.persistence
            .save_validation_result(&result)
            .await
            .map_err(|e| anyhow!("save validation result: {e}"))
    }

    pub fn next_election_time(&self) -> u64 {
        *self.next_election_time.read()
    }

    async fn publish(&self, validators: Vec<NodeId>, validatables: Vec<NodeId>) -> anyhow::Result<()> {
        self.nodes
            .reset_validator_group(validators.clone(), validatables);
        self.nodes
            .update_validators(&validators)
            .await
            .map_err(|e| anyhow!("persist validators: {e}"))
    }

    fn set_next_election_time(&self, after: Duration) {
        *self.next_election_time.write() = now_secs() + after.as_secs();
    }
}

/// Split the candidate list into validators and validatables.
///
/// Elects `ceil(ratio * len)` validators from a uniform shuffle of the list,
/// clamped to the list size. A non-positive quota elects nobody and assigns
/// every candidate as validatable.
pub fn split_validators(
    mut candidates: Vec<NodeId>,
    ratio: f64,
    seed: u64,
) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut need = (candidates.len() as f64 * ratio).ceil() as i64;
    if need <= 0 {
        return (Vec::new(), candidates);
    }
    if need > candidates.len() as i64 {
        need = candidates.len() as i64;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    candidates.shuffle(&mut rng);

    let validatables = candidates.split_off(need as usize);
    (candidates, validatables)
}
