//! Asset replication states, events, and the durable per-asset record.
//!
//! One state machine runs per asset hash. The machine's durable state is
//! [`AssetPullingInfo`]; handlers are pure re-derivations from it, so a
//! restart resumes from the persisted row without losing progress.
//!
//! The transition table lives in [`plan`]. Events that only mutate counters
//! (pull reports, timeout drains) do not transition and are applied by the
//! machine before the current state's handler runs again.

use common::{AssetHash, NodeId};
use serde::{Deserialize, Serialize};

/// Candidate copies required before fan-out may begin.
pub const SEED_REPLICA_COUNT: usize = 1;

/// States of the asset replication machine.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetState {
    /// Choosing the first candidate to seed from origin
    SeedSelect,
    /// Waiting for the seed pull to complete
    SeedPulling,
    /// Binding the named seed node for an upload-origin asset
    UploadInit,
    /// Waiting for the client upload to land on the seed node
    SeedUploading,
    /// Choosing candidate nodes to fan out to
    CandidatesSelect,
    /// Waiting for candidate pulls to complete
    CandidatesPulling,
    /// Choosing edge nodes to fan out to
    EdgesSelect,
    /// Waiting for edge pulls to complete
    EdgesPulling,
    /// Replication targets met, asset in service
    Servicing,
    /// Pulls failed; retrying after cool-down or parked when retries are spent
    PullsFailed,
    /// Upload-origin seeding failed, terminal
    UploadFailed,
    /// Asset removal in progress
    Remove,
}

impl AssetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetState::SeedSelect => "seed_select",
            AssetState::SeedPulling => "seed_pulling",
            AssetState::UploadInit => "upload_init",
            AssetState::SeedUploading => "seed_uploading",
            AssetState::CandidatesSelect => "candidates_select",
            AssetState::CandidatesPulling => "candidates_pulling",
            AssetState::EdgesSelect => "edges_select",
            AssetState::EdgesPulling => "edges_pulling",
            AssetState::Servicing => "servicing",
            AssetState::PullsFailed => "pulls_failed",
            AssetState::UploadFailed => "upload_failed",
            AssetState::Remove => "remove",
        }
    }
}

impl std::fmt::Display for AssetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events driving the asset machine.
///
/// The first group is emitted by state handlers themselves; the second group
/// arrives from outside through the machine's mailbox.
#[derive(Debug)]
pub enum AssetEvent {
    // Handler-emitted
    PullRequestSent,
    SelectFailed { error: String },
    SkipStep,
    PullSucceed,
    PullFailed { error: String },
    AssetRePull,

    // External
    /// A node reported the outcome of a dispatched pull
    PullResult {
        node_id: NodeId,
        is_candidate: bool,
        succeeded: bool,
    },
    /// The per-asset timer expired, draining outstanding waitings
    PullTimeout,
    /// An edge holding a replica went offline while the asset was in service
    EdgeOffline { node_id: NodeId },
    /// Remove the asset and its replicas
    Remove {
        reply: Option<tokio::sync::oneshot::Sender<anyhow::Result<()>>>,
    },
}

/// Durable state of one asset replication machine.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AssetPullingInfo {
    pub state: AssetState,
    /// Content-address digest, the machine's identity
    pub hash: AssetHash,
    /// Human-visible content identifier
    pub cid: String,
    /// Asset size in bytes
    pub size: i64,
    /// Target aggregate edge upload bandwidth in MiB/s
    pub bandwidth: i64,
    pub candidate_replicas: i64,
    pub edge_replicas: i64,
    /// Named seed node for upload-origin assets
    pub seed_node_id: Option<NodeId>,
    pub candidate_replica_succeeds: Vec<NodeId>,
    pub edge_replica_succeeds: Vec<NodeId>,
    /// Outstanding candidate pull attempts
    pub candidate_waitings: i64,
    /// Outstanding edge pull attempts
    pub edge_waitings: i64,
    /// Extra edge replicas to re-place after holders went offline
    pub replenish_replicas: i64,
    pub retry_count: i64,
}

impl AssetPullingInfo {
    /// Candidate replicas still needed to reach the target.
    pub fn candidate_need(&self) -> i64 {
        self.candidate_replicas - self.candidate_replica_succeeds.len() as i64
    }

    /// Edge replicas still needed, with replenish overriding the normal need.
    pub fn edge_need(&self) -> i64 {
        if self.replenish_replicas > 0 {
            self.replenish_replicas
        } else {
            self.edge_replicas - self.edge_replica_succeeds.len() as i64
        }
    }
}

/// Transition table: the state entered when `event` lands in `info.state`.
///
/// Returns `None` for events that do not transition (counter mutations,
/// stray events for the current state).
pub fn plan(info: &AssetPullingInfo, event: &AssetEvent) -> Option<AssetState> {
    use AssetEvent as E;
    use AssetState as S;

    match (info.state, event) {
        // Removal wins from any state.
        (_, E::Remove { .. }) => Some(S::Remove),

        (S::SeedSelect, E::PullRequestSent) => Some(S::SeedPulling),
        (S::SeedSelect, E::SkipStep) => Some(S::CandidatesSelect),
        (S::SeedSelect, E::SelectFailed { .. }) => Some(S::PullsFailed),

        (S::SeedPulling, E::PullSucceed) => Some(S::CandidatesSelect),
        (S::SeedPulling, E::PullFailed { .. }) => Some(S::PullsFailed),

        (S::UploadInit, E::PullRequestSent) => Some(S::SeedUploading),
        (S::UploadInit, E::SkipStep) => Some(S::CandidatesSelect),
        (S::UploadInit, E::SelectFailed { .. }) => Some(S::PullsFailed),

        (S::SeedUploading, E::PullSucceed) => Some(S::CandidatesSelect),
        (S::SeedUploading, E::PullFailed { .. }) => Some(S::UploadFailed),

        (S::CandidatesSelect, E::PullRequestSent) => Some(S::CandidatesPulling),
        (S::CandidatesSelect, E::SkipStep) => Some(S::EdgesSelect),
        (S::CandidatesSelect, E::SelectFailed { .. }) => Some(S::PullsFailed),

        (S::CandidatesPulling, E::PullSucceed) => Some(S::EdgesSelect),
        (S::CandidatesPulling, E::PullFailed { .. }) => Some(S::PullsFailed),

        (S::EdgesSelect, E::PullRequestSent) => Some(S::EdgesPulling),
        (S::EdgesSelect, E::SkipStep) => Some(S::Servicing),
        (S::EdgesSelect, E::SelectFailed { .. }) => Some(S::PullsFailed),

        (S::EdgesPulling, E::PullSucceed) => Some(S::Servicing),
        (S::EdgesPulling, E::PullFailed { .. }) => Some(S::PullsFailed),

        (S::Servicing, E::EdgeOffline { .. }) => Some(S::EdgesSelect),

        (S::PullsFailed, E::AssetRePull) => Some(repull_target(info)),

        _ => None,
    }
}

/// The earliest select state whose target is still unsatisfied, entered on
/// retry after a failure.
fn repull_target(info: &AssetPullingInfo) -> AssetState {
    if info.candidate_replica_succeeds.len() < SEED_REPLICA_COUNT {
        if info.seed_node_id.is_some() {
            AssetState::UploadInit
        } else {
            AssetState::SeedSelect
        }
    } else if info.candidate_need() > 0 {
        AssetState::CandidatesSelect
    } else {
        AssetState::EdgesSelect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info(state: AssetState) -> AssetPullingInfo {
        AssetPullingInfo {
            state,
            hash: "hash1".to_string(),
            cid: "cid1".to_string(),
            size: 1024,
            bandwidth: 10,
            candidate_replicas: 2,
            edge_replicas: 3,
            seed_node_id: None,
            candidate_replica_succeeds: Vec::new(),
            edge_replica_succeeds: Vec::new(),
            candidate_waitings: 0,
            edge_waitings: 0,
            replenish_replicas: 0,
            retry_count: 0,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut info = test_info(AssetState::SeedSelect);

        for (event, expected) in [
            (AssetEvent::PullRequestSent, AssetState::SeedPulling),
            (AssetEvent::PullSucceed, AssetState::CandidatesSelect),
            (AssetEvent::PullRequestSent, AssetState::CandidatesPulling),
            (AssetEvent::PullSucceed, AssetState::EdgesSelect),
            (AssetEvent::PullRequestSent, AssetState::EdgesPulling),
            (AssetEvent::PullSucceed, AssetState::Servicing),
        ] {
            let next = plan(&info, &event).expect("transition");
            assert_eq!(next, expected);
            info.state = next;
        }
    }

    #[test]
    fn test_skip_steps() {
        let info = test_info(AssetState::SeedSelect);
        assert_eq!(
            plan(&info, &AssetEvent::SkipStep),
            Some(AssetState::CandidatesSelect)
        );

        let info = test_info(AssetState::CandidatesSelect);
        assert_eq!(
            plan(&info, &AssetEvent::SkipStep),
            Some(AssetState::EdgesSelect)
        );

        let info = test_info(AssetState::EdgesSelect);
        assert_eq!(
            plan(&info, &AssetEvent::SkipStep),
            Some(AssetState::Servicing)
        );
    }

    #[test]
    fn test_upload_failure_is_terminal_branch() {
        let info = test_info(AssetState::SeedUploading);
        assert_eq!(
            plan(
                &info,
                &AssetEvent::PullFailed {
                    error: "upload failed".to_string()
                }
            ),
            Some(AssetState::UploadFailed)
        );
    }

    #[test]
    fn test_remove_wins_from_any_state() {
        for state in [
            AssetState::SeedSelect,
            AssetState::CandidatesPulling,
            AssetState::Servicing,
            AssetState::PullsFailed,
        ] {
            let info = test_info(state);
            assert_eq!(
                plan(&info, &AssetEvent::Remove { reply: None }),
                Some(AssetState::Remove)
            );
        }
    }

    #[test]
    fn test_repull_targets_earliest_unsatisfied_step() {
        // Nothing succeeded yet: back to seed selection.
        let info = test_info(AssetState::PullsFailed);
        assert_eq!(
            plan(&info, &AssetEvent::AssetRePull),
            Some(AssetState::SeedSelect)
        );

        // Upload-origin assets go back through the upload path.
        let mut info = test_info(AssetState::PullsFailed);
        info.seed_node_id = Some("c1".to_string());
        assert_eq!(
            plan(&info, &AssetEvent::AssetRePull),
            Some(AssetState::UploadInit)
        );

        // Seed done, candidates short: candidate selection.
        let mut info = test_info(AssetState::PullsFailed);
        info.candidate_replica_succeeds = vec!["c1".to_string()];
        assert_eq!(
            plan(&info, &AssetEvent::AssetRePull),
            Some(AssetState::CandidatesSelect)
        );

        // Candidates met: edge selection.
        let mut info = test_info(AssetState::PullsFailed);
        info.candidate_replica_succeeds = vec!["c1".to_string(), "c2".to_string()];
        assert_eq!(
            plan(&info, &AssetEvent::AssetRePull),
            Some(AssetState::EdgesSelect)
        );
    }

    #[test]
    fn test_counter_events_do_not_transition() {
        let info = test_info(AssetState::CandidatesPulling);
        assert_eq!(
            plan(
                &info,
                &AssetEvent::PullResult {
                    node_id: "c1".to_string(),
                    is_candidate: true,
                    succeeded: true
                }
            ),
            None
        );
        assert_eq!(plan(&info, &AssetEvent::PullTimeout), None);
    }

    #[test]
    fn test_edge_offline_reenters_edges_select_only_from_servicing() {
        let info = test_info(AssetState::Servicing);
        assert_eq!(
            plan(
                &info,
                &AssetEvent::EdgeOffline {
                    node_id: "e1".to_string()
                }
            ),
            Some(AssetState::EdgesSelect)
        );

        let info = test_info(AssetState::CandidatesPulling);
        assert_eq!(
            plan(
                &info,
                &AssetEvent::EdgeOffline {
                    node_id: "e1".to_string()
                }
            ),
            None
        );
    }

    #[test]
    fn test_edge_need_replenish_override() {
        let mut info = test_info(AssetState::EdgesSelect);
        info.edge_replica_succeeds = vec!["e1".to_string(), "e2".to_string(), "e3".to_string()];
        assert_eq!(info.edge_need(), 0);

        info.replenish_replicas = 2;
        assert_eq!(info.edge_need(), 2);
    }
}
