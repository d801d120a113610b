//! Common types and protocol definitions for the Strand fleet scheduler.
//!
//! This crate provides the data model shared between the scheduler and the
//! nodes it orchestrates:
//! - **Node types**: Edge and candidate node descriptors and liveness info
//! - **Replica rows**: Per-(asset, node) replication bookkeeping records
//! - **Capability tokens**: Pull authorization payloads minted per replication
//! - **Workload reports**: The signed-and-encrypted report envelope and the
//!   decrypted workload records matched against token payloads
//! - **RSA capability**: SHA-256 + PKCS#1 v1.5 signing and chunked encryption
//!   used on the report authentication path (see [`crypto`])
//!
//! # Report Envelope
//!
//! Node workload reports travel as a compact bincode envelope of
//! `{cipher_text, sign}`. The ciphertext is encrypted under the scheduler's
//! public key; the signature is produced by the reporting node over the
//! ciphertext. Both sides must agree on the encoding, so the envelope codec
//! lives here rather than in the scheduler.

pub mod crypto;

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Types
// ============================================================================

/// Stable node identifier assigned at registration (opaque to the scheduler).
pub type NodeId = String;

/// Content-address digest identifying an asset.
pub type AssetHash = String;

/// Role of a node in the fleet. Immutable for the node's connected lifetime.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Lower-tier node that caches assets and serves end users
    Edge,
    /// Higher-tier node that caches assets and may act as a validator
    Candidate,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Edge => "edge",
            NodeType::Candidate => "candidate",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability facts a node advertises about itself.
///
/// Reported by the node via `get_node_info` at connect time and reconciled
/// against the persisted record by the registry.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct NodeInfo {
    /// Node identifier the node advertises for itself. Must match the
    /// transport-authenticated identity or the connection is rejected.
    pub node_id: NodeId,
    /// Role reported by the node
    #[serde(default)]
    pub node_type: Option<NodeType>,
    /// External IP, filled in by the scheduler from the connection remote host
    #[serde(default)]
    pub external_ip: String,
    /// Upload bandwidth in bytes per second
    #[serde(default)]
    pub bandwidth_up: u64,
    /// Download bandwidth in bytes per second
    #[serde(default)]
    pub bandwidth_down: u64,
    /// Free disk space in bytes, used as a placement filter
    #[serde(default)]
    pub available_disk_space: f64,
    /// NAT port mapping carried over from the previous session
    #[serde(default)]
    pub port_mapping: String,
    /// Accumulated online time in seconds across sessions
    #[serde(default)]
    pub online_duration: i64,
}

/// Options a node presents when connecting to the scheduler.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Session token the node wants associated with this connection
    pub token: String,
    /// Port of the node's TCP file server, used to build download addresses
    pub tcp_server_port: u16,
}

// ============================================================================
// Replica Rows
// ============================================================================

/// Status of a single replica of an asset on a node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaStatus {
    /// Pull dispatched, completion report not yet received
    Pulling,
    Succeeded,
    Failed,
}

/// Persisted bookkeeping row for one (asset, node) replica.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReplicaInfo {
    pub hash: AssetHash,
    pub node_id: NodeId,
    /// True when the replica lives on a candidate node
    pub is_candidate: bool,
    pub status: ReplicaStatus,
}

// ============================================================================
// Capability Tokens
// ============================================================================

/// Persisted authorization record for one (source, destination, asset) pull.
///
/// Minted by the scheduler before pull dispatch; workload reports are later
/// matched against these records by token id. Immutable once minted.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TokenPayload {
    /// Unique token identifier (32 hex characters)
    pub id: String,
    /// Human-visible content identifier of the asset
    pub asset_cid: String,
    /// Node the destination is authorized to pull from
    pub node_id: NodeId,
    /// Destination node the token was issued to
    pub client_id: NodeId,
    /// Unix timestamp the token was minted
    pub created_time: u64,
    /// Unix timestamp after which the token is no longer honored
    pub expiration: u64,
    /// Download rate cap in bytes per second, 0 for unlimited
    #[serde(default)]
    pub limit_rate: i64,
}

/// A current holder of an asset that a new destination may pull from.
///
/// Produced by the placement engine; the token mint attaches per-destination
/// tokens to turn these into [`SourceDownloadInfo`].
#[derive(Clone, Debug)]
pub struct DownloadSource {
    pub node_id: NodeId,
    /// "host:port" of the holder's TCP file server
    pub address: String,
}

/// Source descriptor handed to a destination node: where to pull from and the
/// capability token authorizing the pull.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SourceDownloadInfo {
    pub node_id: NodeId,
    pub address: String,
    /// Token id the destination presents to the source
    pub tx: String,
}

// ============================================================================
// Workload Reports
// ============================================================================

/// Signed report envelope submitted by nodes.
///
/// `cipher_text` is the workload plaintext encrypted under the scheduler's
/// public key; `sign` is the node's signature over `cipher_text`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NodeWorkloadReport {
    pub cipher_text: Vec<u8>,
    pub sign: Vec<u8>,
}

impl NodeWorkloadReport {
    /// Encodes the envelope with the wire codec.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decodes an envelope from wire bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// One decrypted workload entry, referencing the token it was served under.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Workload {
    pub token_id: String,
    /// Bytes served for this token
    pub download_size: i64,
    /// Unix timestamp the transfer started
    pub start_time: u64,
    /// Unix timestamp the transfer ended
    pub end_time: u64,
}

/// Settlement status of a workload record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadStatus {
    /// Token minted, no report received yet
    Created,
    Succeeded,
    Failed,
}

/// Persisted record pairing a token payload with the reports filed against it.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkloadRecord {
    pub payload: TokenPayload,
    pub status: WorkloadStatus,
    /// Workload reported by the serving node
    pub node_workload: Option<Workload>,
    /// Workload reported by the downloading client
    pub client_workload: Option<Workload>,
}

impl WorkloadRecord {
    /// Fresh record for a newly minted token.
    pub fn new(payload: TokenPayload) -> Self {
        Self {
            payload,
            status: WorkloadStatus::Created,
            node_workload: None,
            client_workload: None,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Result of one fleet-honesty check, submitted by a validator node.
///
/// The scheduler fills `validator` from the transport-authenticated identity
/// of the submitter; the rest is decoded from the submitted body.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ValidationResult {
    /// Validator that performed the check (set by the scheduler)
    pub validator: NodeId,
    /// Node that was validated
    pub node_id: NodeId,
    /// Asset the check was run against
    pub cid: String,
    /// Measured bandwidth in bytes per second
    pub bandwidth: i64,
    /// Wall time the check took, in milliseconds
    pub cost_time_ms: i64,
    /// Unix timestamp the check completed
    pub validated_at: u64,
}

impl ValidationResult {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Election observability snapshot served to operators.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ValidationInfo {
    /// Unix timestamp of the next scheduled election
    pub next_election_time: u64,
}

// ============================================================================
// Object Store Pass-Through
// ============================================================================

/// Object-store credentials handed to candidate nodes on demand.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MinioConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
}

// ============================================================================
// Shared Utility Functions
// ============================================================================

/// Safe timestamp helper - returns current Unix timestamp in seconds.
/// Returns 0 on clock skew or system time errors (safe for timestamp
/// comparisons).
#[inline]
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix timestamp in nanoseconds, used to seed per-invocation RNGs.
#[inline]
pub fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_envelope_round_trip() {
        let report = NodeWorkloadReport {
            cipher_text: vec![1, 2, 3, 4, 5],
            sign: vec![9, 8, 7],
        };

        let bytes = report.to_bytes().unwrap();
        let decoded = NodeWorkloadReport::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.cipher_text, report.cipher_text);
        assert_eq!(decoded.sign, report.sign);
    }

    #[test]
    fn test_report_envelope_rejects_garbage() {
        assert!(NodeWorkloadReport::from_bytes(&[0xff; 3]).is_err());
    }

    #[test]
    fn test_validation_result_round_trip() {
        let result = ValidationResult {
            validator: "v1".to_string(),
            node_id: "e1".to_string(),
            cid: "Qm123".to_string(),
            bandwidth: 1024,
            cost_time_ms: 87,
            validated_at: 1_700_000_000,
        };

        let bytes = result.to_bytes().unwrap();
        let decoded = ValidationResult::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.node_id, "e1");
        assert_eq!(decoded.bandwidth, 1024);
    }

    #[test]
    fn test_node_type_display() {
        assert_eq!(NodeType::Edge.to_string(), "edge");
        assert_eq!(NodeType::Candidate.to_string(), "candidate");
    }
}
