//! Token mint.
//!
//! For each planned replication the mint issues one capability token per
//! (source, destination) pair and returns both the per-destination source
//! lists handed out with the pull requests and the payload records that must
//! be persisted before any dispatch happens. A token authorizes exactly one
//! (source, destination, asset) triple; workload reports are later matched
//! against the persisted payloads by token id.

use common::{now_secs, DownloadSource, NodeId, SourceDownloadInfo, TokenPayload};
use rand::RngCore;
use std::collections::HashMap;
use std::time::Duration;

use crate::node::NodeSnapshot;

pub struct TokenMint {
    expiration: Duration,
}

impl TokenMint {
    pub fn new(expiration: Duration) -> Self {
        Self { expiration }
    }

    /// Mint tokens authorizing every destination to pull from every source.
    ///
    /// Returns the ordered source list per destination and the payloads to
    /// persist. The caller must persist the payloads before dispatching any
    /// pull, otherwise a node could report workload against a token the
    /// scheduler cannot recognize.
    pub fn generate_token(
        &self,
        cid: &str,
        sources: &[DownloadSource],
        destinations: &[NodeSnapshot],
    ) -> (HashMap<NodeId, Vec<SourceDownloadInfo>>, Vec<TokenPayload>) {
        let now = now_secs();
        let expiration = now + self.expiration.as_secs();

        let mut download_sources = HashMap::with_capacity(destinations.len());
        let mut payloads = Vec::with_capacity(destinations.len() * sources.len());

        for dest in destinations {
            let mut dest_sources = Vec::with_capacity(sources.len());
            for source in sources {
                let token_id = new_token_id();
                payloads.push(TokenPayload {
                    id: token_id.clone(),
                    asset_cid: cid.to_string(),
                    node_id: source.node_id.clone(),
                    client_id: dest.node_id.clone(),
                    created_time: now,
                    expiration,
                    limit_rate: 0,
                });
                dest_sources.push(SourceDownloadInfo {
                    node_id: source.node_id.clone(),
                    address: source.address.clone(),
                    tx: token_id,
                });
            }
            download_sources.insert(dest.node_id.clone(), dest_sources);
        }

        (download_sources, payloads)
    }
}

/// 32 hex character random token identifier.
fn new_token_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::NodeType;
    use std::collections::HashSet;

    fn source(node_id: &str) -> DownloadSource {
        DownloadSource {
            node_id: node_id.to_string(),
            address: format!("{node_id}.example:4321"),
        }
    }

    fn dest(node_id: &str) -> NodeSnapshot {
        NodeSnapshot {
            node_id: node_id.to_string(),
            node_type: NodeType::Edge,
            bandwidth_up: 5 << 20,
            available_disk_space: 1e12,
            external_ip: "198.51.100.9".to_string(),
            tcp_port: 4321,
        }
    }

    #[test]
    fn test_one_token_per_source_destination_pair() {
        let mint = TokenMint::new(Duration::from_secs(3600));
        let sources = [source("c1"), source("c2")];
        let dests = [dest("e1"), dest("e2"), dest("e3")];

        let (download_sources, payloads) = mint.generate_token("cid1", &sources, &dests);

        assert_eq!(payloads.len(), 6);
        assert_eq!(download_sources.len(), 3);
        for d in &dests {
            let list = &download_sources[&d.node_id];
            assert_eq!(list.len(), 2);
            assert_eq!(list[0].node_id, "c1");
            assert_eq!(list[1].node_id, "c2");
        }

        // Every token id is unique and every handed-out token has a payload.
        let payload_ids: HashSet<&str> = payloads.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(payload_ids.len(), 6);
        for list in download_sources.values() {
            for s in list {
                assert!(payload_ids.contains(s.tx.as_str()));
            }
        }
    }

    #[test]
    fn test_payload_binds_triple() {
        let mint = TokenMint::new(Duration::from_secs(3600));
        let (download_sources, payloads) =
            mint.generate_token("cid1", &[source("c1")], &[dest("e1")]);

        let payload = &payloads[0];
        assert_eq!(payload.asset_cid, "cid1");
        assert_eq!(payload.node_id, "c1");
        assert_eq!(payload.client_id, "e1");
        assert!(payload.expiration > payload.created_time);
        assert_eq!(download_sources["e1"][0].tx, payload.id);
    }

    #[test]
    fn test_no_sources_mints_nothing() {
        let mint = TokenMint::new(Duration::from_secs(3600));
        let (download_sources, payloads) = mint.generate_token("cid1", &[], &[dest("e1")]);

        assert!(payloads.is_empty());
        assert_eq!(download_sources["e1"].len(), 0);
    }
}
