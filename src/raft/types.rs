use std::io::Cursor;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::command::{ApplyResult, RawCommand};

/// Raft node identifier type for this project.
pub type NodeId = u64;

/// Raft node metadata stored in the membership config.
///
/// Members are known by a human-assigned string id; openraft needs an integral id, derived with
/// [`raft_node_id`]. Keeping the string id here means membership always carries it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub server_id: String,

    /// `host:port` of the member's raft HTTP endpoint.
    pub address: String,
}

impl NodeMeta {
    pub fn new(server_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            address: address.into(),
        }
    }

    pub fn raft_id(&self) -> NodeId {
        raft_node_id(&self.server_id)
    }
}

/// First 8 bytes of SHA-256 over the string id, big-endian.
pub fn raft_node_id(server_id: &str) -> NodeId {
    let digest = Sha256::digest(server_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// OpenRaft type configuration for this project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = RawCommand;
    type R = ApplyResult;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    // Requires tokio `io-util` feature for AsyncRead/Write/Seek impls on Cursor.
    type SnapshotData = Cursor<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_node_id_is_stable_and_distinct() {
        assert_eq!(raft_node_id("node-1"), raft_node_id("node-1"));
        assert_ne!(raft_node_id("node-1"), raft_node_id("node-2"));
        assert_eq!(NodeMeta::new("node-1", "x").raft_id(), raft_node_id("node-1"));
    }

    #[test]
    fn raft_node_id_uses_big_endian_digest_prefix() {
        // sha256("a") = ca978112ca1bbdca...
        assert_eq!(raft_node_id("a"), 0xca97_8112_ca1b_bdca);
    }
}
