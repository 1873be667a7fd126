//! Consensus wiring: openraft type config, durable storage, HTTP transport, and the
//! [`ConsensusEngine`] boundary the rest of the crate talks to.

pub mod app;
pub mod http_rpc;
pub mod network_http;
pub mod runtime;
pub mod storage;
pub mod types;

pub use app::{
    ClusterConfiguration, ClusterMember, ConsensusEngine, ConsensusError, RaftRole, RealRaft,
};
pub use types::{NodeId, NodeMeta, TypeConfig, raft_node_id};
