pub mod codec;
pub mod command;
pub mod config;
pub mod discovery;
pub mod node;
pub mod raft;
pub mod rpc;
pub mod store;
pub mod version;
