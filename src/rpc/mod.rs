//! Client-facing gRPC surface (`demory.Demory`).

pub mod client;
pub mod service;

pub mod proto {
    tonic::include_proto!("demory");
}

pub use client::{DemoryClient, RpcError, connect};
pub use service::{DemoryService, LEADER_METADATA_KEY};
