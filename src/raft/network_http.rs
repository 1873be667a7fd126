//! Client side of the raft transport.

use anyhow::Context;
use openraft::{
    RaftNetwork, RaftNetworkFactory,
    error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable},
    network::RPCOption,
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, VoteRequest, VoteResponse,
    },
};
use serde::{Serialize, de::DeserializeOwned};

use crate::raft::types::{NodeId, NodeMeta, TypeConfig};

type RpcResult<T, E = RaftError<NodeId>> = Result<T, RPCError<NodeId, NodeMeta, E>>;

#[derive(Clone)]
pub struct HttpNetworkFactory {
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("build raft http client")?;
        Ok(Self { client })
    }
}

/// Connection to one peer, addressed by the `host:port` in its [`NodeMeta`].
#[derive(Clone)]
pub struct HttpNetwork {
    target: NodeId,
    base: String,
    client: reqwest::Client,
}

impl HttpNetwork {
    /// Connection failures are `Unreachable` so openraft backs off; anything after the request
    /// was sent is a `Network` error.
    async fn post_json<Req, Resp, E>(
        &self,
        path: &str,
        req: &Req,
        option: RPCOption,
    ) -> RpcResult<Resp, RaftError<NodeId, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: DeserializeOwned + std::error::Error,
    {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .timeout(option.hard_ttl())
            .json(req)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(target_node = self.target, error = %e, "raft peer unreachable");
                RPCError::Unreachable(Unreachable::new(&e))
            })?;

        let result: Result<Resp, RaftError<NodeId, E>> = resp
            .error_for_status()
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(openraft::error::RemoteError::new(self.target, e)))
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: NodeId, node: &NodeMeta) -> Self::Network {
        HttpNetwork {
            target,
            base: format!("http://{}", node.address),
            client: self.client.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<NodeId>> {
        self.post_json("/raft/append", &rpc, option).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>> {
        self.post_json("/raft/snapshot", &rpc, option).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> RpcResult<VoteResponse<NodeId>> {
        self.post_json("/raft/vote", &rpc, option).await
    }
}
