use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::rpc::proto::{
    CacheClearRequest, CacheGetRequest, CachePutRequest, CacheRemoveRequest,
    JoinToClusterRequest, MapClearRequest, MapGetRequest, MapPutIfAbsentRequest, MapPutRequest,
    MapRemoveRequest, demory_client::DemoryClient as GeneratedClient, join_to_cluster_response,
};

#[derive(Debug)]
pub enum RpcError {
    Transport(tonic::transport::Error),
    Status(tonic::Status),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::Status(status) => write!(
                f,
                "rpc failed: {:?}: {}",
                status.code(),
                status.message()
            ),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<tonic::transport::Error> for RpcError {
    fn from(value: tonic::transport::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<tonic::Status> for RpcError {
    fn from(value: tonic::Status) -> Self {
        Self::Status(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    NotLeader,
}

#[derive(Debug, Clone)]
pub struct DemoryClient {
    inner: GeneratedClient<Channel>,
}

/// Connects to `target` (`host:port`), failing if the TCP/HTTP2 handshake takes longer than
/// `connect_timeout`.
pub async fn connect(target: &str, connect_timeout: Duration) -> Result<DemoryClient, RpcError> {
    let channel = Endpoint::from_shared(format!("http://{target}"))?
        .connect_timeout(connect_timeout)
        .connect()
        .await?;
    Ok(DemoryClient {
        inner: GeneratedClient::new(channel),
    })
}

impl DemoryClient {
    pub async fn map_put(&mut self, name: &str, key: &str, value: Vec<u8>) -> Result<(), RpcError> {
        self.inner
            .map_put(MapPutRequest {
                name: name.to_string(),
                key: key.to_string(),
                value,
            })
            .await?;
        Ok(())
    }

    pub async fn map_get(&mut self, name: &str, key: &str) -> Result<Option<Vec<u8>>, RpcError> {
        let resp = self
            .inner
            .map_get(MapGetRequest {
                name: name.to_string(),
                key: key.to_string(),
            })
            .await?
            .into_inner();
        Ok(resp.found.then_some(resp.value))
    }

    pub async fn map_put_if_absent(
        &mut self,
        name: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), RpcError> {
        self.inner
            .map_put_if_absent(MapPutIfAbsentRequest {
                name: name.to_string(),
                key: key.to_string(),
                value,
            })
            .await?;
        Ok(())
    }

    pub async fn map_remove(&mut self, name: &str, key: &str) -> Result<(), RpcError> {
        self.inner
            .map_remove(MapRemoveRequest {
                name: name.to_string(),
                key: key.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn map_clear(&mut self, name: &str) -> Result<(), RpcError> {
        self.inner
            .map_clear(MapClearRequest {
                name: name.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn cache_put(
        &mut self,
        name: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), RpcError> {
        self.inner
            .cache_put(CachePutRequest {
                name: name.to_string(),
                key: key.to_string(),
                value,
            })
            .await?;
        Ok(())
    }

    pub async fn cache_get(&mut self, name: &str, key: &str) -> Result<Option<Vec<u8>>, RpcError> {
        let resp = self
            .inner
            .cache_get(CacheGetRequest {
                name: name.to_string(),
                key: key.to_string(),
            })
            .await?
            .into_inner();
        Ok(resp.found.then_some(resp.value))
    }

    pub async fn cache_remove(&mut self, name: &str, key: &str) -> Result<(), RpcError> {
        self.inner
            .cache_remove(CacheRemoveRequest {
                name: name.to_string(),
                key: key.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn cache_clear(&mut self, name: &str) -> Result<(), RpcError> {
        self.inner
            .cache_clear(CacheClearRequest {
                name: name.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn join_to_cluster(
        &mut self,
        server_id: &str,
        server_address: &str,
        previous_index: u64,
    ) -> Result<JoinOutcome, RpcError> {
        let resp = self
            .inner
            .join_to_cluster(JoinToClusterRequest {
                server_id: server_id.to_string(),
                server_address: server_address.to_string(),
                previous_index,
            })
            .await?
            .into_inner();
        Ok(match resp.result() {
            join_to_cluster_response::Result::Success => JoinOutcome::Joined,
            join_to_cluster_response::Result::NotALeader => JoinOutcome::NotLeader,
        })
    }
}
