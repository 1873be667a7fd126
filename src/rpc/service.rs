use std::{sync::Arc, time::Duration};

use tonic::{Request, Response, Status, metadata::MetadataValue};

use crate::{
    command::{ApplyResult, Command},
    raft::{ClusterMember, ConsensusEngine, ConsensusError},
    rpc::proto::{
        CacheClearRequest, CacheGetRequest, CacheGetResponse, CachePutRequest, CacheRemoveRequest,
        Empty, JoinToClusterRequest, JoinToClusterResponse, MapClearRequest, MapGetRequest,
        MapGetResponse, MapPutIfAbsentRequest, MapPutRequest, MapRemoveRequest,
        demory_server::{Demory, DemoryServer},
        join_to_cluster_response,
    },
    store::Store,
};

/// Response metadata carrying the current leader's address on `FAILED_PRECONDITION`.
pub const LEADER_METADATA_KEY: &str = "x-demory-leader";

/// Writes go through consensus; reads are answered from the local store and may be stale.
pub struct DemoryService {
    engine: Arc<dyn ConsensusEngine>,
    store: Store,
    write_timeout: Duration,
    membership_timeout: Duration,
}

impl DemoryService {
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        store: Store,
        write_timeout: Duration,
        membership_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            store,
            write_timeout,
            membership_timeout,
        }
    }

    pub fn into_server(self) -> DemoryServer<Self> {
        DemoryServer::new(self)
    }

    async fn write(&self, cmd: Command) -> Result<Response<Empty>, Status> {
        let raw = cmd
            .encode()
            .map_err(|e| Status::internal(format!("encode command: {e}")))?;
        let result = self
            .engine
            .apply(raw, self.write_timeout)
            .await
            .map_err(|err| {
                tracing::debug!(namespace = cmd.namespace(), error = %err, "write rejected");
                consensus_status(err)
            })?;
        apply_status(result)?;
        Ok(Response::new(Empty {}))
    }

    async fn add_joining_voter(
        &self,
        req: &JoinToClusterRequest,
        prior_index: u64,
    ) -> Result<Response<JoinToClusterResponse>, Status> {
        let member = ClusterMember::voter(req.server_id.clone(), req.server_address.clone());
        match self
            .engine
            .add_voter(member, prior_index, self.membership_timeout)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    server_id = %req.server_id,
                    address = %req.server_address,
                    "added voter"
                );
                Ok(join_response(join_to_cluster_response::Result::Success))
            }
            Err(ConsensusError::NotLeader { .. }) => {
                Ok(join_response(join_to_cluster_response::Result::NotALeader))
            }
            Err(err) => {
                tracing::warn!(server_id = %req.server_id, error = %err, "join failed");
                Err(consensus_status(err))
            }
        }
    }
}

pub fn consensus_status(err: ConsensusError) -> Status {
    match err {
        ConsensusError::NotLeader { leader } => {
            let mut status = Status::failed_precondition(
                ConsensusError::NotLeader {
                    leader: leader.clone(),
                }
                .to_string(),
            );
            if let Some(value) = leader.and_then(|l| MetadataValue::try_from(l.as_str()).ok()) {
                status.metadata_mut().insert(LEADER_METADATA_KEY, value);
            }
            status
        }
        ConsensusError::ApplyTimeout => {
            Status::deadline_exceeded("write outcome unknown: timed out waiting for commit")
        }
        err @ ConsensusError::StaleConfiguration { .. } => Status::aborted(err.to_string()),
        err @ ConsensusError::Engine { .. } => Status::unavailable(err.to_string()),
    }
}

fn apply_status(result: ApplyResult) -> Result<(), Status> {
    match result.error {
        Some(err) => Err(Status::internal(err.to_string())),
        None => Ok(()),
    }
}

#[tonic::async_trait]
impl Demory for DemoryService {
    async fn map_put(&self, request: Request<MapPutRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.write(Command::MapPut {
            namespace: req.name,
            key: req.key,
            value: req.value,
        })
        .await
    }

    async fn map_get(
        &self,
        request: Request<MapGetRequest>,
    ) -> Result<Response<MapGetResponse>, Status> {
        let req = request.into_inner();
        let value = self.store.map_get(&req.name, &req.key).await;
        Ok(Response::new(MapGetResponse {
            found: value.is_some(),
            value: value.unwrap_or_default(),
        }))
    }

    async fn map_put_if_absent(
        &self,
        request: Request<MapPutIfAbsentRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.write(Command::MapPutIfAbsent {
            namespace: req.name,
            key: req.key,
            value: req.value,
        })
        .await
    }

    async fn map_remove(
        &self,
        request: Request<MapRemoveRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.write(Command::MapRemove {
            namespace: req.name,
            key: req.key,
        })
        .await
    }

    async fn map_clear(&self, request: Request<MapClearRequest>) -> Result<Response<Empty>, Status> {
        self.write(Command::MapClear {
            namespace: request.into_inner().name,
        })
        .await
    }

    async fn cache_put(&self, request: Request<CachePutRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.write(Command::CachePut {
            namespace: req.name,
            key: req.key,
            value: req.value,
        })
        .await
    }

    async fn cache_get(
        &self,
        request: Request<CacheGetRequest>,
    ) -> Result<Response<CacheGetResponse>, Status> {
        let req = request.into_inner();
        let value = self.store.cache_get(&req.name, &req.key).await;
        Ok(Response::new(CacheGetResponse {
            found: value.is_some(),
            value: value.unwrap_or_default(),
        }))
    }

    async fn cache_remove(
        &self,
        request: Request<CacheRemoveRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.write(Command::CacheRemove {
            namespace: req.name,
            key: req.key,
        })
        .await
    }

    async fn cache_clear(
        &self,
        request: Request<CacheClearRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.write(Command::CacheClear {
            namespace: request.into_inner().name,
        })
        .await
    }

    async fn join_to_cluster(
        &self,
        request: Request<JoinToClusterRequest>,
    ) -> Result<Response<JoinToClusterResponse>, Status> {
        let req = request.into_inner();
        if req.server_id.is_empty() || req.server_address.is_empty() {
            return Err(Status::invalid_argument(
                "server_id and server_address are required",
            ));
        }

        if !self.engine.is_leader() {
            return Ok(join_response(join_to_cluster_response::Result::NotALeader));
        }

        let config = self.engine.configuration();
        match config.find(&req.server_id) {
            Some(m) if m.voter && m.address == req.server_address => {
                return Ok(join_response(join_to_cluster_response::Result::Success));
            }
            Some(m) if m.address != req.server_address => {
                // Same id at a new address: drop the stale entry before re-adding.
                tracing::info!(
                    server_id = %req.server_id,
                    old_address = %m.address,
                    address = %req.server_address,
                    "member moved, replacing"
                );
                match self
                    .engine
                    .remove_server(req.server_id.clone(), req.previous_index, self.membership_timeout)
                    .await
                {
                    Ok(()) => {}
                    Err(ConsensusError::NotLeader { .. }) => {
                        return Ok(join_response(join_to_cluster_response::Result::NotALeader));
                    }
                    Err(err) => {
                        tracing::warn!(server_id = %req.server_id, error = %err, "join failed");
                        return Err(consensus_status(err));
                    }
                }
                return self.add_joining_voter(&req, 0).await;
            }
            _ => {}
        }

        self.add_joining_voter(&req, req.previous_index).await
    }
}

fn join_response(result: join_to_cluster_response::Result) -> Response<JoinToClusterResponse> {
    Response::new(JoinToClusterResponse {
        result: result as i32,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tonic::Code;

    use super::*;
    use crate::{
        command::DecodeError,
        raft::{
            ClusterConfiguration, RaftRole,
            app::{LocalEngine, MembershipCall},
        },
    };

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn service(role: RaftRole) -> (DemoryService, Arc<LocalEngine>, Store) {
        let store = Store::new(2);
        let engine = Arc::new(LocalEngine::new(store.clone(), role));
        let svc = DemoryService::new(engine.clone(), store.clone(), TIMEOUT, TIMEOUT);
        (svc, engine, store)
    }

    fn join(id: &str, address: &str, previous_index: u64) -> Request<JoinToClusterRequest> {
        Request::new(JoinToClusterRequest {
            server_id: id.to_string(),
            server_address: address.to_string(),
            previous_index,
        })
    }

    #[tokio::test]
    async fn writes_on_leader_are_visible_to_local_reads() {
        let (svc, _engine, _store) = service(RaftRole::Leader);
        svc.map_put(Request::new(MapPutRequest {
            name: "users".to_string(),
            key: "alice".to_string(),
            value: b"1".to_vec(),
        }))
        .await
        .unwrap();

        let found = svc
            .map_get(Request::new(MapGetRequest {
                name: "users".to_string(),
                key: "alice".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(found.found);
        assert_eq!(found.value, b"1".to_vec());

        let missing = svc
            .cache_get(Request::new(CacheGetRequest {
                name: "sessions".to_string(),
                key: "nope".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!missing.found);
        assert!(missing.value.is_empty());
    }

    #[tokio::test]
    async fn write_on_follower_is_failed_precondition_with_leader() {
        let (svc, engine, store) = service(RaftRole::Follower);
        engine.set_leader_address(Some("10.0.0.1:7001".to_string()));

        let status = svc
            .cache_put(Request::new(CachePutRequest {
                name: "c".to_string(),
                key: "k".to_string(),
                value: b"v".to_vec(),
            }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::FailedPrecondition);
        assert!(status.message().contains("10.0.0.1:7001"));
        assert_eq!(
            status
                .metadata()
                .get(LEADER_METADATA_KEY)
                .and_then(|v| v.to_str().ok()),
            Some("10.0.0.1:7001")
        );
        assert_eq!(store.cache_get("c", "k").await, None);
    }

    #[test]
    fn consensus_errors_map_to_grpc_codes() {
        assert_eq!(
            consensus_status(ConsensusError::ApplyTimeout).code(),
            Code::DeadlineExceeded
        );
        assert_eq!(
            consensus_status(ConsensusError::Engine {
                message: "shutting down".to_string()
            })
            .code(),
            Code::Unavailable
        );
        let no_leader = consensus_status(ConsensusError::NotLeader { leader: None });
        assert_eq!(no_leader.code(), Code::FailedPrecondition);
        assert!(no_leader.metadata().get(LEADER_METADATA_KEY).is_none());

        let decode = apply_status(ApplyResult::rejected(DecodeError {
            message: "bad".to_string(),
        }))
        .unwrap_err();
        assert_eq!(decode.code(), Code::Internal);
    }

    #[tokio::test]
    async fn join_on_follower_answers_not_a_leader() {
        let (svc, engine, _store) = service(RaftRole::Follower);
        let resp = svc.join_to_cluster(join("b", "b:7001", 0)).await.unwrap();

        assert_eq!(
            resp.into_inner().result(),
            join_to_cluster_response::Result::NotALeader
        );
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn join_on_leader_adds_voter_once() {
        let (svc, engine, _store) = service(RaftRole::Leader);
        engine.set_configuration(ClusterConfiguration {
            index: 1,
            servers: vec![ClusterMember::voter("a", "a:7001")],
        });

        let first = svc.join_to_cluster(join("b", "b:7001", 0)).await.unwrap();
        let again = svc.join_to_cluster(join("b", "b:7001", 2)).await.unwrap();

        assert_eq!(
            first.into_inner().result(),
            join_to_cluster_response::Result::Success
        );
        assert_eq!(
            again.into_inner().result(),
            join_to_cluster_response::Result::Success
        );
        assert_eq!(
            engine.calls(),
            vec![MembershipCall::AddVoter {
                id: "b".to_string(),
                address: "b:7001".to_string(),
                prior_index: 0,
            }]
        );
    }

    #[tokio::test]
    async fn join_with_stale_index_is_rejected() {
        let (svc, engine, _store) = service(RaftRole::Leader);
        engine.set_configuration(ClusterConfiguration {
            index: 4,
            servers: vec![ClusterMember::voter("a", "a:7001")],
        });

        let status = svc
            .join_to_cluster(join("b", "b:7001", 3))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Aborted);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn join_from_moved_member_replaces_its_address() {
        let (svc, engine, _store) = service(RaftRole::Leader);
        engine.set_configuration(ClusterConfiguration {
            index: 2,
            servers: vec![
                ClusterMember::voter("a", "a:7001"),
                ClusterMember::voter("b", "10.0.0.5:7001"),
            ],
        });

        let resp = svc
            .join_to_cluster(join("b", "10.0.0.9:7001", 2))
            .await
            .unwrap();

        assert_eq!(
            resp.into_inner().result(),
            join_to_cluster_response::Result::Success
        );
        assert_eq!(
            engine.calls(),
            vec![
                MembershipCall::RemoveServer {
                    id: "b".to_string(),
                    prior_index: 2,
                },
                MembershipCall::AddVoter {
                    id: "b".to_string(),
                    address: "10.0.0.9:7001".to_string(),
                    prior_index: 0,
                },
            ]
        );
        let config = engine.configuration();
        assert_eq!(config.find("b").unwrap().address, "10.0.0.9:7001");
        assert!(config.find("b").unwrap().voter);
    }

    #[tokio::test]
    async fn losing_leadership_mid_join_answers_not_a_leader() {
        let (svc, engine, _store) = service(RaftRole::Leader);
        engine.set_configuration(ClusterConfiguration {
            index: 1,
            servers: vec![ClusterMember::voter("a", "a:7001")],
        });
        engine.fail_membership_changes_with(ConsensusError::NotLeader { leader: None });

        let resp = svc.join_to_cluster(join("b", "b:7001", 0)).await.unwrap();

        assert_eq!(
            resp.into_inner().result(),
            join_to_cluster_response::Result::NotALeader
        );
        assert_eq!(engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn join_requires_identity() {
        let (svc, _engine, _store) = service(RaftRole::Leader);
        let status = svc.join_to_cluster(join("", "b:7001", 0)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
