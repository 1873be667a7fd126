use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    pin::Pin,
    sync::Mutex,
    time::Duration,
};

use openraft::{
    ChangeMembers, ServerState,
    error::{ClientWriteError, RaftError},
};
use tokio::sync::watch;

use crate::{
    command::{ApplyResult, RawCommand, apply_raw},
    raft::types::{NodeId, NodeMeta, TypeConfig, raft_node_id},
    store::Store,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Metrics = openraft::RaftMetrics<NodeId, NodeMeta>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
    Candidate,
    Learner,
}

impl From<ServerState> for RaftRole {
    fn from(state: ServerState) -> Self {
        match state {
            ServerState::Leader => RaftRole::Leader,
            ServerState::Candidate => RaftRole::Candidate,
            ServerState::Learner => RaftRole::Learner,
            ServerState::Follower | ServerState::Shutdown => RaftRole::Follower,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub id: String,
    pub address: String,
    pub voter: bool,
}

impl ClusterMember {
    pub fn voter(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            voter: true,
        }
    }

    fn meta(&self) -> NodeMeta {
        NodeMeta::new(self.id.clone(), self.address.clone())
    }
}

/// Membership as seen by this node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfiguration {
    /// Log index at which this membership was committed; 0 when there is none.
    pub index: u64,
    pub servers: Vec<ClusterMember>,
}

impl ClusterConfiguration {
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn voters(&self) -> impl Iterator<Item = &ClusterMember> {
        self.servers.iter().filter(|m| m.voter)
    }

    pub fn find(&self, id: &str) -> Option<&ClusterMember> {
        self.servers.iter().find(|m| m.id == id)
    }

    fn from_metrics(metrics: &Metrics) -> Self {
        let stored = &metrics.membership_config;
        let membership = stored.membership();
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
        Self {
            index: stored.log_id().as_ref().map_or(0, |id| id.index),
            servers: membership
                .nodes()
                .map(|(id, node)| ClusterMember {
                    id: node.server_id.clone(),
                    address: node.address.clone(),
                    voter: voters.contains(id),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// This node cannot accept the request; `leader` is the known leader's address, if any.
    NotLeader { leader: Option<String> },
    /// The deadline expired. The command may still commit.
    ApplyTimeout,
    /// Membership changed since the caller last observed it.
    StaleConfiguration { expected: u64, actual: u64 },
    Engine { message: String },
}

impl std::fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusError::NotLeader {
                leader: Some(leader),
            } => write!(f, "not the leader (leader is {leader})"),
            ConsensusError::NotLeader { leader: None } => write!(f, "not the leader (no known leader)"),
            ConsensusError::ApplyTimeout => write!(f, "timed out waiting for commit"),
            ConsensusError::StaleConfiguration { expected, actual } => write!(
                f,
                "stale configuration: caller saw index {expected}, current is {actual}"
            ),
            ConsensusError::Engine { message } => write!(f, "consensus engine: {message}"),
        }
    }
}

impl std::error::Error for ConsensusError {}

/// Rejects a non-zero `prior_index` that no longer matches the current membership.
pub fn check_prior_index(prior_index: u64, current: u64) -> Result<(), ConsensusError> {
    if prior_index != 0 && prior_index != current {
        return Err(ConsensusError::StaleConfiguration {
            expected: prior_index,
            actual: current,
        });
    }
    Ok(())
}

/// The narrow surface of the consensus engine used by the RPC layer and discovery.
pub trait ConsensusEngine: Send + Sync + 'static {
    fn apply(
        &self,
        cmd: RawCommand,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<ApplyResult, ConsensusError>>;

    fn state(&self) -> RaftRole;

    fn leader_address(&self) -> Option<String>;

    fn configuration(&self) -> ClusterConfiguration;

    fn add_voter(
        &self,
        member: ClusterMember,
        prior_index: u64,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), ConsensusError>>;

    fn remove_server(
        &self,
        id: String,
        prior_index: u64,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), ConsensusError>>;

    fn bootstrap_cluster(
        &self,
        members: Vec<ClusterMember>,
    ) -> BoxFuture<'_, Result<(), ConsensusError>>;

    fn is_leader(&self) -> bool {
        self.state() == RaftRole::Leader
    }
}

#[derive(Clone)]
pub struct RealRaft {
    raft: openraft::Raft<TypeConfig>,
    metrics: watch::Receiver<Metrics>,
}

impl RealRaft {
    pub fn new(raft: openraft::Raft<TypeConfig>) -> Self {
        let metrics = raft.metrics();
        Self { raft, metrics }
    }

    pub fn raft(&self) -> openraft::Raft<TypeConfig> {
        self.raft.clone()
    }

    fn write_error(
        &self,
        what: &str,
        err: RaftError<NodeId, ClientWriteError<NodeId, NodeMeta>>,
    ) -> ConsensusError {
        if let Some(ClientWriteError::ForwardToLeader(forward)) = err.api_error() {
            let leader = forward
                .leader_node
                .as_ref()
                .map(|node| node.address.clone())
                .or_else(|| self.leader_address());
            return ConsensusError::NotLeader { leader };
        }
        ConsensusError::Engine {
            message: format!("{what}: {err}"),
        }
    }
}

impl ConsensusEngine for RealRaft {
    fn apply(
        &self,
        cmd: RawCommand,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<ApplyResult, ConsensusError>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.raft.client_write(cmd)).await {
                Err(_elapsed) => Err(ConsensusError::ApplyTimeout),
                Ok(Err(err)) => Err(self.write_error("client_write", err)),
                Ok(Ok(resp)) => Ok(resp.data),
            }
        })
    }

    fn state(&self) -> RaftRole {
        self.metrics.borrow().state.into()
    }

    fn leader_address(&self) -> Option<String> {
        let metrics = self.metrics.borrow();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.address.clone())
    }

    fn configuration(&self) -> ClusterConfiguration {
        ClusterConfiguration::from_metrics(&self.metrics.borrow())
    }

    fn add_voter(
        &self,
        member: ClusterMember,
        prior_index: u64,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move {
            check_prior_index(prior_index, self.configuration().index)?;
            let node_id = raft_node_id(&member.id);
            let change = async {
                self.raft
                    .add_learner(node_id, member.meta(), true)
                    .await
                    .map_err(|e| self.write_error("add_learner", e))?;
                self.raft
                    .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([node_id])), false)
                    .await
                    .map_err(|e| self.write_error("change_membership(add_voter)", e))?;
                Ok(())
            };
            tokio::time::timeout(timeout, change)
                .await
                .map_err(|_| ConsensusError::ApplyTimeout)?
        })
    }

    fn remove_server(
        &self,
        id: String,
        prior_index: u64,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move {
            let config = self.configuration();
            check_prior_index(prior_index, config.index)?;
            let Some(member) = config.find(&id) else {
                return Ok(());
            };
            let node_ids = BTreeSet::from([raft_node_id(&id)]);
            let change = if member.voter {
                ChangeMembers::RemoveVoters(node_ids)
            } else {
                ChangeMembers::RemoveNodes(node_ids)
            };
            tokio::time::timeout(timeout, self.raft.change_membership(change, false))
                .await
                .map_err(|_| ConsensusError::ApplyTimeout)?
                .map_err(|e| self.write_error("change_membership(remove)", e))?;
            Ok(())
        })
    }

    fn bootstrap_cluster(
        &self,
        members: Vec<ClusterMember>,
    ) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move {
            // Metrics may not reflect restored membership yet right after startup.
            let initialized = self
                .raft
                .is_initialized()
                .await
                .map_err(|e| ConsensusError::Engine {
                    message: format!("is_initialized: {e}"),
                })?;
            if initialized {
                return Ok(());
            }
            let nodes: BTreeMap<NodeId, NodeMeta> = members
                .iter()
                .map(|m| (raft_node_id(&m.id), m.meta()))
                .collect();
            self.raft
                .initialize(nodes)
                .await
                .map_err(|e| ConsensusError::Engine {
                    message: format!("initialize: {e}"),
                })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipCall {
    AddVoter {
        id: String,
        address: String,
        prior_index: u64,
    },
    RemoveServer {
        id: String,
        prior_index: u64,
    },
    Bootstrap {
        ids: Vec<String>,
    },
}

#[derive(Debug)]
struct LocalState {
    role: RaftRole,
    leader: Option<String>,
    config: ClusterConfiguration,
    calls: Vec<MembershipCall>,
    membership_failure: Option<ConsensusError>,
}

/// A test-only engine that applies commands straight to a local store and records membership
/// calls instead of replicating them.
pub struct LocalEngine {
    store: Store,
    state: Mutex<LocalState>,
}

impl LocalEngine {
    pub fn new(store: Store, role: RaftRole) -> Self {
        Self {
            store,
            state: Mutex::new(LocalState {
                role,
                leader: None,
                config: ClusterConfiguration::default(),
                calls: Vec::new(),
                membership_failure: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_role(&self, role: RaftRole) {
        self.lock().role = role;
    }

    pub fn set_leader_address(&self, leader: Option<String>) {
        self.lock().leader = leader;
    }

    pub fn set_configuration(&self, config: ClusterConfiguration) {
        self.lock().config = config;
    }

    /// Makes every later membership call fail with an engine error.
    pub fn fail_membership_changes(&self) {
        self.fail_membership_changes_with(ConsensusError::Engine {
            message: "membership change rejected".to_string(),
        });
    }

    pub fn fail_membership_changes_with(&self, err: ConsensusError) {
        self.lock().membership_failure = Some(err);
    }

    pub fn calls(&self) -> Vec<MembershipCall> {
        self.lock().calls.clone()
    }

    fn record(&self, call: MembershipCall) -> Result<(), ConsensusError> {
        let mut state = self.lock();
        state.calls.push(call);
        match &state.membership_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl ConsensusEngine for LocalEngine {
    fn apply(
        &self,
        cmd: RawCommand,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<ApplyResult, ConsensusError>> {
        Box::pin(async move {
            if !self.is_leader() {
                return Err(ConsensusError::NotLeader {
                    leader: self.leader_address(),
                });
            }
            Ok(apply_raw(&cmd, &self.store).await)
        })
    }

    fn state(&self) -> RaftRole {
        self.lock().role
    }

    fn leader_address(&self) -> Option<String> {
        self.lock().leader.clone()
    }

    fn configuration(&self) -> ClusterConfiguration {
        self.lock().config.clone()
    }

    fn add_voter(
        &self,
        member: ClusterMember,
        prior_index: u64,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move {
            check_prior_index(prior_index, self.configuration().index)?;
            self.record(MembershipCall::AddVoter {
                id: member.id.clone(),
                address: member.address.clone(),
                prior_index,
            })?;
            let mut state = self.lock();
            state.config.servers.retain(|m| m.id != member.id);
            state.config.servers.push(ClusterMember {
                voter: true,
                ..member
            });
            state.config.index += 1;
            Ok(())
        })
    }

    fn remove_server(
        &self,
        id: String,
        prior_index: u64,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move {
            check_prior_index(prior_index, self.configuration().index)?;
            self.record(MembershipCall::RemoveServer {
                id: id.clone(),
                prior_index,
            })?;
            let mut state = self.lock();
            state.config.servers.retain(|m| m.id != id);
            state.config.index += 1;
            Ok(())
        })
    }

    fn bootstrap_cluster(
        &self,
        members: Vec<ClusterMember>,
    ) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move {
            self.record(MembershipCall::Bootstrap {
                ids: members.iter().map(|m| m.id.clone()).collect(),
            })?;
            let mut state = self.lock();
            state.config = ClusterConfiguration {
                index: 1,
                servers: members,
            };
            state.role = RaftRole::Leader;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::command::Command;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn prior_index_zero_is_never_stale() {
        assert_eq!(check_prior_index(0, 42), Ok(()));
        assert_eq!(check_prior_index(42, 42), Ok(()));
        assert_eq!(
            check_prior_index(41, 42),
            Err(ConsensusError::StaleConfiguration {
                expected: 41,
                actual: 42
            })
        );
    }

    #[test]
    fn configuration_reads_metrics_membership() {
        let mut metrics = Metrics::new_initial(raft_node_id("a"));
        assert_eq!(
            ClusterConfiguration::from_metrics(&metrics),
            ClusterConfiguration::default()
        );

        let nodes = BTreeMap::from([
            (raft_node_id("a"), NodeMeta::new("a", "10.0.0.1:7001")),
            (raft_node_id("b"), NodeMeta::new("b", "10.0.0.2:7001")),
        ]);
        let membership =
            openraft::Membership::new(vec![BTreeSet::from([raft_node_id("a")])], nodes);
        let log_id = openraft::LogId::new(openraft::CommittedLeaderId::new(1, 1), 7);
        metrics.membership_config = std::sync::Arc::new(openraft::StoredMembership::new(
            Some(log_id),
            membership,
        ));

        let mut config = ClusterConfiguration::from_metrics(&metrics);
        config.servers.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(config.index, 7);
        assert_eq!(
            config.servers,
            vec![
                ClusterMember::voter("a", "10.0.0.1:7001"),
                ClusterMember {
                    id: "b".to_string(),
                    address: "10.0.0.2:7001".to_string(),
                    voter: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn local_engine_rejects_writes_unless_leader() {
        let engine = LocalEngine::new(Store::default(), RaftRole::Follower);
        engine.set_leader_address(Some("10.0.0.9:7001".to_string()));
        let cmd = Command::MapClear {
            namespace: "ns".to_string(),
        }
        .encode()
        .unwrap();

        let err = engine.apply(cmd.clone(), TIMEOUT).await.unwrap_err();
        assert_eq!(
            err,
            ConsensusError::NotLeader {
                leader: Some("10.0.0.9:7001".to_string())
            }
        );

        engine.set_role(RaftRole::Leader);
        assert_eq!(
            engine.apply(cmd, TIMEOUT).await.unwrap(),
            ApplyResult::applied(false)
        );
    }

    #[tokio::test]
    async fn local_engine_fences_membership_changes() {
        let engine = LocalEngine::new(Store::default(), RaftRole::Leader);
        engine
            .bootstrap_cluster(vec![ClusterMember::voter("a", "a:1")])
            .await
            .unwrap();

        let err = engine
            .add_voter(ClusterMember::voter("b", "b:1"), 5, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsensusError::StaleConfiguration { .. }));

        engine
            .add_voter(ClusterMember::voter("b", "b:1"), 1, TIMEOUT)
            .await
            .unwrap();
        let config = engine.configuration();
        assert_eq!(config.index, 2);
        assert_eq!(config.voters().count(), 2);
    }
}
