//! Port-range discovery for single-host clusters.
//!
//! A node that is not the leader periodically asks every port in the configured range to add it
//! as a voter. Whichever peer is leader accepts; everyone else answers `NOT_A_LEADER`.

use std::{ops::Range, sync::Arc, time::Duration};

use futures_util::future::join_all;

use super::{DiscoveryError, bootstrap::BootstrapLatch};
use crate::{
    raft::{ClusterMember, ConsensusEngine, app::BoxFuture},
    rpc::client::{self, JoinOutcome},
};

/// Sends one `JoinToCluster` request to a peer.
pub trait PeerConnector: Send + Sync + 'static {
    fn join(
        &self,
        target: String,
        local: ClusterMember,
        previous_index: u64,
    ) -> BoxFuture<'_, Result<JoinOutcome, DiscoveryError>>;
}

/// Dials peers over gRPC; connect and request each bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    timeout: Duration,
}

impl GrpcConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PeerConnector for GrpcConnector {
    fn join(
        &self,
        target: String,
        local: ClusterMember,
        previous_index: u64,
    ) -> BoxFuture<'_, Result<JoinOutcome, DiscoveryError>> {
        Box::pin(async move {
            let mut peer = client::connect(&target, self.timeout)
                .await
                .map_err(|e| DiscoveryError::Dial {
                    target: target.clone(),
                    message: e.to_string(),
                })?;
            let request = peer.join_to_cluster(&local.id, &local.address, previous_index);
            tokio::time::timeout(self.timeout, request)
                .await
                .map_err(|_| DiscoveryError::Join {
                    target: target.clone(),
                    message: "timed out".to_string(),
                })?
                .map_err(|e| DiscoveryError::Join {
                    target,
                    message: e.to_string(),
                })
        })
    }
}

/// Tally of one probe tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub attempted: usize,
    pub joined: usize,
    pub not_leader: usize,
    pub failed: usize,
}

pub struct PortRangeProbe {
    pub(super) engine: Arc<dyn ConsensusEngine>,
    pub(super) local: ClusterMember,
    pub(super) bootstrap: bool,
    pub(super) latch: BootstrapLatch,
    host: String,
    ports: Range<u16>,
    connector: Arc<dyn PeerConnector>,
}

impl PortRangeProbe {
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        local: ClusterMember,
        bootstrap: bool,
        host: String,
        ports: Range<u16>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        Self {
            engine,
            local,
            bootstrap,
            latch: BootstrapLatch::default(),
            host,
            ports,
            connector,
        }
    }

    /// Dials every port in the range concurrently and waits for all of them.
    pub async fn tick(&self) -> ProbeReport {
        if self.engine.is_leader() {
            tracing::debug!("leader; skipping port probe");
            return ProbeReport::default();
        }

        // Unfenced so a node holding stale membership can still rejoin.
        let attempts = self.ports.clone().map(|port| {
            let target = format!("{}:{port}", self.host);
            self.connector.join(target, self.local.clone(), 0)
        });
        let results = join_all(attempts).await;

        let mut report = ProbeReport {
            attempted: results.len(),
            ..ProbeReport::default()
        };
        for result in results {
            match result {
                Ok(JoinOutcome::Joined) => report.joined += 1,
                Ok(JoinOutcome::NotLeader) => report.not_leader += 1,
                Err(err @ DiscoveryError::Dial { .. }) => {
                    tracing::debug!(error = %err, "peer unreachable");
                    report.failed += 1;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "join request failed");
                    report.failed += 1;
                }
            }
        }

        if report.joined > 0 {
            tracing::info!(?report, "joined cluster via port probe");
        } else {
            tracing::debug!(?report, "port probe finished");
        }
        report
    }
}
