//! Membership discovery: a one-time self-bootstrap followed by a periodic probe.

pub mod bootstrap;
pub mod kubernetes;
pub mod port;
pub mod reconcile;

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    config::{Config, DiscoveryKind},
    raft::{ClusterMember, ConsensusEngine},
};

pub use bootstrap::{BootstrapError, BootstrapLatch, bootstrap_if_needed};
pub use kubernetes::{EndpointLister, EndpointProbe, KubeLister, live_members};
pub use port::{GrpcConnector, PeerConnector, PortRangeProbe, ProbeReport};
pub use reconcile::MembershipChange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    Dial { target: String, message: String },
    Join { target: String, message: String },
    List { message: String },
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::Dial { target, message } => {
                write!(f, "dial {target} failed: {message}")
            }
            DiscoveryError::Join { target, message } => {
                write!(f, "join via {target} failed: {message}")
            }
            DiscoveryError::List { message } => write!(f, "list endpoints failed: {message}"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

pub enum DiscoveryStrategy {
    Port(PortRangeProbe),
    Kubernetes(EndpointProbe),
}

impl DiscoveryStrategy {
    pub async fn from_config(
        config: &Config,
        engine: Arc<dyn ConsensusEngine>,
    ) -> anyhow::Result<Self> {
        let local = ClusterMember::voter(&config.node_id, &config.node_address);
        Ok(match config.discovery_strategy {
            DiscoveryKind::Port => DiscoveryStrategy::Port(PortRangeProbe::new(
                engine,
                local,
                config.bootstrap,
                config.probe_host.clone(),
                config.probe_ports(),
                Arc::new(GrpcConnector::new(config.membership_timeout())),
            )),
            DiscoveryKind::Kubernetes => {
                let client = kube::Client::try_default().await?;
                DiscoveryStrategy::Kubernetes(EndpointProbe::new(
                    engine,
                    local,
                    config.bootstrap,
                    Arc::new(KubeLister::new(
                        client,
                        &config.kubernetes_namespace,
                        &config.kubernetes_service,
                    )),
                    config.kubernetes_port_name.clone(),
                    config.membership_timeout(),
                ))
            }
        })
    }

    /// The one-time self-bootstrap decision. Later calls, including the one inside
    /// [`discover`](Self::discover), are no-ops.
    pub async fn bootstrap(&self) -> Result<bool, BootstrapError> {
        let (engine, local, enabled, latch) = match self {
            DiscoveryStrategy::Port(p) => (&p.engine, &p.local, p.bootstrap, &p.latch),
            DiscoveryStrategy::Kubernetes(k) => (&k.engine, &k.local, k.bootstrap, &k.latch),
        };
        bootstrap_if_needed(engine.as_ref(), local, enabled, latch).await
    }

    /// Runs the bootstrap check, then spawns the periodic probe and returns its handle.
    ///
    /// The probe stops when `shutdown` flips to `true` or its sender is dropped.
    pub async fn discover(
        self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, BootstrapError> {
        self.bootstrap().await?;

        Ok(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                tokio::select! {
                    _ = self.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("discovery stopped");
        }))
    }

    async fn tick(&self) {
        match self {
            DiscoveryStrategy::Port(probe) => {
                probe.tick().await;
            }
            DiscoveryStrategy::Kubernetes(probe) => {
                probe.tick().await;
            }
        }
    }
}
