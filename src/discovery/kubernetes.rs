//! Endpoint-driven membership for clusters running under Kubernetes.
//!
//! The leader lists the service's `Endpoints` and reconciles the voter set against the ready
//! addresses. Followers do nothing; pods that are not leader never touch membership.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};
use kube::{Api, Client, api::ListParams};

use super::{DiscoveryError, bootstrap::BootstrapLatch, reconcile};
use crate::raft::{ClusterMember, ConsensusEngine, app::BoxFuture};

/// Source of `Endpoints` records for the service.
pub trait EndpointLister: Send + Sync + 'static {
    fn list(&self) -> BoxFuture<'_, Result<Vec<Endpoints>, DiscoveryError>>;
}

pub struct KubeLister {
    client: Client,
    namespace: String,
    service: String,
}

impl KubeLister {
    pub fn new(client: Client, namespace: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            service: service.into(),
        }
    }
}

impl EndpointLister for KubeLister {
    fn list(&self) -> BoxFuture<'_, Result<Vec<Endpoints>, DiscoveryError>> {
        Box::pin(async move {
            let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), &self.namespace);
            let selector = format!("app={}", self.service);
            let list = endpoints
                .list(&ListParams::default().labels(&selector))
                .await
                .map_err(|e| DiscoveryError::List {
                    message: e.to_string(),
                })?;
            Ok(list.items)
        })
    }
}

/// Builds `member id -> ip:port` from ready addresses.
///
/// The member id is the target pod name, falling back to hostname and then IP. The port is the
/// one named `port_name`, or the subset's first port when no name is given. Subsets without a
/// usable port contribute nothing.
pub fn live_members(records: &[Endpoints], port_name: Option<&str>) -> BTreeMap<String, String> {
    records
        .iter()
        .filter_map(|record| record.subsets.as_ref())
        .flatten()
        .flat_map(|subset| subset_members(subset, port_name))
        .collect()
}

fn subset_members(subset: &EndpointSubset, port_name: Option<&str>) -> Vec<(String, String)> {
    let ports = subset.ports.as_deref().unwrap_or_default();
    let port = match port_name {
        Some(name) => ports.iter().find(|p| p.name.as_deref() == Some(name)),
        None => ports.first(),
    };
    let Some(port) = port else {
        return Vec::new();
    };

    subset
        .addresses
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|address| (member_id(address), format!("{}:{}", address.ip, port.port)))
        .collect()
}

fn member_id(address: &EndpointAddress) -> String {
    address
        .target_ref
        .as_ref()
        .and_then(|r| r.name.clone())
        .or_else(|| address.hostname.clone())
        .unwrap_or_else(|| address.ip.clone())
}

pub struct EndpointProbe {
    pub(super) engine: Arc<dyn ConsensusEngine>,
    pub(super) local: ClusterMember,
    pub(super) bootstrap: bool,
    pub(super) latch: BootstrapLatch,
    lister: Arc<dyn EndpointLister>,
    port_name: Option<String>,
    membership_timeout: Duration,
}

impl EndpointProbe {
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        local: ClusterMember,
        bootstrap: bool,
        lister: Arc<dyn EndpointLister>,
        port_name: Option<String>,
        membership_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            local,
            bootstrap,
            latch: BootstrapLatch::default(),
            lister,
            port_name,
            membership_timeout,
        }
    }

    /// Reconciles once; returns the number of membership changes applied.
    pub async fn tick(&self) -> usize {
        if !self.engine.is_leader() {
            return 0;
        }

        let records = match self.lister.list().await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "endpoint listing failed");
                return 0;
            }
        };
        let live = live_members(&records, self.port_name.as_deref());
        let voters: Vec<ClusterMember> = self.engine.configuration().voters().cloned().collect();

        let changes = reconcile::plan(&voters, &live);
        if changes.is_empty() {
            tracing::debug!(live = live.len(), "membership matches endpoints");
            return 0;
        }
        reconcile::execute(self.engine.as_ref(), changes, self.membership_timeout).await
    }
}
