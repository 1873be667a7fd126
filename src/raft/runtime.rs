use std::{path::Path, sync::Arc};

use anyhow::Context;

use crate::{
    raft::{
        app::RealRaft,
        network_http::HttpNetworkFactory,
        storage::{FileLogStore, StoreStateMachine},
        types::{NodeId, TypeConfig},
    },
    store::Store,
};

#[derive(Debug, Clone)]
pub struct RaftSettings {
    pub cluster_name: String,
    /// Committed entries between automatic snapshots.
    pub snapshot_logs: u64,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            cluster_name: "demory".to_string(),
            snapshot_logs: 5000,
        }
    }
}

pub async fn start_raft(
    data_dir: &Path,
    node_id: NodeId,
    store: Store,
    settings: RaftSettings,
    network: HttpNetworkFactory,
) -> anyhow::Result<RealRaft> {
    let config = openraft::Config {
        cluster_name: settings.cluster_name,
        heartbeat_interval: 250,
        election_timeout_min: 1_000,
        election_timeout_max: 2_000,
        snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(settings.snapshot_logs),
        // Keep a short tail after a snapshot so lagging followers can still catch up from logs.
        max_in_snapshot_log_to_keep: 100,
        ..Default::default()
    }
    .validate()
    .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))?;

    let log_store = FileLogStore::open(data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("open log store: {e}"))?;
    let state_machine = StoreStateMachine::open(data_dir, store)
        .await
        .map_err(|e| anyhow::anyhow!("open state machine: {e}"))?;

    let raft = openraft::Raft::<TypeConfig>::new(
        node_id,
        Arc::new(config),
        network,
        log_store,
        state_machine,
    )
    .await
    .context("start raft")?;

    tracing::info!(node_id, data_dir = %data_dir.display(), "raft started");

    // Cluster bootstrap is driven by discovery.
    Ok(RealRaft::new(raft))
}
