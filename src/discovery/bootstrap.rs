use std::sync::atomic::{AtomicBool, Ordering};

use crate::raft::{ClusterMember, ConsensusEngine};

/// Fatal: the node could not form its initial cluster and must not serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapError {
    pub message: String,
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cluster bootstrap failed: {}", self.message)
    }
}

impl std::error::Error for BootstrapError {}

/// One-shot guard: once fired it never resets.
#[derive(Debug, Default)]
pub struct BootstrapLatch {
    fired: AtomicBool,
}

impl BootstrapLatch {
    /// Returns `true` only for the first caller.
    fn fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(test)]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Forms a single-voter cluster of `local` when the engine knows no membership yet.
///
/// Returns whether a bootstrap was issued.
pub async fn bootstrap_if_needed(
    engine: &dyn ConsensusEngine,
    local: &ClusterMember,
    enabled: bool,
    latch: &BootstrapLatch,
) -> Result<bool, BootstrapError> {
    if !latch.fire() {
        return Ok(false);
    }
    if !enabled {
        tracing::info!("bootstrap disabled; waiting to be joined");
        return Ok(false);
    }
    if !engine.configuration().is_empty() {
        return Ok(false);
    }

    tracing::info!(node_id = %local.id, address = %local.address, "bootstrapping single-node cluster");
    engine
        .bootstrap_cluster(vec![local.clone()])
        .await
        .map_err(|e| BootstrapError {
            message: e.to_string(),
        })?;
    Ok(true)
}
