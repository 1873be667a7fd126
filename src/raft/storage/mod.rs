//! Durable raft storage: a JSON-file log store and the replicated state machine.
//!
//! Layout under `<data_dir>/raft/`:
//! - `log/entries.json`, `log/vote.json`, `log/committed.json`
//! - `snapshots/meta.json`, `snapshots/data.json`

pub mod log_store;
pub mod state_machine;

use std::path::{Path, PathBuf};

use openraft::{ErrorSubject, ErrorVerb, StorageError};

use crate::raft::types::NodeId;

pub use log_store::FileLogStore;
pub use state_machine::{StoreSnapshotBuilder, StoreStateMachine};

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub entries_json: PathBuf,
    pub vote_json: PathBuf,
    pub committed_json: PathBuf,
    pub snapshot_meta_json: PathBuf,
    pub snapshot_data_json: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: &Path) -> Self {
        let raft_dir = data_dir.join("raft");
        let log_dir = raft_dir.join("log");
        let snapshot_dir = raft_dir.join("snapshots");
        Self {
            entries_json: log_dir.join("entries.json"),
            vote_json: log_dir.join("vote.json"),
            committed_json: log_dir.join("committed.json"),
            snapshot_meta_json: snapshot_dir.join("meta.json"),
            snapshot_data_json: snapshot_dir.join("data.json"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for file in [&self.entries_json, &self.snapshot_meta_json] {
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn io_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: std::io::Error,
) -> StorageError<NodeId> {
    StorageError::from_io_error(subject, verb, err)
}

async fn blocking<T, F>(f: F) -> std::io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
}

/// Returns `Ok(None)` when the file does not exist yet.
pub(crate) async fn read_json<T>(path: &Path) -> std::io::Result<Option<T>>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    let path = path.to_path_buf();
    blocking(move || {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(std::io::Error::other)
    })
    .await
}

pub(crate) async fn read_bytes(path: &Path) -> std::io::Result<Vec<u8>> {
    let path = path.to_path_buf();
    blocking(move || std::fs::read(&path)).await
}

pub(crate) async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    write_bytes(path, bytes).await
}

/// Write-then-rename so readers never see a torn file.
pub(crate) async fn write_bytes(path: &Path, bytes: Vec<u8>) -> std::io::Result<()> {
    let path = path.to_path_buf();
    blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(tmp, path)
    })
    .await
}
