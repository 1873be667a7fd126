//! Replicated state machine over the in-memory [`Store`].
//!
//! Only snapshots are persisted. On open the store is rebuilt from the latest snapshot and
//! `last_applied` is reported as the snapshot's last log id, so openraft replays just the tail.

use std::{io::Cursor, path::Path};

use openraft::{
    EntryPayload, ErrorSubject, ErrorVerb, LogId, RaftSnapshotBuilder, Snapshot, SnapshotMeta,
    StorageError, StoredMembership,
    entry::RaftPayload as _,
    storage::RaftStateMachine,
};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

use super::{StoragePaths, io_err, read_bytes, read_json, write_bytes, write_json};
use crate::{
    command::{ApplyResult, apply_raw},
    raft::types::{NodeId, NodeMeta, TypeConfig},
    store::{Store, StoreSnapshot},
};

type Meta = SnapshotMeta<NodeId, NodeMeta>;

fn snapshot_err(verb: ErrorVerb, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> StorageError<NodeId> {
    io_err(ErrorSubject::Snapshot(None), verb, std::io::Error::other(err))
}

#[derive(Debug)]
pub struct StoreStateMachine {
    store: Store,
    paths: StoragePaths,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
}

impl StoreStateMachine {
    pub async fn open(data_dir: &Path, store: Store) -> Result<Self, StorageError<NodeId>> {
        let paths = StoragePaths::new(data_dir);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(ErrorSubject::StateMachine, ErrorVerb::Write, e))?;

        let mut machine = Self {
            store,
            paths,
            last_applied: None,
            last_membership: StoredMembership::default(),
        };

        let meta = read_json::<Meta>(&machine.paths.snapshot_meta_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        if let Some(meta) = meta {
            let bytes = read_bytes(&machine.paths.snapshot_data_json)
                .await
                .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
            machine.restore(&meta, &bytes).await?;
            tracing::info!(
                snapshot_id = %meta.snapshot_id,
                last_applied = ?meta.last_log_id,
                "restored state machine from snapshot"
            );
        }

        Ok(machine)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn restore(&mut self, meta: &Meta, bytes: &[u8]) -> Result<(), StorageError<NodeId>> {
        let snapshot: StoreSnapshot =
            serde_json::from_slice(bytes).map_err(|e| snapshot_err(ErrorVerb::Read, e))?;
        self.store.restore(snapshot).await;
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        Ok(())
    }
}

/// Serializes a point-in-time copy taken when the builder was created.
#[derive(Debug)]
pub struct StoreSnapshotBuilder {
    data: StoreSnapshot,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
    paths: StoragePaths,
}

impl RaftSnapshotBuilder<TypeConfig> for StoreSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let bytes = serde_json::to_vec(&self.data).map_err(|e| snapshot_err(ErrorVerb::Write, e))?;

        let index = self.last_applied.map(|l| l.index).unwrap_or(0);
        let meta = Meta {
            last_log_id: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_id: format!("snapshot-{index}"),
        };

        persist_snapshot(&self.paths, &meta, bytes.clone()).await?;
        tracing::info!(snapshot_id = %meta.snapshot_id, size = bytes.len(), "built snapshot");

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

/// Data first, then meta: a meta file on disk always has its data beside it.
async fn persist_snapshot(
    paths: &StoragePaths,
    meta: &Meta,
    bytes: Vec<u8>,
) -> Result<(), StorageError<NodeId>> {
    write_bytes(&paths.snapshot_data_json, bytes)
        .await
        .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
    write_json(&paths.snapshot_meta_json, meta)
        .await
        .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))
}

impl RaftStateMachine<TypeConfig> for StoreStateMachine {
    type SnapshotBuilder = StoreSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, NodeMeta>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyResult>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = openraft::impls::Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;
            if let Some(membership) = entry.get_membership() {
                self.last_membership = StoredMembership::new(Some(log_id), membership.clone());
            }

            let response = match &entry.payload {
                EntryPayload::Normal(raw) => apply_raw(raw, &self.store).await,
                EntryPayload::Membership(_) | EntryPayload::Blank => ApplyResult::empty(),
            };

            self.last_applied = Some(log_id);
            responses.push(response);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        StoreSnapshotBuilder {
            data: self.store.snapshot().await,
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            paths: self.paths.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &Meta,
        mut snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        snapshot
            .seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        let mut bytes = Vec::new();
        snapshot
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;

        self.restore(meta, &bytes).await?;
        persist_snapshot(&self.paths, meta, bytes).await?;
        tracing::info!(snapshot_id = %meta.snapshot_id, "installed snapshot from leader");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let Some(meta) = read_json::<Meta>(&self.paths.snapshot_meta_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?
        else {
            return Ok(None);
        };
        let bytes = read_bytes(&self.paths.snapshot_data_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        Ok(Some(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        }))
    }
}
