use std::{collections::BTreeMap, fmt::Debug, ops::RangeBounds, path::Path, sync::Arc};

use openraft::{
    ErrorSubject, ErrorVerb, LogId, LogState, OptionalSend, RaftLogReader, StorageError, Vote,
    storage::{LogFlushed, RaftLogStorage},
};
use tokio::sync::Mutex;

use super::{StoragePaths, io_err, read_json, write_json};
use crate::raft::types::{NodeId, TypeConfig};

type Entry = openraft::impls::Entry<TypeConfig>;

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct PersistedLog {
    #[serde(default)]
    last_purged_log_id: Option<LogId<NodeId>>,
    #[serde(default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Default)]
struct LogInner {
    last_purged_log_id: Option<LogId<NodeId>>,
    entries: BTreeMap<u64, Entry>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
}

impl LogInner {
    fn last_log_id(&self) -> Option<LogId<NodeId>> {
        self.entries
            .values()
            .next_back()
            .map(|entry| entry.log_id)
            .or(self.last_purged_log_id)
    }

    fn persisted(&self) -> PersistedLog {
        PersistedLog {
            last_purged_log_id: self.last_purged_log_id,
            entries: self.entries.values().cloned().collect(),
        }
    }
}

/// Raft log kept in memory and rewritten to `entries.json` after every mutation.
///
/// The whole file is rewritten each time; snapshots keep the retained tail short.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    paths: StoragePaths,
    inner: Arc<Mutex<LogInner>>,
}

impl FileLogStore {
    pub async fn open(data_dir: &Path) -> Result<Self, StorageError<NodeId>> {
        let paths = StoragePaths::new(data_dir);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;

        let log = read_json::<PersistedLog>(&paths.entries_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Read, e))?
            .unwrap_or_default();
        let vote = read_json::<Vote<NodeId>>(&paths.vote_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Vote, ErrorVerb::Read, e))?;
        let committed = read_json::<LogId<NodeId>>(&paths.committed_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Read, e))?;

        let inner = LogInner {
            last_purged_log_id: log.last_purged_log_id,
            entries: log
                .entries
                .into_iter()
                .map(|entry| (entry.log_id.index, entry))
                .collect(),
            vote,
            committed,
        };

        Ok(Self {
            paths,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Runs `mutate` and persists the log before releasing the lock.
    async fn mutate_log<F>(&self, mutate: F) -> Result<(), StorageError<NodeId>>
    where
        F: FnOnce(&mut LogInner) + Send,
    {
        let mut inner = self.inner.lock().await;
        mutate(&mut inner);
        write_json(&self.paths.entries_json, &inner.persisted())
            .await
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))
    }

    async fn insert_entries<I>(&self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + Send,
    {
        self.mutate_log(|inner| {
            for entry in entries {
                inner.entries.insert(entry.log_id.index, entry);
            }
        })
        .await
    }
}

impl RaftLogReader<TypeConfig> for FileLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError<NodeId>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for FileLogStore {
    type LogReader = FileLogStore;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let inner = self.inner.lock().await;
        Ok(LogState {
            last_purged_log_id: inner.last_purged_log_id,
            last_log_id: inner.last_log_id(),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut inner = self.inner.lock().await;
        write_json(&self.paths.vote_json, vote)
            .await
            .map_err(|e| io_err(ErrorSubject::Vote, ErrorVerb::Write, e))?;
        inner.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.inner.lock().await.vote)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        let mut inner = self.inner.lock().await;
        if let Some(committed) = &committed {
            write_json(&self.paths.committed_json, committed)
                .await
                .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;
        }
        inner.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.inner.lock().await.committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let res = self.insert_entries(entries).await;
        callback.log_io_completed(
            res.as_ref()
                .map(|_| ())
                .map_err(|e| std::io::Error::other(e.to_string())),
        );
        res
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        tracing::debug!(index = log_id.index, "truncating raft log");
        self.mutate_log(|inner| {
            inner.entries.split_off(&log_id.index);
        })
        .await
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        tracing::debug!(index = log_id.index, "purging raft log");
        self.mutate_log(|inner| {
            inner.entries = inner.entries.split_off(&(log_id.index + 1));
            inner.last_purged_log_id = Some(log_id);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use openraft::{CommittedLeaderId, EntryPayload};

    use super::*;
    use crate::command::RawCommand;

    fn entry(index: u64) -> Entry {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(RawCommand(vec![index as u8])),
        }
    }

    fn indexes(entries: &[Entry]) -> Vec<u64> {
        entries.iter().map(|e| e.log_id.index).collect()
    }

    #[tokio::test]
    async fn entries_vote_and_commit_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(tmp.path()).await.unwrap();
        store.insert_entries((1..=3).map(entry)).await.unwrap();
        let vote = Vote::new(2, 7);
        store.save_vote(&vote).await.unwrap();
        store
            .save_committed(Some(entry(2).log_id))
            .await
            .unwrap();

        let mut reopened = FileLogStore::open(tmp.path()).await.unwrap();
        let all = reopened.try_get_log_entries(0..).await.unwrap();
        assert_eq!(indexes(&all), vec![1, 2, 3]);
        assert_eq!(reopened.read_vote().await.unwrap(), Some(vote));
        assert_eq!(
            reopened.read_committed().await.unwrap(),
            Some(entry(2).log_id)
        );
    }

    #[tokio::test]
    async fn truncate_drops_suffix_and_purge_drops_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(tmp.path()).await.unwrap();
        store.insert_entries((1..=5).map(entry)).await.unwrap();

        store.truncate(entry(4).log_id).await.unwrap();
        store.purge(entry(2).log_id).await.unwrap();

        let remaining = store.try_get_log_entries(0..).await.unwrap();
        assert_eq!(indexes(&remaining), vec![3]);

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(entry(2).log_id));
        assert_eq!(state.last_log_id, Some(entry(3).log_id));
    }

    #[tokio::test]
    async fn fully_purged_log_reports_purged_id_as_last() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(tmp.path()).await.unwrap();
        store.insert_entries((1..=2).map(entry)).await.unwrap();
        store.purge(entry(2).log_id).await.unwrap();

        let reopened_state = FileLogStore::open(tmp.path())
            .await
            .unwrap()
            .get_log_state()
            .await
            .unwrap();
        assert_eq!(reopened_state.last_log_id, Some(entry(2).log_id));
    }
}
