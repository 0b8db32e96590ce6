//! File-backed [`LogStorage`]: an [`InMemoryLog`] kept as the hot cache
//! for reads, with every append, truncate, and compaction mirrored to
//! `raft/log/<index>` files on disk so a restart can replay the log
//! without re-replicating from a peer.

use std::path::PathBuf;

use async_trait::async_trait;
use nimbus_consensus::log::{LogEntry, LogError, LogStorage};
use nimbus_consensus::types::{LogIndex, Term};

use crate::error::NodeError;
use crate::layout::{atomic_write, DataDir};

pub struct FileLogStorage {
    dir: PathBuf,
    cache: nimbus_consensus::log::InMemoryLog,
}

impl FileLogStorage {
    /// Replays every entry file under `raft/log` into the in-memory cache.
    /// Entries are named by zero-padded index so a directory listing is
    /// already in log order.
    pub fn open(data_dir: &DataDir) -> Result<Self, NodeError> {
        let dir = data_dir.raft_log_dir();
        std::fs::create_dir_all(&dir)?;

        let cache = nimbus_consensus::log::InMemoryLog::new();
        let mut entries = Vec::new();
        for file in std::fs::read_dir(&dir)? {
            let file = file?;
            if !file.file_type()?.is_file() {
                continue;
            }
            let raw = std::fs::read(file.path())?;
            let entry: LogEntry = serde_json::from_slice(&raw)?;
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.index);

        let storage = Self { dir, cache };
        futures::executor::block_on(storage.cache.append(entries)).map_err(log_error_to_node_error)?;
        Ok(storage)
    }

    fn entry_path(&self, index: LogIndex) -> PathBuf {
        self.dir.join(format!("{index:020}"))
    }
}

fn log_error_to_node_error(err: LogError) -> NodeError {
    NodeError::DataDir(err.to_string())
}

#[async_trait]
impl LogStorage for FileLogStorage {
    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), LogError> {
        for entry in &entries {
            let bytes = serde_json::to_vec(entry).map_err(|e| LogError::Io(e.to_string()))?;
            atomic_write(&self.entry_path(entry.index), &bytes).map_err(|e| LogError::Io(e.to_string()))?;
        }
        self.cache.append(entries).await
    }

    async fn truncate_from(&self, from_index: LogIndex) -> Result<(), LogError> {
        let last = self.cache.last_index().await;
        for index in from_index..=last {
            let path = self.entry_path(index);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| LogError::Io(e.to_string()))?;
            }
        }
        self.cache.truncate_from(from_index).await
    }

    async fn entry_at(&self, index: LogIndex) -> Result<Option<LogEntry>, LogError> {
        self.cache.entry_at(index).await
    }

    async fn entries_from(&self, from_index: LogIndex, limit: usize) -> Result<Vec<LogEntry>, LogError> {
        self.cache.entries_from(from_index, limit).await
    }

    async fn last_index(&self) -> LogIndex {
        self.cache.last_index().await
    }

    async fn last_term(&self) -> Term {
        self.cache.last_term().await
    }

    async fn compact_before(&self, up_to_index: LogIndex) -> Result<(), LogError> {
        let first = self.cache.first_retained_index().await;
        for index in first..up_to_index {
            let path = self.entry_path(index);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| LogError::Io(e.to_string()))?;
            }
        }
        self.cache.compact_before(up_to_index).await
    }

    async fn first_retained_index(&self) -> LogIndex {
        self.cache.first_retained_index().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_consensus::log::LogEntryData;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry { index, term, data: LogEntryData::Noop }
    }

    #[tokio::test]
    async fn appended_entries_survive_a_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::open(tmp.path()).unwrap();
        {
            let log = FileLogStorage::open(&data_dir).unwrap();
            log.append(vec![entry(1, 1), entry(2, 1)]).await.unwrap();
        }
        let reopened = FileLogStorage::open(&data_dir).unwrap();
        assert_eq!(reopened.last_index().await, 2);
        assert_eq!(reopened.entry_at(1).await.unwrap().unwrap().term, 1);
    }

    #[tokio::test]
    async fn truncate_from_removes_files_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::open(tmp.path()).unwrap();
        let log = FileLogStorage::open(&data_dir).unwrap();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 1)]).await.unwrap();
        log.truncate_from(2).await.unwrap();
        assert_eq!(log.last_index().await, 1);
        let reopened = FileLogStorage::open(&data_dir).unwrap();
        assert_eq!(reopened.last_index().await, 1);
    }
}
