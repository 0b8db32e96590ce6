//! The replicated log itself: entries, and the storage trait the node
//! writes through. Grounded on the teacher corpus's Raft reference log
//! entry shape (`LogEntry { index, term, data }`), generalized to carry
//! the idempotency key the spec's dedup invariant needs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::membership::ConfigChange;
use crate::types::{LogIndex, Term};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogEntryData {
    /// Occupies a log index without mutating the state machine; used so a
    /// new leader can commit a no-op and establish which earlier entries
    /// from prior terms are now safely committed.
    Noop,
    Config(ConfigChange),
    /// Opaque state machine command, tagged with the caller's idempotency
    /// key so a retried propose that already committed is recognized as a
    /// duplicate instead of applied twice.
    Command { idempotency_key: Option<String>, payload: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub data: LogEntryData,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("requested index {0} is before the log's first retained index")]
    Compacted(LogIndex),
    #[error("requested index {0} is past the end of the log")]
    OutOfRange(LogIndex),
    #[error("storage I/O error: {0}")]
    Io(String),
}

/// The durable log a `RaftNode` appends to and reads from. The default
/// in-process implementation keeps everything in memory; `nimbus-node`
/// layers a file-backed implementation underneath it for the persisted
/// `raft/log` directory described in the external interfaces design.
#[async_trait]
pub trait LogStorage: Send + Sync {
    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), LogError>;

    /// Discards any entries at or after `from_index` before appending,
    /// used when a follower's log diverges from the leader's.
    async fn truncate_from(&self, from_index: LogIndex) -> Result<(), LogError>;

    async fn entry_at(&self, index: LogIndex) -> Result<Option<LogEntry>, LogError>;

    async fn entries_from(&self, from_index: LogIndex, limit: usize) -> Result<Vec<LogEntry>, LogError>;

    async fn last_index(&self) -> LogIndex;

    async fn last_term(&self) -> Term;

    /// Drops entries strictly before `up_to_index`, called after a
    /// snapshot has durably captured everything up to that point.
    async fn compact_before(&self, up_to_index: LogIndex) -> Result<(), LogError>;

    async fn first_retained_index(&self) -> LogIndex;
}

/// An in-memory [`LogStorage`]. Used directly in unit tests and wrapped by
/// `nimbus-node`'s file-backed store for the on-disk `raft/log` segment
/// cache.
#[derive(Default)]
pub struct InMemoryLog {
    entries: parking_lot::RwLock<Vec<LogEntry>>,
    first_retained_index: std::sync::atomic::AtomicU64,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn offset_of(&self, index: LogIndex, first: LogIndex) -> Option<usize> {
        if index < first {
            None
        } else {
            Some((index - first) as usize)
        }
    }
}

#[async_trait]
impl LogStorage for InMemoryLog {
    async fn append(&self, mut new_entries: Vec<LogEntry>) -> Result<(), LogError> {
        self.entries.write().append(&mut new_entries);
        Ok(())
    }

    async fn truncate_from(&self, from_index: LogIndex) -> Result<(), LogError> {
        let first = self.first_retained_index().await;
        let mut entries = self.entries.write();
        if let Some(offset) = self.offset_of(from_index, first) {
            entries.truncate(offset.min(entries.len()));
        }
        Ok(())
    }

    async fn entry_at(&self, index: LogIndex) -> Result<Option<LogEntry>, LogError> {
        let first = self.first_retained_index().await;
        if index < first {
            return Err(LogError::Compacted(index));
        }
        let entries = self.entries.read();
        Ok(self.offset_of(index, first).and_then(|off| entries.get(off).cloned()))
    }

    async fn entries_from(&self, from_index: LogIndex, limit: usize) -> Result<Vec<LogEntry>, LogError> {
        let first = self.first_retained_index().await;
        if from_index < first {
            return Err(LogError::Compacted(from_index));
        }
        let entries = self.entries.read();
        let Some(offset) = self.offset_of(from_index, first) else {
            return Ok(Vec::new());
        };
        Ok(entries.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn last_index(&self) -> LogIndex {
        let first = self.first_retained_index().await;
        first + self.entries.read().len() as u64
    }

    async fn last_term(&self) -> Term {
        self.entries.read().last().map(|e| e.term).unwrap_or(0)
    }

    async fn compact_before(&self, up_to_index: LogIndex) -> Result<(), LogError> {
        let first = self.first_retained_index().await;
        if up_to_index <= first {
            return Ok(());
        }
        let mut entries = self.entries.write();
        let drop_count = ((up_to_index - first) as usize).min(entries.len());
        entries.drain(0..drop_count);
        self.first_retained_index.store(up_to_index, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    async fn first_retained_index(&self) -> LogIndex {
        self.first_retained_index.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry { index, term, data: LogEntryData::Noop }
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let log = InMemoryLog::new();
        log.append(vec![entry(1, 1), entry(2, 1)]).await.unwrap();
        assert_eq!(log.last_index().await, 2);
        assert_eq!(log.entry_at(1).await.unwrap().unwrap().term, 1);
    }

    #[tokio::test]
    async fn compact_before_drops_old_entries_and_errors_on_access() {
        let log = InMemoryLog::new();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)]).await.unwrap();
        log.compact_before(2).await.unwrap();
        assert_eq!(log.first_retained_index().await, 2);
        assert!(matches!(log.entry_at(1).await, Err(LogError::Compacted(1))));
        assert_eq!(log.entry_at(2).await.unwrap().unwrap().index, 2);
    }
}
