//! Snapshotting: compacting the log into a single state-machine blob plus
//! the configuration in effect at that point, so a lagging or new node
//! can catch up without replaying the entire history.

use crate::membership::Configuration;
use crate::types::{LogIndex, Term};

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub configuration: Configuration,
    pub state_machine_bytes: Vec<u8>,
}

/// Applies committed log entries to an opaque state machine and can
/// serialize/restore its full contents for snapshotting. `nimbus-node`
/// provides the concrete implementation (the model registry's placement
/// table, in practice); this crate only needs the shape.
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry_index: LogIndex, command: &[u8]);

    fn snapshot(&self) -> Vec<u8>;

    fn restore(&self, bytes: &[u8]);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingStateMachine {
        pub applied: Mutex<Vec<(LogIndex, Vec<u8>)>>,
    }

    impl StateMachine for RecordingStateMachine {
        fn apply(&self, entry_index: LogIndex, command: &[u8]) {
            self.applied.lock().push((entry_index, command.to_vec()));
        }

        fn snapshot(&self) -> Vec<u8> {
            serde_json::to_vec(&*self.applied.lock()).unwrap_or_default()
        }

        fn restore(&self, bytes: &[u8]) {
            if let Ok(applied) = serde_json::from_slice(bytes) {
                *self.applied.lock() = applied;
            }
        }
    }
}
