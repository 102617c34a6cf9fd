use crate::commitlog::{next_position, EntryId, LogEntry};
use crate::replica::replica_state::ReplicaState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum AppendState {
    Closed,
    /// Staged, waiting for the flush.
    Append(EntryId),
    Appended(EntryId),
    Failed,
}

/// AppendController writes the entry that opens a leader's term. Until it is durable the leader
/// can't commit anything, so failures here end the leadership.
pub(super) struct AppendController {
    state: AppendState,
}

impl AppendController {
    pub(super) fn new() -> Self {
        AppendController {
            state: AppendState::Closed,
        }
    }

    pub(super) fn open(&mut self, state: &mut ReplicaState) {
        let position = next_position(state.log.last_received().map(|e| e.position));
        let entry = LogEntry::initialize(position, state.term());

        self.state = match state.log.append(&entry) {
            Ok(()) => AppendState::Append(entry.id()),
            Err(e) => {
                slog::warn!(state.logger, "Failed to stage initial entry {:?}: {:?}", entry.id(), e);
                AppendState::Failed
            }
        };
    }

    pub(super) fn do_work(&mut self, state: &mut ReplicaState) -> usize {
        let id = match self.state {
            AppendState::Append(id) => id,
            _ => return 0,
        };

        match state.log.flush() {
            Ok(_) => {
                slog::debug!(state.logger, "Initial entry {:?} is durable", id);
                self.state = AppendState::Appended(id);
            }
            Err(e) => {
                slog::warn!(state.logger, "Failed to flush initial entry {:?}: {:?}", id, e);
                state.log.discard_buffered_entries();
                self.state = AppendState::Failed;
            }
        }
        1
    }

    pub(super) fn state(&self) -> &AppendState {
        &self.state
    }

    pub(super) fn close(&mut self) {
        self.state = AppendState::Closed;
    }
}
