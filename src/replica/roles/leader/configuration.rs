use crate::commitlog::{next_position, EntryId, LogEntry};
use crate::replica::replica_api::MembershipResponse;
use crate::replica::replica_state::ReplicaState;
use crate::replica::ReplicaId;
use tokio::sync::oneshot;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConfigurationState {
    Closed,
    Appended(EntryId),
    Configured(EntryId),
    Failed,
}

/// ConfigurationController logs one membership change and waits until it is committed and
/// applied. A join/leave caller, if any, is answered on close.
pub(super) struct ConfigurationController {
    state: ConfigurationState,
    reply: Option<oneshot::Sender<MembershipResponse>>,
}

impl ConfigurationController {
    pub(super) fn new() -> Self {
        ConfigurationController {
            state: ConfigurationState::Closed,
            reply: None,
        }
    }

    pub(super) fn open(
        &mut self,
        state: &mut ReplicaState,
        members: Vec<ReplicaId>,
        reply: Option<oneshot::Sender<MembershipResponse>>,
    ) {
        assert!(self.is_closed(), "Configuration change already in progress");
        self.reply = reply;

        let position = next_position(state.log.last_received().map(|e| e.position));
        let entry = LogEntry::configuration(position, state.term(), &members);
        slog::info!(state.logger, "Proposing configuration {:?} at {:?}", members, entry.id());

        let staged = state.log.append(&entry).and_then(|_| state.log.flush());
        self.state = match staged {
            Ok(_) => ConfigurationState::Appended(entry.id()),
            Err(e) => {
                slog::warn!(state.logger, "Failed to append configuration entry: {:?}", e);
                state.log.discard_buffered_entries();
                ConfigurationState::Failed
            }
        };
    }

    pub(super) fn do_work(&mut self, state: &mut ReplicaState) -> usize {
        if let ConfigurationState::Appended(id) = self.state {
            let applied = state.configuration().entry.map_or(false, |e| e.position >= id.position);
            if applied {
                slog::info!(state.logger, "Configuration {:?} is in effect", id);
                self.state = ConfigurationState::Configured(id);
                return 1;
            }
        }
        0
    }

    /// Stops waiting and answers the caller.
    pub(super) fn close(&mut self, state: &ReplicaState) {
        let succeeded = matches!(self.state, ConfigurationState::Configured(_));
        if let Some(reply) = self.reply.take() {
            let configuration = state.configuration();
            let _ = reply.send(MembershipResponse {
                term: state.term(),
                succeeded,
                members: configuration.members.clone(),
                configuration_entry: configuration.entry,
            });
        }
        self.state = ConfigurationState::Closed;
    }

    pub(super) fn is_closed(&self) -> bool {
        self.state == ConfigurationState::Closed
    }

    pub(super) fn is_configured(&self) -> bool {
        matches!(self.state, ConfigurationState::Configured(_))
    }

    pub(super) fn is_failed(&self) -> bool {
        self.state == ConfigurationState::Failed
    }
}
