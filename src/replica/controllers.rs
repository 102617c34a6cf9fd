//! Collaborator seams. The consensus core never talks to the network itself: every RPC to a peer
//! is a polled controller object, opened and driven every tick, then closed. Transports implement
//! these traits; tests implement them with fakes.
use crate::commitlog::{LogEntry, Position};
use crate::replica::log_buffer::{LogBufferError, ReplicatedLogBuffer};
use crate::replica::peers::ReplicaId;
use crate::replica::replica_api::{
    AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, ElectionResponse, PollRequest, VoteRequest,
};
use crate::replica::Term;

/// Lifecycle shared by every controller. `close()` only starts closing; a controller may need
/// further `do_work()` calls to drain in-flight requests before `is_closed()` reports true.
pub trait Controller: Send {
    fn close(&mut self);
    fn is_closed(&self) -> bool;
    fn is_failed(&self) -> bool;
}

/// Sends one Poll or Vote request to a peer.
pub trait ElectionController<R>: Controller {
    fn open(&mut self, request: R);
    fn do_work(&mut self) -> usize;

    /// The peer's answer to the current request, once it has arrived.
    fn response(&self) -> Option<ElectionResponse>;
}

/// Streams appends to a peer for as long as it is open.
pub trait ReplicationController: Controller {
    fn open(&mut self);
    fn do_work(&mut self, session: ReplicationSession<'_>) -> usize;

    /// Next append response received from the peer, if any.
    fn take_response(&mut self) -> Option<AppendResponse>;
}

/// Pushes one configuration to a peer.
pub trait ConfigureController: Controller {
    fn open(&mut self, request: ConfigureRequest);
    fn do_work(&mut self) -> usize;
    fn response(&self) -> Option<ConfigureResponse>;
}

/// The member registry: builds the controllers for each peer that joins the member table.
pub trait ControllerFactory: Send {
    fn poll_controller(&self, peer: &ReplicaId) -> Box<dyn ElectionController<PollRequest>>;
    fn vote_controller(&self, peer: &ReplicaId) -> Box<dyn ElectionController<VoteRequest>>;
    fn replication_controller(&self, peer: &ReplicaId) -> Box<dyn ReplicationController>;
    fn configure_controller(&self, peer: &ReplicaId) -> Box<dyn ConfigureController>;
}

/// ReplicationCursor is a peer's log reader: the position of the last entry believed to be on the
/// peer. The next append carries this entry as its previous entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicationCursor {
    previous: Option<Position>,
}

impl ReplicationCursor {
    pub fn previous(&self) -> Option<Position> {
        self.previous
    }

    pub(crate) fn seek(&mut self, previous: Option<Position>) {
        self.previous = previous;
    }
}

/// Everything a replication controller may see while the leader drives it.
pub struct ReplicationSession<'a> {
    pub term: Term,
    pub leader: &'a ReplicaId,
    pub commit_position: Option<Position>,
    pub log: &'a ReplicatedLogBuffer,
    pub cursor: &'a mut ReplicationCursor,
}

impl<'a> ReplicationSession<'a> {
    /// Builds the next append from the cursor (at most `max_entries` durable entries; empty for a
    /// heartbeat) and advances the cursor past the entries it carries.
    pub fn next_request(&mut self, max_entries: usize) -> Result<AppendRequest, LogBufferError> {
        let previous = self.cursor.previous();
        let previous_entry = match previous {
            Some(position) => match self.log.entry_id(position)? {
                Some(id) => Some(id),
                // Cursor points past our own log; restart from the end of it.
                None => {
                    self.cursor.seek(self.log.last_written().map(|e| e.position));
                    self.log.last_written()
                }
            },
            None => None,
        };

        let entries: Vec<LogEntry> = self
            .log
            .entries_after(previous_entry.map(|e| e.position), max_entries)?;
        if let Some(last) = entries.last() {
            self.cursor.seek(Some(last.position));
        }

        Ok(AppendRequest {
            term: self.term,
            leader: self.leader.clone(),
            previous_entry,
            commit_position: self.commit_position,
            entries,
        })
    }
}

/// Pollable state of a leader-side service.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Pending,
    Running,
    Failed,
}

/// The leader's log-stream lifecycle: the local append path ("controller") and the service that
/// exposes the log to client operations. Start/stop calls only initiate; progress is polled.
pub trait LogStreamServices: Send {
    fn start_controller(&mut self);
    fn stop_controller(&mut self);
    fn controller_state(&self) -> ServiceState;

    fn install_service(&mut self);
    fn remove_service(&mut self);
    fn service_state(&self) -> ServiceState;
}

/// LogStreamServices whose transitions complete immediately.
#[derive(Debug)]
pub struct ImmediateLogStreamServices {
    controller: ServiceState,
    service: ServiceState,
}

impl Default for ImmediateLogStreamServices {
    fn default() -> Self {
        ImmediateLogStreamServices {
            controller: ServiceState::Stopped,
            service: ServiceState::Stopped,
        }
    }
}

impl LogStreamServices for ImmediateLogStreamServices {
    fn start_controller(&mut self) {
        self.controller = ServiceState::Running;
    }

    fn stop_controller(&mut self) {
        self.controller = ServiceState::Stopped;
    }

    fn controller_state(&self) -> ServiceState {
        self.controller
    }

    fn install_service(&mut self) {
        self.service = ServiceState::Running;
    }

    fn remove_service(&mut self) {
        self.service = ServiceState::Stopped;
    }

    fn service_state(&self) -> ServiceState {
        self.service
    }
}
