use crate::api::{ReplicaOptions, ReplicaOptionsValidated};
use crate::commitlog::{BlockIndex, EntryId, EntryKind, LogEntry, LogStorage, Position};
use crate::replica::commit_stream::{self, CommitStream, CommitStreamPublisher};
use crate::replica::controllers::{ControllerFactory, LogStreamServices};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::log_buffer::{LogBufferError, ReplicatedLogBuffer};
use crate::replica::peers::{Configuration, ReplicaId};
use crate::replica::replica_api::{
    AppendEntryError, AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, ElectionResponse,
    MembershipFuture, MembershipRequest, PollRequest, RpcError, VoteRequest,
};
use crate::replica::replica_state::{ReplicaState, ReplicaStateParts};
use crate::replica::roles::{Lifecycle, Role, RoleKind};
use crate::replica::state_change_listener::{self, RoleChangeListener, RoleSnapshot};
use crate::replica::time::Clock;
use bytes::Bytes;
use std::convert::TryFrom;
use std::sync::Arc;

// Bound on do_work() rounds spent draining a closing role within one tick.
const MAX_CLOSE_ROUNDS: usize = 8;

pub struct ReplicaConfig {
    pub my_replica_id: ReplicaId,
    /// Bootstrap membership for a brand new cluster. `None` starts the replica inactive, waiting
    /// for a leader to add it.
    pub initial_members: Option<Vec<ReplicaId>>,
    pub storage: Box<dyn LogStorage>,
    pub block_index: Box<dyn BlockIndex>,
    pub local_state: Box<dyn PersistentLocalState>,
    pub controller_factory: Box<dyn ControllerFactory>,
    pub log_stream_services: Box<dyn LogStreamServices>,
    pub clock: Arc<dyn Clock>,
    pub logger: slog::Logger,
    pub options: ReplicaOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicaCreationError {
    #[error("Illegal options for configuring replica: {0}")]
    IllegalOptions(&'static str),
    #[error("Replica {0:?} is not one of the initial members")]
    MeNotInCluster(ReplicaId),
    #[error("Log initialization failure")]
    LogInitialization(#[from] LogBufferError),
}

pub fn create_replica(
    config: ReplicaConfig,
) -> Result<(Replica, CommitStream, RoleChangeListener), ReplicaCreationError> {
    let options = ReplicaOptionsValidated::try_from(config.options).map_err(ReplicaCreationError::IllegalOptions)?;
    let me = config.my_replica_id;
    if let Some(members) = &config.initial_members {
        if !members.contains(&me) {
            return Err(ReplicaCreationError::MeNotInCluster(me));
        }
    }

    let log = ReplicatedLogBuffer::open(
        config.logger.clone(),
        config.storage,
        config.block_index,
        config.clock.clone(),
        options.log_buffer_capacity,
        options.flush_interval,
    )?;

    let (role_notifier, role_listener) = state_change_listener::new(RoleSnapshot::Inactive);
    let (commit_stream_publisher, commit_stream) = commit_stream::new();

    let mut state = ReplicaState::new(
        ReplicaStateParts {
            logger: config.logger,
            me,
            local_state: config.local_state,
            log,
            services: config.log_stream_services,
            options,
            clock: config.clock,
            controller_factory: config.controller_factory,
        },
        role_notifier,
    );

    let mut role = Role::new(RoleKind::Inactive, &state);
    role.open(&mut state);
    if let Some(members) = config.initial_members {
        state.apply_configuration(Configuration::new(None, members));
        state.request_transition(RoleKind::Follower);
    }

    let replica = Replica {
        state,
        role,
        commit_stream_publisher,
        last_applied: None,
    };

    Ok((replica, commit_stream, role_listener))
}

/// Replica is one member's consensus state machine. It is synchronous and single threaded: the
/// embedding driver feeds it RPCs and calls `do_work()` periodically.
pub struct Replica {
    pub(crate) state: ReplicaState,
    role: Role,
    commit_stream_publisher: CommitStreamPublisher,
    last_applied: Option<Position>,
}

impl Replica {
    /// One tick: finishes any pending role transition, drives the current role, then applies
    /// newly committed entries. Returns the amount of work done.
    pub fn do_work(&mut self) -> usize {
        let mut work = self.transition();
        work += self.role.do_work(&mut self.state);

        match self.apply_committed_entries() {
            Ok(applied) => work += applied,
            Err(e) => slog::warn!(self.state.logger, "Failed to apply committed entries: {:?}", e),
        }

        work
    }

    fn transition(&mut self) -> usize {
        let target = match self.state.pending_transition() {
            Some(target) => target,
            None => return 0,
        };

        if self.role.lifecycle() == Lifecycle::Open {
            slog::info!(self.state.logger, "Closing {:?} to become {:?}", self.role.kind(), target);
            self.role.close(&mut self.state);
        }

        let mut work = 0;
        for _ in 0..MAX_CLOSE_ROUNDS {
            if self.role.lifecycle() == Lifecycle::Closed {
                break;
            }
            work += self.role.do_work(&mut self.state);
        }
        if self.role.lifecycle() != Lifecycle::Closed {
            // Still draining; try again next tick.
            return work;
        }

        if let Some(target) = self.state.complete_transition() {
            self.role = Role::new(target, &self.state);
            self.role.open(&mut self.state);
            work += 1;
        }

        work
    }

    /// Publishes committed entries past the last applied one, in order and bounded per tick.
    fn apply_committed_entries(&mut self) -> Result<usize, LogBufferError> {
        let commit_position = match self.state.commit_position() {
            Some(position) => position,
            None => return Ok(0),
        };
        // Never apply past what is durable here.
        let durable = self.state.log.last_written().map(|e| e.position);
        let applicable = match durable {
            Some(durable) => std::cmp::min(commit_position, durable),
            None => return Ok(0),
        };
        if self.last_applied.map_or(false, |applied| applied >= applicable) {
            return Ok(0);
        }

        let max_entries = self.state.options.max_entries_per_tick;
        let entries = self.state.log.entries_after(self.last_applied, max_entries)?;

        let mut applied = 0;
        for entry in entries.into_iter().take_while(|e| e.position <= applicable) {
            self.apply(entry);
            applied += 1;
        }

        Ok(applied)
    }

    fn apply(&mut self, entry: LogEntry) {
        let id = entry.id();
        match entry.kind {
            EntryKind::Initialize => {}
            EntryKind::Data => {
                self.commit_stream_publisher
                    .notify_commit(&self.state.logger, entry.term, entry.position, entry.data);
            }
            EntryKind::Configuration => match entry.members() {
                Ok(members) => {
                    self.state.apply_configuration(Configuration::new(Some(id), members));
                }
                Err(e) => slog::error!(self.state.logger, "Skipping malformed configuration entry {:?}: {:?}", id, e),
            },
        }
        self.last_applied = Some(id.position);
    }

    // ------- RPCs -------

    pub fn poll(&mut self, request: PollRequest) -> Result<ElectionResponse, RpcError> {
        self.role.poll(&mut self.state, request)
    }

    pub fn vote(&mut self, request: VoteRequest) -> Result<ElectionResponse, RpcError> {
        self.role.vote(&mut self.state, request)
    }

    pub fn append(&mut self, request: AppendRequest) -> Result<AppendResponse, RpcError> {
        self.role.append(&mut self.state, request)
    }

    pub fn configure(&mut self, request: ConfigureRequest) -> Result<ConfigureResponse, RpcError> {
        self.role.configure(&mut self.state, request)
    }

    pub fn join(&mut self, request: MembershipRequest) -> Result<MembershipFuture, RpcError> {
        self.role.join(&mut self.state, request)
    }

    pub fn leave(&mut self, request: MembershipRequest) -> Result<MembershipFuture, RpcError> {
        self.role.leave(&mut self.state, request)
    }

    /// Client entry point: stages `data` on the leader. Returns the position it will commit at,
    /// unless leadership is lost first.
    pub fn append_entry(&mut self, data: Bytes) -> Result<Position, AppendEntryError> {
        self.role.append_entry(&mut self.state, data)
    }

    /// Feeds the leader a member's append response received outside its replication controllers.
    pub fn appended(&mut self, response: AppendResponse) -> Result<(), RpcError> {
        self.role.appended(&mut self.state, response)
    }

    // ------- Inspection -------

    pub fn me(&self) -> &ReplicaId {
        &self.state.me
    }

    pub fn role(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn term(&self) -> Term {
        self.state.term()
    }

    pub fn leader(&self) -> Option<&ReplicaId> {
        self.state.leader()
    }

    pub fn commit_position(&self) -> Option<Position> {
        self.state.commit_position()
    }

    pub fn configuration(&self) -> &Configuration {
        self.state.configuration()
    }

    /// Last durable entry.
    pub fn last_entry(&self) -> Option<EntryId> {
        self.state.last_entry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{InMemoryBlockIndex, InMemoryStorage};
    use crate::replica::test_utils::{test_logger, FakeControllerFactory, TestHarness};
    use crate::replica::{mocked_clock, ImmediateLogStreamServices, VolatileLocalState};
    use tokio::time::Duration;

    fn config(me: &str, initial_members: Option<Vec<&str>>) -> ReplicaConfig {
        let (clock, _controller) = mocked_clock();
        ReplicaConfig {
            my_replica_id: ReplicaId::new(me),
            initial_members: initial_members.map(|m| m.into_iter().map(ReplicaId::new).collect()),
            storage: Box::new(InMemoryStorage::new()),
            block_index: Box::new(InMemoryBlockIndex::new()),
            local_state: Box::new(VolatileLocalState::new(ReplicaId::new(me))),
            controller_factory: Box::new(FakeControllerFactory::new()),
            log_stream_services: Box::new(ImmediateLogStreamServices::default()),
            clock: Arc::new(clock),
            logger: test_logger(),
            options: ReplicaOptions::default(),
        }
    }

    #[test]
    fn rejects_bootstrap_without_me() {
        let result = create_replica(config("me", Some(vec!["a", "b"])));
        assert!(matches!(result, Err(ReplicaCreationError::MeNotInCluster(_))));
    }

    #[test]
    fn rejects_illegal_options() {
        let mut config = config("me", None);
        config.options.tick_interval = Some(Duration::from_secs(1));
        assert!(matches!(
            create_replica(config),
            Err(ReplicaCreationError::IllegalOptions(_))
        ));
    }

    #[test]
    fn bootstrap_starts_as_follower_of_initial_members() {
        let (mut replica, _commit_stream, roles) = create_replica(config("me", Some(vec!["me", "a", "b"]))).unwrap();
        assert_eq!(replica.role(), RoleKind::Inactive);

        replica.do_work();

        assert_eq!(replica.role(), RoleKind::Follower);
        assert_eq!(replica.configuration().entry, None);
        assert_eq!(replica.configuration().members.len(), 3);
        assert_eq!(roles.current(), RoleSnapshot::Follower { leader: None });
    }

    #[test]
    fn applies_committed_entries_in_order() {
        // -- setup --
        let mut harness = TestHarness::new("me", &["me", "a", "b"]);
        let entries = vec![
            LogEntry::initialize(Position::new(1), Term::new(1)),
            LogEntry::data(Position::new(2), Term::new(1), Bytes::from_static(b"one")),
            LogEntry::configuration(
                Position::new(3),
                Term::new(1),
                &[ReplicaId::new("me"), ReplicaId::new("a"), ReplicaId::new("b"), ReplicaId::new("c")],
            ),
            LogEntry::data(Position::new(4), Term::new(1), Bytes::from_static(b"two")),
        ];

        // -- execute -- commit stops short of the last entry
        harness
            .replica
            .append(AppendRequest {
                term: Term::new(1),
                leader: ReplicaId::new("a"),
                previous_entry: None,
                commit_position: Some(Position::new(3)),
                entries,
            })
            .unwrap();
        harness.tick();

        // -- verify --
        let first = harness.commit_stream.try_next().unwrap();
        assert_eq!((first.position, first.data), (Position::new(2), Bytes::from_static(b"one")));
        assert!(harness.commit_stream.try_next().is_none());
        assert_eq!(harness.replica.configuration().members.len(), 4);
        assert_eq!(harness.replica.last_applied, Some(Position::new(3)));
    }

    #[test]
    fn removal_from_committed_configuration_makes_follower_inactive() {
        let mut harness = TestHarness::new("me", &["me", "a", "b"]);
        harness
            .replica
            .append(AppendRequest {
                term: Term::new(1),
                leader: ReplicaId::new("a"),
                previous_entry: None,
                commit_position: Some(Position::new(1)),
                entries: vec![LogEntry::configuration(
                    Position::new(1),
                    Term::new(1),
                    &[ReplicaId::new("a"), ReplicaId::new("b")],
                )],
            })
            .unwrap();

        harness.tick();
        harness.tick();

        assert_eq!(harness.replica.role(), RoleKind::Inactive);
        assert_eq!(harness.roles.current(), RoleSnapshot::Inactive);
    }

    #[test]
    fn publishes_a_bounded_number_of_entries_per_tick() {
        let mut harness = TestHarness::new("me", &["me", "a", "b"]);
        let entries = (1..=100)
            .map(|p| LogEntry::data(Position::new(p), Term::new(1), Bytes::from(format!("{}", p))))
            .collect();
        harness
            .replica
            .append(AppendRequest {
                term: Term::new(1),
                leader: ReplicaId::new("a"),
                previous_entry: None,
                commit_position: Some(Position::new(100)),
                entries,
            })
            .unwrap();

        harness.tick();
        let mut published = 0;
        while harness.commit_stream.try_next().is_some() {
            published += 1;
        }
        assert_eq!(published, 64);

        harness.tick();
        while harness.commit_stream.try_next().is_some() {
            published += 1;
        }
        assert_eq!(published, 100);
    }
}
