use crate::api::ReplicaOptionsValidated;
use crate::commitlog::{EntryId, Position};
use crate::replica::controllers::{ControllerFactory, LogStreamServices};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::log_buffer::ReplicatedLogBuffer;
use crate::replica::peers::{majority, Configuration, MemberTable, ReplicaId};
use crate::replica::roles::RoleKind;
use crate::replica::state_change_listener::{RoleChangeNotifier, RoleSnapshot};
use crate::replica::time::Clock;
use crate::replica::timers::RandomizedTimeout;
use std::sync::Arc;
use tokio::time::Instant;

/// ReplicaState is everything the roles share. Exactly one role holds `&mut ReplicaState` at a
/// time; roles never keep copies of these fields.
pub(crate) struct ReplicaState {
    pub(crate) logger: slog::Logger,
    pub(crate) me: ReplicaId,
    local_state: Box<dyn PersistentLocalState>,
    leader: Option<ReplicaId>,
    configuration: Configuration,
    pub(crate) members: MemberTable,
    pub(crate) log: ReplicatedLogBuffer,
    commit_position: Option<Position>,
    pub(crate) services: Box<dyn LogStreamServices>,
    pub(crate) options: ReplicaOptionsValidated,
    clock: Arc<dyn Clock>,
    controller_factory: Box<dyn ControllerFactory>,
    role: RoleKind,
    pending_transition: Option<RoleKind>,
    role_notifier: RoleChangeNotifier,
}

pub(crate) struct ReplicaStateParts {
    pub logger: slog::Logger,
    pub me: ReplicaId,
    pub local_state: Box<dyn PersistentLocalState>,
    pub log: ReplicatedLogBuffer,
    pub services: Box<dyn LogStreamServices>,
    pub options: ReplicaOptionsValidated,
    pub clock: Arc<dyn Clock>,
    pub controller_factory: Box<dyn ControllerFactory>,
}

impl ReplicaState {
    pub(crate) fn new(parts: ReplicaStateParts, role_notifier: RoleChangeNotifier) -> Self {
        ReplicaState {
            logger: parts.logger,
            me: parts.me,
            local_state: parts.local_state,
            leader: None,
            configuration: Configuration::default(),
            members: MemberTable::default(),
            log: parts.log,
            commit_position: None,
            services: parts.services,
            options: parts.options,
            clock: parts.clock,
            controller_factory: parts.controller_factory,
            role: RoleKind::Inactive,
            pending_transition: None,
            role_notifier,
        }
    }

    // ------- Term & leader -------

    pub(crate) fn term(&self) -> Term {
        self.local_state.current_term()
    }

    pub(crate) fn leader(&self) -> Option<&ReplicaId> {
        self.leader.as_ref()
    }

    /// Adopts `term`/`leader` if the term is newer, or if it's the current term and it names a
    /// leader we didn't know about. Returns true when the caller should step down to follower.
    pub(crate) fn update_term_and_leader(&mut self, term: Term, leader: Option<&ReplicaId>) -> bool {
        let current_term = self.term();
        if term > current_term {
            self.local_state.store_term_if_increased(term);
            self.leader = leader.cloned();
            slog::info!(
                self.logger,
                "Term {:?} -> {:?}, leader {:?}",
                current_term,
                term,
                self.leader
            );
            self.notify_leader_discovered();
            true
        } else if term == current_term && self.leader.is_none() && leader.is_some() {
            self.leader = leader.cloned();
            slog::info!(self.logger, "Discovered leader {:?} for term {:?}", self.leader, term);
            self.notify_leader_discovered();
            true
        } else {
            false
        }
    }

    /// Starts a new election term: term + 1, vote for self, no leader.
    pub(crate) fn increment_term_and_vote_for_self(&mut self) -> Term {
        let term = self.local_state.increment_term_and_vote_for_self();
        self.leader = None;
        term
    }

    pub(crate) fn claim_leadership(&mut self) {
        self.leader = Some(self.me.clone());
    }

    pub(crate) fn voted_for(&self) -> Option<ReplicaId> {
        self.local_state.voted_for_current_term().1
    }

    /// Persists a vote for `candidate` in `term`. False if we already voted this term.
    pub(crate) fn store_vote(&mut self, term: Term, candidate: ReplicaId) -> bool {
        self.local_state.store_vote_for_term_if_unvoted(term, candidate)
    }

    fn notify_leader_discovered(&self) {
        if self.role == RoleKind::Follower {
            self.role_notifier.notify_new_state(RoleSnapshot::Follower {
                leader: self.leader.clone(),
            });
        }
    }

    // ------- Membership -------

    pub(crate) fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Adopts `configuration` if it is newer than the current one. Returns true if adopted. A
    /// replica that is no longer a member goes inactive.
    pub(crate) fn apply_configuration(&mut self, configuration: Configuration) -> bool {
        if !self.configuration.is_superseded_by(&configuration) {
            return false;
        }

        slog::info!(
            self.logger,
            "Configuration {:?} -> {:?}",
            self.configuration.entry,
            configuration
        );
        let now = self.now();
        self.members.rebuild(
            &self.me,
            &configuration.members,
            self.controller_factory.as_ref(),
            now,
        );
        self.configuration = configuration;

        if !self.configuration.contains(&self.me) && self.role != RoleKind::Inactive {
            slog::info!(self.logger, "Removed from the cluster");
            self.request_transition(RoleKind::Inactive);
        }
        true
    }

    pub(crate) fn cluster_size(&self) -> usize {
        self.configuration.members.len().max(1)
    }

    pub(crate) fn quorum_size(&self) -> usize {
        majority(self.cluster_size())
    }

    pub(crate) fn is_singleton(&self) -> bool {
        self.members.is_empty()
    }

    // ------- Log -------

    pub(crate) fn last_entry(&self) -> Option<EntryId> {
        self.log.last_written()
    }

    pub(crate) fn commit_position(&self) -> Option<Position> {
        self.commit_position
    }

    /// Commit position only moves forward.
    pub(crate) fn ratchet_commit_position(&mut self, position: Position) -> bool {
        if self.commit_position.map_or(true, |current| position > current) {
            slog::debug!(self.logger, "Commit position {:?} -> {:?}", self.commit_position, position);
            self.commit_position = Some(position);
            true
        } else {
            false
        }
    }

    // ------- Time -------

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn heartbeat_timeout(&self) -> RandomizedTimeout {
        RandomizedTimeout::new(self.options.heartbeat_timeout, self.options.heartbeat_jitter)
    }

    pub(crate) fn election_timeout(&self) -> RandomizedTimeout {
        RandomizedTimeout::new(self.options.election_timeout, self.options.election_jitter)
    }

    // ------- Roles -------

    pub(crate) fn role(&self) -> RoleKind {
        self.role
    }

    pub(crate) fn request_transition(&mut self, target: RoleKind) {
        if target == self.role && self.pending_transition.is_none() {
            return;
        }
        if self.pending_transition != Some(target) {
            slog::info!(self.logger, "Requesting transition {:?} -> {:?}", self.role, target);
        }
        self.pending_transition = Some(target);
    }

    pub(crate) fn pending_transition(&self) -> Option<RoleKind> {
        self.pending_transition
    }

    pub(crate) fn complete_transition(&mut self) -> Option<RoleKind> {
        let target = self.pending_transition.take()?;
        self.role = target;
        Some(target)
    }

    pub(crate) fn notify_role_opened(&self) {
        let snapshot = match self.role {
            RoleKind::Inactive => RoleSnapshot::Inactive,
            RoleKind::Follower => RoleSnapshot::Follower {
                leader: self.leader.clone(),
            },
            RoleKind::Candidate => RoleSnapshot::Candidate,
            RoleKind::Leader => RoleSnapshot::Leader,
        };
        self.role_notifier.notify_new_state(snapshot);
    }
}
