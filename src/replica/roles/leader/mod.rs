mod append;
mod configuration;

use crate::commitlog::{next_position, EntryId, LogEntry, Position};
use crate::replica::controllers::{ReplicationSession, ServiceState};
use crate::replica::peers::Member;
use crate::replica::raft_rpcs;
use crate::replica::replica_api::{
    AppendEntryError, AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, ElectionResponse,
    MembershipFuture, MembershipRequest, MembershipResponse, PollRequest, RpcError, VoteRequest,
};
use crate::replica::replica_state::ReplicaState;
use crate::replica::roles::{drive, Lifecycle, RoleKind, Step};
use crate::replica::{ReplicaId, Term};
use append::{AppendController, AppendState};
use bytes::Bytes;
use configuration::ConfigurationController;
use std::collections::HashMap;

/// Establishing (and later tearing down) a term's leadership.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LeadershipState {
    Closed,
    StartLogStreamController,
    OpeningLogStreamController,
    OpenAppendController,
    AppendInitialEntry,
    OpenConfigurationController,
    AppendConfigurationEntry,
    InstallLogStreamService,
    InstallingLogStreamService,
    Initialized,
    RemoveLogStreamService,
    RemovingLogStreamService,
    StopLogStreamController,
    StoppingLogStreamController,
    CloseAppendController,
    ClosingAppendController,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ReplicationState {
    Closed,
    Open,
    CloseReplications,
    ClosingReplications,
}

/// Pushes of the current configuration to members.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConfigureState {
    Closed,
    Open,
    CloseConfigure,
    ClosingConfigure,
}

pub(crate) struct Leader {
    lifecycle: Lifecycle,
    leadership: LeadershipState,
    replication: ReplicationState,
    configure: ConfigureState,
    append: AppendController,
    configuration: ConfigurationController,
    /// Position of this term's initial entry; nothing before it is committed by counting.
    leader_position: Option<Position>,
    // Configuration entry currently being pushed to each member.
    pushing: HashMap<ReplicaId, EntryId>,
    // Removed members still owed the configuration that removed them.
    departing: Vec<Member>,
}

impl Leader {
    pub(super) fn new() -> Self {
        Leader {
            lifecycle: Lifecycle::Closed,
            leadership: LeadershipState::Closed,
            replication: ReplicationState::Closed,
            configure: ConfigureState::Closed,
            append: AppendController::new(),
            configuration: ConfigurationController::new(),
            leader_position: None,
            pushing: HashMap::new(),
            departing: Vec::new(),
        }
    }

    pub(super) fn open(&mut self, state: &mut ReplicaState) {
        assert_eq!(self.lifecycle, Lifecycle::Closed, "Opened a role that wasn't closed");
        self.lifecycle = Lifecycle::Open;
        state.claim_leadership();
        slog::info!(state.logger, "Leading term {:?}", state.term());

        let now = state.now();
        for member in state.members.iter_mut() {
            member.reset_progress(now);
        }
        self.leader_position = None;
        self.leadership = LeadershipState::StartLogStreamController;
        self.replication = ReplicationState::Open;
        self.configure = ConfigureState::Open;
        state.notify_role_opened();
    }

    pub(super) fn do_work(&mut self, state: &mut ReplicaState) -> usize {
        let mut work = self.configuration.do_work(state);
        work += drive(state, |state| self.replication_step(state));
        work += drive(state, |state| self.configure_step(state));
        work += drive(state, |state| self.leadership_step(state));

        // While establishing leadership the sub-machine owns the controller's outcome.
        let completed = self.configuration.is_configured() || self.configuration.is_failed();
        if completed && self.leadership != LeadershipState::AppendConfigurationEntry {
            self.configuration.close(state);
            work += 1;
        }

        if state.log.has_buffered_entries() && state.log.should_flush() {
            match state.log.flush() {
                Ok(_) => work += 1,
                Err(e) => slog::warn!(state.logger, "Flush failed, entries stay buffered: {:?}", e),
            }
        }

        if state.is_singleton() {
            if let Some(last) = state.last_entry() {
                self.commit_entry(state, last.position);
            }
        }

        if self.lifecycle == Lifecycle::Closing && self.is_drained() {
            self.lifecycle = Lifecycle::Closed;
        }

        work
    }

    pub(super) fn close(&mut self, state: &mut ReplicaState) {
        if self.lifecycle != Lifecycle::Open {
            return;
        }
        self.lifecycle = Lifecycle::Closing;
        slog::info!(state.logger, "Giving up leadership of term {:?}", state.term());

        self.leadership = match self.leadership {
            LeadershipState::Closed | LeadershipState::StartLogStreamController => LeadershipState::Closed,
            LeadershipState::OpeningLogStreamController
            | LeadershipState::OpenAppendController
            | LeadershipState::AppendInitialEntry
            | LeadershipState::OpenConfigurationController
            | LeadershipState::AppendConfigurationEntry => LeadershipState::StopLogStreamController,
            LeadershipState::InstallLogStreamService
            | LeadershipState::InstallingLogStreamService
            | LeadershipState::Initialized => LeadershipState::RemoveLogStreamService,
            closing => closing,
        };
        if self.replication == ReplicationState::Open {
            self.replication = ReplicationState::CloseReplications;
        }
        if self.configure == ConfigureState::Open {
            self.configure = ConfigureState::CloseConfigure;
        }
        // A change applied by the last tick still counts as a success.
        self.configuration.do_work(state);
        self.configuration.close(state);
    }

    pub(super) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn is_drained(&self) -> bool {
        self.leadership == LeadershipState::Closed
            && self.replication == ReplicationState::Closed
            && self.configure == ConfigureState::Closed
            && self.configuration.is_closed()
    }

    fn abort(&self, state: &ReplicaState, reason: &str) -> Step {
        slog::warn!(state.logger, "Abandoning leadership of term {:?}: {}", state.term(), reason);
        Step::TransitionTo(RoleKind::Follower)
    }

    // ------- Leadership -------

    fn leadership_step(&mut self, state: &mut ReplicaState) -> Step {
        match self.leadership {
            LeadershipState::Closed | LeadershipState::Initialized => Step::Stay,
            LeadershipState::StartLogStreamController => {
                state.services.start_controller();
                self.leadership = LeadershipState::OpeningLogStreamController;
                Step::Advance
            }
            LeadershipState::OpeningLogStreamController => match state.services.controller_state() {
                ServiceState::Running => {
                    self.leadership = LeadershipState::OpenAppendController;
                    Step::Advance
                }
                ServiceState::Failed => self.abort(state, "log stream controller failed to start"),
                _ => Step::Stay,
            },
            LeadershipState::OpenAppendController => {
                self.append.open(state);
                self.leadership = LeadershipState::AppendInitialEntry;
                Step::Advance
            }
            LeadershipState::AppendInitialEntry => {
                self.append.do_work(state);
                match *self.append.state() {
                    AppendState::Appended(id) => {
                        self.leader_position = Some(id.position);
                        self.leadership = LeadershipState::OpenConfigurationController;
                        Step::Advance
                    }
                    AppendState::Failed => self.abort(state, "initial entry could not be written"),
                    _ => Step::Stay,
                }
            }
            LeadershipState::OpenConfigurationController => {
                let members = state.configuration().members.clone();
                self.configuration.open(state, members, None);
                self.leadership = LeadershipState::AppendConfigurationEntry;
                Step::Advance
            }
            LeadershipState::AppendConfigurationEntry => {
                if self.configuration.is_configured() {
                    self.leadership = LeadershipState::InstallLogStreamService;
                    Step::Advance
                } else if self.configuration.is_failed() {
                    self.abort(state, "configuration entry could not be written")
                } else {
                    Step::Stay
                }
            }
            LeadershipState::InstallLogStreamService => {
                state.services.install_service();
                self.leadership = LeadershipState::InstallingLogStreamService;
                Step::Advance
            }
            LeadershipState::InstallingLogStreamService => match state.services.service_state() {
                ServiceState::Running => {
                    slog::info!(
                        state.logger,
                        "Leadership of term {:?} established at {:?}",
                        state.term(),
                        self.leader_position
                    );
                    self.leadership = LeadershipState::Initialized;
                    Step::Advance
                }
                ServiceState::Failed => self.abort(state, "log stream service failed to install"),
                _ => Step::Stay,
            },
            LeadershipState::RemoveLogStreamService => {
                state.services.remove_service();
                self.leadership = LeadershipState::RemovingLogStreamService;
                Step::Advance
            }
            LeadershipState::RemovingLogStreamService => match state.services.service_state() {
                ServiceState::Stopped | ServiceState::Failed => {
                    self.leadership = LeadershipState::StopLogStreamController;
                    Step::Advance
                }
                _ => Step::Stay,
            },
            LeadershipState::StopLogStreamController => {
                state.services.stop_controller();
                self.leadership = LeadershipState::StoppingLogStreamController;
                Step::Advance
            }
            LeadershipState::StoppingLogStreamController => match state.services.controller_state() {
                ServiceState::Stopped | ServiceState::Failed => {
                    self.leadership = LeadershipState::CloseAppendController;
                    Step::Advance
                }
                _ => Step::Stay,
            },
            LeadershipState::CloseAppendController => {
                self.append.close();
                self.leadership = LeadershipState::ClosingAppendController;
                Step::Advance
            }
            LeadershipState::ClosingAppendController => {
                if *self.append.state() == AppendState::Closed {
                    self.leadership = LeadershipState::Closed;
                    Step::Advance
                } else {
                    Step::Stay
                }
            }
        }
    }

    // ------- Replication -------

    fn replication_step(&mut self, state: &mut ReplicaState) -> Step {
        match self.replication {
            ReplicationState::Closed => Step::Stay,
            ReplicationState::Open => {
                let responses = self.drive_replications(state);
                for response in responses {
                    if let Step::TransitionTo(target) = self.appended(state, response) {
                        return Step::TransitionTo(target);
                    }
                }
                Step::Stay
            }
            ReplicationState::CloseReplications => {
                for member in state.members.iter_mut() {
                    member.replication.close();
                }
                self.replication = ReplicationState::ClosingReplications;
                Step::Advance
            }
            ReplicationState::ClosingReplications => {
                let term = state.term();
                let commit_position = state.commit_position();
                let mut all_closed = true;
                for member in state.members.iter_mut() {
                    if !member.replication.is_closed() {
                        member.replication.do_work(ReplicationSession {
                            term,
                            leader: &state.me,
                            commit_position,
                            log: &state.log,
                            cursor: &mut member.cursor,
                        });
                        all_closed &= member.replication.is_closed();
                    }
                }

                if all_closed {
                    self.replication = ReplicationState::Closed;
                    Step::Advance
                } else {
                    Step::Stay
                }
            }
        }
    }

    /// Opens replication to members that don't have it yet and drives every session once.
    fn drive_replications(&mut self, state: &mut ReplicaState) -> Vec<AppendResponse> {
        let term = state.term();
        let commit_position = state.commit_position();
        let last_written = state.log.last_written();

        let mut responses = Vec::new();
        for member in state.members.iter_mut() {
            if member.replication.is_closed() {
                slog::debug!(state.logger, "Replicating to {:?} from {:?}", member.id(), last_written);
                member.reset_reader_to_last_entry(last_written);
                member.replication.open();
            }

            let session = ReplicationSession {
                term,
                leader: &state.me,
                commit_position,
                log: &state.log,
                cursor: &mut member.cursor,
            };
            member.replication.do_work(session);

            while let Some(response) = member.replication.take_response() {
                responses.push(response);
            }
        }

        responses
    }

    /// Processes a member's append response: its progress, possibly a new commit position, or
    /// news of a newer term.
    pub(super) fn appended(&mut self, state: &mut ReplicaState, response: AppendResponse) -> Step {
        let term = state.term();
        if response.term < term {
            return Step::Stay;
        }
        if response.term > term {
            state.update_term_and_leader(response.term, None);
            return self.abort(state, "member reported a newer term");
        }

        let now = state.now();
        let member = match state.members.get_mut(&response.member) {
            Some(member) => member,
            None => return Step::Stay,
        };
        member.last_contact = now;

        if response.succeeded {
            member.failures = 0;
            if response.position > member.match_position {
                member.match_position = response.position;
            }
            if let Some(position) = response.position {
                self.commit_entry(state, position);
            }
        } else {
            member.failures += 1;
            slog::debug!(
                state.logger,
                "Append to {:?} failed at {:?} ({} in a row)",
                response.member,
                response.position,
                member.failures
            );
            member.reset_reader_to_previous_entry(response.position);
        }

        Step::Stay
    }

    /// Only entries of this term may be committed by counting replicas. Everything before them
    /// is committed along with them.
    fn can_commit(&self, state: &ReplicaState, position: Position) -> bool {
        let leader_position = match self.leader_position {
            Some(position) => position,
            None => return false,
        };
        position >= leader_position && state.commit_position().map_or(true, |commit| position > commit)
    }

    fn commit_entry(&mut self, state: &mut ReplicaState, position: Position) {
        if !self.can_commit(state, position) {
            return;
        }

        let replicas = 1 + state
            .members
            .iter()
            .filter(|m| m.match_position.map_or(false, |p| p >= position))
            .count();
        if replicas >= state.quorum_size() {
            state.ratchet_commit_position(position);
        }
    }

    // ------- Configure -------

    fn configure_step(&mut self, state: &mut ReplicaState) -> Step {
        match self.configure {
            ConfigureState::Closed => Step::Stay,
            ConfigureState::Open => self.push_configuration(state),
            ConfigureState::CloseConfigure => {
                for member in state.members.iter_mut() {
                    member.configure.close();
                }
                for member in self.departing.iter_mut() {
                    member.configure.close();
                }
                self.departing.clear();
                self.pushing.clear();
                self.configure = ConfigureState::ClosingConfigure;
                Step::Advance
            }
            ConfigureState::ClosingConfigure => {
                let mut all_closed = true;
                for member in state.members.iter_mut() {
                    if !member.configure.is_closed() {
                        member.configure.do_work();
                        all_closed &= member.configure.is_closed();
                    }
                }

                if all_closed {
                    self.configure = ConfigureState::Closed;
                    Step::Advance
                } else {
                    Step::Stay
                }
            }
        }
    }

    fn push_configuration(&mut self, state: &mut ReplicaState) -> Step {
        let now = state.now();
        for mut member in state.members.take_departed() {
            slog::debug!(state.logger, "Telling {:?} it was removed", member.id());
            member.replication.close();
            member.reset_progress(now);
            self.departing.push(member);
        }

        let configuration = state.configuration().clone();
        // Rejoined since; the member table owns it again.
        self.departing.retain(|m| !configuration.contains(m.id()));
        let entry = match configuration.entry {
            Some(entry) => entry,
            // Bootstrap membership; every member already has it.
            None => return Step::Stay,
        };
        let request = ConfigureRequest {
            term: state.term(),
            configuration,
        };

        let mut newer_term = None;
        for member in state.members.iter_mut() {
            if let Push::NewerTerm(term) = push_to(member, &request, entry, &mut self.pushing) {
                newer_term = Some(term);
            }
        }

        // Departed members are dropped once they acknowledge their removal or stop answering.
        let pushing = &mut self.pushing;
        let logger = &state.logger;
        self.departing.retain_mut(|member| {
            match push_to(member, &request, entry, pushing) {
                Push::NewerTerm(term) => newer_term = Some(term),
                Push::Failed => member.failures += 1,
                Push::Pending | Push::Acknowledged => {}
            }
            if member.failures >= DEPARTED_PUSH_ATTEMPTS {
                slog::warn!(logger, "Giving up telling {:?} it was removed", member.id());
                pushing.remove(member.id());
                return false;
            }
            member.configured != Some(entry)
        });

        match newer_term {
            Some(newer_term) => {
                state.update_term_and_leader(newer_term, None);
                self.abort(state, "member reported a newer term")
            }
            None => Step::Stay,
        }
    }

    // ------- RPCs -------

    pub(super) fn poll(&mut self, state: &mut ReplicaState, request: PollRequest) -> ElectionResponse {
        raft_rpcs::handle_poll(state, &request, true)
    }

    pub(super) fn vote(&mut self, state: &mut ReplicaState, request: VoteRequest) -> ElectionResponse {
        if state.update_term_and_leader(request.term, None) {
            state.request_transition(RoleKind::Follower);
        }

        raft_rpcs::handle_vote(state, &request)
    }

    pub(super) fn append(&mut self, state: &mut ReplicaState, request: AppendRequest) -> Result<AppendResponse, RpcError> {
        let term = state.term();
        if request.term == term {
            slog::warn!(
                state.logger,
                "Rejecting append from {:?} claiming leadership of my term {:?}",
                request.leader,
                term
            );
            return Ok(raft_rpcs::failed_append(state, &request));
        }

        if state.update_term_and_leader(request.term, Some(&request.leader)) {
            state.request_transition(RoleKind::Follower);
        }
        raft_rpcs::handle_append(state, &request)
    }

    pub(super) fn configure(&mut self, state: &mut ReplicaState, request: ConfigureRequest) -> ConfigureResponse {
        if request.term > state.term() {
            state.update_term_and_leader(request.term, None);
            state.request_transition(RoleKind::Follower);
            return raft_rpcs::handle_configure(state, &request);
        }

        ConfigureResponse { term: state.term() }
    }

    pub(super) fn join(&mut self, state: &mut ReplicaState, request: MembershipRequest) -> MembershipFuture {
        if let Some(rejected) = self.reject_membership_change(state, &request) {
            return rejected;
        }
        if state.configuration().contains(&request.member) {
            return MembershipFuture::completed(self.membership_response(state, true));
        }

        let mut members = state.configuration().members.clone();
        members.push(request.member);
        self.propose(state, members)
    }

    pub(super) fn leave(&mut self, state: &mut ReplicaState, request: MembershipRequest) -> MembershipFuture {
        if let Some(rejected) = self.reject_membership_change(state, &request) {
            return rejected;
        }
        if !state.configuration().contains(&request.member) {
            return MembershipFuture::completed(self.membership_response(state, true));
        }

        let members = state
            .configuration()
            .members
            .iter()
            .filter(|m| **m != request.member)
            .cloned()
            .collect();
        self.propose(state, members)
    }

    /// One change at a time, and only once this term's leadership is established.
    fn reject_membership_change(&self, state: &ReplicaState, request: &MembershipRequest) -> Option<MembershipFuture> {
        if self.leadership == LeadershipState::Initialized && self.configuration.is_closed() {
            return None;
        }
        slog::info!(
            state.logger,
            "Rejecting membership change for {:?}: leadership {:?}, change in progress: {}",
            request.member,
            self.leadership,
            !self.configuration.is_closed()
        );
        Some(MembershipFuture::completed(self.membership_response(state, false)))
    }

    fn propose(&mut self, state: &mut ReplicaState, members: Vec<ReplicaId>) -> MembershipFuture {
        let (reply, future) = MembershipFuture::new();
        self.configuration.open(state, members, Some(reply));
        future
    }

    fn membership_response(&self, state: &ReplicaState, succeeded: bool) -> MembershipResponse {
        MembershipResponse {
            term: state.term(),
            succeeded,
            members: state.configuration().members.clone(),
            configuration_entry: state.configuration().entry,
        }
    }

    pub(super) fn append_entry(&mut self, state: &mut ReplicaState, data: Bytes) -> Result<Position, AppendEntryError> {
        if self.leadership != LeadershipState::Initialized {
            return Err(AppendEntryError::NotInitialized);
        }

        let position = next_position(state.log.last_received().map(|e| e.position));
        state.log.append(&LogEntry::data(position, state.term(), data))?;
        Ok(position)
    }
}

const DEPARTED_PUSH_ATTEMPTS: u32 = 10;

enum Push {
    Pending,
    Acknowledged,
    Failed,
    NewerTerm(Term),
}

/// Drives one configure push of `request` to `member`, reopening it if the member hasn't
/// acknowledged `entry` yet.
fn push_to(
    member: &mut Member,
    request: &ConfigureRequest,
    entry: EntryId,
    pushing: &mut HashMap<ReplicaId, EntryId>,
) -> Push {
    if member.configure.is_closed() {
        if member.configured == Some(entry) {
            return Push::Acknowledged;
        }
        member.configure.open(request.clone());
        pushing.insert(member.id().clone(), entry);
    }

    member.configure.do_work();
    if let Some(response) = member.configure.response() {
        member.configure.close();
        if response.term > request.term {
            return Push::NewerTerm(response.term);
        }
        member.configured = pushing.remove(member.id());
        Push::Acknowledged
    } else if member.configure.is_failed() {
        pushing.remove(member.id());
        member.configure.close();
        Push::Failed
    } else {
        Push::Pending
    }
}
