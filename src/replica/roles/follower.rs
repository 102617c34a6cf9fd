use crate::replica::quorum::{QuorumOutcome, QuorumTracker};
use crate::replica::raft_rpcs;
use crate::replica::replica_api::{
    AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, ElectionResponse, PollRequest, RpcError,
    VoteRequest,
};
use crate::replica::replica_state::ReplicaState;
use crate::replica::roles::{drive, Lifecycle, RoleKind, Step};
use crate::replica::timers::RandomizedTimeout;
use crate::replica::ReplicaId;
use std::collections::HashSet;
use tokio::time::Instant;

/// Pre-vote sub-machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PollState {
    Closed,
    OpenPollRequests,
    Open,
    ClosePollRequests,
    Closing,
}

pub(crate) struct Follower {
    lifecycle: Lifecycle,
    last_contact: Instant,
    heartbeat_timeout: RandomizedTimeout,
    poll_state: PollState,
    quorum: QuorumTracker,
    responded: HashSet<ReplicaId>,
    round_timeout: RandomizedTimeout,
}

impl Follower {
    pub(super) fn new(state: &ReplicaState) -> Self {
        Follower {
            lifecycle: Lifecycle::Closed,
            last_contact: state.now(),
            heartbeat_timeout: state.heartbeat_timeout(),
            poll_state: PollState::Closed,
            quorum: QuorumTracker::open(state.cluster_size()),
            responded: HashSet::new(),
            round_timeout: state.election_timeout(),
        }
    }

    pub(super) fn open(&mut self, state: &mut ReplicaState) {
        assert_eq!(self.lifecycle, Lifecycle::Closed, "Opened a role that wasn't closed");
        self.lifecycle = Lifecycle::Open;
        // Whatever we staged under another role was never acknowledged to anyone.
        state.log.discard_buffered_entries();
        self.touch(state.now());
        state.notify_role_opened();
    }

    pub(super) fn do_work(&mut self, state: &mut ReplicaState) -> usize {
        let mut work = 0;
        if state.log.has_buffered_entries() && state.log.should_flush() {
            match state.log.flush() {
                Ok(_) => work += 1,
                Err(e) => slog::warn!(state.logger, "Flush of buffered entries failed: {:?}", e),
            }
        }

        work += drive(state, |state| self.step(state));
        if self.lifecycle == Lifecycle::Closing && self.poll_state == PollState::Closed {
            self.lifecycle = Lifecycle::Closed;
        }

        work
    }

    pub(super) fn close(&mut self, _state: &mut ReplicaState) {
        if self.lifecycle != Lifecycle::Open {
            return;
        }
        self.lifecycle = Lifecycle::Closing;
        self.heartbeat_timeout.disarm();
        if matches!(self.poll_state, PollState::OpenPollRequests | PollState::Open) {
            self.poll_state = PollState::ClosePollRequests;
        }
    }

    pub(super) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    // ------- Pre-vote sub-machine -------

    fn step(&mut self, state: &mut ReplicaState) -> Step {
        match self.poll_state {
            PollState::Closed => {
                if self.lifecycle == Lifecycle::Open && self.heartbeat_timeout.is_expired(state.now()) {
                    slog::info!(
                        state.logger,
                        "No leader contact since {:?}; starting pre-vote",
                        state.now().duration_since(self.last_contact)
                    );
                    self.poll_state = PollState::OpenPollRequests;
                    Step::Advance
                } else {
                    Step::Stay
                }
            }
            PollState::OpenPollRequests => self.open_poll_requests(state),
            PollState::Open => self.drive_poll_requests(state),
            PollState::ClosePollRequests => {
                for member in state.members.iter_mut() {
                    member.poll.close();
                }
                self.poll_state = PollState::Closing;
                Step::Advance
            }
            PollState::Closing => {
                let mut all_closed = true;
                for member in state.members.iter_mut() {
                    if !member.poll.is_closed() {
                        member.poll.do_work();
                        all_closed &= member.poll.is_closed();
                    }
                }

                if all_closed {
                    self.poll_state = PollState::Closed;
                    Step::Advance
                } else {
                    Step::Stay
                }
            }
        }
    }

    fn open_poll_requests(&mut self, state: &mut ReplicaState) -> Step {
        if state.is_singleton() {
            self.poll_state = PollState::Closed;
            return Step::TransitionTo(RoleKind::Candidate);
        }

        self.quorum = QuorumTracker::open(state.cluster_size());
        self.quorum.succeed();
        self.responded.clear();

        let request = PollRequest {
            term: state.term(),
            candidate: state.me.clone(),
            last_entry: state.last_entry(),
        };
        for member in state.members.iter_mut() {
            member.poll.open(request.clone());
        }

        let timeout = self.round_timeout.arm(state.now());
        slog::debug!(state.logger, "Sent polls for term {:?}; round timeout {:?}", request.term, timeout);
        self.poll_state = PollState::Open;
        Step::Advance
    }

    fn drive_poll_requests(&mut self, state: &mut ReplicaState) -> Step {
        let term = state.term();
        for member in state.members.iter_mut() {
            if self.responded.contains(member.id()) {
                continue;
            }
            member.poll.do_work();

            if let Some(response) = member.poll.response() {
                self.responded.insert(member.id().clone());
                // Higher terms are counted as a loss, never adopted during pre-vote.
                if response.granted && response.term <= term {
                    self.quorum.succeed();
                } else {
                    self.quorum.fail();
                }
            } else if member.poll.is_failed() {
                self.responded.insert(member.id().clone());
                self.quorum.fail();
            }
        }

        let now = state.now();
        match self.quorum.outcome() {
            Some(QuorumOutcome::Granted) => {
                slog::info!(state.logger, "Pre-vote won; becoming candidate");
                self.last_contact = now;
                self.poll_state = PollState::ClosePollRequests;
                Step::TransitionTo(RoleKind::Candidate)
            }
            Some(QuorumOutcome::Denied) => {
                slog::info!(state.logger, "Pre-vote lost");
                self.end_round(now)
            }
            None if self.round_timeout.is_expired(now) => {
                slog::info!(state.logger, "Pre-vote timed out");
                self.end_round(now)
            }
            None => Step::Stay,
        }
    }

    fn end_round(&mut self, now: Instant) -> Step {
        self.round_timeout.disarm();
        self.touch(now);
        self.poll_state = PollState::ClosePollRequests;
        Step::Advance
    }

    /// Record leader activity and push the heartbeat timeout out again.
    fn touch(&mut self, now: Instant) {
        self.last_contact = now;
        if self.lifecycle == Lifecycle::Open {
            self.heartbeat_timeout.arm(now);
        }
    }

    fn leader_alive(&self, state: &ReplicaState) -> bool {
        state.leader().is_some() && state.now().duration_since(self.last_contact) < state.options.heartbeat_timeout
    }

    // ------- RPCs -------

    pub(super) fn poll(&mut self, state: &mut ReplicaState, request: PollRequest) -> ElectionResponse {
        raft_rpcs::handle_poll(state, &request, self.leader_alive(state))
    }

    pub(super) fn vote(&mut self, state: &mut ReplicaState, request: VoteRequest) -> ElectionResponse {
        state.update_term_and_leader(request.term, None);
        let response = raft_rpcs::handle_vote(state, &request);
        if response.granted {
            self.touch(state.now());
        }

        response
    }

    pub(super) fn append(&mut self, state: &mut ReplicaState, request: AppendRequest) -> Result<AppendResponse, RpcError> {
        if request.term >= state.term() {
            state.update_term_and_leader(request.term, Some(&request.leader));
            self.touch(state.now());
        }

        raft_rpcs::handle_append(state, &request)
    }

    pub(super) fn configure(&mut self, state: &mut ReplicaState, request: ConfigureRequest) -> ConfigureResponse {
        if request.term >= state.term() {
            state.update_term_and_leader(request.term, None);
            self.touch(state.now());
        }

        raft_rpcs::handle_configure(state, &request)
    }
}
