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

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ElectionState {
    Closed,
    Prepare,
    OpenVoteRequests,
    Open,
    CloseVoteRequests,
    Closing,
}

/// Candidate runs binding elections until it wins, loses, or hears from a leader. A timed out
/// election is retried in a new term.
pub(crate) struct Candidate {
    lifecycle: Lifecycle,
    election_state: ElectionState,
    quorum: QuorumTracker,
    responded: HashSet<ReplicaId>,
    election_timeout: RandomizedTimeout,
    retry: bool,
}

impl Candidate {
    pub(super) fn new(state: &ReplicaState) -> Self {
        Candidate {
            lifecycle: Lifecycle::Closed,
            election_state: ElectionState::Closed,
            quorum: QuorumTracker::open(state.cluster_size()),
            responded: HashSet::new(),
            election_timeout: state.election_timeout(),
            retry: false,
        }
    }

    pub(super) fn open(&mut self, state: &mut ReplicaState) {
        assert_eq!(self.lifecycle, Lifecycle::Closed, "Opened a role that wasn't closed");
        self.lifecycle = Lifecycle::Open;
        self.election_state = ElectionState::Prepare;
        state.notify_role_opened();
    }

    pub(super) fn do_work(&mut self, state: &mut ReplicaState) -> usize {
        let work = drive(state, |state| self.step(state));
        if self.lifecycle == Lifecycle::Closing && self.election_state == ElectionState::Closed {
            self.lifecycle = Lifecycle::Closed;
        }

        work
    }

    pub(super) fn close(&mut self, _state: &mut ReplicaState) {
        if self.lifecycle != Lifecycle::Open {
            return;
        }
        self.lifecycle = Lifecycle::Closing;
        self.retry = false;
        match self.election_state {
            ElectionState::Prepare => self.election_state = ElectionState::Closed,
            ElectionState::OpenVoteRequests | ElectionState::Open => {
                self.election_state = ElectionState::CloseVoteRequests
            }
            _ => {}
        }
    }

    pub(super) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn step(&mut self, state: &mut ReplicaState) -> Step {
        match self.election_state {
            ElectionState::Closed => {
                if self.retry && self.lifecycle == Lifecycle::Open {
                    self.retry = false;
                    self.election_state = ElectionState::Prepare;
                    Step::Advance
                } else {
                    Step::Stay
                }
            }
            ElectionState::Prepare => {
                let term = state.increment_term_and_vote_for_self();
                slog::info!(state.logger, "Starting election for term {:?}", term);
                if state.is_singleton() {
                    self.election_state = ElectionState::Closed;
                    return Step::TransitionTo(RoleKind::Leader);
                }
                self.election_state = ElectionState::OpenVoteRequests;
                Step::Advance
            }
            ElectionState::OpenVoteRequests => {
                self.quorum = QuorumTracker::open(state.cluster_size());
                self.quorum.succeed();
                self.responded.clear();

                let request = VoteRequest {
                    term: state.term(),
                    candidate: state.me.clone(),
                    last_entry: state.last_entry(),
                };
                for member in state.members.iter_mut() {
                    member.vote.open(request.clone());
                }
                self.election_timeout.arm(state.now());
                self.election_state = ElectionState::Open;
                Step::Advance
            }
            ElectionState::Open => self.drive_vote_requests(state),
            ElectionState::CloseVoteRequests => {
                for member in state.members.iter_mut() {
                    member.vote.close();
                }
                self.election_state = ElectionState::Closing;
                Step::Advance
            }
            ElectionState::Closing => {
                let mut all_closed = true;
                for member in state.members.iter_mut() {
                    if !member.vote.is_closed() {
                        member.vote.do_work();
                        all_closed &= member.vote.is_closed();
                    }
                }

                if all_closed {
                    self.election_state = ElectionState::Closed;
                    Step::Advance
                } else {
                    Step::Stay
                }
            }
        }
    }

    fn drive_vote_requests(&mut self, state: &mut ReplicaState) -> Step {
        let term = state.term();
        let mut newer_term = None;
        for member in state.members.iter_mut() {
            if self.responded.contains(member.id()) {
                continue;
            }
            member.vote.do_work();

            if let Some(response) = member.vote.response() {
                self.responded.insert(member.id().clone());
                if response.term > term {
                    newer_term = Some(newer_term.map_or(response.term, |t| std::cmp::max(t, response.term)));
                } else if response.granted {
                    self.quorum.succeed();
                } else {
                    self.quorum.fail();
                }
            } else if member.vote.is_failed() {
                self.responded.insert(member.id().clone());
                self.quorum.fail();
            }
        }

        if let Some(newer_term) = newer_term {
            slog::info!(state.logger, "Saw newer term {:?} during election", newer_term);
            state.update_term_and_leader(newer_term, None);
            self.election_state = ElectionState::CloseVoteRequests;
            return Step::TransitionTo(RoleKind::Follower);
        }

        match self.quorum.outcome() {
            Some(QuorumOutcome::Granted) => {
                slog::info!(state.logger, "Won election for term {:?}", term);
                self.election_state = ElectionState::CloseVoteRequests;
                Step::TransitionTo(RoleKind::Leader)
            }
            Some(QuorumOutcome::Denied) => {
                slog::info!(state.logger, "Lost election for term {:?}", term);
                self.election_state = ElectionState::CloseVoteRequests;
                Step::TransitionTo(RoleKind::Follower)
            }
            None if self.election_timeout.is_expired(state.now()) => {
                slog::info!(state.logger, "Election for term {:?} timed out; retrying", term);
                self.election_timeout.disarm();
                self.retry = true;
                self.election_state = ElectionState::CloseVoteRequests;
                Step::Advance
            }
            None => Step::Stay,
        }
    }

    // ------- RPCs -------

    pub(super) fn poll(&mut self, state: &mut ReplicaState, request: PollRequest) -> ElectionResponse {
        raft_rpcs::handle_poll(state, &request, false)
    }

    pub(super) fn vote(&mut self, state: &mut ReplicaState, request: VoteRequest) -> ElectionResponse {
        if state.update_term_and_leader(request.term, None) {
            state.request_transition(RoleKind::Follower);
        }

        raft_rpcs::handle_vote(state, &request)
    }

    pub(super) fn append(&mut self, state: &mut ReplicaState, request: AppendRequest) -> Result<AppendResponse, RpcError> {
        if request.term >= state.term() {
            // Either a newer term, or the winner of ours.
            state.update_term_and_leader(request.term, Some(&request.leader));
            state.request_transition(RoleKind::Follower);
        }

        raft_rpcs::handle_append(state, &request)
    }

    pub(super) fn configure(&mut self, state: &mut ReplicaState, request: ConfigureRequest) -> ConfigureResponse {
        if request.term > state.term() {
            state.update_term_and_leader(request.term, None);
            state.request_transition(RoleKind::Follower);
        }

        raft_rpcs::handle_configure(state, &request)
    }
}
