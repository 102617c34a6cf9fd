mod candidate;
mod follower;
mod inactive;
mod leader;

use crate::commitlog::Position;
use crate::replica::replica_api::{
    AppendEntryError, AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, ElectionResponse,
    MembershipFuture, MembershipRequest, MembershipResponse, PollRequest, RpcError, VoteRequest,
};
use crate::replica::replica_state::ReplicaState;
use bytes::Bytes;
use candidate::Candidate;
use follower::Follower;
use inactive::Inactive;
use leader::Leader;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Inactive,
    Follower,
    Candidate,
    Leader,
}

/// Result of one step of a role's sub-machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Waiting on something outside this tick.
    Stay,
    /// Moved to another sub-state; step again.
    Advance,
    /// The outer role must be replaced.
    TransitionTo(RoleKind),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Open,
    Closing,
    Closed,
}

// Bound on sub-state changes per tick, so a buggy sub-machine can't spin forever.
const MAX_STEPS_PER_TICK: usize = 16;

/// Steps `step` until it stays put or asks for a transition. Returns the work done.
pub(crate) fn drive<F>(state: &mut ReplicaState, mut step: F) -> usize
where
    F: FnMut(&mut ReplicaState) -> Step,
{
    let mut work = 0;
    for _ in 0..MAX_STEPS_PER_TICK {
        match step(state) {
            Step::Stay => break,
            Step::Advance => work += 1,
            Step::TransitionTo(target) => {
                state.request_transition(target);
                work += 1;
                break;
            }
        }
    }

    work
}

/// The role currently open on a replica. Exactly one exists at a time.
pub(crate) enum Role {
    Inactive(Inactive),
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    pub(crate) fn new(kind: RoleKind, state: &ReplicaState) -> Self {
        match kind {
            RoleKind::Inactive => Role::Inactive(Inactive::new()),
            RoleKind::Follower => Role::Follower(Follower::new(state)),
            RoleKind::Candidate => Role::Candidate(Candidate::new(state)),
            RoleKind::Leader => Role::Leader(Leader::new()),
        }
    }

    pub(crate) fn kind(&self) -> RoleKind {
        match self {
            Role::Inactive(_) => RoleKind::Inactive,
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }

    pub(crate) fn open(&mut self, state: &mut ReplicaState) {
        match self {
            Role::Inactive(role) => role.open(state),
            Role::Follower(role) => role.open(state),
            Role::Candidate(role) => role.open(state),
            Role::Leader(role) => role.open(state),
        }
    }

    pub(crate) fn do_work(&mut self, state: &mut ReplicaState) -> usize {
        match self {
            Role::Inactive(role) => role.do_work(state),
            Role::Follower(role) => role.do_work(state),
            Role::Candidate(role) => role.do_work(state),
            Role::Leader(role) => role.do_work(state),
        }
    }

    /// Starts closing. Sub-machines drain over the following `do_work()` calls.
    pub(crate) fn close(&mut self, state: &mut ReplicaState) {
        match self {
            Role::Inactive(role) => role.close(state),
            Role::Follower(role) => role.close(state),
            Role::Candidate(role) => role.close(state),
            Role::Leader(role) => role.close(state),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        match self {
            Role::Inactive(role) => role.lifecycle(),
            Role::Follower(role) => role.lifecycle(),
            Role::Candidate(role) => role.lifecycle(),
            Role::Leader(role) => role.lifecycle(),
        }
    }

    pub(crate) fn poll(&mut self, state: &mut ReplicaState, request: PollRequest) -> Result<ElectionResponse, RpcError> {
        match self {
            Role::Inactive(_) => Err(illegal(RoleKind::Inactive, "Poll")),
            Role::Follower(role) => Ok(role.poll(state, request)),
            Role::Candidate(role) => Ok(role.poll(state, request)),
            Role::Leader(role) => Ok(role.poll(state, request)),
        }
    }

    pub(crate) fn vote(&mut self, state: &mut ReplicaState, request: VoteRequest) -> Result<ElectionResponse, RpcError> {
        match self {
            Role::Inactive(_) => Err(illegal(RoleKind::Inactive, "Vote")),
            Role::Follower(role) => Ok(role.vote(state, request)),
            Role::Candidate(role) => Ok(role.vote(state, request)),
            Role::Leader(role) => Ok(role.vote(state, request)),
        }
    }

    pub(crate) fn append(&mut self, state: &mut ReplicaState, request: AppendRequest) -> Result<AppendResponse, RpcError> {
        match self {
            Role::Inactive(_) => Err(illegal(RoleKind::Inactive, "Append")),
            Role::Follower(role) => role.append(state, request),
            Role::Candidate(role) => role.append(state, request),
            Role::Leader(role) => role.append(state, request),
        }
    }

    pub(crate) fn configure(
        &mut self,
        state: &mut ReplicaState,
        request: ConfigureRequest,
    ) -> Result<ConfigureResponse, RpcError> {
        match self {
            Role::Inactive(role) => Ok(role.configure(state, request)),
            Role::Follower(role) => Ok(role.configure(state, request)),
            Role::Candidate(role) => Ok(role.configure(state, request)),
            Role::Leader(role) => Ok(role.configure(state, request)),
        }
    }

    pub(crate) fn join(&mut self, state: &mut ReplicaState, request: MembershipRequest) -> Result<MembershipFuture, RpcError> {
        match self {
            Role::Inactive(_) => Err(illegal(RoleKind::Inactive, "Join")),
            Role::Leader(role) => Ok(role.join(state, request)),
            Role::Follower(_) | Role::Candidate(_) => Ok(not_leader(state)),
        }
    }

    pub(crate) fn leave(&mut self, state: &mut ReplicaState, request: MembershipRequest) -> Result<MembershipFuture, RpcError> {
        match self {
            Role::Inactive(_) => Err(illegal(RoleKind::Inactive, "Leave")),
            Role::Leader(role) => Ok(role.leave(state, request)),
            Role::Follower(_) | Role::Candidate(_) => Ok(not_leader(state)),
        }
    }

    pub(crate) fn append_entry(&mut self, state: &mut ReplicaState, data: Bytes) -> Result<Position, AppendEntryError> {
        match self {
            Role::Leader(role) => role.append_entry(state, data),
            _ => Err(AppendEntryError::NotLeader {
                leader: state.leader().cloned(),
            }),
        }
    }

    /// Leader-only: feed a replication response (normally collected from controllers).
    pub(crate) fn appended(&mut self, state: &mut ReplicaState, response: AppendResponse) -> Result<(), RpcError> {
        match self {
            Role::Leader(role) => {
                let step = role.appended(state, response);
                if let Step::TransitionTo(target) = step {
                    state.request_transition(target);
                }
                Ok(())
            }
            other => Err(illegal(other.kind(), "Appended")),
        }
    }
}

fn illegal(role: RoleKind, rpc: &'static str) -> RpcError {
    RpcError::IllegalState { role, rpc }
}

/// Only the leader changes membership; everyone else rejects so the caller retries at the leader.
fn not_leader(state: &ReplicaState) -> MembershipFuture {
    MembershipFuture::completed(MembershipResponse {
        term: state.term(),
        succeeded: false,
        members: state.configuration().members.clone(),
        configuration_entry: state.configuration().entry,
    })
}
