use crate::commitlog::{EntryId, LogEntry, Position};
use crate::replica::log_buffer::LogBufferError;
use crate::replica::peers::{Configuration, ReplicaId};
use crate::replica::roles::RoleKind;
use crate::replica::Term;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

// ------- Poll / Vote -------

/// Non-binding pre-vote. Carries the candidate's current term, never an incremented one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollRequest {
    pub term: Term,
    pub candidate: ReplicaId,
    pub last_entry: Option<EntryId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: ReplicaId,
    pub last_entry: Option<EntryId>,
}

/// Response to both Poll and Vote.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ElectionResponse {
    pub term: Term,
    pub granted: bool,
}

// ------- Append -------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: ReplicaId,
    /// Entry immediately preceding `entries`; `None` when they start at the head of the log.
    pub previous_entry: Option<EntryId>,
    pub commit_position: Option<Position>,
    pub entries: Vec<LogEntry>,
}

/// On success, `position` is the last position the responder holds durably that matches the
/// leader. On failure, it is the previous-entry position that did not match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendResponse {
    pub term: Term,
    pub member: ReplicaId,
    pub succeeded: bool,
    pub position: Option<Position>,
}

// ------- Configure -------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigureRequest {
    pub term: Term,
    pub configuration: Configuration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigureResponse {
    pub term: Term,
}

// ------- Join / Leave -------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipRequest {
    pub member: ReplicaId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipResponse {
    pub term: Term,
    pub succeeded: bool,
    pub members: Vec<ReplicaId>,
    pub configuration_entry: Option<EntryId>,
}

#[derive(Debug, thiserror::Error)]
#[error("Membership change was abandoned before it completed")]
pub struct MembershipError;

/// MembershipFuture resolves once the membership change is committed, or rejected.
#[derive(Debug)]
pub struct MembershipFuture {
    receiver: oneshot::Receiver<MembershipResponse>,
}

impl MembershipFuture {
    pub(crate) fn new() -> (oneshot::Sender<MembershipResponse>, MembershipFuture) {
        let (tx, rx) = oneshot::channel();
        (tx, MembershipFuture { receiver: rx })
    }

    pub(crate) fn completed(response: MembershipResponse) -> MembershipFuture {
        let (tx, future) = Self::new();
        let _ = tx.send(response);
        future
    }

    /// Non-blocking check, for drivers that tick the replica themselves.
    pub fn try_take(&mut self) -> Option<Result<MembershipResponse, MembershipError>> {
        match self.receiver.try_recv() {
            Ok(response) => Some(Ok(response)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(MembershipError)),
        }
    }
}

impl Future for MembershipFuture {
    type Output = Result<MembershipResponse, MembershipError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|r| r.map_err(|_| MembershipError))
    }
}

// ------- Errors -------

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("{rpc} is illegal while the replica is {role:?}")]
    IllegalState { role: RoleKind, rpc: &'static str },
    #[error("Fatal log inconsistency")]
    Fatal(#[source] LogBufferError),
    #[error("Replica event loop has exited")]
    ActorExited,
}

impl RpcError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RpcError::IllegalState { .. } | RpcError::Fatal(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppendEntryError {
    #[error("Not leader; try {leader:?}")]
    NotLeader { leader: Option<ReplicaId> },
    #[error("Leader is still establishing its term")]
    NotInitialized,
    #[error("Failed to stage entry")]
    Log(#[from] LogBufferError),
    #[error("Replica event loop has exited")]
    ActorExited,
}
