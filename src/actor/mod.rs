use crate::commitlog::{EntryId, Position};
use crate::replica::{
    AppendEntryError, AppendRequest, AppendResponse, Clock, Configuration, ConfigureRequest, ConfigureResponse,
    ElectionResponse, MembershipFuture, MembershipRequest, PollRequest, Replica, ReplicaId, RoleKind, RpcError, Term,
    VoteRequest,
};
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

pub(crate) fn create(
    logger: slog::Logger,
    buffer_size: usize,
    replica: Replica,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
) -> (ActorClient, ReplicaActor) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let client = ActorClient { sender: tx };
    let actor = ReplicaActor {
        logger,
        receiver: rx,
        replica,
        clock,
        tick_interval,
    };

    (client, actor)
}

#[derive(Debug)]
enum Event {
    Poll(PollRequest, Callback<ElectionResponse, RpcError>),
    Vote(VoteRequest, Callback<ElectionResponse, RpcError>),
    Append(AppendRequest, Callback<AppendResponse, RpcError>),
    Configure(ConfigureRequest, Callback<ConfigureResponse, RpcError>),
    Join(MembershipRequest, Callback<MembershipFuture, RpcError>),
    Leave(MembershipRequest, Callback<MembershipFuture, RpcError>),
    AppendEntry(Bytes, Callback<Position, AppendEntryError>),
    Appended(AppendResponse),
    Status(oneshot::Sender<ReplicaStatus>),
}

#[derive(Debug)]
struct Callback<O: Debug, E: Debug>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Debug> Callback<O, E> {
    pub fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

/// A point-in-time view of the replica, for operators and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub me: ReplicaId,
    pub role: RoleKind,
    pub term: Term,
    pub leader: Option<ReplicaId>,
    pub commit_position: Option<Position>,
    pub last_entry: Option<EntryId>,
    pub configuration: Configuration,
}

#[derive(Clone)]
pub struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub async fn poll(&self, request: PollRequest) -> Result<ElectionResponse, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Poll(request, Callback(tx)), RpcError::ActorExited).await?;
        rx.await.map_err(|_| RpcError::ActorExited)?
    }

    pub async fn vote(&self, request: VoteRequest) -> Result<ElectionResponse, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Vote(request, Callback(tx)), RpcError::ActorExited).await?;
        rx.await.map_err(|_| RpcError::ActorExited)?
    }

    pub async fn append(&self, request: AppendRequest) -> Result<AppendResponse, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Append(request, Callback(tx)), RpcError::ActorExited).await?;
        rx.await.map_err(|_| RpcError::ActorExited)?
    }

    pub async fn configure(&self, request: ConfigureRequest) -> Result<ConfigureResponse, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Configure(request, Callback(tx)), RpcError::ActorExited).await?;
        rx.await.map_err(|_| RpcError::ActorExited)?
    }

    pub async fn join(&self, request: MembershipRequest) -> Result<MembershipFuture, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Join(request, Callback(tx)), RpcError::ActorExited).await?;
        rx.await.map_err(|_| RpcError::ActorExited)?
    }

    pub async fn leave(&self, request: MembershipRequest) -> Result<MembershipFuture, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Leave(request, Callback(tx)), RpcError::ActorExited).await?;
        rx.await.map_err(|_| RpcError::ActorExited)?
    }

    pub async fn append_entry(&self, data: Bytes) -> Result<Position, AppendEntryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntry(data, Callback(tx)), AppendEntryError::ActorExited)
            .await?;
        rx.await.map_err(|_| AppendEntryError::ActorExited)?
    }

    /// Hands the leader a member's append response received by the transport.
    pub async fn appended(&self, response: AppendResponse) -> Result<(), RpcError> {
        self.send(Event::Appended(response), RpcError::ActorExited).await
    }

    pub async fn status(&self) -> Result<ReplicaStatus, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Status(tx), RpcError::ActorExited).await?;
        rx.await.map_err(|_| RpcError::ActorExited)
    }

    async fn send<E>(&self, event: Event, exited: E) -> Result<(), E> {
        self.sender.send(event).await.map_err(|_| exited)
    }
}

enum Wake {
    Event(Event),
    Tick,
}

/// ReplicaActor is replica logic in actor model: it owns the replica, handles events one at a
/// time, and ticks it every `tick_interval`.
pub struct ReplicaActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: Replica,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
}

impl ReplicaActor {
    pub async fn run_event_loop(mut self) {
        let mut next_tick = self.clock.now() + self.tick_interval;
        loop {
            let wake = tokio::select! {
                event = self.receiver.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => break,
                },
                _ = self.clock.sleep_until(next_tick) => Wake::Tick,
            };

            let keep_running = match wake {
                Wake::Event(event) => self.handle_event(event),
                Wake::Tick => {
                    next_tick = self.clock.now() + self.tick_interval;
                    self.replica.do_work();
                    true
                }
            };
            if !keep_running {
                break;
            }
        }
        slog::info!(self.logger, "Replica event loop has exited.");
    }

    // This must NOT be async. Any long running work belongs to controllers, driven by ticks.
    // Returns false once the replica hit an error it can't continue from.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Poll(request, callback) => {
                let result = self.replica.poll(request);
                self.reply(callback, result)
            }
            Event::Vote(request, callback) => {
                let result = self.replica.vote(request);
                self.reply(callback, result)
            }
            Event::Append(request, callback) => {
                let result = self.replica.append(request);
                self.reply(callback, result)
            }
            Event::Configure(request, callback) => {
                let result = self.replica.configure(request);
                self.reply(callback, result)
            }
            Event::Join(request, callback) => {
                let result = self.replica.join(request);
                self.reply(callback, result)
            }
            Event::Leave(request, callback) => {
                let result = self.replica.leave(request);
                self.reply(callback, result)
            }
            Event::AppendEntry(data, callback) => {
                callback.send(self.replica.append_entry(data));
                true
            }
            Event::Appended(response) => match self.replica.appended(response) {
                Ok(()) => true,
                Err(e @ RpcError::Fatal(_)) => {
                    slog::crit!(self.logger, "Fatal error handling append response: {:?}", e);
                    false
                }
                Err(e) => {
                    slog::debug!(self.logger, "Dropping append response: {:?}", e);
                    true
                }
            },
            Event::Status(tx) => {
                let _ = tx.send(self.status());
                true
            }
        }
    }

    fn reply<O: Debug>(&self, callback: Callback<O, RpcError>, result: Result<O, RpcError>) -> bool {
        let fatal = matches!(result, Err(RpcError::Fatal(_)));
        if fatal {
            slog::crit!(self.logger, "Replica hit a fatal error, exiting event loop: {:?}", result);
        }
        callback.send(result);

        !fatal
    }

    fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            me: self.replica.me().clone(),
            role: self.replica.role(),
            term: self.replica.term(),
            leader: self.replica.leader().cloned(),
            commit_position: self.replica.commit_position(),
            last_entry: self.replica.last_entry(),
            configuration: self.replica.configuration().clone(),
        }
    }
}
