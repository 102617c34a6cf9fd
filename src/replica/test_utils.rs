use crate::api::ReplicaOptions;
use crate::commitlog::{Address, InMemoryBlockIndex, InMemoryStorage, LogStorage};
use crate::replica::{
    create_replica, mocked_clock, AppendRequest, AppendResponse, CommitStream, ConfigureController, ConfigureRequest,
    ConfigureResponse, Controller, ControllerFactory, ElectionController, ElectionResponse,
    ImmediateLogStreamServices, MockClockController, PollRequest, Replica, ReplicaConfig, ReplicaId,
    ReplicationController, ReplicationSession, RoleChangeListener, RoleKind, Term, VoteRequest, VolatileLocalState,
};
use bytes::Bytes;
use slog::Drain;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

pub(crate) fn test_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

// ------- Storage -------

#[derive(Default)]
struct RecordingStorageInner {
    storage: InMemoryStorage,
    appended_blocks: Vec<Vec<u8>>,
    fail_appends: bool,
}

/// In-memory storage that remembers every appended block and can be told to fail appends.
#[derive(Clone, Default)]
pub(crate) struct RecordingStorage {
    inner: Arc<Mutex<RecordingStorageInner>>,
}

impl RecordingStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn appended_blocks(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().appended_blocks.clone()
    }

    pub(crate) fn fail_appends(&self, fail: bool) {
        self.inner.lock().unwrap().fail_appends = fail;
    }
}

impl LogStorage for RecordingStorage {
    fn append(&mut self, block: &[u8]) -> Result<Address, io::Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_appends {
            return Err(io::Error::new(io::ErrorKind::Other, "append failure injected by test"));
        }
        inner.appended_blocks.push(block.to_vec());
        inner.storage.append(block)
    }

    fn read(&self, address: Address) -> Result<Option<Bytes>, io::Error> {
        self.inner.lock().unwrap().storage.read(address)
    }

    fn truncate(&mut self, address: Address) -> Result<(), io::Error> {
        self.inner.lock().unwrap().storage.truncate(address)
    }

    fn first_block_address(&self) -> Option<Address> {
        self.inner.lock().unwrap().storage.first_block_address()
    }
}

// ------- Controllers -------

/// How a fake controller answers its request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ScriptedResponse {
    Grant,
    Deny,
    DenyWithTerm(Term),
    /// Never answers.
    Silent,
    /// Request fails without an answer.
    Fail,
}

#[derive(Default)]
struct Recorded {
    poll_scripts: HashMap<ReplicaId, ScriptedResponse>,
    vote_scripts: HashMap<ReplicaId, ScriptedResponse>,
    configure_scripts: HashMap<ReplicaId, ScriptedResponse>,
    opened_polls: usize,
    opened_votes: usize,
    open_poll_controllers: usize,
    poll_requests: Vec<PollRequest>,
    vote_requests: Vec<VoteRequest>,
    sent_appends: HashMap<ReplicaId, Vec<AppendRequest>>,
    append_responses: HashMap<ReplicaId, VecDeque<AppendResponse>>,
    configure_requests: HashMap<ReplicaId, Vec<ConfigureRequest>>,
}

/// Builds scripted controllers that record everything they are asked to send. Poll and vote
/// controllers stay silent unless scripted; configure controllers acknowledge by default.
#[derive(Clone, Default)]
pub(crate) struct FakeControllerFactory {
    recorded: Arc<Mutex<Recorded>>,
}

impl FakeControllerFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script_polls(&self, peer: &str, response: ScriptedResponse) {
        self.recorded.lock().unwrap().poll_scripts.insert(ReplicaId::new(peer), response);
    }

    pub(crate) fn script_votes(&self, peer: &str, response: ScriptedResponse) {
        self.recorded.lock().unwrap().vote_scripts.insert(ReplicaId::new(peer), response);
    }

    pub(crate) fn script_configure(&self, peer: &str, response: ScriptedResponse) {
        self.recorded
            .lock()
            .unwrap()
            .configure_scripts
            .insert(ReplicaId::new(peer), response);
    }

    /// Queues a response for the peer's replication controller to hand to the leader.
    pub(crate) fn queue_append_response(&self, peer: &str, response: AppendResponse) {
        self.recorded
            .lock()
            .unwrap()
            .append_responses
            .entry(ReplicaId::new(peer))
            .or_default()
            .push_back(response);
    }

    pub(crate) fn opened_polls(&self) -> usize {
        self.recorded.lock().unwrap().opened_polls
    }

    pub(crate) fn opened_votes(&self) -> usize {
        self.recorded.lock().unwrap().opened_votes
    }

    pub(crate) fn open_poll_controllers(&self) -> usize {
        self.recorded.lock().unwrap().open_poll_controllers
    }

    pub(crate) fn poll_requests(&self) -> Vec<PollRequest> {
        self.recorded.lock().unwrap().poll_requests.clone()
    }

    pub(crate) fn vote_requests(&self) -> Vec<VoteRequest> {
        self.recorded.lock().unwrap().vote_requests.clone()
    }

    pub(crate) fn sent_appends(&self, peer: &str) -> Vec<AppendRequest> {
        self.recorded
            .lock()
            .unwrap()
            .sent_appends
            .get(&ReplicaId::new(peer))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn configure_requests(&self, peer: &str) -> Vec<ConfigureRequest> {
        self.recorded
            .lock()
            .unwrap()
            .configure_requests
            .get(&ReplicaId::new(peer))
            .cloned()
            .unwrap_or_default()
    }
}

impl ControllerFactory for FakeControllerFactory {
    fn poll_controller(&self, peer: &ReplicaId) -> Box<dyn ElectionController<PollRequest>> {
        Box::new(FakeElectionController::new(peer, ElectionKind::Poll, self.recorded.clone()))
    }

    fn vote_controller(&self, peer: &ReplicaId) -> Box<dyn ElectionController<VoteRequest>> {
        Box::new(FakeElectionController::new(peer, ElectionKind::Vote, self.recorded.clone()))
    }

    fn replication_controller(&self, peer: &ReplicaId) -> Box<dyn ReplicationController> {
        Box::new(FakeReplicationController {
            peer: peer.clone(),
            recorded: self.recorded.clone(),
            open: false,
        })
    }

    fn configure_controller(&self, peer: &ReplicaId) -> Box<dyn ConfigureController> {
        Box::new(FakeConfigureController {
            peer: peer.clone(),
            recorded: self.recorded.clone(),
            request_term: None,
            response: None,
            failed: false,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ElectionKind {
    Poll,
    Vote,
}

struct FakeElectionController {
    peer: ReplicaId,
    kind: ElectionKind,
    recorded: Arc<Mutex<Recorded>>,
    request_term: Option<Term>,
    response: Option<ElectionResponse>,
    failed: bool,
}

impl FakeElectionController {
    fn new(peer: &ReplicaId, kind: ElectionKind, recorded: Arc<Mutex<Recorded>>) -> Self {
        FakeElectionController {
            peer: peer.clone(),
            kind,
            recorded,
            request_term: None,
            response: None,
            failed: false,
        }
    }

    fn begin(&mut self, term: Term) {
        self.request_term = Some(term);
        self.response = None;
        self.failed = false;
    }

    fn answer(&mut self) -> usize {
        let term = match self.request_term {
            Some(term) if self.response.is_none() && !self.failed => term,
            _ => return 0,
        };

        let recorded = self.recorded.lock().unwrap();
        let scripts = match self.kind {
            ElectionKind::Poll => &recorded.poll_scripts,
            ElectionKind::Vote => &recorded.vote_scripts,
        };
        match scripts.get(&self.peer).copied().unwrap_or(ScriptedResponse::Silent) {
            ScriptedResponse::Grant => self.response = Some(ElectionResponse { term, granted: true }),
            ScriptedResponse::Deny => self.response = Some(ElectionResponse { term, granted: false }),
            ScriptedResponse::DenyWithTerm(term) => self.response = Some(ElectionResponse { term, granted: false }),
            ScriptedResponse::Silent => return 0,
            ScriptedResponse::Fail => self.failed = true,
        }
        1
    }
}

impl Controller for FakeElectionController {
    fn close(&mut self) {
        if self.request_term.take().is_some() && self.kind == ElectionKind::Poll {
            self.recorded.lock().unwrap().open_poll_controllers -= 1;
        }
        self.response = None;
        self.failed = false;
    }

    fn is_closed(&self) -> bool {
        self.request_term.is_none()
    }

    fn is_failed(&self) -> bool {
        self.failed
    }
}

impl ElectionController<PollRequest> for FakeElectionController {
    fn open(&mut self, request: PollRequest) {
        self.begin(request.term);
        let mut recorded = self.recorded.lock().unwrap();
        recorded.opened_polls += 1;
        recorded.open_poll_controllers += 1;
        recorded.poll_requests.push(request);
    }

    fn do_work(&mut self) -> usize {
        self.answer()
    }

    fn response(&self) -> Option<ElectionResponse> {
        self.response
    }
}

impl ElectionController<VoteRequest> for FakeElectionController {
    fn open(&mut self, request: VoteRequest) {
        self.begin(request.term);
        let mut recorded = self.recorded.lock().unwrap();
        recorded.opened_votes += 1;
        recorded.vote_requests.push(request);
    }

    fn do_work(&mut self) -> usize {
        self.answer()
    }

    fn response(&self) -> Option<ElectionResponse> {
        self.response
    }
}

/// Sends one append per `do_work()` and hands back queued responses.
struct FakeReplicationController {
    peer: ReplicaId,
    recorded: Arc<Mutex<Recorded>>,
    open: bool,
}

impl Controller for FakeReplicationController {
    fn close(&mut self) {
        self.open = false;
    }

    fn is_closed(&self) -> bool {
        !self.open
    }

    fn is_failed(&self) -> bool {
        false
    }
}

impl ReplicationController for FakeReplicationController {
    fn open(&mut self) {
        self.open = true;
    }

    fn do_work(&mut self, mut session: ReplicationSession<'_>) -> usize {
        if !self.open {
            return 0;
        }

        let request = session.next_request(64).unwrap();
        self.recorded
            .lock()
            .unwrap()
            .sent_appends
            .entry(self.peer.clone())
            .or_default()
            .push(request);
        1
    }

    fn take_response(&mut self) -> Option<AppendResponse> {
        if !self.open {
            return None;
        }

        self.recorded
            .lock()
            .unwrap()
            .append_responses
            .get_mut(&self.peer)
            .and_then(|queue| queue.pop_front())
    }
}

struct FakeConfigureController {
    peer: ReplicaId,
    recorded: Arc<Mutex<Recorded>>,
    request_term: Option<Term>,
    response: Option<ConfigureResponse>,
    failed: bool,
}

impl Controller for FakeConfigureController {
    fn close(&mut self) {
        self.request_term = None;
        self.response = None;
        self.failed = false;
    }

    fn is_closed(&self) -> bool {
        self.request_term.is_none()
    }

    fn is_failed(&self) -> bool {
        self.failed
    }
}

impl ConfigureController for FakeConfigureController {
    fn open(&mut self, request: ConfigureRequest) {
        self.request_term = Some(request.term);
        self.recorded
            .lock()
            .unwrap()
            .configure_requests
            .entry(self.peer.clone())
            .or_default()
            .push(request);
    }

    fn do_work(&mut self) -> usize {
        let term = match self.request_term {
            Some(term) if self.response.is_none() && !self.failed => term,
            _ => return 0,
        };

        let script = self.recorded.lock().unwrap().configure_scripts.get(&self.peer).copied();
        match script.unwrap_or(ScriptedResponse::Grant) {
            ScriptedResponse::Grant | ScriptedResponse::Deny => self.response = Some(ConfigureResponse { term }),
            ScriptedResponse::DenyWithTerm(term) => self.response = Some(ConfigureResponse { term }),
            ScriptedResponse::Silent => return 0,
            ScriptedResponse::Fail => self.failed = true,
        }
        1
    }

    fn response(&self) -> Option<ConfigureResponse> {
        self.response
    }
}

// ------- Replica harness -------

/// A replica wired to fakes and a mocked clock, driven by hand.
pub(crate) struct TestHarness {
    pub(crate) replica: Replica,
    pub(crate) factory: FakeControllerFactory,
    pub(crate) storage: RecordingStorage,
    pub(crate) clock: MockClockController,
    pub(crate) commit_stream: CommitStream,
    pub(crate) roles: RoleChangeListener,
}

impl TestHarness {
    /// A follower bootstrapped with `members`.
    pub(crate) fn new(me: &str, members: &[&str]) -> Self {
        let members = members.iter().map(|m| ReplicaId::new(*m)).collect();
        let mut harness = Self::create(me, Some(members));
        harness.tick();
        harness
    }

    /// A replica that belongs to no configuration yet.
    pub(crate) fn inactive(me: &str) -> Self {
        Self::create(me, None)
    }

    fn create(me: &str, initial_members: Option<Vec<ReplicaId>>) -> Self {
        let (clock, controller) = mocked_clock();
        let factory = FakeControllerFactory::new();
        let storage = RecordingStorage::new();

        let (replica, commit_stream, roles) = create_replica(ReplicaConfig {
            my_replica_id: ReplicaId::new(me),
            initial_members,
            storage: Box::new(storage.clone()),
            block_index: Box::new(InMemoryBlockIndex::new()),
            local_state: Box::new(VolatileLocalState::new(ReplicaId::new(me))),
            controller_factory: Box::new(factory.clone()),
            log_stream_services: Box::new(ImmediateLogStreamServices::default()),
            clock: Arc::new(clock),
            logger: test_logger(),
            options: ReplicaOptions::default(),
        })
        .unwrap();

        TestHarness {
            replica,
            factory,
            storage,
            clock: controller,
            commit_stream,
            roles,
        }
    }

    pub(crate) fn tick(&mut self) -> usize {
        self.replica.do_work()
    }

    pub(crate) fn advance(&mut self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Wins an election: every peer grants polls and votes.
    pub(crate) fn elect(&mut self) {
        let me = self.replica.me().clone();
        for member in self.replica.configuration().members.iter().filter(|m| **m != me) {
            self.factory.script_polls(member.as_str(), ScriptedResponse::Grant);
            self.factory.script_votes(member.as_str(), ScriptedResponse::Grant);
        }

        self.advance(Duration::from_millis(500));
        for _ in 0..8 {
            if self.replica.role() == RoleKind::Leader {
                return;
            }
            self.tick();
        }
        assert_eq!(self.replica.role(), RoleKind::Leader, "Failed to win an election");
    }
}
