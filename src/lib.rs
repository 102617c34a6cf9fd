mod actor;
mod api;
mod commitlog;
mod replica;

pub use actor::ActorClient;
pub use actor::ReplicaStatus;
pub use api::try_create_replica;
pub use api::ReplicaClient;
pub use api::ReplicaOptions;
pub use commitlog::Address;
pub use commitlog::BlockIndex;
pub use commitlog::EntryDecodeError;
pub use commitlog::EntryId;
pub use commitlog::EntryKind;
pub use commitlog::InMemoryBlockIndex;
pub use commitlog::InMemoryStorage;
pub use commitlog::LogEntry;
pub use commitlog::LogStorage;
pub use commitlog::Position;
pub use replica::create_replica;
pub use replica::mocked_clock;
pub use replica::AppendEntryError;
pub use replica::AppendRequest;
pub use replica::AppendResponse;
pub use replica::Clock;
pub use replica::CommitStream;
pub use replica::CommittedEntry;
pub use replica::Configuration;
pub use replica::ConfigureController;
pub use replica::ConfigureRequest;
pub use replica::ConfigureResponse;
pub use replica::Controller;
pub use replica::ControllerFactory;
pub use replica::ElectionController;
pub use replica::ElectionResponse;
pub use replica::ImmediateLogStreamServices;
pub use replica::LogBufferError;
pub use replica::LogStreamServices;
pub use replica::MembershipError;
pub use replica::MembershipFuture;
pub use replica::MembershipRequest;
pub use replica::MembershipResponse;
pub use replica::MockClock;
pub use replica::MockClockController;
pub use replica::PersistentLocalState;
pub use replica::PollRequest;
pub use replica::RealClock;
pub use replica::Replica;
pub use replica::ReplicaConfig;
pub use replica::ReplicaCreationError;
pub use replica::ReplicaId;
pub use replica::ReplicationController;
pub use replica::ReplicationCursor;
pub use replica::ReplicationSession;
pub use replica::ReplicatedLogBuffer;
pub use replica::RoleChangeListener;
pub use replica::RoleKind;
pub use replica::RoleSnapshot;
pub use replica::RpcError;
pub use replica::ServiceState;
pub use replica::Term;
pub use replica::VoteRequest;
pub use replica::VolatileLocalState;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
