mod commit_stream;
mod controllers;
mod local_state;
mod log_buffer;
mod peers;
mod quorum;
mod raft_rpcs;
mod replica;
mod replica_api;
mod replica_state;
mod roles;
mod state_change_listener;
#[cfg(test)]
mod test_utils;
mod time;
mod timers;

pub use commit_stream::CommitStream;
pub use commit_stream::CommittedEntry;
pub use controllers::Controller;
pub use controllers::ControllerFactory;
pub use controllers::ConfigureController;
pub use controllers::ElectionController;
pub use controllers::ImmediateLogStreamServices;
pub use controllers::LogStreamServices;
pub use controllers::ReplicationController;
pub use controllers::ReplicationCursor;
pub use controllers::ReplicationSession;
pub use controllers::ServiceState;
pub use local_state::PersistentLocalState;
pub use local_state::Term;
pub use local_state::VolatileLocalState;
pub use log_buffer::LogBufferError;
pub use log_buffer::ReplicatedLogBuffer;
pub use peers::Configuration;
pub use peers::ReplicaId;
pub use replica::create_replica;
pub use replica::Replica;
pub use replica::ReplicaConfig;
pub use replica::ReplicaCreationError;
pub use replica_api::AppendEntryError;
pub use replica_api::AppendRequest;
pub use replica_api::AppendResponse;
pub use replica_api::ConfigureRequest;
pub use replica_api::ConfigureResponse;
pub use replica_api::ElectionResponse;
pub use replica_api::MembershipError;
pub use replica_api::MembershipFuture;
pub use replica_api::MembershipRequest;
pub use replica_api::MembershipResponse;
pub use replica_api::PollRequest;
pub use replica_api::RpcError;
pub use replica_api::VoteRequest;
pub use roles::RoleKind;
pub use state_change_listener::RoleChangeListener;
pub use state_change_listener::RoleSnapshot;
pub use time::mocked_clock;
pub use time::Clock;
pub use time::MockClock;
pub use time::MockClockController;
pub use time::RealClock;
#[cfg(test)]
pub(crate) use test_utils::{test_logger, FakeControllerFactory};
