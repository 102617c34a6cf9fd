use crate::actor::ActorClient;
use crate::replica::{CommitStream, RoleChangeListener};

/// ReplicaClient is everything an application holds for one running replica: the RPC entry
/// points its transport calls into, the stream of committed entries, and role changes.
pub struct ReplicaClient {
    pub replica: ActorClient,
    pub commit_stream: CommitStream,
    pub event_listener: RoleChangeListener,
}
