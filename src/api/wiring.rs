use crate::actor;
use crate::api::client::ReplicaClient;
use crate::api::options::ReplicaOptionsValidated;
use crate::replica::{self, ReplicaConfig, ReplicaCreationError};
use std::convert::TryFrom;

// Events queued for the replica before senders wait.
const ACTOR_QUEUE_SIZE: usize = 10;

/// Creates a replica and spawns its event loop on the current tokio runtime.
pub async fn try_create_replica(config: ReplicaConfig) -> Result<ReplicaClient, ReplicaCreationError> {
    let options = ReplicaOptionsValidated::try_from(config.options.clone())
        .map_err(ReplicaCreationError::IllegalOptions)?;
    let logger = config.logger.clone();
    let clock = config.clock.clone();

    let (replica, commit_stream, event_listener) = replica::create_replica(config)?;

    let (actor_client, replica_actor) =
        actor::create(logger, ACTOR_QUEUE_SIZE, replica, clock, options.tick_interval);
    tokio::spawn(replica_actor.run_event_loop());

    Ok(ReplicaClient {
        replica: actor_client,
        commit_stream,
        event_listener,
    })
}
