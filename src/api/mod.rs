//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
mod options;
mod wiring;

pub use client::ReplicaClient;
pub use options::ReplicaOptions;
pub use wiring::try_create_replica;

// So the replica can read its validated options.
pub(crate) use options::ReplicaOptionsValidated;
