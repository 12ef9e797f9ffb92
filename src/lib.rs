//! Server-authoritative shared JSON state, validated against JSON schemas, persisted and
//! synchronized to clients over websockets.
//!
//! A [`Replicator`] owns every [`Replicant`] of a process. Local code changes a replicant with
//! [`Replicant::assign`] or [`Replicant::mutate`], remote clients through the messages in
//! [`protocol`]. Every accepted change is fanned out to the other subscribed connections.

pub mod client;
pub mod config;
pub mod http;
pub mod metrics;
pub mod operation;
pub mod protocol;
pub mod recorder;
pub mod replicant;
pub mod replicator;
pub mod schema;
pub mod server;
pub mod state;
pub mod store;

pub use self::{
    replicant::{Replicant, ReplicantKey, ReplicantOptions},
    replicator::Replicator,
    store::Store,
};
