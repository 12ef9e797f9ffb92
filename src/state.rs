//! Shared state for the HTTP handlers

use crate::replicator::Replicator;

/// The shared app state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The replicants served by this process
    pub replicator: Replicator,
}
