//! Metrics support for the replicator

use std::sync::Arc;

use iroh_metrics::{Counter, MetricsGroup, MetricsGroupSet};

/// Metrics tracked by the replicator
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "replicants")]
pub struct Metrics {
    /*
     * Replicant lifecycle
     */
    /// Replicants created by a first declare.
    pub declares: Counter,
    /// Declares that returned an existing replicant.
    pub redeclares: Counter,
    /// Number of declares that failed.
    pub declares_rejected: Counter,

    /*
     * Mutations
     */
    /// Number of accepted whole-value assignments.
    pub assignments: Counter,
    /// Number of accepted operation batches.
    pub operation_batches: Counter,
    /// Number of accepted operations.
    pub operations: Counter,
    /// Number of mutations rejected by schema validation.
    pub validation_rejections: Counter,
    /// Number of remote mutations rejected as stale.
    pub staleness_rejections: Counter,
    /// Number of mutations rejected for reusing another replicant's value.
    pub ownership_rejections: Counter,

    /*
     * Persistence
     */
    /// Number of values written to the store.
    pub persistence_writes: Counter,
    /// Number of failed writes to the store.
    pub persistence_failures: Counter,
    /// Persisted values discarded because they failed to parse or validate.
    pub persisted_values_discarded: Counter,

    /*
     * Connections
     */
    /// Number of accepted connections.
    pub connections_accepted: Counter,
    /// Number of connections that went away.
    pub connections_closed: Counter,
    /// Number of messages received from clients.
    pub messages_recv: Counter,
    /// Number of messages received that could not be parsed.
    pub messages_invalid: Counter,
    /// Number of messages sent to clients.
    pub messages_sent: Counter,
    /// Number of messages dropped because a connection was busy or gone.
    pub messages_dropped: Counter,

    /*
     * HTTP
     */
    /// Number of HTTP requests
    pub http_requests: Counter,
    /// Number of HTTP requests with a 2xx status code
    pub http_requests_success: Counter,
    /// Number of HTTP requests with a non-2xx status code
    pub http_requests_error: Counter,
    /// Total duration of all HTTP requests
    pub http_requests_duration_ms: Counter,
}

/// All metrics tracked by the replicants server.
#[derive(Debug, Default, Clone, MetricsGroupSet)]
#[metrics(name = "replicants")]
pub struct ReplicantMetrics {
    /// Metrics tracked by the replicator.
    pub replicator: Arc<Metrics>,
}
