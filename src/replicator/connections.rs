//! Registry of the connections currently attached to a [`Replicator`].
//!
//! [`Replicator`]: super::Replicator

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};

use crate::{metrics::Metrics, protocol::ServerMessage, replicant::ReplicantKey};

/// Identifies one connection for its lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display,
)]
#[display("conn-{_0}")]
pub struct ConnectionId(u64);

/// The outbound queue of one connection.
///
/// Messages are delivered in the order they are queued, or not at all: a message that does
/// not fit closes the outbox, and the connection serving it shuts down.
#[derive(Debug, Clone)]
pub struct Outbox {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
}

/// Why a message did not make it into an [`Outbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The queue was full, the outbox is now closed.
    Full,
    /// The connection is gone.
    Closed,
}

impl Outbox {
    /// The connection this outbox belongs to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue `msg` without waiting.
    ///
    /// If the queue is full the outbox is closed instead, so the peer never misses a message
    /// without also losing the connection. It declares again after reconnecting.
    pub fn send(&self, msg: ServerMessage, metrics: &Metrics) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            metrics.messages_dropped.inc();
            return Err(SendError::Closed);
        }
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(conn = %self.id, "connection too busy, closing it");
                metrics.messages_dropped.inc();
                self.closed.cancel();
                Err(SendError::Full)
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn = %self.id, "can no longer write to connection, dropping message");
                metrics.messages_dropped.inc();
                Err(SendError::Closed)
            }
        }
    }

    /// Whether the outbox was closed after overflowing.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Completes when the outbox is closed.
    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

/// Manages all currently attached connections.
#[derive(Debug, Default, Clone)]
pub struct Connections(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    /// Replicants each connection is subscribed to.
    connections: DashMap<ConnectionId, HashSet<ReplicantKey>>,
    next_connection_id: AtomicU64,
}

impl Connections {
    /// Register a new connection with an outbound queue of `capacity` messages.
    pub fn register(&self, capacity: usize) -> (Outbox, mpsc::Receiver<ServerMessage>) {
        let id = ConnectionId(self.0.next_connection_id.fetch_add(1, Ordering::Relaxed));
        trace!(conn = %id, "registering connection");
        let (tx, rx) = mpsc::channel(capacity);
        self.0.connections.insert(id, HashSet::new());
        let outbox = Outbox {
            id,
            tx,
            closed: CancellationToken::new(),
        };
        (outbox, rx)
    }

    /// Remember that `id` is subscribed to `key`.
    pub fn add_subscription(&self, id: ConnectionId, key: ReplicantKey) {
        if let Some(mut subscriptions) = self.0.connections.get_mut(&id) {
            subscriptions.insert(key);
        }
    }

    /// Remove the connection, returning the replicants it was subscribed to.
    pub fn unregister(&self, id: ConnectionId) -> HashSet<ReplicantKey> {
        trace!(conn = %id, "unregistering connection");
        self.0
            .connections
            .remove(&id)
            .map(|(_, subscriptions)| subscriptions)
            .unwrap_or_default()
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.0.connections.len()
    }

    /// Whether no connection is attached.
    pub fn is_empty(&self) -> bool {
        self.0.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(reason: &str) -> ServerMessage {
        ServerMessage::OperationsRejected {
            namespace: "ns".into(),
            name: "n".into(),
            reason: reason.into(),
        }
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let connections = Connections::default();
        let (a, _rx_a) = connections.register(4);
        let (b, _rx_b) = connections.register(4);
        assert_ne!(a.id(), b.id());
        assert_eq!(connections.len(), 2);

        connections.add_subscription(a.id(), ReplicantKey::new("ns", "x"));
        connections.add_subscription(a.id(), ReplicantKey::new("ns", "y"));
        let subs = connections.unregister(a.id());
        assert_eq!(subs.len(), 2);
        assert_eq!(connections.len(), 1);
        assert!(connections.unregister(a.id()).is_empty());
    }

    #[tokio::test]
    async fn full_queue_closes_outbox() {
        let metrics = Metrics::default();
        let connections = Connections::default();
        let (outbox, mut rx) = connections.register(1);
        assert_eq!(outbox.send(rejected("1"), &metrics), Ok(()));
        assert!(!outbox.is_closed());
        assert_eq!(outbox.send(rejected("2"), &metrics), Err(SendError::Full));
        assert!(outbox.is_closed());
        outbox.closed().await;

        // room again, but the outbox stays closed
        assert_eq!(rx.recv().await, Some(rejected("1")));
        assert_eq!(outbox.send(rejected("3"), &metrics), Err(SendError::Closed));
        assert_eq!(metrics.messages_dropped.get(), 2);
    }

    #[tokio::test]
    async fn dropped_receiver_closes_queue() {
        let metrics = Metrics::default();
        let connections = Connections::default();
        let (outbox, rx) = connections.register(4);
        drop(rx);
        assert_eq!(outbox.send(rejected("1"), &metrics), Err(SendError::Closed));
        assert!(!outbox.is_closed());
        assert_eq!(metrics.messages_dropped.get(), 1);
    }
}
