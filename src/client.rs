//! Client-side mirrors of replicants.
//!
//! A [`ClientReplicant`] holds a local copy of a server replicant. It does not do any IO:
//! it writes [`ClientMessage`]s into an outbound channel and is fed [`ServerMessage`]s
//! through [`ClientReplicant::handle`]. A [`Session`] multiplexes several mirrors over one
//! connection and [`ws`] drives a session over a websocket.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::{
    operation::{self, Operation},
    protocol::{ClientMessage, DeclareOptions, ServerMessage},
    recorder::{self, Assign, MutationError, NodeMut, NodeRef},
    replicant::ReplicantKey,
    schema::SchemaSum,
};

pub use self::session::Session;

mod session;
pub mod ws;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened to a [`ClientReplicant`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A snapshot arrived from the server.
    Declared {
        value: Option<Value>,
        revision: u64,
    },
    /// The value changed.
    Change {
        old: Option<Value>,
        new: Option<Value>,
        /// The operations, `None` for a whole-value assignment.
        operations: Option<Vec<Operation>>,
        /// Whether the change was made by this client.
        local: bool,
    },
    /// The server refused the declare.
    DeclarationRejected { reason: String },
    /// The server refused a batch of operations, the value was rolled back.
    OperationsRejected { reason: String },
    /// The server refused an assignment, the value was rolled back.
    AssignmentRejected { reason: String },
}

/// Where a mirror is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The declare was refused.
    Undeclared,
    /// A declare was sent, no snapshot yet.
    AwaitingSnapshot,
    /// The mirror holds a snapshot and follows the server.
    Declared,
}

#[derive(Debug)]
enum Queued {
    Assignment(Option<Value>),
    Operations(Vec<Operation>),
}

/// Local copy of a server replicant.
///
/// Cheap to clone, clones refer to the same mirror.
#[derive(Debug, Clone)]
pub struct ClientReplicant(Arc<Mutex<Mirror>>);

#[derive(Debug)]
struct Mirror {
    key: ReplicantKey,
    opts: DeclareOptions,
    status: Status,
    value: Option<Value>,
    revision: u64,
    schema_sum: Option<SchemaSum>,
    /// Last value and revision the server is known to have.
    confirmed: (Option<Value>, u64),
    /// Changes made before the first snapshot arrived.
    queue: Vec<Queued>,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientReplicant {
    /// Create a mirror and send its declare into `outbox`.
    pub fn new(
        key: ReplicantKey,
        opts: DeclareOptions,
        outbox: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut mirror = Mirror {
            value: opts.default_value.clone(),
            key,
            opts,
            status: Status::AwaitingSnapshot,
            revision: 0,
            schema_sum: None,
            confirmed: (None, 0),
            queue: Vec::new(),
            outbox,
            events,
        };
        mirror.send_declare();
        Self(Arc::new(Mutex::new(mirror)))
    }

    /// The identity of the mirrored replicant.
    pub fn key(&self) -> ReplicantKey {
        self.0.lock().key.clone()
    }

    /// Where the mirror is in its lifecycle.
    pub fn status(&self) -> Status {
        self.0.lock().status
    }

    /// The current value.
    ///
    /// Before the first snapshot arrived this logs a warning and returns `None`.
    pub fn value(&self) -> Option<Value> {
        let mirror = self.0.lock();
        if mirror.status != Status::Declared {
            warn!(replicant = %mirror.key, "value read before the replicant was declared");
            return None;
        }
        mirror.value.clone()
    }

    /// Number of changes the mirror has seen since the snapshot's revision 0.
    pub fn revision(&self) -> u64 {
        self.0.lock().revision
    }

    /// Sum of the schema the server validates with.
    pub fn schema_sum(&self) -> Option<SchemaSum> {
        self.0.lock().schema_sum.clone()
    }

    /// Receive events about this mirror.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.0.lock().events.subscribe()
    }

    /// A handle to the node at `path`.
    pub fn node_ref(&self, path: &str) -> Option<NodeRef> {
        let mirror = self.0.lock();
        let value = operation::resolve(mirror.value.as_ref()?, path)?;
        Some(NodeRef::new(mirror.key.clone(), path, value.clone()))
    }

    /// Replace the whole value.
    ///
    /// Fails with [`MutationError::Undeclared`] once the server rejected the declare, until
    /// [`Self::redeclare`] is called.
    pub fn assign(&self, value: impl Into<Assign>) -> Result<(), MutationError> {
        let mut mirror = self.0.lock();
        mirror.ensure_not_rejected()?;
        let value = value.into().into_owned_by(&mirror.key)?;
        mirror.local_assignment(Some(value));
        Ok(())
    }

    /// Run one mutation turn, see [`crate::replicant::Replicant::mutate`].
    ///
    /// The change is applied locally right away and sent to the server, which may still
    /// reject it. The closure must not access this mirror.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(NodeMut<'_>) -> Result<R, MutationError>,
    ) -> Result<R, MutationError> {
        let mut mirror = self.0.lock();
        mirror.ensure_not_rejected()?;
        let (out, value, operations) =
            recorder::record_operations(&mirror.key, mirror.value.clone(), f)?;
        if !operations.is_empty() {
            mirror.local_operations(value, operations);
        }
        Ok(out)
    }

    /// Process a message from the server about this replicant.
    pub fn handle(&self, msg: ServerMessage) {
        self.0.lock().handle(msg)
    }

    /// Declare again, for example on a new connection.
    pub fn redeclare(&self) {
        self.0.lock().resync()
    }
}

impl Mirror {
    fn emit(&self, event: ClientEvent) {
        self.events.send(event).ok();
    }

    fn send(&self, msg: ClientMessage) {
        if self.outbox.send(msg).is_err() {
            debug!(replicant = %self.key, "session closed, dropping message");
        }
    }

    fn send_declare(&mut self) {
        self.status = Status::AwaitingSnapshot;
        self.send(ClientMessage::Declare {
            namespace: self.key.namespace().to_string(),
            name: self.key.name().to_string(),
            opts: self.opts.clone(),
        });
    }

    /// Drop the local state and ask the server for a fresh snapshot.
    fn resync(&mut self) {
        debug!(replicant = %self.key, revision = self.revision, "resyncing");
        self.send_declare();
    }

    /// Local changes are refused once the server rejected the declare.
    fn ensure_not_rejected(&self) -> Result<(), MutationError> {
        if self.status == Status::Undeclared {
            return recorder::UndeclaredSnafu {
                replicant: self.key.clone(),
            }
            .fail();
        }
        Ok(())
    }

    fn rollback(&mut self) {
        let (value, revision) = self.confirmed.clone();
        self.value = value;
        self.revision = revision;
    }

    fn confirm(&mut self) {
        self.confirmed = (self.value.clone(), self.revision);
    }

    fn local_assignment(&mut self, value: Option<Value>) {
        let old = std::mem::replace(&mut self.value, value);
        if self.status != Status::Declared {
            self.queue.push(Queued::Assignment(self.value.clone()));
            return;
        }
        self.send(ClientMessage::Assignment {
            namespace: self.key.namespace().to_string(),
            name: self.key.name().to_string(),
            value: self.value.clone(),
            revision: self.revision,
            schema_sum: self.schema_sum.clone(),
        });
        self.revision += 1;
        self.emit(ClientEvent::Change {
            old,
            new: self.value.clone(),
            operations: None,
            local: true,
        });
    }

    fn local_operations(&mut self, value: Option<Value>, operations: Vec<Operation>) {
        let old = std::mem::replace(&mut self.value, value);
        if self.status != Status::Declared {
            self.queue.push(Queued::Operations(operations));
            return;
        }
        self.send(ClientMessage::Operations {
            namespace: self.key.namespace().to_string(),
            name: self.key.name().to_string(),
            operations: operations.clone(),
            revision: self.revision,
            schema_sum: self.schema_sum.clone(),
        });
        self.revision += 1;
        self.emit(ClientEvent::Change {
            old,
            new: self.value.clone(),
            operations: Some(operations),
            local: true,
        });
    }

    fn handle(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Declared {
                value,
                revision,
                schema_sum,
                ..
            } => self.on_snapshot(value, revision, schema_sum),
            ServerMessage::Operations {
                operations,
                revision,
                schema_sum,
                ..
            } => {
                if self.status != Status::Declared {
                    trace!(replicant = %self.key, "ignoring operations before snapshot");
                    return;
                }
                if revision != self.revision || schema_sum != self.schema_sum {
                    debug!(replicant = %self.key, local = self.revision, remote = revision, "out of sync");
                    return self.resync();
                }
                let Some(mut scratch) = self.value.clone() else {
                    return self.resync();
                };
                if let Err(err) = operation::apply_operations(&mut scratch, &operations) {
                    warn!(replicant = %self.key, "failed to apply remote operations: {err}");
                    return self.resync();
                }
                let old = self.value.replace(scratch);
                self.revision += 1;
                self.confirm();
                self.emit(ClientEvent::Change {
                    old,
                    new: self.value.clone(),
                    operations: Some(operations),
                    local: false,
                });
            }
            ServerMessage::Assignment {
                value,
                revision,
                schema_sum,
                ..
            } => {
                if self.status != Status::Declared {
                    trace!(replicant = %self.key, "ignoring assignment before snapshot");
                    return;
                }
                if revision != self.revision || schema_sum != self.schema_sum {
                    debug!(replicant = %self.key, local = self.revision, remote = revision, "out of sync");
                    return self.resync();
                }
                let old = std::mem::replace(&mut self.value, value);
                self.revision += 1;
                self.confirm();
                self.emit(ClientEvent::Change {
                    old,
                    new: self.value.clone(),
                    operations: None,
                    local: false,
                });
            }
            ServerMessage::DeclarationRejected { reason, .. } => {
                warn!(replicant = %self.key, "declaration rejected: {reason}");
                self.status = Status::Undeclared;
                self.queue.clear();
                self.emit(ClientEvent::DeclarationRejected { reason });
            }
            ServerMessage::OperationsRejected { reason, .. } => {
                warn!(replicant = %self.key, "operations rejected: {reason}");
                self.rollback();
                self.emit(ClientEvent::OperationsRejected { reason });
                self.resync();
            }
            ServerMessage::AssignmentRejected { reason, .. } => {
                warn!(replicant = %self.key, "assignment rejected: {reason}");
                self.rollback();
                self.emit(ClientEvent::AssignmentRejected { reason });
                self.resync();
            }
        }
    }

    fn on_snapshot(&mut self, value: Option<Value>, revision: u64, schema_sum: Option<SchemaSum>) {
        self.value = value;
        self.revision = revision;
        self.schema_sum = schema_sum;
        self.status = Status::Declared;
        self.confirm();
        self.emit(ClientEvent::Declared {
            value: self.value.clone(),
            revision,
        });

        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            return;
        }
        if revision != 0 {
            // the server value already carries an earlier session's changes
            debug!(replicant = %self.key, count = queue.len(), "discarding changes made before declare");
            return;
        }
        for queued in queue {
            match queued {
                Queued::Assignment(value) => self.local_assignment(value),
                Queued::Operations(operations) => {
                    let Some(mut scratch) = self.value.clone() else {
                        warn!(replicant = %self.key, "dropping queued operations on an undefined value");
                        continue;
                    };
                    match operation::apply_operations(&mut scratch, &operations) {
                        Ok(()) => self.local_operations(Some(scratch), operations),
                        Err(err) => {
                            warn!(replicant = %self.key, "dropping queued operations: {err}");
                        }
                    }
                }
            }
        }
    }
}
