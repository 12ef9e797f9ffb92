//! The authoritative, server-side replicant.
//!
//! A [`Replicant`] owns a JSON value identified by a [`ReplicantKey`]. Every accepted change
//! is validated against the replicant's schema before it becomes visible, bumps the revision
//! by one, is queued for persistence and is pushed to every subscribed connection except the
//! one it came from.

use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};

use nested_enum_utils::common_fields;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::{
    metrics::Metrics,
    operation::{self, ApplyError, Operation, ROOT},
    protocol::ServerMessage,
    recorder::{self, Assign, MutationError, NodeMut, NodeRef},
    replicator::connections::{ConnectionId, Outbox},
    schema::{Schema, SchemaError, SchemaSum},
    store::{
        self, SavePolicy, SaveScheduler, Store, StoreError,
        scheduler::Persist,
    },
};

/// Capacity of the in-process change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Identity of a replicant: its namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicantKey {
    namespace: String,
    name: String,
}

impl ReplicantKey {
    /// Create a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The namespace, usually the bundle the replicant belongs to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The name within the namespace.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ReplicantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.name)
    }
}

/// Replicant errors.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("a replicant needs a name"))]
    NameRequired {},
    #[snafu(display(
        "value of replicant {namespace}::{name} does not match its schema at {path}: {message}"
    ))]
    SchemaValidation {
        namespace: String,
        name: String,
        path: String,
        message: String,
    },
    #[snafu(display(
        "the value at {path} belongs to replicant {owner}, it cannot be assigned into {target}"
    ))]
    Ownership {
        owner: ReplicantKey,
        target: ReplicantKey,
        path: String,
    },
    #[snafu(display("stale change to replicant {namespace}::{name}: {reason}"))]
    Staleness {
        namespace: String,
        name: String,
        reason: String,
    },
    #[snafu(display("failed to persist replicant: {source}"))]
    Persistence { source: StoreError },
    #[snafu(display("invalid mutation of replicant {namespace}::{name}: {source}"))]
    Mutation {
        namespace: String,
        name: String,
        source: ApplyError,
    },
    #[snafu(display("failed to load schema: {source}"))]
    Schema { source: SchemaError },
    #[snafu(display("replicant {namespace}::{name} has not been declared"))]
    NotDeclared { namespace: String, name: String },
}

/// Options for declaring a replicant.
///
/// Only the first declare of a key uses `default_value` and `persistent`.
#[derive(Debug, Clone)]
pub struct ReplicantOptions {
    /// Value used when nothing valid is persisted.
    pub default_value: Option<Value>,
    /// Schema the value must conform to.
    pub schema: Option<Schema>,
    /// File to load the schema from, when `schema` is not given.
    pub schema_path: Option<PathBuf>,
    /// Whether the value is written to the store.
    pub persistent: bool,
    /// Time between the last change and the save, the replicator's default when `None`.
    pub persistence_interval: Option<Duration>,
}

impl Default for ReplicantOptions {
    fn default() -> Self {
        Self {
            default_value: None,
            schema: None,
            schema_path: None,
            persistent: true,
            persistence_interval: None,
        }
    }
}

impl ReplicantOptions {
    /// Set the default value.
    pub fn with_default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Set the schema.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Load the schema from `path`.
    pub fn with_schema_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema_path = Some(path.into());
        self
    }

    /// Set whether the value is persisted.
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set the persistence interval.
    pub fn with_persistence_interval(mut self, interval: Duration) -> Self {
        self.persistence_interval = Some(interval);
        self
    }

    /// The schema to use, loading it from `schema_path` if needed.
    pub(crate) fn resolve_schema(&self) -> Result<Option<Schema>, Error> {
        match (&self.schema, &self.schema_path) {
            (Some(schema), _) => Ok(Some(schema.clone())),
            (None, Some(path)) => Ok(Some(Schema::load(path).context(SchemaSnafu)?)),
            (None, None) => Ok(None),
        }
    }
}

/// A consistent point-in-time copy of a replicant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// The value, `None` when undefined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Number of accepted changes.
    pub revision: u64,
    /// Sum of the active schema.
    pub schema_sum: Option<SchemaSum>,
}

/// An accepted change, as seen by in-process listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Revision after the change.
    pub revision: u64,
    /// Value before the change.
    pub old: Option<Value>,
    /// Value after the change.
    pub new: Option<Value>,
    /// The operations, `None` for a whole-value assignment.
    pub operations: Option<Vec<Operation>>,
}

/// Shared handles a replicant needs from its replicator.
#[derive(Debug, Clone)]
pub(crate) struct Context {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) policy: SavePolicy,
    pub(crate) metrics: Arc<Metrics>,
}

/// The authoritative instance of a replicated value.
///
/// Cheap to clone, clones refer to the same replicant.
#[derive(Debug, Clone)]
pub struct Replicant(Arc<Inner>);

#[derive(derive_more::Debug)]
struct Inner {
    key: ReplicantKey,
    persistent: bool,
    state: Mutex<State>,
    store: Arc<dyn Store>,
    scheduler: Option<SaveScheduler>,
    #[debug(skip)]
    changes: broadcast::Sender<ChangeEvent>,
    #[debug(skip)]
    metrics: Arc<Metrics>,
}

#[derive(Debug)]
struct State {
    value: Option<Value>,
    revision: u64,
    schema: Option<Schema>,
    subscribers: BTreeMap<ConnectionId, Outbox>,
}

enum Change {
    Assignment,
    Operations(Vec<Operation>),
}

impl Replicant {
    /// Create a replicant, loading its persisted value.
    ///
    /// Persistent replicants must be created inside a tokio runtime.
    pub(crate) fn create(
        key: ReplicantKey,
        options: ReplicantOptions,
        ctx: &Context,
    ) -> Result<Self, Error> {
        let schema = options.resolve_schema()?;
        let default_value = options
            .default_value
            .or_else(|| schema.as_ref().and_then(Schema::default_value));
        if let Some(schema) = &schema {
            validate(&key, schema, default_value.as_ref(), &ctx.metrics)?;
        }

        let persisted = if options.persistent {
            load_persisted(&key, ctx.store.as_ref(), schema.as_ref(), &ctx.metrics)
        } else {
            None
        };
        let from_store = persisted.is_some();
        let value = persisted.or(default_value);
        debug!(replicant = %key, from_store, "declared");

        let policy = match options.persistence_interval {
            Some(interval) => ctx.policy.with_interval(interval),
            None => ctx.policy,
        };
        let persistent = options.persistent;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let scheduler = persistent.then(|| {
                let target: Weak<dyn Persist> = weak.clone();
                SaveScheduler::spawn(target, policy)
            });
            Inner {
                key,
                persistent,
                state: Mutex::new(State {
                    value,
                    revision: 0,
                    schema,
                    subscribers: BTreeMap::new(),
                }),
                store: ctx.store.clone(),
                scheduler,
                changes,
                metrics: ctx.metrics.clone(),
            }
        });
        Ok(Self(inner))
    }

    /// The identity of this replicant.
    pub fn key(&self) -> &ReplicantKey {
        &self.0.key
    }

    /// The namespace.
    pub fn namespace(&self) -> &str {
        self.0.key.namespace()
    }

    /// The name.
    pub fn name(&self) -> &str {
        self.0.key.name()
    }

    /// Whether changes are written to the store.
    pub fn is_persistent(&self) -> bool {
        self.0.persistent
    }

    /// A copy of the current value.
    pub fn value(&self) -> Option<Value> {
        self.0.state.lock().value.clone()
    }

    /// Number of accepted changes since the declare.
    pub fn revision(&self) -> u64 {
        self.0.state.lock().revision
    }

    /// The active schema.
    pub fn schema(&self) -> Option<Schema> {
        self.0.state.lock().schema.clone()
    }

    /// Sum of the active schema.
    pub fn schema_sum(&self) -> Option<SchemaSum> {
        self.0.state.lock().schema.as_ref().map(|s| s.sum().clone())
    }

    /// Value and revision, taken together.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.0.state.lock();
        Snapshot {
            value: state.value.clone(),
            revision: state.revision,
            schema_sum: state.schema.as_ref().map(|s| s.sum().clone()),
        }
    }

    /// A handle to the node at `path`, for assigning it elsewhere in this replicant.
    pub fn node_ref(&self, path: &str) -> Option<NodeRef> {
        let state = self.0.state.lock();
        let value = operation::resolve(state.value.as_ref()?, path)?;
        Some(NodeRef::new(self.0.key.clone(), path, value.clone()))
    }

    /// Whether both handles refer to the same replicant.
    pub fn ptr_eq(&self, other: &Replicant) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Receive every accepted change.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.0.changes.subscribe()
    }

    /// Number of connections subscribed to this replicant.
    pub fn subscriber_count(&self) -> usize {
        self.0.state.lock().subscribers.len()
    }

    /// Replace the whole value.
    pub fn assign(&self, value: impl Into<Assign>) -> Result<(), Error> {
        let value = value
            .into()
            .into_owned_by(&self.0.key)
            .map_err(|err| self.mutation_error(err))?;
        let mut state = self.0.state.lock();
        if let Some(schema) = &state.schema {
            validate(&self.0.key, schema, Some(&value), &self.0.metrics)?;
        }
        self.commit(&mut state, Some(value), Change::Assignment, None);
        Ok(())
    }

    /// Run one mutation turn.
    ///
    /// All mutations made through the [`NodeMut`] form one batch: the batch is validated as a
    /// whole and is either applied completely, bumping the revision once, or not at all. A
    /// turn that changes nothing leaves the revision alone.
    ///
    /// The closure runs with this replicant locked and must not access it.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(NodeMut<'_>) -> Result<R, MutationError>,
    ) -> Result<R, Error> {
        let mut state = self.0.state.lock();
        let (out, scratch, operations) =
            recorder::record_operations(&self.0.key, state.value.clone(), f)
                .map_err(|err| self.mutation_error(err))?;
        if operations.is_empty() {
            return Ok(out);
        }
        if let Some(schema) = &state.schema {
            validate(&self.0.key, schema, scratch.as_ref(), &self.0.metrics)?;
        }
        self.commit(&mut state, scratch, Change::Operations(operations), None);
        Ok(out)
    }

    /// Apply a batch of operations received from connection `origin`.
    ///
    /// The batch must have been computed against the current revision and schema.
    pub fn apply_remote_operations(
        &self,
        origin: ConnectionId,
        operations: Vec<Operation>,
        revision: u64,
        schema_sum: Option<&SchemaSum>,
    ) -> Result<(), Error> {
        let mut state = self.0.state.lock();
        self.check_schema_sum(&state, schema_sum)?;
        if revision != state.revision {
            self.0.metrics.staleness_rejections.inc();
            return StalenessSnafu {
                namespace: self.namespace(),
                name: self.name(),
                reason: format!(
                    "operations computed against revision {revision}, current revision is {}",
                    state.revision
                ),
            }
            .fail();
        }
        if operations.is_empty() {
            return Ok(());
        }
        let mut scratch = match state.value.clone() {
            Some(value) => value,
            None => {
                let err = operation::PathNotFoundSnafu { path: ROOT }.build();
                return Err(self.apply_error(err));
            }
        };
        operation::apply_operations(&mut scratch, &operations)
            .map_err(|err| self.apply_error(err))?;
        if let Some(schema) = &state.schema {
            validate(&self.0.key, schema, Some(&scratch), &self.0.metrics)?;
        }
        trace!(replicant = %self.0.key, %origin, revision, "applying remote operations");
        self.commit(
            &mut state,
            Some(scratch),
            Change::Operations(operations),
            Some(origin),
        );
        Ok(())
    }

    /// Apply a whole-value assignment received from connection `origin`.
    ///
    /// Only the schema sum is checked: the last assignment wins. A sender whose revision was
    /// behind receives a fresh snapshot afterwards.
    pub fn apply_remote_assignment(
        &self,
        origin: ConnectionId,
        value: Option<Value>,
        revision: u64,
        schema_sum: Option<&SchemaSum>,
    ) -> Result<(), Error> {
        let mut state = self.0.state.lock();
        self.check_schema_sum(&state, schema_sum)?;
        if let Some(schema) = &state.schema {
            validate(&self.0.key, schema, value.as_ref(), &self.0.metrics)?;
        }
        let behind = revision != state.revision;
        self.commit(&mut state, value, Change::Assignment, Some(origin));
        if behind {
            debug!(replicant = %self.0.key, %origin, "assignment from stale revision, resending snapshot");
            let msg = self.declared_message(&state);
            if let Some(outbox) = state.subscribers.get(&origin) {
                outbox.send(msg, &self.0.metrics).ok();
            }
        }
        Ok(())
    }

    /// Subscribe a connection, sending it exactly one snapshot.
    ///
    /// Subscribing again resends the snapshot. Returns whether the snapshot was queued, the
    /// connection is only subscribed if it was.
    pub(crate) fn subscribe(&self, outbox: Outbox) -> bool {
        let mut state = self.0.state.lock();
        let msg = self.declared_message(&state);
        match outbox.send(msg, &self.0.metrics) {
            Ok(()) => {
                state.subscribers.insert(outbox.id(), outbox);
                true
            }
            Err(err) => {
                debug!(replicant = %self.0.key, conn = %outbox.id(), ?err, "failed to send snapshot");
                state.subscribers.remove(&outbox.id());
                false
            }
        }
    }

    /// Remove a connection from the subscribers.
    pub(crate) fn unsubscribe(&self, id: ConnectionId) {
        self.0.state.lock().subscribers.remove(&id);
    }

    /// Switch to `schema` if it differs from the active one.
    ///
    /// The current value must conform to the new schema, otherwise the active schema stays.
    /// Returns whether the schema changed.
    pub(crate) fn update_schema(&self, schema: Schema) -> Result<bool, Error> {
        let mut state = self.0.state.lock();
        if state.schema.as_ref().map(Schema::sum) == Some(schema.sum()) {
            return Ok(false);
        }
        validate(&self.0.key, &schema, state.value.as_ref(), &self.0.metrics)?;
        debug!(replicant = %self.0.key, sum = %schema.sum(), "schema changed");
        state.schema = Some(schema);
        Ok(true)
    }

    /// Write a pending change to the store right away.
    pub async fn flush(&self) -> Result<(), Error> {
        if let Some(scheduler) = &self.0.scheduler {
            scheduler.flush_now().await.context(PersistenceSnafu)?;
        }
        Ok(())
    }

    fn commit(
        &self,
        state: &mut State,
        value: Option<Value>,
        change: Change,
        origin: Option<ConnectionId>,
    ) {
        let pre_revision = state.revision;
        let old = std::mem::replace(&mut state.value, value);
        state.revision += 1;
        let schema_sum = state.schema.as_ref().map(|s| s.sum().clone());
        let operations = match change {
            Change::Assignment => {
                self.0.metrics.assignments.inc();
                None
            }
            Change::Operations(operations) => {
                self.0.metrics.operation_batches.inc();
                self.0.metrics.operations.inc_by(operations.len() as u64);
                Some(operations)
            }
        };
        trace!(replicant = %self.0.key, revision = state.revision, "committed");

        let msg = match &operations {
            None => ServerMessage::Assignment {
                namespace: self.namespace().to_string(),
                name: self.name().to_string(),
                value: state.value.clone(),
                revision: pre_revision,
                schema_sum,
            },
            Some(operations) => ServerMessage::Operations {
                namespace: self.namespace().to_string(),
                name: self.name().to_string(),
                operations: operations.clone(),
                revision: pre_revision,
                schema_sum,
            },
        };
        self.broadcast(state, msg, origin);

        if let Some(scheduler) = &self.0.scheduler {
            scheduler.schedule();
        }
        if self.0.changes.receiver_count() > 0 {
            let event = ChangeEvent {
                revision: state.revision,
                old,
                new: state.value.clone(),
                operations,
            };
            self.0.changes.send(event).ok();
        }
    }

    /// Push `msg` to every subscriber except `origin`.
    fn broadcast(&self, state: &mut State, msg: ServerMessage, origin: Option<ConnectionId>) {
        let mut closed = Vec::new();
        for (id, outbox) in state.subscribers.iter() {
            if Some(*id) == origin {
                continue;
            }
            if outbox.send(msg.clone(), &self.0.metrics).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            state.subscribers.remove(&id);
        }
    }

    fn declared_message(&self, state: &State) -> ServerMessage {
        ServerMessage::Declared {
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
            value: state.value.clone(),
            revision: state.revision,
            schema_sum: state.schema.as_ref().map(|s| s.sum().clone()),
            schema: state.schema.as_ref().map(|s| s.json().clone()),
        }
    }

    fn check_schema_sum(&self, state: &State, schema_sum: Option<&SchemaSum>) -> Result<(), Error> {
        let current = state.schema.as_ref().map(Schema::sum);
        if current == schema_sum {
            return Ok(());
        }
        self.0.metrics.staleness_rejections.inc();
        StalenessSnafu {
            namespace: self.namespace(),
            name: self.name(),
            reason: format!(
                "schema sum {} does not match current schema sum {}",
                fmt_sum(schema_sum),
                fmt_sum(current)
            ),
        }
        .fail()
    }

    fn mutation_error(&self, err: MutationError) -> Error {
        match err {
            MutationError::Ownership {
                owner,
                target,
                path,
                ..
            } => {
                self.0.metrics.ownership_rejections.inc();
                OwnershipSnafu {
                    owner,
                    target,
                    path,
                }
                .build()
            }
            MutationError::Apply { source, .. } => self.apply_error(source),
            MutationError::Undeclared { .. } => NotDeclaredSnafu {
                namespace: self.namespace(),
                name: self.name(),
            }
            .build(),
        }
    }

    fn apply_error(&self, err: ApplyError) -> Error {
        MutationSnafu {
            namespace: self.namespace(),
            name: self.name(),
        }
        .into_error(err)
    }
}

impl Persist for Inner {
    fn persist(&self) -> Result<(), StoreError> {
        let text = store::serialize_value(self.state.lock().value.as_ref())?;
        let res = self
            .store
            .save(self.key.namespace(), self.key.name(), &text);
        match &res {
            Ok(()) => self.metrics.persistence_writes.inc(),
            Err(_) => self.metrics.persistence_failures.inc(),
        };
        res
    }
}

fn fmt_sum(sum: Option<&SchemaSum>) -> String {
    sum.map(|s| s.to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

fn validate(
    key: &ReplicantKey,
    schema: &Schema,
    value: Option<&Value>,
    metrics: &Metrics,
) -> Result<(), Error> {
    schema.validate(value).map_err(|failure| {
        metrics.validation_rejections.inc();
        SchemaValidationSnafu {
            namespace: key.namespace(),
            name: key.name(),
            path: failure.path,
            message: failure.message,
        }
        .build()
    })
}

/// The persisted value, if there is one that parses and validates.
fn load_persisted(
    key: &ReplicantKey,
    store: &dyn Store,
    schema: Option<&Schema>,
    metrics: &Metrics,
) -> Option<Value> {
    let text = match store.load(key.namespace(), key.name()) {
        Ok(Some(text)) => text,
        Ok(None) => return None,
        Err(err) => {
            warn!(replicant = %key, "failed to load persisted value: {err:#}");
            metrics.persistence_failures.inc();
            return None;
        }
    };
    let value = match store::parse_value(&text) {
        Ok(value) => value?,
        Err(err) => {
            warn!(replicant = %key, "discarding persisted value that is not valid JSON: {err}");
            metrics.persisted_values_discarded.inc();
            return None;
        }
    };
    if let Some(schema) = schema {
        if let Err(failure) = schema.validate(Some(&value)) {
            warn!(replicant = %key, "discarding persisted value that does not match the schema: {failure}");
            metrics.persisted_values_discarded.inc();
            return None;
        }
    }
    Some(value)
}
