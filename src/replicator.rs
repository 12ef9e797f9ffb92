//! The registry of replicants and its remote protocol endpoint.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    metrics::Metrics,
    protocol::{ClientMessage, DeclareOptions, ServerMessage},
    replicant::{
        Context, Error, NameRequiredSnafu, NotDeclaredSnafu, Replicant, ReplicantKey,
        ReplicantOptions,
    },
    store::{SavePolicy, Store},
};

pub use self::connection::{ConnectionError, serve_connection};

mod connection;
pub mod connections;

use self::connections::{Connections, Outbox};

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// Builder for a [`Replicator`].
#[derive(Debug)]
pub struct Builder {
    store: Arc<dyn Store>,
    policy: SavePolicy,
    schemas: BTreeMap<ReplicantKey, PathBuf>,
    metrics: Arc<Metrics>,
    channel_capacity: usize,
}

impl Builder {
    /// Set the save timing used when a declare does not give an interval.
    pub fn save_policy(mut self, policy: SavePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Use the schema at `path` for `namespace::name` when it is declared without one.
    pub fn schema(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        self.schemas
            .insert(ReplicantKey::new(namespace, name), path.into());
        self
    }

    /// Record metrics into `metrics`.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the capacity of each connection's outbound queue.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Create the replicator.
    pub fn build(self) -> Replicator {
        Replicator(Arc::new(Inner {
            replicants: Default::default(),
            ctx: Context {
                store: self.store,
                policy: self.policy,
                metrics: self.metrics,
            },
            schemas: self.schemas,
            connections: Connections::default(),
            channel_capacity: self.channel_capacity,
            shutdown: CancellationToken::new(),
        }))
    }
}

/// Owns every replicant of a process and serves them to connections.
///
/// There is at most one replicant per `(namespace, name)`. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Replicator(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    replicants: Mutex<BTreeMap<ReplicantKey, Replicant>>,
    ctx: Context,
    schemas: BTreeMap<ReplicantKey, PathBuf>,
    connections: Connections,
    channel_capacity: usize,
    shutdown: CancellationToken,
}

impl Replicator {
    /// A replicator with default settings persisting into `store`.
    pub fn new(store: impl Store) -> Self {
        Self::builder(Arc::new(store)).build()
    }

    /// Start building a replicator persisting into `store`.
    pub fn builder(store: Arc<dyn Store>) -> Builder {
        Builder {
            store,
            policy: SavePolicy::default(),
            schemas: BTreeMap::new(),
            metrics: Default::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Create the replicant `namespace::name`, or return the existing one.
    ///
    /// For an existing replicant only the schema of `options` is used: if it differs from the
    /// active schema and the current value conforms to it, it becomes active, otherwise the
    /// declare fails and the active schema stays.
    pub fn declare(
        &self,
        namespace: &str,
        name: &str,
        options: ReplicantOptions,
    ) -> Result<Replicant, Error> {
        let res = self.create_or_update(namespace, name, options);
        if let Err(err) = &res {
            self.0.ctx.metrics.declares_rejected.inc();
            debug!(%namespace, %name, "declare failed: {err}");
        }
        res
    }

    fn create_or_update(
        &self,
        namespace: &str,
        name: &str,
        mut options: ReplicantOptions,
    ) -> Result<Replicant, Error> {
        if name.is_empty() {
            return NameRequiredSnafu.fail();
        }
        let key = ReplicantKey::new(namespace, name);
        if options.schema.is_none() && options.schema_path.is_none() {
            options.schema_path = self.0.schemas.get(&key).cloned();
        }
        let mut replicants = self.0.replicants.lock();
        if let Some(existing) = replicants.get(&key) {
            self.0.ctx.metrics.redeclares.inc();
            if let Some(schema) = options.resolve_schema()? {
                existing.update_schema(schema)?;
            }
            return Ok(existing.clone());
        }
        let replicant = Replicant::create(key.clone(), options, &self.0.ctx)?;
        self.0.ctx.metrics.declares.inc();
        replicants.insert(key, replicant.clone());
        Ok(replicant)
    }

    /// The replicant `namespace::name`, if declared.
    pub fn find(&self, namespace: &str, name: &str) -> Option<Replicant> {
        self.get(&ReplicantKey::new(namespace, name))
    }

    /// The replicant with `key`, if declared.
    pub fn get(&self, key: &ReplicantKey) -> Option<Replicant> {
        self.0.replicants.lock().get(key).cloned()
    }

    /// All declared replicants, optionally only those in `namespace`, ordered by key.
    pub fn find_all(&self, namespace: Option<&str>) -> Vec<Replicant> {
        self.0
            .replicants
            .lock()
            .values()
            .filter(|r| namespace.is_none_or(|ns| r.namespace() == ns))
            .cloned()
            .collect()
    }

    /// Write every pending change to the store right away.
    ///
    /// All replicants are flushed even if some fail, the first failure is returned.
    pub async fn save_all_now(&self) -> Result<(), Error> {
        let replicants = self.find_all(None);
        let mut res = Ok(());
        for replicant in replicants {
            if let Err(err) = replicant.flush().await {
                warn!(replicant = %replicant.key(), "failed to save: {err:#}");
                if res.is_ok() {
                    res = Err(err);
                }
            }
        }
        res
    }

    /// The attached connections.
    pub fn connections(&self) -> &Connections {
        &self.0.connections
    }

    /// The metrics this replicator records.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.0.ctx.metrics
    }

    /// Close all connections served by [`serve_connection`].
    pub fn shutdown(&self) {
        self.0.shutdown.cancel();
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.0.shutdown
    }

    pub(crate) fn channel_capacity(&self) -> usize {
        self.0.channel_capacity
    }

    /// Handle one message from the connection owning `outbox`.
    ///
    /// Failures are reported back through `outbox` as rejections.
    pub fn handle_message(&self, outbox: &Outbox, msg: ClientMessage) {
        let metrics = &self.0.ctx.metrics;
        match msg {
            ClientMessage::Declare {
                namespace,
                name,
                opts,
            } => match self.declare(&namespace, &name, remote_options(opts)) {
                Ok(replicant) => {
                    if replicant.subscribe(outbox.clone()) {
                        self.0
                            .connections
                            .add_subscription(outbox.id(), replicant.key().clone());
                    }
                }
                Err(err) => {
                    warn!(conn = %outbox.id(), %namespace, %name, "declaration rejected: {err}");
                    let reason = err.to_string();
                    let msg = ServerMessage::DeclarationRejected {
                        namespace,
                        name,
                        reason,
                    };
                    outbox.send(msg, metrics).ok();
                }
            },
            ClientMessage::Operations {
                namespace,
                name,
                operations,
                revision,
                schema_sum,
            } => {
                let res = self.find_declared(&namespace, &name).and_then(|r| {
                    r.apply_remote_operations(outbox.id(), operations, revision, schema_sum.as_ref())
                });
                if let Err(err) = res {
                    debug!(conn = %outbox.id(), %namespace, %name, "operations rejected: {err}");
                    let reason = err.to_string();
                    let msg = ServerMessage::OperationsRejected {
                        namespace,
                        name,
                        reason,
                    };
                    outbox.send(msg, metrics).ok();
                }
            }
            ClientMessage::Assignment {
                namespace,
                name,
                value,
                revision,
                schema_sum,
            } => {
                let res = self.find_declared(&namespace, &name).and_then(|r| {
                    r.apply_remote_assignment(outbox.id(), value, revision, schema_sum.as_ref())
                });
                if let Err(err) = res {
                    debug!(conn = %outbox.id(), %namespace, %name, "assignment rejected: {err}");
                    let reason = err.to_string();
                    let msg = ServerMessage::AssignmentRejected {
                        namespace,
                        name,
                        reason,
                    };
                    outbox.send(msg, metrics).ok();
                }
            }
        }
    }

    fn find_declared(&self, namespace: &str, name: &str) -> Result<Replicant, Error> {
        match self.find(namespace, name) {
            Some(replicant) => Ok(replicant),
            None => NotDeclaredSnafu { namespace, name }.fail(),
        }
    }

    /// Detach connection `id` from every replicant it subscribed to.
    pub(crate) fn disconnect(&self, id: connections::ConnectionId) {
        for key in self.0.connections.unregister(id) {
            if let Some(replicant) = self.get(&key) {
                replicant.unsubscribe(id);
            }
        }
    }
}

fn remote_options(opts: DeclareOptions) -> ReplicantOptions {
    ReplicantOptions {
        default_value: opts.default_value,
        persistent: opts.persistent.unwrap_or(true),
        persistence_interval: opts.persistence_interval.map(Duration::from_millis),
        ..Default::default()
    }
}
