//! Several mirrors sharing one connection.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::ClientReplicant;
use crate::{
    protocol::{ClientMessage, DeclareOptions, ServerMessage},
    replicant::ReplicantKey,
};

/// Routes server messages to the mirrors declared on one connection.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Session(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    mirrors: Mutex<HashMap<ReplicantKey, ClientReplicant>>,
    outbox: mpsc::UnboundedSender<ClientMessage>,
}

impl Session {
    /// Create a session, returning the channel of messages to send to the server.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let session = Self(Arc::new(Inner {
            mirrors: Default::default(),
            outbox,
        }));
        (session, rx)
    }

    /// The mirror of `namespace::name`, declaring it if this session has none yet.
    pub fn declare(&self, namespace: &str, name: &str, opts: DeclareOptions) -> ClientReplicant {
        let key = ReplicantKey::new(namespace, name);
        self.0
            .mirrors
            .lock()
            .entry(key.clone())
            .or_insert_with(|| ClientReplicant::new(key, opts, self.0.outbox.clone()))
            .clone()
    }

    /// The mirror of `namespace::name`, if declared.
    pub fn get(&self, namespace: &str, name: &str) -> Option<ClientReplicant> {
        self.0
            .mirrors
            .lock()
            .get(&ReplicantKey::new(namespace, name))
            .cloned()
    }

    /// Hand `msg` to the mirror it is about.
    pub fn handle(&self, msg: ServerMessage) {
        let (namespace, name) = msg.target();
        let mirror = self.get(namespace, name);
        match mirror {
            Some(mirror) => mirror.handle(msg),
            None => debug!(%namespace, %name, "message for unknown replicant"),
        }
    }

    /// Declare every mirror again, after the connection was re-established.
    pub fn reconnect(&self) {
        let mirrors: Vec<_> = self.0.mirrors.lock().values().cloned().collect();
        debug!(count = mirrors.len(), "redeclaring replicants");
        for mirror in mirrors {
            mirror.redeclare();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::client::Status;

    #[test]
    fn routes_by_key() {
        let (session, mut rx) = Session::new();
        let a = session.declare("ns", "a", DeclareOptions::default());
        let b = session.declare("ns", "b", DeclareOptions::default());
        let again = session.declare("ns", "a", DeclareOptions::default());
        assert_eq!(again.key(), a.key());
        let mut declares = 0;
        while rx.try_recv().is_ok() {
            declares += 1;
        }
        assert_eq!(declares, 2);

        session.handle(ServerMessage::Declared {
            namespace: "ns".into(),
            name: "b".into(),
            value: Some(json!(true)),
            revision: 0,
            schema_sum: None,
            schema: None,
        });
        assert_eq!(a.status(), Status::AwaitingSnapshot);
        assert_eq!(b.status(), Status::Declared);
        assert_eq!(b.value(), Some(json!(true)));

        session.reconnect();
        assert_eq!(b.status(), Status::AwaitingSnapshot);
        let mut redeclared = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let (_, name) = msg.target();
            redeclared.push(name.to_string());
        }
        redeclared.sort();
        assert_eq!(redeclared, ["a", "b"]);
    }
}
