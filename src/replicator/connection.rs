//! The actor serving one remote connection.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info_span, trace, warn};

use super::{
    Replicator,
    connections::{ConnectionId, Outbox},
};
use crate::protocol::{ClientMessage, ServerMessage};

/// Reasons a connection ended with an error.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConnectionError {
    #[snafu(display("failed to encode message"))]
    Encode { source: serde_json::Error },
    #[snafu(display("failed to write to connection: {message}"))]
    Write { message: String },
    #[snafu(display("connection could not keep up with its messages"))]
    Overloaded {},
}

/// Serve one connection until the peer goes away or the replicator shuts down.
///
/// `incoming` yields the text frames received from the peer, `outgoing` takes the text
/// frames to send. Messages are written in the order they were queued for the connection.
/// When the connection ends, it is unsubscribed from every replicant it declared.
pub async fn serve_connection<I, O>(
    replicator: Replicator,
    incoming: I,
    outgoing: O,
) -> Result<(), ConnectionError>
where
    I: Stream<Item = String> + Unpin,
    O: Sink<String> + Unpin,
    O::Error: std::fmt::Display,
{
    let (outbox, outbox_rx) = replicator
        .connections()
        .register(replicator.channel_capacity());
    let id = outbox.id();
    replicator.metrics().connections_accepted.inc();
    let actor = Actor {
        id,
        replicator: replicator.clone(),
        outbox,
        outbox_rx,
        incoming,
        outgoing,
    };
    let res = actor.run().instrument(info_span!("connection", conn = %id)).await;
    replicator.disconnect(id);
    replicator.metrics().connections_closed.inc();
    match &res {
        Ok(()) => debug!(conn = %id, "connection closed"),
        Err(err) => warn!(conn = %id, "connection closed with error: {err}"),
    }
    res
}

struct Actor<I, O> {
    id: ConnectionId,
    replicator: Replicator,
    outbox: Outbox,
    outbox_rx: mpsc::Receiver<ServerMessage>,
    incoming: I,
    outgoing: O,
}

impl<I, O> Actor<I, O>
where
    I: Stream<Item = String> + Unpin,
    O: Sink<String> + Unpin,
    O::Error: std::fmt::Display,
{
    async fn run(mut self) -> Result<(), ConnectionError> {
        let shutdown = self.replicator.shutdown_token().clone();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    trace!("replicator shutting down");
                    break;
                }
                _ = self.outbox.closed() => {
                    self.outgoing.close().await.ok();
                    return OverloadedSnafu.fail();
                }
                // queued messages go out before new input is read
                Some(msg) = self.outbox_rx.recv() => {
                    self.write(msg).await?;
                }
                frame = self.incoming.next() => {
                    match frame {
                        Some(text) => self.handle_frame(&text),
                        None => {
                            trace!("peer went away");
                            break;
                        }
                    }
                }
            }
        }
        self.outgoing.close().await.ok();
        Ok(())
    }

    async fn write(&mut self, msg: ServerMessage) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(&msg).context(EncodeSnafu)?;
        self.outgoing.send(text).await.map_err(|err| {
            WriteSnafu {
                message: err.to_string(),
            }
            .build()
        })?;
        self.replicator.metrics().messages_sent.inc();
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        let metrics = self.replicator.metrics();
        metrics.messages_recv.inc();
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(err) => {
                metrics.messages_invalid.inc();
                match ServerMessage::rejecting_invalid(text, err.to_string()) {
                    Some(rejection) => {
                        debug!(conn = %self.id, replicant = ?rejection.target(), "rejecting invalid message: {err}");
                        self.outbox.send(rejection, metrics).ok();
                    }
                    None => warn!(conn = %self.id, "ignoring invalid message: {err}"),
                }
                return;
            }
        };
        trace!(conn = %self.id, replicant = ?msg.target(), "received message");
        self.replicator.handle_message(&self.outbox, msg);
    }
}

#[cfg(test)]
mod tests {
    use std::{pin::Pin, sync::Arc};

    use futures_util::stream;
    use serde_json::json;
    use testresult::TestResult;
    use tokio_util::sync::PollSender;
    use tracing_test::traced_test;

    use super::*;
    use crate::store::MemoryStore;

    type Incoming = Pin<Box<dyn Stream<Item = String> + Send>>;
    type Outgoing = Pin<Box<PollSender<String>>>;

    /// A connection made of two channels: frames to send to the server, frames it wrote.
    fn pipe() -> (mpsc::Sender<String>, Incoming, Outgoing, mpsc::Receiver<String>) {
        let (in_tx, mut in_rx) = mpsc::channel::<String>(16);
        let (out_tx, out_rx) = mpsc::channel::<String>(16);
        let incoming = Box::pin(stream::poll_fn(move |cx| in_rx.poll_recv(cx)));
        (in_tx, incoming, Box::pin(PollSender::new(out_tx)), out_rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<String>) -> TestResult<ServerMessage> {
        let text = rx.recv().await.ok_or("connection closed")?;
        Ok(serde_json::from_str(&text)?)
    }

    #[tokio::test]
    #[traced_test]
    async fn serves_until_peer_goes_away() -> TestResult {
        let replicator = Replicator::new(MemoryStore::new());
        let (in_tx, incoming, outgoing, mut out_rx) = pipe();
        let task = tokio::spawn(serve_connection(replicator.clone(), incoming, outgoing));

        in_tx.send("not json".to_string()).await?;
        in_tx
            .send(
                json!({
                    "type": "declare",
                    "namespace": "ns",
                    "name": "x",
                    "opts": { "defaultValue": { "a": 1 }, "persistent": false }
                })
                .to_string(),
            )
            .await?;
        let msg = next_message(&mut out_rx).await?;
        assert!(matches!(msg, ServerMessage::Declared { revision: 0, .. }));
        assert_eq!(replicator.metrics().messages_invalid.get(), 1);

        let x = replicator.find("ns", "x").ok_or("declared")?;
        x.assign(json!({ "a": 2 }))?;
        let msg = next_message(&mut out_rx).await?;
        assert!(matches!(msg, ServerMessage::Assignment { revision: 0, .. }));

        drop(in_tx);
        task.await??;
        assert_eq!(x.subscriber_count(), 0);
        assert!(replicator.connections().is_empty());
        assert_eq!(replicator.metrics().connections_closed.get(), 1);
        Ok(())
    }

    fn declare(name: &str, default_value: serde_json::Value) -> String {
        json!({
            "type": "declare",
            "namespace": "ns",
            "name": name,
            "opts": { "defaultValue": default_value, "persistent": false }
        })
        .to_string()
    }

    #[tokio::test]
    #[traced_test]
    async fn undecodable_operations_are_rejected() -> TestResult {
        let replicator = Replicator::new(MemoryStore::new());
        let (in_tx, incoming, outgoing, mut out_rx) = pipe();
        let _task = tokio::spawn(serve_connection(replicator.clone(), incoming, outgoing));

        in_tx.send(declare("list", json!([2, 1]))).await?;
        let msg = next_message(&mut out_rx).await?;
        assert!(matches!(msg, ServerMessage::Declared { .. }));

        let sort_with_comparator = json!({
            "type": "operations",
            "namespace": "ns",
            "name": "list",
            "revision": 0,
            "operations": [
                { "path": "/", "method": "sort", "args": { "mutatorArgs": ["(a,b)=>a-b"] } }
            ]
        });
        in_tx.send(sort_with_comparator.to_string()).await?;
        let msg = next_message(&mut out_rx).await?;
        assert!(matches!(
            msg,
            ServerMessage::OperationsRejected { ref namespace, ref name, .. }
                if namespace == "ns" && name == "list"
        ));
        assert_eq!(replicator.metrics().messages_invalid.get(), 1);
        let list = replicator.find("ns", "list").ok_or("declared")?;
        assert_eq!(list.value(), Some(json!([2, 1])));
        assert_eq!(list.revision(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn overflowing_connection_is_closed() -> TestResult {
        let replicator = Replicator::builder(Arc::new(MemoryStore::new()))
            .channel_capacity(1)
            .build();
        let (in_tx, incoming, outgoing, mut out_rx) = pipe();
        let task = tokio::spawn(serve_connection(replicator.clone(), incoming, outgoing));

        in_tx.send(declare("x", json!(0))).await?;
        let msg = next_message(&mut out_rx).await?;
        assert!(matches!(msg, ServerMessage::Declared { .. }));

        // the connection task does not run in between, so the second change overflows
        let x = replicator.find("ns", "x").ok_or("declared")?;
        x.assign(json!(1))?;
        x.assign(json!(2))?;

        let err = task.await?.unwrap_err();
        assert!(matches!(err, ConnectionError::Overloaded { .. }));
        assert_eq!(x.subscriber_count(), 0);
        assert!(replicator.connections().is_empty());
        assert_eq!(replicator.metrics().messages_dropped.get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_closes_connections() -> TestResult {
        let replicator = Replicator::new(MemoryStore::new());
        let (_in_tx, incoming, outgoing, _out_rx) = pipe();
        let task = tokio::spawn(serve_connection(replicator.clone(), incoming, outgoing));
        tokio::task::yield_now().await;
        replicator.shutdown();
        task.await??;
        Ok(())
    }
}
