//! Running a [`Session`] over a websocket.
//!
//! The connection is re-established when it drops. After a reconnect every mirror declares
//! again and follows the snapshot the server sends.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::task::AbortOnDropHandle;
use tokio_websockets::{ClientBuilder, Message, WebSocketStream};
use tracing::{Instrument, debug, info, info_span, trace, warn};
use url::Url;

use super::{ClientReplicant, Session};
use crate::protocol::{ClientMessage, DeclareOptions, ServerMessage};

/// Time to wait before trying to reconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<TcpStream>;

/// Errors connecting to a replicator.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConnectError {
    #[snafu(display("invalid websocket url {url}"))]
    InvalidUrl { url: String },
    #[snafu(display("failed to connect to {url}"))]
    Connect {
        url: String,
        source: std::io::Error,
    },
    #[snafu(display("websocket handshake with {url} failed"))]
    Handshake {
        url: String,
        source: tokio_websockets::Error,
    },
}

/// A [`Session`] connected to a replicator over a websocket.
///
/// Dropping the client closes the connection.
#[derive(Debug)]
pub struct WsClient {
    session: Session,
    _task: AbortOnDropHandle<()>,
}

impl WsClient {
    /// Connect to the replicator's websocket endpoint at `url`, e.g.
    /// `ws://localhost:3450/replicants/ws`.
    pub async fn connect(url: Url) -> Result<Self, ConnectError> {
        let socket = open(&url).await?;
        info!(%url, "connected");
        let (session, rx) = Session::new();
        let task = tokio::task::spawn(
            drive(url, session.clone(), rx, socket).instrument(info_span!("ws_client")),
        );
        Ok(Self {
            session,
            _task: AbortOnDropHandle::new(task),
        })
    }

    /// The session multiplexed over this connection.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Declare a replicant, see [`Session::declare`].
    pub fn declare(&self, namespace: &str, name: &str, opts: DeclareOptions) -> ClientReplicant {
        self.session.declare(namespace, name, opts)
    }
}

async fn open(url: &Url) -> Result<Socket, ConnectError> {
    let host = url.host_str().context(InvalidUrlSnafu { url: url.as_str() })?;
    let port = url
        .port_or_known_default()
        .context(InvalidUrlSnafu { url: url.as_str() })?;
    let uri: http::Uri = url
        .as_str()
        .parse()
        .ok()
        .context(InvalidUrlSnafu { url: url.as_str() })?;
    let stream = TcpStream::connect((host, port))
        .await
        .context(ConnectSnafu { url: url.as_str() })?;
    let (socket, _response) = ClientBuilder::from_uri(uri)
        .connect_on(stream)
        .await
        .context(HandshakeSnafu { url: url.as_str() })?;
    Ok(socket)
}

#[derive(Debug, PartialEq, Eq)]
enum Closed {
    Session,
    Socket,
}

async fn drive(
    url: Url,
    session: Session,
    mut rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut socket: Socket,
) {
    loop {
        if run(&session, &mut rx, &mut socket).await == Closed::Session {
            SinkExt::close(&mut socket).await.ok();
            debug!("session closed");
            return;
        }
        socket = loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            match open(&url).await {
                Ok(socket) => break socket,
                Err(err) => debug!("reconnect failed: {err}"),
            }
        };
        info!(%url, "reconnected");
        // computed against state the server may no longer have
        let mut stale = 0;
        while rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "dropped messages queued while disconnected");
        }
        session.reconnect();
    }
}

async fn run(
    session: &Session,
    rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    socket: &mut Socket,
) -> Closed {
    loop {
        tokio::select! {
            biased;

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    return Closed::Session;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode message: {err}");
                        continue;
                    }
                };
                if let Err(err) = socket.send(Message::text(text)).await {
                    warn!("failed to send: {err}");
                    return Closed::Socket;
                }
            }
            frame = socket.next() => match frame {
                Some(Ok(frame)) => {
                    if frame.is_close() {
                        debug!("server closed the connection");
                        return Closed::Socket;
                    }
                    let Some(text) = frame.as_text() else {
                        continue;
                    };
                    match serde_json::from_str::<ServerMessage>(text) {
                        Ok(msg) => {
                            trace!(replicant = ?msg.target(), "received message");
                            session.handle(msg);
                        }
                        Err(err) => warn!("ignoring invalid message: {err}"),
                    }
                }
                Some(Err(err)) => {
                    warn!("connection failed: {err}");
                    return Closed::Socket;
                }
                None => return Closed::Socket,
            }
        }
    }
}
