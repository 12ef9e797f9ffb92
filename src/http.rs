//! HTTP server part of the replicants server

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::pin,
    time::Instant,
};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, Query, Request, State,
        rejection::{PathRejection, QueryRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::Method,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt, future};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{Level, debug, info, span, warn};

mod error;

use self::error::{AppError, AppResult};
use crate::{
    config::DEFAULT_HTTP_PORT,
    replicant::{Replicant, Snapshot},
    replicator::{Replicator, serve_connection},
    schema::SchemaSum,
    state::AppState,
};

/// Config for the HTTP server
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,
    /// Optionally set a custom bind address (will use 0.0.0.0 if unset)
    pub bind_addr: Option<IpAddr>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_HTTP_PORT,
            bind_addr: None,
        }
    }
}

/// Errors running the HTTP server.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum HttpError {
    #[snafu(display("failed to bind {addr}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("server task failed"))]
    Serve { source: std::io::Error },
    #[snafu(display("server task panicked"))]
    Join { source: tokio::task::JoinError },
}

/// The HTTP server part of the replicants server
#[derive(Debug)]
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    http_addr: SocketAddr,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Spawn the server
    pub async fn spawn(config: HttpConfig, state: AppState) -> Result<HttpServer, HttpError> {
        let app = create_app(state);
        let bind_addr = SocketAddr::new(
            config.bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED.into()),
            config.port,
        );
        let listener = TcpListener::bind(bind_addr)
            .await
            .context(BindSnafu { addr: bind_addr })?;
        let http_addr = listener
            .local_addr()
            .context(BindSnafu { addr: bind_addr })?;
        info!("HTTP server listening on {http_addr}");

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let shutdown = cancel.clone().cancelled_owned();
        tasks.spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await
        });

        Ok(HttpServer {
            tasks,
            http_addr,
            cancel,
        })
    }

    /// Get the bound address of the HTTP socket.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Stop accepting requests and wait for the server task to complete.
    pub async fn shutdown(self) -> Result<(), HttpError> {
        self.cancel.cancel();
        self.run_until_done().await
    }

    /// Wait for all tasks to complete.
    ///
    /// Runs forever unless tasks fail.
    pub async fn run_until_done(mut self) -> Result<(), HttpError> {
        let mut final_res = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "task failed");
                    final_res = Err(err).context(ServeSnafu);
                }
                Err(err) => {
                    warn!(?err, "task panicked");
                    final_res = Err(err).context(JoinSnafu);
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_app(state: AppState) -> Router {
    // configure cors middleware
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(cors::Any);

    // configure tracing middleware
    let trace = TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        let src = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        span!(
            Level::DEBUG,
            "http_request",
            method = ?request.method(),
            uri = ?request.uri(),
            src = ?src,
        )
    });

    let router = Router::new()
        .route("/replicants/ws", get(websocket))
        .route("/replicants", get(list))
        .route("/replicants/{namespace}/{name}", get(snapshot))
        .route("/healthcheck", get(|| async { "OK" }))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .with_state(state);

    router.layer(cors).layer(trace)
}

async fn websocket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(state.replicator, socket))
}

/// Run the replicant protocol over an upgraded websocket.
async fn serve_socket(replicator: Replicator, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let outgoing = pin!(sink.with(|text: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
    }));
    let incoming = pin!(
        stream
            .take_while(|msg| future::ready(matches!(msg, Ok(msg) if !matches!(msg, Message::Close(_)))))
            .filter_map(|msg| future::ready(match msg {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            }))
    );
    if let Err(err) = serve_connection(replicator, incoming, outgoing).await {
        debug!("websocket connection ended: {err}");
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    namespace: Option<String>,
}

/// Summary of one replicant, as listed by `GET /replicants`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicantInfo {
    /// Namespace of the replicant.
    pub namespace: String,
    /// Name of the replicant.
    pub name: String,
    /// Number of accepted changes.
    pub revision: u64,
    /// Sum of the active schema.
    pub schema_sum: Option<SchemaSum>,
    /// Whether the value is persisted.
    pub persistent: bool,
}

impl From<&Replicant> for ReplicantInfo {
    fn from(replicant: &Replicant) -> Self {
        Self {
            namespace: replicant.namespace().to_string(),
            name: replicant.name().to_string(),
            revision: replicant.revision(),
            schema_sum: replicant.schema_sum(),
            persistent: replicant.is_persistent(),
        }
    }
}

async fn list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> AppResult<Json<Vec<ReplicantInfo>>> {
    let Query(query) = query?;
    let infos = state
        .replicator
        .find_all(query.namespace.as_deref())
        .iter()
        .map(ReplicantInfo::from)
        .collect();
    Ok(Json(infos))
}

async fn snapshot(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
) -> AppResult<Json<Snapshot>> {
    let Path((namespace, name)) = path?;
    let replicant = state
        .replicator
        .find(&namespace, &name)
        .ok_or_else(|| AppError::not_found(format!("no replicant {namespace}::{name}")))?;
    Ok(Json(replicant.snapshot()))
}

/// Record request metrics.
async fn metrics_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_millis();
    let status = response.status();
    let metrics = state.replicator.metrics();
    metrics.http_requests_duration_ms.inc_by(latency as u64);
    metrics.http_requests.inc();
    if status.is_success() || status.is_informational() {
        metrics.http_requests_success.inc();
    } else {
        metrics.http_requests_error.inc();
    }
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use testresult::TestResult;

    use super::*;
    use crate::{replicant::ReplicantOptions, store::MemoryStore};

    async fn spawn() -> TestResult<(HttpServer, Replicator)> {
        let replicator = Replicator::builder(Arc::new(MemoryStore::new())).build();
        let config = HttpConfig {
            port: 0,
            bind_addr: Some(Ipv4Addr::LOCALHOST.into()),
        };
        let server = HttpServer::spawn(
            config,
            AppState {
                replicator: replicator.clone(),
            },
        )
        .await?;
        Ok((server, replicator))
    }

    async fn get_json(addr: SocketAddr, path: &str) -> TestResult<(u16, serde_json::Value)> {
        let response = reqwest::get(format!("http://{addr}{path}")).await?;
        let status = response.status().as_u16();
        Ok((status, response.json().await?))
    }

    #[tokio::test]
    async fn introspection() -> TestResult {
        let (server, replicator) = spawn().await?;
        let addr = server.http_addr();
        let score = replicator.declare(
            "scoreboard",
            "score",
            ReplicantOptions::default()
                .with_persistent(false)
                .with_default_value(json!({ "home": 0 })),
        )?;
        score.assign(json!({ "home": 1 }))?;
        replicator.declare("other", "x", ReplicantOptions::default().with_persistent(false))?;

        let (status, body) = get_json(addr, "/replicants?namespace=scoreboard").await?;
        assert_eq!(status, 200);
        assert_eq!(
            body,
            json!([{
                "namespace": "scoreboard",
                "name": "score",
                "revision": 1,
                "schemaSum": null,
                "persistent": false
            }])
        );

        let (status, body) = get_json(addr, "/replicants/scoreboard/score").await?;
        assert_eq!(status, 200);
        assert_eq!(
            body,
            json!({ "value": { "home": 1 }, "revision": 1, "schemaSum": null })
        );

        let (status, body) = get_json(addr, "/replicants/scoreboard/missing").await?;
        assert_eq!(status, 404);
        assert_eq!(
            body,
            json!({ "status": 404, "error": "no replicant scoreboard::missing" })
        );

        assert_eq!(replicator.metrics().http_requests.get(), 3);
        assert_eq!(replicator.metrics().http_requests_error.get(), 1);
        server.shutdown().await?;
        Ok(())
    }
}
