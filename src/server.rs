//! The main server which combines the replicator and the HTTP server.

use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use iroh_metrics::{Registry, service::start_metrics_server};
use n0_snafu::{Result, ResultExt};
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, warn};

use crate::{
    config::Config,
    http::HttpServer,
    metrics::ReplicantMetrics,
    replicator::Replicator,
    state::AppState,
    store::{RedbStore, Store},
};

/// Spawn the server and run until the `Ctrl-C` signal is received, then shutdown.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<()> {
    let store: Arc<dyn Store> = if config.store.in_memory {
        info!("using in-memory store, values will not survive a restart");
        Arc::new(RedbStore::in_memory().context("failed to create in-memory store")?)
    } else {
        let path = config.store_path().e()?;
        Arc::new(RedbStore::persistent(path).context("failed to open store")?)
    };
    let server = Server::spawn(config, store).await?;
    tokio::signal::ctrl_c().await.e()?;
    info!("shutdown");
    server.shutdown().await?;
    Ok(())
}

/// The replicants server.
#[derive(Debug)]
pub struct Server {
    replicator: Replicator,
    http_server: HttpServer,
    metrics_task: Option<AbortOnDropHandle<()>>,
}

impl Server {
    /// Spawn the server.
    ///
    /// This will spawn several background tasks:
    /// * A HTTP server task serving the websocket endpoint
    /// * A metrics server task, if enabled in `config`
    pub async fn spawn(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let metrics = ReplicantMetrics::default();
        let mut builder = Replicator::builder(store)
            .save_policy(config.persistence.policy())
            .metrics(metrics.replicator.clone());
        for entry in &config.schemas {
            builder = builder.schema(&entry.namespace, &entry.name, &entry.path);
        }
        let replicator = builder.build();

        let metrics_task = config
            .metrics_addr()
            .map(|addr| spawn_metrics_server(addr, &metrics));

        let state = AppState {
            replicator: replicator.clone(),
        };
        let http_server = HttpServer::spawn(config.http, state)
            .await
            .context("failed to start HTTP server")?;
        Ok(Self {
            replicator,
            http_server,
            metrics_task,
        })
    }

    /// The replicator served by this server.
    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    /// Get the bound address of the HTTP socket.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_server.http_addr()
    }

    /// Close all connections, stop the server tasks and save every pending change.
    pub async fn shutdown(self) -> Result<()> {
        self.replicator.shutdown();
        let http_res = self.http_server.shutdown().await;
        drop(self.metrics_task);
        self.replicator
            .save_all_now()
            .await
            .context("failed to save replicants")?;
        http_res.context("HTTP server failed")?;
        Ok(())
    }

    /// Wait for the HTTP server to complete.
    ///
    /// This will run forever unless the server fails.
    pub async fn run_until_error(self) -> Result<()> {
        let res = self.http_server.run_until_done().await;
        self.replicator.save_all_now().await.ok();
        res.context("HTTP server failed")?;
        Ok(())
    }
}

fn spawn_metrics_server(addr: SocketAddr, metrics: &ReplicantMetrics) -> AbortOnDropHandle<()> {
    let mut registry = Registry::default();
    registry.register_all(metrics);
    let registry = Arc::new(RwLock::new(registry));
    let task = tokio::task::spawn(async move {
        if let Err(err) = start_metrics_server(addr, registry).await {
            warn!("metrics server failed: {err:#}");
        }
    });
    AbortOnDropHandle::new(task)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use testresult::TestResult;

    use super::*;
    use crate::{
        config::MetricsConfig, http::HttpConfig, replicant::ReplicantOptions, store::MemoryStore,
    };

    #[tokio::test]
    async fn shutdown_saves_pending_changes() -> TestResult {
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::dev();
        config.http = HttpConfig {
            port: 0,
            bind_addr: Some([127, 0, 0, 1].into()),
        };
        config.metrics = Some(MetricsConfig::disabled());
        config.persistence.default_interval = std::time::Duration::from_secs(3600);
        config.persistence.max_wait = std::time::Duration::from_secs(3600);

        let server = Server::spawn(config, store.clone()).await?;
        let rep = server
            .replicator()
            .declare("ns", "saved", ReplicantOptions::default())?;
        rep.assign(json!({ "saved": true }))?;
        assert_eq!(store.load("ns", "saved")?, None);

        server.shutdown().await?;
        assert_eq!(
            store.load("ns", "saved")?.as_deref(),
            Some(r#"{"saved":true}"#)
        );
        Ok(())
    }
}
