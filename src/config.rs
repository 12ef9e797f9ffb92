//! Configuration for the server

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    http::HttpConfig,
    store::{
        SavePolicy,
        scheduler::{DEFAULT_INTERVAL, DEFAULT_MAX_WAIT},
    },
};

const DEFAULT_METRICS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9118);

/// Port used when no config is given.
pub const DEFAULT_HTTP_PORT: u16 = 9090;
/// Port used in development mode.
pub const DEV_HTTP_PORT: u16 = 3450;

/// Errors loading the configuration.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse {}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("operating environment provides no directory for application data"))]
    NoDataDir {},
}

/// Server configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`], and [`Self::dev`] creates a config suitable for
/// local development and testing.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Config for the HTTP server serving the websocket endpoint.
    #[serde(default)]
    pub http: HttpConfig,
    /// Config for the store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Save timing for persistent replicants.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Config for the metrics server.
    ///
    /// The metrics server is started by default. To disable the metrics server, set to
    /// `Some(MetricsConfig::disabled())`.
    pub metrics: Option<MetricsConfig>,
    /// Schema files for replicants declared by clients.
    #[serde(default)]
    pub schemas: Vec<SchemaEntry>,
}

/// The config for the store.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file, `<data dir>/replicants-1.db` if unset.
    pub path: Option<PathBuf>,
    /// Keep values in memory only.
    #[serde(default)]
    pub in_memory: bool,
}

/// Save timing for persistent replicants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Time between the last change and the save, unless a declare sets its own.
    #[serde(with = "humantime_serde")]
    pub default_interval: Duration,
    /// Upper bound between the first unsaved change and the save.
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            default_interval: DEFAULT_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl PersistenceConfig {
    /// The save policy for these settings.
    pub fn policy(&self) -> SavePolicy {
        SavePolicy {
            interval: self.default_interval,
            max_wait: self.max_wait,
        }
    }
}

/// Where the schema of one replicant lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    /// Namespace of the replicant.
    pub namespace: String,
    /// Name of the replicant.
    pub name: String,
    /// Path of the JSON schema file.
    pub path: PathBuf,
}

/// The config for the metrics server.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Set to true to disable the metrics server.
    pub disabled: bool,
    /// Optionally set a custom address to bind to.
    pub bind_addr: Option<SocketAddr>,
}

impl MetricsConfig {
    /// Disable the metrics server.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            bind_addr: None,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        Self::parse(&s, path)
    }

    fn parse(s: &str, path: &Path) -> Result<Config, ConfigError> {
        toml::from_str(s).context(ParseSnafu { path })
    }

    /// A config for local development: in-memory store on port [`DEV_HTTP_PORT`].
    pub fn dev() -> Self {
        Self {
            http: HttpConfig {
                port: DEV_HTTP_PORT,
                bind_addr: None,
            },
            store: StoreConfig {
                path: None,
                in_memory: true,
            },
            ..Default::default()
        }
    }

    /// Get the data directory.
    pub fn data_dir() -> Result<PathBuf, ConfigError> {
        let dir = if let Some(val) = env::var_os("REPLICANTS_DATA_DIR") {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().context(NoDataDirSnafu)?;
            path.join("replicants")
        };
        Ok(dir)
    }

    /// Get the path to the store database file.
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("replicants-1.db")),
        }
    }

    /// Get the address where the metrics server should be bound, if set.
    pub(crate) fn metrics_addr(&self) -> Option<SocketAddr> {
        match &self.metrics {
            None => Some(DEFAULT_METRICS_ADDR),
            Some(conf) => match conf.disabled {
                true => None,
                false => Some(conf.bind_addr.unwrap_or(DEFAULT_METRICS_ADDR)),
            },
        }
    }
}
