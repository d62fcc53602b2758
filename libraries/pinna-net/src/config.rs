//! Pipeline configuration

use crate::connectivity::ConnectivityMonitor;
use crate::error::{NetError, Result};
use crate::factory::RequestFactory;
use crate::transport::ReqwestTransport;
use pinna_cache::FileSystemCacheManager;
use pinna_core::QueueManager;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Name of the optional configuration file read by [`PinnaConfig::load`]
pub const CONFIG_FILE_NAME: &str = "pinna.toml";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PinnaConfig {
    #[serde(default = "default_network")]
    pub network: NetworkSettings,

    #[serde(default = "default_connectivity")]
    pub connectivity: ConnectivitySettings,

    #[serde(default = "default_cache")]
    pub cache: CacheSettings,

    #[serde(default = "default_queues")]
    pub queues: QueueSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NetworkSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_max_authentication_attempts")]
    pub max_authentication_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConnectivitySettings {
    #[serde(default = "default_probe_host")]
    pub probe_host: String,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheSettings {
    /// Defaults to `pinna-cache` in the system temp directory
    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueueSettings {
    #[serde(default = "default_request_workers")]
    pub request_workers: usize,

    #[serde(default = "default_max_named_queues")]
    pub max_named_queues: usize,
}

impl Default for PinnaConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            connectivity: default_connectivity(),
            cache: default_cache(),
            queues: default_queues(),
        }
    }
}

impl PinnaConfig {
    /// Load configuration from `pinna.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE_NAME))
    }

    /// Load configuration from `path` (if present) and the environment.
    ///
    /// Environment variables use the `PINNA_` prefix and `__` between
    /// section and key, e.g. `PINNA_NETWORK__TIMEOUT_SECS=5`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = config::Config::builder();

        if path.exists() {
            settings = settings.add_source(config::File::from(path));
        }

        settings = settings.add_source(
            config::Environment::with_prefix("PINNA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.network.timeout_secs == 0 {
            return Err(NetError::Config("network.timeout_secs must be positive".to_string()));
        }
        if self.queues.request_workers == 0 {
            return Err(NetError::Config("queues.request_workers must be positive".to_string()));
        }
        if self.queues.max_named_queues == 0 {
            return Err(NetError::Config("queues.max_named_queues must be positive".to_string()));
        }
        if !self.connectivity.probe_host.contains(':') {
            return Err(NetError::Config(format!(
                "connectivity.probe_host must be host:port, got {}",
                self.connectivity.probe_host
            )));
        }
        Ok(())
    }

    pub fn cache_directory(&self) -> PathBuf {
        self.cache
            .directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("pinna-cache"))
    }

    /// Build the HTTP transport described by the network section.
    pub fn build_transport(&self) -> Result<ReqwestTransport> {
        ReqwestTransport::new(
            Duration::from_secs(self.network.timeout_secs),
            Duration::from_secs(self.network.connect_timeout_secs),
            &self.network.user_agent,
        )
    }

    /// Open the file system cache described by the cache section.
    pub fn build_cache_manager(&self) -> Result<FileSystemCacheManager> {
        let directory = self.cache_directory();
        info!(directory = %directory.display(), max_cache_size = self.cache.max_cache_size, "Opening cache");
        Ok(FileSystemCacheManager::new(directory, self.cache.max_cache_size)?)
    }

    /// Start a connectivity monitor for the configured probe host.
    pub fn build_connectivity_monitor(&self) -> ConnectivityMonitor {
        ConnectivityMonitor::for_host(
            &self.connectivity.probe_host,
            Duration::from_millis(self.connectivity.probe_interval_ms),
            Duration::from_millis(self.connectivity.probe_timeout_ms),
        )
    }

    /// A queue manager sized by the queues section.
    pub fn build_queue_manager(&self) -> QueueManager {
        QueueManager::new(self.queues.max_named_queues, self.queues.request_workers)
    }

    /// Apply the network and connectivity sections to `factory`.
    ///
    /// Sets the transport, a connectivity monitor for the probe host and the
    /// authentication attempt limit. Builder calls made afterwards override
    /// any of them.
    pub fn configure_factory<T: Clone + Send + 'static>(
        &self,
        factory: RequestFactory<T>,
    ) -> Result<RequestFactory<T>> {
        let transport = self.build_transport()?;
        Ok(factory
            .with_transport(Arc::new(transport))
            .with_connectivity_monitor(Arc::new(self.build_connectivity_monitor()))
            .with_max_authentication_attempts(self.network.max_authentication_attempts))
    }
}

// Default values
fn default_network() -> NetworkSettings {
    NetworkSettings {
        user_agent: default_user_agent(),
        timeout_secs: default_timeout_secs(),
        connect_timeout_secs: default_connect_timeout_secs(),
        max_authentication_attempts: default_max_authentication_attempts(),
    }
}

fn default_user_agent() -> String {
    format!("Pinna/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_authentication_attempts() -> u32 {
    crate::auth::DEFAULT_MAX_AUTHENTICATION_ATTEMPTS
}

fn default_connectivity() -> ConnectivitySettings {
    ConnectivitySettings {
        probe_host: default_probe_host(),
        probe_interval_ms: default_probe_interval_ms(),
        probe_timeout_ms: default_probe_timeout_ms(),
    }
}

fn default_probe_host() -> String {
    crate::connectivity::DEFAULT_PROBE_HOST.to_string()
}

fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_cache() -> CacheSettings {
    CacheSettings {
        directory: None,
        max_cache_size: default_max_cache_size(),
    }
}

fn default_max_cache_size() -> u64 {
    pinna_cache::DEFAULT_MAX_CACHE_SIZE
}

fn default_queues() -> QueueSettings {
    QueueSettings {
        request_workers: default_request_workers(),
        max_named_queues: default_max_named_queues(),
    }
}

fn default_request_workers() -> usize {
    pinna_core::queue::DEFAULT_WORKERS_PER_QUEUE
}

fn default_max_named_queues() -> usize {
    pinna_core::queue::DEFAULT_MAX_QUEUES
}
