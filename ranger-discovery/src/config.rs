use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::logging::parse_log_level;
use crate::provider::ProviderOptions;
use crate::registration::DEFAULT_REFRESH_INTERVAL;
use crate::selection::SelectionStrategy;
use crate::store::{path, ConnectionSettings};

/// Discovery client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub discovery: DiscoveryConfig,
    pub provider: ProviderConfig,
    pub instance: InstanceConfig,
    pub logging: LoggingConfig,
}

/// Coordination store connection
///
/// Zero values fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connection_string: String,
    pub retry_count: usize,
    pub retry_wait_ms: u64,
    pub connect_timeout_ms: u64,
    pub session_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_string: "127.0.0.1:2181".to_string(),
            retry_count: ConnectionSettings::DEFAULT_RETRY_COUNT,
            retry_wait_ms: millis(ConnectionSettings::DEFAULT_RETRY_WAIT),
            connect_timeout_ms: millis(ConnectionSettings::DEFAULT_CONNECT_TIMEOUT),
            session_timeout_ms: millis(ConnectionSettings::DEFAULT_SESSION_TIMEOUT),
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn settings(&self) -> ConnectionSettings {
        let retry_count = if self.retry_count == 0 {
            ConnectionSettings::DEFAULT_RETRY_COUNT
        } else {
            self.retry_count
        };

        ConnectionSettings::new(self.connection_string.clone())
            .with_retry(
                retry_count,
                or_default(self.retry_wait_ms, ConnectionSettings::DEFAULT_RETRY_WAIT),
            )
            .with_connect_timeout(or_default(
                self.connect_timeout_ms,
                ConnectionSettings::DEFAULT_CONNECT_TIMEOUT,
            ))
            .with_session_timeout(or_default(
                self.session_timeout_ms,
                ConnectionSettings::DEFAULT_SESSION_TIMEOUT,
            ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Root under which every service keeps its instance nodes
    pub base_path: String,
    pub refresh_interval_ms: u64,
    /// Staleness filter for resolved snapshots, off when unset
    pub stale_node_threshold_ms: Option<u64>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_path: "services".to_string(),
            refresh_interval_ms: millis(DEFAULT_REFRESH_INTERVAL),
            stale_node_threshold_ms: None,
        }
    }
}

impl DiscoveryConfig {
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        or_default(self.refresh_interval_ms, DEFAULT_REFRESH_INTERVAL)
    }

    #[must_use]
    pub fn stale_node_threshold(&self) -> Option<Duration> {
        self.stale_node_threshold_ms.map(Duration::from_millis)
    }
}

/// Consumed service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub service_name: String,
    pub strategy: SelectionStrategy,
    pub secure: bool,
}

/// Advertised instance of this process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub service_name: String,
    /// Empty means the machine hostname
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub secure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RANGER_CONNECTION__RETRY_COUNT, RANGER_PROVIDER__STRATEGY, ...
        builder = builder.add_source(
            Environment::with_prefix("RANGER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every problem instead of stopping at the first one
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.connection.connection_string.trim().is_empty() {
            problems.push("connection.connection_string must not be empty".to_string());
        }

        for (key, name) in [
            ("provider.service_name", &self.provider.service_name),
            ("instance.service_name", &self.instance.service_name),
        ] {
            if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
                problems.push(format!("{key} has empty path segments: {name}"));
            }
        }

        if !self.instance.service_name.is_empty() && self.instance.port == 0 {
            problems.push("instance.port must be set when instance.service_name is".to_string());
        }
        if self.instance.host.contains('/') || self.instance.host.contains(':') {
            problems.push(format!("instance.host is not a bare host: {}", self.instance.host));
        }

        if self.discovery.stale_node_threshold_ms == Some(0) {
            problems.push("discovery.stale_node_threshold_ms must be greater than 0".to_string());
        }

        if let Err(e) = parse_log_level(&self.logging.level) {
            problems.push(format!("logging.level: {e}"));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            problems.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Base path with exactly one leading slash
    #[must_use]
    pub fn base_path(&self) -> String {
        path::normalize_base_path(&self.discovery.base_path)
    }

    #[must_use]
    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            strategy: self.provider.strategy,
            secure: self.provider.secure,
            refresh_interval: self.discovery.refresh_interval(),
            stale_node_threshold: self.discovery.stale_node_threshold(),
        }
    }
}

fn or_default(ms: u64, default: Duration) -> Duration {
    if ms == 0 {
        default
    } else {
        Duration::from_millis(ms)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
