use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub node: NodeConfig,
    pub registry: RegistryConfig,
    pub connection: ConnectionConfig,
    pub event_bus: EventBusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8848,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Empty means in-memory stores (single-node mode)
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 20,
            min_connections: 2,
            connect_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
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

/// Identity of this process within the cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Generated at startup when empty
    pub node_id: String,
    pub node_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Instances silent for longer than this are marked unhealthy
    pub heartbeat_timeout_secs: u64,
    /// Temporary instances silent for longer than this are deregistered
    pub temp_instance_expire_secs: u64,
    pub sweep_interval_secs: u64,
    pub default_weight: i32,
    pub service_cache_ttl_secs: u64,
    pub service_cache_capacity: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 15,
            temp_instance_expire_secs: 30,
            sweep_interval_secs: 5,
            default_weight: 100,
            service_cache_ttl_secs: 30,
            service_cache_capacity: 10_000,
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    #[must_use]
    pub const fn temp_instance_expire(&self) -> Duration {
        Duration::from_secs(self.temp_instance_expire_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// A connection is evicted once its last ping is strictly older than this
    pub ping_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Grace period announced in `SERVER_CLOSE` and waited out on shutdown
    pub close_grace_period_ms: u64,
    pub send_timeout_ms: u64,
    pub outbound_buffer: usize,
    pub max_connections: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_timeout_secs: 30,
            sweep_interval_secs: 5,
            close_grace_period_ms: 1000,
            send_timeout_ms: 5000,
            outbound_buffer: 256,
            max_connections: 10_000,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn close_grace_period(&self) -> Duration {
        Duration::from_millis(self.close_grace_period_ms)
    }

    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// RETRY outcomes beyond this count are forced to FAILED
    pub max_retries: i32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    /// Expiry applied by publishers that do not set one explicitly
    pub default_expire_secs: i64,
    pub retention_hours: i64,
    pub gc_interval_secs: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            poll_interval_ms: 1000,
            batch_size: 100,
            default_expire_secs: 600,
            retention_hours: 72,
            gc_interval_secs: 3600,
        }
    }
}

impl EventBusConfig {
    /// Delay before the `attempt`-th retry (1-based), doubling from the base
    #[must_use]
    pub fn retry_delay(&self, attempt: i32) -> Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(0).min(20);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
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

        // GATEHUB_SERVER__HTTP_PORT, GATEHUB_EVENT_BUS__MAX_RETRIES, ...
        builder = builder.add_source(
            Environment::with_prefix("GATEHUB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every misconfiguration instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if self.registry.heartbeat_timeout_secs == 0 {
            errors.push("registry.heartbeat_timeout_secs must be greater than 0".to_string());
        }
        if self.registry.temp_instance_expire_secs < self.registry.heartbeat_timeout_secs {
            errors.push(
                "registry.temp_instance_expire_secs must not be shorter than heartbeat_timeout_secs"
                    .to_string(),
            );
        }
        if self.registry.sweep_interval_secs == 0 {
            errors.push("registry.sweep_interval_secs must be greater than 0".to_string());
        }
        if !(0..=10_000).contains(&self.registry.default_weight) {
            errors.push("registry.default_weight must be within 0..=10000".to_string());
        }
        if self.connection.ping_timeout_secs == 0 {
            errors.push("connection.ping_timeout_secs must be greater than 0".to_string());
        }
        if self.connection.sweep_interval_secs == 0 {
            errors.push("connection.sweep_interval_secs must be greater than 0".to_string());
        }
        if self.connection.outbound_buffer == 0 {
            errors.push("connection.outbound_buffer must be greater than 0".to_string());
        }
        if self.event_bus.max_retries < 0 {
            errors.push("event_bus.max_retries must not be negative".to_string());
        }
        if self.event_bus.poll_interval_ms == 0 {
            errors.push("event_bus.poll_interval_ms must be greater than 0".to_string());
        }
        if self.event_bus.batch_size <= 0 {
            errors.push("event_bus.batch_size must be greater than 0".to_string());
        }
        if self.event_bus.retention_hours <= 0 {
            errors.push("event_bus.retention_hours must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Whether a relational store is configured
    #[must_use]
    pub fn uses_database(&self) -> bool {
        !self.database.url.is_empty()
    }
}

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `GATEHUB_CONFIG_PATH` environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Fall back to environment variables only
pub fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::var("GATEHUB_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env()?
        }
    };

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.uses_database());
        assert_eq!(config.event_bus.default_expire_secs, 600);
        assert_eq!(config.http_address(), "0.0.0.0:8848");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        config.connection.ping_timeout_secs = 0;
        config.event_bus.batch_size = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = EventBusConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 350,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(350));
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  http_port: 9000\nevent_bus:\n  max_retries: 7\nregistry:\n  default_weight: 50"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.event_bus.max_retries, 7);
        assert_eq!(config.registry.default_weight, 50);
        // untouched sections keep their defaults
        assert_eq!(config.connection.close_grace_period_ms, 1000);
    }
}
