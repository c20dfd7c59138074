use crate::pool::PoolSettings;
use crate::transport::TcpConnectOptions;
use crate::utils::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
    #[serde(default = "default_max_sockets_per_group")]
    pub max_sockets_per_group: usize,
    #[serde(default = "default_unused_idle_timeout_secs")]
    pub unused_idle_timeout_secs: u64,
    #[serde(default = "default_used_idle_timeout_secs")]
    pub used_idle_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// 0 disables the connect deadline.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_backup_jobs_enabled")]
    pub backup_jobs_enabled: bool,
    #[serde(default = "default_backup_job_delay_ms")]
    pub backup_job_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    #[serde(default)]
    pub prefer_ipv6: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_max_sockets() -> usize {
    256
}

fn default_max_sockets_per_group() -> usize {
    6
}

fn default_unused_idle_timeout_secs() -> u64 {
    10
}

fn default_used_idle_timeout_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    240
}

fn default_backup_jobs_enabled() -> bool {
    true
}

fn default_backup_job_delay_ms() -> u64 {
    250
}

fn default_nodelay() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets: default_max_sockets(),
            max_sockets_per_group: default_max_sockets_per_group(),
            unused_idle_timeout_secs: default_unused_idle_timeout_secs(),
            used_idle_timeout_secs: default_used_idle_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            backup_jobs_enabled: default_backup_jobs_enabled(),
            backup_job_delay_ms: default_backup_job_delay_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nodelay: default_nodelay(),
            prefer_ipv6: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl PoolConfig {
    pub fn to_settings(&self) -> PoolSettings {
        PoolSettings {
            max_sockets: self.max_sockets,
            max_sockets_per_group: self.max_sockets_per_group,
            unused_idle_socket_timeout: Duration::from_secs(self.unused_idle_timeout_secs),
            used_idle_socket_timeout: Duration::from_secs(self.used_idle_timeout_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            backup_jobs_enabled: self.backup_jobs_enabled,
            backup_job_delay: Duration::from_millis(self.backup_job_delay_ms),
        }
    }
}

impl TransportConfig {
    pub fn to_options(&self) -> TcpConnectOptions {
        TcpConnectOptions {
            nodelay: self.nodelay,
            prefer_ipv6: self.prefer_ipv6,
            timeout: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PoolError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| PoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_sockets == 0 {
            return Err(PoolError::Config(
                "pool.max_sockets must be at least 1".to_string(),
            ));
        }

        if self.pool.max_sockets_per_group == 0 {
            return Err(PoolError::Config(
                "pool.max_sockets_per_group must be at least 1".to_string(),
            ));
        }

        if self.pool.max_sockets_per_group > self.pool.max_sockets {
            return Err(PoolError::Config(format!(
                "pool.max_sockets_per_group ({}) cannot exceed pool.max_sockets ({})",
                self.pool.max_sockets_per_group, self.pool.max_sockets
            )));
        }

        if self.pool.cleanup_interval_secs == 0 {
            return Err(PoolError::Config(
                "pool.cleanup_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.pool.backup_jobs_enabled && self.pool.backup_job_delay_ms == 0 {
            return Err(PoolError::Config(
                "pool.backup_job_delay_ms must be at least 1 when backup jobs are enabled"
                    .to_string(),
            ));
        }

        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(PoolError::Config(format!(
                "Invalid log level: {}. Must be one of trace, debug, info, warn, error",
                self.logging.level
            )));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(PoolError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[pool]
max_sockets = 256
max_sockets_per_group = 6
unused_idle_timeout_secs = 10
used_idle_timeout_secs = 300
cleanup_interval_secs = 10
connect_timeout_secs = 240  # 0 disables the deadline
backup_jobs_enabled = true
backup_job_delay_ms = 250

[transport]
nodelay = true
prefer_ipv6 = false

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example)
            .map_err(|e| PoolError::Config(format!("Failed to write example config: {}", e)))?;

        Ok(())
    }
}
