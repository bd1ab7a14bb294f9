//! Configuration settings structures for cluster-scheduler
//!
//! This module defines all configuration structures that can be loaded from
//! TOML files and environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::error::ConfigError;
use crate::jobs::progress::Retention;
use crate::logger::{ConsoleConfig, FileConfig, LogFormat, LoggerConfig};

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "cluster-scheduler".to_string()
}

fn default_app_version() -> String {
    crate::pkg_version().to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "logs/scheduler.log".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

// ============================================================================
// Application Configuration
// ============================================================================

/// Application basic information configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Application version
    #[serde(default = "default_app_version")]
    pub version: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

// ============================================================================
// Node Configuration
// ============================================================================

/// Identity of this server node within the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Node identifier; a random one is generated at startup when empty
    #[serde(default)]
    pub id: String,
}

impl NodeConfig {
    /// The configured id, or a freshly generated one
    pub fn resolve_id(&self) -> String {
        if self.id.trim().is_empty() {
            format!("node-{}", uuid::Uuid::new_v4().simple())
        } else {
            self.id.trim().to_string()
        }
    }
}

// ============================================================================
// Scheduler Configuration
// ============================================================================

fn default_loop_interval() -> u64 {
    20
}

fn default_max_catch_up() -> u64 {
    60
}

fn default_run_ttl() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_completed_ttl() -> u64 {
    86_400
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_stale_timeout() -> u64 {
    10
}

fn default_finished_ttl() -> u64 {
    1440
}

/// Scheduling loop, run coordination and housekeeping settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether this node runs the scheduling loop at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between scheduling ticks
    #[serde(default = "default_loop_interval")]
    pub loop_interval_seconds: u64,

    /// Due times older than this many minutes are skipped
    #[serde(default = "default_max_catch_up")]
    pub max_catch_up_minutes: u64,

    /// TTL of the cluster "running" entry, refreshed by the heartbeat
    #[serde(default = "default_run_ttl")]
    pub run_ttl_seconds: u64,

    /// Seconds between heartbeats of a running job
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    /// How long the last completed progress per job type stays in the cluster cache
    #[serde(default = "default_completed_ttl")]
    pub completed_ttl_seconds: u64,

    /// Materialize only every Nth work item (0 disables bucketing)
    #[serde(default)]
    pub bucket_size: u32,

    /// Whether completed successful progress nodes are kept
    #[serde(default)]
    pub retention: Retention,

    /// Upper bound on waiting for in-flight runs during shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    /// RUNNING definitions without a heartbeat for this many minutes are rescheduled
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_minutes: u64,

    /// Finished one-off definitions are deleted after this many minutes
    #[serde(default = "default_finished_ttl")]
    pub finished_ttl_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            loop_interval_seconds: default_loop_interval(),
            max_catch_up_minutes: default_max_catch_up(),
            run_ttl_seconds: default_run_ttl(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            completed_ttl_seconds: default_completed_ttl(),
            bucket_size: 0,
            retention: Retention::default(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            stale_timeout_minutes: default_stale_timeout(),
            finished_ttl_minutes: default_finished_ttl(),
        }
    }
}

impl SchedulerConfig {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn max_catch_up(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_catch_up_minutes as i64)
    }

    /// Leader lease TTL: one and a half loop intervals
    pub fn leader_ttl_seconds(&self) -> u64 {
        (self.loop_interval_seconds * 3).div_ceil(2)
    }
}

// ============================================================================
// Database Configuration
// ============================================================================

/// Diesel database connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL; empty selects the in-memory job store
    #[serde(default)]
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,

    /// Whether to automatically run pending migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,
}

impl DatabaseConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout: default_connection_timeout(),
            auto_migrate: false,
        }
    }
}

// ============================================================================
// Notification Configuration
// ============================================================================

fn default_webhook_method() -> String {
    "POST".to_string()
}

fn default_webhook_timeout() -> u64 {
    30
}

/// Outbound webhook used for job notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,

    /// "POST", "PUT", etc.
    #[serde(default = "default_webhook_method")]
    pub method: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: default_webhook_method(),
            headers: HashMap::new(),
            timeout_seconds: default_webhook_timeout(),
        }
    }
}

/// Job notification settings; when disabled notifications only go to the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub webhook: WebhookConfig,
}

// ============================================================================
// Logger Settings (compatible with existing LoggerConfig)
// ============================================================================

/// Console output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSettings {
    /// Whether console output is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to use colored output
    #[serde(default = "default_true")]
    pub colored: bool,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            colored: default_true(),
        }
    }
}

/// File output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSettings {
    /// Whether file output is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Path to the log file
    #[serde(default = "default_log_path")]
    pub path: String,

    /// Whether to append to existing file
    #[serde(default = "default_true")]
    pub append: bool,

    /// Log format: "full", "compact", or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_log_path(),
            append: default_true(),
            format: default_log_format(),
        }
    }
}

/// Logger configuration settings (compatible with existing LoggerConfig)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerSettings {
    /// Log level: "trace", "debug", "info", "warn", "error", optionally
    /// followed by per-target directives
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console output settings
    #[serde(default)]
    pub console: ConsoleSettings,

    /// File output settings
    #[serde(default)]
    pub file: FileSettings,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: ConsoleSettings::default(),
            file: FileSettings::default(),
        }
    }
}

impl LoggerSettings {
    /// Convert LoggerSettings to LoggerConfig
    ///
    /// This method transforms the configuration file representation into
    /// the runtime LoggerConfig used by the logger module.
    pub fn into_logger_config(self) -> Result<LoggerConfig, ConfigError> {
        let console_config = self.console.into_console_config();
        let file_config = self.file.into_file_config()?;

        LoggerConfig::new(console_config, file_config, self.level).map_err(|e| {
            ConfigError::ValidationError {
                field: "logger".to_string(),
                message: e.to_string(),
            }
        })
    }
}

impl ConsoleSettings {
    /// Convert ConsoleSettings to ConsoleConfig
    pub fn into_console_config(self) -> ConsoleConfig {
        ConsoleConfig::new(self.enabled, self.colored)
    }
}

impl FileSettings {
    /// Convert FileSettings to FileConfig
    pub fn into_file_config(self) -> Result<FileConfig, ConfigError> {
        let format = self.parse_format()?;

        FileConfig::new(self.enabled, PathBuf::from(self.path), self.append, format).map_err(
            |e| ConfigError::ValidationError {
                field: "logger.file".to_string(),
                message: e.to_string(),
            },
        )
    }

    /// Parse the format string into LogFormat enum
    fn parse_format(&self) -> Result<LogFormat, ConfigError> {
        self.format
            .parse::<LogFormat>()
            .map_err(|e| ConfigError::ValidationError {
                field: "logger.file.format".to_string(),
                message: e.to_string(),
            })
    }
}

// ============================================================================
// Cache Configuration
// ============================================================================

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_max_size() -> usize {
    1000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_pool_size() -> u32 {
    4
}

fn default_redis_connection_timeout() -> u64 {
    5
}

fn default_redis_key_prefix() -> String {
    "scheduler".to_string()
}

/// Cache backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

/// Memory cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries in the cache
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// Time-to-live in seconds for entries written without an explicit TTL
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_seconds: default_cache_ttl(),
        }
    }
}

/// Redis cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Time-to-live in seconds for entries written without an explicit TTL
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_redis_connection_timeout")]
    pub connection_timeout: u64,

    /// Key prefix for all cache entries
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,

    /// Whether to use TLS
    #[serde(default)]
    pub tls_enabled: bool,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            ttl_seconds: default_cache_ttl(),
            pool_size: default_redis_pool_size(),
            connection_timeout: default_redis_connection_timeout(),
            key_prefix: default_redis_key_prefix(),
            tls_enabled: false,
        }
    }
}

/// Cluster cache configuration. Disabled means standalone: every insert
/// succeeds and nothing is shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Cache backend type
    #[serde(default)]
    pub backend: CacheBackend,

    /// Memory cache settings
    #[serde(default)]
    pub memory: MemoryCacheConfig,

    /// Redis cache settings
    #[serde(default)]
    pub redis: RedisCacheConfig,
}

// ============================================================================
// Main Settings Structure
// ============================================================================

/// Complete application settings
///
/// This structure represents the entire configuration that can be loaded
/// from TOML files and environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub logger: LoggerSettings,
}
