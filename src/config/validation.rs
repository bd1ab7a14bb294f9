//! Configuration validation logic
//!
//! This module provides validation methods for all configuration structures
//! to ensure configuration values are within acceptable ranges and formats.

use crate::config::error::ConfigError;
use crate::config::settings::{
    CacheBackend, CacheConfig, DatabaseConfig, FileSettings, LoggerSettings, NotificationConfig,
    SchedulerConfig, Settings,
};

/// Valid log levels
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid log formats
const VALID_LOG_FORMATS: &[&str] = &["full", "compact", "json"];

impl SchedulerConfig {
    /// Validate scheduler configuration
    ///
    /// # Validation Rules
    /// - Loop interval and heartbeat interval must be greater than 0
    /// - Heartbeat interval must be shorter than the run TTL, otherwise a
    ///   healthy run would expire between two heartbeats
    /// - Shutdown timeout must be greater than 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_interval_seconds == 0 {
            return Err(ConfigError::validation(
                "scheduler.loop_interval_seconds",
                "Loop interval must be greater than 0 seconds.",
            ));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(ConfigError::validation(
                "scheduler.heartbeat_interval_seconds",
                "Heartbeat interval must be greater than 0 seconds.",
            ));
        }

        if self.heartbeat_interval_seconds >= self.run_ttl_seconds {
            return Err(ConfigError::ValidationError {
                field: "scheduler.heartbeat_interval_seconds".to_string(),
                message: format!(
                    "Heartbeat interval ({}s) must be shorter than the run TTL ({}s).",
                    self.heartbeat_interval_seconds, self.run_ttl_seconds
                ),
            });
        }

        if self.shutdown_timeout_seconds == 0 {
            return Err(ConfigError::validation(
                "scheduler.shutdown_timeout_seconds",
                "Shutdown timeout must be greater than 0 seconds.",
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Validate database configuration
    ///
    /// An empty URL is valid and selects the in-memory store.
    ///
    /// # Validation Rules
    /// - URL, when present, must be a PostgreSQL URL
    /// - Max and min connections must be greater than 0
    /// - Min connections must not exceed max connections
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.is_configured() && !self.is_valid_database_url() {
            return Err(ConfigError::validation(
                "database.url",
                "Invalid database URL format. Expected format: postgres://[user:password@]host[:port]/database",
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::validation(
                "database.max_connections",
                "Max connections must be greater than 0.",
            ));
        }

        if self.min_connections == 0 {
            return Err(ConfigError::validation(
                "database.min_connections",
                "Min connections must be greater than 0.",
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::ValidationError {
                field: "database.min_connections".to_string(),
                message: format!(
                    "Min connections ({}) cannot exceed max connections ({}).",
                    self.min_connections, self.max_connections
                ),
            });
        }

        Ok(())
    }

    fn is_valid_database_url(&self) -> bool {
        ["postgres://", "postgresql://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme))
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        match self.backend {
            CacheBackend::Memory => {
                if self.memory.max_size == 0 {
                    return Err(ConfigError::validation(
                        "cache.memory.max_size",
                        "Memory cache must hold at least one entry.",
                    ));
                }
            }
            CacheBackend::Redis => {
                if !(self.redis.url.starts_with("redis://") || self.redis.url.starts_with("rediss://"))
                {
                    return Err(ConfigError::validation(
                        "cache.redis.url",
                        "Redis URL must start with redis:// or rediss://.",
                    ));
                }
                if self.redis.pool_size == 0 {
                    return Err(ConfigError::validation(
                        "cache.redis.pool_size",
                        "Redis pool size must be greater than 0.",
                    ));
                }
            }
        }

        Ok(())
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        let url = &self.webhook.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::validation(
                "notifications.webhook.url",
                "Webhook URL is required when notifications are enabled and must use http or https.",
            ));
        }

        if self.webhook.timeout_seconds == 0 {
            return Err(ConfigError::validation(
                "notifications.webhook.timeout_seconds",
                "Webhook timeout must be greater than 0 seconds.",
            ));
        }

        Ok(())
    }
}

impl FileSettings {
    /// Validate file settings
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.path.trim().is_empty() {
            return Err(ConfigError::validation(
                "logger.file.path",
                "File path is required when file logging is enabled.",
            ));
        }

        if !VALID_LOG_FORMATS.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError {
                field: "logger.file.format".to_string(),
                message: format!(
                    "Invalid log format '{}'. Valid formats are: {}",
                    self.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        Ok(())
    }
}

impl LoggerSettings {
    /// Validate logger settings
    ///
    /// # Validation Rules
    /// - The default level (before any `,target=level` directives) must be
    ///   one of: trace, debug, info, warn, error
    /// - If file logging is enabled, path must not be empty
    /// - Log format must be one of: full, compact, json
    pub fn validate(&self) -> Result<(), ConfigError> {
        let default_level = self.level.split(',').next().unwrap_or_default().trim();
        if !VALID_LOG_LEVELS.contains(&default_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError {
                field: "logger.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Valid levels are: {}",
                    self.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        self.file.validate()?;

        Ok(())
    }
}

impl Settings {
    /// Validate all configuration settings
    ///
    /// This method validates all sub-configurations and returns the first
    /// validation error encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.database.validate()?;
        self.cache.validate()?;
        self.notifications.validate()?;
        self.logger.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::ValidationError { field, .. } => field,
            other => panic!("Expected ValidationError, got {other:?}"),
        }
    }

    // ========================================================================
    // SchedulerConfig validation tests
    // ========================================================================

    #[test]
    fn test_scheduler_config_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_scheduler_config_zero_loop_interval() {
        let config = SchedulerConfig {
            loop_interval_seconds: 0,
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "scheduler.loop_interval_seconds"
        );
    }

    #[test]
    fn test_scheduler_config_heartbeat_not_shorter_than_ttl() {
        let config = SchedulerConfig {
            heartbeat_interval_seconds: 60,
            run_ttl_seconds: 60,
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "scheduler.heartbeat_interval_seconds"
        );
    }

    // ========================================================================
    // DatabaseConfig validation tests
    // ========================================================================

    #[test]
    fn test_database_config_empty_url_selects_memory_store() {
        assert!(DatabaseConfig::default().validate().is_ok());
    }

    #[test]
    fn test_database_config_invalid_url_format() {
        let config = DatabaseConfig {
            url: "mysql://localhost/db".to_string(),
            ..Default::default()
        };
        assert_eq!(field_of(config.validate().unwrap_err()), "database.url");
    }

    #[test]
    fn test_database_config_valid_url_schemes() {
        for url in ["postgres://localhost/db", "postgresql://u:p@host:5432/db"] {
            let config = DatabaseConfig {
                url: url.to_string(),
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "{url} should be valid");
        }
    }

    #[test]
    fn test_database_config_min_exceeds_max() {
        let config = DatabaseConfig {
            max_connections: 2,
            min_connections: 5,
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "database.min_connections"
        );
    }

    // ========================================================================
    // Cache and notification validation tests
    // ========================================================================

    #[test]
    fn test_cache_config_disabled_skips_checks() {
        let mut config = CacheConfig::default();
        config.redis.url = "nonsense".to_string();
        config.backend = CacheBackend::Redis;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_invalid_redis_url() {
        let mut config = CacheConfig {
            enabled: true,
            backend: CacheBackend::Redis,
            ..Default::default()
        };
        config.redis.url = "http://127.0.0.1:6379".to_string();
        assert_eq!(field_of(config.validate().unwrap_err()), "cache.redis.url");
    }

    #[test]
    fn test_notification_config_requires_url_when_enabled() {
        let config = NotificationConfig {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "notifications.webhook.url"
        );
    }

    // ========================================================================
    // LoggerSettings validation tests
    // ========================================================================

    #[test]
    fn test_logger_settings_valid_levels() {
        for level in ["trace", "debug", "info", "WARN", "error", "info,tokio=warn"] {
            let settings = LoggerSettings {
                level: level.to_string(),
                ..Default::default()
            };
            assert!(settings.validate().is_ok(), "Level '{}' should be valid", level);
        }
    }

    #[test]
    fn test_logger_settings_invalid_level() {
        let settings = LoggerSettings {
            level: "verbose".to_string(),
            ..Default::default()
        };
        assert_eq!(field_of(settings.validate().unwrap_err()), "logger.level");
    }

    #[test]
    fn test_logger_settings_file_enabled_empty_path() {
        let settings = LoggerSettings {
            file: FileSettings {
                enabled: true,
                path: "   ".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(field_of(settings.validate().unwrap_err()), "logger.file.path");
    }

    #[test]
    fn test_logger_settings_invalid_format() {
        let settings = LoggerSettings {
            file: FileSettings {
                format: "xml".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            field_of(settings.validate().unwrap_err()),
            "logger.file.format"
        );
    }

    // ========================================================================
    // Settings validation tests
    // ========================================================================

    #[test]
    fn test_settings_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_settings_invalid_scheduler() {
        let mut settings = Settings::default();
        settings.scheduler.shutdown_timeout_seconds = 0;
        assert_eq!(
            field_of(settings.validate().unwrap_err()),
            "scheduler.shutdown_timeout_seconds"
        );
    }
}
