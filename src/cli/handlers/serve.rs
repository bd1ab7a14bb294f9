//! Serve command handler
//!
//! Handles the serve command including dry-run validation and running a
//! scheduler node until a shutdown signal arrives.

use tokio::signal;

use crate::config::settings::{CacheBackend, Settings};
use crate::error::AppResult;
use crate::node::Node;

/// Handler for the serve command
pub struct ServeCommandHandler {
    config: Settings,
}

impl ServeCommandHandler {
    pub fn new(config: Settings) -> Self {
        Self { config }
    }

    /// Execute the serve command with optional dry-run support
    ///
    /// # Errors
    /// - Configuration validation errors
    /// - Store, cache or notifier startup errors (if not dry-run)
    pub async fn execute(&self, dry_run: bool) -> AppResult<()> {
        if dry_run {
            return self.validate_only();
        }

        let node = Node::start(&self.config).await?;
        shutdown_signal().await;
        node.shutdown().await
    }

    /// Validate configuration without starting the node
    pub fn validate_only(&self) -> AppResult<()> {
        self.config.validate()?;

        let node_id = if self.config.node.id.trim().is_empty() {
            "<generated at startup>"
        } else {
            self.config.node.id.trim()
        };
        let store = if self.config.database.is_configured() {
            "postgres"
        } else {
            "in-memory (single node)"
        };
        let cache = match (self.config.cache.enabled, self.config.cache.backend) {
            (false, _) => "disabled (every node leads)",
            (true, CacheBackend::Memory) => "in-memory",
            (true, CacheBackend::Redis) => "redis",
        };

        println!("✓ Configuration is valid");
        println!("✓ Node id: {}", node_id);
        println!("✓ Job store: {}", store);
        println!("✓ Cluster cache: {}", cache);
        println!(
            "✓ Scheduling loop: {} every {}s",
            if self.config.scheduler.enabled { "enabled" } else { "disabled" },
            self.config.scheduler.loop_interval_seconds
        );
        println!("Dry run completed successfully - configuration is ready for deployment");
        Ok(())
    }

    pub fn config(&self) -> &Settings {
        &self.config
    }
}

/// Waits for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serve_handler_new() {
        let config = Settings::default();
        let handler = ServeCommandHandler::new(config.clone());
        assert_eq!(handler.config(), &config);
    }

    #[tokio::test]
    async fn test_serve_handler_dry_run() {
        let mut config = Settings::default();
        config.node.id = "scheduler-1".to_string();
        let handler = ServeCommandHandler::new(config);

        assert!(handler.execute(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_serve_handler_dry_run_invalid_config() {
        let mut config = Settings::default();
        config.scheduler.loop_interval_seconds = 0;
        let handler = ServeCommandHandler::new(config);

        assert!(handler.execute(true).await.is_err());
    }
}
