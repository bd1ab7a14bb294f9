//! CLI argument parsing with clap
//!
//! This module defines the command-line interface structure using clap,
//! including all commands, arguments, and their documentation.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// A clustered job scheduler node
#[derive(Parser, Debug)]
#[command(name = "cluster-scheduler")]
#[command(about = "A clustered job scheduler node")]
#[command(long_about = "
cluster-scheduler runs one node of a job scheduling cluster. Nodes share a
job store and a cache; one of them is elected leader and picks the due jobs,
every node runs the jobs it is handed and reports their progress.

EXAMPLES:
    # Start a node with default configuration
    cluster-scheduler serve

    # Start a node with a fixed identity
    cluster-scheduler serve --node-id scheduler-1

    # Use custom configuration file
    cluster-scheduler --config /path/to/config.toml serve

    # Run in development mode with verbose logging
    cluster-scheduler --env development --verbose serve

    # Check configuration without starting the node
    cluster-scheduler serve --dry-run

    # Run database migrations
    cluster-scheduler migrate

    # Preview pending migrations
    cluster-scheduler migrate --dry-run

    # Rollback last 2 migrations
    cluster-scheduler migrate --rollback 2
")]
#[command(version = crate::build::CLAP_LONG_VERSION)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    ///
    /// Load this single TOML file instead of the layered configuration
    /// directory. The file must exist and be readable.
    ///
    /// Example: --config /etc/cluster-scheduler/production.toml
    #[arg(short, long, value_name = "FILE", value_parser = super::validation::validate_config_file_path)]
    pub config: Option<PathBuf>,

    /// Override environment detection
    ///
    /// Selects which `{environment}.toml` layer is loaded.
    ///
    /// Available values: development (dev), staging (stage), production (prod), test
    #[arg(short, long, value_enum)]
    pub env: Option<Environment>,

    /// Enable verbose logging
    ///
    /// Raises the log level to debug. Cannot be used with --quiet.
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress non-error output
    ///
    /// Lowers the log level to error. Cannot be used with --verbose.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a scheduler node (default)
    ///
    /// Opens the job store and the cluster cache, joins leader election and
    /// runs the scheduling loop until interrupted.
    ///
    /// Examples:
    ///   cluster-scheduler serve                       # Start with defaults
    ///   cluster-scheduler serve --node-id worker-2    # Fixed node identity
    ///   cluster-scheduler serve --dry-run             # Validate config without starting
    Serve {
        /// Node identifier
        ///
        /// Identity of this node within the cluster. Overrides `node.id`
        /// from the configuration; a random id is generated when neither
        /// is set.
        #[arg(long, value_name = "ID", value_parser = super::validation::validate_node_id)]
        node_id: Option<String>,

        /// Log level override
        ///
        /// Overrides both configuration file settings and global
        /// --verbose/--quiet flags.
        ///
        /// Available levels: error, warn, info, debug, trace
        #[arg(long, value_enum)]
        log_level: Option<LogLevel>,

        /// Validate configuration and exit
        ///
        /// Returns exit code 0 if the configuration is valid, non-zero otherwise.
        #[arg(long)]
        dry_run: bool,
    },
    /// Database migration operations
    ///
    /// Applies or rolls back the job store schema.
    ///
    /// Examples:
    ///   cluster-scheduler migrate                    # Apply all pending migrations
    ///   cluster-scheduler migrate --dry-run          # Show pending migrations without applying
    ///   cluster-scheduler migrate --rollback 1       # Rollback the last migration
    Migrate {
        /// Show pending migrations without applying
        #[arg(long, conflicts_with = "rollback")]
        dry_run: bool,

        /// Number of migrations to rollback
        ///
        /// Must be between 1 and 100. Cannot be used with --dry-run.
        #[arg(long, value_name = "STEPS", conflicts_with = "dry_run", value_parser = super::validation::validate_rollback_steps)]
        rollback: Option<u32>,
    },
}

/// Environment options
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Environment {
    #[value(name = "development", alias = "dev")]
    Development,
    #[value(name = "staging", alias = "stage")]
    Staging,
    #[value(name = "production", alias = "prod")]
    Production,
    #[value(name = "test")]
    Test,
}

/// Log level options
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogLevel {
    #[value(name = "error")]
    Error,
    #[value(name = "warn", alias = "warning")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl Cli {
    /// Argument combinations clap cannot express on its own
    pub fn validate(&self) -> Result<(), String> {
        if let Some(Commands::Migrate { dry_run, rollback }) = &self.command
            && *dry_run
            && rollback.is_some()
        {
            return Err("Cannot use --dry-run and --rollback together".to_string());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use --verbose and --quiet together".to_string());
        }

        Ok(())
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => "error".to_string(),
            LogLevel::Warn => "warn".to_string(),
            LogLevel::Info => "info".to_string(),
            LogLevel::Debug => "debug".to_string(),
            LogLevel::Trace => "trace".to_string(),
        }
    }
}

impl From<Environment> for crate::config::Environment {
    fn from(env: Environment) -> Self {
        match env {
            Environment::Development => crate::config::Environment::Development,
            Environment::Staging => crate::config::Environment::Staging,
            Environment::Production => crate::config::Environment::Production,
            Environment::Test => crate::config::Environment::Test,
        }
    }
}
