//! Layered configuration loading
//!
//! Sources, lowest priority first: `default.toml`, `{environment}.toml`,
//! `local.toml` from the configuration directory, then `SCHEDULER_*`
//! environment variables. A single file given through `SCHEDULER_CONFIG_FILE`
//! or `--config` replaces the three files.

use std::path::{Path, PathBuf};

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};

use crate::config::environment::Environment as AppEnvironment;
use crate::config::error::ConfigError;
use crate::config::settings::Settings;

const CONFIG_DIR_ENV: &str = "SCHEDULER_CONFIG_DIR";
const CONFIG_FILE_ENV: &str = "SCHEDULER_CONFIG_FILE";
const DEFAULT_CONFIG_DIR: &str = "config";

/// `SCHEDULER_NODE__ID` sets `node.id`
const ENV_PREFIX: &str = "SCHEDULER";
const ENV_SEPARATOR: &str = "__";

/// Where the settings come from
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Layered(PathBuf),
    SingleFile(PathBuf),
}

#[derive(Debug)]
pub struct ConfigLoader {
    source: Source,
    environment: AppEnvironment,
}

impl ConfigLoader {
    /// Loader driven by `SCHEDULER_CONFIG_DIR`, `SCHEDULER_CONFIG_FILE` and
    /// `SCHEDULER_APP_ENV`
    ///
    /// # Errors
    ///
    /// The directory and the single file variables are mutually exclusive.
    pub fn new() -> Result<Self, ConfigError> {
        let source = match (std::env::var(CONFIG_DIR_ENV), std::env::var(CONFIG_FILE_ENV)) {
            (Ok(_), Ok(_)) => {
                return Err(ConfigError::mutual_exclusivity(
                    "SCHEDULER_CONFIG_DIR and SCHEDULER_CONFIG_FILE cannot both be set; \
                     pick a configuration directory or a single file",
                ));
            }
            (_, Ok(file)) => Source::SingleFile(PathBuf::from(file)),
            (Ok(dir), _) => Source::Layered(PathBuf::from(dir)),
            _ => Source::Layered(PathBuf::from(DEFAULT_CONFIG_DIR)),
        };

        Ok(Self {
            source,
            environment: AppEnvironment::from_env(),
        })
    }

    /// Loader for a single configuration file
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::SingleFile(path.into()),
            environment: AppEnvironment::from_env(),
        }
    }

    /// Override the environment used to pick `{environment}.toml`
    pub fn with_environment(mut self, environment: AppEnvironment) -> Self {
        self.environment = environment;
        self
    }

    pub fn environment(&self) -> AppEnvironment {
        self.environment
    }

    /// The layered configuration directory, if this loader reads one
    pub fn config_dir(&self) -> Option<&Path> {
        match &self.source {
            Source::Layered(dir) => Some(dir),
            Source::SingleFile(_) => None,
        }
    }

    /// Read, deserialize and validate the settings
    ///
    /// # Errors
    ///
    /// A missing required file, a parse failure or an invalid value.
    pub fn load(&self) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder();
        for (path, required) in self.files() {
            builder = with_file(builder, &path, required)?;
        }
        let builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator(ENV_SEPARATOR)
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()?
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(format!("Failed to deserialize configuration: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Files to read with their required flag, lowest priority first
    fn files(&self) -> Vec<(PathBuf, bool)> {
        match &self.source {
            Source::SingleFile(path) => vec![(path.clone(), true)],
            Source::Layered(dir) => vec![
                (dir.join("default.toml"), true),
                (dir.join(format!("{}.toml", self.environment.as_str())), false),
                (dir.join("local.toml"), false),
            ],
        }
    }
}

fn with_file(
    builder: ConfigBuilder<DefaultState>,
    path: &Path,
    required: bool,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    if required && !path.exists() {
        return Err(ConfigError::file_not_found(format!(
            "Required configuration file not found: {}",
            path.display()
        )));
    }
    let name = path.to_string_lossy();
    Ok(builder.add_source(File::new(&name, FileFormat::Toml).required(required)))
}
