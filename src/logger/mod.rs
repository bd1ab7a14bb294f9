//! Tracing setup
//!
//! One global `tracing-subscriber` registry with an `EnvFilter`, an optional
//! console layer and an optional file layer (full, compact or JSON).

pub mod config;
pub mod error;

pub use config::*;
pub use error::LoggerError;

use std::fs::{File, OpenOptions};
use std::io::IsTerminal;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber described by `config`
pub fn init_logger(config: LoggerConfig) -> anyhow::Result<()> {
    config.validate()?;

    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    // The file layer goes first: span fields are formatted by the first
    // layer, and the console's ANSI codes would otherwise leak into the file.
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    if config.file.enabled {
        layers.push(file_layer(&config.file)?);
    }
    if config.console.enabled {
        layers.push(console_layer(&config.console));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(LoggerError::from)?;

    Ok(())
}

fn console_layer(config: &ConsoleConfig) -> BoxedLayer {
    let use_ansi = config.colored && std::io::stdout().is_terminal();
    fmt::layer()
        .with_ansi(use_ansi)
        .with_target(true)
        .with_level(true)
        .boxed()
}

fn file_layer(config: &FileConfig) -> Result<BoxedLayer, LoggerError> {
    let writer = open_log_file(config)?;
    let layer = fmt::layer().with_ansi(false).with_target(true);
    Ok(match config.format {
        LogFormat::Full => layer.with_writer(writer).boxed(),
        LogFormat::Compact => layer.compact().with_writer(writer).boxed(),
        LogFormat::Json => layer.json().with_writer(writer).boxed(),
    })
}

fn open_log_file(config: &FileConfig) -> Result<Mutex<File>, LoggerError> {
    if let Some(parent) = config.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(config.append)
        .truncate(!config.append)
        .open(&config.path)?;
    Ok(Mutex::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_log_file_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let config = FileConfig {
            enabled: true,
            path: dir.path().join("nested/deeper/scheduler.log"),
            append: true,
            format: LogFormat::Json,
        };
        open_log_file(&config).unwrap();
        assert!(config.path.exists());
    }

    #[test]
    fn test_file_layer_for_every_format() {
        let dir = TempDir::new().unwrap();
        for format in [LogFormat::Full, LogFormat::Compact, LogFormat::Json] {
            let config = FileConfig {
                enabled: true,
                path: dir.path().join(format!("{}.log", format.as_str())),
                append: false,
                format,
            };
            assert!(file_layer(&config).is_ok());
        }
    }

    #[test]
    fn test_init_logger_rejects_invalid_config() {
        let config = LoggerConfig {
            level: "nope".to_string(),
            ..Default::default()
        };
        assert!(init_logger(config).is_err());
    }
}
