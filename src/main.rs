use clap::Parser;

use cluster_scheduler::cli::{Cli, execute_command, init_logger_from_settings, load_and_merge_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = load_and_merge_config(&cli)?;
    init_logger_from_settings(&settings)?;

    tracing::debug!(
        app_name = %settings.application.name,
        app_version = %settings.application.version,
        "Configuration loaded"
    );

    execute_command(&cli, settings).await?;
    Ok(())
}
