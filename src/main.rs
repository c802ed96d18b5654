mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ConfigCommands};
use platform_backup_agent::core::callback::StdoutReportSink;
use platform_backup_agent::core::{Orchestrator, TaskGuard, TriggerResponse};
use platform_backup_agent::utils::{mask_sensitive, AgentConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Backup { tag } => run_task(&cli.config, |agent| agent.backup(tag, None)).await,
        Commands::Restore { tag } => run_task(&cli.config, |agent| agent.restore(&tag, None)).await,
        Commands::Update => run_task(&cli.config, Orchestrator::update).await,
        Commands::UpdateDistro => run_task(&cli.config, Orchestrator::update_distro).await,
        Commands::Config { command } => handle_config(&cli.config, command),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "info,platform_backup_agent=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_task<F>(config_path: &Path, trigger: F) -> Result<()>
where
    F: FnOnce(&Orchestrator) -> TriggerResponse,
{
    let config = AgentConfig::load(config_path)?;
    let guard = Arc::new(TaskGuard::new());
    let orchestrator = Orchestrator::from_config(config, guard.clone())
        .context("Failed to set up the agent")?
        .with_sink(Arc::new(StdoutReportSink));

    let response = trigger(&orchestrator);
    if !response.is_launched() {
        bail!("Task not started: {}", response.message());
    }

    // The worker is detached; wait for the slot to free up
    while !guard.is_idle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}

fn handle_config(config_path: &Path, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let mut config = AgentConfig::load(config_path)?;
            if let Some(s3) = config.storage.s3.as_mut() {
                s3.access_key = mask_sensitive(&s3.access_key, 4);
                s3.secret_key = mask_sensitive(&s3.secret_key, 0);
            }
            if let Some(token) = config.backups.callback_token.as_mut() {
                *token = mask_sensitive(token, 0);
            }
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("# {}\n{}", config_path.display(), text);
        }
        ConfigCommands::Init { force } => {
            if config_path.exists() && !force {
                bail!(
                    "{} already exists, pass --force to overwrite it",
                    config_path.display()
                );
            }
            AgentConfig::default().save(config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }
    Ok(())
}
