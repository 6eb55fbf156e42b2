use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ripd::{
    config::AppConfig,
    context::AppContext,
    core::{Orchestrator, find_resumable},
    logging::{self, LogConfig},
};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ripd")]
#[command(about = "Automated optical disc ripping daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch optical drives and rip inserted discs.
    Daemon(ServerArgs),
    /// List interrupted jobs that can be resumed.
    Resumable,
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    temp_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    output_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    resume_on_start: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::new(Some(args))?,
        _ => AppConfig::new(None::<&ServerArgs>)?,
    };

    logging::init(LogConfig::from(&config));

    match &cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Failed to start daemon")?,
        Commands::Resumable => run_resumable(&config).await,
        Commands::Config => {
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", text);
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    Orchestrator::new(AppContext::new(config)).start().await
}

async fn run_resumable(config: &AppConfig) {
    let snapshots = find_resumable(&config.temp_directory).await;
    if snapshots.is_empty() {
        println!("No resumable jobs in {}", config.temp_directory.display());
        return;
    }

    for s in snapshots {
        println!(
            "{}  {:<14} {:<24} {}/{} steps  {}%",
            s.job_id,
            s.disc_type,
            s.disc_label,
            s.completed_steps(),
            s.steps.len(),
            s.progress
        );
    }
}
