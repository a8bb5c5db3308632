use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use diskport::config::{AppConfig, CompressionCodec};
use diskport::context::AppContext;
use diskport::core::{ChecksumAlgorithm, Orchestrator, resolver};
use diskport::logging::{self, LogConfig};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "diskport")]
#[command(about = "Point-in-time block device export", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default /etc/diskport/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture, convert and ship the device once
    Run(RunArgs),
    /// List block devices and the target a run would pick
    Devices,
}

#[derive(Args, Serialize)]
struct RunArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    device: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    compress: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    compression: Option<CompressionCodec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verify: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    checksum: Option<ChecksumAlgorithm>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    remote: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    remote_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    marker_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Run(args) => AppConfig::new(cli.config.as_deref(), Some(args))?,
        Commands::Devices => AppConfig::new(cli.config.as_deref(), None::<&RunArgs>)?,
    };
    logging::init(LogConfig::from(&config));

    let ctx = AppContext::for_host(config);
    match &cli.command {
        Commands::Run(_) => run_export(ctx).await?,
        Commands::Devices => list_devices(&ctx).context("Failed to list devices")?,
    }

    Ok(())
}

async fn run_export(ctx: AppContext) -> Result<()> {
    spawn_signal_listener(ctx.cancel.clone())?;
    Orchestrator::new(ctx).run().await?;
    Ok(())
}

/// Cancel the run on the first SIGINT or SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, stopping after thaw"),
            _ = sigterm.recv() => info!("Received SIGTERM, stopping after thaw"),
        }
        cancel.cancel();
    });
    Ok(())
}

fn list_devices(ctx: &AppContext) -> Result<()> {
    let adapter = ctx.adapter.as_ref();
    let devices = adapter.list_devices()?;

    println!("{:<20} {:>16} {:<10} {:<10} PARENT", "DEVICE", "SIZE", "KIND", "FS");
    for d in &devices {
        println!(
            "{:<20} {:>16} {:<10} {:<10} {}",
            d.path.display(),
            d.size,
            format!("{:?}", d.kind).to_lowercase(),
            d.filesystem.as_deref().unwrap_or("-"),
            d.parent
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    match resolver::resolve_device(adapter, ctx.config.device.as_deref()) {
        Ok(device) => {
            let partitions = resolver::partitions_of(adapter, &device)?;
            let target = resolver::resolve_target(&device, &partitions);
            println!();
            println!("Selected device: {}", device.path.display());
            println!("Image target:    {target}");
        }
        Err(e) => warn!(error = %e, "No device would be selected"),
    }
    Ok(())
}
