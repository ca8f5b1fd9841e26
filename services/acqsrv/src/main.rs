//! Acquisition unit entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use field_modbus::serial::SerialTransport;
use tokio::sync::watch;
use tracing::info;

use acqsrv::config::AcqConfig;
use acqsrv::node;
use acqsrv::sampling::SimSweepSource;

/// Command line arguments for the acquisition service
#[derive(Parser)]
#[command(
    name = "acqsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Acquisition unit: RMS engine and Modbus RTU register server"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/acqsrv.yaml")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    common::logging::init("acqsrv", args.log_level.as_deref());

    let config = AcqConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        "starting acquisition unit {} on {}",
        config.unit_id, config.serial.device
    );

    let transport = Box::new(SerialTransport::new(config.serial.clone()));
    let source = Box::new(SimSweepSource::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    node::run_node(config, transport, source, shutdown_rx)
        .await
        .context("acquisition node failed")?;
    Ok(())
}
