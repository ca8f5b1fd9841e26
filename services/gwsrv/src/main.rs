//! Gateway entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use common::clock::SystemClock;
use field_modbus::serial::SerialTransport;
use tracing::info;

use gwsrv::battery::ConstBatteryProbe;
use gwsrv::config::GwConfig;
use gwsrv::gateway::GatewayNode;
use gwsrv::radio::{MockRadio, RadioDriver};

/// Command line arguments for the gateway service
#[derive(Parser)]
#[command(
    name = "gwsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Gateway: Modbus polling, payload aggregation and LoRa uplink"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/gwsrv.yaml")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    common::logging::init("gwsrv", args.log_level.as_deref());

    let config = GwConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        "starting gateway on {} with {} candidate slaves",
        config.serial.device,
        config.candidate_slaves.len()
    );

    let transport = Box::new(SerialTransport::new(config.serial.clone()));
    // The real LMIC-class stack hangs off the same trait; the mock logs
    // frames and signals completion after a simulated air time.
    let (radio, tx_complete) = MockRadio::new(Duration::from_millis(150));
    let radio: Arc<dyn RadioDriver> = Arc::new(radio);
    let battery = Arc::new(ConstBatteryProbe(12.6));
    let clock = Arc::new(SystemClock::new());

    let node = GatewayNode::start(config, transport, radio, tx_complete, battery, clock)
        .await
        .context("gateway startup failed")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutdown requested");
    node.shutdown();
    node.join().await;
    Ok(())
}
