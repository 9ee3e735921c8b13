use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use volcano_common::{BridgeConfig, ControlPoint, Framing, Switch};

use crate::{bridge::Bridge, peripheral::Peripheral, session};

#[cfg(not(feature = "ble"))]
const SIMULATED_WRITE_LATENCY: Duration = Duration::from_millis(10);

#[derive(Debug, Parser)]
#[command(name = "volcano-bridge")]
#[command(about = "Bridges text commands on a TCP port to a Volcano heater over Bluetooth LE")]
#[command(version)]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(short, long, env = "VOLCANO_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on for the control client
    #[arg(long, env = "VOLCANO_HOST")]
    host: Option<String>,

    /// Port to listen on for the control client
    #[arg(short, long, env = "VOLCANO_PORT")]
    port: Option<u16>,

    /// Bluetooth address of the unit (XX:XX:XX:XX:XX:XX)
    #[arg(short, long, env = "VOLCANO_ADDRESS")]
    address: Option<String>,

    /// Target temperature in °C to set once connected
    #[arg(long)]
    init_temp: Option<u32>,

    /// Turn the fan on once connected
    #[arg(long)]
    fan_on: bool,

    /// With --fan-on, turn the fan off again after this many seconds
    #[arg(long)]
    fan_on_time: Option<f64>,

    /// Shut the bridge down after this many seconds; 0 runs indefinitely
    #[arg(long, env = "VOLCANO_MAX_LIFETIME_SECS")]
    max_lifetime_secs: Option<u64>,

    /// How control messages are delimited: datagram or lines
    #[arg(long, env = "VOLCANO_FRAMING")]
    framing: Option<Framing>,

    /// Scan for nearby units, print them and exit
    #[arg(long)]
    discover: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args).await?;

    if args.discover {
        return discover(&config).await;
    }

    let peripheral = open_peripheral(&config);
    peripheral
        .connect()
        .await
        .with_context(|| format!("failed to connect to the unit at {}", config.device_address))?;
    info!("connected to the unit at {}", config.device_address);

    let (mut bridge, shutoff_due) = Bridge::new(Arc::clone(&peripheral));
    bridge
        .prime()
        .await
        .context("failed to read the initial status")?;
    let notifications = peripheral
        .subscribe(ControlPoint::Status)
        .await
        .context("failed to subscribe to status notifications")?;
    bridge
        .startup(&config)
        .await
        .context("failed to apply startup settings")?;

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind control server at {addr}"))?;
    info!(
        "serving on {} ({} framing)",
        listener.local_addr()?,
        config.framing.as_str()
    );
    if let Some(lifetime) = config.max_lifetime() {
        info!("shutting down after {}s", lifetime.as_secs());
    }

    let exit = session::serve(
        listener,
        &mut bridge,
        Some(notifications),
        shutoff_due,
        config.framing,
        config.max_lifetime(),
        interrupted(),
    )
    .await;

    teardown(&mut bridge, peripheral.as_ref()).await?;

    let state = bridge.state();
    info!(
        "bridge stopped ({exit:?}), heat {}, fan {}",
        state.read(Switch::Heat).as_str(),
        state.read(Switch::Fan).as_str()
    );
    Ok(())
}

/// Stops background work, waiting for the animation's resting write, before
/// dropping the notification subscription and the link.
async fn teardown(bridge: &mut Bridge, peripheral: &dyn Peripheral) -> anyhow::Result<()> {
    bridge.quiesce().await;

    if let Err(err) = peripheral.unsubscribe(ControlPoint::Status).await {
        warn!("failed to unsubscribe from status notifications: {err}");
    }
    peripheral
        .disconnect()
        .await
        .context("failed to disconnect from the unit")
}

async fn load_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read config {}", path.display()))?;
            BridgeConfig::from_json(&raw)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => BridgeConfig::default(),
    };

    if let Some(host) = &args.host {
        config.listen_host = host.clone();
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(address) = &args.address {
        config.device_address = address.clone();
    }
    if args.init_temp.is_some() {
        config.initial_temp_c = args.init_temp;
    }
    if args.fan_on {
        config.fan_on_at_connect = true;
    }
    if let Some(seconds) = args.fan_on_time {
        config.fan_on_seconds = seconds;
    }
    if let Some(seconds) = args.max_lifetime_secs {
        config.max_lifetime_secs = Some(seconds);
    }
    if let Some(framing) = args.framing {
        config.framing = framing;
    }

    config.sanitize();
    Ok(config)
}

async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler unavailable: {err}");
        std::future::pending::<()>().await;
    }
}

#[cfg(not(feature = "ble"))]
fn open_peripheral(config: &BridgeConfig) -> Arc<dyn Peripheral> {
    warn!(
        "built without the `ble` feature, simulating the unit at {}",
        config.device_address
    );
    Arc::new(
        crate::simulated::SimulatedPeripheral::new()
            .with_status_echo()
            .with_write_latency(SIMULATED_WRITE_LATENCY),
    )
}

#[cfg(feature = "ble")]
fn open_peripheral(config: &BridgeConfig) -> Arc<dyn Peripheral> {
    Arc::new(crate::ble::BlePeripheral::new(
        &config.device_address,
        Duration::from_secs(config.discovery_scan_secs),
    ))
}

#[cfg(not(feature = "ble"))]
async fn discover(_config: &BridgeConfig) -> anyhow::Result<()> {
    anyhow::bail!("device discovery needs a build with the `ble` feature")
}

#[cfg(feature = "ble")]
async fn discover(config: &BridgeConfig) -> anyhow::Result<()> {
    let scan = Duration::from_secs(config.discovery_scan_secs);
    let devices = crate::ble::discover(scan)
        .await
        .context("bluetooth scan failed")?;
    if devices.is_empty() {
        println!("no Volcano found after {}s", scan.as_secs());
    }
    for device in devices {
        println!("{} {}", device.address, device.name);
    }
    Ok(())
}
