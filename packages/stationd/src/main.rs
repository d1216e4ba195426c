//! Driver programming station daemon.

mod config;
mod events;
mod pipeline;
mod process;
mod remote;
mod remote_check;
mod station;
#[cfg(test)]
mod testing;
mod watcher;

use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use stationd_interface::{
    StationInterface,
    connection::{SOCKET_NAME, StationListener},
};
use tokio::select;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::{
    config::StationConfig, events::EventBus, pipeline::serial_opener, remote::HttpRemoteService,
    station::Station, watcher::ConfiguredWatcher,
};

#[derive(Parser)]
#[command(version, about = "Driver programming station daemon")]
struct Args {
    /// Path to the JSON station config. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Log filter, e.g. `debug` or `stationd=trace`. Overrides RUST_LOG.
    #[arg(long)]
    log: Option<String>,
}

fn init_logging(filter: Option<&str>) {
    let filter = filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => StationConfig::from_file(path)?,
        None => StationConfig::default(),
    };
    info!(
        work_dir = %config.work_dir.display(),
        method = ?config.programmer.method,
        port = %config.serial.port,
        "starting station daemon"
    );

    let events = EventBus::default();
    tokio::spawn(EventBus::log_events(events.subscribe()));

    let remote = Arc::new(HttpRemoteService::new(&config.remote)?);
    let watcher = Arc::new(ConfiguredWatcher::from(&config.watcher));
    let station = Station::new(
        &config,
        remote,
        watcher,
        events,
        serial_opener(&config.serial),
    );
    let shutdown = station.shutdown_token();

    let mut listener =
        StationListener::new(station).context("could not register as the station daemon")?;
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.cancel())?;
    }
    info!(socket = SOCKET_NAME, "listening for connections");

    select! {
        _ = listener.handle_connections() => {}
        _ = shutdown.cancelled() => info!("shutting down"),
    }

    // Stops a running cycle, then lets in-flight replies flush.
    listener.interface().shutdown().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("station daemon stopped: {e:#}");
            ExitCode::FAILURE
        }
    }
}
