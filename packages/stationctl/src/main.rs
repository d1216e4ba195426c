use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use stationd_interface::{StationInterface, UnitStatus, connection::StationConnection};

mod actions;

#[derive(Parser)]
#[command(version, about = "A CLI for the driver programming station daemon (stationd)")]
struct Args {
    #[clap(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Runs a programming cycle and follows its progress
    Program {
        /// Path to the JSON programming request
        request: PathBuf,
    },
    /// Cancels the running programming cycle
    Cancel,
    /// Checks scanned units against the remote service
    ///
    /// Without a code, reads codes interactively until Ctrl-D.
    Scan {
        code: Option<String>,

        /// Identifies the scanner the codes come from
        #[arg(short, long, default_value = "stationctl")]
        scanner: String,
    },
    /// Shows the running cycle and the units waiting to be checked
    Status,
    StopDaemon,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _ = simplelog::TermLogger::init(
        log::LevelFilter::Info,
        Default::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let connection = StationConnection::new()
        .await
        .context("Failed to connect to stationd! Is it running?")?;

    match args.action {
        Action::Program { request } => actions::program::program(&connection, &request).await?,
        Action::Cancel => {
            connection.cancel().await?;
            info!("Cancel requested");
        }
        Action::Scan { code, scanner } => actions::scan::scan(&connection, code, scanner).await?,
        Action::Status => {
            let status = connection.status().await?;
            match status.session {
                Some(session) => info!(
                    "Programming order {} ({}): {}% {}{}",
                    session.order.order_no,
                    session.service_tag.as_deref().unwrap_or("no service tag yet"),
                    session.percent,
                    session.phase,
                    if session.cancelled { ", cancelling" } else { "" }
                ),
                None => info!("No programming cycle running"),
            }
            for (index, unit) in status.units.iter().enumerate() {
                let state = match &unit.status {
                    UnitStatus::Waiting => "waiting".to_string(),
                    UnitStatus::Checking => "checking".to_string(),
                    UnitStatus::Checked => "checked".to_string(),
                    UnitStatus::Failed { reason } => format!("failed ({reason})"),
                };
                info!("  #{} {:<16} {state}", index + 1, unit.identifier);
            }
            if status.waiting_for_units {
                info!("Waiting for units to be scanned");
            }
        }
        Action::StopDaemon => {
            connection.shutdown().await?;
            info!("Daemon is shutting down");
        }
    }

    anyhow::Ok(())
}
