use std::path::Path;

use anyhow::{Context, bail};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use stationd_interface::{
    ProgramOutcome, ProgramRequest, StationInterface, connection::StationConnection,
};

const PROGRESS_CHARS: &str = "⣿⣦⣀";

pub async fn program(connection: &StationConnection, request: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(request)
        .with_context(|| format!("reading {}", request.display()))?;
    let request: ProgramRequest =
        serde_json::from_str(&raw).context("parsing programming request")?;
    info!(
        "Programming order {} ({} parameters, {} units to check)",
        request.order.order_no,
        request.program.parameters.len(),
        request.units.len()
    );

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{msg:16} {pos:>3}% {bar:40.cyan} {elapsed_precise}")?
            .progress_chars(PROGRESS_CHARS),
    );

    let outcome = connection
        .program(request, {
            let bar = bar.clone();
            move |progress| {
                bar.set_message(progress.phase.to_string());
                bar.set_position(progress.percent.into());
            }
        })
        .await;
    bar.finish();

    match outcome? {
        ProgramOutcome::Completed {
            service_tag,
            input_hash,
            output_hash,
        } => {
            info!("Programmed unit {service_tag}");
            info!("  input  {input_hash}");
            info!("  output {output_hash}");
        }
        ProgramOutcome::Cancelled => warn!("Programming was cancelled"),
        ProgramOutcome::Failed { code, message } => {
            error!("Programming failed: {message}");
            bail!("programming failed with {code}");
        }
    }

    Ok(())
}
