use log::{error, info, warn};
use rustyline::{DefaultEditor, error::ReadlineError};
use stationd_interface::{ScanOutcome, StationInterface, connection::StationConnection};

pub async fn scan(
    connection: &StationConnection,
    code: Option<String>,
    scanner: String,
) -> anyhow::Result<()> {
    if let Some(code) = code {
        return scan_once(connection, code, &scanner).await;
    }

    info!("Scan unit codes, one per line. Ctrl-D to stop.");
    let mut editor = DefaultEditor::new()?;
    loop {
        let line = match editor.readline("scan >> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let code = line.trim();
        if code.is_empty() {
            continue;
        }
        _ = editor.add_history_entry(code);

        if let Err(e) = scan_once(connection, code.to_string(), &scanner).await {
            error!("{e:#}");
        }
    }

    Ok(())
}

async fn scan_once(
    connection: &StationConnection,
    code: String,
    scanner: &str,
) -> anyhow::Result<()> {
    match connection.scan(code, scanner.to_string()).await? {
        ScanOutcome::Checked { unit } => info!("Unit #{} checked", unit + 1),
        ScanOutcome::Failed { reason } => error!("Check failed: {reason}"),
        ScanOutcome::Rejected { reason } => warn!("Scan rejected: {reason}"),
    }
    Ok(())
}
