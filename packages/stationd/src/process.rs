//! Supervision of the external programmer executable.

use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::OnceLock,
    time::Duration,
};

use regex::Regex;
use snafu::{ResultExt, Snafu};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    select,
    time::{Instant, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Output kept when no progress marker shows up, so a marker split
/// across reads is still found.
const BUFFER_TAIL: usize = 256;
const BUFFER_LIMIT: usize = 4096;

/// How long to keep reading output after the process exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProcessError {
    #[snafu(display("failed to start {}: {source}", executable.display()))]
    Spawn {
        executable: PathBuf,
        source: io::Error,
    },
    #[snafu(display("lost track of the programmer process: {source}"))]
    Process { source: io::Error },
    #[snafu(display("programmer exited with code {code}"))]
    ExitCode { code: i32 },
    #[snafu(display("programmer was terminated by a signal"))]
    Killed,
    #[snafu(display("programmer exited without reporting success"))]
    MissingSuccessMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Succeeded { exit_code: Option<i32> },
    Cancelled,
}

/// Slice of the overall cycle progress the process reports into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressRange {
    pub from: u8,
    pub to: u8,
}

impl ProgressRange {
    pub const fn new(from: u8, to: u8) -> Self {
        Self { from, to }
    }

    /// Maps a 0-100 percentage reported by the device into this range.
    pub fn map(&self, percent: u8) -> u8 {
        let span = u32::from(self.to.saturating_sub(self.from));
        self.from + (span * u32::from(percent.min(100)) / 100) as u8
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Text printed by the programmer once it succeeded.
    pub success_marker: Option<String>,
}

fn progress_pattern() -> &'static Regex {
    static PROGRESS_RE: OnceLock<Regex> = OnceLock::new();
    PROGRESS_RE
        .get_or_init(|| Regex::new(r"Progress:\s*(\d{1,3})\s*%").expect("valid progress pattern"))
}

/// Incremental scanner over the programmer's combined output.
#[derive(Debug)]
struct OutputScanner {
    buffer: String,
    success_marker: Option<String>,
    succeeded: bool,
}

impl OutputScanner {
    fn new(success_marker: Option<String>) -> Self {
        Self {
            buffer: String::new(),
            success_marker,
            succeeded: false,
        }
    }

    /// Appends `chunk` and returns the device percentages found in it.
    fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        if let Some(marker) = &self.success_marker
            && !self.succeeded
            && self.buffer.contains(marker.as_str())
        {
            debug!("programmer reported success");
            self.succeeded = true;
        }

        let mut found = Vec::new();
        let mut consumed = 0;
        for captures in progress_pattern().captures_iter(&self.buffer) {
            if let Ok(percent) = captures[1].parse::<u16>() {
                found.push(percent.min(100) as u8);
            }
            if let Some(whole) = captures.get(0) {
                consumed = whole.end();
            }
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > BUFFER_LIMIT {
            let mut keep_from = self.buffer.len() - BUFFER_TAIL;
            while !self.buffer.is_char_boundary(keep_from) {
                keep_from += 1;
            }
            self.buffer.drain(..keep_from);
        }

        found
    }
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn drain<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    scanner: &mut OutputScanner,
    deadline: Instant,
) -> Vec<u8> {
    let mut found = Vec::new();
    let mut buf = [0u8; 1024];
    while reader.is_some() {
        match timeout_at(deadline, read_some(reader, &mut buf)).await {
            Ok(Ok(n)) if n > 0 => found.extend(scanner.push(&buf[..n])),
            _ => break,
        }
    }
    found
}

/// Runs the programmer executable and follows its output.
#[derive(Debug, Clone, Default)]
pub struct ProcessDriver {
    options: ProcessOptions,
}

impl ProcessDriver {
    pub fn new(options: ProcessOptions) -> Self {
        Self { options }
    }

    /// Spawns `executable` and waits for the first of exit, process error
    /// or cancellation. Only that first signal decides the result; once
    /// this returns, the process is gone and `on_progress` is never called
    /// again.
    pub async fn run<S: AsRef<OsStr>>(
        &self,
        executable: &Path,
        args: &[S],
        range: ProgressRange,
        mut on_progress: impl FnMut(u8) + Send,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ProcessError> {
        if cancel.is_cancelled() {
            return Ok(ProcessOutcome::Cancelled);
        }

        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(SpawnSnafu { executable })?;
        info!(pid = ?child.id(), executable = %executable.display(), "programmer started");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut stdout_buf = [0u8; 1024];
        let mut stderr_buf = [0u8; 1024];
        let mut scanner = OutputScanner::new(self.options.success_marker.clone());

        let status = loop {
            select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("cancelling programmer");
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "failed to kill programmer");
                    }
                    // Reap it; kill_on_drop covers the case where this times out.
                    _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
                    return Ok(ProcessOutcome::Cancelled);
                }

                status = child.wait() => break status.context(ProcessSnafu)?,

                read = read_some(&mut stdout, &mut stdout_buf) => match read {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => {
                        trace!(output = %String::from_utf8_lossy(&stdout_buf[..n]), "programmer stdout");
                        for percent in scanner.push(&stdout_buf[..n]) {
                            on_progress(range.map(percent));
                        }
                    }
                },

                read = read_some(&mut stderr, &mut stderr_buf) => match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => {
                        trace!(output = %String::from_utf8_lossy(&stderr_buf[..n]), "programmer stderr");
                        for percent in scanner.push(&stderr_buf[..n]) {
                            on_progress(range.map(percent));
                        }
                    }
                },
            }
        };

        // Whatever was still in the pipes when the process exited.
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        for percent in drain(&mut stdout, &mut scanner, deadline).await {
            on_progress(range.map(percent));
        }
        for percent in drain(&mut stderr, &mut scanner, deadline).await {
            on_progress(range.map(percent));
        }

        let outcome = self.decide(status, scanner.succeeded);
        info!(?status, ?outcome, "programmer finished");
        outcome
    }

    fn decide(&self, status: ExitStatus, succeeded: bool) -> Result<ProcessOutcome, ProcessError> {
        if succeeded {
            return Ok(ProcessOutcome::Succeeded {
                exit_code: status.code(),
            });
        }

        match status.code() {
            None => Err(ProcessError::Killed),
            Some(0) if self.options.success_marker.is_none() => {
                Ok(ProcessOutcome::Succeeded { exit_code: Some(0) })
            }
            Some(0) => Err(ProcessError::MissingSuccessMarker),
            Some(code) => Err(ProcessError::ExitCode { code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "Programming completed successfully";

    fn driver() -> ProcessDriver {
        ProcessDriver::new(ProcessOptions {
            success_marker: Some(MARKER.to_string()),
        })
    }

    #[test]
    fn range_mapping() {
        let range = ProgressRange::new(10, 55);
        assert_eq!(range.map(0), 10);
        assert_eq!(range.map(50), 32);
        assert_eq!(range.map(100), 55);
        assert_eq!(range.map(250), 55);
    }

    #[test]
    fn marker_split_across_chunks() {
        let mut scanner = OutputScanner::new(None);
        assert!(scanner.push(b"Writing...\nProgr").is_empty());
        assert_eq!(scanner.push(b"ess: 42%\r"), vec![42]);
        // Consumed markers are not reported twice.
        assert!(scanner.push(b"\n").is_empty());
        assert_eq!(scanner.push(b"Progress: 60%Progress: 70%"), vec![60, 70]);
    }

    #[test]
    fn success_marker_detection() {
        let mut scanner = OutputScanner::new(Some(MARKER.to_string()));
        scanner.push(b"Programming completed ");
        assert!(!scanner.succeeded);
        scanner.push(b"successfully\n");
        assert!(scanner.succeeded);
    }

    #[test]
    fn buffer_stays_bounded() {
        let mut scanner = OutputScanner::new(None);
        for _ in 0..100 {
            scanner.push(&[b'x'; 1000]);
        }
        assert!(scanner.buffer.len() <= BUFFER_LIMIT);
        assert_eq!(scanner.push(b"Progress: 5%"), vec![5]);
    }

    #[cfg(unix)]
    async fn run_script(
        driver: &ProcessDriver,
        script: &str,
        cancel: &CancellationToken,
    ) -> (Result<ProcessOutcome, ProcessError>, Vec<u8>) {
        let mut progress = Vec::new();
        let result = driver
            .run(
                Path::new("sh"),
                &["-c", script],
                ProgressRange::new(10, 55),
                |p| progress.push(p),
                cancel,
            )
            .await;
        (result, progress)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn progress_is_mapped_into_range() {
        let script = format!(
            "echo 'Progress: 0%'; echo 'Progress: 50%'; echo 'Progress: 100%'; echo '{MARKER}'"
        );
        let (result, progress) = run_script(&driver(), &script, &CancellationToken::new()).await;

        assert_eq!(
            result.unwrap(),
            ProcessOutcome::Succeeded { exit_code: Some(0) }
        );
        assert_eq!(progress, vec![10, 32, 55]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn success_marker_wins_over_exit_code() {
        let script = format!("echo '{MARKER}' >&2; exit 3");
        let (result, _) = run_script(&driver(), &script, &CancellationToken::new()).await;

        assert_eq!(
            result.unwrap(),
            ProcessOutcome::Succeeded { exit_code: Some(3) }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_exit_code() {
        let (result, _) = run_script(&driver(), "exit 3", &CancellationToken::new()).await;
        assert!(matches!(result, Err(ProcessError::ExitCode { code: 3 })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_without_marker() {
        let (result, _) = run_script(&driver(), "echo done", &CancellationToken::new()).await;
        assert!(matches!(result, Err(ProcessError::MissingSuccessMarker)));

        let (result, _) = run_script(
            &ProcessDriver::default(),
            "echo done",
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_executable() {
        let result = driver()
            .run(
                Path::new("/nonexistent/programmer"),
                &["COM1"],
                ProgressRange::new(10, 55),
                |_| {},
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_kills_the_process() {
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();

        let mut progress = Vec::new();
        let result = driver()
            .run(
                Path::new("sh"),
                &["-c", "echo 'Progress: 10%'; sleep 30; echo 'Progress: 90%'"],
                ProgressRange::new(10, 55),
                |p| {
                    progress.push(p);
                    cancel.cancel();
                },
                &cancel,
            )
            .await;

        assert_eq!(result.unwrap(), ProcessOutcome::Cancelled);
        assert_eq!(progress, vec![14]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_after_exit_is_ignored() {
        let cancel = CancellationToken::new();
        let script = format!("echo '{MARKER}'");
        let (result, _) = run_script(&driver(), &script, &cancel).await;
        cancel.cancel();
        cancel.cancel();

        assert!(matches!(result, Ok(ProcessOutcome::Succeeded { .. })));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut progress = Vec::new();
        let result = driver()
            .run(
                Path::new("/nonexistent/programmer"),
                &["COM1"],
                ProgressRange::new(10, 55),
                |p| progress.push(p),
                &cancel,
            )
            .await;

        // Nothing is spawned, so the missing executable goes unnoticed.
        assert_eq!(result.unwrap(), ProcessOutcome::Cancelled);
        assert!(progress.is_empty());
    }
}
