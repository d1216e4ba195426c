//! File handshake with the independent verification station.
//!
//! The verification station reads the programmed device back and drops a
//! file named after the unit's service tag. Programming is only confirmed
//! once that file shows up with the content we wrote.

use std::{future::Future, path::PathBuf, time::Duration};

use snafu::{ResultExt, Snafu};
use tokio::{
    select,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::WatcherConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Verified,
    Cancelled,
}

#[derive(Debug, Snafu)]
pub enum WatchError {
    #[snafu(display("verification file {name} does not match the programmed output"))]
    Mismatch { name: String },
    #[snafu(display("verification file {name} did not appear in time"))]
    Timeout { name: String },
    #[snafu(display("failed to read verification file {}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub trait VerificationWatcher: Send + Sync + 'static {
    /// Waits for `expected` to be confirmed, reporting progress 0-100.
    fn watch(
        &self,
        expected: ExpectedFile,
        on_progress: impl FnMut(u8) + Send,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<WatchOutcome, WatchError>> + Send;
}

/// Polls a directory for the expected file.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    dir: PathBuf,
    timeout: Duration,
    poll: Duration,
}

impl FileWatcher {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration, poll: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            poll,
        }
    }
}

impl VerificationWatcher for FileWatcher {
    async fn watch(
        &self,
        expected: ExpectedFile,
        mut on_progress: impl FnMut(u8) + Send,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome, WatchError> {
        let path = self.dir.join(&expected.name);
        let started = Instant::now();
        let deadline = started + self.timeout;
        info!(path = %path.display(), "waiting for verification file");

        // The station may still be writing, so a differing file only fails
        // the check if it still differs at the deadline.
        let mut mismatched = false;
        loop {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) if content.trim() == expected.content.trim() => {
                    on_progress(100);
                    return Ok(WatchOutcome::Verified);
                }
                Ok(_) => {
                    debug!(path = %path.display(), "verification file differs, polling again");
                    mismatched = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "verification file not there yet");
                    mismatched = false;
                }
                Err(e) => return Err(e).context(IoSnafu { path }),
            }

            let now = Instant::now();
            if now >= deadline {
                if mismatched {
                    return MismatchSnafu { name: expected.name }.fail();
                }
                return TimeoutSnafu { name: expected.name }.fail();
            }
            let elapsed = now.duration_since(started).as_millis();
            let percent = (elapsed * 100 / self.timeout.as_millis().max(1)).min(99) as u8;
            on_progress(percent);

            select! {
                _ = cancel.cancelled() => return Ok(WatchOutcome::Cancelled),
                _ = sleep(self.poll.min(deadline - now)) => {}
            }
        }
    }
}

/// The watcher selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredWatcher {
    /// No verification station attached; every unit passes immediately.
    Disabled,
    Files(FileWatcher),
}

impl From<&WatcherConfig> for ConfiguredWatcher {
    fn from(config: &WatcherConfig) -> Self {
        match &config.dir {
            Some(dir) => ConfiguredWatcher::Files(FileWatcher::new(
                dir,
                Duration::from_millis(config.timeout_ms),
                Duration::from_millis(config.poll_ms),
            )),
            None => ConfiguredWatcher::Disabled,
        }
    }
}

impl VerificationWatcher for ConfiguredWatcher {
    async fn watch(
        &self,
        expected: ExpectedFile,
        mut on_progress: impl FnMut(u8) + Send,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome, WatchError> {
        match self {
            ConfiguredWatcher::Disabled => {
                if cancel.is_cancelled() {
                    return Ok(WatchOutcome::Cancelled);
                }
                on_progress(100);
                Ok(WatchOutcome::Verified)
            }
            ConfiguredWatcher::Files(watcher) => watcher.watch(expected, on_progress, cancel).await,
        }
    }
}
