//! One programming cycle, from service tag to verified output.
//!
//! A cycle runs a fixed table of phases in order. A failing phase stops the
//! cycle; once the session is cancelled the remaining phases are skipped.
//! Either way [`Pipeline::run`] ends in a single finalize step that decides
//! the outcome and publishes it.

use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use stationd_interface::{
    ErrorCode, Phase, ProgramOutcome, ProgramProgress, ProgramRequest, SessionSummary,
};
use stationd_protocol::{MasterError, ProtocolMaster, open_serial, packets::DeviceStatus};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{ProgramMethod, SerialConfig, StationConfig},
    events::{EventBus, StationEvent},
    process::{ProcessDriver, ProcessError, ProcessOutcome, ProgressRange},
    remote::{RemoteService, ServiceError},
    watcher::{ExpectedFile, VerificationWatcher, WatchError, WatchOutcome},
};

const PHASES: [Phase; 5] = [
    Phase::IssueServiceTag,
    Phase::PrepareInput,
    Phase::Program,
    Phase::ReadOutput,
    Phase::Verify,
];

const PROGRAM_RANGE: ProgressRange = ProgressRange::new(10, 55);
const VERIFY_RANGE: ProgressRange = ProgressRange::new(70, 100);

#[derive(Debug, Snafu)]
pub enum PipelineError {
    #[snafu(display("could not issue a service tag: {source}"))]
    ServiceTag { source: ServiceError },
    #[snafu(display("could not write the input file: {source}"))]
    PrepareInput { source: io::Error },
    #[snafu(display("programmer executable {} not found", path.display()))]
    ProgrammerMissing { path: PathBuf },
    #[snafu(display("programmer failed: {source}"))]
    Programmer { source: ProcessError },
    #[snafu(display("driver communication failed: {source}"))]
    Device { source: MasterError },
    #[snafu(display("driver reports a fault: {status:?}"))]
    DeviceFault { status: DeviceStatus },
    #[snafu(display("parameter {id} reads back as {actual}, wrote {expected}"))]
    Readback { id: u16, expected: u16, actual: u16 },
    #[snafu(display("programmer left no output at {}", path.display()))]
    OutputMissing { path: PathBuf },
    #[snafu(display("could not read the output file: {source}"))]
    ReadOutput { source: io::Error },
    #[snafu(display("verification failed: {source}"))]
    Verification { source: WatchError },
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::ServiceTag { .. } => ErrorCode::ServiceTagFailure,
            PipelineError::PrepareInput { .. } => ErrorCode::PreparingInputFileFailure,
            PipelineError::ProgrammerMissing { .. } => ErrorCode::ProgrammerFileMissing,
            PipelineError::Programmer { .. } => ErrorCode::ProgrammerFailure,
            PipelineError::Device { .. }
            | PipelineError::DeviceFault { .. }
            | PipelineError::Readback { .. } => ErrorCode::DeviceFailure,
            PipelineError::OutputMissing { .. } => ErrorCode::OutputFileMissing,
            PipelineError::ReadOutput { .. } => ErrorCode::ReadingOutputFileFailure,
            PipelineError::Verification {
                source: WatchError::Timeout { .. },
            } => ErrorCode::VerificationTimeout,
            PipelineError::Verification { .. } => ErrorCode::VerificationFailure,
        }
    }
}

/// A file in the working directory named after the hash of its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub hash: String,
    pub path: PathBuf,
}

/// Writes `content` as `<sha256>.<extension>` under `dir`. An artifact with
/// the same hash is never rewritten.
pub async fn persist(dir: &Path, content: &[u8], extension: &str) -> io::Result<Artifact> {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let hash = format!("{:x}", hasher.finalize());
    let path = dir.join(format!("{hash}.{extension}"));

    if tokio::fs::try_exists(&path).await? {
        debug!(path = %path.display(), "artifact already present");
    } else {
        tokio::fs::create_dir_all(dir).await?;
        let partial = dir.join(format!("{hash}.{extension}.tmp"));
        tokio::fs::write(&partial, content).await?;
        tokio::fs::rename(&partial, &path).await?;
        debug!(path = %path.display(), "artifact written");
    }

    Ok(Artifact { hash, path })
}

/// The file handed to the programmer.
pub fn render_input(request: &ProgramRequest, service_tag: &str) -> String {
    let mut input = format!(
        "[program]\nname={}\norder={}\nnc12={}\nservice_tag={}\n\n[parameters]\n",
        request.program.name, request.order.order_no, request.order.nc12, service_tag
    );
    for parameter in &request.program.parameters {
        input.push_str(&format!("{}={}\n", parameter.id, parameter.value));
    }
    input
}

/// Byte stream a driver can be reached over.
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> DeviceStream for T {}

pub type DeviceOpener = Arc<dyn Fn() -> Result<Box<dyn DeviceStream>, MasterError> + Send + Sync>;

pub fn serial_opener(config: &SerialConfig) -> DeviceOpener {
    let port = config.port.clone();
    let baud = config.baud;
    Arc::new(move || {
        let stream = open_serial(&port, baud)?;
        Ok(Box::new(stream) as Box<dyn DeviceStream>)
    })
}

/// Destroys the master when the phase using it ends, however it ends.
struct MasterGuard(ProtocolMaster);

impl Drop for MasterGuard {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

/// Forwards monotonic progress to the caller, the session summary and the
/// event bus. Nothing is reported once the session is cancelled.
#[derive(Debug)]
pub struct ProgressReporter {
    current: ProgramProgress,
    updates: mpsc::UnboundedSender<ProgramProgress>,
    summary: watch::Sender<SessionSummary>,
    events: EventBus,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub fn new(
        updates: mpsc::UnboundedSender<ProgramProgress>,
        summary: watch::Sender<SessionSummary>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            current: ProgramProgress {
                percent: 0,
                phase: Phase::IssueServiceTag,
            },
            updates,
            summary,
            events,
            cancel,
        }
    }

    pub fn report(&mut self, phase: Phase, percent: u8) {
        if self.cancel.is_cancelled() {
            return;
        }

        let progress = ProgramProgress {
            percent: percent.clamp(self.current.percent, 100),
            phase,
        };
        if progress == self.current {
            return;
        }
        self.current = progress;

        self.summary.send_modify(|summary| {
            summary.percent = progress.percent;
            summary.phase = progress.phase;
        });
        self.events.publish(StationEvent::ProgressChanged(progress));
        _ = self.updates.send(progress);
    }
}

/// State of one programming cycle.
#[derive(Debug)]
pub struct ProgrammingSession {
    request: ProgramRequest,
    service_tag: Option<String>,
    input: Option<Artifact>,
    /// Where the programming step leaves its raw result.
    raw_output: Option<PathBuf>,
    output: Option<Artifact>,
    output_content: Option<String>,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl ProgrammingSession {
    pub fn new(request: ProgramRequest, cancel: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            request,
            service_tag: None,
            input: None,
            raw_output: None,
            output: None,
            output_content: None,
            cancel,
            progress,
        }
    }

    fn service_tag(&self) -> &str {
        self.service_tag.as_deref().unwrap_or_default()
    }
}

pub struct Pipeline<R, W> {
    remote: Arc<R>,
    watcher: Arc<W>,
    events: EventBus,
    work_dir: PathBuf,
    serial: SerialConfig,
    method: ProgramMethod,
    executable: PathBuf,
    driver: ProcessDriver,
    device: DeviceOpener,
}

impl<R: RemoteService, W: VerificationWatcher> Pipeline<R, W> {
    pub fn new(
        config: &StationConfig,
        remote: Arc<R>,
        watcher: Arc<W>,
        events: EventBus,
        device: DeviceOpener,
    ) -> Self {
        Self {
            remote,
            watcher,
            events,
            work_dir: config.work_dir.clone(),
            serial: config.serial.clone(),
            method: config.programmer.method,
            executable: config.programmer.executable.clone(),
            driver: ProcessDriver::new(config.programmer.process_options()),
            device,
        }
    }

    /// Runs every phase of the cycle and finalizes it exactly once.
    pub async fn run(&self, mut session: ProgrammingSession) -> ProgramOutcome {
        info!(order = %session.request.order.order_no, "programming cycle started");

        let mut failure = None;
        for phase in PHASES {
            if session.cancel.is_cancelled() {
                debug!(%phase, "skipping phase of cancelled cycle");
                continue;
            }

            debug!(%phase, "entering phase");
            if let Err(e) = self.run_phase(phase, &mut session).await {
                warn!(%phase, error = %e, "phase failed");
                failure = Some(e);
                break;
            }
        }

        self.finalize(session, failure).await
    }

    async fn run_phase(
        &self,
        phase: Phase,
        session: &mut ProgrammingSession,
    ) -> Result<(), PipelineError> {
        match phase {
            Phase::IssueServiceTag => self.issue_service_tag(session).await,
            Phase::PrepareInput => self.prepare_input(session).await,
            Phase::Program => match self.method {
                ProgramMethod::External => self.program_external(session).await,
                ProgramMethod::Direct => self.program_direct(session).await,
            },
            Phase::ReadOutput => self.read_output(session).await,
            Phase::Verify => self.verify(session).await,
            Phase::Finalize => Ok(()),
        }
    }

    async fn issue_service_tag(&self, session: &mut ProgrammingSession) -> Result<(), PipelineError> {
        let tag = select! {
            _ = session.cancel.cancelled() => return Ok(()),
            tag = self.remote.issue_service_tag(&session.request.order) => tag.context(ServiceTagSnafu)?,
        };
        info!(service_tag = %tag, "service tag issued");

        session.progress.summary.send_modify(|s| s.service_tag = Some(tag.clone()));
        session.service_tag = Some(tag);
        session.progress.report(Phase::IssueServiceTag, 1);
        Ok(())
    }

    async fn prepare_input(&self, session: &mut ProgrammingSession) -> Result<(), PipelineError> {
        let input = render_input(&session.request, session.service_tag());
        let artifact = persist(&self.work_dir, input.as_bytes(), "input")
            .await
            .context(PrepareInputSnafu)?;

        let raw_output = self.work_dir.join(format!("{}.result", artifact.hash));
        match tokio::fs::remove_file(&raw_output).await {
            Ok(()) => debug!(path = %raw_output.display(), "removed stale programmer output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(PrepareInputSnafu),
        }

        info!(hash = %artifact.hash, "input file prepared");
        session.input = Some(artifact);
        session.raw_output = Some(raw_output);
        session.progress.report(Phase::PrepareInput, 5);
        Ok(())
    }

    async fn program_external(&self, session: &mut ProgrammingSession) -> Result<(), PipelineError> {
        let (Some(input), Some(raw_output)) = (&session.input, &session.raw_output) else {
            return Ok(());
        };
        let args = [
            OsStr::new(&self.serial.port),
            input.path.as_os_str(),
            raw_output.as_os_str(),
        ];

        let progress = &mut session.progress;
        let result = self
            .driver
            .run(
                &self.executable,
                &args,
                PROGRAM_RANGE,
                |percent| progress.report(Phase::Program, percent),
                &session.cancel,
            )
            .await;

        match result {
            Ok(ProcessOutcome::Succeeded { exit_code }) => {
                info!(?exit_code, "programmer succeeded");
                session.progress.report(Phase::Program, PROGRAM_RANGE.to);
                Ok(())
            }
            Ok(ProcessOutcome::Cancelled) => Ok(()),
            Err(ProcessError::Spawn { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                ProgrammerMissingSnafu {
                    path: self.executable.clone(),
                }
                .fail()
            }
            Err(source) => Err(PipelineError::Programmer { source }),
        }
    }

    async fn program_direct(&self, session: &mut ProgrammingSession) -> Result<(), PipelineError> {
        let Some(raw_output) = session.raw_output.clone() else {
            return Ok(());
        };
        let stream = (self.device)().context(DeviceSnafu)?;
        let master = MasterGuard(ProtocolMaster::new(stream, self.serial.master_options()));

        let cancel = session.cancel.clone();
        let readback = select! {
            _ = cancel.cancelled() => return Ok(()),
            readback = self.write_parameters(&master.0, session) => readback?,
        };

        tokio::fs::write(&raw_output, readback)
            .await
            .context(ReadOutputSnafu)?;
        session.progress.report(Phase::Program, PROGRAM_RANGE.to);
        Ok(())
    }

    /// Writes every parameter, reads each one back and switches the output
    /// on. Returns the read-back values.
    async fn write_parameters(
        &self,
        master: &ProtocolMaster,
        session: &mut ProgrammingSession,
    ) -> Result<String, PipelineError> {
        let info = master.connect().await.context(DeviceSnafu)?;
        info!(firmware = ?info.firmware, status = ?info.status, "connected to driver");
        if info.status.has_fault() {
            return DeviceFaultSnafu { status: info.status }.fail();
        }

        let parameters = &session.request.program.parameters;
        let mut readback = String::new();
        for (index, parameter) in parameters.iter().enumerate() {
            master
                .write_parameter(parameter.id, parameter.value)
                .await
                .context(DeviceSnafu)?;
            let actual = master
                .read_parameter(parameter.id)
                .await
                .context(DeviceSnafu)?;
            if actual != parameter.value {
                return ReadbackSnafu {
                    id: parameter.id,
                    expected: parameter.value,
                    actual,
                }
                .fail();
            }
            readback.push_str(&format!("{}={}\n", parameter.id, actual));

            let done = ((index + 1) * 100 / parameters.len()) as u8;
            session.progress.report(Phase::Program, PROGRAM_RANGE.map(done));
        }

        let status = master.run().await.context(DeviceSnafu)?;
        if status.has_fault() {
            _ = master.stop().await;
            return DeviceFaultSnafu { status }.fail();
        }
        Ok(readback)
    }

    async fn read_output(&self, session: &mut ProgrammingSession) -> Result<(), PipelineError> {
        let Some(raw_output) = &session.raw_output else {
            return Ok(());
        };
        let content = match tokio::fs::read(raw_output).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return OutputMissingSnafu {
                    path: raw_output.clone(),
                }
                .fail();
            }
            Err(e) => return Err(e).context(ReadOutputSnafu),
        };

        let artifact = persist(&self.work_dir, &content, "output")
            .await
            .context(ReadOutputSnafu)?;
        info!(hash = %artifact.hash, "output file stored");

        session.output_content = Some(String::from_utf8_lossy(&content).into_owned());
        session.output = Some(artifact);
        session.progress.report(Phase::ReadOutput, 58);
        Ok(())
    }

    async fn verify(&self, session: &mut ProgrammingSession) -> Result<(), PipelineError> {
        let expected = ExpectedFile {
            name: format!("{}.txt", session.service_tag()),
            content: session.output_content.clone().unwrap_or_default(),
        };

        let progress = &mut session.progress;
        let outcome = self
            .watcher
            .watch(
                expected,
                |percent| progress.report(Phase::Verify, VERIFY_RANGE.map(percent)),
                &session.cancel,
            )
            .await
            .context(VerificationSnafu)?;

        if outcome == WatchOutcome::Verified {
            info!("output verified");
            session.progress.report(Phase::Verify, 100);
        }
        Ok(())
    }

    async fn finalize(
        &self,
        session: ProgrammingSession,
        failure: Option<PipelineError>,
    ) -> ProgramOutcome {
        if let Some(raw_output) = &session.raw_output {
            _ = tokio::fs::remove_file(raw_output).await;
        }

        let cancelled = session.cancel.is_cancelled();
        let outcome = match failure {
            Some(e) => ProgramOutcome::Failed {
                code: e.code(),
                message: e.to_string(),
            },
            None if cancelled => ProgramOutcome::Cancelled,
            None => ProgramOutcome::Completed {
                service_tag: session.service_tag().to_string(),
                input_hash: session.input.map(|a| a.hash).unwrap_or_default(),
                output_hash: session.output.map(|a| a.hash).unwrap_or_default(),
            },
        };

        session
            .progress
            .summary
            .send_modify(|s| s.cancelled = cancelled);
        info!(?outcome, "programming cycle finished");
        self.events.publish(StationEvent::ProgrammerFinished {
            outcome: outcome.clone(),
        });
        outcome
    }
}
