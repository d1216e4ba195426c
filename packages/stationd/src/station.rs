//! The daemon's [`StationInterface`] implementation.

use std::sync::Arc;

use anyhow::Context;
use stationd_interface::{
    ErrorCode, OrderContext, Phase, ProgramOutcome, ProgramProgress, ProgramRequest, Result,
    ScanOutcome, SessionSummary, StationInterface, StationStatus,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::StationConfig,
    events::{EventBus, StationEvent},
    pipeline::{DeviceOpener, Pipeline, ProgrammingSession, ProgressReporter},
    remote::RemoteService,
    remote_check::{CheckError, RemoteCheckCoordinator},
    watcher::VerificationWatcher,
};

struct ActiveSession {
    cancel: CancellationToken,
    summary: watch::Receiver<SessionSummary>,
}

#[derive(Default)]
struct Sessions {
    active: Option<ActiveSession>,
    /// Order of the most recent cycle; scans are checked against it.
    order: Option<OrderContext>,
}

pub struct Station<R, W> {
    pipeline: Arc<Pipeline<R, W>>,
    checks: RemoteCheckCoordinator<R>,
    events: EventBus,
    sessions: Arc<Mutex<Sessions>>,
    shutdown: CancellationToken,
}

impl<R: RemoteService, W: VerificationWatcher> Station<R, W> {
    pub fn new(
        config: &StationConfig,
        remote: Arc<R>,
        watcher: Arc<W>,
        events: EventBus,
        device: DeviceOpener,
    ) -> Self {
        let checks =
            RemoteCheckCoordinator::new(remote.clone(), events.clone(), config.check.options());
        let pipeline = Pipeline::new(config, remote, watcher, events.clone(), device);

        Self {
            pipeline: Arc::new(pipeline),
            checks,
            events,
            sessions: Arc::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled once a client asks the daemon to stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl<R: RemoteService, W: VerificationWatcher> StationInterface for Station<R, W> {
    async fn program(
        &self,
        request: ProgramRequest,
        mut handle_progress: impl FnMut(ProgramProgress) + Send,
    ) -> Result<ProgramOutcome> {
        let cancel = CancellationToken::new();
        let (updates, mut progress) = mpsc::unbounded_channel();
        let (summary, summary_rx) = watch::channel(SessionSummary {
            order: request.order.clone(),
            service_tag: None,
            percent: 0,
            phase: Phase::IssueServiceTag,
            cancelled: false,
        });

        {
            let mut sessions = self.sessions.lock().await;
            if sessions.active.is_some() {
                warn!(order = %request.order.order_no, "refusing a second programming cycle");
                return Ok(ProgramOutcome::Failed {
                    code: ErrorCode::AlreadyRunning,
                    message: "a programming cycle is already running".to_string(),
                });
            }
            sessions.active = Some(ActiveSession {
                cancel: cancel.clone(),
                summary: summary_rx,
            });
            sessions.order = Some(request.order.clone());
        }

        self.checks.load(&request.units).await;

        // The cycle owns its own task so a client going away cannot stop it
        // halfway through.
        let reporter = ProgressReporter::new(updates, summary, self.events.clone(), cancel.clone());
        let session = ProgrammingSession::new(request, cancel, reporter);
        let pipeline = self.pipeline.clone();
        let checks = self.checks.clone();
        let sessions = self.sessions.clone();
        let cycle = tokio::spawn(async move {
            let outcome = pipeline.run(session).await;
            checks.cancel_pending().await;
            sessions.lock().await.active = None;
            outcome
        });

        while let Some(update) = progress.recv().await {
            handle_progress(update);
        }

        cycle.await.context("programming cycle panicked")
    }

    async fn cancel(&self) -> Result {
        let sessions = self.sessions.lock().await;
        match &sessions.active {
            Some(active) if !active.cancel.is_cancelled() => {
                info!("cancelling programming cycle");
                self.events.publish(StationEvent::ProgrammerCancelled);
                active.cancel.cancel();
            }
            Some(_) => debug!("programming cycle is already cancelling"),
            None => debug!("no programming cycle to cancel"),
        }
        Ok(())
    }

    async fn scan(&self, raw: String, scanner: String) -> Result<ScanOutcome> {
        let order = self.sessions.lock().await.order.clone();
        let Some(order) = order else {
            let reason = CheckError::NoPendingUnits.reason().to_string();
            self.events.publish(StationEvent::CheckFailed {
                reason: reason.clone(),
            });
            return Ok(ScanOutcome::Rejected { reason });
        };

        match self.checks.check(&order, &raw, &scanner).await {
            Ok(ticket) => Ok(ticket.resolution().await.into()),
            Err(e) => Ok(ScanOutcome::Rejected {
                reason: e.reason().to_string(),
            }),
        }
    }

    async fn status(&self) -> Result<StationStatus> {
        let session = self.sessions.lock().await.active.as_ref().map(|active| {
            let mut summary = active.summary.borrow().clone();
            summary.cancelled |= active.cancel.is_cancelled();
            summary
        });
        let (units, waiting_for_units) = self.checks.units().await;

        Ok(StationStatus {
            session,
            units,
            waiting_for_units,
        })
    }

    async fn shutdown(&self) -> Result {
        info!("shutdown requested");
        if let Some(active) = &self.sessions.lock().await.active {
            active.cancel.cancel();
        }
        self.checks.reset().await;
        self.shutdown.cancel();
        Ok(())
    }
}
