//! Station-wide event bus.

use stationd_interface::{ProgramOutcome, ProgramProgress, Unit};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    /// An operator asked the running cycle to stop.
    ProgrammerCancelled,
    ProgressChanged(ProgramProgress),
    /// Any unit changed status.
    UnitsUpdated { units: Vec<Unit> },
    /// A scan was rejected or an attempt confirmed nothing.
    CheckFailed { reason: String },
    /// Every unit of the batch is checked.
    UnitsChecked { units: Vec<Unit> },
    ProgrammerFinished { outcome: ProgramOutcome },
}

impl StationEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            StationEvent::ProgrammerCancelled => "programmer.cancelled",
            StationEvent::ProgressChanged(_) => "programmer.progress",
            StationEvent::UnitsUpdated { .. } => "programmer.hidLampManager.updated",
            StationEvent::CheckFailed { .. } => "programmer.hidLampManager.checkFailed",
            StationEvent::UnitsChecked { .. } => "programmer.hidLampManager.checked",
            StationEvent::ProgrammerFinished { .. } => "programmer.finished",
        }
    }
}

/// Cloneable publisher/subscriber handle. Publishing never blocks and
/// never fails; events published with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: StationEvent) {
        trace!(topic = event.topic(), ?event, "publishing event");
        _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.sender.subscribe()
    }

    /// Logs every event until the bus is dropped.
    pub async fn log_events(mut events: broadcast::Receiver<StationEvent>) {
        loop {
            match events.recv().await {
                Ok(StationEvent::ProgressChanged(progress)) => {
                    debug!(percent = progress.percent, phase = %progress.phase, "progress");
                }
                Ok(StationEvent::CheckFailed { reason }) => {
                    warn!(%reason, "unit check failed");
                }
                Ok(event) => info!(topic = event.topic(), "{event:?}"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
