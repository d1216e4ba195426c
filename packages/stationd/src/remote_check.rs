//! Serialized verification of scanned units against the remote service.
//!
//! At most one remote check is in flight at any time, and a new one is
//! refused within a short cooldown after the previous one started so a
//! scanner firing twice does not issue duplicate calls. Each attempt
//! carries an id; a resolution whose id is no longer the pending one is
//! dropped, so a stale reply can never touch a later batch.

use std::{sync::Arc, time::Duration};

use snafu::Snafu;
use stationd_interface::{OrderContext, ScanOutcome, Unit, UnitStatus};
use tokio::{
    select,
    sync::{Mutex, oneshot},
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    events::{EventBus, StationEvent},
    remote::RemoteService,
};

/// No checking unit matched the identifier the remote service returned.
pub const INVALID_HID_LAMP: &str = "INVALID_HID_LAMP";
pub const TIMEOUT: &str = "TIMEOUT";

#[derive(Debug, Clone, Copy)]
pub struct CheckOptions {
    /// Minimum time between the start of two checks.
    pub cooldown: Duration,
    /// How long a single remote call may take.
    pub timeout: Duration,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum CheckError {
    #[snafu(display("a check is in flight or the previous one started too recently"))]
    Locked,
    #[snafu(display("no unit is waiting to be checked"))]
    NoPendingUnits,
}

impl CheckError {
    pub fn reason(&self) -> &'static str {
        match self {
            CheckError::Locked => "LOCKED",
            CheckError::NoPendingUnits => "NO_PENDING_UNITS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResolution {
    Checked { unit: usize },
    Failed { reason: String },
    /// The attempt was abandoned before the remote service answered.
    Cancelled,
}

impl From<CheckResolution> for ScanOutcome {
    fn from(value: CheckResolution) -> Self {
        match value {
            CheckResolution::Checked { unit } => ScanOutcome::Checked { unit },
            CheckResolution::Failed { reason } => ScanOutcome::Failed { reason },
            CheckResolution::Cancelled => ScanOutcome::Failed {
                reason: "CANCELLED".to_string(),
            },
        }
    }
}

/// Resolves once the accepted check is settled.
#[derive(Debug)]
pub struct CheckTicket(oneshot::Receiver<CheckResolution>);

impl CheckTicket {
    fn resolved(resolution: CheckResolution) -> Self {
        let (tx, rx) = oneshot::channel();
        _ = tx.send(resolution);
        Self(rx)
    }

    pub async fn resolution(self) -> CheckResolution {
        self.0.await.unwrap_or(CheckResolution::Cancelled)
    }
}

struct PendingCheck {
    attempt: u64,
    cancel: CancellationToken,
    reply: oneshot::Sender<CheckResolution>,
}

#[derive(Default)]
struct State {
    units: Vec<Unit>,
    waiting: bool,
    pending: Option<PendingCheck>,
    last_start: Option<Instant>,
    next_attempt: u64,
}

impl State {
    fn all_checked(&self) -> bool {
        self.units.iter().all(|u| u.status == UnitStatus::Checked)
    }
}

struct Inner<R> {
    remote: Arc<R>,
    events: EventBus,
    options: CheckOptions,
    state: Mutex<State>,
}

pub struct RemoteCheckCoordinator<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for RemoteCheckCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: RemoteService> RemoteCheckCoordinator<R> {
    pub fn new(remote: Arc<R>, events: EventBus, options: CheckOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                events,
                options,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Starts a new batch with one waiting unit per identifier.
    pub async fn load(&self, identifiers: &[String]) {
        let mut state = self.inner.state.lock().await;
        Self::abandon(&mut state);

        state.units = identifiers.iter().map(Unit::new).collect();
        state.waiting = !state.units.is_empty();
        state.last_start = None;
        info!(units = state.units.len(), "loaded units to check");
        self.publish_units(&state);
    }

    /// Drops the batch and any pending check.
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        Self::abandon(&mut state);
        state.units.clear();
        state.waiting = false;
        self.publish_units(&state);
    }

    /// Abandons the in-flight check, if any. Units it was checking go back
    /// to waiting. Calling it with nothing pending is a no-op.
    pub async fn cancel_pending(&self) {
        let mut state = self.inner.state.lock().await;
        if Self::abandon(&mut state) {
            self.publish_units(&state);
        }
    }

    pub async fn units(&self) -> (Vec<Unit>, bool) {
        let state = self.inner.state.lock().await;
        (state.units.clone(), state.waiting)
    }

    /// Checks `raw_scan` against the remote service.
    ///
    /// Rejections publish a `CheckFailed` event and leave every unit as it
    /// was. An accepted check returns a ticket that settles once the remote
    /// call resolves, times out or is abandoned.
    pub async fn check(
        &self,
        order: &OrderContext,
        raw_scan: &str,
        scanner: &str,
    ) -> Result<CheckTicket, CheckError> {
        let mut state = self.inner.state.lock().await;

        let result = self.try_check(&mut state, order, raw_scan, scanner);
        if let Err(e) = &result {
            debug!(%scanner, reason = e.reason(), "scan rejected");
            self.inner.events.publish(StationEvent::CheckFailed {
                reason: e.reason().to_string(),
            });
        }
        result
    }

    fn try_check(
        &self,
        state: &mut State,
        order: &OrderContext,
        raw_scan: &str,
        scanner: &str,
    ) -> Result<CheckTicket, CheckError> {
        if state.all_checked() {
            return Err(CheckError::NoPendingUnits);
        }
        if state.pending.is_some() {
            return Err(CheckError::Locked);
        }
        let now = Instant::now();
        if let Some(last_start) = state.last_start
            && now.duration_since(last_start) < self.inner.options.cooldown
        {
            return Err(CheckError::Locked);
        }
        state.last_start = Some(now);

        if let Some(unit) = Self::confirm_sibling(state, raw_scan, scanner) {
            info!(unit, "unit confirmed by a repeated scan");
            self.publish_units(state);
            self.complete_if_done(state);
            return Ok(CheckTicket::resolved(CheckResolution::Checked { unit }));
        }

        for unit in state.units.iter_mut() {
            if matches!(unit.status, UnitStatus::Waiting | UnitStatus::Failed { .. }) {
                unit.status = UnitStatus::Checking;
                unit.scan = Some(raw_scan.to_string());
                unit.scanner = Some(scanner.to_string());
            }
        }

        let attempt = state.next_attempt;
        state.next_attempt += 1;
        let cancel = CancellationToken::new();
        let (reply, ticket) = oneshot::channel();
        state.pending = Some(PendingCheck {
            attempt,
            cancel: cancel.clone(),
            reply,
        });
        info!(attempt, %scanner, "checking scan against the remote service");
        self.publish_units(state);

        let this = self.clone();
        let order = order.clone();
        let scan = raw_scan.to_string();
        tokio::spawn(async move {
            let remote = this.inner.remote.clone();
            let result = select! {
                _ = cancel.cancelled() => return,
                result = timeout(this.inner.options.timeout, remote.verify_scan(&order, &scan)) => {
                    match result {
                        Ok(Ok(identifier)) => Ok(identifier),
                        Ok(Err(e)) => Err(e.code),
                        Err(_) => Err(TIMEOUT.to_string()),
                    }
                }
            };
            this.resolve(attempt, result).await;
        });

        Ok(CheckTicket(ticket))
    }

    /// A scan that already confirmed a unit confirms the next unchecked
    /// unit with the same identifier, without asking the remote service.
    fn confirm_sibling(state: &mut State, raw_scan: &str, scanner: &str) -> Option<usize> {
        let identifier = state
            .units
            .iter()
            .find(|u| u.status == UnitStatus::Checked && u.scan.as_deref() == Some(raw_scan))?
            .identifier
            .clone();

        let (index, sibling) = state
            .units
            .iter_mut()
            .enumerate()
            .find(|(_, u)| u.status != UnitStatus::Checked && u.identifier == identifier)?;
        sibling.status = UnitStatus::Checked;
        sibling.scan = Some(raw_scan.to_string());
        sibling.scanner = Some(scanner.to_string());
        Some(index)
    }

    async fn resolve(&self, attempt: u64, result: Result<String, String>) {
        let mut state = self.inner.state.lock().await;
        let Some(pending) = state.pending.take_if(|p| p.attempt == attempt) else {
            debug!(attempt, "dropping the result of an abandoned check");
            return;
        };
        pending.cancel.cancel();

        let resolution = match result {
            Ok(identifier) => Self::apply_match(&mut state, &identifier),
            Err(reason) => Self::apply_failure(&mut state, reason),
        };

        self.publish_units(&state);
        match &resolution {
            CheckResolution::Failed { reason } => {
                warn!(attempt, %reason, "check failed");
                self.inner.events.publish(StationEvent::CheckFailed {
                    reason: reason.clone(),
                });
            }
            CheckResolution::Checked { unit } => {
                info!(attempt, unit, "unit checked");
                self.complete_if_done(&mut state);
            }
            CheckResolution::Cancelled => {}
        }

        _ = pending.reply.send(resolution);
    }

    /// Only the first checking unit with a matching identifier is confirmed;
    /// the others go back to waiting.
    fn apply_match(state: &mut State, identifier: &str) -> CheckResolution {
        let matched = state
            .units
            .iter()
            .position(|u| u.status == UnitStatus::Checking && u.identifier == identifier);

        let Some(matched) = matched else {
            for unit in state.units.iter_mut() {
                if unit.status == UnitStatus::Checking {
                    unit.status = UnitStatus::Failed {
                        reason: INVALID_HID_LAMP.to_string(),
                    };
                }
            }
            return CheckResolution::Failed {
                reason: INVALID_HID_LAMP.to_string(),
            };
        };

        for (index, unit) in state.units.iter_mut().enumerate() {
            if unit.status != UnitStatus::Checking {
                continue;
            }
            if index == matched {
                unit.status = UnitStatus::Checked;
            } else {
                revert(unit);
            }
        }
        CheckResolution::Checked { unit: matched }
    }

    /// Only the first checking unit carries the failure; the others go back
    /// to waiting.
    fn apply_failure(state: &mut State, reason: String) -> CheckResolution {
        let mut first = true;
        for unit in state.units.iter_mut() {
            if unit.status != UnitStatus::Checking {
                continue;
            }
            if first {
                unit.status = UnitStatus::Failed {
                    reason: reason.clone(),
                };
                first = false;
            } else {
                revert(unit);
            }
        }
        CheckResolution::Failed { reason }
    }

    fn complete_if_done(&self, state: &mut State) {
        if state.waiting && state.all_checked() {
            state.waiting = false;
            info!("all units checked");
            self.inner.events.publish(StationEvent::UnitsChecked {
                units: state.units.clone(),
            });
        }
    }

    /// Returns whether a check was pending.
    fn abandon(state: &mut State) -> bool {
        let Some(pending) = state.pending.take() else {
            return false;
        };
        debug!(attempt = pending.attempt, "abandoning pending check");
        pending.cancel.cancel();
        for unit in state.units.iter_mut() {
            if unit.status == UnitStatus::Checking {
                revert(unit);
            }
        }
        _ = pending.reply.send(CheckResolution::Cancelled);
        true
    }

    fn publish_units(&self, state: &State) {
        self.inner.events.publish(StationEvent::UnitsUpdated {
            units: state.units.clone(),
        });
    }
}

fn revert(unit: &mut Unit) {
    unit.status = UnitStatus::Waiting;
    unit.scan = None;
    unit.scanner = None;
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast;

    use super::*;
    use crate::testing::{FakeRemote, order};

    fn coordinator(remote: FakeRemote) -> (RemoteCheckCoordinator<FakeRemote>, EventBus) {
        let events = EventBus::default();
        let coordinator =
            RemoteCheckCoordinator::new(Arc::new(remote), events.clone(), CheckOptions::default());
        (coordinator, events)
    }

    fn statuses(units: &[Unit]) -> Vec<UnitStatus> {
        units.iter().map(|u| u.status.clone()).collect()
    }

    fn failed(reason: &str) -> UnitStatus {
        UnitStatus::Failed {
            reason: reason.to_string(),
        }
    }

    fn drain(events: &mut broadcast::Receiver<StationEvent>) -> Vec<StationEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn check_failures(events: &[StationEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StationEvent::CheckFailed { reason } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_checks_are_serialized() {
        let (coordinator, events) = coordinator(FakeRemote::matching("A"));
        coordinator.load(&["A".to_string(), "B".to_string()]).await;
        let mut events = events.subscribe();

        let first = coordinator.check(&order(), "SCAN-1", "scanner-1").await;
        let second = coordinator.check(&order(), "SCAN-1", "scanner-1").await;
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err(), CheckError::Locked);

        assert_eq!(
            first.unwrap().resolution().await,
            CheckResolution::Checked { unit: 0 }
        );
        assert_eq!(check_failures(&drain(&mut events)), vec!["LOCKED"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_applies_after_resolution() {
        let (coordinator, _events) = coordinator(FakeRemote::matching("A"));
        coordinator.load(&["A".to_string(), "A".to_string()]).await;

        let ticket = coordinator.check(&order(), "SCAN-1", "s").await.unwrap();
        ticket.resolution().await;
        assert_eq!(
            coordinator.check(&order(), "SCAN-2", "s").await.unwrap_err(),
            CheckError::Locked
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(coordinator.check(&order(), "SCAN-2", "s").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn single_unit_confirmed_per_check() {
        let (coordinator, _events) = coordinator(FakeRemote::matching("B"));
        coordinator
            .load(&["A".to_string(), "B".to_string(), "C".to_string()])
            .await;

        let ticket = coordinator.check(&order(), "SCAN-B", "s").await.unwrap();
        let (units, _) = coordinator.units().await;
        assert_eq!(statuses(&units), vec![UnitStatus::Checking; 3]);

        assert_eq!(ticket.resolution().await, CheckResolution::Checked { unit: 1 });
        let (units, waiting) = coordinator.units().await;
        assert_eq!(
            statuses(&units),
            vec![UnitStatus::Waiting, UnitStatus::Checked, UnitStatus::Waiting]
        );
        assert_eq!(units[1].scan.as_deref(), Some("SCAN-B"));
        assert_eq!(units[0].scan, None);
        assert!(waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_identifier_fails_every_checking_unit() {
        let (coordinator, _events) = coordinator(FakeRemote::matching("Z"));
        coordinator.load(&["A".to_string(), "B".to_string()]).await;

        let ticket = coordinator.check(&order(), "SCAN", "s").await.unwrap();
        assert_eq!(
            ticket.resolution().await,
            CheckResolution::Failed {
                reason: INVALID_HID_LAMP.to_string()
            }
        );
        let (units, _) = coordinator.units().await;
        assert_eq!(
            statuses(&units),
            vec![failed(INVALID_HID_LAMP), failed(INVALID_HID_LAMP)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_only_the_first_unit() {
        let (coordinator, events) = coordinator(FakeRemote::silent());
        coordinator.load(&["A".to_string(), "B".to_string()]).await;
        let mut events = events.subscribe();

        let ticket = coordinator.check(&order(), "SCAN", "s").await.unwrap();
        assert_eq!(
            ticket.resolution().await,
            CheckResolution::Failed {
                reason: TIMEOUT.to_string()
            }
        );

        let (units, _) = coordinator.units().await;
        assert_eq!(statuses(&units), vec![failed(TIMEOUT), UnitStatus::Waiting]);
        assert_eq!(check_failures(&drain(&mut events)), vec![TIMEOUT]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_reason_is_surfaced() {
        let (coordinator, _events) = coordinator(FakeRemote::failing("UNKNOWN_LAMP"));
        coordinator.load(&["A".to_string()]).await;

        let ticket = coordinator.check(&order(), "SCAN", "s").await.unwrap();
        assert_eq!(
            ticket.resolution().await,
            CheckResolution::Failed {
                reason: "UNKNOWN_LAMP".to_string()
            }
        );

        // A failed unit is retried by the next scan.
        tokio::time::sleep(Duration::from_secs(1)).await;
        coordinator.check(&order(), "SCAN", "s").await.unwrap();
        let (units, _) = coordinator.units().await;
        assert_eq!(statuses(&units), vec![UnitStatus::Checking]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_scan_confirms_sibling_without_remote_call() {
        let remote = FakeRemote::matching("A");
        let calls = remote.calls();
        let (coordinator, events) = coordinator(remote);
        coordinator
            .load(&["A".to_string(), "A".to_string(), "B".to_string()])
            .await;

        let ticket = coordinator.check(&order(), "SCAN-A", "s").await.unwrap();
        assert_eq!(ticket.resolution().await, CheckResolution::Checked { unit: 0 });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut events = events.subscribe();
        let ticket = coordinator.check(&order(), "SCAN-A", "s").await.unwrap();
        assert_eq!(ticket.resolution().await, CheckResolution::Checked { unit: 1 });
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let (units, waiting) = coordinator.units().await;
        assert_eq!(
            statuses(&units),
            vec![UnitStatus::Checked, UnitStatus::Checked, UnitStatus::Waiting]
        );
        assert!(waiting);
        assert!(
            drain(&mut events)
                .iter()
                .all(|e| matches!(e, StationEvent::UnitsUpdated { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_completion_is_published_once() {
        let (coordinator, events) = coordinator(FakeRemote::matching("A"));
        coordinator.load(&["A".to_string()]).await;
        let mut events = events.subscribe();

        let ticket = coordinator.check(&order(), "SCAN-A", "s").await.unwrap();
        ticket.resolution().await;

        let (_, waiting) = coordinator.units().await;
        assert!(!waiting);
        let completed = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, StationEvent::UnitsChecked { .. }))
            .count();
        assert_eq!(completed, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            coordinator.check(&order(), "SCAN-A", "s").await.unwrap_err(),
            CheckError::NoPendingUnits
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_check_never_touches_the_next_batch() {
        let (coordinator, _events) = coordinator(FakeRemote::delayed("A", Duration::from_secs(2)));
        coordinator.load(&["A".to_string()]).await;

        let ticket = coordinator.check(&order(), "SCAN-A", "s").await.unwrap();
        coordinator.cancel_pending().await;
        coordinator.cancel_pending().await;
        assert_eq!(ticket.resolution().await, CheckResolution::Cancelled);

        coordinator.load(&["A".to_string()]).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        let (units, waiting) = coordinator.units().await;
        assert_eq!(statuses(&units), vec![UnitStatus::Waiting]);
        assert!(waiting);
    }
}
