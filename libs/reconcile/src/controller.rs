//! The reconciliation controller.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::DeviceState;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::launcher::{ControllerLauncher, LaunchError};
use crate::record::{ControllerRecord, RecordFilter, RecordKey};
use crate::{ReconcileError, DEFAULT_MAX_RETRIES, DEFAULT_RESPONSE_TIMEOUT};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,

    /// Delay between failed attempts.
    pub backoff: BackoffPolicy,

    /// How long to wait for a report after a successful dispatch before the
    /// attempt counts as failed.
    pub response_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// How the caller learns about completed records. Exactly one is active.
#[derive(Debug)]
pub enum CompletionMode {
    /// The caller polls [`ReconciliationController::get_completed_states`].
    Poll,

    /// A wake-up is sent `delay` after the first unseen completion; the
    /// caller then polls.
    Timer {
        delay: Duration,
        wake: mpsc::UnboundedSender<DateTime<Utc>>,
    },

    /// Each completed record is delivered individually.
    Channel(mpsc::UnboundedSender<ControllerRecord>),
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub attempted: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub timed_out: usize,
}

/// Drives remote controllers toward their requested states.
pub struct ReconciliationController {
    config: ControllerConfig,
    records: BTreeMap<RecordKey, ControllerRecord>,
    mode: CompletionMode,
    timer_due: Option<DateTime<Utc>>,
}

impl ReconciliationController {
    /// Create a controller delivering completions through `mode`.
    pub fn new(config: ControllerConfig, mode: CompletionMode) -> Self {
        Self {
            config,
            records: BTreeMap::new(),
            mode,
            timer_due: None,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Ask for `key` at `endpoint` to reach `state`.
    ///
    /// Creates the record on first request. A new request resets the retry
    /// budget and any previous outcome.
    pub fn request_state(
        &mut self,
        key: RecordKey,
        endpoint: impl Into<String>,
        state: DeviceState,
        now: DateTime<Utc>,
    ) {
        let endpoint = endpoint.into();
        match self.records.get_mut(&key) {
            Some(record) => {
                info!(controller = %key, from = %record.requested_state, to = %state, "Updating requested state");
                record.endpoint = endpoint;
                record.requested_state = state;
                record.requested_at = now;
                record.failed = false;
                record.retry_count = 0;
                record.next_retry_at = None;
                record.in_flight_until = None;
                record.completed_at = None;
                record.last_error = None;
                if record.is_converged() {
                    record.completed_at = Some(now);
                    let snapshot = record.clone();
                    self.deliver(snapshot, now);
                }
            }
            None => {
                info!(controller = %key, %endpoint, requested = %state, "Tracking new controller");
                self.records
                    .insert(key.clone(), ControllerRecord::new(key, endpoint, state, now));
            }
        }
    }

    /// Record a state reported by the remote controller.
    pub fn observe(
        &mut self,
        key: &RecordKey,
        state: DeviceState,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let record = self
            .records
            .get_mut(key)
            .ok_or_else(|| ReconcileError::NotFound(key.clone()))?;

        record.observed_state = Some(state);
        record.observed_at = Some(now);

        if record.is_converged() {
            record.in_flight_until = None;
            record.failed = false;
            record.next_retry_at = None;
            record.last_error = None;
            if record.completed_at.is_none() {
                record.completed_at = Some(now);
                debug!(controller = %key, %state, "Controller converged");
                let snapshot = record.clone();
                self.deliver(snapshot, now);
            }
        } else if record.completed_at.is_some() && !record.failed {
            // Drifted away after converging: reconcile again.
            record.completed_at = None;
        }
        Ok(())
    }

    /// The controller announced that it has finished for good.
    pub fn finished(&mut self, key: &RecordKey) -> Result<ControllerRecord, ReconcileError> {
        let record = self
            .records
            .remove(key)
            .ok_or_else(|| ReconcileError::NotFound(key.clone()))?;
        info!(controller = %key, "Controller finished");
        Ok(record)
    }

    /// Drop a record, typically one whose retries are exhausted.
    pub fn discard(&mut self, key: &RecordKey) -> Result<ControllerRecord, ReconcileError> {
        self.records
            .remove(key)
            .ok_or_else(|| ReconcileError::NotFound(key.clone()))
    }

    pub fn get(&self, key: &RecordKey) -> Option<&ControllerRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records still working toward their requested state.
    pub fn get_pending_requests(&self, filter: &RecordFilter) -> Vec<ControllerRecord> {
        self.records
            .values()
            .filter(|r| !r.is_completed() && filter.matches(r))
            .cloned()
            .collect()
    }

    /// Records that completed strictly after `since`.
    pub fn get_completed_states(&self, since: DateTime<Utc>) -> Vec<ControllerRecord> {
        self.records
            .values()
            .filter(|r| r.completed_at.is_some_and(|at| at > since))
            .cloned()
            .collect()
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.records
            .values()
            .filter(|r| !r.is_completed())
            .filter_map(|r| match (r.in_flight_until, r.next_retry_at) {
                (Some(until), _) => Some(until),
                (None, Some(retry)) => Some(retry),
                (None, None) => Some(r.requested_at),
            })
            .chain(self.timer_due)
            .min()
    }

    /// Run one reconciliation pass.
    pub async fn tick(
        &mut self,
        now: DateTime<Utc>,
        launcher: &dyn ControllerLauncher,
    ) -> TickSummary {
        let mut summary = TickSummary::default();

        let timed_out: Vec<RecordKey> = self
            .records
            .values()
            .filter(|r| !r.is_completed() && r.in_flight_until.is_some_and(|until| until <= now))
            .map(|r| r.key.clone())
            .collect();
        for key in timed_out {
            summary.timed_out += 1;
            if self.record_failure(&key, "no report before response timeout".into(), now) {
                summary.exhausted += 1;
            }
        }

        let due: Vec<RecordKey> = self
            .records
            .values()
            .filter(|r| {
                !r.is_completed()
                    && !r.is_converged()
                    && r.in_flight_until.is_none()
                    && r.next_retry_at.map_or(true, |at| at <= now)
            })
            .map(|r| r.key.clone())
            .collect();

        for key in due {
            let Some(record) = self.records.get(&key).cloned() else {
                continue;
            };
            summary.attempted += 1;

            let result = match record.observed_state {
                None => launcher.start(&record).await,
                Some(_) => launcher.request_state(&record, record.requested_state).await,
            };

            match result {
                Ok(()) => {
                    let timeout = chrono::Duration::from_std(self.config.response_timeout)
                        .unwrap_or(chrono::Duration::MAX);
                    if let Some(record) = self.records.get_mut(&key) {
                        record.failed = false;
                        record.next_retry_at = None;
                        record.in_flight_until = Some(now + timeout);
                    }
                    debug!(controller = %key, requested = %record.requested_state, "Dispatched reconcile attempt");
                }
                Err(err) => {
                    summary.failed += 1;
                    if self.record_failure(&key, error_text(&err), now) {
                        summary.exhausted += 1;
                    }
                }
            }
        }

        self.fire_timer(now);
        summary
    }

    /// Returns true if the failure exhausted the record's retries.
    fn record_failure(&mut self, key: &RecordKey, error: String, now: DateTime<Utc>) -> bool {
        let max_retries = self.config.max_retries;
        let Some(record) = self.records.get_mut(key) else {
            return false;
        };

        record.failed = true;
        record.in_flight_until = None;
        record.retry_count += 1;
        record.last_error = Some(error);

        if record.is_exhausted(max_retries) {
            warn!(
                controller = %key,
                retry_count = record.retry_count,
                error = record.last_error.as_deref().unwrap_or_default(),
                "Controller retries exhausted"
            );
            record.next_retry_at = None;
            record.completed_at = Some(now);
            let snapshot = record.clone();
            self.deliver(snapshot, now);
            return true;
        }

        let delay = self.config.backoff.delay_chrono(record.retry_count - 1);
        record.next_retry_at = Some(now + delay);
        debug!(
            controller = %key,
            retry_count = record.retry_count,
            next_retry_at = ?record.next_retry_at,
            "Scheduled controller retry"
        );
        false
    }

    fn deliver(&mut self, record: ControllerRecord, now: DateTime<Utc>) {
        match &self.mode {
            CompletionMode::Poll => {}
            CompletionMode::Timer { delay, .. } => {
                if self.timer_due.is_none() {
                    let delay = chrono::Duration::from_std(*delay).unwrap_or(chrono::Duration::MAX);
                    self.timer_due = Some(now + delay);
                }
            }
            CompletionMode::Channel(tx) => {
                if tx.send(record).is_err() {
                    debug!("Completion channel closed");
                }
            }
        }
    }

    fn fire_timer(&mut self, now: DateTime<Utc>) {
        let CompletionMode::Timer { wake, .. } = &self.mode else {
            return;
        };
        if self.timer_due.is_some_and(|due| due <= now) {
            self.timer_due = None;
            if wake.send(now).is_err() {
                debug!("Completion timer receiver closed");
            }
        }
    }
}

fn error_text(err: &LaunchError) -> String {
    err.to_string()
}
