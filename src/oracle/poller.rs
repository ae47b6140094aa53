//! Draw availability poller.
//!
//! Waits for a specific draw to be published, checking at a fixed interval.
//! The whole wait, including any in-flight provider call, is bounded by a hard
//! ceiling that configuration keeps below the supervisor's grace period. The
//! loop is a small state machine on tokio timers and can be woken early through
//! a [`PollWaker`].

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::PollingConfig;
use crate::error::IngestError;
use crate::oracle::data_sources::DrawSource;
use crate::oracle::schedule::{Clock, DrawSchedule};
use crate::oracle::types::{PollResultKind, PollingSummary};
use crate::types::DrawRecord;

/// How a poll ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Found(DrawRecord),
    TimedOut,
    /// The provider answered with a record that fails validation.
    Rejected { reason: String },
    /// The draw cannot have been published yet; nothing was polled.
    NotYetDue { available_at: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct PollReport {
    pub outcome: PollOutcome,
    pub expected: NaiveDate,
    pub attempts: u32,
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PollReport {
    pub fn kind(&self) -> PollResultKind {
        match self.outcome {
            PollOutcome::Found(_) => PollResultKind::Found,
            PollOutcome::TimedOut => PollResultKind::TimedOut,
            PollOutcome::Rejected { .. } => PollResultKind::Rejected,
            PollOutcome::NotYetDue { .. } => PollResultKind::NotYetDue,
        }
    }

    /// Summary persisted with the run.
    pub fn summary(&self) -> PollingSummary {
        PollingSummary {
            enabled: true,
            result: self.kind(),
            expected_date: Some(self.expected),
            attempts: self.attempts,
            elapsed_seconds: self.elapsed.as_secs_f64(),
            started_at: self.started_at,
            completed_at: Some(self.completed_at),
        }
    }
}

/// Handle that makes a waiting poller check again immediately.
#[derive(Debug, Clone, Default)]
pub struct PollWaker(Arc<Notify>);

impl PollWaker {
    pub fn wake(&self) {
        self.0.notify_one();
    }
}

enum PollState {
    Checking,
    Waiting { until: Instant },
    Finished(PollOutcome),
}

pub struct Poller {
    source: Arc<dyn DrawSource>,
    schedule: DrawSchedule,
    clock: Arc<dyn Clock>,
    interval: Duration,
    ceiling: Duration,
    waker: PollWaker,
}

impl Poller {
    pub fn new(
        source: Arc<dyn DrawSource>,
        schedule: DrawSchedule,
        clock: Arc<dyn Clock>,
        interval: Duration,
        ceiling: Duration,
    ) -> Self {
        Self {
            source,
            schedule,
            clock,
            interval,
            ceiling,
            waker: PollWaker::default(),
        }
    }

    pub fn from_config(
        config: &PollingConfig,
        source: Arc<dyn DrawSource>,
        schedule: DrawSchedule,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            source,
            schedule,
            clock,
            Duration::from_secs(config.interval_seconds),
            Duration::from_secs(config.timeout_seconds),
        )
    }

    pub fn waker(&self) -> PollWaker {
        self.waker.clone()
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Wait for the draw on `expected`. Never returns later than the ceiling.
    #[instrument(skip(self))]
    pub async fn poll(&self, expected: NaiveDate) -> PollReport {
        let started_at = self.clock.now();

        if !self.schedule.is_available(expected, started_at) {
            let available_at = self.schedule.available_at(expected);
            info!("Draw {} not yet due (available at {}), skipping poll", expected, available_at);
            return PollReport {
                outcome: PollOutcome::NotYetDue { available_at },
                expected,
                attempts: 0,
                elapsed: Duration::ZERO,
                started_at,
                completed_at: started_at,
            };
        }

        let start = Instant::now();
        let deadline = start + self.ceiling;
        let mut attempts = 0u32;
        let mut state = PollState::Checking;

        let outcome = loop {
            state = match state {
                PollState::Checking => {
                    attempts += 1;
                    match timeout_at(deadline, self.source.fetch_by_date(expected)).await {
                        Ok(Ok(Some(draw))) => PollState::Finished(PollOutcome::Found(draw)),
                        Ok(Ok(None)) => {
                            debug!("Attempt {}: draw {} not published yet", attempts, expected);
                            PollState::Waiting { until: Instant::now() + self.interval }
                        }
                        Ok(Err(e @ (IngestError::Invalid(_) | IngestError::Malformed { .. }))) => {
                            warn!("Attempt {}: provider returned a bad record: {}", attempts, e);
                            PollState::Finished(PollOutcome::Rejected { reason: e.to_string() })
                        }
                        Ok(Err(e)) => {
                            warn!("Attempt {}: provider error while polling: {}", attempts, e);
                            PollState::Waiting { until: Instant::now() + self.interval }
                        }
                        Err(_) => PollState::Finished(PollOutcome::TimedOut),
                    }
                }
                PollState::Waiting { until } => {
                    tokio::select! {
                        _ = sleep_until(until.min(deadline)) => {}
                        _ = self.waker.0.notified() => debug!("Poller woken early"),
                    }
                    if Instant::now() >= deadline {
                        PollState::Finished(PollOutcome::TimedOut)
                    } else {
                        PollState::Checking
                    }
                }
                PollState::Finished(outcome) => break outcome,
            };
        };

        let elapsed = start.elapsed();
        let completed_at = started_at + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());

        match &outcome {
            PollOutcome::Found(_) => info!(
                "Draw {} found after {} attempts ({:.1}s)",
                expected,
                attempts,
                elapsed.as_secs_f64()
            ),
            PollOutcome::Rejected { reason } => warn!(
                "Draw {} rejected after {} attempts: {}",
                expected, attempts, reason
            ),
            _ => warn!(
                "Draw {} still missing after {} attempts ({:.1}s), giving up",
                expected,
                attempts,
                elapsed.as_secs_f64()
            ),
        }

        PollReport {
            outcome,
            expected,
            attempts,
            elapsed,
            started_at,
            completed_at,
        }
    }
}
