//! Time source and deadline scheduling for auction expiry.
//!
//! The engine never reads the wall clock directly. Tests and the demo drive time through
//! [`ManualClock`] and fire deadlines explicitly through [`ManualTimer`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::domain::AuctionId;
use super::health::{EngineHealth, FaultKind};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut guard = self.now.lock().expect("clock mutex poisoned");
        *guard += by;
        *guard
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("clock mutex poisoned") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("deadline timer unavailable: {0}")]
    Unavailable(String),
}

/// Cancellation handle for a scheduled deadline callback.
#[derive(Debug, Clone)]
pub struct DeadlineHandle {
    pub auction_id: AuctionId,
    pub deadline: DateTime<Utc>,
    token: CancellationToken,
}

impl DeadlineHandle {
    pub fn new(auction_id: AuctionId, deadline: DateTime<Utc>) -> Self {
        Self {
            auction_id,
            deadline,
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Schedules one callback per auction at its deadline.
pub trait DeadlineTimer: Send + Sync {
    fn schedule(
        &self,
        auction_id: AuctionId,
        deadline: DateTime<Utc>,
    ) -> Result<DeadlineHandle, TimerError>;
}

/// Timer backed by tokio sleeps. Fired auction ids are delivered on the returned channel.
pub struct TokioDeadlineTimer {
    clock: Arc<dyn Clock>,
    fired: mpsc::UnboundedSender<AuctionId>,
    health: Arc<EngineHealth>,
}

impl TokioDeadlineTimer {
    pub fn new(
        clock: Arc<dyn Clock>,
        health: Arc<EngineHealth>,
    ) -> (Self, mpsc::UnboundedReceiver<AuctionId>) {
        let (fired, receiver) = mpsc::unbounded_channel();
        (
            Self {
                clock,
                fired,
                health,
            },
            receiver,
        )
    }
}

impl DeadlineTimer for TokioDeadlineTimer {
    fn schedule(
        &self,
        auction_id: AuctionId,
        deadline: DateTime<Utc>,
    ) -> Result<DeadlineHandle, TimerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| TimerError::Unavailable(err.to_string()))?;
        if self.fired.is_closed() {
            return Err(TimerError::Unavailable(
                "deadline worker is not running".to_string(),
            ));
        }

        let delay = (deadline - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let handle = DeadlineHandle::new(auction_id, deadline);
        let token = handle.token();
        let fired = self.fired.clone();
        let health = self.health.clone();

        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(%auction_id, "deadline cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if fired.send(auction_id).is_err() {
                        health.record(
                            FaultKind::DeliveryFailed,
                            Some(auction_id),
                            "deadline fired after the worker stopped",
                        );
                    }
                }
            }
        });

        Ok(handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledDeadline {
    pub auction_id: AuctionId,
    pub deadline: DateTime<Utc>,
    pub cancelled: bool,
    pub fired: bool,
}

#[derive(Debug, Default)]
struct ManualTimerState {
    entries: Vec<(DeadlineHandle, bool)>,
    fail_next: Option<String>,
}

/// Timer that records schedules and fires only when asked.
#[derive(Debug, Default)]
pub struct ManualTimer {
    state: Mutex<ManualTimerState>,
}

impl ManualTimer {
    /// Make the next `schedule` call fail with the given reason.
    pub fn fail_next(&self, reason: impl Into<String>) {
        self.state.lock().expect("timer mutex poisoned").fail_next = Some(reason.into());
    }

    pub fn scheduled(&self) -> Vec<ScheduledDeadline> {
        self.state
            .lock()
            .expect("timer mutex poisoned")
            .entries
            .iter()
            .map(|(handle, fired)| ScheduledDeadline {
                auction_id: handle.auction_id,
                deadline: handle.deadline,
                cancelled: handle.is_cancelled(),
                fired: *fired,
            })
            .collect()
    }

    /// Mark and return every uncancelled deadline at or before `now`.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<AuctionId> {
        let mut guard = self.state.lock().expect("timer mutex poisoned");
        guard
            .entries
            .iter_mut()
            .filter(|(handle, fired)| !*fired && !handle.is_cancelled() && handle.deadline <= now)
            .map(|(handle, fired)| {
                *fired = true;
                handle.auction_id
            })
            .collect()
    }
}

impl DeadlineTimer for ManualTimer {
    fn schedule(
        &self,
        auction_id: AuctionId,
        deadline: DateTime<Utc>,
    ) -> Result<DeadlineHandle, TimerError> {
        let mut guard = self.state.lock().expect("timer mutex poisoned");
        if let Some(reason) = guard.fail_next.take() {
            return Err(TimerError::Unavailable(reason));
        }
        let handle = DeadlineHandle::new(auction_id, deadline);
        guard.entries.push((handle.clone(), false));
        Ok(handle)
    }
}
