use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use super::domain::AuctionId;

const RETAINED_FAULTS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A deadline could not be scheduled, so the auction was never opened.
    ScheduleFailed,
    /// A fired deadline could not be handed to the engine.
    DeliveryFailed,
    /// The sweeper found an auction well past its deadline that the timer never closed.
    MissedDeadline,
    /// A closed auction could not be reflected on its application.
    ReconcileFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthFault {
    pub kind: FaultKind,
    pub auction_id: Option<AuctionId>,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub faults: Vec<HealthFault>,
}

impl HealthReport {
    pub fn is_degraded(&self) -> bool {
        !self.faults.is_empty()
    }
}

/// Operator channel for faults that threaten an auction's timeliness guarantee.
#[derive(Debug, Default)]
pub struct EngineHealth {
    faults: Mutex<VecDeque<HealthFault>>,
}

impl EngineHealth {
    pub fn record(
        &self,
        kind: FaultKind,
        auction_id: Option<AuctionId>,
        detail: impl Into<String>,
    ) {
        let fault = HealthFault {
            kind,
            auction_id,
            detail: detail.into(),
            recorded_at: Utc::now(),
        };
        error!(
            kind = ?fault.kind,
            auction_id = ?fault.auction_id,
            detail = %fault.detail,
            "procurement engine fault"
        );

        let mut guard = self.faults.lock().expect("health mutex poisoned");
        if guard.len() == RETAINED_FAULTS {
            guard.pop_front();
        }
        guard.push_back(fault);
    }

    pub fn faults(&self) -> Vec<HealthFault> {
        self.faults
            .lock()
            .expect("health mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Drop acknowledged faults once an operator has handled them.
    pub fn clear(&self) {
        self.faults.lock().expect("health mutex poisoned").clear();
    }

    pub fn report(&self) -> HealthReport {
        let faults = self.faults();
        HealthReport {
            status: if faults.is_empty() { "ok" } else { "degraded" },
            faults,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_turns_degraded_after_a_fault() {
        let health = EngineHealth::default();
        assert_eq!(health.report().status, "ok");

        health.record(FaultKind::ScheduleFailed, None, "timer offline");
        let report = health.report();
        assert_eq!(report.status, "degraded");
        assert_eq!(report.faults[0].kind, FaultKind::ScheduleFailed);

        health.clear();
        assert!(!health.report().is_degraded());
    }

    #[test]
    fn retains_only_recent_faults() {
        let health = EngineHealth::default();
        for index in 0..(RETAINED_FAULTS + 5) {
            health.record(FaultKind::MissedDeadline, None, format!("fault {index}"));
        }
        let faults = health.faults();
        assert_eq!(faults.len(), RETAINED_FAULTS);
        assert_eq!(faults[0].detail, "fault 5");
    }
}
