use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::domain::{ActorId, Amount, ApplicationId, ApplicationStatus, AuctionId, PaymentId};
use super::payments::{PaymentStatus, PaymentType};

/// Event emitted after a committed write, in commit order per application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcurementEvent {
    pub sequence: u64,
    pub application_id: ApplicationId,
    pub customer: ActorId,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ApplicationSubmitted,
    StatusChanged {
        from: ApplicationStatus,
        to: ApplicationStatus,
        action: String,
    },
    AuctionOpened {
        auction_id: AuctionId,
        deadline: DateTime<Utc>,
    },
    BidReceived {
        auction_id: AuctionId,
        installer_id: ActorId,
        amount: Amount,
    },
    BiddingClosed {
        auction_id: AuctionId,
    },
    AuctionAccepted {
        auction_id: AuctionId,
        installer_id: ActorId,
        amount: Amount,
        /// Installers whose bids lost.
        outbid: Vec<ActorId>,
    },
    AuctionExpired {
        auction_id: AuctionId,
        bidders: Vec<ActorId>,
    },
    PaymentCreated {
        payment_id: PaymentId,
        payment_type: PaymentType,
        amount: Amount,
    },
    PaymentSettled {
        payment_id: PaymentId,
        payment_type: PaymentType,
        status: PaymentStatus,
    },
}

impl EventKind {
    pub const fn label(&self) -> &'static str {
        match self {
            EventKind::ApplicationSubmitted => "application_submitted",
            EventKind::StatusChanged { .. } => "status_changed",
            EventKind::AuctionOpened { .. } => "auction_opened",
            EventKind::BidReceived { .. } => "bid_received",
            EventKind::BiddingClosed { .. } => "bidding_closed",
            EventKind::AuctionAccepted { .. } => "auction_accepted",
            EventKind::AuctionExpired { .. } => "auction_expired",
            EventKind::PaymentCreated { .. } => "payment_created",
            EventKind::PaymentSettled { .. } => "payment_settled",
        }
    }
}

/// Outbound delivery collaborator (e-mail, SMS, in-app inbox).
pub trait NotificationHook: Send + Sync {
    fn emit(&self, event: &ProcurementEvent) -> Result<(), HookError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Hook that only records events in the service log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

impl NotificationHook for LoggingHook {
    fn emit(&self, event: &ProcurementEvent) -> Result<(), HookError> {
        info!(
            sequence = event.sequence,
            application_id = %event.application_id,
            kind = event.kind.label(),
            "procurement event"
        );
        Ok(())
    }
}

/// Fans one event out to several hooks; a failing hook does not starve the rest.
#[derive(Default, Clone)]
pub struct HookChain {
    hooks: Vec<Arc<dyn NotificationHook>>,
}

impl HookChain {
    pub fn with(mut self, hook: Arc<dyn NotificationHook>) -> Self {
        self.hooks.push(hook);
        self
    }
}

impl NotificationHook for HookChain {
    fn emit(&self, event: &ProcurementEvent) -> Result<(), HookError> {
        let failures: Vec<String> = self
            .hooks
            .iter()
            .filter_map(|hook| hook.emit(event).err())
            .map(|err| err.to_string())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(HookError::Delivery(failures.join("; ")))
        }
    }
}

/// Producer side of the event queue. Publishing never blocks and never fails the caller.
#[derive(Debug)]
pub struct EventBus {
    sequence: AtomicU64,
    sender: mpsc::UnboundedSender<ProcurementEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, EventOutbox) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sequence: AtomicU64::new(1),
                sender,
            },
            EventOutbox { receiver },
        )
    }

    /// Callers publish while holding the entity lock so per-application order matches commit order.
    pub(crate) fn publish(
        &self,
        application_id: ApplicationId,
        customer: &ActorId,
        occurred_at: DateTime<Utc>,
        kind: EventKind,
    ) {
        let event = ProcurementEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            application_id,
            customer: customer.clone(),
            occurred_at,
            kind,
        };
        if let Err(err) = self.sender.send(event) {
            debug!(kind = err.0.kind.label(), "event dropped; no dispatcher attached");
        }
    }
}

/// Consumer side of the event queue.
#[derive(Debug)]
pub struct EventOutbox {
    receiver: mpsc::UnboundedReceiver<ProcurementEvent>,
}

impl EventOutbox {
    /// Deliver events to the hook until every producer is dropped.
    pub async fn dispatch(mut self, hook: Arc<dyn NotificationHook>) {
        while let Some(event) = self.receiver.recv().await {
            deliver(hook.as_ref(), &event);
        }
    }

    /// Take whatever is queued right now without waiting.
    pub fn drain(&mut self) -> Vec<ProcurementEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Synchronously deliver whatever is queued; used by the CLI demo.
    pub fn flush_to(&mut self, hook: &dyn NotificationHook) -> usize {
        let events = self.drain();
        for event in &events {
            deliver(hook, event);
        }
        events.len()
    }
}

fn deliver(hook: &dyn NotificationHook, event: &ProcurementEvent) {
    if let Err(err) = hook.emit(event) {
        warn!(
            sequence = event.sequence,
            application_id = %event.application_id,
            kind = event.kind.label(),
            error = %err,
            "notification hook failed; continuing"
        );
    }
}
