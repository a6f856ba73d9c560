use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{ActorId, ApplicationId};
use super::events::{EventKind, HookError, NotificationHook, ProcurementEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
}

/// In-app message derived from a procurement event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: ActorId,
    pub application_id: ApplicationId,
    /// Sequence of the event that produced this message.
    pub sequence: u64,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub at: DateTime<Utc>,
    pub read: bool,
}

/// Messages kept per recipient before the oldest are dropped.
pub const INBOX_LIMIT: usize = 200;

/// Per-user inbox fed by the event dispatcher. Each recipient keeps at most `limit` messages.
#[derive(Debug)]
pub struct NotificationInbox {
    entries: Mutex<HashMap<ActorId, Vec<Notification>>>,
    limit: usize,
}

impl Default for NotificationInbox {
    fn default() -> Self {
        Self::with_limit(INBOX_LIMIT)
    }
}

impl NotificationInbox {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    pub fn for_recipient(&self, recipient: &ActorId) -> Vec<Notification> {
        let entries = self.entries.lock().expect("inbox mutex poisoned");
        entries.get(recipient).cloned().unwrap_or_default()
    }

    pub fn unread_count(&self, recipient: &ActorId) -> usize {
        let entries = self.entries.lock().expect("inbox mutex poisoned");
        entries
            .get(recipient)
            .map(|items| items.iter().filter(|item| !item.read).count())
            .unwrap_or(0)
    }

    /// Marks everything up to `sequence` as read. Returns how many messages changed.
    pub fn mark_read(&self, recipient: &ActorId, sequence: u64) -> usize {
        let mut entries = self.entries.lock().expect("inbox mutex poisoned");
        let Some(items) = entries.get_mut(recipient) else {
            return 0;
        };
        let mut changed = 0;
        for item in items.iter_mut().filter(|item| item.sequence <= sequence && !item.read) {
            item.read = true;
            changed += 1;
        }
        changed
    }

    fn push(&self, notifications: Vec<Notification>) {
        let mut entries = self.entries.lock().expect("inbox mutex poisoned");
        for notification in notifications {
            let items = entries.entry(notification.recipient.clone()).or_default();
            items.push(notification);
            if items.len() > self.limit {
                let overflow = items.len() - self.limit;
                items.drain(..overflow);
            }
        }
    }
}

impl NotificationHook for NotificationInbox {
    fn emit(&self, event: &ProcurementEvent) -> Result<(), HookError> {
        self.push(render(event));
        Ok(())
    }
}

fn render(event: &ProcurementEvent) -> Vec<Notification> {
    let note = |recipient: &ActorId, title: &str, message: String, kind: NotificationKind| {
        Notification {
            recipient: recipient.clone(),
            application_id: event.application_id,
            sequence: event.sequence,
            title: title.to_string(),
            message,
            kind,
            at: event.occurred_at,
            read: false,
        }
    };
    let customer = &event.customer;

    match &event.kind {
        EventKind::ApplicationSubmitted => vec![note(
            customer,
            "Application received",
            format!("Application {} was submitted for review.", event.application_id),
            NotificationKind::Info,
        )],
        EventKind::StatusChanged { to, .. } => vec![note(
            customer,
            "Application status updated",
            format!("Your application is now {}.", to.label()),
            NotificationKind::Info,
        )],
        EventKind::AuctionOpened { deadline, .. } => vec![note(
            customer,
            "Bidding open",
            format!("Installers can bid until {}.", deadline.format("%Y-%m-%d %H:%M UTC")),
            NotificationKind::Info,
        )],
        EventKind::BidReceived { amount, .. } => vec![note(
            customer,
            "New bid",
            format!("A verified installer offered {amount}."),
            NotificationKind::Info,
        )],
        EventKind::BiddingClosed { .. } => vec![note(
            customer,
            "Bidding closed",
            "Review the bids and pick an installer before the deadline.".to_string(),
            NotificationKind::Warning,
        )],
        EventKind::AuctionAccepted {
            installer_id,
            amount,
            outbid,
            ..
        } => {
            let mut notes = vec![
                note(
                    customer,
                    "Installer selected",
                    format!("You accepted a bid of {amount}."),
                    NotificationKind::Success,
                ),
                note(
                    installer_id,
                    "Bid accepted",
                    format!("Your bid of {amount} was accepted."),
                    NotificationKind::Success,
                ),
            ];
            notes.extend(outbid.iter().map(|installer| {
                note(
                    installer,
                    "Bid not selected",
                    "The customer selected another installer.".to_string(),
                    NotificationKind::Info,
                )
            }));
            notes
        }
        EventKind::AuctionExpired { bidders, .. } => {
            let mut notes = vec![note(
                customer,
                "Bidding expired",
                "No bid was accepted before the deadline. You can reopen bidding or pick a package."
                    .to_string(),
                NotificationKind::Warning,
            )];
            notes.extend(bidders.iter().map(|installer| {
                note(
                    installer,
                    "Auction expired",
                    "The auction closed without a selection.".to_string(),
                    NotificationKind::Info,
                )
            }));
            notes
        }
        EventKind::PaymentCreated {
            payment_type, amount, ..
        } => vec![note(
            customer,
            "Payment pending",
            format!("A {} payment of {amount} is awaiting settlement.", payment_type.label()),
            NotificationKind::Info,
        )],
        EventKind::PaymentSettled {
            payment_type,
            status,
            ..
        } => vec![note(
            customer,
            "Payment update",
            format!("Your {} payment is {status:?}.", payment_type.label()),
            NotificationKind::Info,
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::procurement::domain::{Amount, AuctionId};
    use rust_decimal_macros::dec;

    fn event(sequence: u64, kind: EventKind) -> ProcurementEvent {
        ProcurementEvent {
            sequence,
            application_id: ApplicationId::generate(),
            customer: ActorId::from("cust-1"),
            occurred_at: Utc::now(),
            kind,
        }
    }

    #[test]
    fn acceptance_reaches_winner_and_losers() {
        let inbox = NotificationInbox::default();
        let accepted = event(
            7,
            EventKind::AuctionAccepted {
                auction_id: AuctionId::generate(),
                installer_id: ActorId::from("inst-b"),
                amount: Amount::new(dec!(655000)).expect("positive"),
                outbid: vec![ActorId::from("inst-a")],
            },
        );
        inbox.emit(&accepted).expect("inbox never fails");

        assert_eq!(inbox.for_recipient(&ActorId::from("cust-1")).len(), 1);
        let winner = inbox.for_recipient(&ActorId::from("inst-b"));
        assert_eq!(winner[0].title, "Bid accepted");
        let loser = inbox.for_recipient(&ActorId::from("inst-a"));
        assert_eq!(loser[0].title, "Bid not selected");
    }

    #[test]
    fn mark_read_only_touches_older_messages() {
        let inbox = NotificationInbox::default();
        inbox
            .emit(&event(1, EventKind::ApplicationSubmitted))
            .expect("inbox never fails");
        inbox
            .emit(&event(2, EventKind::ApplicationSubmitted))
            .expect("inbox never fails");

        let customer = ActorId::from("cust-1");
        assert_eq!(inbox.mark_read(&customer, 1), 1);
        assert_eq!(inbox.unread_count(&customer), 1);
        assert_eq!(inbox.mark_read(&ActorId::from("nobody"), 5), 0);
    }

    #[test]
    fn oldest_messages_are_dropped_past_the_limit() {
        let inbox = NotificationInbox::with_limit(3);
        for sequence in 1..=5 {
            inbox
                .emit(&event(sequence, EventKind::ApplicationSubmitted))
                .expect("inbox never fails");
        }

        let kept: Vec<u64> = inbox
            .for_recipient(&ActorId::from("cust-1"))
            .iter()
            .map(|note| note.sequence)
            .collect();
        assert_eq!(kept, vec![3, 4, 5]);
    }
}
