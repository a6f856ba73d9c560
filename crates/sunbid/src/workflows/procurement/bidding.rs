//! Auction rounds: bid intake, deadline enforcement, and winner acceptance.
//!
//! Acceptance and expiry race on the same auction. Both run under the auction's lock and
//! commit through a versioned compare-and-set, so exactly one of them moves a round out of a
//! live state. The bidding engine never writes application state directly; it calls back into
//! the lifecycle engine with an idempotency key derived from the auction outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::MAX_BID_WINDOW_HOURS;

use super::clock::{Clock, DeadlineHandle, DeadlineTimer};
use super::domain::{
    Actor, Amount, Application, ApplicationId, Auction, AuctionId, AuctionState, Bid, BidId,
    Role,
};
use super::error::ProcurementError;
use super::events::{EventBus, EventKind};
use super::health::{EngineHealth, FaultKind};
use super::installers::InstallerRegistry;
use super::lifecycle::{self, LifecycleAction, LifecycleEngine, Plan};
use super::locks::EntityLocks;
use super::repository::AuctionRepository;

/// Installer proposal as received from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidSubmission {
    pub amount: Decimal,
    pub timeline_days: u32,
    #[serde(default)]
    pub message: String,
}

/// Work performed by one sweeper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: Vec<AuctionId>,
    pub reconciled: Vec<AuctionId>,
    pub failures: usize,
}

pub struct BiddingEngine {
    auctions: Arc<dyn AuctionRepository>,
    lifecycle: Arc<LifecycleEngine>,
    registry: Arc<InstallerRegistry>,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn DeadlineTimer>,
    events: Arc<EventBus>,
    health: Arc<EngineHealth>,
    locks: EntityLocks<AuctionId>,
    deadlines: Mutex<HashMap<AuctionId, DeadlineHandle>>,
    default_window: Duration,
    missed_deadline_grace: Duration,
}

impl BiddingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auctions: Arc<dyn AuctionRepository>,
        lifecycle: Arc<LifecycleEngine>,
        registry: Arc<InstallerRegistry>,
        clock: Arc<dyn Clock>,
        timer: Arc<dyn DeadlineTimer>,
        events: Arc<EventBus>,
        health: Arc<EngineHealth>,
        default_window: Duration,
        missed_deadline_grace: Duration,
    ) -> Self {
        Self {
            auctions,
            lifecycle,
            registry,
            clock,
            timer,
            events,
            health,
            locks: EntityLocks::default(),
            deadlines: Mutex::new(HashMap::new()),
            default_window,
            missed_deadline_grace,
        }
    }

    /// Open a new round for an approved application and schedule its deadline.
    ///
    /// Nothing is left behind on failure: the timer is cancelled and the unborn auction is
    /// discarded if the lifecycle transition does not commit.
    pub async fn open_auction(
        &self,
        actor: &Actor,
        application_id: &ApplicationId,
        window: Option<Duration>,
        request_id: Option<&str>,
    ) -> Result<Auction, ProcurementError> {
        let _application_guard = self.lifecycle.locks().lock(application_id).await;
        let application = self.lifecycle.get(application_id)?;

        let auction_id = AuctionId::generate();
        let now = self.clock.now();
        let action = LifecycleAction::OpenAuction { auction_id };
        let next = match lifecycle::plan(&application, actor, &action, request_id, now)? {
            Plan::Replay(entry) => {
                return match entry.action {
                    LifecycleAction::OpenAuction { auction_id } => self.auction(&auction_id),
                    other => Err(ProcurementError::Conflict(format!(
                        "request id was used for {}",
                        other.label()
                    ))),
                };
            }
            Plan::Commit(next) => next,
        };

        let window = window.unwrap_or(self.default_window);
        if window <= Duration::zero() {
            return Err(ProcurementError::InvalidInput(
                "bid window must be positive".to_string(),
            ));
        }
        if window > Duration::hours(i64::from(MAX_BID_WINDOW_HOURS)) {
            return Err(ProcurementError::InvalidInput(format!(
                "bid window may not exceed {MAX_BID_WINDOW_HOURS} hours"
            )));
        }
        let deadline = now.checked_add_signed(window).ok_or_else(|| {
            ProcurementError::InvalidInput(format!(
                "bid window of {} hours is out of range",
                window.num_hours()
            ))
        })?;

        // Fresh id, so this never waits; taken before the timer can fire for it.
        let _auction_guard = self.locks.lock(&auction_id).await;

        let handle = match self.timer.schedule(auction_id, deadline) {
            Ok(handle) => handle,
            Err(err) => {
                self.health.record(
                    FaultKind::ScheduleFailed,
                    Some(auction_id),
                    format!("could not schedule deadline for application {application_id}: {err}"),
                );
                return Err(err.into());
            }
        };

        let auction = Auction::open(auction_id, &application, now, deadline);
        if let Err(err) = self.auctions.insert(auction.clone()) {
            handle.cancel();
            return Err(err.into());
        }
        if let Err(err) = self.lifecycle.commit(&application, next).await {
            handle.cancel();
            if let Err(discard) = self.auctions.discard(&auction_id) {
                warn!(%auction_id, error = %discard, "failed to discard uncommitted auction");
            }
            return Err(err);
        }

        self.track_deadline(handle);
        info!(%auction_id, %application_id, %deadline, "auction opened");
        self.events.publish(
            auction.application_id,
            &auction.customer,
            now,
            EventKind::AuctionOpened {
                auction_id,
                deadline,
            },
        );
        Ok(auction)
    }

    /// Add or replace the installer's bid while the round is open and before its deadline.
    pub async fn submit_bid(
        &self,
        actor: &Actor,
        auction_id: &AuctionId,
        submission: BidSubmission,
    ) -> Result<Bid, ProcurementError> {
        self.registry.ensure_verified(actor)?;
        let amount = Amount::new(submission.amount)?;
        if submission.timeline_days == 0 {
            return Err(ProcurementError::InvalidInput(
                "timeline_days must be greater than zero".to_string(),
            ));
        }

        let _guard = self.locks.lock(auction_id).await;
        let mut auction = self.auction(auction_id)?;
        let now = self.clock.now();
        if auction.state != AuctionState::Open {
            return Err(ProcurementError::AuctionClosed(format!(
                "auction {auction_id} is {}",
                auction.state.label()
            )));
        }
        if auction.deadline_passed(now) {
            return Err(self.expire_late(auction).await);
        }

        let bid = Bid {
            id: BidId::generate(),
            auction_id: *auction_id,
            installer_id: actor.id.clone(),
            amount,
            timeline_days: submission.timeline_days,
            message: submission.message.trim().to_string(),
            submitted_at: now,
        };
        let expected = auction.version;
        let replaced = auction.bids.insert(actor.id.clone(), bid.clone());
        auction.version += 1;
        self.auctions.update(auction.clone(), expected)?;

        info!(
            %auction_id,
            installer_id = %actor.id,
            amount = %bid.amount,
            replaced = replaced.is_some(),
            "bid recorded"
        );
        self.events.publish(
            auction.application_id,
            &auction.customer,
            now,
            EventKind::BidReceived {
                auction_id: *auction_id,
                installer_id: actor.id.clone(),
                amount,
            },
        );
        Ok(bid)
    }

    /// Stop accepting bids so the customer can decide. The deadline still applies.
    pub async fn close_bidding(
        &self,
        actor: &Actor,
        auction_id: &AuctionId,
    ) -> Result<Auction, ProcurementError> {
        let _guard = self.locks.lock(auction_id).await;
        let auction = self.auction(auction_id)?;
        if !actor.is(Role::Customer, &auction.customer) {
            return Err(ProcurementError::Unauthorized(
                "only the application owner can close bidding".to_string(),
            ));
        }
        if auction.state != AuctionState::Open {
            return Err(ProcurementError::AuctionClosed(format!(
                "auction {auction_id} is {}",
                auction.state.label()
            )));
        }
        let now = self.clock.now();
        if auction.deadline_passed(now) {
            return Err(self.expire_late(auction).await);
        }
        if auction.bids.is_empty() {
            return Err(ProcurementError::InvalidInput(
                "there are no bids to decide on".to_string(),
            ));
        }

        let mut next = auction.clone();
        next.state = AuctionState::AwaitingDecision;
        next.version += 1;
        self.auctions.update(next.clone(), auction.version)?;

        info!(%auction_id, bids = next.bids.len(), "bidding closed for decision");
        self.events.publish(
            next.application_id,
            &next.customer,
            now,
            EventKind::BiddingClosed {
                auction_id: *auction_id,
            },
        );
        Ok(next)
    }

    /// Customer accepts one bid. Wins against expiry only if it observes a live round first.
    pub async fn accept_bid(
        &self,
        actor: &Actor,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<Auction, ProcurementError> {
        let _guard = self.locks.lock(auction_id).await;
        let auction = self.auction(auction_id)?;
        if !actor.is(Role::Customer, &auction.customer) {
            return Err(ProcurementError::Unauthorized(
                "only the application owner can accept a bid".to_string(),
            ));
        }
        if !auction.state.is_live() {
            return Err(ProcurementError::AuctionClosed(format!(
                "auction {auction_id} is {}",
                auction.state.label()
            )));
        }
        let now = self.clock.now();
        if auction.deadline_passed(now) {
            return Err(self.expire_late(auction).await);
        }
        let bid = auction
            .bid(bid_id)
            .cloned()
            .ok_or_else(|| ProcurementError::not_found(format!("bid {bid_id}")))?;

        let mut next = auction.clone();
        next.state = AuctionState::ClosedAccepted;
        next.accepted_bid = Some(bid.id);
        next.closed_at = Some(now);
        next.version += 1;
        self.auctions.update(next.clone(), auction.version)?;
        self.cancel_deadline(auction_id);

        info!(
            %auction_id,
            bid_id = %bid.id,
            installer_id = %bid.installer_id,
            amount = %bid.amount,
            "bid accepted"
        );

        let _application_guard = self.lifecycle.locks().lock(&next.application_id).await;
        if let Err(err) = self.advance_application(&next).await {
            warn!(%auction_id, error = %err, "application will be advanced by the sweeper");
        }
        let outbid = next
            .bids
            .keys()
            .filter(|installer| **installer != bid.installer_id)
            .cloned()
            .collect();
        self.events.publish(
            next.application_id,
            &next.customer,
            now,
            EventKind::AuctionAccepted {
                auction_id: *auction_id,
                installer_id: bid.installer_id.clone(),
                amount: bid.amount,
                outbid,
            },
        );
        Ok(next)
    }

    /// Deadline callback. Trusts the timer; a no-op once the round has closed.
    pub async fn on_deadline(&self, auction_id: &AuctionId) -> Result<bool, ProcurementError> {
        let _guard = self.locks.lock(auction_id).await;
        let Some(auction) = self.auctions.fetch(auction_id)? else {
            warn!(%auction_id, "deadline fired for unknown auction");
            return Ok(false);
        };
        if !auction.state.is_live() {
            debug!(%auction_id, state = auction.state.label(), "deadline fired after close");
            return Ok(false);
        }
        self.expire_locked(auction).await?;
        Ok(true)
    }

    pub fn auction(&self, auction_id: &AuctionId) -> Result<Auction, ProcurementError> {
        self.auctions
            .fetch(auction_id)?
            .ok_or_else(|| ProcurementError::not_found(format!("auction {auction_id}")))
    }

    /// Latest round for an application.
    pub fn auction_for(&self, application_id: &ApplicationId) -> Result<Auction, ProcurementError> {
        self.auctions
            .latest_for_application(application_id)?
            .ok_or_else(|| {
                ProcurementError::not_found(format!("auction for application {application_id}"))
            })
    }

    /// Expire overdue rounds and push closed outcomes onto lagging applications.
    pub async fn sweep(&self) -> Result<SweepReport, ProcurementError> {
        let mut report = SweepReport::default();
        for auction in self.auctions.all()? {
            let now = self.clock.now();
            if auction.state.is_live() {
                if !auction.deadline_passed(now) {
                    continue;
                }
                if now - auction.deadline > self.missed_deadline_grace {
                    self.health.record(
                        FaultKind::MissedDeadline,
                        Some(auction.id),
                        format!("auction expired by sweeper {} after its deadline", now - auction.deadline),
                    );
                }
                match self.expire_if_live(&auction.id).await {
                    Ok(true) => report.expired.push(auction.id),
                    Ok(false) => {}
                    Err(err) => {
                        error!(auction_id = %auction.id, error = %err, "sweeper could not expire auction");
                        report.failures += 1;
                    }
                }
            } else {
                match self.reconcile(&auction.id).await {
                    Ok(true) => report.reconciled.push(auction.id),
                    Ok(false) => {}
                    Err(err) => {
                        error!(auction_id = %auction.id, error = %err, "sweeper could not reconcile auction");
                        report.failures += 1;
                    }
                }
            }
        }

        if !report.expired.is_empty() || !report.reconciled.is_empty() {
            info!(
                expired = report.expired.len(),
                reconciled = report.reconciled.len(),
                "sweep completed"
            );
        }
        Ok(report)
    }

    /// Reschedule deadlines for live rounds after a restart.
    pub fn reschedule_open(&self) -> Result<usize, ProcurementError> {
        let now = self.clock.now();
        let mut scheduled = 0;
        for auction in self.auctions.all()? {
            if !auction.state.is_live() || auction.deadline_passed(now) {
                continue;
            }
            match self.timer.schedule(auction.id, auction.deadline) {
                Ok(handle) => {
                    self.track_deadline(handle);
                    scheduled += 1;
                }
                Err(err) => self.health.record(
                    FaultKind::ScheduleFailed,
                    Some(auction.id),
                    format!("could not reschedule deadline on recovery: {err}"),
                ),
            }
        }
        Ok(scheduled)
    }

    async fn expire_if_live(&self, auction_id: &AuctionId) -> Result<bool, ProcurementError> {
        let _guard = self.locks.lock(auction_id).await;
        let auction = self.auction(auction_id)?;
        if !auction.state.is_live() || !auction.deadline_passed(self.clock.now()) {
            return Ok(false);
        }
        self.expire_locked(auction).await?;
        Ok(true)
    }

    async fn reconcile(&self, auction_id: &AuctionId) -> Result<bool, ProcurementError> {
        let _guard = self.locks.lock(auction_id).await;
        let auction = self.auction(auction_id)?;
        let _application_guard = self.lifecycle.locks().lock(&auction.application_id).await;
        let application = self.lifecycle.get(&auction.application_id)?;
        if !lags_behind(&application, &auction) {
            return Ok(false);
        }
        info!(%auction_id, application_id = %application.id, "reconciling closed auction");
        self.advance_application(&auction).await?;
        Ok(true)
    }

    /// Lazy expiry for callers that observed a passed deadline; always yields `AuctionClosed`.
    async fn expire_late(&self, auction: Auction) -> ProcurementError {
        let auction_id = auction.id;
        let deadline = auction.deadline;
        if let Err(err) = self.expire_locked(auction).await {
            warn!(%auction_id, error = %err, "lazy expiry failed; sweeper will retry");
        }
        ProcurementError::AuctionClosed(format!("auction {auction_id} closed at {deadline}"))
    }

    /// Caller must hold the auction lock and have observed a live state.
    async fn expire_locked(&self, auction: Auction) -> Result<Auction, ProcurementError> {
        let now = self.clock.now();
        let mut next = auction.clone();
        next.state = AuctionState::ClosedExpired;
        next.closed_at = Some(now);
        next.version += 1;
        self.auctions.update(next.clone(), auction.version)?;
        self.cancel_deadline(&auction.id);
        info!(auction_id = %auction.id, bids = next.bids.len(), "auction expired without acceptance");

        let _application_guard = self.lifecycle.locks().lock(&next.application_id).await;
        if let Err(err) = self.advance_application(&next).await {
            warn!(auction_id = %next.id, error = %err, "application will be advanced by the sweeper");
        }
        self.events.publish(
            next.application_id,
            &next.customer,
            now,
            EventKind::AuctionExpired {
                auction_id: next.id,
                bidders: next.bids.keys().cloned().collect(),
            },
        );
        Ok(next)
    }

    /// Report a closed round to the lifecycle engine. Caller must hold the application lock.
    async fn advance_application(&self, auction: &Auction) -> Result<(), ProcurementError> {
        let (action, outcome) = match auction.state {
            AuctionState::ClosedAccepted => {
                let bid = auction.accepted().ok_or_else(|| {
                    ProcurementError::Conflict(format!(
                        "auction {} is accepted without a bid",
                        auction.id
                    ))
                })?;
                (
                    LifecycleAction::AuctionAccepted {
                        auction_id: auction.id,
                        bid_id: bid.id,
                        installer_id: bid.installer_id.clone(),
                        amount: bid.amount,
                    },
                    "accepted",
                )
            }
            AuctionState::ClosedExpired => (
                LifecycleAction::AuctionExpired {
                    auction_id: auction.id,
                },
                "expired",
            ),
            AuctionState::Open | AuctionState::AwaitingDecision => return Ok(()),
        };

        let request_id = format!("auction:{}:{outcome}", auction.id);
        match self
            .lifecycle
            .transition_locked(&auction.application_id, &Actor::system(), action, Some(&request_id))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                self.health.record(
                    FaultKind::ReconcileFailed,
                    Some(auction.id),
                    format!("application {} not advanced: {err}", auction.application_id),
                );
                Err(err)
            }
        }
    }

    fn track_deadline(&self, handle: DeadlineHandle) {
        self.deadlines
            .lock()
            .expect("deadline table poisoned")
            .insert(handle.auction_id, handle);
    }

    fn cancel_deadline(&self, auction_id: &AuctionId) {
        let handle = self
            .deadlines
            .lock()
            .expect("deadline table poisoned")
            .remove(auction_id);
        if let Some(handle) = handle {
            handle.cancel();
            debug!(%auction_id, "deadline callback cancelled");
        }
    }
}

/// A closed round whose outcome has not reached the application yet.
fn lags_behind(application: &Application, auction: &Auction) -> bool {
    !auction.state.is_live() && application.active_auction == Some(auction.id)
}
