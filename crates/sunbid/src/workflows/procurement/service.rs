use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;

use super::bidding::{BidSubmission, BiddingEngine, SweepReport};
use super::clock::{Clock, DeadlineTimer};
use super::domain::{
    Actor, ActorId, Application, ApplicationId, ApplicationSubmission, Auction, AuctionId, Bid,
    BidId, PackageId, PaymentId, Role, TransitionEntry,
};
use super::error::ProcurementError;
use super::events::EventBus;
use super::health::{EngineHealth, HealthReport};
use super::installers::{
    InstallerPackage, InstallerProfile, InstallerRegistration, InstallerRegistry, PackageDraft,
    VerificationDecision,
};
use super::lifecycle::{LifecycleAction, LifecycleEngine, ReviewDecision};
use super::locks::EntityLocks;
use super::payments::{
    Authorization, Payment, PaymentLedger, PaymentOutcome, PaymentRequest, PaymentType,
};
use super::repository::{ApplicationRepository, Stores};

/// Collaborators that differ between production and tests.
pub struct EngineRuntime {
    pub clock: Arc<dyn Clock>,
    pub timer: Arc<dyn DeadlineTimer>,
    pub events: EventBus,
    pub health: Arc<EngineHealth>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub rescheduled: usize,
    pub sweep: SweepReport,
}

/// Entry point for every procurement operation exposed over HTTP or the CLI.
pub struct ProcurementService {
    lifecycle: Arc<LifecycleEngine>,
    bidding: BiddingEngine,
    ledger: PaymentLedger,
    registry: Arc<InstallerRegistry>,
    applications: Arc<dyn ApplicationRepository>,
    health: Arc<EngineHealth>,
}

impl ProcurementService {
    pub fn new(config: &EngineConfig, stores: Stores, runtime: EngineRuntime) -> Self {
        let EngineRuntime {
            clock,
            timer,
            events,
            health,
        } = runtime;
        let events = Arc::new(events);
        let locks = Arc::new(EntityLocks::<ApplicationId>::default());

        let lifecycle = Arc::new(LifecycleEngine::new(
            stores.applications.clone(),
            clock.clone(),
            events.clone(),
            locks.clone(),
            config.store_retry,
        ));
        let registry = Arc::new(InstallerRegistry::new(stores.installers.clone(), clock.clone()));
        let grace = config
            .sweep_interval
            .checked_mul(2)
            .and_then(|grace| Duration::from_std(grace).ok())
            .unwrap_or(Duration::minutes(1));
        let bidding = BiddingEngine::new(
            stores.auctions.clone(),
            lifecycle.clone(),
            registry.clone(),
            clock.clone(),
            timer,
            events.clone(),
            health.clone(),
            config.bid_window(),
            grace,
        );
        let ledger = PaymentLedger::new(
            stores.applications.clone(),
            stores.auctions.clone(),
            stores.payments.clone(),
            registry.clone(),
            locks,
            events,
            clock,
            config.authority_fee,
        );

        Self {
            lifecycle,
            bidding,
            ledger,
            registry,
            applications: stores.applications,
            health,
        }
    }

    pub async fn submit_application(
        &self,
        actor: &Actor,
        submission: ApplicationSubmission,
    ) -> Result<Application, ProcurementError> {
        self.lifecycle.submit(actor, submission).await
    }

    /// Customers see their own applications; staff and installers see any.
    pub fn application(
        &self,
        actor: &Actor,
        id: &ApplicationId,
    ) -> Result<Application, ProcurementError> {
        let application = self.lifecycle.get(id)?;
        if actor.role == Role::Customer && actor.id != application.owner {
            return Err(ProcurementError::Unauthorized(format!(
                "application {id} belongs to another customer"
            )));
        }
        Ok(application)
    }

    pub fn applications_for(&self, actor: &Actor) -> Result<Vec<Application>, ProcurementError> {
        let mut applications = self.lifecycle.for_owner(&actor.id)?;
        applications.sort_by_key(|application| application.created_at);
        Ok(applications)
    }

    pub fn review_queue(&self, actor: &Actor) -> Result<Vec<Application>, ProcurementError> {
        if actor.role != Role::Officer {
            return Err(ProcurementError::Unauthorized(
                "only officers can read the review queue".to_string(),
            ));
        }
        self.lifecycle.review_queue()
    }

    pub async fn begin_review(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        request_id: Option<&str>,
    ) -> Result<Application, ProcurementError> {
        self.lifecycle
            .transition(id, actor, LifecycleAction::BeginReview, request_id)
            .await
    }

    pub async fn schedule_site_visit(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        visit_at: DateTime<Utc>,
        request_id: Option<&str>,
    ) -> Result<Application, ProcurementError> {
        self.lifecycle
            .transition(
                id,
                actor,
                LifecycleAction::ScheduleSiteVisit { visit_at },
                request_id,
            )
            .await
    }

    pub async fn decide(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        decision: ReviewDecision,
        notes: Option<String>,
        request_id: Option<&str>,
    ) -> Result<Application, ProcurementError> {
        self.lifecycle
            .transition(id, actor, LifecycleAction::Decide { decision, notes }, request_id)
            .await
    }

    /// Buy a fixed package instead of running an auction.
    pub async fn select_package(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        package_id: &PackageId,
        request_id: Option<&str>,
    ) -> Result<Application, ProcurementError> {
        let package = self.registry.purchasable(package_id)?;
        let action = LifecycleAction::SelectPackage {
            package_id: package.id,
            installer_id: package.installer_id,
            price: package.price,
        };
        self.lifecycle.transition(id, actor, action, request_id).await
    }

    pub async fn confirm_installed(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        request_id: Option<&str>,
    ) -> Result<Application, ProcurementError> {
        self.lifecycle
            .transition(id, actor, LifecycleAction::ConfirmInstalled, request_id)
            .await
    }

    pub fn audit_trail(
        &self,
        actor: &Actor,
        id: &ApplicationId,
    ) -> Result<Vec<TransitionEntry>, ProcurementError> {
        Ok(self.application(actor, id)?.history)
    }

    /// Every application, for exports. Officer only.
    pub fn all_applications(&self, actor: &Actor) -> Result<Vec<Application>, ProcurementError> {
        if !matches!(actor.role, Role::Officer | Role::System) {
            return Err(ProcurementError::Unauthorized(
                "only officers can export the audit log".to_string(),
            ));
        }
        let mut applications = self.applications.all()?;
        applications.sort_by_key(|application| application.created_at);
        Ok(applications)
    }

    pub async fn open_auction(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        window: Option<Duration>,
        request_id: Option<&str>,
    ) -> Result<Auction, ProcurementError> {
        self.bidding.open_auction(actor, id, window, request_id).await
    }

    pub async fn submit_bid(
        &self,
        actor: &Actor,
        auction_id: &AuctionId,
        submission: BidSubmission,
    ) -> Result<Bid, ProcurementError> {
        self.bidding.submit_bid(actor, auction_id, submission).await
    }

    pub async fn close_bidding(
        &self,
        actor: &Actor,
        auction_id: &AuctionId,
    ) -> Result<Auction, ProcurementError> {
        self.bidding.close_bidding(actor, auction_id).await
    }

    pub async fn accept_bid(
        &self,
        actor: &Actor,
        auction_id: &AuctionId,
        bid_id: &BidId,
    ) -> Result<Auction, ProcurementError> {
        self.bidding.accept_bid(actor, auction_id, bid_id).await
    }

    /// Timer callback entry point.
    pub async fn on_deadline(&self, auction_id: &AuctionId) -> Result<bool, ProcurementError> {
        self.bidding.on_deadline(auction_id).await
    }

    pub fn auction(&self, auction_id: &AuctionId) -> Result<Auction, ProcurementError> {
        self.bidding.auction(auction_id)
    }

    /// Latest round for the application, visible to its owner, staff, and installers.
    pub fn auction_for(
        &self,
        actor: &Actor,
        id: &ApplicationId,
    ) -> Result<Auction, ProcurementError> {
        self.application(actor, id)?;
        self.bidding.auction_for(id)
    }

    pub fn authorize_payment(&self, id: &ApplicationId, payment_type: PaymentType) -> Authorization {
        self.ledger.gate().authorize(id, payment_type)
    }

    /// Gate decision for a caller. Customers may only query their own applications;
    /// missing or unreadable records still get the gate's fail-closed answer.
    pub fn authorize_payment_as(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        payment_type: PaymentType,
    ) -> Result<Authorization, ProcurementError> {
        match self.application(actor, id) {
            Err(err @ ProcurementError::Unauthorized(_)) => Err(err),
            _ => Ok(self.authorize_payment(id, payment_type)),
        }
    }

    pub async fn create_payment(
        &self,
        actor: &Actor,
        id: &ApplicationId,
        request: PaymentRequest,
    ) -> Result<Payment, ProcurementError> {
        self.ledger.create(actor, id, request).await
    }

    pub async fn record_payment_outcome(
        &self,
        actor: &Actor,
        payment_id: &PaymentId,
        outcome: PaymentOutcome,
    ) -> Result<Payment, ProcurementError> {
        self.ledger.record_outcome(actor, payment_id, outcome).await
    }

    pub fn payments_for(
        &self,
        actor: &Actor,
        customer: &ActorId,
    ) -> Result<Vec<Payment>, ProcurementError> {
        self.ledger.list_for_customer(actor, customer)
    }

    pub async fn register_installer(
        &self,
        actor: &Actor,
        registration: InstallerRegistration,
    ) -> Result<InstallerProfile, ProcurementError> {
        self.registry.register(actor, registration).await
    }

    pub async fn verify_installer(
        &self,
        actor: &Actor,
        installer_id: &ActorId,
        decision: VerificationDecision,
    ) -> Result<InstallerProfile, ProcurementError> {
        self.registry.verify(actor, installer_id, decision).await
    }

    pub async fn publish_package(
        &self,
        actor: &Actor,
        draft: PackageDraft,
    ) -> Result<InstallerPackage, ProcurementError> {
        self.registry.publish_package(actor, draft).await
    }

    pub async fn set_package_active(
        &self,
        actor: &Actor,
        package_id: &PackageId,
        active: bool,
    ) -> Result<InstallerPackage, ProcurementError> {
        self.registry.set_package_active(actor, package_id, active).await
    }

    pub fn packages(&self) -> Result<Vec<InstallerPackage>, ProcurementError> {
        self.registry.list_packages()
    }

    pub async fn sweep(&self) -> Result<SweepReport, ProcurementError> {
        self.bidding.sweep().await
    }

    /// Startup recovery: re-arm deadlines of live rounds, then settle anything overdue or lagging.
    pub async fn recover(&self) -> Result<RecoveryReport, ProcurementError> {
        let rescheduled = self.bidding.reschedule_open()?;
        let sweep = self.bidding.sweep().await?;
        info!(
            rescheduled,
            expired = sweep.expired.len(),
            reconciled = sweep.reconciled.len(),
            "procurement recovery finished"
        );
        Ok(RecoveryReport { rescheduled, sweep })
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    /// Consume fired deadlines until the timer side closes.
    pub async fn run_deadline_worker(self: Arc<Self>, mut fired: mpsc::UnboundedReceiver<AuctionId>) {
        while let Some(auction_id) = fired.recv().await {
            match self.on_deadline(&auction_id).await {
                Ok(true) => info!(%auction_id, "auction expired at deadline"),
                Ok(false) => {}
                Err(err) => {
                    error!(%auction_id, error = %err, "deadline callback failed; sweeper will retry")
                }
            }
        }
        warn!("deadline worker stopped");
    }

    /// Periodic expiry and reconciliation pass.
    pub async fn run_sweeper(self: Arc<Self>, every: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "sweep failed");
                    }
                }
            }
        }
        info!("sweeper stopped");
    }
}
