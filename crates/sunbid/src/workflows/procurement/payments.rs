//! Payment gate and ledger. Money may only be requested when the lifecycle permits it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::clock::Clock;
use super::domain::{
    Actor, ActorId, Amount, Application, ApplicationId, ApplicationStatus, Auction,
    AuctionState, PackageId, PaymentId, Role,
};
use super::error::ProcurementError;
use super::events::{EventBus, EventKind};
use super::installers::InstallerRegistry;
use super::locks::EntityLocks;
use super::repository::{ApplicationRepository, AuctionRepository, PaymentRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    AuthorityFee,
    PackagePurchase,
    BidSettlement,
}

impl PaymentType {
    pub const ALL: [PaymentType; 3] = [
        PaymentType::AuthorityFee,
        PaymentType::PackagePurchase,
        PaymentType::BidSettlement,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            PaymentType::AuthorityFee => "authority_fee",
            PaymentType::PackagePurchase => "package_purchase",
            PaymentType::BidSettlement => "bid_settlement",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub application_id: ApplicationId,
    pub customer: ActorId,
    pub payment_type: PaymentType,
    pub amount: Amount,
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<PackageId>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationReason {
    Allowed,
    ApplicationNotFound,
    StatusNotEligible,
    NoAuction,
    AuctionNotAccepted,
    /// Current state could not be read; the gate fails closed.
    StateUnavailable,
}

impl AuthorizationReason {
    pub const fn label(self) -> &'static str {
        match self {
            AuthorizationReason::Allowed => "allowed",
            AuthorizationReason::ApplicationNotFound => "application_not_found",
            AuthorizationReason::StatusNotEligible => "status_not_eligible",
            AuthorizationReason::NoAuction => "no_auction",
            AuthorizationReason::AuctionNotAccepted => "auction_not_accepted",
            AuthorizationReason::StateUnavailable => "state_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authorization {
    pub application_id: ApplicationId,
    pub payment_type: PaymentType,
    pub allowed: bool,
    pub reason: AuthorizationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ApplicationStatus>,
}

impl Authorization {
    fn decide(
        application_id: ApplicationId,
        payment_type: PaymentType,
        status: Option<ApplicationStatus>,
        reason: AuthorizationReason,
    ) -> Self {
        Self {
            application_id,
            payment_type,
            allowed: reason == AuthorizationReason::Allowed,
            reason,
            status,
        }
    }
}

/// Eligibility rule for one (status, latest auction, payment type) combination.
pub fn eligibility(
    status: ApplicationStatus,
    latest_auction: Option<&Auction>,
    payment_type: PaymentType,
) -> AuthorizationReason {
    match payment_type {
        PaymentType::AuthorityFee | PaymentType::PackagePurchase => {
            if status == ApplicationStatus::Approved {
                AuthorizationReason::Allowed
            } else {
                AuthorizationReason::StatusNotEligible
            }
        }
        PaymentType::BidSettlement => match latest_auction {
            None => AuthorizationReason::NoAuction,
            Some(auction) if auction.state != AuctionState::ClosedAccepted => {
                AuthorizationReason::AuctionNotAccepted
            }
            Some(_)
                if matches!(
                    status,
                    ApplicationStatus::InstallerSelected | ApplicationStatus::Installed
                ) =>
            {
                AuthorizationReason::Allowed
            }
            Some(_) => AuthorizationReason::StatusNotEligible,
        },
    }
}

/// Read-only query deciding whether a payment may be created.
pub struct PaymentGate {
    applications: Arc<dyn ApplicationRepository>,
    auctions: Arc<dyn AuctionRepository>,
}

impl PaymentGate {
    pub fn new(
        applications: Arc<dyn ApplicationRepository>,
        auctions: Arc<dyn AuctionRepository>,
    ) -> Self {
        Self {
            applications,
            auctions,
        }
    }

    pub fn authorize(
        &self,
        application_id: &ApplicationId,
        payment_type: PaymentType,
    ) -> Authorization {
        match self.applications.fetch(application_id) {
            Ok(Some(application)) => self.authorize_record(&application, payment_type),
            Ok(None) => Authorization::decide(
                *application_id,
                payment_type,
                None,
                AuthorizationReason::ApplicationNotFound,
            ),
            Err(err) => {
                warn!(application_id = %application_id, error = %err, "payment gate could not read application");
                Authorization::decide(
                    *application_id,
                    payment_type,
                    None,
                    AuthorizationReason::StateUnavailable,
                )
            }
        }
    }

    fn authorize_record(&self, application: &Application, payment_type: PaymentType) -> Authorization {
        let latest = if payment_type == PaymentType::BidSettlement {
            match self.auctions.latest_for_application(&application.id) {
                Ok(latest) => latest,
                Err(err) => {
                    warn!(application_id = %application.id, error = %err, "payment gate could not read auction");
                    return Authorization::decide(
                        application.id,
                        payment_type,
                        Some(application.status),
                        AuthorizationReason::StateUnavailable,
                    );
                }
            }
        } else {
            None
        };

        Authorization::decide(
            application.id,
            payment_type,
            Some(application.status),
            eligibility(application.status, latest.as_ref(), payment_type),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub payment_type: PaymentType,
    #[serde(default)]
    pub package_id: Option<PackageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Paid,
    Failed,
}

/// Persists payments after the gate allows them.
pub struct PaymentLedger {
    gate: PaymentGate,
    applications: Arc<dyn ApplicationRepository>,
    auctions: Arc<dyn AuctionRepository>,
    payments: Arc<dyn PaymentRepository>,
    registry: Arc<InstallerRegistry>,
    locks: Arc<EntityLocks<ApplicationId>>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    authority_fee: Decimal,
}

impl PaymentLedger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        applications: Arc<dyn ApplicationRepository>,
        auctions: Arc<dyn AuctionRepository>,
        payments: Arc<dyn PaymentRepository>,
        registry: Arc<InstallerRegistry>,
        locks: Arc<EntityLocks<ApplicationId>>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        authority_fee: Decimal,
    ) -> Self {
        Self {
            gate: PaymentGate::new(applications.clone(), auctions.clone()),
            applications,
            auctions,
            payments,
            registry,
            locks,
            events,
            clock,
            authority_fee,
        }
    }

    pub fn gate(&self) -> &PaymentGate {
        &self.gate
    }

    /// Authorize and persist a pending payment under the application lock.
    pub async fn create(
        &self,
        actor: &Actor,
        application_id: &ApplicationId,
        request: PaymentRequest,
    ) -> Result<Payment, ProcurementError> {
        let _guard = self.locks.lock(application_id).await;
        let application = self
            .applications
            .fetch(application_id)?
            .ok_or_else(|| ProcurementError::not_found(format!("application {application_id}")))?;

        if !actor.is(Role::Customer, &application.owner) {
            return Err(ProcurementError::Unauthorized(
                "only the application owner can start a payment".to_string(),
            ));
        }

        let authorization = self.gate.authorize_record(&application, request.payment_type);
        if !authorization.allowed {
            return Err(ProcurementError::InvalidTransition(format!(
                "{} payment denied: {}",
                request.payment_type.label(),
                authorization.reason.label()
            )));
        }

        let amount = match request.payment_type {
            PaymentType::AuthorityFee => Amount::new(self.authority_fee)?,
            PaymentType::PackagePurchase => {
                let package_id = request.package_id.ok_or_else(|| {
                    ProcurementError::InvalidInput(
                        "package_id is required for a package purchase".to_string(),
                    )
                })?;
                self.registry.purchasable(&package_id)?.price
            }
            PaymentType::BidSettlement => self
                .auctions
                .latest_for_application(application_id)?
                .as_ref()
                .and_then(|auction| auction.accepted().map(|bid| bid.amount))
                .ok_or_else(|| {
                    ProcurementError::Conflict("accepted bid is no longer available".to_string())
                })?,
        };

        let duplicate = self
            .payments
            .for_application(application_id)?
            .into_iter()
            .any(|payment| {
                payment.payment_type == request.payment_type
                    && payment.status != PaymentStatus::Failed
            });
        if duplicate {
            return Err(ProcurementError::Conflict(format!(
                "a {} payment already exists for application {application_id}",
                request.payment_type.label()
            )));
        }

        let now = self.clock.now();
        let payment = Payment {
            id: PaymentId::generate(),
            application_id: *application_id,
            customer: application.owner.clone(),
            payment_type: request.payment_type,
            amount,
            status: PaymentStatus::Pending,
            package_id: request
                .package_id
                .filter(|_| request.payment_type == PaymentType::PackagePurchase),
            created_at: now,
            settled_at: None,
            version: 1,
        };
        let payment = self.payments.insert(payment)?;

        info!(
            payment_id = %payment.id,
            application_id = %application_id,
            payment_type = payment.payment_type.label(),
            amount = %payment.amount,
            "payment created"
        );
        self.events.publish(
            *application_id,
            &application.owner,
            now,
            EventKind::PaymentCreated {
                payment_id: payment.id,
                payment_type: payment.payment_type,
                amount: payment.amount,
            },
        );
        Ok(payment)
    }

    /// Gateway callback moving a pending payment to its final status.
    pub async fn record_outcome(
        &self,
        actor: &Actor,
        payment_id: &PaymentId,
        outcome: PaymentOutcome,
    ) -> Result<Payment, ProcurementError> {
        let application_id = self.payment(payment_id)?.application_id;
        if !matches!(actor.role, Role::System | Role::Officer) {
            return Err(ProcurementError::Unauthorized(
                "payment outcomes come from the gateway or an officer".to_string(),
            ));
        }

        let _guard = self.locks.lock(&application_id).await;
        let current = self.payment(payment_id)?;
        if current.status != PaymentStatus::Pending {
            return Err(ProcurementError::InvalidTransition(format!(
                "payment {payment_id} is already {:?}",
                current.status
            )));
        }

        let now = self.clock.now();
        let mut next = current.clone();
        next.status = match outcome {
            PaymentOutcome::Paid => PaymentStatus::Paid,
            PaymentOutcome::Failed => PaymentStatus::Failed,
        };
        next.settled_at = Some(now);
        next.version += 1;
        self.payments.update(next.clone(), current.version)?;

        info!(payment_id = %payment_id, status = ?next.status, "payment settled");
        self.events.publish(
            application_id,
            &next.customer,
            now,
            EventKind::PaymentSettled {
                payment_id: next.id,
                payment_type: next.payment_type,
                status: next.status,
            },
        );
        Ok(next)
    }

    pub fn list_for_customer(
        &self,
        actor: &Actor,
        customer: &ActorId,
    ) -> Result<Vec<Payment>, ProcurementError> {
        if !(actor.is(Role::Customer, customer) || actor.role == Role::Officer) {
            return Err(ProcurementError::Unauthorized(
                "customers may only list their own payments".to_string(),
            ));
        }
        let mut payments = self.payments.for_customer(customer)?;
        payments.sort_by_key(|payment| payment.created_at);
        Ok(payments)
    }

    fn payment(&self, payment_id: &PaymentId) -> Result<Payment, ProcurementError> {
        self.payments
            .fetch(payment_id)?
            .ok_or_else(|| ProcurementError::not_found(format!("payment {payment_id}")))
    }
}
