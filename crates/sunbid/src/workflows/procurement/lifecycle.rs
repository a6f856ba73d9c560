//! Application state machine. The lifecycle engine is the single writer of application status.
//!
//! ```text
//! Submitted --beginReview--> UnderReview --scheduleSiteVisit--> SiteVisitScheduled
//! SiteVisitScheduled --decide(approve)--> Approved
//! UnderReview | SiteVisitScheduled --decide(reject)--> Rejected
//! Approved --openAuction--> ProcurementOpen --accepted--> InstallerSelected
//!                                           --expired--> Approved
//! Approved --selectPackage--> InstallerSelected --confirmInstalled--> Installed
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RetryPolicy;

use super::clock::Clock;
use super::domain::{
    Actor, ActorId, Amount, Application, ApplicationId, ApplicationStatus,
    ApplicationSubmission, AuctionId, BidId, PackageId, Role, TransitionEntry,
};
use super::error::ProcurementError;
use super::events::{EventBus, EventKind};
use super::locks::EntityLocks;
use super::repository::{ApplicationRepository, RepositoryError};

const MAX_NOTES_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// Every action the lifecycle engine accepts, with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LifecycleAction {
    Submit,
    BeginReview,
    ScheduleSiteVisit {
        visit_at: DateTime<Utc>,
    },
    Decide {
        decision: ReviewDecision,
        #[serde(default)]
        notes: Option<String>,
    },
    OpenAuction {
        auction_id: AuctionId,
    },
    SelectPackage {
        package_id: PackageId,
        installer_id: ActorId,
        price: Amount,
    },
    AuctionAccepted {
        auction_id: AuctionId,
        bid_id: BidId,
        installer_id: ActorId,
        amount: Amount,
    },
    AuctionExpired {
        auction_id: AuctionId,
    },
    ConfirmInstalled,
}

impl LifecycleAction {
    pub const fn label(&self) -> &'static str {
        match self {
            LifecycleAction::Submit => "submit",
            LifecycleAction::BeginReview => "begin_review",
            LifecycleAction::ScheduleSiteVisit { .. } => "schedule_site_visit",
            LifecycleAction::Decide { .. } => "decide",
            LifecycleAction::OpenAuction { .. } => "open_auction",
            LifecycleAction::SelectPackage { .. } => "select_package",
            LifecycleAction::AuctionAccepted { .. } => "auction_accepted",
            LifecycleAction::AuctionExpired { .. } => "auction_expired",
            LifecycleAction::ConfirmInstalled => "confirm_installed",
        }
    }

    /// Whether a retried request carries the same intent. Auction ids are minted by the
    /// engine per attempt, so two `OpenAuction` requests are the same regardless of id.
    fn same_request(&self, other: &LifecycleAction) -> bool {
        match (self, other) {
            (LifecycleAction::OpenAuction { .. }, LifecycleAction::OpenAuction { .. }) => true,
            _ => self == other,
        }
    }
}

/// Edge table of the lifecycle graph.
pub fn next_status(from: ApplicationStatus, action: &LifecycleAction) -> Option<ApplicationStatus> {
    use ApplicationStatus::*;

    match (from, action) {
        (Submitted, LifecycleAction::BeginReview) => Some(UnderReview),
        (UnderReview, LifecycleAction::ScheduleSiteVisit { .. }) => Some(SiteVisitScheduled),
        (
            SiteVisitScheduled,
            LifecycleAction::Decide {
                decision: ReviewDecision::Approve,
                ..
            },
        ) => Some(Approved),
        (
            UnderReview | SiteVisitScheduled,
            LifecycleAction::Decide {
                decision: ReviewDecision::Reject,
                ..
            },
        ) => Some(Rejected),
        (Approved, LifecycleAction::OpenAuction { .. }) => Some(ProcurementOpen),
        (Approved, LifecycleAction::SelectPackage { .. }) => Some(InstallerSelected),
        (ProcurementOpen, LifecycleAction::AuctionAccepted { .. }) => Some(InstallerSelected),
        (ProcurementOpen, LifecycleAction::AuctionExpired { .. }) => Some(Approved),
        (InstallerSelected, LifecycleAction::ConfirmInstalled) => Some(Installed),
        _ => None,
    }
}

/// Role and ownership rules per action.
pub fn authorize(
    application: &Application,
    actor: &Actor,
    action: &LifecycleAction,
) -> Result<(), ProcurementError> {
    let allowed = match action {
        LifecycleAction::Submit => actor.is(Role::Customer, &application.owner),
        LifecycleAction::BeginReview
        | LifecycleAction::ScheduleSiteVisit { .. }
        | LifecycleAction::Decide { .. } => actor.role == Role::Officer,
        LifecycleAction::OpenAuction { .. } | LifecycleAction::SelectPackage { .. } => {
            actor.is(Role::Customer, &application.owner)
        }
        LifecycleAction::AuctionAccepted { .. } | LifecycleAction::AuctionExpired { .. } => {
            actor.role == Role::System
        }
        LifecycleAction::ConfirmInstalled => {
            actor.role == Role::Officer
                || application
                    .selected_installer
                    .as_ref()
                    .is_some_and(|installer| actor.is(Role::Installer, installer))
        }
    };

    if allowed {
        Ok(())
    } else {
        Err(ProcurementError::Unauthorized(format!(
            "{} '{}' cannot {} application {}",
            actor.role.label(),
            actor.id,
            action.label(),
            application.id
        )))
    }
}

/// Outcome of evaluating a request against the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Plan {
    /// The request id was already applied; return current state untouched.
    Replay(TransitionEntry),
    Commit(Application),
}

/// Pure evaluation of a transition. Check order: authorization, replay, graph edge, payload.
pub(crate) fn plan(
    current: &Application,
    actor: &Actor,
    action: &LifecycleAction,
    request_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Plan, ProcurementError> {
    authorize(current, actor, action)?;

    if let Some(request_id) = request_id {
        if let Some(entry) = current.entry_for_request(request_id) {
            if entry.action.same_request(action) && entry.actor.id == actor.id {
                return Ok(Plan::Replay(entry.clone()));
            }
            return Err(ProcurementError::Conflict(format!(
                "request id '{request_id}' was already used for a different {} request",
                entry.action.label()
            )));
        }
    }

    let from = current.status;
    let to = next_status(from, action).ok_or_else(|| {
        ProcurementError::InvalidTransition(format!(
            "cannot {} while application is {}",
            action.label(),
            from.label()
        ))
    })?;

    match action {
        LifecycleAction::AuctionAccepted { auction_id, .. }
        | LifecycleAction::AuctionExpired { auction_id }
            if current.active_auction != Some(*auction_id) =>
        {
            return Err(ProcurementError::InvalidTransition(format!(
                "auction {auction_id} is not the active round for application {}",
                current.id
            )));
        }
        LifecycleAction::ScheduleSiteVisit { visit_at } if *visit_at < now => {
            return Err(ProcurementError::InvalidInput(
                "site visit must be scheduled in the future".to_string(),
            ));
        }
        LifecycleAction::Decide {
            notes: Some(notes), ..
        } if notes.chars().count() > MAX_NOTES_LEN => {
            return Err(ProcurementError::InvalidInput(format!(
                "reviewer notes are limited to {MAX_NOTES_LEN} characters"
            )));
        }
        _ => {}
    }

    let mut next = current.clone();
    next.status = to;
    match action {
        LifecycleAction::ScheduleSiteVisit { visit_at } => next.site_visit = Some(*visit_at),
        LifecycleAction::Decide { notes, .. } => {
            next.reviewer_notes = notes
                .as_ref()
                .map(|notes| notes.trim().to_string())
                .filter(|notes| !notes.is_empty());
            next.reviewed_by = Some(actor.id.clone());
            next.reviewed_at.get_or_insert(now);
        }
        LifecycleAction::OpenAuction { auction_id } => next.active_auction = Some(*auction_id),
        LifecycleAction::SelectPackage {
            package_id,
            installer_id,
            price,
        } => {
            next.selected_package = Some(*package_id);
            next.selected_installer = Some(installer_id.clone());
            next.contract_amount = Some(*price);
        }
        LifecycleAction::AuctionAccepted {
            installer_id,
            amount,
            ..
        } => {
            next.active_auction = None;
            next.selected_installer = Some(installer_id.clone());
            next.contract_amount = Some(*amount);
        }
        LifecycleAction::AuctionExpired { .. } => next.active_auction = None,
        LifecycleAction::Submit | LifecycleAction::BeginReview | LifecycleAction::ConfirmInstalled => {}
    }

    next.version += 1;
    next.updated_at = now;
    next.history.push(TransitionEntry {
        sequence: current.history.len() as u64 + 1,
        at: now,
        actor: actor.clone(),
        action: action.clone(),
        from: Some(from),
        to,
        request_id: request_id.map(str::to_string),
    });

    Ok(Plan::Commit(next))
}

/// Validates, persists, and announces application transitions.
pub struct LifecycleEngine {
    applications: Arc<dyn ApplicationRepository>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    locks: Arc<EntityLocks<ApplicationId>>,
    retry: RetryPolicy,
}

impl LifecycleEngine {
    pub fn new(
        applications: Arc<dyn ApplicationRepository>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        locks: Arc<EntityLocks<ApplicationId>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            applications,
            clock,
            events,
            locks,
            retry,
        }
    }

    pub(crate) fn locks(&self) -> &EntityLocks<ApplicationId> {
        &self.locks
    }

    /// Create a new application in `Submitted`.
    pub async fn submit(
        &self,
        actor: &Actor,
        submission: ApplicationSubmission,
    ) -> Result<Application, ProcurementError> {
        if actor.role != Role::Customer {
            return Err(ProcurementError::Unauthorized(format!(
                "only customers submit applications, not {}",
                actor.role.label()
            )));
        }
        submission.validate()?;

        let now = self.clock.now();
        let application = Application {
            id: ApplicationId::generate(),
            owner: actor.id.clone(),
            status: ApplicationStatus::Submitted,
            submission,
            site_visit: None,
            reviewer_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            active_auction: None,
            selected_package: None,
            selected_installer: None,
            contract_amount: None,
            created_at: now,
            updated_at: now,
            version: 1,
            history: vec![TransitionEntry {
                sequence: 1,
                at: now,
                actor: actor.clone(),
                action: LifecycleAction::Submit,
                from: None,
                to: ApplicationStatus::Submitted,
                request_id: None,
            }],
        };

        let _guard = self.locks.lock(&application.id).await;
        self.persist(&application, || {
            self.applications.insert(application.clone()).map(|_| ())
        })
        .await?;

        info!(application_id = %application.id, owner = %application.owner, "application submitted");
        self.events.publish(
            application.id,
            &application.owner,
            now,
            EventKind::ApplicationSubmitted,
        );
        Ok(application)
    }

    pub fn get(&self, id: &ApplicationId) -> Result<Application, ProcurementError> {
        self.applications
            .fetch(id)?
            .ok_or_else(|| ProcurementError::not_found(format!("application {id}")))
    }

    pub fn for_owner(&self, owner: &ActorId) -> Result<Vec<Application>, ProcurementError> {
        Ok(self.applications.by_owner(owner)?)
    }

    /// Applications still waiting on an officer, oldest first.
    pub fn review_queue(&self) -> Result<Vec<Application>, ProcurementError> {
        let mut queue: Vec<Application> = self
            .applications
            .all()?
            .into_iter()
            .filter(|application| {
                matches!(
                    application.status,
                    ApplicationStatus::Submitted
                        | ApplicationStatus::UnderReview
                        | ApplicationStatus::SiteVisitScheduled
                )
            })
            .collect();
        queue.sort_by_key(|application| application.created_at);
        Ok(queue)
    }

    pub async fn transition(
        &self,
        id: &ApplicationId,
        actor: &Actor,
        action: LifecycleAction,
        request_id: Option<&str>,
    ) -> Result<Application, ProcurementError> {
        let _guard = self.locks.lock(id).await;
        self.transition_locked(id, actor, action, request_id).await
    }

    /// Caller must hold the application lock.
    pub(crate) async fn transition_locked(
        &self,
        id: &ApplicationId,
        actor: &Actor,
        action: LifecycleAction,
        request_id: Option<&str>,
    ) -> Result<Application, ProcurementError> {
        let current = self.get(id)?;
        match plan(&current, actor, &action, request_id, self.clock.now())? {
            Plan::Replay(entry) => {
                info!(
                    application_id = %id,
                    action = entry.action.label(),
                    "idempotent replay; returning current state"
                );
                Ok(current)
            }
            Plan::Commit(next) => self.commit(&current, next).await,
        }
    }

    /// Persist a planned transition and emit its event. Caller must hold the application lock.
    pub(crate) async fn commit(
        &self,
        current: &Application,
        next: Application,
    ) -> Result<Application, ProcurementError> {
        let expected = current.version;
        self.persist(&next, || self.applications.update(next.clone(), expected))
            .await?;

        let entry = next
            .history
            .last()
            .ok_or_else(|| ProcurementError::Conflict("transition without audit entry".to_string()))?;
        info!(
            application_id = %next.id,
            from = current.status.label(),
            to = next.status.label(),
            action = entry.action.label(),
            actor = %entry.actor.id,
            "application transition committed"
        );
        self.events.publish(
            next.id,
            &next.owner,
            entry.at,
            EventKind::StatusChanged {
                from: current.status,
                to: next.status,
                action: entry.action.label().to_string(),
            },
        );
        Ok(next)
    }

    /// Write with bounded retries on transient failures.
    ///
    /// `Unavailable` may hide a write that landed, and a `Conflict` on a retry can only come
    /// from such a write. Either way the stored record is checked against the natural key
    /// (id, version, target status) and a match counts as committed.
    async fn persist<F>(&self, target: &Application, mut write: F) -> Result<(), ProcurementError>
    where
        F: FnMut() -> Result<(), RepositoryError>,
    {
        let mut attempt = 1;
        loop {
            let err = match write() {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let ambiguous = match &err {
                RepositoryError::Unavailable(_) => true,
                RepositoryError::Conflict => attempt > 1,
                _ => false,
            };
            if ambiguous && self.already_applied(target) {
                info!(application_id = %target.id, attempt, "write already applied");
                return Ok(());
            }

            match err {
                RepositoryError::Unavailable(reason) if attempt < self.retry.attempts => {
                    warn!(
                        application_id = %target.id,
                        attempt,
                        %reason,
                        "application store unavailable; retrying"
                    );
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                err => return Err(err.into()),
            }
        }
    }

    fn already_applied(&self, target: &Application) -> bool {
        match self.applications.fetch(&target.id) {
            Ok(Some(stored)) => {
                stored.version == target.version
                    && stored.status == target.status
                    && stored.history.len() == target.history.len()
            }
            Ok(None) => false,
            Err(err) => {
                warn!(application_id = %target.id, error = %err, "could not re-read application");
                false
            }
        }
    }
}
