use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use super::error::ProcurementError;
use super::lifecycle::LifecycleAction;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(value.trim()).map(Self)
            }
        }
    };
}

entity_id!(
    /// Immutable identity of a customer's installation application.
    ApplicationId
);
entity_id!(
    /// Identity of one procurement round. An application may accumulate several after expiries.
    AuctionId
);
entity_id!(BidId);
entity_id!(PaymentId);
entity_id!(PackageId);

/// Opaque user identity issued by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Officer,
    Installer,
    /// The engine itself, used for auction callbacks and gateway notifications.
    System,
}

impl Role {
    pub const fn label(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Officer => "officer",
            Role::Installer => "installer",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = ProcurementError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "officer" => Ok(Role::Officer),
            "installer" => Ok(Role::Installer),
            "system" => Ok(Role::System),
            other => Err(ProcurementError::InvalidInput(format!("unknown role '{other}'"))),
        }
    }
}

/// Caller identity passed explicitly into every engine call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: ActorId(id.into()),
            role,
        }
    }

    pub fn customer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Customer)
    }

    pub fn officer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Officer)
    }

    pub fn installer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Installer)
    }

    pub fn system() -> Self {
        Self::new("sunbid-engine", Role::System)
    }

    pub fn is(&self, role: Role, id: &ActorId) -> bool {
        self.role == role && &self.id == id
    }
}

/// Strictly positive monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, ProcurementError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(ProcurementError::InvalidInput(format!(
                "amount must be positive, got {value}"
            )))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = ProcurementError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = <Decimal as Deserialize>::deserialize(deserializer)?;
        Amount::new(value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Position of an application in the approval and procurement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Submitted,
    UnderReview,
    SiteVisitScheduled,
    Approved,
    Rejected,
    ProcurementOpen,
    InstallerSelected,
    Installed,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 8] = [
        ApplicationStatus::Submitted,
        ApplicationStatus::UnderReview,
        ApplicationStatus::SiteVisitScheduled,
        ApplicationStatus::Approved,
        ApplicationStatus::Rejected,
        ApplicationStatus::ProcurementOpen,
        ApplicationStatus::InstallerSelected,
        ApplicationStatus::Installed,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            ApplicationStatus::Submitted => "Submitted",
            ApplicationStatus::UnderReview => "Under Review",
            ApplicationStatus::SiteVisitScheduled => "Site Visit Scheduled",
            ApplicationStatus::Approved => "Approved",
            ApplicationStatus::Rejected => "Rejected",
            ApplicationStatus::ProcurementOpen => "Procurement Open",
            ApplicationStatus::InstallerSelected => "Installer Selected",
            ApplicationStatus::Installed => "Installed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, ApplicationStatus::Rejected | ApplicationStatus::Installed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicantDetails {
    pub full_name: String,
    pub national_id: String,
    pub phone: String,
    pub email: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Residential,
    Commercial,
    Industrial,
    Agricultural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Owned,
    Rented,
    Leased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shading {
    None,
    Partial,
    Heavy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDetails {
    pub property_type: PropertyType,
    pub roof_type: String,
    pub roof_area_sqm: Decimal,
    pub roof_orientation: String,
    pub shading: Shading,
    pub ownership: Ownership,
    /// Utility (CEB) account number the system will be connected under.
    pub utility_account: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionProfile {
    pub monthly_kwh: Decimal,
    pub monthly_bill: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    SinglePhase,
    ThreePhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    NationalId,
    BankDocument,
    UtilityBill,
    PropertyDeed,
}

/// Reference returned by the document store; contents are never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub category: DocumentCategory,
    pub file_ref: String,
}

/// Customer supplied fields captured when an application is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSubmission {
    pub applicant: ApplicantDetails,
    pub site: SiteDetails,
    pub consumption: ConsumptionProfile,
    pub capacity_requested_kw: Decimal,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub existing_solar: bool,
    #[serde(default)]
    pub documents: Vec<DocumentRef>,
}

impl ApplicationSubmission {
    pub fn validate(&self) -> Result<(), ProcurementError> {
        let required = [
            ("full_name", &self.applicant.full_name),
            ("national_id", &self.applicant.national_id),
            ("utility_account", &self.site.utility_account),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ProcurementError::InvalidInput(format!("{field} is required")));
            }
        }

        if self.capacity_requested_kw <= Decimal::ZERO {
            return Err(ProcurementError::InvalidInput(
                "capacity_requested_kw must be greater than zero".to_string(),
            ));
        }
        if self.site.roof_area_sqm <= Decimal::ZERO {
            return Err(ProcurementError::InvalidInput(
                "roof_area_sqm must be greater than zero".to_string(),
            ));
        }
        if self.consumption.monthly_kwh < Decimal::ZERO
            || self.consumption.monthly_bill < Decimal::ZERO
        {
            return Err(ProcurementError::InvalidInput(
                "consumption figures cannot be negative".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(self.documents.len());
        for document in &self.documents {
            if document.file_ref.trim().is_empty() {
                return Err(ProcurementError::InvalidInput(format!(
                    "document {:?} is missing its file reference",
                    document.category
                )));
            }
            if seen.contains(&document.category) {
                return Err(ProcurementError::InvalidInput(format!(
                    "document {:?} supplied more than once",
                    document.category
                )));
            }
            seen.push(document.category);
        }

        Ok(())
    }
}

/// One append-only audit record per committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    pub action: LifecycleAction,
    pub from: Option<ApplicationStatus>,
    pub to: ApplicationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Durable application record. Mutated only by the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub owner: ActorId,
    pub status: ApplicationStatus,
    pub submission: ApplicationSubmission,
    pub site_visit: Option<DateTime<Utc>>,
    pub reviewer_notes: Option<String>,
    pub reviewed_by: Option<ActorId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub active_auction: Option<AuctionId>,
    pub selected_package: Option<PackageId>,
    pub selected_installer: Option<ActorId>,
    pub contract_amount: Option<Amount>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every committed write; used for compare-and-set.
    pub version: u64,
    pub history: Vec<TransitionEntry>,
}

impl Application {
    pub fn capacity_requested_kw(&self) -> Decimal {
        self.submission.capacity_requested_kw
    }

    pub fn statuses(&self) -> Vec<ApplicationStatus> {
        self.history.iter().map(|entry| entry.to).collect()
    }

    pub fn entry_for_request(&self, request_id: &str) -> Option<&TransitionEntry> {
        self.history
            .iter()
            .find(|entry| entry.request_id.as_deref() == Some(request_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionState {
    Open,
    AwaitingDecision,
    ClosedAccepted,
    ClosedExpired,
}

impl AuctionState {
    pub const fn label(self) -> &'static str {
        match self {
            AuctionState::Open => "Open",
            AuctionState::AwaitingDecision => "Awaiting Decision",
            AuctionState::ClosedAccepted => "Closed (Accepted)",
            AuctionState::ClosedExpired => "Closed (Expired)",
        }
    }

    /// Whether the round can still be accepted or expired.
    pub const fn is_live(self) -> bool {
        matches!(self, AuctionState::Open | AuctionState::AwaitingDecision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub auction_id: AuctionId,
    pub installer_id: ActorId,
    pub amount: Amount,
    pub timeline_days: u32,
    pub message: String,
    pub submitted_at: DateTime<Utc>,
}

/// A time-boxed procurement round for one approved application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    pub id: AuctionId,
    pub application_id: ApplicationId,
    pub customer: ActorId,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub state: AuctionState,
    /// At most one active bid per installer.
    pub bids: BTreeMap<ActorId, Bid>,
    pub accepted_bid: Option<BidId>,
    pub closed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Auction {
    pub fn open(
        id: AuctionId,
        application: &Application,
        opened_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            application_id: application.id,
            customer: application.owner.clone(),
            opened_at,
            deadline,
            state: AuctionState::Open,
            bids: BTreeMap::new(),
            accepted_bid: None,
            closed_at: None,
            version: 1,
        }
    }

    pub fn bid(&self, id: &BidId) -> Option<&Bid> {
        self.bids.values().find(|bid| &bid.id == id)
    }

    pub fn accepted(&self) -> Option<&Bid> {
        self.accepted_bid.as_ref().and_then(|id| self.bid(id))
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Bids ordered by amount for display; selection is always an explicit customer action.
    pub fn ranked_bids(&self) -> Vec<&Bid> {
        let mut bids: Vec<&Bid> = self.bids.values().collect();
        bids.sort_by(|left, right| {
            left.amount
                .cmp(&right.amount)
                .then(left.timeline_days.cmp(&right.timeline_days))
        });
        bids
    }
}
