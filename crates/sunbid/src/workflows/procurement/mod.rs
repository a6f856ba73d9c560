//! Solar installation procurement: application lifecycle, installer bidding, and the payment
//! gate that ties money to lifecycle state.

pub mod audit;
pub mod bidding;
pub mod clock;
pub mod domain;
pub mod error;
pub mod events;
pub mod health;
pub mod installers;
pub mod lifecycle;
pub mod locks;
pub mod memory;
pub mod notifications;
pub mod payments;
pub mod repository;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use audit::{export_audit_csv, export_audit_file, AuditExportError};
pub use bidding::{BidSubmission, SweepReport};
pub use clock::{
    Clock, DeadlineHandle, DeadlineTimer, ManualClock, ManualTimer, SystemClock, TimerError,
    TokioDeadlineTimer,
};
pub use domain::{
    Actor, ActorId, Amount, Application, ApplicationId, ApplicationStatus,
    ApplicationSubmission, Auction, AuctionId, AuctionState, Bid, BidId, PackageId, PaymentId,
    Role, TransitionEntry,
};
pub use error::{ErrorKind, ProcurementError};
pub use events::{
    EventBus, EventKind, EventOutbox, HookChain, HookError, LoggingHook, NotificationHook,
    ProcurementEvent,
};
pub use health::{EngineHealth, FaultKind, HealthFault, HealthReport};
pub use installers::{
    InstallerPackage, InstallerProfile, InstallerRegistration, PackageDraft,
    VerificationDecision, VerificationStatus,
};
pub use lifecycle::{LifecycleAction, ReviewDecision};
pub use memory::MemoryStore;
pub use notifications::{Notification, NotificationInbox, NotificationKind};
pub use payments::{
    Authorization, AuthorizationReason, Payment, PaymentOutcome, PaymentRequest, PaymentStatus,
    PaymentType,
};
pub use repository::{RepositoryError, Stores};
#[cfg(feature = "storage-rocksdb")]
pub use self::rocksdb::RocksDbStore;
pub use router::procurement_router;
pub use service::{EngineRuntime, ProcurementService, RecoveryReport};
