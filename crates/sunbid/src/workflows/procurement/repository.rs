use std::sync::Arc;

use super::domain::{
    ActorId, Application, ApplicationId, Auction, AuctionId, PackageId, PaymentId,
};
use super::installers::{InstallerPackage, InstallerProfile};
use super::payments::Payment;

/// Durable application records. `update` is a compare-and-set on `version`.
pub trait ApplicationRepository: Send + Sync {
    fn insert(&self, record: Application) -> Result<Application, RepositoryError>;
    fn update(&self, record: Application, expected_version: u64) -> Result<(), RepositoryError>;
    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, RepositoryError>;
    fn by_owner(&self, owner: &ActorId) -> Result<Vec<Application>, RepositoryError>;
    fn all(&self) -> Result<Vec<Application>, RepositoryError>;
}

/// Auctions with their embedded bids.
pub trait AuctionRepository: Send + Sync {
    fn insert(&self, auction: Auction) -> Result<Auction, RepositoryError>;
    fn update(&self, auction: Auction, expected_version: u64) -> Result<(), RepositoryError>;
    fn fetch(&self, id: &AuctionId) -> Result<Option<Auction>, RepositoryError>;
    /// Most recently opened round for the application.
    fn latest_for_application(
        &self,
        id: &ApplicationId,
    ) -> Result<Option<Auction>, RepositoryError>;
    /// Remove a round whose opening transition never committed.
    fn discard(&self, id: &AuctionId) -> Result<(), RepositoryError>;
    fn all(&self) -> Result<Vec<Auction>, RepositoryError>;
}

pub trait PaymentRepository: Send + Sync {
    fn insert(&self, payment: Payment) -> Result<Payment, RepositoryError>;
    fn update(&self, payment: Payment, expected_version: u64) -> Result<(), RepositoryError>;
    fn fetch(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError>;
    fn for_application(&self, id: &ApplicationId) -> Result<Vec<Payment>, RepositoryError>;
    fn for_customer(&self, customer: &ActorId) -> Result<Vec<Payment>, RepositoryError>;
}

pub trait InstallerRepository: Send + Sync {
    fn insert_profile(&self, profile: InstallerProfile)
        -> Result<InstallerProfile, RepositoryError>;
    fn update_profile(&self, profile: InstallerProfile) -> Result<(), RepositoryError>;
    fn fetch_profile(&self, id: &ActorId) -> Result<Option<InstallerProfile>, RepositoryError>;
    fn insert_package(&self, package: InstallerPackage)
        -> Result<InstallerPackage, RepositoryError>;
    fn update_package(&self, package: InstallerPackage) -> Result<(), RepositoryError>;
    fn fetch_package(&self, id: &PackageId) -> Result<Option<InstallerPackage>, RepositoryError>;
    fn packages(&self) -> Result<Vec<InstallerPackage>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// Duplicate key on insert, or a stale version on update.
    #[error("record already exists or changed concurrently")]
    Conflict,
    #[error("record not found")]
    NotFound,
    /// Transient; the engine retries committed transitions on this variant only.
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

/// The four repositories the engine writes through.
#[derive(Clone)]
pub struct Stores {
    pub applications: Arc<dyn ApplicationRepository>,
    pub auctions: Arc<dyn AuctionRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub installers: Arc<dyn InstallerRepository>,
}

impl Stores {
    /// Use one backend for every repository.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ApplicationRepository
            + AuctionRepository
            + PaymentRepository
            + InstallerRepository
            + 'static,
    {
        Self {
            applications: store.clone(),
            auctions: store.clone(),
            payments: store.clone(),
            installers: store,
        }
    }
}
