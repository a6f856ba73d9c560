use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::domain::{
    ActorId, Application, ApplicationId, Auction, AuctionId, PackageId, PaymentId,
};
use super::installers::{InstallerPackage, InstallerProfile};
use super::payments::Payment;
use super::repository::{
    ApplicationRepository, AuctionRepository, InstallerRepository, PaymentRepository,
    RepositoryError,
};

#[derive(Default)]
struct Tables {
    applications: HashMap<ApplicationId, Application>,
    auctions: HashMap<AuctionId, Auction>,
    latest_auction: HashMap<ApplicationId, AuctionId>,
    payments: HashMap<PaymentId, Payment>,
    installers: HashMap<ActorId, InstallerProfile>,
    packages: HashMap<PackageId, InstallerPackage>,
}

/// Process-local store backing every repository trait.
#[derive(Default, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut guard = self.tables.lock().expect("repository mutex poisoned");
        f(&mut guard)
    }
}

impl ApplicationRepository for MemoryStore {
    fn insert(&self, record: Application) -> Result<Application, RepositoryError> {
        self.with(|tables| {
            if tables.applications.contains_key(&record.id) {
                return Err(RepositoryError::Conflict);
            }
            tables.applications.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn update(&self, record: Application, expected_version: u64) -> Result<(), RepositoryError> {
        self.with(|tables| match tables.applications.get_mut(&record.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = record;
                Ok(())
            }
            Some(_) => Err(RepositoryError::Conflict),
            None => Err(RepositoryError::NotFound),
        })
    }

    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, RepositoryError> {
        Ok(self.with(|tables| tables.applications.get(id).cloned()))
    }

    fn by_owner(&self, owner: &ActorId) -> Result<Vec<Application>, RepositoryError> {
        Ok(self.with(|tables| {
            tables
                .applications
                .values()
                .filter(|record| &record.owner == owner)
                .cloned()
                .collect()
        }))
    }

    fn all(&self) -> Result<Vec<Application>, RepositoryError> {
        Ok(self.with(|tables| tables.applications.values().cloned().collect()))
    }
}

impl AuctionRepository for MemoryStore {
    fn insert(&self, auction: Auction) -> Result<Auction, RepositoryError> {
        self.with(|tables| {
            if tables.auctions.contains_key(&auction.id) {
                return Err(RepositoryError::Conflict);
            }
            tables
                .latest_auction
                .insert(auction.application_id, auction.id);
            tables.auctions.insert(auction.id, auction.clone());
            Ok(auction)
        })
    }

    fn update(&self, auction: Auction, expected_version: u64) -> Result<(), RepositoryError> {
        self.with(|tables| match tables.auctions.get_mut(&auction.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = auction;
                Ok(())
            }
            Some(_) => Err(RepositoryError::Conflict),
            None => Err(RepositoryError::NotFound),
        })
    }

    fn fetch(&self, id: &AuctionId) -> Result<Option<Auction>, RepositoryError> {
        Ok(self.with(|tables| tables.auctions.get(id).cloned()))
    }

    fn latest_for_application(
        &self,
        id: &ApplicationId,
    ) -> Result<Option<Auction>, RepositoryError> {
        Ok(self.with(|tables| {
            tables
                .latest_auction
                .get(id)
                .and_then(|auction_id| tables.auctions.get(auction_id))
                .cloned()
        }))
    }

    fn discard(&self, id: &AuctionId) -> Result<(), RepositoryError> {
        self.with(|tables| {
            let Some(removed) = tables.auctions.remove(id) else {
                return Ok(());
            };
            let previous = tables
                .auctions
                .values()
                .filter(|auction| auction.application_id == removed.application_id)
                .max_by_key(|auction| auction.opened_at)
                .map(|auction| auction.id);
            match previous {
                Some(previous) => {
                    tables
                        .latest_auction
                        .insert(removed.application_id, previous);
                }
                None => {
                    tables.latest_auction.remove(&removed.application_id);
                }
            }
            Ok(())
        })
    }

    fn all(&self) -> Result<Vec<Auction>, RepositoryError> {
        Ok(self.with(|tables| tables.auctions.values().cloned().collect()))
    }
}

impl PaymentRepository for MemoryStore {
    fn insert(&self, payment: Payment) -> Result<Payment, RepositoryError> {
        self.with(|tables| {
            if tables.payments.contains_key(&payment.id) {
                return Err(RepositoryError::Conflict);
            }
            tables.payments.insert(payment.id, payment.clone());
            Ok(payment)
        })
    }

    fn update(&self, payment: Payment, expected_version: u64) -> Result<(), RepositoryError> {
        self.with(|tables| match tables.payments.get_mut(&payment.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = payment;
                Ok(())
            }
            Some(_) => Err(RepositoryError::Conflict),
            None => Err(RepositoryError::NotFound),
        })
    }

    fn fetch(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.with(|tables| tables.payments.get(id).cloned()))
    }

    fn for_application(&self, id: &ApplicationId) -> Result<Vec<Payment>, RepositoryError> {
        Ok(self.with(|tables| {
            tables
                .payments
                .values()
                .filter(|payment| &payment.application_id == id)
                .cloned()
                .collect()
        }))
    }

    fn for_customer(&self, customer: &ActorId) -> Result<Vec<Payment>, RepositoryError> {
        Ok(self.with(|tables| {
            tables
                .payments
                .values()
                .filter(|payment| &payment.customer == customer)
                .cloned()
                .collect()
        }))
    }
}

impl InstallerRepository for MemoryStore {
    fn insert_profile(
        &self,
        profile: InstallerProfile,
    ) -> Result<InstallerProfile, RepositoryError> {
        self.with(|tables| {
            if tables.installers.contains_key(&profile.id) {
                return Err(RepositoryError::Conflict);
            }
            tables.installers.insert(profile.id.clone(), profile.clone());
            Ok(profile)
        })
    }

    fn update_profile(&self, profile: InstallerProfile) -> Result<(), RepositoryError> {
        self.with(|tables| match tables.installers.get_mut(&profile.id) {
            Some(stored) => {
                *stored = profile;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        })
    }

    fn fetch_profile(&self, id: &ActorId) -> Result<Option<InstallerProfile>, RepositoryError> {
        Ok(self.with(|tables| tables.installers.get(id).cloned()))
    }

    fn insert_package(
        &self,
        package: InstallerPackage,
    ) -> Result<InstallerPackage, RepositoryError> {
        self.with(|tables| {
            if tables.packages.contains_key(&package.id) {
                return Err(RepositoryError::Conflict);
            }
            tables.packages.insert(package.id, package.clone());
            Ok(package)
        })
    }

    fn update_package(&self, package: InstallerPackage) -> Result<(), RepositoryError> {
        self.with(|tables| match tables.packages.get_mut(&package.id) {
            Some(stored) => {
                *stored = package;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        })
    }

    fn fetch_package(&self, id: &PackageId) -> Result<Option<InstallerPackage>, RepositoryError> {
        Ok(self.with(|tables| tables.packages.get(id).cloned()))
    }

    fn packages(&self) -> Result<Vec<InstallerPackage>, RepositoryError> {
        Ok(self.with(|tables| tables.packages.values().cloned().collect()))
    }
}
