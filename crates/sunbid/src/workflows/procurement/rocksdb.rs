//! Durable RocksDB backend, enabled with the `storage-rocksdb` feature.

use std::path::Path;
use std::sync::{Arc, Mutex};

use ::rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::domain::{
    ActorId, Application, ApplicationId, Auction, AuctionId, PackageId, PaymentId,
};
use super::installers::{InstallerPackage, InstallerProfile};
use super::payments::Payment;
use super::repository::{
    ApplicationRepository, AuctionRepository, InstallerRepository, PaymentRepository,
    RepositoryError,
};

pub const CF_APPLICATIONS: &str = "applications";
pub const CF_AUCTIONS: &str = "auctions";
/// Application id -> id of its most recent auction.
pub const CF_LATEST_AUCTION: &str = "latest_auction";
pub const CF_PAYMENTS: &str = "payments";
pub const CF_INSTALLERS: &str = "installers";
pub const CF_PACKAGES: &str = "packages";

const COLUMN_FAMILIES: [&str; 6] = [
    CF_APPLICATIONS,
    CF_AUCTIONS,
    CF_LATEST_AUCTION,
    CF_PAYMENTS,
    CF_INSTALLERS,
    CF_PACKAGES,
];

/// RocksDB store with one column family per record type and JSON values.
///
/// Compare-and-set writes are serialized through a process-local write lock; the store is
/// owned by a single authoritative process.
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
    writes: Arc<Mutex<()>>,
}

impl RocksDbStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors).map_err(unavailable)?;

        Ok(Self {
            db: Arc::new(db),
            writes: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, RepositoryError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RepositoryError::Unavailable(format!("column family {name} missing")))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, RepositoryError> {
        let handle = self.cf(cf)?;
        match self.db.get_cf(handle, key).map_err(unavailable)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| RepositoryError::Corrupt(format!("{cf}: {err}"))),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<(), RepositoryError> {
        let handle = self.cf(cf)?;
        self.db
            .put_cf(handle, key, encode(cf, value)?)
            .map_err(unavailable)
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>, RepositoryError> {
        let handle = self.cf(cf)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (_key, value) = item.map_err(unavailable)?;
            let record = serde_json::from_slice(&value)
                .map_err(|err| RepositoryError::Corrupt(format!("{cf}: {err}")))?;
            records.push(record);
        }
        Ok(records)
    }

    fn insert_new<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<(), RepositoryError> {
        let _guard = self.writes.lock().expect("rocksdb write lock poisoned");
        if self.db.get_cf(self.cf(cf)?, key).map_err(unavailable)?.is_some() {
            return Err(RepositoryError::Conflict);
        }
        self.put(cf, key, value)
    }

    fn compare_and_put<T>(
        &self,
        cf: &str,
        key: &[u8],
        value: &T,
        expected_version: Option<u64>,
        version_of: fn(&T) -> u64,
    ) -> Result<(), RepositoryError>
    where
        T: Serialize + DeserializeOwned,
    {
        let _guard = self.writes.lock().expect("rocksdb write lock poisoned");
        let stored: T = self.get(cf, key)?.ok_or(RepositoryError::NotFound)?;
        if let Some(expected) = expected_version {
            if version_of(&stored) != expected {
                return Err(RepositoryError::Conflict);
            }
        }
        self.put(cf, key, value)
    }
}

fn encode<T: Serialize>(cf: &str, value: &T) -> Result<Vec<u8>, RepositoryError> {
    serde_json::to_vec(value).map_err(|err| RepositoryError::Corrupt(format!("{cf}: {err}")))
}

fn unavailable(err: ::rocksdb::Error) -> RepositoryError {
    RepositoryError::Unavailable(err.to_string())
}

impl ApplicationRepository for RocksDbStore {
    fn insert(&self, record: Application) -> Result<Application, RepositoryError> {
        self.insert_new(CF_APPLICATIONS, record.id.0.as_bytes(), &record)?;
        Ok(record)
    }

    fn update(&self, record: Application, expected_version: u64) -> Result<(), RepositoryError> {
        self.compare_and_put(
            CF_APPLICATIONS,
            record.id.0.as_bytes(),
            &record,
            Some(expected_version),
            |stored: &Application| stored.version,
        )
    }

    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, RepositoryError> {
        self.get(CF_APPLICATIONS, id.0.as_bytes())
    }

    fn by_owner(&self, owner: &ActorId) -> Result<Vec<Application>, RepositoryError> {
        Ok(self
            .scan::<Application>(CF_APPLICATIONS)?
            .into_iter()
            .filter(|record| &record.owner == owner)
            .collect())
    }

    fn all(&self) -> Result<Vec<Application>, RepositoryError> {
        self.scan(CF_APPLICATIONS)
    }
}

impl AuctionRepository for RocksDbStore {
    /// The round and the latest-auction index land in one batch.
    fn insert(&self, auction: Auction) -> Result<Auction, RepositoryError> {
        let _guard = self.writes.lock().expect("rocksdb write lock poisoned");
        let auctions = self.cf(CF_AUCTIONS)?;
        let key = auction.id.0.as_bytes();
        if self.db.get_cf(auctions, key).map_err(unavailable)?.is_some() {
            return Err(RepositoryError::Conflict);
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(auctions, key, encode(CF_AUCTIONS, &auction)?);
        batch.put_cf(
            self.cf(CF_LATEST_AUCTION)?,
            auction.application_id.0.as_bytes(),
            encode(CF_LATEST_AUCTION, &auction.id)?,
        );
        self.db.write(batch).map_err(unavailable)?;
        Ok(auction)
    }

    fn update(&self, auction: Auction, expected_version: u64) -> Result<(), RepositoryError> {
        self.compare_and_put(
            CF_AUCTIONS,
            auction.id.0.as_bytes(),
            &auction,
            Some(expected_version),
            |stored: &Auction| stored.version,
        )
    }

    fn fetch(&self, id: &AuctionId) -> Result<Option<Auction>, RepositoryError> {
        self.get(CF_AUCTIONS, id.0.as_bytes())
    }

    fn latest_for_application(
        &self,
        id: &ApplicationId,
    ) -> Result<Option<Auction>, RepositoryError> {
        match self.get::<AuctionId>(CF_LATEST_AUCTION, id.0.as_bytes())? {
            Some(auction_id) => AuctionRepository::fetch(self, &auction_id),
            None => Ok(None),
        }
    }

    fn discard(&self, id: &AuctionId) -> Result<(), RepositoryError> {
        let _guard = self.writes.lock().expect("rocksdb write lock poisoned");
        let Some(removed) = AuctionRepository::fetch(self, id)? else {
            return Ok(());
        };
        let previous = self
            .scan::<Auction>(CF_AUCTIONS)?
            .into_iter()
            .filter(|auction| auction.id != removed.id)
            .filter(|auction| auction.application_id == removed.application_id)
            .max_by_key(|auction| auction.opened_at);

        let latest = self.cf(CF_LATEST_AUCTION)?;
        let key = removed.application_id.0.as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_AUCTIONS)?, id.0.as_bytes());
        match previous {
            Some(previous) => batch.put_cf(latest, key, encode(CF_LATEST_AUCTION, &previous.id)?),
            None => batch.delete_cf(latest, key),
        }
        self.db.write(batch).map_err(unavailable)
    }

    fn all(&self) -> Result<Vec<Auction>, RepositoryError> {
        self.scan(CF_AUCTIONS)
    }
}

impl PaymentRepository for RocksDbStore {
    fn insert(&self, payment: Payment) -> Result<Payment, RepositoryError> {
        self.insert_new(CF_PAYMENTS, payment.id.0.as_bytes(), &payment)?;
        Ok(payment)
    }

    fn update(&self, payment: Payment, expected_version: u64) -> Result<(), RepositoryError> {
        self.compare_and_put(
            CF_PAYMENTS,
            payment.id.0.as_bytes(),
            &payment,
            Some(expected_version),
            |stored: &Payment| stored.version,
        )
    }

    fn fetch(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError> {
        self.get(CF_PAYMENTS, id.0.as_bytes())
    }

    fn for_application(&self, id: &ApplicationId) -> Result<Vec<Payment>, RepositoryError> {
        Ok(self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .filter(|payment| &payment.application_id == id)
            .collect())
    }

    fn for_customer(&self, customer: &ActorId) -> Result<Vec<Payment>, RepositoryError> {
        Ok(self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .filter(|payment| &payment.customer == customer)
            .collect())
    }
}

impl InstallerRepository for RocksDbStore {
    fn insert_profile(
        &self,
        profile: InstallerProfile,
    ) -> Result<InstallerProfile, RepositoryError> {
        self.insert_new(CF_INSTALLERS, profile.id.0.as_bytes(), &profile)?;
        Ok(profile)
    }

    fn update_profile(&self, profile: InstallerProfile) -> Result<(), RepositoryError> {
        self.compare_and_put(CF_INSTALLERS, profile.id.0.as_bytes(), &profile, None, |_| 0)
    }

    fn fetch_profile(&self, id: &ActorId) -> Result<Option<InstallerProfile>, RepositoryError> {
        self.get(CF_INSTALLERS, id.0.as_bytes())
    }

    fn insert_package(
        &self,
        package: InstallerPackage,
    ) -> Result<InstallerPackage, RepositoryError> {
        self.insert_new(CF_PACKAGES, package.id.0.as_bytes(), &package)?;
        Ok(package)
    }

    fn update_package(&self, package: InstallerPackage) -> Result<(), RepositoryError> {
        self.compare_and_put(CF_PACKAGES, package.id.0.as_bytes(), &package, None, |_| 0)
    }

    fn fetch_package(&self, id: &PackageId) -> Result<Option<InstallerPackage>, RepositoryError> {
        self.get(CF_PACKAGES, id.0.as_bytes())
    }

    fn packages(&self) -> Result<Vec<InstallerPackage>, RepositoryError> {
        self.scan(CF_PACKAGES)
    }
}
