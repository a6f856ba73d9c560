use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use super::clock::Clock;
use super::domain::{Actor, ActorId, Amount, PackageId, Role};
use super::error::ProcurementError;
use super::repository::InstallerRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Rejected,
}

/// Installer organisation known to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerProfile {
    pub id: ActorId,
    pub organization: String,
    pub license_number: String,
    pub contact_email: String,
    pub status: VerificationStatus,
    pub registered_at: DateTime<Utc>,
    pub reviewed_by: Option<ActorId>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl InstallerProfile {
    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerRegistration {
    pub organization: String,
    pub license_number: String,
    pub contact_email: String,
}

/// Fixed-price offering a customer can buy instead of running an auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerPackage {
    pub id: PackageId,
    pub installer_id: ActorId,
    pub name: String,
    pub capacity_kw: Decimal,
    pub price: Amount,
    pub panels: String,
    pub warranty_years: u8,
    pub active: bool,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDraft {
    pub name: String,
    pub capacity_kw: Decimal,
    pub price: Amount,
    pub panels: String,
    pub warranty_years: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationDecision {
    Approve,
    Reject,
}

/// Installer onboarding and the fixed-package catalog.
pub struct InstallerRegistry {
    installers: Arc<dyn InstallerRepository>,
    clock: Arc<dyn Clock>,
    writes: Mutex<()>,
}

impl InstallerRegistry {
    pub fn new(installers: Arc<dyn InstallerRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            installers,
            clock,
            writes: Mutex::new(()),
        }
    }

    pub async fn register(
        &self,
        actor: &Actor,
        registration: InstallerRegistration,
    ) -> Result<InstallerProfile, ProcurementError> {
        if actor.role != Role::Installer {
            return Err(ProcurementError::Unauthorized(
                "only installer accounts can register an organisation".to_string(),
            ));
        }
        if registration.organization.trim().is_empty()
            || registration.license_number.trim().is_empty()
        {
            return Err(ProcurementError::InvalidInput(
                "organization and license_number are required".to_string(),
            ));
        }

        let _guard = self.writes.lock().await;
        if self.installers.fetch_profile(&actor.id)?.is_some() {
            return Err(ProcurementError::Conflict(format!(
                "installer {} is already registered",
                actor.id
            )));
        }

        let profile = InstallerProfile {
            id: actor.id.clone(),
            organization: registration.organization.trim().to_string(),
            license_number: registration.license_number.trim().to_string(),
            contact_email: registration.contact_email,
            status: VerificationStatus::Pending,
            registered_at: self.clock.now(),
            reviewed_by: None,
            reviewed_at: None,
        };
        let stored = self.installers.insert_profile(profile)?;
        info!(installer_id = %stored.id, "installer registered; awaiting verification");
        Ok(stored)
    }

    /// Officer decision on a pending installer.
    pub async fn verify(
        &self,
        actor: &Actor,
        installer_id: &ActorId,
        decision: VerificationDecision,
    ) -> Result<InstallerProfile, ProcurementError> {
        let _guard = self.writes.lock().await;
        let mut profile = self.profile(installer_id)?;
        if actor.role != Role::Officer {
            return Err(ProcurementError::Unauthorized(
                "only officers verify installers".to_string(),
            ));
        }
        if profile.status != VerificationStatus::Pending {
            return Err(ProcurementError::InvalidTransition(format!(
                "installer {installer_id} was already reviewed"
            )));
        }

        profile.status = match decision {
            VerificationDecision::Approve => VerificationStatus::Verified,
            VerificationDecision::Reject => VerificationStatus::Rejected,
        };
        profile.reviewed_by = Some(actor.id.clone());
        profile.reviewed_at = Some(self.clock.now());
        self.installers.update_profile(profile.clone())?;
        info!(installer_id = %installer_id, status = ?profile.status, "installer reviewed");
        Ok(profile)
    }

    pub fn profile(&self, installer_id: &ActorId) -> Result<InstallerProfile, ProcurementError> {
        self.installers
            .fetch_profile(installer_id)?
            .ok_or_else(|| ProcurementError::not_found(format!("installer {installer_id}")))
    }

    /// Fails with `Unauthorized` unless the actor is a verified installer.
    pub fn ensure_verified(&self, actor: &Actor) -> Result<InstallerProfile, ProcurementError> {
        if actor.role != Role::Installer {
            return Err(ProcurementError::Unauthorized(format!(
                "{} accounts cannot act as installers",
                actor.role.label()
            )));
        }
        match self.installers.fetch_profile(&actor.id)? {
            Some(profile) if profile.is_verified() => Ok(profile),
            _ => Err(ProcurementError::Unauthorized(format!(
                "installer {} is not verified",
                actor.id
            ))),
        }
    }

    pub async fn publish_package(
        &self,
        actor: &Actor,
        draft: PackageDraft,
    ) -> Result<InstallerPackage, ProcurementError> {
        self.ensure_verified(actor)?;
        if draft.name.trim().is_empty() {
            return Err(ProcurementError::InvalidInput(
                "package name is required".to_string(),
            ));
        }
        if draft.capacity_kw <= Decimal::ZERO {
            return Err(ProcurementError::InvalidInput(
                "package capacity must be greater than zero".to_string(),
            ));
        }

        let package = InstallerPackage {
            id: PackageId::generate(),
            installer_id: actor.id.clone(),
            name: draft.name.trim().to_string(),
            capacity_kw: draft.capacity_kw,
            price: draft.price,
            panels: draft.panels,
            warranty_years: draft.warranty_years,
            active: true,
            published_at: self.clock.now(),
        };
        let stored = self.installers.insert_package(package)?;
        info!(package_id = %stored.id, installer_id = %stored.installer_id, price = %stored.price, "package published");
        Ok(stored)
    }

    pub async fn set_package_active(
        &self,
        actor: &Actor,
        package_id: &PackageId,
        active: bool,
    ) -> Result<InstallerPackage, ProcurementError> {
        let _guard = self.writes.lock().await;
        let mut package = self
            .installers
            .fetch_package(package_id)?
            .ok_or_else(|| ProcurementError::not_found(format!("package {package_id}")))?;
        if !actor.is(Role::Installer, &package.installer_id) {
            return Err(ProcurementError::Unauthorized(
                "only the owning installer can change a package".to_string(),
            ));
        }
        package.active = active;
        self.installers.update_package(package.clone())?;
        Ok(package)
    }

    /// Active packages from verified installers, cheapest first.
    pub fn list_packages(&self) -> Result<Vec<InstallerPackage>, ProcurementError> {
        let mut packages = Vec::new();
        for package in self.installers.packages()? {
            if package.active && self.is_verified(&package.installer_id)? {
                packages.push(package);
            }
        }
        packages.sort_by(|left, right| left.price.cmp(&right.price));
        Ok(packages)
    }

    /// Resolve a package a customer may buy right now.
    pub fn purchasable(&self, package_id: &PackageId) -> Result<InstallerPackage, ProcurementError> {
        let package = self
            .installers
            .fetch_package(package_id)?
            .ok_or_else(|| ProcurementError::not_found(format!("package {package_id}")))?;
        if !package.active || !self.is_verified(&package.installer_id)? {
            return Err(ProcurementError::InvalidInput(format!(
                "package {package_id} is not currently offered"
            )));
        }
        Ok(package)
    }

    fn is_verified(&self, installer_id: &ActorId) -> Result<bool, ProcurementError> {
        Ok(self
            .installers
            .fetch_profile(installer_id)?
            .is_some_and(|profile| profile.is_verified()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::procurement::clock::ManualClock;
    use crate::workflows::procurement::error::ErrorKind;
    use crate::workflows::procurement::memory::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn registry() -> InstallerRegistry {
        let start = Utc
            .with_ymd_and_hms(2025, 4, 1, 9, 0, 0)
            .single()
            .expect("valid start");
        InstallerRegistry::new(
            Arc::new(MemoryStore::default()),
            Arc::new(ManualClock::new(start)),
        )
    }

    fn registration() -> InstallerRegistration {
        InstallerRegistration {
            organization: "Suryan Energy".to_string(),
            license_number: "SLSEA-0142".to_string(),
            contact_email: "ops@suryan.example".to_string(),
        }
    }

    fn draft(price: Decimal) -> PackageDraft {
        PackageDraft {
            name: "Starter 3".to_string(),
            capacity_kw: dec!(3),
            price: Amount::new(price).expect("positive price"),
            panels: "8 x 400 W".to_string(),
            warranty_years: 5,
        }
    }

    #[tokio::test]
    async fn registration_waits_for_an_officer() {
        let registry = registry();
        let installer = Actor::installer("suryan");

        let profile = registry
            .register(&installer, registration())
            .await
            .expect("register");
        assert_eq!(profile.status, VerificationStatus::Pending);
        assert_eq!(
            registry.ensure_verified(&installer).unwrap_err().kind(),
            ErrorKind::Unauthorized
        );

        let err = registry
            .verify(&installer, &installer.id, VerificationDecision::Approve)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let officer = Actor::officer("officer-1");
        let verified = registry
            .verify(&officer, &installer.id, VerificationDecision::Approve)
            .await
            .expect("verify");
        assert_eq!(verified.status, VerificationStatus::Verified);
        assert_eq!(verified.reviewed_by, Some(officer.id.clone()));
        assert!(registry.ensure_verified(&installer).is_ok());

        let again = registry
            .verify(&officer, &installer.id, VerificationDecision::Reject)
            .await
            .unwrap_err();
        assert_eq!(again.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let registry = registry();
        let installer = Actor::installer("suryan");
        registry
            .register(&installer, registration())
            .await
            .expect("register");

        let err = registry
            .register(&installer, registration())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let customer = Actor::customer("cust-1");
        let err = registry
            .register(&customer, registration())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn catalog_only_offers_active_packages_from_verified_installers() {
        let registry = registry();
        let officer = Actor::officer("officer-1");
        let installer = Actor::installer("suryan");
        registry
            .register(&installer, registration())
            .await
            .expect("register");

        let err = registry
            .publish_package(&installer, draft(dec!(900000)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        registry
            .verify(&officer, &installer.id, VerificationDecision::Approve)
            .await
            .expect("verify");
        let premium = registry
            .publish_package(&installer, draft(dec!(900000)))
            .await
            .expect("publish");
        let budget = registry
            .publish_package(&installer, draft(dec!(720000)))
            .await
            .expect("publish");

        let listed: Vec<PackageId> = registry
            .list_packages()
            .expect("list")
            .into_iter()
            .map(|package| package.id)
            .collect();
        assert_eq!(listed, vec![budget.id, premium.id]);

        let stranger = Actor::installer("other");
        let err = registry
            .set_package_active(&stranger, &budget.id, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        registry
            .set_package_active(&installer, &budget.id, false)
            .await
            .expect("deactivate");
        assert_eq!(registry.list_packages().expect("list").len(), 1);
        assert_eq!(
            registry.purchasable(&budget.id).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            registry.purchasable(&PackageId::generate()).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
