use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use axum::response::Response;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal_macros::dec;
use serde_json::Value;

use crate::config::{EngineConfig, RetryPolicy};
use crate::workflows::procurement::clock::{Clock, ManualClock, ManualTimer};
use crate::workflows::procurement::domain::{
    Actor, ActorId, ApplicantDetails, Application, ApplicationId, ApplicationStatus,
    ApplicationSubmission, AuctionId, ConnectionType, ConsumptionProfile, DocumentCategory,
    DocumentRef, Ownership, PropertyType, Shading, SiteDetails, TransitionEntry,
};
use crate::workflows::procurement::events::{
    EventBus, EventKind, EventOutbox, HookError, NotificationHook, ProcurementEvent,
};
use crate::workflows::procurement::health::EngineHealth;
use crate::workflows::procurement::installers::{InstallerRegistration, VerificationDecision};
use crate::workflows::procurement::lifecycle::{LifecycleAction, ReviewDecision};
use crate::workflows::procurement::memory::MemoryStore;
use crate::workflows::procurement::repository::{
    ApplicationRepository, RepositoryError, Stores,
};
use crate::workflows::procurement::service::{EngineRuntime, ProcurementService};

pub(crate) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0)
        .single()
        .expect("valid instant")
}

pub(crate) fn customer() -> Actor {
    Actor::customer("cust-1")
}

pub(crate) fn officer() -> Actor {
    Actor::officer("officer-1")
}

pub(crate) fn engine_config() -> EngineConfig {
    EngineConfig {
        store_retry: RetryPolicy {
            attempts: 3,
            backoff: StdDuration::from_millis(1),
        },
        ..EngineConfig::default()
    }
}

pub(crate) fn submission() -> ApplicationSubmission {
    ApplicationSubmission {
        applicant: ApplicantDetails {
            full_name: "Nimal Perera".to_string(),
            national_id: "851234567V".to_string(),
            phone: "+94771234567".to_string(),
            email: "nimal@example.com".to_string(),
            address: "12 Lake Road, Kandy".to_string(),
        },
        site: SiteDetails {
            property_type: PropertyType::Residential,
            roof_type: "concrete slab".to_string(),
            roof_area_sqm: dec!(60),
            roof_orientation: "north".to_string(),
            shading: Shading::Partial,
            ownership: Ownership::Owned,
            utility_account: "CEB-0045521".to_string(),
        },
        consumption: ConsumptionProfile {
            monthly_kwh: dec!(420),
            monthly_bill: dec!(18500),
        },
        capacity_requested_kw: dec!(5),
        connection_type: ConnectionType::SinglePhase,
        existing_solar: false,
        documents: vec![
            DocumentRef {
                category: DocumentCategory::NationalId,
                file_ref: "docs/cust-1/nic.pdf".to_string(),
            },
            DocumentRef {
                category: DocumentCategory::UtilityBill,
                file_ref: "docs/cust-1/bill.pdf".to_string(),
            },
        ],
    }
}

/// A freshly submitted record, for exercising stores directly.
pub(crate) fn application(owner: &Actor) -> Application {
    let now = start();
    Application {
        id: ApplicationId::generate(),
        owner: owner.id.clone(),
        status: ApplicationStatus::Submitted,
        submission: submission(),
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
            actor: owner.clone(),
            action: LifecycleAction::Submit,
            from: None,
            to: ApplicationStatus::Submitted,
            request_id: None,
        }],
    }
}

/// Service wired to manual time, a manual timer, and in-memory stores.
pub(crate) struct Harness {
    pub(crate) service: Arc<ProcurementService>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) timer: Arc<ManualTimer>,
    pub(crate) health: Arc<EngineHealth>,
    pub(crate) outbox: EventOutbox,
    pub(crate) store: MemoryStore,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(engine_config())
    }

    pub(crate) fn with_config(config: EngineConfig) -> Self {
        let store = MemoryStore::default();
        Self::build(&config, Stores::shared(Arc::new(store.clone())), store)
    }

    /// Application writes go through `flaky`; everything else hits its inner store.
    pub(crate) fn with_flaky_applications(flaky: Arc<FlakyApplications>) -> Self {
        let store = flaky.inner.clone();
        let mut stores = Stores::shared(Arc::new(store.clone()));
        stores.applications = flaky;
        Self::build(&engine_config(), stores, store)
    }

    fn build(config: &EngineConfig, stores: Stores, store: MemoryStore) -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let timer = Arc::new(ManualTimer::default());
        let health = Arc::new(EngineHealth::default());
        let (events, outbox) = EventBus::channel();
        let service = ProcurementService::new(
            config,
            stores,
            EngineRuntime {
                clock: clock.clone(),
                timer: timer.clone(),
                events,
                health: health.clone(),
            },
        );
        Self {
            service: Arc::new(service),
            clock,
            timer,
            health,
            outbox,
            store,
        }
    }

    pub(crate) async fn submitted(&self) -> Application {
        self.service
            .submit_application(&customer(), submission())
            .await
            .expect("submit application")
    }

    pub(crate) async fn approved_application(&self) -> Application {
        let application = self.submitted().await;
        let officer = officer();
        self.service
            .begin_review(&officer, &application.id, None)
            .await
            .expect("begin review");
        self.service
            .schedule_site_visit(
                &officer,
                &application.id,
                self.clock.now() + Duration::days(2),
                None,
            )
            .await
            .expect("schedule site visit");
        self.service
            .decide(
                &officer,
                &application.id,
                ReviewDecision::Approve,
                Some("roof is sound".to_string()),
                None,
            )
            .await
            .expect("approve")
    }

    pub(crate) async fn verified_installer(&self, id: &str) -> Actor {
        let installer = Actor::installer(id);
        self.service
            .register_installer(
                &installer,
                InstallerRegistration {
                    organization: format!("{id} Solar"),
                    license_number: format!("LIC-{id}"),
                    contact_email: format!("{id}@example.com"),
                },
            )
            .await
            .expect("register installer");
        self.service
            .verify_installer(&officer(), &installer.id, VerificationDecision::Approve)
            .await
            .expect("verify installer");
        installer
    }

    /// Deliver every due, uncancelled deadline the way the worker would.
    pub(crate) async fn fire_due(&self) -> Vec<AuctionId> {
        let due = self.timer.take_due(self.clock.now());
        for auction_id in &due {
            self.service
                .on_deadline(auction_id)
                .await
                .expect("deadline callback");
        }
        due
    }

    pub(crate) fn stored(&self, id: &ApplicationId) -> Application {
        ApplicationRepository::fetch(&self.store, id)
            .expect("fetch")
            .expect("application present")
    }

    pub(crate) fn event_kinds(&mut self) -> Vec<EventKind> {
        self.outbox
            .drain()
            .into_iter()
            .map(|event| event.kind)
            .collect()
    }
}

/// How one injected `update` failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outage {
    /// Reported as `Unavailable`; nothing was written.
    Lost,
    /// The write lands, then `Unavailable` is reported anyway.
    AppliedThenLost,
}

/// Application repository that fails scripted `update` and `fetch` calls.
pub(crate) struct FlakyApplications {
    pub(crate) inner: MemoryStore,
    outages: Mutex<VecDeque<Outage>>,
    fetches: Mutex<VecDeque<bool>>,
    apply_before_failing: bool,
}

impl FlakyApplications {
    pub(crate) fn new(apply_before_failing: bool) -> Self {
        Self {
            inner: MemoryStore::default(),
            outages: Mutex::new(VecDeque::new()),
            fetches: Mutex::new(VecDeque::new()),
            apply_before_failing,
        }
    }

    pub(crate) fn fail_next_updates(&self, count: u32) {
        let outage = if self.apply_before_failing {
            Outage::AppliedThenLost
        } else {
            Outage::Lost
        };
        self.script_updates((0..count).map(|_| outage));
    }

    pub(crate) fn script_updates(&self, outages: impl IntoIterator<Item = Outage>) {
        let mut queue = self.outages.lock().expect("flaky mutex poisoned");
        queue.clear();
        queue.extend(outages);
    }

    /// `true` fails that fetch; once the script runs out every fetch succeeds.
    pub(crate) fn script_fetches(&self, failures: impl IntoIterator<Item = bool>) {
        let mut queue = self.fetches.lock().expect("flaky mutex poisoned");
        queue.clear();
        queue.extend(failures);
    }
}

impl ApplicationRepository for FlakyApplications {
    fn insert(&self, record: Application) -> Result<Application, RepositoryError> {
        ApplicationRepository::insert(&self.inner, record)
    }

    fn update(&self, record: Application, expected_version: u64) -> Result<(), RepositoryError> {
        let outage = self.outages.lock().expect("flaky mutex poisoned").pop_front();
        match outage {
            None => ApplicationRepository::update(&self.inner, record, expected_version),
            Some(Outage::Lost) => Err(RepositoryError::Unavailable("injected outage".to_string())),
            Some(Outage::AppliedThenLost) => {
                ApplicationRepository::update(&self.inner, record, expected_version)?;
                Err(RepositoryError::Unavailable("injected outage".to_string()))
            }
        }
    }

    fn fetch(&self, id: &ApplicationId) -> Result<Option<Application>, RepositoryError> {
        let fail = self
            .fetches
            .lock()
            .expect("flaky mutex poisoned")
            .pop_front()
            .unwrap_or(false);
        if fail {
            return Err(RepositoryError::Unavailable("injected read outage".to_string()));
        }
        ApplicationRepository::fetch(&self.inner, id)
    }

    fn by_owner(&self, owner: &ActorId) -> Result<Vec<Application>, RepositoryError> {
        ApplicationRepository::by_owner(&self.inner, owner)
    }

    fn all(&self) -> Result<Vec<Application>, RepositoryError> {
        ApplicationRepository::all(&self.inner)
    }
}

/// Application repository that cannot be read at all.
pub(crate) struct OfflineApplications;

impl ApplicationRepository for OfflineApplications {
    fn insert(&self, _record: Application) -> Result<Application, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn update(&self, _record: Application, _expected: u64) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch(&self, _id: &ApplicationId) -> Result<Option<Application>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn by_owner(&self, _owner: &ActorId) -> Result<Vec<Application>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn all(&self) -> Result<Vec<Application>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

#[derive(Default)]
pub(crate) struct RecordingHook {
    events: Mutex<Vec<ProcurementEvent>>,
}

impl RecordingHook {
    pub(crate) fn events(&self) -> Vec<ProcurementEvent> {
        self.events.lock().expect("hook mutex poisoned").clone()
    }
}

impl NotificationHook for RecordingHook {
    fn emit(&self, event: &ProcurementEvent) -> Result<(), HookError> {
        self.events
            .lock()
            .expect("hook mutex poisoned")
            .push(event.clone());
        Ok(())
    }
}

pub(crate) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
