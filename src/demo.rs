use chrono::{DateTime, Duration, TimeZone, Utc};
use clap::Args;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use sunbid::config::EngineConfig;
use sunbid::error::AppError;
use sunbid::workflows::procurement::domain::{
    ApplicantDetails, ConnectionType, ConsumptionProfile, DocumentCategory, DocumentRef,
    Ownership, PropertyType, Shading, SiteDetails,
};
use sunbid::workflows::procurement::{
    export_audit_file, Actor, Amount, Application, ApplicationSubmission, BidSubmission, Clock,
    EngineHealth, EngineRuntime, EventBus, EventOutbox, InstallerRegistration, ManualClock,
    ManualTimer, MemoryStore, NotificationInbox, PackageDraft, PaymentRequest, PaymentType,
    ProcurementService, ReviewDecision, Stores, VerificationDecision,
};

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Write the audit trail of every demo application to this CSV file.
    #[arg(long)]
    pub(crate) audit_csv: Option<PathBuf>,
    /// Simulated start time (RFC 3339). Defaults to 2025-03-01T09:00:00Z.
    #[arg(long, value_parser = parse_instant)]
    pub(crate) start: Option<DateTime<Utc>>,
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|err| format!("failed to parse '{raw}' as RFC 3339 ({err})"))
}

struct DemoEngine {
    service: ProcurementService,
    clock: Arc<ManualClock>,
    timer: Arc<ManualTimer>,
    outbox: EventOutbox,
    inbox: NotificationInbox,
}

impl DemoEngine {
    fn new(start: DateTime<Utc>) -> Self {
        let clock = Arc::new(ManualClock::new(start));
        let timer = Arc::new(ManualTimer::default());
        let (events, outbox) = EventBus::channel();
        let service = ProcurementService::new(
            &EngineConfig::default(),
            Stores::shared(Arc::new(MemoryStore::default())),
            EngineRuntime {
                clock: clock.clone(),
                timer: timer.clone(),
                events,
                health: Arc::new(EngineHealth::default()),
            },
        );
        Self {
            service,
            clock,
            timer,
            outbox,
            inbox: NotificationInbox::default(),
        }
    }

    /// Jump the simulated clock and deliver whatever deadlines came due.
    async fn advance(&mut self, by: Duration) -> Result<(), AppError> {
        let now = self.clock.advance(by);
        println!("  ... {} hours later ({now})", by.num_hours());
        for auction_id in self.timer.take_due(now) {
            if self.service.on_deadline(&auction_id).await? {
                println!("  Deadline fired: auction {auction_id} expired");
            }
        }
        self.flush();
        Ok(())
    }

    fn flush(&mut self) {
        self.outbox.flush_to(&self.inbox);
    }

    async fn approved_application(&mut self, customer: &Actor) -> Result<Application, AppError> {
        let officer = officer();
        let application = self
            .service
            .submit_application(customer, submission(&customer.id.0))
            .await?;
        println!("- Submitted application {}", application.id);
        self.service
            .begin_review(&officer, &application.id, None)
            .await?;
        let visit = self.clock.now() + Duration::days(2);
        self.service
            .schedule_site_visit(&officer, &application.id, visit, None)
            .await?;
        let approved = self
            .service
            .decide(
                &officer,
                &application.id,
                ReviewDecision::Approve,
                Some("roof inspected; structure and orientation suitable".to_string()),
                None,
            )
            .await?;
        println!(
            "  Reviewed by {} -> {}",
            officer.id,
            approved.status.label()
        );
        self.flush();
        Ok(approved)
    }

    async fn verified_installer(&self, id: &str, organization: &str) -> Result<Actor, AppError> {
        let installer = Actor::installer(id);
        self.service
            .register_installer(
                &installer,
                InstallerRegistration {
                    organization: organization.to_string(),
                    license_number: format!("SLSEA-{}", id.to_ascii_uppercase()),
                    contact_email: format!("{id}@installers.example"),
                },
            )
            .await?;
        self.service
            .verify_installer(&officer(), &installer.id, VerificationDecision::Approve)
            .await?;
        Ok(installer)
    }
}

fn officer() -> Actor {
    Actor::officer("officer-demo")
}

fn submission(owner: &str) -> ApplicationSubmission {
    ApplicationSubmission {
        applicant: ApplicantDetails {
            full_name: format!("Demo customer {owner}"),
            national_id: "900000000V".to_string(),
            phone: "+94770000000".to_string(),
            email: format!("{owner}@customers.example"),
            address: "21 Hill Street, Kandy".to_string(),
        },
        site: SiteDetails {
            property_type: PropertyType::Residential,
            roof_type: "clay tile".to_string(),
            roof_area_sqm: dec!(55),
            roof_orientation: "north".to_string(),
            shading: Shading::Partial,
            ownership: Ownership::Owned,
            utility_account: format!("CEB-{owner}"),
        },
        consumption: ConsumptionProfile {
            monthly_kwh: dec!(400),
            monthly_bill: dec!(17500),
        },
        capacity_requested_kw: dec!(5),
        connection_type: ConnectionType::SinglePhase,
        existing_solar: false,
        documents: vec![
            DocumentRef {
                category: DocumentCategory::NationalId,
                file_ref: format!("docs/{owner}/nic.pdf"),
            },
            DocumentRef {
                category: DocumentCategory::UtilityBill,
                file_ref: format!("docs/{owner}/bill.pdf"),
            },
        ],
    }
}

fn bid(amount: Decimal, timeline_days: u32, message: &str) -> BidSubmission {
    BidSubmission {
        amount,
        timeline_days,
        message: message.to_string(),
    }
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let start = args.start.unwrap_or_else(|| {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    });
    let mut engine = DemoEngine::new(start);

    println!("Solar procurement demo (simulated clock from {start})");
    let volta = engine.verified_installer("volta", "Volta Rooftops").await?;
    let helio = engine.verified_installer("helio", "Helio Lanka").await?;
    println!("Verified installers: {}, {}", volta.id, helio.id);

    println!("\nScenario 1: review, auction, and accepted bid");
    let first_customer = Actor::customer("cust-amaya");
    let first = engine.approved_application(&first_customer).await?;
    let fee = engine
        .service
        .authorize_payment(&first.id, PaymentType::AuthorityFee);
    println!("  Authority fee authorization: {}", fee.reason.label());

    let auction = engine
        .service
        .open_auction(&first_customer, &first.id, None, None)
        .await?;
    println!(
        "  Auction {} open until {} ({} h window)",
        auction.id,
        auction.deadline,
        (auction.deadline - auction.opened_at).num_hours()
    );
    engine
        .service
        .submit_bid(&volta, &auction.id, bid(dec!(680000), 14, "tier-1 mono panels"))
        .await?;
    let chosen = engine
        .service
        .submit_bid(&helio, &auction.id, bid(dec!(655000), 21, "hybrid inverter included"))
        .await?;
    let current = engine.service.auction(&auction.id)?;
    for ranked in current.ranked_bids() {
        println!(
            "  Bid from {}: {} over {} days",
            ranked.installer_id, ranked.amount, ranked.timeline_days
        );
    }
    engine.advance(Duration::hours(20)).await?;
    let closed = engine
        .service
        .accept_bid(&first_customer, &auction.id, &chosen.id)
        .await?;
    let first = engine.service.application(&first_customer, &first.id)?;
    println!(
        "  Accepted bid from {} -> auction {}, application {}",
        helio.id,
        closed.state.label(),
        first.status.label()
    );
    let settlement = engine
        .service
        .authorize_payment(&first.id, PaymentType::BidSettlement);
    println!("  Bid settlement authorization: {}", settlement.reason.label());
    let payment = engine
        .service
        .create_payment(
            &first_customer,
            &first.id,
            PaymentRequest {
                payment_type: PaymentType::BidSettlement,
                package_id: None,
            },
        )
        .await?;
    println!("  Payment {} pending for {}", payment.id, payment.amount);
    engine.flush();

    println!("\nScenario 2: auction expires, customer buys a package instead");
    let second_customer = Actor::customer("cust-nuwan");
    let second = engine.approved_application(&second_customer).await?;
    let lapsed = engine
        .service
        .open_auction(&second_customer, &second.id, None, None)
        .await?;
    println!("  Auction {} opened with no bidders", lapsed.id);
    engine.advance(Duration::hours(48)).await?;
    let second = engine.service.application(&second_customer, &second.id)?;
    println!("  Application back to {}", second.status.label());

    let package = engine
        .service
        .publish_package(
            &volta,
            PackageDraft {
                name: "Volta Home 5".to_string(),
                capacity_kw: dec!(5),
                price: Amount::new(dec!(1150000))?,
                panels: "12 x 425 W mono PERC".to_string(),
                warranty_years: 10,
            },
        )
        .await?;
    let second = engine
        .service
        .select_package(&second_customer, &second.id, &package.id, None)
        .await?;
    println!(
        "  Selected package '{}' for {} -> {}",
        package.name,
        package.price,
        second.status.label()
    );
    engine.flush();

    println!("\nScenario 3: a second begin-review is rejected");
    let third_customer = Actor::customer("cust-ishara");
    let third = engine
        .service
        .submit_application(&third_customer, submission(&third_customer.id.0))
        .await?;
    engine
        .service
        .begin_review(&officer(), &third.id, None)
        .await?;
    match engine.service.begin_review(&officer(), &third.id, None).await {
        Ok(_) => println!("  Unexpected: review started twice"),
        Err(err) => println!("  Second review rejected ({}): {err}", err.kind().label()),
    }
    engine.flush();

    println!("\nNotifications");
    for recipient in [&first_customer, &second_customer, &volta, &helio] {
        let unread = engine.inbox.unread_count(&recipient.id);
        let latest = engine
            .inbox
            .for_recipient(&recipient.id)
            .last()
            .map(|note| note.title.clone())
            .unwrap_or_else(|| "none".to_string());
        println!("- {}: {unread} unread, latest '{latest}'", recipient.id);
    }

    if let Some(path) = args.audit_csv {
        let applications = engine.service.all_applications(&officer())?;
        let rows = export_audit_file(&path, &applications)?;
        println!("\nWrote {rows} audit rows to {}", path.display());
    }

    Ok(())
}
