use std::sync::Arc;

use chrono::Duration;
use rust_decimal_macros::dec;

use super::common::*;
use crate::config::EngineConfig;
use crate::workflows::procurement::bidding::BidSubmission;
use crate::workflows::procurement::clock::Clock;
use crate::workflows::procurement::domain::{
    Actor, ApplicationStatus, AuctionState, BidId,
};
use crate::workflows::procurement::error::{ErrorKind, ProcurementError};
use crate::workflows::procurement::events::EventKind;
use crate::workflows::procurement::health::FaultKind;

fn bid(amount: rust_decimal::Decimal, days: u32) -> BidSubmission {
    BidSubmission {
        amount,
        timeline_days: days,
        message: "Tier-1 panels, 10 year workmanship warranty".to_string(),
    }
}

#[tokio::test]
async fn opening_requires_an_approved_application_owned_by_the_caller() {
    let h = Harness::new();
    let submitted = h.submitted().await;
    match h.service.open_auction(&customer(), &submitted.id, None, None).await {
        Err(ProcurementError::InvalidTransition(_)) => {}
        other => panic!("expected invalid transition, got {other:?}"),
    }

    let approved = h.approved_application().await;
    match h
        .service
        .open_auction(&Actor::customer("cust-2"), &approved.id, None, None)
        .await
    {
        Err(ProcurementError::Unauthorized(_)) => {}
        other => panic!("expected unauthorized, got {other:?}"),
    }
    assert!(h.timer.scheduled().is_empty());
}

#[tokio::test]
async fn open_auction_schedules_the_default_window() {
    let mut h = Harness::new();
    let approved = h.approved_application().await;
    h.outbox.drain();

    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open auction");

    assert_eq!(auction.state, AuctionState::Open);
    assert_eq!(auction.deadline, h.clock.now() + Duration::hours(48));
    let application = h.stored(&approved.id);
    assert_eq!(application.status, ApplicationStatus::ProcurementOpen);
    assert_eq!(application.active_auction, Some(auction.id));

    let scheduled = h.timer.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].auction_id, auction.id);
    assert_eq!(scheduled[0].deadline, auction.deadline);

    let kinds = h.event_kinds();
    assert!(matches!(
        kinds[0],
        EventKind::StatusChanged {
            to: ApplicationStatus::ProcurementOpen,
            ..
        }
    ));
    assert!(matches!(kinds[1], EventKind::AuctionOpened { .. }));
}

#[tokio::test]
async fn bids_require_a_verified_installer_and_valid_terms() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");

    let unverified = Actor::installer("inst-x");
    match h
        .service
        .submit_bid(&unverified, &auction.id, bid(dec!(680000), 14))
        .await
    {
        Err(ProcurementError::Unauthorized(_)) => {}
        other => panic!("expected unauthorized, got {other:?}"),
    }

    let installer = h.verified_installer("inst-a").await;
    match h
        .service
        .submit_bid(&installer, &auction.id, bid(dec!(0), 14))
        .await
    {
        Err(ProcurementError::InvalidInput(_)) => {}
        other => panic!("expected invalid input, got {other:?}"),
    }
    match h
        .service
        .submit_bid(&installer, &auction.id, bid(dec!(680000), 0))
        .await
    {
        Err(ProcurementError::InvalidInput(_)) => {}
        other => panic!("expected invalid input, got {other:?}"),
    }
    match h.service.submit_bid(&customer(), &auction.id, bid(dec!(1), 1)).await {
        Err(ProcurementError::Unauthorized(_)) => {}
        other => panic!("expected unauthorized, got {other:?}"),
    }
}

#[tokio::test]
async fn resubmitting_replaces_the_installers_bid() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");
    let installer = h.verified_installer("inst-a").await;

    h.service
        .submit_bid(&installer, &auction.id, bid(dec!(700000), 20))
        .await
        .expect("first bid");
    let revised = h
        .service
        .submit_bid(&installer, &auction.id, bid(dec!(690000), 18))
        .await
        .expect("revised bid");

    let current = h.service.auction(&auction.id).expect("auction");
    assert_eq!(current.bids.len(), 1);
    assert_eq!(current.bids[&installer.id], revised);
}

#[tokio::test]
async fn late_bid_expires_the_round_and_is_rejected() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");
    let installer = h.verified_installer("inst-a").await;

    h.clock.advance(Duration::hours(48) + Duration::seconds(1));
    match h
        .service
        .submit_bid(&installer, &auction.id, bid(dec!(680000), 14))
        .await
    {
        Err(ProcurementError::AuctionClosed(_)) => {}
        other => panic!("expected auction closed, got {other:?}"),
    }

    let closed = h.service.auction(&auction.id).expect("auction");
    assert_eq!(closed.state, AuctionState::ClosedExpired);
    assert!(closed.bids.is_empty());
    let application = h.stored(&approved.id);
    assert_eq!(application.status, ApplicationStatus::Approved);
    assert_eq!(application.active_auction, None);
    assert!(h.timer.scheduled()[0].cancelled);
}

#[tokio::test]
async fn bid_at_the_exact_deadline_is_late() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");
    let installer = h.verified_installer("inst-a").await;

    h.clock.advance(Duration::hours(48));
    assert_eq!(h.clock.now(), auction.deadline);
    match h
        .service
        .submit_bid(&installer, &auction.id, bid(dec!(680000), 14))
        .await
    {
        Err(ProcurementError::AuctionClosed(_)) => {}
        other => panic!("expected auction closed, got {other:?}"),
    }
    let closed = h.service.auction(&auction.id).expect("auction");
    assert_eq!(closed.state, AuctionState::ClosedExpired);
    assert!(closed.bids.is_empty());
}

#[tokio::test]
async fn accepting_after_a_missed_deadline_expires_the_round() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");
    let installer = h.verified_installer("inst-a").await;
    let placed = h
        .service
        .submit_bid(&installer, &auction.id, bid(dec!(680000), 14))
        .await
        .expect("bid");

    // The deadline callback never ran.
    h.clock.advance(Duration::hours(49));
    match h.service.accept_bid(&customer(), &auction.id, &placed.id).await {
        Err(ProcurementError::AuctionClosed(_)) => {}
        other => panic!("expected auction closed, got {other:?}"),
    }

    let closed = h.service.auction(&auction.id).expect("auction");
    assert_eq!(closed.state, AuctionState::ClosedExpired);
    assert_eq!(closed.accepted_bid, None);
    let application = h.stored(&approved.id);
    assert_eq!(application.status, ApplicationStatus::Approved);
    assert_eq!(application.active_auction, None);
    assert_eq!(application.selected_installer, None);
    assert!(h.timer.scheduled()[0].cancelled);
}

#[tokio::test]
async fn oversized_window_is_rejected_before_anything_changes() {
    let h = Harness::new();
    let approved = h.approved_application().await;

    match h
        .service
        .open_auction(
            &customer(),
            &approved.id,
            Some(Duration::hours(i64::from(u32::MAX))),
            None,
        )
        .await
    {
        Err(ProcurementError::InvalidInput(_)) => {}
        other => panic!("expected invalid input, got {other:?}"),
    }
    assert!(h.timer.scheduled().is_empty());
    let application = h.stored(&approved.id);
    assert_eq!(application.status, ApplicationStatus::Approved);
    assert_eq!(application.active_auction, None);
}

#[tokio::test]
async fn unbounded_sweep_interval_still_builds_a_working_engine() {
    let h = Harness::with_config(EngineConfig {
        sweep_interval: std::time::Duration::MAX,
        ..engine_config()
    });
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");
    assert_eq!(auction.state, AuctionState::Open);
    let report = h.service.sweep().await.expect("sweep");
    assert!(report.expired.is_empty());
}

#[tokio::test]
async fn deadline_callback_expires_once() {
    let mut h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");
    let installer = h.verified_installer("inst-a").await;
    h.service
        .submit_bid(&installer, &auction.id, bid(dec!(680000), 14))
        .await
        .expect("bid");
    h.outbox.drain();

    h.clock.advance(Duration::hours(48));
    assert_eq!(h.fire_due().await, vec![auction.id]);
    assert!(!h.service.on_deadline(&auction.id).await.expect("second call"));

    let application = h.stored(&approved.id);
    assert_eq!(application.status, ApplicationStatus::Approved);
    let last = application.history.last().expect("entry");
    assert_eq!(
        last.request_id.as_deref(),
        Some(format!("auction:{}:expired", auction.id).as_str())
    );

    let kinds = h.event_kinds();
    match &kinds[1] {
        EventKind::AuctionExpired { bidders, .. } => assert_eq!(bidders, &vec![installer.id]),
        other => panic!("expected expiry event, got {other:?}"),
    }
}

#[tokio::test]
async fn accepting_selects_the_installer_and_cancels_the_deadline() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");
    let first = h.verified_installer("inst-a").await;
    let second = h.verified_installer("inst-b").await;
    h.service
        .submit_bid(&first, &auction.id, bid(dec!(680000), 14))
        .await
        .expect("bid a");
    let chosen = h
        .service
        .submit_bid(&second, &auction.id, bid(dec!(655000), 21))
        .await
        .expect("bid b");

    let closed = h
        .service
        .accept_bid(&customer(), &auction.id, &chosen.id)
        .await
        .expect("accept");
    assert_eq!(closed.state, AuctionState::ClosedAccepted);
    assert_eq!(closed.accepted_bid, Some(chosen.id));
    assert!(h.timer.scheduled()[0].cancelled);

    let application = h.stored(&approved.id);
    assert_eq!(application.status, ApplicationStatus::InstallerSelected);
    assert_eq!(application.selected_installer, Some(second.id));
    assert_eq!(
        application.contract_amount.map(|amount| amount.value()),
        Some(dec!(655000))
    );

    match h.service.accept_bid(&customer(), &auction.id, &chosen.id).await {
        Err(ProcurementError::AuctionClosed(_)) => {}
        other => panic!("expected auction closed, got {other:?}"),
    }
    assert!(!h.service.on_deadline(&auction.id).await.expect("no-op"));
}

#[tokio::test]
async fn only_the_owner_accepts_and_only_known_bids() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");
    let installer = h.verified_installer("inst-a").await;
    let placed = h
        .service
        .submit_bid(&installer, &auction.id, bid(dec!(680000), 14))
        .await
        .expect("bid");

    match h
        .service
        .accept_bid(&Actor::customer("cust-2"), &auction.id, &placed.id)
        .await
    {
        Err(ProcurementError::Unauthorized(_)) => {}
        other => panic!("expected unauthorized, got {other:?}"),
    }
    match h
        .service
        .accept_bid(&customer(), &auction.id, &BidId::generate())
        .await
    {
        Err(ProcurementError::NotFound(_)) => {}
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_bidding_freezes_bids_but_keeps_the_deadline() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");

    match h.service.close_bidding(&customer(), &auction.id).await {
        Err(ProcurementError::InvalidInput(_)) => {}
        other => panic!("expected invalid input, got {other:?}"),
    }

    let installer = h.verified_installer("inst-a").await;
    h.service
        .submit_bid(&installer, &auction.id, bid(dec!(680000), 14))
        .await
        .expect("bid");
    let frozen = h
        .service
        .close_bidding(&customer(), &auction.id)
        .await
        .expect("close bidding");
    assert_eq!(frozen.state, AuctionState::AwaitingDecision);

    match h
        .service
        .submit_bid(&installer, &auction.id, bid(dec!(650000), 14))
        .await
    {
        Err(ProcurementError::AuctionClosed(_)) => {}
        other => panic!("expected auction closed, got {other:?}"),
    }

    h.clock.advance(Duration::hours(49));
    assert_eq!(h.fire_due().await, vec![auction.id]);
    assert_eq!(
        h.service.auction(&auction.id).expect("auction").state,
        AuctionState::ClosedExpired
    );
    assert_eq!(h.stored(&approved.id).status, ApplicationStatus::Approved);
}

#[tokio::test]
async fn schedule_failure_changes_nothing_and_alerts_operators() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    h.timer.fail_next("timer service offline");

    let error = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect_err("schedule fails");
    assert!(matches!(error, ProcurementError::Timer(_)));
    assert_eq!(error.kind(), ErrorKind::Unavailable);

    let application = h.stored(&approved.id);
    assert_eq!(application.status, ApplicationStatus::Approved);
    assert_eq!(application.version, approved.version);
    match h.service.auction_for(&customer(), &approved.id) {
        Err(ProcurementError::NotFound(_)) => {}
        other => panic!("expected no auction, got {other:?}"),
    }

    let report = h.service.health();
    assert_eq!(report.status, "degraded");
    assert_eq!(report.faults[0].kind, FaultKind::ScheduleFailed);
}

#[tokio::test]
async fn reopening_after_expiry_starts_a_new_round() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let first = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("first round");
    h.clock.advance(Duration::hours(48));
    h.fire_due().await;

    let second = h
        .service
        .open_auction(&customer(), &approved.id, Some(Duration::hours(24)), None)
        .await
        .expect("second round");
    assert_ne!(first.id, second.id);
    assert_eq!(second.deadline, h.clock.now() + Duration::hours(24));

    let latest = h
        .service
        .auction_for(&customer(), &approved.id)
        .expect("latest round");
    assert_eq!(latest.id, second.id);
    assert_eq!(h.stored(&approved.id).active_auction, Some(second.id));
}

#[tokio::test]
async fn replayed_open_request_returns_the_same_round() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let opened = h
        .service
        .open_auction(&customer(), &approved.id, None, Some("open-1"))
        .await
        .expect("open");
    let replay = h
        .service
        .open_auction(&customer(), &approved.id, None, Some("open-1"))
        .await
        .expect("replay");

    assert_eq!(opened.id, replay.id);
    assert_eq!(h.timer.scheduled().len(), 1);
}

#[tokio::test]
async fn sweeper_expires_missed_deadlines_and_reports_them() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");

    h.clock.advance(Duration::hours(50));
    let report = h.service.sweep().await.expect("sweep");
    assert_eq!(report.expired, vec![auction.id]);
    assert_eq!(h.stored(&approved.id).status, ApplicationStatus::Approved);
    assert!(h
        .health
        .faults()
        .iter()
        .any(|fault| fault.kind == FaultKind::MissedDeadline));

    let again = h.service.sweep().await.expect("second sweep");
    assert!(again.expired.is_empty() && again.reconciled.is_empty());
}

#[tokio::test]
async fn sweeper_reconciles_an_acceptance_the_store_missed() {
    let flaky = Arc::new(FlakyApplications::new(false));
    let h = Harness::with_flaky_applications(flaky.clone());
    let approved = h.approved_application().await;
    let auction = h
        .service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");
    let installer = h.verified_installer("inst-a").await;
    let placed = h
        .service
        .submit_bid(&installer, &auction.id, bid(dec!(680000), 14))
        .await
        .expect("bid");

    flaky.fail_next_updates(3);
    let accepted = h
        .service
        .accept_bid(&customer(), &auction.id, &placed.id)
        .await
        .expect("acceptance stands even when the application lags");
    assert_eq!(accepted.state, AuctionState::ClosedAccepted);
    assert_eq!(h.stored(&approved.id).status, ApplicationStatus::ProcurementOpen);
    assert!(h
        .health
        .faults()
        .iter()
        .any(|fault| fault.kind == FaultKind::ReconcileFailed));

    let report = h.service.sweep().await.expect("sweep");
    assert_eq!(report.reconciled, vec![auction.id]);
    let application = h.stored(&approved.id);
    assert_eq!(application.status, ApplicationStatus::InstallerSelected);
    assert_eq!(application.selected_installer, Some(installer.id));
}

#[tokio::test]
async fn recovery_rearms_live_deadlines() {
    let h = Harness::new();
    let approved = h.approved_application().await;
    h.service
        .open_auction(&customer(), &approved.id, None, None)
        .await
        .expect("open");

    let report = h.service.recover().await.expect("recover");
    assert_eq!(report.rescheduled, 1);
    assert!(report.sweep.expired.is_empty());
    assert_eq!(h.timer.scheduled().len(), 2);
}
