use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta, Weekday};
use tempfile::TempDir;
use ulid::Ulid;

use super::*;
use crate::clock::ManualClock;
use crate::model::*;
use crate::notify::{BookingNotice, NotifyHub};

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
}

fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
    date.and_hms_opt(h, m, 0).unwrap()
}

/// Sunday 08:00, the day before the Monday schedule.
fn sunday_morning() -> NaiveDateTime {
    at(NaiveDate::from_ymd_opt(2024, 6, 9).unwrap(), 8, 0)
}

struct Fixture {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    admin: Actor,
    rule_id: Ulid,
    path: PathBuf,
    _dir: TempDir,
}

impl Fixture {
    /// Rules mode with Mondays 09:00-12:00 in 60-minute slots.
    async fn rules() -> Self {
        let fx = Self::open(AvailabilityMode::Rules).await;
        let rule = AvailabilityRule {
            id: fx.rule_id,
            recurrence: Recurrence::Weekly(vec![Weekday::Mon]),
            span: Span::hm((9, 0), (12, 0)),
            slot_minutes: 60,
            active: true,
        };
        fx.engine.put_rule(&fx.admin, rule).await.unwrap();
        fx
    }

    async fn open(mode: AvailabilityMode) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenant.wal");
        let clock = Arc::new(ManualClock::new(sunday_morning()));
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), mode, clock.clone()).unwrap();
        Self {
            engine: Arc::new(engine),
            clock,
            admin: Actor::admin("coach"),
            rule_id: Ulid::new(),
            path,
            _dir: dir,
        }
    }

    fn reopen(&self) -> Engine {
        Engine::new(
            self.path.clone(),
            Arc::new(NotifyHub::new()),
            self.engine.mode(),
            self.clock.clone(),
        )
        .unwrap()
    }

    fn request(&self, h: u32) -> BookingRequest {
        BookingRequest {
            id: Ulid::new(),
            date: monday(),
            span: Span::hm((h, 0), (h + 1, 0)),
            block_id: self.rule_id,
            pricing_item_id: None,
            note: None,
        }
    }

    async fn fund(&self, user: &str, amount: Credits) {
        self.engine
            .record_purchase(user, amount, &format!("pay_{}", Ulid::new()))
            .await
            .unwrap();
    }
}

async fn ledger_sum(engine: &Engine, admin: &Actor, user: &str) -> Credits {
    engine
        .credit_history(admin, user, usize::MAX)
        .await
        .unwrap()
        .iter()
        .map(|t| t.amount)
        .sum()
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn booking_debits_and_hides_the_slot() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;

    let r = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(r.credits_used, 1);
    assert_eq!(r.source, SlotRef::Block(fx.rule_id));
    assert_eq!(fx.engine.balance(&ana, "ana").await.unwrap(), 4);

    let client_view = fx.engine.availability(&ana, monday(), monday()).await.unwrap();
    let starts: Vec<_> = client_view.iter().map(|s| s.span.start).collect();
    assert_eq!(starts, vec![Span::hm((10, 0), (11, 0)).start, Span::hm((11, 0), (12, 0)).start]);

    let admin_view = fx.engine.availability(&fx.admin, monday(), monday()).await.unwrap();
    assert_eq!(admin_view.len(), 3);
    assert!(!admin_view[0].is_available);
    assert_eq!(admin_view[0].reserved_by.as_deref(), Some("ana"));
}

#[tokio::test]
async fn concurrent_bookings_for_one_slot_yield_one_winner() {
    let fx = Fixture::rules().await;
    for i in 0..10 {
        fx.fund(&format!("u{i}"), 5).await;
    }

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = fx.engine.clone();
        let request = fx.request(9);
        handles.push(tokio::spawn(async move {
            let actor = Actor::client(format!("u{i}"));
            engine.create_reservation(&actor, request).await
        }));
    }

    let mut winners = 0;
    let mut taken = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::SlotAlreadyTaken { .. }) => taken += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(taken, 9);

    let total: Credits = {
        let mut sum = 0;
        for i in 0..10 {
            sum += fx.engine.balance(&fx.admin, &format!("u{i}")).await.unwrap();
        }
        sum
    };
    assert_eq!(total, 49);
}

#[tokio::test]
async fn one_credit_cannot_pay_for_two_concurrent_bookings() {
    let fx = Fixture::rules().await;
    fx.fund("ana", 1).await;

    let mut handles = Vec::new();
    for h in [9, 10] {
        let engine = fx.engine.clone();
        let request = fx.request(h);
        handles.push(tokio::spawn(async move {
            engine.create_reservation(&Actor::client("ana"), request).await
        }));
    }

    let mut booked = 0;
    let mut short = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => booked += 1,
            Err(EngineError::InsufficientCredits { required: 1, available: 0 }) => short += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(booked, 1);
    assert_eq!(short, 1);
    assert_eq!(fx.engine.balance(&fx.admin, "ana").await.unwrap(), 0);
    assert_eq!(ledger_sum(&fx.engine, &fx.admin, "ana").await, 0);
}

#[tokio::test]
async fn insufficient_credits_leaves_nothing_behind() {
    let fx = Fixture::rules().await;
    let bob = Actor::client("bob");

    let err = fx.engine.create_reservation(&bob, fx.request(9)).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientCredits { required: 1, available: 0 }));
    assert!(fx.engine.reservations_for_user(&bob, "bob").await.unwrap().is_empty());
    assert!(fx.engine.credit_history(&bob, "bob", 10).await.unwrap().is_empty());

    let view = fx.engine.availability(&bob, monday(), monday()).await.unwrap();
    assert_eq!(view.len(), 3);
}

#[tokio::test]
async fn duplicate_request_id_is_rejected() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;

    let request = fx.request(9);
    fx.engine.create_reservation(&ana, request.clone()).await.unwrap();
    let mut retry = request;
    retry.span = Span::hm((10, 0), (11, 0));
    let err = fx.engine.create_reservation(&ana, retry).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    assert_eq!(fx.engine.balance(&ana, "ana").await.unwrap(), 4);
}

#[tokio::test]
async fn off_grid_and_past_intervals_are_not_bookable() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;

    let mut off_grid = fx.request(9);
    off_grid.span = Span::hm((9, 30), (10, 30));
    let err = fx.engine.create_reservation(&ana, off_grid).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotNotBookable(_)));

    fx.clock.set(at(monday(), 9, 30));
    let err = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotNotBookable(_)));
    fx.engine.create_reservation(&ana, fx.request(10)).await.unwrap();
}

#[tokio::test]
async fn blocked_override_removes_candidates() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;

    let block = DateOverride {
        id: Ulid::new(),
        date: monday(),
        span: Span::hm((9, 0), (10, 0)),
        blocked: true,
        slot_minutes: 0,
    };
    fx.engine.add_override(&fx.admin, block).await.unwrap();

    let err = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotNotBookable(_)));
    let view = fx.engine.availability(&ana, monday(), monday()).await.unwrap();
    assert_eq!(view.len(), 2);
}

#[tokio::test]
async fn pricing_item_sets_the_cost() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;

    let item = PricingItem { id: Ulid::new(), name: "double session".into(), credits: 3, active: true };
    fx.engine.put_pricing_item(&fx.admin, item.clone()).await.unwrap();

    let mut request = fx.request(9);
    request.pricing_item_id = Some(item.id);
    let r = fx.engine.create_reservation(&ana, request).await.unwrap();
    assert_eq!(r.credits_used, 3);
    assert_eq!(fx.engine.balance(&ana, "ana").await.unwrap(), 2);

    fx.engine.deactivate_pricing_item(&fx.admin, item.id).await.unwrap();
    let mut request = fx.request(10);
    request.pricing_item_id = Some(item.id);
    let err = fx.engine.create_reservation(&ana, request).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn completed_status_is_derived_after_the_session() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;

    let r = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
    fx.clock.set(at(monday(), 10, 0));
    let read = fx.engine.get_reservation(&ana, r.id).await.unwrap();
    assert_eq!(read.status, ReservationStatus::Completed);
}

#[tokio::test]
async fn finished_sessions_cannot_be_cancelled() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;

    let r = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
    fx.clock.set(at(monday(), 13, 0));

    let err = fx.engine.refund_preview(&ana, r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyCompleted(id) if id == r.id));
    let err = fx.engine.cancel_reservation(&ana, r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyCompleted(_)));
    let err = fx
        .engine
        .admin_cancel_reservation(&fx.admin, r.id, Some(true))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyCompleted(_)));

    let read = fx.engine.get_reservation(&ana, r.id).await.unwrap();
    assert_eq!(read.status, ReservationStatus::Completed);
    assert_eq!(fx.engine.balance(&ana, "ana").await.unwrap(), 4);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn partial_refund_rounds_down() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;
    fx.engine
        .set_policy(&fx.admin, 24, Some(PartialRefund { hours: 12, percentage: 50 }), 0)
        .await
        .unwrap();

    let item = PricingItem { id: Ulid::new(), name: "pair".into(), credits: 2, active: true };
    fx.engine.put_pricing_item(&fx.admin, item.clone()).await.unwrap();
    let mut request = fx.request(10);
    request.pricing_item_id = Some(item.id);
    let r = fx.engine.create_reservation(&ana, request).await.unwrap();

    // Sunday 14:00 is 20 hours before Monday 10:00.
    fx.clock.set(at(NaiveDate::from_ymd_opt(2024, 6, 9).unwrap(), 14, 0));
    let preview = fx.engine.refund_preview(&ana, r.id).await.unwrap();
    assert_eq!(preview.hours_until_start, 20.0);
    assert_eq!(preview.refund_percentage, 50);
    assert_eq!(preview.refund_amount, 1);
    assert_eq!(preview.policy_applied.tier, RefundTier::Partial);

    let result = fx.engine.cancel_reservation(&ana, r.id).await.unwrap();
    assert_eq!(result.refund_amount, preview.refund_amount);
    assert_eq!(result.refund_percentage, preview.refund_percentage);
    assert_eq!(result.policy_applied, preview.policy_applied);
    assert_eq!(fx.engine.balance(&ana, "ana").await.unwrap(), 4);
}

#[tokio::test]
async fn default_policy_refunds_in_full_a_day_ahead() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 3).await;

    let r = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
    let result = fx.engine.cancel_reservation(&ana, r.id).await.unwrap();
    assert_eq!(result.refund_percentage, 100);
    assert_eq!(result.policy_applied, AppliedPolicy { policy_id: None, tier: RefundTier::Full });
    assert_eq!(fx.engine.balance(&ana, "ana").await.unwrap(), 3);

    // The slot is bookable again.
    fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
}

#[tokio::test]
async fn cancelling_twice_refunds_once() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 2).await;

    let r = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
    fx.engine.cancel_reservation(&ana, r.id).await.unwrap();
    let err = fx.engine.cancel_reservation(&ana, r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyCancelled(_)));
    let err = fx.engine.refund_preview(&ana, r.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyCancelled(_)));

    let refunds = fx
        .engine
        .credit_history(&ana, "ana", 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionType::Refund)
        .count();
    assert_eq!(refunds, 1);
    assert_eq!(fx.engine.balance(&ana, "ana").await.unwrap(), 2);
}

#[tokio::test]
async fn admin_overrides_charge_and_refund() {
    let fx = Fixture::rules().await;
    fx.fund("ana", 4).await;

    let free = fx
        .engine
        .admin_create_reservation(&fx.admin, "ana", fx.request(9), Some(false))
        .await
        .unwrap();
    assert_eq!(free.credits_used, 0);
    assert_eq!(free.user_id, "ana");

    let paid = fx
        .engine
        .admin_create_reservation(&fx.admin, "ana", fx.request(10), None)
        .await
        .unwrap();
    assert_eq!(paid.credits_used, 1);

    // Inside the no-refund window, an admin can still refund in full.
    fx.clock.set(at(monday(), 8, 0));
    let result = fx
        .engine
        .admin_cancel_reservation(&fx.admin, paid.id, Some(true))
        .await
        .unwrap();
    assert_eq!(result.refund_amount, 1);
    assert_eq!(result.policy_applied.policy_id, None);

    let paid_again = fx
        .engine
        .admin_create_reservation(&fx.admin, "ana", fx.request(11), None)
        .await
        .unwrap();
    fx.clock.set(sunday_morning());
    let result = fx
        .engine
        .admin_cancel_reservation(&fx.admin, paid_again.id, Some(false))
        .await
        .unwrap();
    assert_eq!(result.refund_amount, 0);
    assert_eq!(result.policy_applied.tier, RefundTier::None);
    assert_eq!(fx.engine.balance(&fx.admin, "ana").await.unwrap(), 3);
}

// ── Authorization ────────────────────────────────────────

#[tokio::test]
async fn clients_cannot_touch_other_users_or_admin_surfaces() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    let bob = Actor::client("bob");
    fx.fund("ana", 2).await;

    let r = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
    assert!(matches!(
        fx.engine.cancel_reservation(&bob, r.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        fx.engine.refund_preview(&bob, r.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(fx.engine.balance(&bob, "ana").await, Err(EngineError::Forbidden(_))));
    assert!(matches!(
        fx.engine.admin_create_reservation(&bob, "bob", fx.request(10), Some(false)).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        fx.engine.set_policy(&bob, 0, None, 0).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        fx.engine.adjust_credits(&bob, "bob", 100, None).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        fx.engine.reservations_in_range(&bob, monday(), monday()).await,
        Err(EngineError::Forbidden(_))
    ));
}

// ── Ledger ───────────────────────────────────────────────

#[tokio::test]
async fn balance_always_equals_ledger_sum() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 10).await;
    fx.engine.adjust_credits(&fx.admin, "ana", -2, Some("no-show".into())).await.unwrap();

    let a = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
    fx.engine.create_reservation(&ana, fx.request(10)).await.unwrap();
    fx.engine.cancel_reservation(&ana, a.id).await.unwrap();

    let balance = fx.engine.balance(&ana, "ana").await.unwrap();
    assert_eq!(balance, 7);
    assert_eq!(ledger_sum(&fx.engine, &fx.admin, "ana").await, balance);
}

#[tokio::test]
async fn purchases_are_idempotent_per_payment() {
    let fx = Fixture::rules().await;
    let first = fx.engine.record_purchase("ana", 5, "pay_1").await.unwrap();
    let retry = fx.engine.record_purchase("ana", 5, "pay_1").await.unwrap();
    assert_eq!(first.id, retry.id);
    fx.engine.record_plan_purchase("ana", 8, "pay_1").await.unwrap();
    assert_eq!(fx.engine.balance(&fx.admin, "ana").await.unwrap(), 13);

    assert!(matches!(
        fx.engine.record_purchase("ana", 0, "pay_2").await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        fx.engine.adjust_credits(&fx.admin, "ana", 0, None).await,
        Err(EngineError::Validation(_))
    ));
}

// ── Curated slots ────────────────────────────────────────

#[tokio::test]
async fn curated_slot_lifecycle() {
    let fx = Fixture::open(AvailabilityMode::Slots).await;
    let ana = Actor::client("ana");
    let bob = Actor::client("bob");
    fx.fund("ana", 3).await;
    fx.fund("bob", 3).await;

    let slot_id = Ulid::new();
    let span = Span::hm((9, 0), (10, 0));
    let slot = fx
        .engine
        .create_slot(&fx.admin, slot_id, monday(), span, None)
        .await
        .unwrap();
    assert_eq!(slot.status, SlotStatus::Locked);

    let request = |id: Ulid| BookingRequest {
        id,
        date: monday(),
        span,
        block_id: slot_id,
        pricing_item_id: None,
        note: None,
    };

    assert!(fx.engine.availability(&ana, monday(), monday()).await.unwrap().is_empty());
    let err = fx.engine.create_reservation(&ana, request(Ulid::new())).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotNotBookable(_)));

    fx.engine
        .update_slot_status(&fx.admin, slot_id, SlotStatus::Unlocked)
        .await
        .unwrap();
    assert_eq!(fx.engine.availability(&ana, monday(), monday()).await.unwrap().len(), 1);

    let r = fx.engine.create_reservation(&ana, request(Ulid::new())).await.unwrap();
    assert_eq!(r.source, SlotRef::Slot(slot_id));
    let slots = fx.engine.slots_in_range(&fx.admin, monday(), monday()).await.unwrap();
    assert_eq!(slots[0].status, SlotStatus::Reserved);
    assert_eq!(slots[0].assigned_user.as_deref(), Some("ana"));

    let err = fx.engine.create_reservation(&bob, request(Ulid::new())).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotAlreadyTaken { .. }));
    let err = fx.engine.delete_slot(&fx.admin, slot_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    fx.engine.cancel_reservation(&ana, r.id).await.unwrap();
    let slots = fx.engine.slots_in_range(&fx.admin, monday(), monday()).await.unwrap();
    assert_eq!(slots[0].status, SlotStatus::Cancelled);

    // Cancelled slots go back to clients only through an admin.
    let err = fx.engine.create_reservation(&bob, request(Ulid::new())).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotNotBookable(_)));
    let reassigned = fx
        .engine
        .admin_create_reservation(&fx.admin, "bob", request(Ulid::new()), None)
        .await
        .unwrap();
    assert_eq!(reassigned.user_id, "bob");
    assert_eq!(fx.engine.balance(&bob, "bob").await.unwrap(), 2);
}

#[tokio::test]
async fn slot_transitions_follow_the_state_machine() {
    let fx = Fixture::open(AvailabilityMode::Slots).await;
    let id = Ulid::new();
    fx.engine
        .create_slot(&fx.admin, id, monday(), Span::hm((9, 0), (10, 0)), None)
        .await
        .unwrap();

    let err = fx
        .engine
        .update_slot_status(&fx.admin, id, SlotStatus::Reserved)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    let dup = fx
        .engine
        .create_slot(&fx.admin, Ulid::new(), monday(), Span::hm((9, 0), (9, 30)), None)
        .await
        .unwrap_err();
    assert!(matches!(dup, EngineError::AlreadyExists(_)));

    fx.engine.update_slot_status(&fx.admin, id, SlotStatus::Blocked).await.unwrap();
    let err = fx.engine.delete_slot(&fx.admin, id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));
    fx.engine.update_slot_status(&fx.admin, id, SlotStatus::Unlocked).await.unwrap();
    fx.engine.delete_slot(&fx.admin, id).await.unwrap();
    assert!(fx.engine.slots_in_range(&fx.admin, monday(), monday()).await.unwrap().is_empty());
}

#[tokio::test]
async fn week_template_skips_existing_starts() {
    let fx = Fixture::open(AvailabilityMode::Slots).await;
    let template = vec![
        SlotTemplate { weekday: Weekday::Mon, span: Span::hm((9, 0), (10, 0)) },
        SlotTemplate { weekday: Weekday::Mon, span: Span::hm((9, 0), (10, 0)) },
        SlotTemplate { weekday: Weekday::Wed, span: Span::hm((18, 0), (19, 0)) },
    ];

    let created = fx.engine.apply_week_template(&fx.admin, monday(), &template).await.unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[1].date, NaiveDate::from_ymd_opt(2024, 6, 12).unwrap());
    assert!(created.iter().all(|s| s.status == SlotStatus::Locked));

    let again = fx.engine.apply_week_template(&fx.admin, monday(), &template).await.unwrap();
    assert!(again.is_empty());

    let tuesday = monday() + TimeDelta::days(1);
    let err = fx.engine.apply_week_template(&fx.admin, tuesday, &template).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_bookings_and_ledger() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;
    let kept = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
    let dropped = fx.engine.create_reservation(&ana, fx.request(10)).await.unwrap();
    fx.engine.cancel_reservation(&ana, dropped.id).await.unwrap();

    let replayed = fx.reopen();
    assert_eq!(replayed.balance(&ana, "ana").await.unwrap(), 4);
    let mine = replayed.reservations_for_user(&ana, "ana").await.unwrap();
    assert_eq!(mine.len(), 2);
    let restored = replayed.get_reservation(&ana, kept.id).await.unwrap();
    assert_eq!(restored.status, ReservationStatus::Confirmed);

    let err = replayed.create_reservation(&ana, fx.request(9)).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotAlreadyTaken { .. }));
}

#[tokio::test]
async fn commits_after_a_torn_tail_survive_the_next_restart() {
    use std::io::Write;

    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;
    fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();

    // A crash mid-write leaves a partial frame at the end of the log.
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&fx.path).unwrap();
        f.write_all(&[0x13; 7]).unwrap();
    }

    let recovered = fx.reopen();
    assert_eq!(recovered.balance(&ana, "ana").await.unwrap(), 4);
    let later = recovered.create_reservation(&ana, fx.request(10)).await.unwrap();
    drop(recovered);

    let restarted = fx.reopen();
    assert_eq!(restarted.balance(&ana, "ana").await.unwrap(), 3);
    let restored = restarted.get_reservation(&ana, later.id).await.unwrap();
    assert_eq!(restored.status, ReservationStatus::Confirmed);
    assert_eq!(ledger_sum(&restarted, &fx.admin, "ana").await, 3);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 5).await;
    fx.engine
        .set_policy(&fx.admin, 48, None, 0)
        .await
        .unwrap();
    let r = fx.engine.create_reservation(&ana, fx.request(11)).await.unwrap();
    assert!(fx.engine.wal_appends_since_compact().await > 0);

    fx.engine.compact_wal().await.unwrap();
    assert_eq!(fx.engine.wal_appends_since_compact().await, 0);

    let replayed = fx.reopen();
    assert_eq!(replayed.balance(&ana, "ana").await.unwrap(), 4);
    assert_eq!(ledger_sum(&replayed, &fx.admin, "ana").await, 4);
    assert_eq!(replayed.active_policy().await.full_refund_hours, 48);
    assert_eq!(replayed.rules().await.len(), 1);
    assert_eq!(replayed.get_reservation(&ana, r.id).await.unwrap().credits_used, 1);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn notices_follow_commits() {
    let fx = Fixture::rules().await;
    let ana = Actor::client("ana");
    fx.fund("ana", 2).await;
    let mut rx = fx.engine.notify.subscribe("ana");

    let r = fx.engine.create_reservation(&ana, fx.request(9)).await.unwrap();
    match rx.recv().await.unwrap() {
        BookingNotice::Created { reservation_id, credits_used, .. } => {
            assert_eq!(reservation_id, r.id);
            assert_eq!(credits_used, 1);
        }
        other => panic!("expected Created, got {other:?}"),
    }

    fx.engine.cancel_reservation(&ana, r.id).await.unwrap();
    match rx.recv().await.unwrap() {
        BookingNotice::Cancelled { reservation_id, refund_amount, .. } => {
            assert_eq!(reservation_id, r.id);
            assert_eq!(refund_amount, 1);
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }

    // A rejected booking sends nothing.
    let _ = fx.engine.create_reservation(&Actor::client("nobody"), fx.request(10)).await;
    assert!(rx.try_recv().is_err());
}
