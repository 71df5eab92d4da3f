use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::BookingNotice;

use super::conflict::{require_admin, validate_note, validate_range, validate_span, validate_user};
use super::ledger::CreditLedger;
use super::policy::assess;
use super::store::Book;
use super::{Engine, EngineError};

/// Cost when a request names no pricing item.
const DEFAULT_COST: Credits = 1;

/// How a cancellation decides its refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefundRule {
    Policy,
    Full,
    Nothing,
}

impl RefundRule {
    fn from_override(refund_credits: Option<bool>) -> Self {
        match refund_credits {
            None => RefundRule::Policy,
            Some(true) => RefundRule::Full,
            Some(false) => RefundRule::Nothing,
        }
    }
}

fn cost_of(book: &Book, pricing_item_id: Option<Ulid>) -> Result<Credits, EngineError> {
    match pricing_item_id {
        None => Ok(DEFAULT_COST),
        Some(id) => book
            .pricing_item(&id)
            .filter(|item| item.active)
            .map(|item| item.credits)
            .ok_or(EngineError::NotFound(id)),
    }
}

/// Only a confirmed reservation whose session has not ended can be cancelled.
fn ensure_cancellable(r: &Reservation, now: NaiveDateTime) -> Result<(), EngineError> {
    match r.effective_status(now) {
        ReservationStatus::Confirmed => Ok(()),
        ReservationStatus::Cancelled => Err(EngineError::AlreadyCancelled(r.id)),
        ReservationStatus::Completed => Err(EngineError::AlreadyCompleted(r.id)),
    }
}

/// Load a reservation the actor may act on.
fn owned<'a>(book: &'a Book, actor: &Actor, id: Ulid) -> Result<&'a Reservation, EngineError> {
    let r = book.reservation(&id).ok_or(EngineError::NotFound(id))?;
    if !actor.is_admin() && r.user_id != actor.user_id {
        return Err(EngineError::Forbidden("reservation belongs to another user"));
    }
    Ok(r)
}

impl Engine {
    /// Book one interval for the calling client, paying with credits.
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        request: BookingRequest,
    ) -> Result<Reservation, EngineError> {
        self.reserve(&actor.user_id, actor.role, request, true).await
    }

    /// Book on behalf of `user_id`. `deduct_credits = Some(false)` books for free.
    pub async fn admin_create_reservation(
        &self,
        actor: &Actor,
        user_id: &str,
        request: BookingRequest,
        deduct_credits: Option<bool>,
    ) -> Result<Reservation, EngineError> {
        require_admin(actor)?;
        self.reserve(user_id, Role::Admin, request, deduct_credits.unwrap_or(true))
            .await
    }

    async fn reserve(
        &self,
        user_id: &str,
        role: Role,
        request: BookingRequest,
        charge: bool,
    ) -> Result<Reservation, EngineError> {
        validate_user(user_id)?;
        validate_span(&request.span)?;
        validate_note(request.note.as_deref())?;

        let guard = self.write().await;
        let now = self.now();

        if guard.reservation(&request.id).is_some() {
            return Err(EngineError::AlreadyExists(request.id));
        }
        let cost = cost_of(&guard, request.pricing_item_id)?;
        let claim = match self.provider().claim(&guard, &request, user_id, role, now) {
            Ok(claim) => claim,
            Err(e) => {
                if matches!(e, EngineError::SlotAlreadyTaken { .. }) {
                    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                }
                debug!("booking {} rejected: {e}", request.id);
                return Err(e);
            }
        };

        let charged = if charge { cost } else { 0 };
        if charged > 0 {
            let available = guard.ledger().balance(user_id);
            if available < charged {
                metrics::counter!(crate::observability::INSUFFICIENT_CREDITS_TOTAL).increment(1);
                return Err(EngineError::InsufficientCredits { required: charged, available });
            }
        }

        let reservation = Reservation {
            id: request.id,
            user_id: user_id.to_string(),
            source: claim.source,
            date: claim.date,
            span: claim.span,
            status: ReservationStatus::Confirmed,
            credits_used: charged,
            created_at: now,
            cancelled_at: None,
            note: request.note,
        };

        let mut events = vec![Event::ReservationCreated { reservation: reservation.clone() }];
        events.extend(claim.events);
        if charged > 0 {
            events.push(Event::CreditAppended {
                transaction: CreditLedger::entry(
                    user_id,
                    -charged,
                    TransactionType::Reservation,
                    Some(reservation.id.to_string()),
                    None,
                    now,
                ),
            });
        }
        self.commit(guard, events).await?;

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            "reservation {} confirmed for {} on {} {} ({} credits)",
            reservation.id, reservation.user_id, reservation.date, reservation.span, charged
        );
        self.notify.send(&BookingNotice::created(&reservation));
        Ok(reservation)
    }

    /// Cancel as the owner (or an admin) with the policy refund.
    pub async fn cancel_reservation(
        &self,
        actor: &Actor,
        reservation_id: Ulid,
    ) -> Result<CancellationResult, EngineError> {
        self.cancel(actor, reservation_id, RefundRule::Policy).await
    }

    /// Cancel any reservation. `refund_credits` overrides the policy:
    /// `Some(true)` refunds everything, `Some(false)` nothing.
    pub async fn admin_cancel_reservation(
        &self,
        actor: &Actor,
        reservation_id: Ulid,
        refund_credits: Option<bool>,
    ) -> Result<CancellationResult, EngineError> {
        require_admin(actor)?;
        self.cancel(actor, reservation_id, RefundRule::from_override(refund_credits))
            .await
    }

    async fn cancel(
        &self,
        actor: &Actor,
        reservation_id: Ulid,
        rule: RefundRule,
    ) -> Result<CancellationResult, EngineError> {
        let guard = self.write().await;
        let now = self.now();

        let reservation = owned(&guard, actor, reservation_id)?.clone();
        ensure_cancellable(&reservation, now)?;

        let preview = assess(guard.active_policy(), &reservation, now);
        let (refund_percentage, refund_amount, policy_applied) = match rule {
            RefundRule::Policy => (
                preview.refund_percentage,
                preview.refund_amount,
                preview.policy_applied,
            ),
            RefundRule::Full => (
                100,
                reservation.credits_used.max(0),
                AppliedPolicy { policy_id: None, tier: RefundTier::Full },
            ),
            RefundRule::Nothing => (0, 0, AppliedPolicy { policy_id: None, tier: RefundTier::None }),
        };

        let mut events = vec![Event::ReservationCancelled { id: reservation_id, cancelled_at: now }];
        events.extend(self.provider().release(&guard, &reservation));
        if refund_amount > 0 {
            events.push(Event::CreditAppended {
                transaction: CreditLedger::entry(
                    &reservation.user_id,
                    refund_amount,
                    TransactionType::Refund,
                    Some(reservation_id.to_string()),
                    None,
                    now,
                ),
            });
        }
        self.commit(guard, events).await?;

        metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        if refund_amount > 0 {
            metrics::counter!(crate::observability::CREDITS_REFUNDED_TOTAL)
                .increment(refund_amount as u64);
        }
        info!(
            "reservation {reservation_id} cancelled by {} ({}% refund, {refund_amount} credits)",
            actor.user_id, refund_percentage
        );
        self.notify.send(&BookingNotice::cancelled(&reservation, refund_amount));

        Ok(CancellationResult {
            reservation_id,
            refund_amount,
            refund_percentage,
            policy_applied,
        })
    }

    /// What `cancel_reservation` would refund right now, without side effects.
    pub async fn refund_preview(
        &self,
        actor: &Actor,
        reservation_id: Ulid,
    ) -> Result<RefundPreview, EngineError> {
        let guard = self.read().await;
        let now = self.now();
        let reservation = owned(&guard, actor, reservation_id)?;
        ensure_cancellable(reservation, now)?;
        Ok(assess(guard.active_policy(), reservation, now))
    }

    pub async fn get_reservation(
        &self,
        actor: &Actor,
        reservation_id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let guard = self.read().await;
        let now = self.now();
        let r = owned(&guard, actor, reservation_id)?;
        Ok(with_effective_status(r, now))
    }

    /// A user's reservations in creation order, with `completed` derived.
    pub async fn reservations_for_user(
        &self,
        actor: &Actor,
        user_id: &str,
    ) -> Result<Vec<Reservation>, EngineError> {
        if !actor.is_admin() && actor.user_id != user_id {
            return Err(EngineError::Forbidden("cannot list another user's reservations"));
        }
        let guard = self.read().await;
        let now = self.now();
        Ok(guard
            .reservations()
            .filter(|r| r.user_id == user_id)
            .map(|r| with_effective_status(r, now))
            .collect())
    }

    /// Every reservation with `from <= date <= to`, ordered by (date, start).
    pub async fn reservations_in_range(
        &self,
        actor: &Actor,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        require_admin(actor)?;
        validate_range(from, to)?;
        let guard = self.read().await;
        let now = self.now();
        let mut out: Vec<Reservation> = guard
            .reservations()
            .filter(|r| r.date >= from && r.date <= to)
            .map(|r| with_effective_status(r, now))
            .collect();
        out.sort_by_key(|r| (r.date, r.span.start, r.created_at));
        Ok(out)
    }
}

fn with_effective_status(r: &Reservation, now: NaiveDateTime) -> Reservation {
    let mut r = r.clone();
    r.status = r.effective_status(now);
    r
}
