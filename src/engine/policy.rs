use chrono::{NaiveDateTime, TimeDelta};

use crate::model::*;

/// Used when the schedule owner has no active policy.
pub fn default_policy() -> CancellationPolicy {
    CancellationPolicy {
        id: ulid::Ulid::nil(),
        full_refund_hours: 24,
        partial: None,
        no_refund_hours: 0,
        active: true,
    }
}

/// Refund tier for a cancellation `until_start` before the session.
///
/// Tiers are checked from the most generous down. Anything under
/// `no_refund_hours` gets nothing, and so does a cancellation that falls in the
/// gap above it with no partial tier to catch it. Sessions already under way
/// always get nothing.
pub fn refund_tier(policy: &CancellationPolicy, until_start: TimeDelta) -> (RefundTier, u8) {
    if until_start < TimeDelta::zero() {
        return (RefundTier::None, 0);
    }
    if until_start >= TimeDelta::hours(policy.full_refund_hours.into()) {
        return (RefundTier::Full, 100);
    }
    if let Some(partial) = policy.partial
        && until_start >= TimeDelta::hours(partial.hours.into())
    {
        return (RefundTier::Partial, partial.percentage.min(100));
    }
    (RefundTier::None, 0)
}

pub fn refund_percentage(policy: &CancellationPolicy, until_start: TimeDelta) -> u8 {
    refund_tier(policy, until_start).1
}

/// Credits returned for `credits_used` at `percentage`, rounded down.
pub fn refund_amount(credits_used: Credits, percentage: u8) -> Credits {
    if credits_used <= 0 {
        return 0;
    }
    credits_used * Credits::from(percentage) / 100
}

/// Shared by cancel and its preview so both read one clock value and one policy.
pub(crate) fn assess(
    policy: Option<&CancellationPolicy>,
    reservation: &Reservation,
    now: NaiveDateTime,
) -> RefundPreview {
    let fallback;
    let (policy, policy_id) = match policy {
        Some(p) => (p, Some(p.id)),
        None => {
            fallback = default_policy();
            (&fallback, None)
        }
    };
    let until_start = reservation.starts_at() - now;
    let (tier, percentage) = refund_tier(policy, until_start);
    RefundPreview {
        reservation_id: reservation.id,
        hours_until_start: until_start.num_seconds() as f64 / 3600.0,
        credits_used: reservation.credits_used,
        refund_percentage: percentage,
        refund_amount: refund_amount(reservation.credits_used, percentage),
        policy_applied: AppliedPolicy { policy_id, tier },
    }
}
