use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use ulid::Ulid;

use crate::model::*;

use super::store::Book;

// ── Availability Algorithm ────────────────────────────────────────

/// One fixed-length interval generated by a rule or an opening override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub block_id: Ulid,
    pub span: Span,
}

/// Cut `window` into back-to-back slots of `slot_minutes`. A remainder
/// shorter than one slot is dropped; nothing wraps past midnight.
pub fn expand(window: &Span, slot_minutes: u32) -> Vec<Span> {
    if slot_minutes == 0 {
        return Vec::new();
    }
    let step = TimeDelta::minutes(slot_minutes.into());
    let mut slots = Vec::new();
    let mut start = window.start;
    loop {
        let (end, wrapped) = start.overflowing_add_signed(step);
        if wrapped != 0 || end > window.end {
            break;
        }
        slots.push(Span::new(start, end));
        start = end;
    }
    slots
}

/// Candidate slots for one date.
///
/// Union of active matching rules and opening overrides, minus anything that
/// touches a blocked override, de-duplicated on start time. On duplicates the
/// oldest rule wins, and rules win over overrides.
pub fn candidates_for_date(book: &Book, date: NaiveDate) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::new();

    for rule in book.rules().filter(|r| r.active && r.recurrence.matches(date)) {
        candidates.extend(
            expand(&rule.span, rule.slot_minutes)
                .into_iter()
                .map(|span| Candidate { block_id: rule.id, span }),
        );
    }

    let mut blocked: Vec<Span> = Vec::new();
    for o in book.overrides_on(date) {
        if o.blocked {
            blocked.push(o.span);
        } else {
            candidates.extend(
                expand(&o.span, o.slot_minutes)
                    .into_iter()
                    .map(|span| Candidate { block_id: o.id, span }),
            );
        }
    }

    if !blocked.is_empty() {
        candidates.retain(|c| !blocked.iter().any(|b| b.overlaps(&c.span)));
    }

    // Stable: keeps the first source to generate each start time.
    candidates.sort_by_key(|c| c.span.start);
    candidates.dedup_by_key(|c| c.span.start);
    candidates
}

/// True if a blocked override on `date` touches `span`.
pub fn is_blocked(book: &Book, date: NaiveDate, span: &Span) -> bool {
    book.overrides_on(date)
        .any(|o| o.blocked && o.span.overlaps(span))
}

/// Bookable intervals for `from..=to`, ordered by (date, start).
///
/// Client view drops taken and past intervals entirely. Admin view keeps them,
/// flagged unavailable, with the holder of any confirmed reservation.
pub fn resolve(
    book: &Book,
    from: NaiveDate,
    to: NaiveDate,
    now: NaiveDateTime,
    view: ViewMode,
) -> Vec<AvailableSlot> {
    let mut out = Vec::new();
    for date in from.iter_days().take_while(|d| *d <= to) {
        let confirmed: Vec<&Reservation> = book.confirmed_on(date).collect();
        for c in candidates_for_date(book, date) {
            let holder = confirmed.iter().find(|r| r.span.overlaps(&c.span));
            let past = date.and_time(c.span.start) < now;
            let is_available = holder.is_none() && !past;
            match view {
                ViewMode::Client if !is_available => {}
                _ => out.push(AvailableSlot {
                    block_id: c.block_id,
                    date,
                    span: c.span,
                    is_available,
                    reserved_by: holder.map(|r| r.user_id.clone()),
                }),
            }
        }
    }
    out
}
