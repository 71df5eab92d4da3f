use chrono::{NaiveDate, NaiveDateTime};

use crate::limits::*;
use crate::model::*;

use super::store::Book;
use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation(format!(
            "start {} must be before end {}",
            span.start.format("%H:%M"),
            span.end.format("%H:%M")
        )));
    }
    Ok(())
}

pub(crate) fn validate_range(from: NaiveDate, to: NaiveDate) -> Result<(), EngineError> {
    if from > to {
        return Err(EngineError::Validation(format!("range start {from} is after end {to}")));
    }
    if (to - from).num_days() >= MAX_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

pub(crate) fn validate_slot_minutes(minutes: u32, window: &Span) -> Result<(), EngineError> {
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&minutes) {
        return Err(EngineError::Validation(format!(
            "slot length must be between {MIN_SLOT_MINUTES} and {MAX_SLOT_MINUTES} minutes"
        )));
    }
    if window.duration().num_minutes() < i64::from(minutes) {
        return Err(EngineError::Validation(format!(
            "window {window} is shorter than one {minutes}-minute slot"
        )));
    }
    Ok(())
}

pub(crate) fn validate_note(note: Option<&str>) -> Result<(), EngineError> {
    if let Some(n) = note
        && n.len() > MAX_NOTE_LEN
    {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    Ok(())
}

pub(crate) fn validate_user(user_id: &str) -> Result<(), EngineError> {
    if user_id.is_empty() {
        return Err(EngineError::Validation("user id must not be empty".into()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

/// Amounts for purchases and refunds: strictly positive and bounded.
pub(crate) fn validate_amount(amount: Credits) -> Result<(), EngineError> {
    if amount <= 0 {
        return Err(EngineError::Validation("amount must be positive".into()));
    }
    if amount > MAX_CREDIT_AMOUNT {
        return Err(EngineError::LimitExceeded("amount too large"));
    }
    Ok(())
}

pub(crate) fn require_admin(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden("admin role required"))
    }
}

pub(crate) fn check_not_past(date: NaiveDate, span: &Span, now: NaiveDateTime) -> Result<(), EngineError> {
    if date.and_time(span.start) < now {
        return Err(EngineError::SlotNotBookable(format!("{date} {span} is in the past")));
    }
    Ok(())
}

pub(crate) fn check_no_conflict(book: &Book, date: NaiveDate, span: &Span) -> Result<(), EngineError> {
    book.ensure_slot_free(date, span)
}
