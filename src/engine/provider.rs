use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};

use crate::model::*;

use super::availability::{expand, is_blocked, resolve};
use super::conflict::{check_no_conflict, check_not_past};
use super::store::Book;
use super::EngineError;

/// Which representation backs bookable time for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityMode {
    /// Generated on read from rules and date overrides.
    Rules,
    /// Hand-managed slot records with an explicit status.
    Slots,
}

impl AvailabilityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityMode::Rules => "rules",
            AvailabilityMode::Slots => "slots",
        }
    }
}

impl fmt::Display for AvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AvailabilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rules" => Ok(AvailabilityMode::Rules),
            "slots" => Ok(AvailabilityMode::Slots),
            other => Err(format!("unknown availability mode: {other}")),
        }
    }
}

/// A verified hold on one interval, plus the events that take it.
#[derive(Debug)]
pub struct Claim {
    pub source: SlotRef,
    pub date: NaiveDate,
    pub span: Span,
    pub events: Vec<Event>,
}

/// Bookable-time source consulted by the reservation flows.
///
/// Every method runs under the engine's write (or read) guard, so a claim
/// checked here cannot be invalidated before its commit lands.
pub trait AvailabilityProvider: Send + Sync {
    fn mode(&self) -> AvailabilityMode;

    /// Check `request` is bookable right now and return the events that
    /// reserve it. Admins may also reclaim cancelled curated slots.
    fn claim(
        &self,
        book: &Book,
        request: &BookingRequest,
        claimant: &str,
        role: Role,
        now: NaiveDateTime,
    ) -> Result<Claim, EngineError>;

    /// Events that hand the interval back when `reservation` is cancelled.
    fn release(&self, book: &Book, reservation: &Reservation) -> Vec<Event>;

    fn list(
        &self,
        book: &Book,
        from: NaiveDate,
        to: NaiveDate,
        now: NaiveDateTime,
        view: ViewMode,
    ) -> Vec<AvailableSlot>;
}

pub fn provider_for(mode: AvailabilityMode) -> Box<dyn AvailabilityProvider> {
    match mode {
        AvailabilityMode::Rules => Box::new(RuleProvider),
        AvailabilityMode::Slots => Box::new(CuratedSlotProvider),
    }
}

// ── Rule-derived ─────────────────────────────────────────────────

pub struct RuleProvider;

impl RuleProvider {
    fn generated_by(book: &Book, request: &BookingRequest) -> Result<(), EngineError> {
        let id = request.block_id;
        let (window, minutes) = if let Some(rule) = book.rule(&id) {
            if !rule.active {
                return Err(EngineError::SlotNotBookable(format!("rule {id} is inactive")));
            }
            if !rule.recurrence.matches(request.date) {
                return Err(EngineError::SlotNotBookable(format!(
                    "rule {id} does not apply on {}",
                    request.date
                )));
            }
            (rule.span, rule.slot_minutes)
        } else if let Some(o) = book.date_override(&id) {
            if o.blocked {
                return Err(EngineError::SlotNotBookable(format!("override {id} blocks time")));
            }
            if o.date != request.date {
                return Err(EngineError::SlotNotBookable(format!(
                    "override {id} applies on {}, not {}",
                    o.date, request.date
                )));
            }
            (o.span, o.slot_minutes)
        } else {
            return Err(EngineError::NotFound(id));
        };

        if !expand(&window, minutes).contains(&request.span) {
            return Err(EngineError::SlotNotBookable(format!(
                "{} is not a slot of {id}",
                request.span
            )));
        }
        Ok(())
    }
}

impl AvailabilityProvider for RuleProvider {
    fn mode(&self) -> AvailabilityMode {
        AvailabilityMode::Rules
    }

    fn claim(
        &self,
        book: &Book,
        request: &BookingRequest,
        _claimant: &str,
        _role: Role,
        now: NaiveDateTime,
    ) -> Result<Claim, EngineError> {
        Self::generated_by(book, request)?;
        if is_blocked(book, request.date, &request.span) {
            return Err(EngineError::SlotNotBookable(format!(
                "{} {} is blocked",
                request.date, request.span
            )));
        }
        check_not_past(request.date, &request.span, now)?;
        check_no_conflict(book, request.date, &request.span)?;
        Ok(Claim {
            source: SlotRef::Block(request.block_id),
            date: request.date,
            span: request.span,
            events: Vec::new(),
        })
    }

    fn release(&self, _book: &Book, _reservation: &Reservation) -> Vec<Event> {
        Vec::new()
    }

    fn list(
        &self,
        book: &Book,
        from: NaiveDate,
        to: NaiveDate,
        now: NaiveDateTime,
        view: ViewMode,
    ) -> Vec<AvailableSlot> {
        resolve(book, from, to, now, view)
    }
}

// ── Admin-curated ────────────────────────────────────────────────

pub struct CuratedSlotProvider;

impl AvailabilityProvider for CuratedSlotProvider {
    fn mode(&self) -> AvailabilityMode {
        AvailabilityMode::Slots
    }

    fn claim(
        &self,
        book: &Book,
        request: &BookingRequest,
        claimant: &str,
        role: Role,
        now: NaiveDateTime,
    ) -> Result<Claim, EngineError> {
        let slot = book
            .slot(&request.block_id)
            .ok_or(EngineError::NotFound(request.block_id))?;
        if slot.date != request.date || slot.span != request.span {
            return Err(EngineError::Validation(format!(
                "slot {} is {} {}, not {} {}",
                slot.id, slot.date, slot.span, request.date, request.span
            )));
        }

        if slot.status == SlotStatus::Reserved {
            return Err(EngineError::SlotAlreadyTaken { date: slot.date, span: slot.span });
        }
        let claimable = match slot.status {
            SlotStatus::Unlocked => true,
            SlotStatus::Cancelled => role == Role::Admin,
            _ => false,
        };
        if !claimable {
            return Err(EngineError::SlotNotBookable(format!("slot {} is {}", slot.id, slot.status)));
        }
        check_not_past(slot.date, &slot.span, now)?;
        check_no_conflict(book, slot.date, &slot.span)?;

        Ok(Claim {
            source: SlotRef::Slot(slot.id),
            date: slot.date,
            span: slot.span,
            events: vec![Event::SlotStatusChanged {
                id: slot.id,
                status: SlotStatus::Reserved,
                assigned_user: Some(claimant.to_string()),
            }],
        })
    }

    fn release(&self, book: &Book, reservation: &Reservation) -> Vec<Event> {
        let SlotRef::Slot(id) = reservation.source else {
            return Vec::new();
        };
        match book.slot(&id) {
            Some(slot) if slot.status.can_transition_to(SlotStatus::Cancelled) => {
                vec![Event::SlotStatusChanged {
                    id,
                    status: SlotStatus::Cancelled,
                    assigned_user: None,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn list(
        &self,
        book: &Book,
        from: NaiveDate,
        to: NaiveDate,
        now: NaiveDateTime,
        view: ViewMode,
    ) -> Vec<AvailableSlot> {
        book.slots_between(from, to)
            .filter_map(|slot| {
                let past = slot.date.and_time(slot.span.start) < now;
                let is_available = slot.status == SlotStatus::Unlocked && !past;
                match view {
                    ViewMode::Client if !is_available => None,
                    _ => Some(AvailableSlot {
                        block_id: slot.id,
                        date: slot.date,
                        span: slot.span,
                        is_available,
                        reserved_by: slot.assigned_user.clone(),
                    }),
                }
            })
            .collect()
    }
}
