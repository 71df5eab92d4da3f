use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;
use super::ledger::CreditLedger;

type SlotKey = (NaiveDate, NaiveTime);

/// All state of one schedule owner: the five entity tables plus pricing,
/// with the indexes that back the uniqueness constraints.
///
/// Mutated only through [`Book::apply`], which never fails: every check happens
/// before a commit is written.
#[derive(Debug, Default)]
pub struct Book {
    rules: BTreeMap<Ulid, AvailabilityRule>,
    overrides: BTreeMap<Ulid, DateOverride>,
    pricing: BTreeMap<Ulid, PricingItem>,
    policies: Vec<CancellationPolicy>,
    slots: HashMap<Ulid, Slot>,
    /// Unique on (date, start).
    slot_index: BTreeMap<SlotKey, Ulid>,
    reservations: BTreeMap<Ulid, Reservation>,
    /// Unique on (date, start) among confirmed reservations.
    confirmed: BTreeMap<SlotKey, Ulid>,
    ledger: CreditLedger,
}

impl Book {
    // ── Rules & overrides ────────────────────────────────────

    pub fn rule(&self, id: &Ulid) -> Option<&AvailabilityRule> {
        self.rules.get(id)
    }

    /// In creation order.
    pub fn rules(&self) -> impl Iterator<Item = &AvailabilityRule> {
        self.rules.values()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn date_override(&self, id: &Ulid) -> Option<&DateOverride> {
        self.overrides.get(id)
    }

    pub fn overrides_on(&self, date: NaiveDate) -> impl Iterator<Item = &DateOverride> {
        self.overrides.values().filter(move |o| o.date == date)
    }

    pub fn overrides(&self) -> impl Iterator<Item = &DateOverride> {
        self.overrides.values()
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }

    // ── Pricing & policy ─────────────────────────────────────

    pub fn pricing_item(&self, id: &Ulid) -> Option<&PricingItem> {
        self.pricing.get(id)
    }

    pub fn pricing_items(&self) -> impl Iterator<Item = &PricingItem> {
        self.pricing.values()
    }

    pub fn active_policy(&self) -> Option<&CancellationPolicy> {
        self.policies.iter().rev().find(|p| p.active)
    }

    pub fn policy(&self, id: &Ulid) -> Option<&CancellationPolicy> {
        self.policies.iter().find(|p| p.id == *id)
    }

    // ── Curated slots ────────────────────────────────────────

    pub fn slot(&self, id: &Ulid) -> Option<&Slot> {
        self.slots.get(id)
    }

    pub fn slot_at(&self, date: NaiveDate, start: NaiveTime) -> Option<&Slot> {
        self.slot_index.get(&(date, start)).and_then(|id| self.slots.get(id))
    }

    /// Slots with `from <= date <= to`, ordered by (date, start).
    pub fn slots_between(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = &Slot> {
        self.slot_index
            .range((from, NaiveTime::default())..)
            .take_while(move |((date, _), _)| *date <= to)
            .filter_map(move |(_, id)| self.slots.get(id))
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    /// In creation order.
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    /// Confirmed reservations on `date`, ordered by start.
    pub fn confirmed_on(&self, date: NaiveDate) -> impl Iterator<Item = &Reservation> {
        self.confirmed
            .range((date, NaiveTime::default())..)
            .take_while(move |((d, _), _)| *d == date)
            .filter_map(move |(_, id)| self.reservations.get(id))
    }

    /// The uniqueness constraint on confirmed reservations. Taken if another
    /// confirmed reservation starts at the same instant or overlaps the span.
    pub fn ensure_slot_free(&self, date: NaiveDate, span: &Span) -> Result<(), EngineError> {
        if self.confirmed.contains_key(&(date, span.start)) {
            return Err(EngineError::SlotAlreadyTaken { date, span: *span });
        }
        if self.confirmed_on(date).any(|r| r.span.overlaps(span)) {
            return Err(EngineError::SlotAlreadyTaken { date, span: *span });
        }
        Ok(())
    }

    // ── Ledger ───────────────────────────────────────────────

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    // ── Event application ────────────────────────────────────

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::RuleStored { rule } => {
                self.rules.insert(rule.id, rule.clone());
            }
            Event::RuleRemoved { id } => {
                self.rules.remove(id);
            }
            Event::OverrideAdded { date_override } => {
                self.overrides.insert(date_override.id, date_override.clone());
            }
            Event::OverrideRemoved { id } => {
                self.overrides.remove(id);
            }
            Event::PricingStored { item } => {
                self.pricing.insert(item.id, item.clone());
            }
            Event::PolicyStored { policy } => {
                if policy.active {
                    for p in &mut self.policies {
                        p.active = false;
                    }
                }
                match self.policies.iter_mut().find(|p| p.id == policy.id) {
                    Some(existing) => *existing = policy.clone(),
                    None => self.policies.push(policy.clone()),
                }
            }
            Event::SlotCreated { slot } => {
                self.slot_index.insert((slot.date, slot.span.start), slot.id);
                self.slots.insert(slot.id, slot.clone());
            }
            Event::SlotStatusChanged {
                id,
                status,
                assigned_user,
            } => {
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.status = *status;
                    slot.assigned_user = assigned_user.clone();
                }
            }
            Event::SlotDeleted { id } => {
                if let Some(slot) = self.slots.remove(id) {
                    self.slot_index.remove(&(slot.date, slot.span.start));
                }
            }
            Event::ReservationCreated { reservation } => {
                if reservation.status == ReservationStatus::Confirmed {
                    self.confirmed
                        .insert((reservation.date, reservation.span.start), reservation.id);
                }
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationCancelled { id, cancelled_at } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::Cancelled;
                    r.cancelled_at = Some(*cancelled_at);
                    let key = (r.date, r.span.start);
                    if self.confirmed.get(&key) == Some(id) {
                        self.confirmed.remove(&key);
                    }
                }
            }
            Event::CreditAppended { transaction } => {
                self.ledger.record(transaction.clone());
            }
        }
    }

    /// Minimal event list that recreates the current state. Ledger rows and
    /// reservations are carried over in full.
    pub fn snapshot(&self) -> Commit {
        let mut events = Vec::new();
        events.extend(self.rules.values().map(|rule| Event::RuleStored { rule: rule.clone() }));
        events.extend(
            self.overrides
                .values()
                .map(|o| Event::OverrideAdded { date_override: o.clone() }),
        );
        events.extend(self.pricing.values().map(|item| Event::PricingStored { item: item.clone() }));
        events.extend(
            self.policies
                .iter()
                .map(|policy| Event::PolicyStored { policy: policy.clone() }),
        );
        events.extend(
            self.slot_index
                .values()
                .filter_map(|id| self.slots.get(id))
                .map(|slot| Event::SlotCreated { slot: slot.clone() }),
        );
        events.extend(
            self.reservations
                .values()
                .map(|r| Event::ReservationCreated { reservation: r.clone() }),
        );
        events.extend(
            self.ledger
                .all_rows()
                .map(|t| Event::CreditAppended { transaction: t.clone() }),
        );
        Commit { events }
    }
}
