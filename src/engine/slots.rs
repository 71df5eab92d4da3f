use std::collections::HashSet;

use chrono::{Datelike, Days, NaiveDate, Weekday};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{require_admin, validate_note, validate_range, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// New curated slots start LOCKED, invisible to clients.
    pub async fn create_slot(
        &self,
        actor: &Actor,
        id: Ulid,
        date: NaiveDate,
        span: Span,
        note: Option<String>,
    ) -> Result<Slot, EngineError> {
        require_admin(actor)?;
        validate_span(&span)?;
        validate_note(note.as_deref())?;

        let guard = self.write().await;
        if guard.slot_count() >= MAX_SLOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        if guard.slot(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = guard.slot_at(date, span.start) {
            return Err(EngineError::AlreadyExists(existing.id));
        }

        let slot = Slot { id, date, span, status: SlotStatus::Locked, assigned_user: None, note };
        self.commit(guard, vec![Event::SlotCreated { slot: slot.clone() }]).await?;
        Ok(slot)
    }

    /// Admin moves along the slot state machine. RESERVED and CANCELLED are
    /// entered only through bookings and cancellations.
    pub async fn update_slot_status(
        &self,
        actor: &Actor,
        id: Ulid,
        status: SlotStatus,
    ) -> Result<Slot, EngineError> {
        require_admin(actor)?;
        if matches!(status, SlotStatus::Reserved | SlotStatus::Cancelled) {
            return Err(EngineError::InvalidTransition(format!(
                "{status} is set by reservations, not directly"
            )));
        }

        let guard = self.write().await;
        let mut slot = guard.slot(&id).ok_or(EngineError::NotFound(id))?.clone();
        if slot.status == status {
            return Ok(slot);
        }
        if !slot.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition(format!("{} -> {status}", slot.status)));
        }

        let event = Event::SlotStatusChanged { id, status, assigned_user: None };
        self.commit(guard, vec![event]).await?;
        info!("slot {id} {} -> {status}", slot.status);
        slot.status = status;
        slot.assigned_user = None;
        Ok(slot)
    }

    pub async fn delete_slot(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        require_admin(actor)?;
        let guard = self.write().await;
        let slot = guard.slot(&id).ok_or(EngineError::NotFound(id))?;
        if !slot.status.is_deletable() {
            return Err(EngineError::InvalidTransition(format!(
                "cannot delete a {} slot",
                slot.status
            )));
        }
        self.commit(guard, vec![Event::SlotDeleted { id }]).await
    }

    /// Curated slots with `from <= date <= to`, ordered by (date, start).
    pub async fn slots_in_range(
        &self,
        actor: &Actor,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        require_admin(actor)?;
        validate_range(from, to)?;
        let guard = self.read().await;
        Ok(guard.slots_between(from, to).cloned().collect())
    }

    /// Stamp a weekly template onto the week starting `monday`.
    ///
    /// Entries whose (date, start) already holds a slot are skipped. All new
    /// slots land in one commit, LOCKED.
    pub async fn apply_week_template(
        &self,
        actor: &Actor,
        monday: NaiveDate,
        template: &[SlotTemplate],
    ) -> Result<Vec<Slot>, EngineError> {
        require_admin(actor)?;
        if monday.weekday() != Weekday::Mon {
            return Err(EngineError::Validation(format!("{monday} is not a Monday")));
        }
        if template.len() > MAX_TEMPLATE_ENTRIES {
            return Err(EngineError::LimitExceeded("too many template entries"));
        }
        for entry in template {
            validate_span(&entry.span)?;
        }

        let guard = self.write().await;
        let mut taken: HashSet<(NaiveDate, chrono::NaiveTime)> = HashSet::new();
        let mut created = Vec::new();
        for entry in template {
            let offset = u64::from(entry.weekday.num_days_from_monday());
            let date = monday + Days::new(offset);
            if guard.slot_at(date, entry.span.start).is_some() || !taken.insert((date, entry.span.start)) {
                continue;
            }
            created.push(Slot {
                id: Ulid::new(),
                date,
                span: entry.span,
                status: SlotStatus::Locked,
                assigned_user: None,
                note: None,
            });
        }
        if guard.slot_count() + created.len() > MAX_SLOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many slots"));
        }

        let events = created
            .iter()
            .map(|slot| Event::SlotCreated { slot: slot.clone() })
            .collect();
        self.commit(guard, events).await?;
        info!("template applied to week of {monday}: {} slots created", created.len());
        created.sort_by_key(|s| (s.date, s.span.start));
        Ok(created)
    }
}
