use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    require_admin, validate_amount, validate_note, validate_slot_minutes, validate_span,
    validate_user,
};
use super::ledger::CreditLedger;
use super::store::Book;
use super::{Engine, EngineError};

fn validate_reference(reference: &str) -> Result<(), EngineError> {
    if reference.is_empty() {
        return Err(EngineError::Validation("reference must not be empty".into()));
    }
    if reference.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("reference too long"));
    }
    Ok(())
}

impl Engine {
    // ── Availability rules ───────────────────────────────────

    /// Add a rule, or replace the rule with the same id.
    pub async fn put_rule(
        &self,
        actor: &Actor,
        rule: AvailabilityRule,
    ) -> Result<AvailabilityRule, EngineError> {
        require_admin(actor)?;
        validate_span(&rule.span)?;
        validate_slot_minutes(rule.slot_minutes, &rule.span)?;
        if let Recurrence::Weekly(days) = &rule.recurrence
            && days.is_empty()
        {
            return Err(EngineError::Validation("weekly rule needs at least one day".into()));
        }

        let guard = self.write().await;
        let existed = guard.rule(&rule.id).is_some();
        if !existed && guard.rule_count() >= MAX_RULES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rules"));
        }
        self.commit(guard, vec![Event::RuleStored { rule: rule.clone() }])
            .await?;
        info!(
            "rule {} {} ({} {}-minute slots)",
            rule.id,
            if existed { "updated" } else { "added" },
            rule.span,
            rule.slot_minutes
        );
        Ok(rule)
    }

    /// Existing reservations made against the rule are kept.
    pub async fn remove_rule(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        require_admin(actor)?;
        let guard = self.write().await;
        if guard.rule(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.commit(guard, vec![Event::RuleRemoved { id }]).await
    }

    // ── Date overrides ───────────────────────────────────────

    pub async fn add_override(
        &self,
        actor: &Actor,
        date_override: DateOverride,
    ) -> Result<DateOverride, EngineError> {
        require_admin(actor)?;
        validate_span(&date_override.span)?;
        if !date_override.blocked {
            validate_slot_minutes(date_override.slot_minutes, &date_override.span)?;
        }

        let guard = self.write().await;
        if guard.override_count() >= MAX_OVERRIDES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many date overrides"));
        }
        if guard.date_override(&date_override.id).is_some() {
            return Err(EngineError::AlreadyExists(date_override.id));
        }
        self.commit(
            guard,
            vec![Event::OverrideAdded { date_override: date_override.clone() }],
        )
        .await?;
        Ok(date_override)
    }

    pub async fn remove_override(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        require_admin(actor)?;
        let guard = self.write().await;
        if guard.date_override(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.commit(guard, vec![Event::OverrideRemoved { id }]).await
    }

    // ── Pricing ──────────────────────────────────────────────

    pub async fn put_pricing_item(
        &self,
        actor: &Actor,
        item: PricingItem,
    ) -> Result<PricingItem, EngineError> {
        require_admin(actor)?;
        if item.name.is_empty() {
            return Err(EngineError::Validation("pricing item needs a name".into()));
        }
        if item.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("pricing item name too long"));
        }
        if !(0..=MAX_CREDIT_AMOUNT).contains(&item.credits) {
            return Err(EngineError::Validation(format!(
                "credits must be between 0 and {MAX_CREDIT_AMOUNT}"
            )));
        }

        let guard = self.write().await;
        if guard.pricing_item(&item.id).is_none()
            && guard.pricing_items().count() >= MAX_PRICING_ITEMS
        {
            return Err(EngineError::LimitExceeded("too many pricing items"));
        }
        self.commit(guard, vec![Event::PricingStored { item: item.clone() }])
            .await?;
        Ok(item)
    }

    /// Retire a pricing item; past reservations keep what they paid.
    pub async fn deactivate_pricing_item(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        require_admin(actor)?;
        let guard = self.write().await;
        let mut item = guard
            .pricing_item(&id)
            .ok_or(EngineError::NotFound(id))?
            .clone();
        if !item.active {
            return Ok(());
        }
        item.active = false;
        self.commit(guard, vec![Event::PricingStored { item }]).await
    }

    // ── Cancellation policy ──────────────────────────────────

    /// Install a new active policy, superseding the current one.
    pub async fn set_policy(
        &self,
        actor: &Actor,
        full_refund_hours: u32,
        partial: Option<PartialRefund>,
        no_refund_hours: u32,
    ) -> Result<CancellationPolicy, EngineError> {
        require_admin(actor)?;
        if let Some(p) = partial {
            if p.percentage > 100 {
                return Err(EngineError::Validation("partial refund percentage above 100".into()));
            }
            if p.hours > full_refund_hours {
                return Err(EngineError::Validation(
                    "partial refund threshold must not exceed the full refund threshold".into(),
                ));
            }
        }
        let floor = partial.map_or(full_refund_hours, |p| p.hours);
        if no_refund_hours > floor {
            return Err(EngineError::Validation(
                "no-refund threshold must sit below the other tiers".into(),
            ));
        }

        let policy = CancellationPolicy {
            id: Ulid::new(),
            full_refund_hours,
            partial,
            no_refund_hours,
            active: true,
        };
        let guard = self.write().await;
        self.commit(guard, vec![Event::PolicyStored { policy: policy.clone() }])
            .await?;
        info!(
            "cancellation policy {} active: full {}h, partial {:?}, none {}h",
            policy.id, full_refund_hours, partial, no_refund_hours
        );
        Ok(policy)
    }

    /// Fall back to the built-in default. Returns the policy that was retired.
    pub async fn deactivate_policy(&self, actor: &Actor) -> Result<Option<Ulid>, EngineError> {
        require_admin(actor)?;
        let guard = self.write().await;
        let Some(active) = guard.active_policy() else {
            return Ok(None);
        };
        let mut retired = active.clone();
        retired.active = false;
        let id = retired.id;
        self.commit(guard, vec![Event::PolicyStored { policy: retired }])
            .await?;
        Ok(Some(id))
    }

    // ── Ledger entry points ──────────────────────────────────

    /// Payment layer callback for a confirmed payment. Retries with the same
    /// `payment_id` return the original row instead of crediting twice.
    pub async fn record_purchase(
        &self,
        user_id: &str,
        amount: Credits,
        payment_id: &str,
    ) -> Result<CreditTransaction, EngineError> {
        self.record_payment(user_id, amount, payment_id, TransactionType::Purchase)
            .await
    }

    pub async fn record_plan_purchase(
        &self,
        user_id: &str,
        amount: Credits,
        payment_id: &str,
    ) -> Result<CreditTransaction, EngineError> {
        self.record_payment(user_id, amount, payment_id, TransactionType::PlanPurchase)
            .await
    }

    async fn record_payment(
        &self,
        user_id: &str,
        amount: Credits,
        payment_id: &str,
        kind: TransactionType,
    ) -> Result<CreditTransaction, EngineError> {
        validate_user(user_id)?;
        validate_amount(amount)?;
        validate_reference(payment_id)?;

        let guard = self.write().await;
        if let Some(existing) = guard
            .ledger()
            .by_reference(user_id, payment_id)
            .into_iter()
            .find(|t| t.kind == kind)
        {
            return Ok(existing.clone());
        }
        let row = CreditLedger::entry(
            user_id,
            amount,
            kind,
            Some(payment_id.to_string()),
            None,
            self.now(),
        );
        self.append_credits(guard, row).await
    }

    /// Signed manual correction by an admin.
    pub async fn adjust_credits(
        &self,
        actor: &Actor,
        user_id: &str,
        amount: Credits,
        note: Option<String>,
    ) -> Result<CreditTransaction, EngineError> {
        require_admin(actor)?;
        validate_user(user_id)?;
        validate_note(note.as_deref())?;
        if amount == 0 {
            return Err(EngineError::Validation("adjustment must be non-zero".into()));
        }
        validate_amount(amount.abs())?;

        let guard = self.write().await;
        let row = CreditLedger::entry(
            user_id,
            amount,
            TransactionType::AdminAdjustment,
            None,
            note,
            self.now(),
        );
        self.append_credits(guard, row).await
    }

    async fn append_credits(
        &self,
        guard: OwnedRwLockWriteGuard<Book>,
        row: CreditTransaction,
    ) -> Result<CreditTransaction, EngineError> {
        self.commit(guard, vec![Event::CreditAppended { transaction: row.clone() }])
            .await?;
        info!(
            "ledger: {} {:+} ({})",
            row.user_id,
            row.amount,
            row.kind.as_str()
        );
        Ok(row)
    }
}
