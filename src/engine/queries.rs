use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::conflict::{require_admin, validate_range};
use super::policy::default_policy;
use super::{Engine, EngineError};

fn require_self_or_admin(actor: &Actor, user_id: &str) -> Result<(), EngineError> {
    if actor.is_admin() || actor.user_id == user_id {
        Ok(())
    } else {
        Err(EngineError::Forbidden("cannot read another user's credits"))
    }
}

impl Engine {
    /// Bookable intervals for `from..=to`. Admins get the full picture,
    /// clients only what they could book right now.
    pub async fn availability(
        &self,
        actor: &Actor,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailableSlot>, EngineError> {
        validate_range(from, to)?;
        let view = if actor.is_admin() { ViewMode::Admin } else { ViewMode::Client };
        let guard = self.read().await;
        Ok(self.provider().list(&guard, from, to, self.now(), view))
    }

    pub async fn balance(&self, actor: &Actor, user_id: &str) -> Result<Credits, EngineError> {
        require_self_or_admin(actor, user_id)?;
        let guard = self.read().await;
        Ok(guard.ledger().balance(user_id))
    }

    /// Newest first. `limit` is capped.
    pub async fn credit_history(
        &self,
        actor: &Actor,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, EngineError> {
        require_self_or_admin(actor, user_id)?;
        let guard = self.read().await;
        Ok(guard.ledger().history(user_id, limit.min(MAX_HISTORY_LIMIT)))
    }

    pub async fn rules(&self) -> Vec<AvailabilityRule> {
        self.read().await.rules().cloned().collect()
    }

    pub async fn overrides(&self, actor: &Actor) -> Result<Vec<DateOverride>, EngineError> {
        require_admin(actor)?;
        let guard = self.read().await;
        let mut out: Vec<DateOverride> = guard.overrides().cloned().collect();
        out.sort_by_key(|o| (o.date, o.span.start));
        Ok(out)
    }

    /// The policy cancellations use right now, falling back to the default.
    pub async fn active_policy(&self) -> CancellationPolicy {
        self.read()
            .await
            .active_policy()
            .cloned()
            .unwrap_or_else(default_policy)
    }

    /// Clients see active items only.
    pub async fn pricing_items(&self, actor: &Actor) -> Vec<PricingItem> {
        self.read()
            .await
            .pricing_items()
            .filter(|item| item.active || actor.is_admin())
            .cloned()
            .collect()
    }
}
