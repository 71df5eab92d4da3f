use std::collections::HashMap;

use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;

/// Append-only credit log, one row list per user.
///
/// Balances are always summed from the rows; there is no cached total to drift.
/// The ledger records facts only: sufficiency checks belong to the caller, made
/// under the same write guard that appends the debit.
#[derive(Debug, Default)]
pub struct CreditLedger {
    rows: HashMap<UserId, Vec<CreditTransaction>>,
}

impl CreditLedger {
    pub fn balance(&self, user_id: &str) -> Credits {
        self.rows
            .get(user_id)
            .map(|rows| rows.iter().map(|t| t.amount).sum())
            .unwrap_or(0)
    }

    /// Newest first, at most `limit` rows.
    pub fn history(&self, user_id: &str, limit: usize) -> Vec<CreditTransaction> {
        self.rows
            .get(user_id)
            .map(|rows| rows.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Build the row for an append; it takes effect once its commit is applied.
    pub fn entry(
        user_id: &str,
        amount: Credits,
        kind: TransactionType,
        reference_id: Option<String>,
        note: Option<String>,
        now: NaiveDateTime,
    ) -> CreditTransaction {
        CreditTransaction {
            id: Ulid::new(),
            user_id: user_id.to_string(),
            amount,
            kind,
            reference_id,
            note,
            created_at: now,
        }
    }

    pub(super) fn record(&mut self, transaction: CreditTransaction) {
        self.rows
            .entry(transaction.user_id.clone())
            .or_default()
            .push(transaction);
    }

    /// Rows referencing `reference_id` for a user, oldest first.
    pub fn by_reference(&self, user_id: &str, reference_id: &str) -> Vec<&CreditTransaction> {
        self.rows
            .get(user_id)
            .map(|rows| {
                rows.iter()
                    .filter(|t| t.reference_id.as_deref() == Some(reference_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every row in append order per user, for snapshots.
    pub(super) fn all_rows(&self) -> impl Iterator<Item = &CreditTransaction> {
        self.rows.values().flat_map(|rows| rows.iter())
    }
}
