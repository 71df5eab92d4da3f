//! Hard limits on tenant state and request shapes.

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_RULES_PER_TENANT: usize = 1_024;
pub const MAX_OVERRIDES_PER_TENANT: usize = 10_000;
pub const MAX_SLOTS_PER_TENANT: usize = 100_000;
pub const MAX_PRICING_ITEMS: usize = 256;

/// Widest availability / slot listing, in days (inclusive range).
pub const MAX_QUERY_DAYS: i64 = 92;

pub const MIN_SLOT_MINUTES: u32 = 5;
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;

pub const MAX_NOTE_LEN: usize = 1_024;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_USER_ID_LEN: usize = 256;

/// Largest absolute amount accepted for a single ledger entry.
pub const MAX_CREDIT_AMOUNT: i64 = 1_000_000;

pub const MAX_HISTORY_LIMIT: usize = 1_000;
pub const MAX_TEMPLATE_ENTRIES: usize = 512;
