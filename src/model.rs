use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque user identity handed over by the auth layer.
pub type UserId = String;

/// Signed credit amount. Debits are negative.
pub type Credits = i64;

/// Half-open time-of-day interval `[start, end)` on a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    #[cfg(test)]
    pub fn hm(start: (u32, u32), end: (u32, u32)) -> Self {
        let s = NaiveTime::from_hms_opt(start.0, start.1, 0).expect("valid start time");
        let e = NaiveTime::from_hms_opt(end.0, end.1, 0).expect("valid end time");
        Self::new(s, e)
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// ── Schedule rules ───────────────────────────────────────────────

/// Which calendar dates a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recurrence {
    Weekly(Vec<Weekday>),
    On(NaiveDate),
}

impl Recurrence {
    pub fn matches(&self, date: NaiveDate) -> bool {
        match self {
            Recurrence::Weekly(days) => days.contains(&date.weekday()),
            Recurrence::On(d) => *d == date,
        }
    }
}

/// A recurring or one-off bookable window, cut into fixed-length slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub recurrence: Recurrence,
    pub span: Span,
    pub slot_minutes: u32,
    pub active: bool,
}

/// A single-date exception: either blocks a window or opens extra slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub blocked: bool,
    /// Slot length for opening overrides. Ignored when `blocked`.
    pub slot_minutes: u32,
}

// ── Admin-curated slots ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Locked,
    Unlocked,
    Reserved,
    Blocked,
    Cancelled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Locked => "locked",
            SlotStatus::Unlocked => "unlocked",
            SlotStatus::Reserved => "reserved",
            SlotStatus::Blocked => "blocked",
            SlotStatus::Cancelled => "cancelled",
        }
    }

    /// Legal edges of the slot state machine.
    pub fn can_transition_to(self, next: SlotStatus) -> bool {
        use SlotStatus::*;
        matches!(
            (self, next),
            (Locked, Unlocked)
                | (Locked, Blocked)
                | (Unlocked, Reserved)
                | (Unlocked, Locked)
                | (Unlocked, Blocked)
                | (Reserved, Cancelled)
                | (Cancelled, Locked)
                | (Cancelled, Reserved)
                | (Blocked, Locked)
                | (Blocked, Unlocked)
        )
    }

    pub fn is_deletable(self) -> bool {
        matches!(self, SlotStatus::Locked | SlotStatus::Unlocked)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "locked" => Ok(SlotStatus::Locked),
            "unlocked" => Ok(SlotStatus::Unlocked),
            "reserved" => Ok(SlotStatus::Reserved),
            "blocked" => Ok(SlotStatus::Blocked),
            "cancelled" | "canceled" => Ok(SlotStatus::Cancelled),
            other => Err(format!("unknown slot status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: SlotStatus,
    pub assigned_user: Option<UserId>,
    pub note: Option<String>,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }
}

/// What a reservation was booked against. Stored as an id only, resolved on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotRef {
    /// A rule or opening override in rule-derived mode.
    Block(Ulid),
    /// A curated slot record.
    Slot(Ulid),
}

impl SlotRef {
    pub fn id(&self) -> Ulid {
        match self {
            SlotRef::Block(id) | SlotRef::Slot(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: UserId,
    pub source: SlotRef,
    pub date: NaiveDate,
    pub span: Span,
    pub status: ReservationStatus,
    pub credits_used: Credits,
    pub created_at: NaiveDateTime,
    pub cancelled_at: Option<NaiveDateTime>,
    pub note: Option<String>,
}

impl Reservation {
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.span.start)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.span.end)
    }

    /// Stored status with `completed` derived for confirmed sessions that have ended.
    pub fn effective_status(&self, now: NaiveDateTime) -> ReservationStatus {
        match self.status {
            ReservationStatus::Confirmed if self.ends_at() <= now => ReservationStatus::Completed,
            s => s,
        }
    }
}

// ── Credit ledger ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Purchase,
    Reservation,
    PlanPurchase,
    AdminAdjustment,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Reservation => "reservation",
            TransactionType::PlanPurchase => "plan_purchase",
            TransactionType::AdminAdjustment => "admin_adjustment",
            TransactionType::Refund => "refund",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "purchase" => Ok(TransactionType::Purchase),
            "reservation" => Ok(TransactionType::Reservation),
            "plan_purchase" => Ok(TransactionType::PlanPurchase),
            "admin_adjustment" => Ok(TransactionType::AdminAdjustment),
            "refund" => Ok(TransactionType::Refund),
            other => Err(format!("unknown transaction type: {other}")),
        }
    }
}

/// Immutable ledger row. `reference_id` points at a reservation or payment by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Ulid,
    pub user_id: UserId,
    pub amount: Credits,
    pub kind: TransactionType,
    pub reference_id: Option<String>,
    pub note: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingItem {
    pub id: Ulid,
    pub name: String,
    pub credits: Credits,
    pub active: bool,
}

// ── Cancellation policy ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRefund {
    pub hours: u32,
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    pub id: Ulid,
    pub full_refund_hours: u32,
    pub partial: Option<PartialRefund>,
    pub no_refund_hours: u32,
    pub active: bool,
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Admin,
}

/// Resolved caller identity, trusted as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn client(user_id: impl Into<UserId>) -> Self {
        Self { user_id: user_id.into(), role: Role::Client }
    }

    pub fn admin(user_id: impl Into<UserId>) -> Self {
        Self { user_id: user_id.into(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// State changes. Flat, no nesting beyond the entity payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RuleStored { rule: AvailabilityRule },
    RuleRemoved { id: Ulid },
    OverrideAdded { date_override: DateOverride },
    OverrideRemoved { id: Ulid },
    PricingStored { item: PricingItem },
    PolicyStored { policy: CancellationPolicy },
    SlotCreated { slot: Slot },
    SlotStatusChanged {
        id: Ulid,
        status: SlotStatus,
        assigned_user: Option<UserId>,
    },
    SlotDeleted { id: Ulid },
    ReservationCreated { reservation: Reservation },
    ReservationCancelled { id: Ulid, cancelled_at: NaiveDateTime },
    CreditAppended { transaction: CreditTransaction },
}

/// One transaction: every event in it is applied, or none is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub events: Vec<Event>,
}

// ── Request / result types ───────────────────────────────────────

/// A client's request for one concrete interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    /// Rule/override id in rule-derived mode, slot id in curated mode.
    pub block_id: Ulid,
    pub pricing_item_id: Option<Ulid>,
    pub note: Option<String>,
}

/// One line of a weekly slot template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTemplate {
    pub weekday: Weekday,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    /// Only bookable future intervals.
    Client,
    /// Every candidate, with occupancy.
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableSlot {
    pub block_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub is_available: bool,
    pub reserved_by: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundTier {
    Full,
    Partial,
    None,
}

impl RefundTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundTier::Full => "full",
            RefundTier::Partial => "partial",
            RefundTier::None => "none",
        }
    }
}

/// Which policy and tier produced a refund. `policy_id` is `None` for the
/// built-in default and for admin overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedPolicy {
    pub policy_id: Option<Ulid>,
    pub tier: RefundTier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundPreview {
    pub reservation_id: Ulid,
    pub hours_until_start: f64,
    pub credits_used: Credits,
    pub refund_percentage: u8,
    pub refund_amount: Credits,
    pub policy_applied: AppliedPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationResult {
    pub reservation_id: Ulid,
    pub refund_amount: Credits,
    pub refund_percentage: u8,
    pub policy_applied: AppliedPolicy,
}
