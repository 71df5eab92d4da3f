use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

pub const RESERVATIONS_CREATED_TOTAL: &str = "slotbook_reservations_created_total";
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "slotbook_reservations_cancelled_total";

/// Counter: bookings that lost a race for an interval.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotbook_booking_conflicts_total";

pub const INSUFFICIENT_CREDITS_TOTAL: &str = "slotbook_insufficient_credits_total";

/// Counter: credits returned to users by cancellations.
pub const CREDITS_REFUNDED_TOTAL: &str = "slotbook_credits_refunded_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRule { .. } => "insert_rule",
        Command::DeleteRule { .. } => "delete_rule",
        Command::InsertOverride { .. } => "insert_override",
        Command::DeleteOverride { .. } => "delete_override",
        Command::InsertPricing { .. } => "insert_pricing",
        Command::DeletePricing { .. } => "delete_pricing",
        Command::InsertPolicy { .. } => "insert_policy",
        Command::DeletePolicy => "delete_policy",
        Command::InsertSlot { .. } => "insert_slot",
        Command::InsertSlotStatus { .. } => "insert_slot_status",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertSlotTemplate { .. } => "insert_slot_template",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::InsertCancellation { .. } => "insert_cancellation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::InsertCredits { .. } => "insert_credits",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectBalance { .. } => "select_balance",
        Command::SelectCreditHistory { .. } => "select_credit_history",
        Command::SelectRefundPreview { .. } => "select_refund_preview",
        Command::SelectRules => "select_rules",
        Command::SelectOverrides => "select_overrides",
        Command::SelectPricing => "select_pricing",
        Command::SelectPolicy => "select_policy",
    }
}
