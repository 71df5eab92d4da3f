use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use crate::engine::Engine;
use crate::notify::BookingNotice;

/// Rewrite the WAL as a snapshot once enough commits have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await {
            info!("WAL compacted");
        }
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("WAL compaction failed after {appends} appends: {e}");
            false
        }
    }
}

/// Log every booking notice for the schedule owner. Stops when the hub is dropped.
pub async fn run_notice_log(engine: Arc<Engine>, tenant: String) {
    let mut rx = engine.notify.subscribe_all();
    drop(engine);
    loop {
        match rx.recv().await {
            Ok(notice) => log_notice(&tenant, &notice),
            Err(RecvError::Lagged(n)) => tracing::warn!("[{tenant}] notice log lagged, {n} dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_notice(tenant: &str, notice: &BookingNotice) {
    match notice {
        BookingNotice::Created { reservation_id, user_id, date, span, .. } => {
            info!("[{tenant}] {user_id} booked {date} {span} ({reservation_id})");
        }
        BookingNotice::Cancelled { reservation_id, user_id, date, span, refund_amount } => {
            info!(
                "[{tenant}] {user_id} cancelled {date} {span} ({reservation_id}), refunded {refund_amount}"
            );
        }
    }
}
