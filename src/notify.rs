use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Credits, Reservation, Span, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget signal published after a reservation commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookingNotice {
    Created {
        reservation_id: Ulid,
        user_id: UserId,
        date: NaiveDate,
        span: Span,
        credits_used: Credits,
    },
    Cancelled {
        reservation_id: Ulid,
        user_id: UserId,
        date: NaiveDate,
        span: Span,
        refund_amount: Credits,
    },
}

impl BookingNotice {
    pub fn created(r: &Reservation) -> Self {
        BookingNotice::Created {
            reservation_id: r.id,
            user_id: r.user_id.clone(),
            date: r.date,
            span: r.span,
            credits_used: r.credits_used,
        }
    }

    pub fn cancelled(r: &Reservation, refund_amount: Credits) -> Self {
        BookingNotice::Cancelled {
            reservation_id: r.id,
            user_id: r.user_id.clone(),
            date: r.date,
            span: r.span,
            refund_amount,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            BookingNotice::Created { user_id, .. } | BookingNotice::Cancelled { user_id, .. } => user_id,
        }
    }

    /// JSON body for downstream dispatchers.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast hub for booking notices, one channel per user plus a firehose.
pub struct NotifyHub {
    users: DashMap<UserId, broadcast::Sender<BookingNotice>>,
    all: broadcast::Sender<BookingNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one user's notices. Creates the channel if needed.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<BookingNotice> {
        let sender = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Every notice for the schedule owner.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingNotice> {
        self.all.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, notice: &BookingNotice) {
        if let Some(sender) = self.users.get(notice.user_id()) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice.clone());
    }

    pub fn remove(&self, user_id: &str) {
        self.users.remove(user_id);
    }
}
