use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Credits, Span};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("slot {date} {span} is already taken")]
    SlotAlreadyTaken { date: NaiveDate, span: Span },
    #[error("slot not bookable: {0}")]
    SlotNotBookable(String),
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: Credits, available: Credits },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("reservation {0} is already cancelled")]
    AlreadyCancelled(Ulid),
    #[error("reservation {0} has already taken place")]
    AlreadyCompleted(Ulid),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Conflicts a client can resolve by re-reading availability and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::SlotAlreadyTaken { .. } | EngineError::SlotNotBookable(_)
        )
    }

    /// Short, stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::SlotAlreadyTaken { .. } => "slot_already_taken",
            EngineError::SlotNotBookable(_) => "slot_not_bookable",
            EngineError::InsufficientCredits { .. } => "insufficient_credits",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::AlreadyCompleted(_) => "already_completed",
            EngineError::InvalidTransition(_) => "invalid_transition",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Persistence(_) => "persistence",
        }
    }
}
