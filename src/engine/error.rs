use thiserror::Error;
use ulid::Ulid;

use crate::engine::recurrence::RecurrenceParseError;
use crate::model::{Span, Subject};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or out-of-range input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Recurrence(#[from] RecurrenceParseError),
    #[error("{subject} is unavailable during {blocked}")]
    Unavailable { subject: Subject, blocked: Span },
    /// `with` is `None` only when commit retries ran out.
    #[error("{}", conflict_message(.with))]
    Conflict { with: Option<Ulid> },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("store error: {0}")]
    Store(StoreError),
}

fn conflict_message(with: &Option<Ulid>) -> String {
    match with {
        Some(id) => format!("conflict with booking: {id}"),
        None => "conflict: concurrent writes kept colliding".to_string(),
    }
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Validation and recurrence errors: the caller's input was bad.
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::Recurrence(_))
    }

    /// Short label for metrics.
    pub(crate) fn outcome(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::Recurrence(_) => "invalid",
            EngineError::Unavailable { .. } => "unavailable",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::Store(_) => "store_error",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::ExclusionViolation(id) => EngineError::Conflict { with: Some(id) },
            StoreError::AlreadyExists(id) => {
                EngineError::Validation(format!("id {id} is already taken"))
            }
            StoreError::Invalid(msg) => EngineError::Validation(msg),
            other => EngineError::Store(other),
        }
    }
}
