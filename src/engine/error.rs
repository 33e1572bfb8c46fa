use thiserror::Error;
use ulid::Ulid;

use crate::model::{Booking, BookingId, RoomId, ValidationError};

use super::conflict::ConflictScope;
use super::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    /// Every booking that collides, ordered by start time. Never empty.
    #[error("{} conflict with {}", .scope, describe(.conflicts))]
    Conflict {
        scope: ConflictScope,
        conflicts: Vec<Booking>,
    },
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Ulid },
    #[error("room {0} is not accepting bookings")]
    RoomUnavailable(RoomId),
    #[error("booking {id}: {reason}")]
    InvalidState { id: BookingId, reason: &'static str },
    #[error("inconsistent postponement {id}: {detail}")]
    Inconsistency { id: Ulid, detail: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

fn describe(conflicts: &[Booking]) -> String {
    match conflicts.first() {
        Some(first) => format!(
            "{:?} ({}), {} total",
            first.subject,
            first.slot,
            conflicts.len()
        ),
        None => "nothing".to_string(),
    }
}

impl EngineError {
    pub(super) fn booking_not_found(id: BookingId) -> Self {
        EngineError::NotFound { kind: "booking", id }
    }

    /// The booking to show a user resolving a conflict.
    pub fn first_conflict(&self) -> Option<&Booking> {
        match self {
            EngineError::Conflict { conflicts, .. } => conflicts.first(),
            _ => None,
        }
    }

    /// Store failures leave state recoverable; the caller may repeat the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(_))
    }
}
