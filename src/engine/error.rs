use std::error::Error;
use std::fmt;

use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    EmailInUse(String),
    /// The requested span overlaps an existing active booking on the
    /// same resource.
    SlotConflict { booking_id: Ulid, resource_id: Ulid },
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    Validation(&'static str),
    Unauthorized(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::EmailInUse(email) => write!(f, "email already in use: {email}"),
            EngineError::SlotConflict {
                booking_id,
                resource_id,
            } => write!(
                f,
                "slot conflict with booking {booking_id} on resource {resource_id}"
            ),
            EngineError::InvalidTransition { from, to } => write!(
                f,
                "invalid transition: {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(msg) => write!(f, "wal error: {msg}"),
        }
    }
}

impl Error for EngineError {}
