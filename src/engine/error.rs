use ulid::Ulid;

use crate::model::Day;

#[derive(Debug)]
pub enum EngineError {
    /// Start day after end day.
    InvalidRange { start: Day, end: Day },
    /// The requested stay overlaps an existing booking.
    Conflict(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Caller is not the guest or host that owns the entity.
    Forbidden(Ulid),
    HasBookings(Ulid),
    SessionInUse(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { start, end } => {
                write!(f, "invalid date range: start {start} is after end {end}")
            }
            EngineError::Conflict(id) => write!(f, "already booked (conflicts with booking {id})"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Forbidden(id) => write!(f, "not permitted on {id}"),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete listing {id}: has bookings")
            }
            EngineError::SessionInUse(s) => {
                write!(f, "payment session {s} is attached to another booking")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
