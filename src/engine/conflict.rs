use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// The server's local calendar day.
pub(crate) fn today() -> Day {
    chrono::Local::now().date_naive()
}

/// `start > end` is never a valid range, whatever the operation.
pub(crate) fn check_order(range: &DateRange) -> Result<(), EngineError> {
    if range.is_inverted() {
        return Err(EngineError::InvalidRange {
            start: range.start,
            end: range.end,
        });
    }
    Ok(())
}

fn check_bounds(range: &DateRange) -> Result<(), EngineError> {
    check_order(range)?;
    if range.start < MIN_VALID_DATE || range.end > MAX_VALID_DATE {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

/// Validate a stay: ordered, inside the supported calendar, not too long.
pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    check_bounds(range)?;
    if range.len_days() > MAX_STAY_DAYS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

/// Validate a query window, which may be wider than any single stay.
pub(crate) fn validate_window(range: &DateRange) -> Result<(), EngineError> {
    check_bounds(range)?;
    if range.len_days() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// Any booking sharing a day with `range` is a conflict. Caller holds the
/// listing write lock, so the answer stays true until the insert lands.
pub(crate) fn check_no_conflict(ls: &ListingState, range: &DateRange) -> Result<(), EngineError> {
    match ls.overlapping(range).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
