//! Hard limits applied at the engine and tenant boundaries.

use chrono::NaiveDate;

use crate::model::Day;

pub const MAX_LISTINGS_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_LISTING: usize = 10_000;

/// Longest single stay, in days (both endpoints counted).
pub const MAX_STAY_DAYS: i64 = 366;

/// Widest window accepted by range-scanning queries.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3_660;

pub const MIN_VALID_DATE: Day = match NaiveDate::from_ymd_opt(2000, 1, 1) {
    Some(d) => d,
    None => panic!("invalid MIN_VALID_DATE"),
};
pub const MAX_VALID_DATE: Day = match NaiveDate::from_ymd_opt(2199, 12, 31) {
    Some(d) => d,
    None => panic!("invalid MAX_VALID_DATE"),
};

pub const MAX_SESSION_ID_LEN: usize = 255;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;
