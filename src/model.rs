use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for bookkeeping timestamps only, never for stays.
pub type Ms = i64;

/// A calendar day. Stays have day granularity; there is no time of day.
pub type Day = NaiveDate;

/// Inclusive-interval intersection: two stays collide unless one ends
/// strictly before the other begins.
pub fn overlaps(a_start: Day, a_end: Day, b_start: Day, b_end: Day) -> bool {
    a_start <= b_end && b_start <= a_end
}

/// Closed interval `[start, end]` of calendar days.
///
/// Construction does not check ordering; the engine rejects inverted ranges
/// before they reach any listing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Day,
    pub end: Day,
}

impl DateRange {
    pub fn new(start: Day, end: Day) -> Self {
        Self { start, end }
    }

    pub fn single(day: Day) -> Self {
        Self { start: day, end: day }
    }

    pub fn is_inverted(&self) -> bool {
        self.start > self.end
    }

    /// Number of calendar days covered, both endpoints included.
    pub fn len_days(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_days() + 1
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains(&self, day: Day) -> bool {
        self.start <= day && day <= self.end
    }

    /// Every day in the range, ascending. Empty for an inverted range.
    pub fn days(&self) -> impl Iterator<Item = Day> + '_ {
        std::iter::successors(Some(self.start), |d| d.succ_opt()).take_while(move |d| *d <= self.end)
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// A reservation of a listing for a range of days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub guest_id: Ulid,
    pub range: DateRange,
    /// Set once the guest starts a checkout with the payment provider.
    pub payment_session_id: Option<String>,
    pub paid: bool,
    pub reserved_at: Ms,
}

#[derive(Debug, Clone)]
pub struct ListingState {
    pub id: Ulid,
    pub host_id: Ulid,
    /// Non-overlapping bookings, sorted by `range.start` (and therefore by `range.end`).
    pub bookings: Vec<Booking>,
}

impl ListingState {
    pub fn new(id: Ulid, host_id: Ulid) -> Self {
        Self {
            id,
            host_id,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by range.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.range.start <= booking.range.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings sharing at least one day with `query`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts after query.end.
        let right_bound = self
            .bookings
            .partition_point(|b| b.range.start <= query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end >= query.start)
    }

    /// Bookings that end on or after `not_before`.
    pub fn active(&self, not_before: Day) -> &[Booking] {
        let from = self.bookings.partition_point(|b| b.range.end < not_before);
        &self.bookings[from..]
    }

    pub fn unpaid(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| !b.paid)
    }
}

/// The event types. This is the WAL record format and the NOTIFY payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ListingCreated {
        id: Ulid,
        host_id: Ulid,
    },
    ListingDeleted {
        id: Ulid,
    },
    BookingReserved {
        id: Ulid,
        listing_id: Ulid,
        guest_id: Ulid,
        range: DateRange,
        reserved_at: Ms,
    },
    PaymentSessionAttached {
        id: Ulid,
        listing_id: Ulid,
        session_id: String,
    },
    BookingPaid {
        id: Ulid,
        listing_id: Ulid,
    },
    BookingRemoved {
        id: Ulid,
        listing_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingInfo {
    pub id: Ulid,
    pub host_id: Ulid,
    pub bookings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub guest_id: Ulid,
    pub start: Day,
    pub end: Day,
    pub payment_session_id: Option<String>,
    pub paid: bool,
    pub reserved_at: Ms,
}

impl BookingInfo {
    pub fn from_booking(listing_id: Ulid, b: &Booking) -> Self {
        Self {
            id: b.id,
            listing_id,
            guest_id: b.guest_id,
            start: b.range.start,
            end: b.range.end,
            payment_session_id: b.payment_session_id.clone(),
            paid: b.paid,
            reserved_at: b.reserved_at,
        }
    }
}

/// Result of applying a payment confirmation. Unmatched sessions are
/// expected (the booking may have been purged first) and are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Confirmed(Ulid),
    AlreadyPaid(Ulid),
    Unmatched,
}
