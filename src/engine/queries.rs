use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::*;

use super::availability::{self, is_free};
use super::conflict::{check_order, today, validate_window};
use super::{Engine, EngineError, SharedListingState};

impl Engine {
    /// True iff no booking on the listing shares a day with `range`.
    /// An unknown listing has no bookings and is therefore available. Only
    /// the ordering of the range is checked: the lookup never expands days,
    /// so any span is answerable.
    pub async fn is_range_available(
        &self,
        listing_id: Ulid,
        range: DateRange,
    ) -> Result<bool, EngineError> {
        check_order(&range)?;
        let Some(ls) = self.get_listing(&listing_id) else {
            return Ok(true);
        };
        let guard = ls.read().await;
        Ok(is_free(&guard, &range))
    }

    /// Every day still booked from today (server-local) onward.
    pub async fn list_booked_dates(&self, listing_id: Ulid) -> BTreeSet<Day> {
        self.booked_dates(listing_id, today()).await
    }

    /// Days covered by bookings that end on or after `not_before`.
    pub async fn booked_dates(&self, listing_id: Ulid, not_before: Day) -> BTreeSet<Day> {
        let Some(ls) = self.get_listing(&listing_id) else {
            return BTreeSet::new();
        };
        let guard = ls.read().await;
        availability::booked_dates(guard.active(not_before))
    }

    pub async fn free_ranges(
        &self,
        listing_id: Ulid,
        window: DateRange,
    ) -> Result<Vec<DateRange>, EngineError> {
        validate_window(&window)?;
        let Some(ls) = self.get_listing(&listing_id) else {
            return Ok(vec![window]);
        };
        let guard = ls.read().await;
        Ok(availability::free_ranges(&guard, &window))
    }

    pub async fn list_bookings(&self, listing_id: Ulid) -> Vec<BookingInfo> {
        let Some(ls) = self.get_listing(&listing_id) else {
            return vec![];
        };
        let guard = ls.read().await;
        guard
            .bookings
            .iter()
            .map(|b| BookingInfo::from_booking(listing_id, b))
            .collect()
    }

    /// Bookings of a listing as seen by its host. Anyone else is refused.
    pub async fn host_bookings(
        &self,
        listing_id: Ulid,
        host_id: Ulid,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read().await;
        if guard.host_id != host_id {
            return Err(EngineError::Forbidden(listing_id));
        }
        Ok(guard
            .bookings
            .iter()
            .map(|b| BookingInfo::from_booking(listing_id, b))
            .collect())
    }

    pub async fn list_listings(&self) -> Vec<ListingInfo> {
        let listings: Vec<SharedListingState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(listings.len());
        for ls in listings {
            let guard = ls.read().await;
            out.push(ListingInfo {
                id: guard.id,
                host_id: guard.host_id,
                bookings: guard.bookings.len(),
            });
        }
        out.sort_by_key(|l| l.id);
        out
    }
}
