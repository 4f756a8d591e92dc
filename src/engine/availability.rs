use std::collections::BTreeSet;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// True iff no booking on the listing shares a day with `range`.
pub fn is_free(listing: &ListingState, range: &DateRange) -> bool {
    listing.overlapping(range).next().is_none()
}

/// Expand each booking day by day (both endpoints included) and union the
/// result. Single-day bookings contribute exactly one date.
pub fn booked_dates<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> BTreeSet<Day> {
    let mut dates = BTreeSet::new();
    for booking in bookings {
        dates.extend(booking.range.days());
    }
    dates
}

/// Merge sorted ranges that overlap or touch (`a.end + 1 == b.start`)
/// into disjoint ranges.
pub fn merge_ranges(sorted: &[DateRange]) -> Vec<DateRange> {
    let mut merged: Vec<DateRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && last.end.succ_opt().is_none_or(|next| range.start <= next)
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// Remove every day covered by `to_remove` from `base`. Both inputs must be
/// sorted and disjoint; the output is too.
pub fn subtract_ranges(base: &[DateRange], to_remove: &[DateRange]) -> Vec<DateRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = Some(b.start);

        while ri < to_remove.len() && to_remove[ri].end < b.start {
            ri += 1;
        }

        let mut j = ri;
        while let Some(start) = current_start {
            if j >= to_remove.len() || to_remove[j].start > b.end {
                break;
            }
            let r = &to_remove[j];
            if r.start > start
                && let Some(before) = r.start.pred_opt()
            {
                result.push(DateRange::new(start, before.min(b.end)));
            }
            current_start = if r.end >= start {
                r.end.succ_opt()
            } else {
                Some(start)
            };
            j += 1;
        }

        if let Some(start) = current_start
            && start <= b.end
        {
            result.push(DateRange::new(start, b.end));
        }
    }

    result
}

/// Maximal runs of unbooked days inside `window`.
pub fn free_ranges(listing: &ListingState, window: &DateRange) -> Vec<DateRange> {
    let booked: Vec<DateRange> = listing
        .overlapping(window)
        .map(|b| DateRange::new(b.range.start.max(window.start), b.range.end.min(window.end)))
        .collect();
    let booked = merge_ranges(&booked);
    subtract_ranges(&[*window], &booked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn d(s: &str) -> Day {
        s.parse().unwrap()
    }

    fn r(a: &str, b: &str) -> DateRange {
        DateRange::new(d(a), d(b))
    }

    fn listing_with(ranges: &[DateRange]) -> ListingState {
        let mut ls = ListingState::new(Ulid::new(), Ulid::new());
        for range in ranges {
            ls.insert_booking(Booking {
                id: Ulid::new(),
                guest_id: Ulid::new(),
                range: *range,
                payment_session_id: None,
                paid: false,
                reserved_at: 0,
            });
        }
        ls
    }

    #[test]
    fn empty_listing_is_free() {
        let ls = listing_with(&[]);
        assert!(is_free(&ls, &r("2024-01-01", "2024-12-31")));
    }

    #[test]
    fn booked_dates_multi_day() {
        let ls = listing_with(&[r("2024-01-10", "2024-01-12")]);
        let dates = booked_dates(&ls.bookings);
        let expected: BTreeSet<Day> = [d("2024-01-10"), d("2024-01-11"), d("2024-01-12")].into();
        assert_eq!(dates, expected);
    }

    #[test]
    fn booked_dates_single_day() {
        let ls = listing_with(&[r("2024-02-01", "2024-02-01")]);
        let dates = booked_dates(&ls.bookings);
        assert_eq!(dates, BTreeSet::from([d("2024-02-01")]));
    }

    #[test]
    fn booked_dates_union_of_several() {
        let ls = listing_with(&[r("2024-01-01", "2024-01-02"), r("2024-01-05", "2024-01-05")]);
        let dates = booked_dates(&ls.bookings);
        assert_eq!(dates.len(), 3);
        assert!(dates.contains(&d("2024-01-05")));
        assert!(!dates.contains(&d("2024-01-03")));
    }

    #[test]
    fn booked_dates_empty() {
        let ls = listing_with(&[]);
        assert!(booked_dates(&ls.bookings).is_empty());
    }

    #[test]
    fn merge_touching_ranges() {
        let merged = merge_ranges(&[r("2024-01-01", "2024-01-03"), r("2024-01-04", "2024-01-06")]);
        assert_eq!(merged, vec![r("2024-01-01", "2024-01-06")]);
    }

    #[test]
    fn merge_keeps_gaps() {
        let merged = merge_ranges(&[r("2024-01-01", "2024-01-03"), r("2024-01-05", "2024-01-06")]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_empty() {
        assert!(merge_ranges(&[]).is_empty());
    }

    #[test]
    fn subtract_middle() {
        let out = subtract_ranges(&[r("2024-01-01", "2024-01-31")], &[r("2024-01-10", "2024-01-12")]);
        assert_eq!(out, vec![r("2024-01-01", "2024-01-09"), r("2024-01-13", "2024-01-31")]);
    }

    #[test]
    fn subtract_edges() {
        let out = subtract_ranges(
            &[r("2024-01-01", "2024-01-31")],
            &[r("2023-12-25", "2024-01-01"), r("2024-01-31", "2024-02-05")],
        );
        assert_eq!(out, vec![r("2024-01-02", "2024-01-30")]);
    }

    #[test]
    fn subtract_everything() {
        let out = subtract_ranges(&[r("2024-01-05", "2024-01-06")], &[r("2024-01-01", "2024-01-31")]);
        assert!(out.is_empty());
    }

    #[test]
    fn subtract_empty_removals() {
        let base = [r("2024-01-01", "2024-01-02")];
        assert_eq!(subtract_ranges(&base, &[]), base.to_vec());
    }

    #[test]
    fn subtract_empty_base() {
        assert!(subtract_ranges(&[], &[r("2024-01-01", "2024-01-02")]).is_empty());
    }

    #[test]
    fn free_ranges_between_bookings() {
        let ls = listing_with(&[r("2024-01-03", "2024-01-04"), r("2024-01-08", "2024-01-08")]);
        let free = free_ranges(&ls, &r("2024-01-01", "2024-01-10"));
        assert_eq!(
            free,
            vec![
                r("2024-01-01", "2024-01-02"),
                r("2024-01-05", "2024-01-07"),
                r("2024-01-09", "2024-01-10"),
            ]
        );
    }

    #[test]
    fn free_ranges_back_to_back_bookings() {
        let ls = listing_with(&[r("2024-01-01", "2024-01-03"), r("2024-01-04", "2024-01-06")]);
        let free = free_ranges(&ls, &r("2024-01-01", "2024-01-07"));
        assert_eq!(free, vec![r("2024-01-07", "2024-01-07")]);
    }

    #[test]
    fn free_ranges_booking_wider_than_window() {
        let ls = listing_with(&[r("2023-12-01", "2024-02-01")]);
        assert!(free_ranges(&ls, &r("2024-01-01", "2024-01-31")).is_empty());
    }
}
