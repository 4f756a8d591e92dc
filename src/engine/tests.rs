use std::collections::BTreeSet;

use super::*;
use super::conflict::{today, validate_range};
use crate::limits::*;

fn d(s: &str) -> Day {
    s.parse().unwrap()
}

fn range(a: &str, b: &str) -> DateRange {
    DateRange::new(d(a), d(b))
}

/// Stays far enough in the future that `list_booked_dates` never trims them.
fn future(offset_days: i64, len_days: i64) -> DateRange {
    let start = today() + chrono::Duration::days(offset_days);
    DateRange::new(start, start + chrono::Duration::days(len_days - 1))
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("stayd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

async fn engine_with_listing(name: &str) -> (Engine, Ulid, Ulid) {
    let engine = new_engine(name);
    let listing = Ulid::new();
    let host = Ulid::new();
    engine.create_listing(listing, host).await.unwrap();
    (engine, listing, host)
}

// ── Validation ───────────────────────────────────────────────

#[test]
fn inverted_range_is_invalid() {
    let r = range("2024-01-12", "2024-01-10");
    assert!(matches!(validate_range(&r), Err(EngineError::InvalidRange { .. })));
}

#[test]
fn stay_length_limit() {
    let start = d("2030-01-01");
    let ok = DateRange::new(start, start + chrono::Duration::days(MAX_STAY_DAYS - 1));
    assert!(validate_range(&ok).is_ok());
    let too_long = DateRange::new(start, start + chrono::Duration::days(MAX_STAY_DAYS));
    assert!(matches!(validate_range(&too_long), Err(EngineError::LimitExceeded(_))));
}

#[test]
fn dates_outside_calendar_rejected() {
    let r = range("1999-12-30", "2000-01-02");
    assert!(matches!(validate_range(&r), Err(EngineError::LimitExceeded(_))));
}

// ── Listings ─────────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_listings() {
    let engine = new_engine("create_list.wal");
    let host = Ulid::new();
    let a = Ulid::new();
    let b = Ulid::new();
    engine.create_listing(b, host).await.unwrap();
    engine.create_listing(a, host).await.unwrap();

    let listings = engine.list_listings().await;
    assert_eq!(listings.len(), 2);
    assert!(listings[0].id < listings[1].id);
    assert!(listings.iter().all(|l| l.host_id == host && l.bookings == 0));
}

#[tokio::test]
async fn duplicate_listing_rejected() {
    let (engine, listing, host) = engine_with_listing("dup_listing.wal").await;
    let result = engine.create_listing(listing, host).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(id)) if id == listing));
}

#[tokio::test]
async fn delete_listing_requires_owner_and_no_bookings() {
    let (engine, listing, host) = engine_with_listing("delete_listing.wal").await;
    let guest = Ulid::new();
    let booking = Ulid::new();
    engine
        .reserve(booking, listing, guest, range("2030-03-01", "2030-03-03"))
        .await
        .unwrap();

    let stranger = Ulid::new();
    assert!(matches!(
        engine.delete_listing(listing, stranger).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.delete_listing(listing, host).await,
        Err(EngineError::HasBookings(_))
    ));

    engine.cancel_booking(booking, guest).await.unwrap();
    engine.delete_listing(listing, host).await.unwrap();
    assert!(engine.get_listing(&listing).is_none());
    assert!(matches!(
        engine.delete_listing(listing, host).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Reservations ─────────────────────────────────────────────

#[tokio::test]
async fn disjoint_ranges_both_succeed() {
    let (engine, listing, _) = engine_with_listing("disjoint.wal").await;
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-01-01", "2024-01-03"))
        .await
        .unwrap();
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-01-10", "2024-01-12"))
        .await
        .unwrap();
    assert_eq!(engine.list_bookings(listing).await.len(), 2);
}

#[tokio::test]
async fn adjacent_ranges_do_not_conflict() {
    let (engine, listing, _) = engine_with_listing("adjacent.wal").await;
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-01-01", "2024-01-03"))
        .await
        .unwrap();
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-01-04", "2024-01-06"))
        .await
        .unwrap();
}

#[tokio::test]
async fn shared_boundary_day_conflicts() {
    let (engine, listing, _) = engine_with_listing("shared_day.wal").await;
    let first = Ulid::new();
    engine
        .reserve(first, listing, Ulid::new(), range("2024-01-01", "2024-01-03"))
        .await
        .unwrap();
    let result = engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-01-03", "2024-01-05"))
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(id)) if id == first));
}

#[tokio::test]
async fn overlapping_ranges_conflict() {
    let (engine, listing, _) = engine_with_listing("overlap.wal").await;
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-01-10", "2024-01-20"))
        .await
        .unwrap();

    for (a, b) in [
        ("2024-01-12", "2024-01-14"), // inside
        ("2024-01-05", "2024-01-25"), // covering
        ("2024-01-20", "2024-01-20"), // last day only
        ("2024-01-01", "2024-01-10"), // first day only
    ] {
        let result = engine.reserve(Ulid::new(), listing, Ulid::new(), range(a, b)).await;
        assert!(matches!(result, Err(EngineError::Conflict(_))), "{a}..{b}");
    }
    assert_eq!(engine.list_bookings(listing).await.len(), 1);
}

#[tokio::test]
async fn inverted_range_rejected_before_lookup() {
    let engine = new_engine("inverted.wal");
    let result = engine
        .reserve(Ulid::new(), Ulid::new(), Ulid::new(), range("2024-01-12", "2024-01-10"))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidRange { .. })));

    let query = engine
        .is_range_available(Ulid::new(), range("2024-01-12", "2024-01-10"))
        .await;
    assert!(matches!(query, Err(EngineError::InvalidRange { .. })));
}

#[tokio::test]
async fn reserve_unknown_listing_not_found() {
    let engine = new_engine("unknown_listing.wal");
    let listing = Ulid::new();
    let result = engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-01-01", "2024-01-02"))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(id)) if id == listing));
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let (engine, listing, _) = engine_with_listing("dup_booking.wal").await;
    let id = Ulid::new();
    engine
        .reserve(id, listing, Ulid::new(), range("2024-01-01", "2024-01-02"))
        .await
        .unwrap();
    let result = engine
        .reserve(id, listing, Ulid::new(), range("2024-02-01", "2024-02-02"))
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn concurrent_same_range_exactly_one_wins() {
    let path = test_wal_path("concurrent_same.wal");
    let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
    let listing = Ulid::new();
    engine.create_listing(listing, Ulid::new()).await.unwrap();

    let stay = range("2030-07-01", "2030-07-07");
    let mut handles = Vec::new();
    for _ in 0..32 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.reserve(Ulid::new(), listing, Ulid::new(), stay).await
        }));
    }

    let mut won = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 31);
    assert_eq!(engine.list_bookings(listing).await.len(), 1);
}

#[tokio::test]
async fn concurrent_disjoint_ranges_all_succeed() {
    let path = test_wal_path("concurrent_disjoint.wal");
    let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
    let listing = Ulid::new();
    engine.create_listing(listing, Ulid::new()).await.unwrap();

    let base = d("2030-01-01");
    let mut handles = Vec::new();
    for i in 0..20i64 {
        let eng = engine.clone();
        let start = base + chrono::Duration::days(i * 3);
        let stay = DateRange::new(start, start + chrono::Duration::days(1));
        handles.push(tokio::spawn(async move {
            eng.reserve(Ulid::new(), listing, Ulid::new(), stay).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let bookings = engine.list_bookings(listing).await;
    assert_eq!(bookings.len(), 20);
    assert!(bookings.windows(2).all(|w| w[0].end < w[1].start));
}

#[tokio::test]
async fn reserve_waiting_on_deleted_listing_is_not_found() {
    let path = test_wal_path("reserve_vs_delete.wal");
    let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap());
    let listing = Ulid::new();
    let host = Ulid::new();
    engine.create_listing(listing, host).await.unwrap();

    // Queue the delete, then the reservation, behind a held write lock.
    let ls = engine.get_listing(&listing).unwrap();
    let held = ls.write().await;
    let eng = engine.clone();
    let delete = tokio::spawn(async move { eng.delete_listing(listing, host).await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let eng = engine.clone();
    let reserve = tokio::spawn(async move {
        eng.reserve(Ulid::new(), listing, Ulid::new(), range("2030-02-01", "2030-02-03"))
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drop(held);

    delete.await.unwrap().unwrap();
    assert!(matches!(reserve.await.unwrap(), Err(EngineError::NotFound(id)) if id == listing));
    assert!(engine.get_listing(&listing).is_none());
    assert!(engine.index.bookings.is_empty());

    drop(engine);
    let reloaded = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert!(reloaded.get_listing(&listing).is_none());
    assert!(reloaded.index.bookings.is_empty());
}

// ── Queries ──────────────────────────────────────────────────

#[tokio::test]
async fn booked_dates_multi_day() {
    let (engine, listing, _) = engine_with_listing("booked_multi.wal").await;
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-01-10", "2024-01-12"))
        .await
        .unwrap();
    let dates = engine.booked_dates(listing, d("2024-01-01")).await;
    let expected: BTreeSet<Day> = [d("2024-01-10"), d("2024-01-11"), d("2024-01-12")].into();
    assert_eq!(dates, expected);
}

#[tokio::test]
async fn booked_dates_single_day() {
    let (engine, listing, _) = engine_with_listing("booked_single.wal").await;
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-02-01", "2024-02-01"))
        .await
        .unwrap();
    let dates = engine.booked_dates(listing, d("2024-01-01")).await;
    assert_eq!(dates, BTreeSet::from([d("2024-02-01")]));
}

#[tokio::test]
async fn booked_dates_skips_past_stays() {
    let (engine, listing, _) = engine_with_listing("booked_past.wal").await;
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-01-01", "2024-01-05"))
        .await
        .unwrap();
    let upcoming = future(10, 2);
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), upcoming)
        .await
        .unwrap();

    let dates = engine.list_booked_dates(listing).await;
    let expected: BTreeSet<Day> = upcoming.days().collect();
    assert_eq!(dates, expected);

    // A stay still in progress keeps all of its days.
    let partial = engine.booked_dates(listing, d("2024-01-03")).await;
    assert!(partial.contains(&d("2024-01-01")));
    assert_eq!(partial.len(), 5 + 2);
}

#[tokio::test]
async fn booked_dates_is_idempotent() {
    let (engine, listing, _) = engine_with_listing("booked_idem.wal").await;
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), future(3, 4))
        .await
        .unwrap();
    let first = engine.list_booked_dates(listing).await;
    let second = engine.list_booked_dates(listing).await;
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
}

#[tokio::test]
async fn empty_listing_always_available() {
    let (engine, listing, _) = engine_with_listing("empty_avail.wal").await;
    for (a, b) in [
        ("2024-01-01", "2024-01-01"),
        ("2024-01-01", "2024-12-31"),
        ("2099-06-01", "2099-06-30"),
    ] {
        assert!(engine.is_range_available(listing, range(a, b)).await.unwrap());
    }
    // Unknown listings have no bookings either.
    assert!(engine
        .is_range_available(Ulid::new(), range("2024-01-01", "2024-01-05"))
        .await
        .unwrap());
}

#[tokio::test]
async fn availability_answers_any_ordered_span() {
    let (engine, listing, _) = engine_with_listing("avail_any_span.wal").await;
    // Outside the bookable calendar and wider than any query window.
    assert!(engine.is_range_available(listing, range("1990-01-01", "1990-01-02")).await.unwrap());
    assert!(engine.is_range_available(listing, range("2001-01-01", "2150-12-31")).await.unwrap());

    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2030-04-01", "2030-04-03"))
        .await
        .unwrap();
    assert!(!engine.is_range_available(listing, range("2001-01-01", "2150-12-31")).await.unwrap());
    assert!(matches!(
        engine.is_range_available(listing, range("2150-12-31", "2001-01-01")).await,
        Err(EngineError::InvalidRange { .. })
    ));
}

#[tokio::test]
async fn availability_reflects_bookings() {
    let (engine, listing, _) = engine_with_listing("avail_bookings.wal").await;
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-05-10", "2024-05-12"))
        .await
        .unwrap();
    assert!(!engine.is_range_available(listing, range("2024-05-12", "2024-05-14")).await.unwrap());
    assert!(engine.is_range_available(listing, range("2024-05-13", "2024-05-14")).await.unwrap());
}

#[tokio::test]
async fn free_ranges_within_window() {
    let (engine, listing, _) = engine_with_listing("free_ranges.wal").await;
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-03-05", "2024-03-07"))
        .await
        .unwrap();
    engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-03-08", "2024-03-09"))
        .await
        .unwrap();

    let free = engine
        .free_ranges(listing, range("2024-03-01", "2024-03-15"))
        .await
        .unwrap();
    assert_eq!(
        free,
        vec![range("2024-03-01", "2024-03-04"), range("2024-03-10", "2024-03-15")]
    );

    let unknown = engine
        .free_ranges(Ulid::new(), range("2024-03-01", "2024-03-15"))
        .await
        .unwrap();
    assert_eq!(unknown, vec![range("2024-03-01", "2024-03-15")]);
}

#[tokio::test]
async fn free_ranges_window_limit() {
    let (engine, listing, _) = engine_with_listing("free_window.wal").await;
    let start = d("2030-01-01");
    let wide = DateRange::new(start, start + chrono::Duration::days(MAX_QUERY_WINDOW_DAYS));
    assert!(matches!(
        engine.free_ranges(listing, wide).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn host_bookings_only_for_owner() {
    let (engine, listing, host) = engine_with_listing("host_bookings.wal").await;
    let guest = Ulid::new();
    engine
        .reserve(Ulid::new(), listing, guest, range("2024-04-01", "2024-04-03"))
        .await
        .unwrap();

    let rows = engine.host_bookings(listing, host).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].guest_id, guest);
    assert_eq!(rows[0].listing_id, listing);

    assert!(matches!(
        engine.host_bookings(listing, Ulid::new()).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.host_bookings(Ulid::new(), host).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn cancel_frees_dates() {
    let (engine, listing, _) = engine_with_listing("cancel.wal").await;
    let guest = Ulid::new();
    let booking = Ulid::new();
    let stay = range("2024-06-01", "2024-06-05");
    engine.reserve(booking, listing, guest, stay).await.unwrap();

    assert!(matches!(
        engine.cancel_booking(booking, Ulid::new()).await,
        Err(EngineError::Forbidden(_))
    ));
    assert_eq!(engine.cancel_booking(booking, guest).await.unwrap(), listing);
    assert!(engine.is_range_available(listing, stay).await.unwrap());
    assert!(engine.get_listing_for_booking(&booking).is_none());
    assert!(matches!(
        engine.cancel_booking(booking, guest).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Payments ─────────────────────────────────────────────────

#[tokio::test]
async fn payment_flow_marks_booking_paid() {
    let (engine, listing, _) = engine_with_listing("payment_flow.wal").await;
    let guest = Ulid::new();
    let booking = Ulid::new();
    engine
        .reserve(booking, listing, guest, range("2024-07-01", "2024-07-03"))
        .await
        .unwrap();

    engine
        .attach_payment_session(booking, guest, "cs_test_1".into())
        .await
        .unwrap();
    assert_eq!(engine.get_booking_for_session("cs_test_1"), Some(booking));

    let outcome = engine.confirm_payment("cs_test_1").await.unwrap();
    assert_eq!(outcome, PaymentOutcome::Confirmed(booking));
    let again = engine.confirm_payment("cs_test_1").await.unwrap();
    assert_eq!(again, PaymentOutcome::AlreadyPaid(booking));

    let rows = engine.list_bookings(listing).await;
    assert!(rows[0].paid);
    assert_eq!(rows[0].payment_session_id.as_deref(), Some("cs_test_1"));
}

#[tokio::test]
async fn unknown_session_is_unmatched_and_changes_nothing() {
    let (engine, listing, _) = engine_with_listing("unknown_session.wal").await;
    let guest = Ulid::new();
    let booking = Ulid::new();
    engine
        .reserve(booking, listing, guest, range("2024-07-01", "2024-07-03"))
        .await
        .unwrap();
    engine
        .attach_payment_session(booking, guest, "cs_real".into())
        .await
        .unwrap();
    let before = engine.list_bookings(listing).await;

    let outcome = engine.confirm_payment("cs_nobody").await.unwrap();
    assert_eq!(outcome, PaymentOutcome::Unmatched);
    assert_eq!(engine.list_bookings(listing).await, before);
}

#[tokio::test]
async fn session_attach_rules() {
    let (engine, listing, _) = engine_with_listing("session_rules.wal").await;
    let guest = Ulid::new();
    let first = Ulid::new();
    let second = Ulid::new();
    engine
        .reserve(first, listing, guest, range("2024-08-01", "2024-08-02"))
        .await
        .unwrap();
    engine
        .reserve(second, listing, guest, range("2024-08-10", "2024-08-12"))
        .await
        .unwrap();

    engine.attach_payment_session(first, guest, "cs_a".into()).await.unwrap();
    // Same session again on the same booking is a no-op.
    engine.attach_payment_session(first, guest, "cs_a".into()).await.unwrap();

    assert!(matches!(
        engine.attach_payment_session(second, guest, "cs_a".into()).await,
        Err(EngineError::SessionInUse(_))
    ));
    assert!(matches!(
        engine.attach_payment_session(second, Ulid::new(), "cs_b".into()).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.attach_payment_session(Ulid::new(), guest, "cs_c".into()).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.attach_payment_session(second, guest, String::new()).await,
        Err(EngineError::LimitExceeded(_))
    ));

    // Switching to a new session releases the old one.
    engine.attach_payment_session(first, guest, "cs_a2".into()).await.unwrap();
    assert_eq!(engine.get_booking_for_session("cs_a"), None);
    assert_eq!(engine.confirm_payment("cs_a").await.unwrap(), PaymentOutcome::Unmatched);
    assert_eq!(engine.confirm_payment("cs_a2").await.unwrap(), PaymentOutcome::Confirmed(first));
}

// ── Purge ────────────────────────────────────────────────────

#[tokio::test]
async fn purge_unpaid_frees_dates_for_rebooking() {
    let (engine, listing, _) = engine_with_listing("purge_rebook.wal").await;
    let stay = range("2024-01-10", "2024-01-12");
    engine.reserve(Ulid::new(), listing, Ulid::new(), stay).await.unwrap();

    assert_eq!(engine.purge_unpaid().await.unwrap(), 1);
    assert!(engine.booked_dates(listing, d("2024-01-01")).await.is_empty());
    engine.reserve(Ulid::new(), listing, Ulid::new(), stay).await.unwrap();
}

#[tokio::test]
async fn purge_keeps_paid_bookings() {
    let (engine, listing, _) = engine_with_listing("purge_paid.wal").await;
    let guest = Ulid::new();
    let paid = Ulid::new();
    engine
        .reserve(paid, listing, guest, range("2024-09-01", "2024-09-03"))
        .await
        .unwrap();
    engine.attach_payment_session(paid, guest, "cs_paid".into()).await.unwrap();
    engine.confirm_payment("cs_paid").await.unwrap();

    let unpaid = Ulid::new();
    engine
        .reserve(unpaid, listing, guest, range("2024-09-10", "2024-09-12"))
        .await
        .unwrap();
    engine.attach_payment_session(unpaid, guest, "cs_open".into()).await.unwrap();

    assert_eq!(engine.purge_unpaid().await.unwrap(), 1);
    let rows = engine.list_bookings(listing).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, paid);

    // A confirmation arriving after the purge finds nothing.
    assert_eq!(engine.get_booking_for_session("cs_open"), None);
    assert_eq!(engine.confirm_payment("cs_open").await.unwrap(), PaymentOutcome::Unmatched);
}

#[tokio::test]
async fn purge_with_cutoff_spares_recent_holds() {
    let (engine, listing, _) = engine_with_listing("purge_cutoff.wal").await;
    let old = engine
        .reserve(Ulid::new(), listing, Ulid::new(), range("2024-10-01", "2024-10-02"))
        .await
        .unwrap();

    // Anything reserved at or after the cutoff survives.
    assert_eq!(engine.purge_unpaid_before(old.reserved_at).await.unwrap(), 0);
    assert_eq!(engine.purge_unpaid_before(old.reserved_at + 1).await.unwrap(), 1);
    assert!(engine.list_bookings(listing).await.is_empty());
}

// ── Notifications ────────────────────────────────────────────

#[tokio::test]
async fn subscribers_see_listing_events() {
    let (engine, listing, _) = engine_with_listing("notify.wal").await;
    let mut rx = engine.notify.subscribe(listing);

    let booking = Ulid::new();
    engine
        .reserve(booking, listing, Ulid::new(), range("2024-11-01", "2024-11-02"))
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        Event::BookingReserved { id, listing_id, .. } => {
            assert_eq!(id, booking);
            assert_eq!(listing_id, listing);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn failed_reservation_sends_nothing() {
    let (engine, listing, _) = engine_with_listing("notify_conflict.wal").await;
    let stay = range("2024-11-01", "2024-11-02");
    engine.reserve(Ulid::new(), listing, Ulid::new(), stay).await.unwrap();

    let mut rx = engine.notify.subscribe(listing);
    assert!(engine.reserve(Ulid::new(), listing, Ulid::new(), stay).await.is_err());
    assert!(rx.try_recv().is_err());
}

// ── WAL replay ───────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_bookings_sessions_and_paid_flags() {
    let path = test_wal_path("replay_full.wal");
    let listing = Ulid::new();
    let host = Ulid::new();
    let guest = Ulid::new();
    let paid = Ulid::new();
    let pending = Ulid::new();
    let cancelled = Ulid::new();

    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine.create_listing(listing, host).await.unwrap();
        engine
            .reserve(paid, listing, guest, range("2024-12-01", "2024-12-03"))
            .await
            .unwrap();
        engine
            .reserve(pending, listing, guest, range("2024-12-10", "2024-12-11"))
            .await
            .unwrap();
        engine
            .reserve(cancelled, listing, guest, range("2024-12-20", "2024-12-21"))
            .await
            .unwrap();
        engine.attach_payment_session(paid, guest, "cs_paid".into()).await.unwrap();
        engine.attach_payment_session(pending, guest, "cs_pending".into()).await.unwrap();
        engine.confirm_payment("cs_paid").await.unwrap();
        engine.cancel_booking(cancelled, guest).await.unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let rows = engine.host_bookings(listing, host).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, paid);
    assert!(rows[0].paid);
    assert_eq!(rows[1].id, pending);
    assert!(!rows[1].paid);
    assert_eq!(rows[1].payment_session_id.as_deref(), Some("cs_pending"));

    assert_eq!(engine.get_listing_for_booking(&cancelled), None);
    assert_eq!(engine.get_booking_for_session("cs_pending"), Some(pending));
    assert_eq!(
        engine.confirm_payment("cs_pending").await.unwrap(),
        PaymentOutcome::Confirmed(pending)
    );
    assert!(!engine
        .is_range_available(listing, range("2024-12-03", "2024-12-04"))
        .await
        .unwrap());
}

#[tokio::test]
async fn replay_drops_deleted_listings() {
    let path = test_wal_path("replay_deleted.wal");
    let keep = Ulid::new();
    let gone = Ulid::new();
    let host = Ulid::new();
    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine.create_listing(keep, host).await.unwrap();
        engine.create_listing(gone, host).await.unwrap();
        engine.delete_listing(gone, host).await.unwrap();
    }
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let ids: Vec<Ulid> = engine.list_listings().await.into_iter().map(|l| l.id).collect();
    assert_eq!(ids, vec![keep]);
}

// ── WAL compaction ───────────────────────────────────────────

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    let listing = Ulid::new();
    engine.create_listing(listing, Ulid::new()).await.unwrap();
    let guest = Ulid::new();

    // Churn: reserve and cancel the same dates repeatedly.
    for _ in 0..20 {
        let tmp = Ulid::new();
        engine
            .reserve(tmp, listing, guest, range("2025-01-01", "2025-01-03"))
            .await
            .unwrap();
        engine.cancel_booking(tmp, guest).await.unwrap();
    }
    let kept = Ulid::new();
    engine
        .reserve(kept, listing, guest, range("2025-02-01", "2025-02-05"))
        .await
        .unwrap();
    engine.attach_payment_session(kept, guest, "cs_kept".into()).await.unwrap();
    engine.confirm_payment("cs_kept").await.unwrap();

    let before = engine.list_bookings(listing).await;
    let size_before = std::fs::metadata(&path).unwrap().len();

    engine.compact_wal().await.unwrap();

    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than original ({size_before})");
    assert_eq!(engine.list_bookings(listing).await, before);
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let listing = Ulid::new();
    let host = Ulid::new();
    let guest = Ulid::new();
    let paid = Ulid::new();
    let after_compact = Ulid::new();

    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine.create_listing(listing, host).await.unwrap();
        engine
            .reserve(paid, listing, guest, range("2025-03-01", "2025-03-04"))
            .await
            .unwrap();
        engine.attach_payment_session(paid, guest, "cs_1".into()).await.unwrap();
        engine.confirm_payment("cs_1").await.unwrap();
        for _ in 0..10 {
            let tmp = Ulid::new();
            engine
                .reserve(tmp, listing, guest, range("2025-04-01", "2025-04-02"))
                .await
                .unwrap();
            engine.cancel_booking(tmp, guest).await.unwrap();
        }

        engine.compact_wal().await.unwrap();

        // Appends after compaction land in the new log.
        engine
            .reserve(after_compact, listing, guest, range("2025-05-01", "2025-05-02"))
            .await
            .unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let rows = engine.host_bookings(listing, host).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, paid);
    assert!(rows[0].paid);
    assert_eq!(rows[0].payment_session_id.as_deref(), Some("cs_1"));
    assert_eq!(rows[1].id, after_compact);
    assert_eq!(engine.confirm_payment("cs_1").await.unwrap(), PaymentOutcome::AlreadyPaid(paid));
}

// ── Group-commit WAL ─────────────────────────────────────────

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for _ in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move { eng.create_listing(Ulid::new(), Ulid::new()).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_listings().await.len(), n);

    let engine2 = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine2.list_listings().await.len(), n);
}

#[tokio::test]
async fn wal_appends_since_compact_through_channel() {
    let (engine, listing, _) = engine_with_listing("appends_counter.wal").await;
    let guest = Ulid::new();
    let booking = Ulid::new();
    engine
        .reserve(booking, listing, guest, range("2025-06-01", "2025-06-02"))
        .await
        .unwrap();
    engine.cancel_booking(booking, guest).await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 3);

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}

// ── Limits ───────────────────────────────────────────────────

#[tokio::test]
async fn session_id_length_limit() {
    let (engine, listing, _) = engine_with_listing("session_len.wal").await;
    let guest = Ulid::new();
    let booking = Ulid::new();
    engine
        .reserve(booking, listing, guest, range("2025-07-01", "2025-07-02"))
        .await
        .unwrap();

    let at_limit = "s".repeat(MAX_SESSION_ID_LEN);
    engine.attach_payment_session(booking, guest, at_limit).await.unwrap();
    let over = "s".repeat(MAX_SESSION_ID_LEN + 1);
    assert!(matches!(
        engine.attach_payment_session(booking, guest, over).await,
        Err(EngineError::LimitExceeded(_))
    ));
}
