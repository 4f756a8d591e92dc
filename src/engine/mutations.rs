use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_PURGED_TOTAL, PAYMENTS_TOTAL, RESERVATIONS_TOTAL};

use super::conflict::{check_no_conflict, now_ms, validate_range};
use super::{Engine, EngineError, SharedListingState, WalCommand};

impl Engine {
    pub async fn create_listing(&self, id: Ulid, host_id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_LISTINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many listings"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ListingCreated { id, host_id };
        self.wal_append(&event).await?;
        let ls = ListingState::new(id, host_id);
        self.state.insert(id, Arc::new(RwLock::new(ls)));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Only the owning host may delete, and only once no bookings remain.
    pub async fn delete_listing(&self, id: Ulid, host_id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let ls = self.get_listing(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ls.write().await;
        if guard.host_id != host_id {
            return Err(EngineError::Forbidden(id));
        }
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::ListingDeleted { id };
        self.wal_append(&event).await?;
        self.state.remove(&id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// Reserve `range` for `guest_id`. Validation, the availability re-check,
    /// the WAL append and the in-memory insert all happen under the listing's
    /// write lock, so two overlapping reservations can never both land.
    pub async fn reserve(
        &self,
        id: Ulid,
        listing_id: Ulid,
        guest_id: Ulid,
        range: DateRange,
    ) -> Result<Booking, EngineError> {
        let result = self.reserve_inner(id, listing_id, guest_id, range).await;
        let outcome = match &result {
            Ok(_) => "reserved",
            Err(EngineError::Conflict(_)) => "conflict",
            Err(_) => "rejected",
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn reserve_inner(
        &self,
        id: Ulid,
        listing_id: Ulid,
        guest_id: Ulid,
        range: DateRange,
    ) -> Result<Booking, EngineError> {
        validate_range(&range)?;
        let mut guard = self.listing_write(listing_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many bookings on listing"));
        }
        if self.index.bookings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        check_no_conflict(&guard, &range)?;

        let reserved_at = now_ms();
        let event = Event::BookingReserved {
            id,
            listing_id,
            guest_id,
            range,
            reserved_at,
        };
        self.persist_and_apply(listing_id, &mut guard, &event).await?;
        Ok(Booking {
            id,
            guest_id,
            range,
            payment_session_id: None,
            paid: false,
            reserved_at,
        })
    }

    /// Record the payment-provider session a guest opened for a booking.
    /// Re-attaching the same session is a no-op; a session already bound to
    /// another booking is rejected.
    pub async fn attach_payment_session(
        &self,
        booking_id: Ulid,
        guest_id: Ulid,
        session_id: String,
    ) -> Result<(), EngineError> {
        if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
            return Err(EngineError::LimitExceeded("payment session id length"));
        }
        let (listing_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.guest_id != guest_id {
            return Err(EngineError::Forbidden(booking_id));
        }

        // Claim the session id before the await so a concurrent attach on
        // another listing cannot take it too. The entry guard must not
        // outlive this block.
        match self.index.sessions.entry(session_id.clone()) {
            Entry::Occupied(e) if *e.get() == booking_id => return Ok(()),
            Entry::Occupied(_) => return Err(EngineError::SessionInUse(session_id)),
            Entry::Vacant(v) => {
                v.insert(booking_id);
            }
        }

        let event = Event::PaymentSessionAttached {
            id: booking_id,
            listing_id,
            session_id: session_id.clone(),
        };
        if let Err(e) = self.persist_and_apply(listing_id, &mut guard, &event).await {
            self.index
                .sessions
                .remove_if(&session_id, |_, owner| *owner == booking_id);
            return Err(e);
        }
        Ok(())
    }

    /// Apply an out-of-band payment confirmation. A session that matches no
    /// booking (for instance because the purge got there first) is logged and
    /// reported as `Unmatched`, never raised.
    pub async fn confirm_payment(&self, session_id: &str) -> Result<PaymentOutcome, EngineError> {
        let outcome = self.confirm_payment_inner(session_id).await?;
        let label = match outcome {
            PaymentOutcome::Confirmed(_) => "confirmed",
            PaymentOutcome::AlreadyPaid(_) => "already_paid",
            PaymentOutcome::Unmatched => {
                warn!(session_id, "payment confirmation matched no booking");
                "unmatched"
            }
        };
        metrics::counter!(PAYMENTS_TOTAL, "outcome" => label).increment(1);
        Ok(outcome)
    }

    async fn confirm_payment_inner(&self, session_id: &str) -> Result<PaymentOutcome, EngineError> {
        let Some(booking_id) = self.get_booking_for_session(session_id) else {
            return Ok(PaymentOutcome::Unmatched);
        };
        let (listing_id, mut guard) = match self.resolve_booking_write(&booking_id).await {
            Ok(found) => found,
            Err(EngineError::NotFound(_)) => return Ok(PaymentOutcome::Unmatched),
            Err(e) => return Err(e),
        };
        // Re-check under the lock: the booking may have been removed or
        // moved to another session while we waited.
        let Some(booking) = guard.booking(booking_id) else {
            return Ok(PaymentOutcome::Unmatched);
        };
        if booking.payment_session_id.as_deref() != Some(session_id) {
            return Ok(PaymentOutcome::Unmatched);
        }
        if booking.paid {
            return Ok(PaymentOutcome::AlreadyPaid(booking_id));
        }

        let event = Event::BookingPaid {
            id: booking_id,
            listing_id,
        };
        self.persist_and_apply(listing_id, &mut guard, &event).await?;
        Ok(PaymentOutcome::Confirmed(booking_id))
    }

    /// The guest releases their booking. Returns the listing it belonged to.
    pub async fn cancel_booking(&self, booking_id: Ulid, guest_id: Ulid) -> Result<Ulid, EngineError> {
        let (listing_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.guest_id != guest_id {
            return Err(EngineError::Forbidden(booking_id));
        }
        let event = Event::BookingRemoved {
            id: booking_id,
            listing_id,
        };
        self.persist_and_apply(listing_id, &mut guard, &event).await?;
        Ok(listing_id)
    }

    /// Remove every unpaid booking across all listings.
    pub async fn purge_unpaid(&self) -> Result<usize, EngineError> {
        self.purge_where(|_| true).await
    }

    /// Remove unpaid bookings reserved strictly before `cutoff`. Younger
    /// holds keep their dates until a later pass.
    pub async fn purge_unpaid_before(&self, cutoff: Ms) -> Result<usize, EngineError> {
        self.purge_where(|b| b.reserved_at < cutoff).await
    }

    async fn purge_where(&self, eligible: impl Fn(&Booking) -> bool) -> Result<usize, EngineError> {
        let listings: Vec<(Ulid, SharedListingState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut removed = 0usize;
        for (listing_id, ls) in listings {
            let mut guard = ls.write().await;
            let (doomed, kept): (Vec<&Booking>, Vec<&Booking>) =
                guard.unpaid().partition(|b| eligible(b));
            if !kept.is_empty() {
                debug!(listing = %listing_id, kept = kept.len(), "unpaid bookings still inside grace period");
            }
            let doomed: Vec<Ulid> = doomed.into_iter().map(|b| b.id).collect();
            for id in doomed {
                let event = Event::BookingRemoved { id, listing_id };
                self.persist_and_apply(listing_id, &mut guard, &event).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "purged unpaid bookings");
        }
        metrics::counter!(BOOKINGS_PURGED_TOTAL).increment(removed as u64);
        Ok(removed)
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    /// Listing read locks are held until the new log is in place, so no
    /// booking write can slip between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        let mut listings: Vec<(Ulid, SharedListingState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        listings.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(listings.len());
        for (_, ls) in listings {
            guards.push(ls.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ListingCreated {
                id: guard.id,
                host_id: guard.host_id,
            });
            for b in &guard.bookings {
                events.push(Event::BookingReserved {
                    id: b.id,
                    listing_id: guard.id,
                    guest_id: b.guest_id,
                    range: b.range,
                    reserved_at: b.reserved_at,
                });
                if let Some(session_id) = &b.payment_session_id {
                    events.push(Event::PaymentSessionAttached {
                        id: b.id,
                        listing_id: guard.id,
                        session_id: session_id.clone(),
                    });
                }
                if b.paid {
                    events.push(Event::BookingPaid {
                        id: b.id,
                        listing_id: guard.id,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
