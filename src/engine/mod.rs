mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{booked_dates, free_ranges, is_free, merge_ranges, subtract_ranges};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedListingState = Arc<RwLock<ListingState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first Append, drains whatever else is already queued,
/// then issues one fsync for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        flush_and_respond(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so no partial frame leaks into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Reverse lookups maintained alongside listing state.
#[derive(Default)]
pub(super) struct EntityIndex {
    /// booking id → listing id
    pub(super) bookings: DashMap<Ulid, Ulid>,
    /// payment session id → booking id
    pub(super) sessions: DashMap<String, Ulid>,
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedListingState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) index: EntityIndex,
    /// Serializes listing create/delete with each other and with compaction.
    pub(super) catalog: Mutex<()>,
}

/// Apply a booking event to a listing (no locking; caller holds the lock).
fn apply_to_listing(ls: &mut ListingState, event: &Event, index: &EntityIndex) {
    match event {
        Event::BookingReserved {
            id,
            listing_id,
            guest_id,
            range,
            reserved_at,
        } => {
            ls.insert_booking(Booking {
                id: *id,
                guest_id: *guest_id,
                range: *range,
                payment_session_id: None,
                paid: false,
                reserved_at: *reserved_at,
            });
            index.bookings.insert(*id, *listing_id);
        }
        Event::PaymentSessionAttached { id, session_id, .. } => {
            if let Some(booking) = ls.booking_mut(*id) {
                if let Some(previous) = booking.payment_session_id.replace(session_id.clone()) {
                    index.sessions.remove(&previous);
                }
                index.sessions.insert(session_id.clone(), *id);
            }
        }
        Event::BookingPaid { id, .. } => {
            if let Some(booking) = ls.booking_mut(*id) {
                booking.paid = true;
            }
        }
        Event::BookingRemoved { id, .. } => {
            if let Some(booking) = ls.remove_booking(*id) {
                if let Some(session) = booking.payment_session_id {
                    index.sessions.remove(&session);
                }
            }
            index.bookings.remove(id);
        }
        // Listing lifecycle is handled at the DashMap level.
        Event::ListingCreated { .. } | Event::ListingDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            index: EntityIndex::default(),
            catalog: Mutex::new(()),
        };

        // We are the sole owner of these Arcs during replay, so try_write never
        // contends. blocking_write would panic inside an async context.
        for event in &events {
            match event {
                Event::ListingCreated { id, host_id } => {
                    let ls = ListingState::new(*id, *host_id);
                    engine.state.insert(*id, Arc::new(RwLock::new(ls)));
                }
                Event::ListingDeleted { id } => {
                    engine.state.remove(id);
                }
                other => {
                    let Some(listing_id) = event_listing_id(other) else { continue };
                    let Some(entry) = engine.state.get(&listing_id) else { continue };
                    let ls = entry.value().clone();
                    drop(entry);
                    if let Ok(mut guard) = ls.try_write() {
                        apply_to_listing(&mut guard, other, &engine.index);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_listing(&self, id: &Ulid) -> Option<SharedListingState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_listing_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.index.bookings.get(booking_id).map(|e| *e.value())
    }

    pub fn get_booking_for_session(&self, session_id: &str) -> Option<Ulid> {
        self.index.sessions.get(session_id).map(|e| *e.value())
    }

    /// WAL-append, apply, then notify subscribers of the listing.
    pub(super) async fn persist_and_apply(
        &self,
        listing_id: Ulid,
        ls: &mut ListingState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_listing(ls, event, &self.index);
        self.notify.send(listing_id, event);
        Ok(())
    }

    /// Lookup booking → listing, then take the listing's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ListingState>), EngineError> {
        let listing_id = self
            .get_listing_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = self.listing_write(listing_id).await?;
        Ok((listing_id, guard))
    }

    /// Take a listing's write lock. A listing deleted (or deleted and
    /// recreated) while we waited is reported as `NotFound`.
    pub(super) async fn listing_write(
        &self,
        listing_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ListingState>, EngineError> {
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.clone().write_owned().await;
        match self.state.get(&listing_id) {
            Some(current) if Arc::ptr_eq(current.value(), &ls) => Ok(guard),
            _ => Err(EngineError::NotFound(listing_id)),
        }
    }
}

/// The listing a booking event belongs to (None for listing lifecycle events).
fn event_listing_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingReserved { listing_id, .. }
        | Event::PaymentSessionAttached { listing_id, .. }
        | Event::BookingPaid { listing_id, .. }
        | Event::BookingRemoved { listing_id, .. } => Some(*listing_id),
        Event::ListingCreated { .. } | Event::ListingDeleted { .. } => None,
    }
}
