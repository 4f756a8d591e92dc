use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-listing broadcast channels backing LISTEN/NOTIFY.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a listing's events, creating its channel on first use.
    pub fn subscribe(&self, listing_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(listing_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fan an event out to the listing's subscribers. A channel whose
    /// receivers have all gone away is dropped.
    pub fn send(&self, listing_id: Ulid, event: &Event) {
        let Some(sender) = self.channels.get(&listing_id) else {
            return;
        };
        if sender.send(event.clone()).is_ok() {
            return;
        }
        drop(sender);
        self.channels
            .remove_if(&listing_id, |_, s| s.receiver_count() == 0);
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop a listing's channel; existing receivers see it closed.
    pub fn remove(&self, listing_id: &Ulid) {
        self.channels.remove(listing_id);
    }

    /// LISTEN channel name for a listing.
    pub fn channel_name(listing_id: Ulid) -> String {
        format!("listing_{listing_id}")
    }

    /// Inverse of `channel_name`. Case-insensitive, since PostgreSQL folds
    /// unquoted identifiers to lower case.
    pub fn parse_channel(name: &str) -> Option<Ulid> {
        let prefix = name.get(..8)?;
        if !prefix.eq_ignore_ascii_case("listing_") {
            return None;
        }
        Ulid::from_string(&name[8..].to_ascii_uppercase()).ok()
    }
}
