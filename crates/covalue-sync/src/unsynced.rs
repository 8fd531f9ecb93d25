//! Which values still have changes some peer has not acknowledged.
//!
//! The tracker is in-memory; every change is also queued as a
//! [`SyncStateUpdate`] that the owner flushes to storage, so unsynced values
//! can be resumed after a restart.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::watch;

use covalue_core::{CoId, PeerId};
use covalue_store::SyncStateUpdate;

#[derive(Debug)]
pub struct UnsyncedTracker {
    unsynced: HashMap<CoId, BTreeSet<PeerId>>,
    pending: Vec<SyncStateUpdate>,
    all_synced: watch::Sender<bool>,
}

impl Default for UnsyncedTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UnsyncedTracker {
    pub fn new() -> Self {
        Self {
            unsynced: HashMap::new(),
            pending: Vec::new(),
            all_synced: watch::Sender::new(true),
        }
    }

    /// `id` has changes `peer` has not seen yet.
    pub fn add(&mut self, id: &CoId, peer: &PeerId) {
        let peers = self.unsynced.entry(id.clone()).or_default();
        if peers.insert(peer.clone()) {
            self.pending.push(SyncStateUpdate {
                id: id.clone(),
                peer_id: peer.clone(),
                synced: false,
            });
            self.all_synced.send_replace(false);
        }
    }

    /// `peer` acknowledged everything in `id`.
    pub fn remove(&mut self, id: &CoId, peer: &PeerId) {
        let Some(peers) = self.unsynced.get_mut(id) else {
            return;
        };
        if !peers.remove(peer) {
            return;
        }
        if peers.is_empty() {
            self.unsynced.remove(id);
        }
        self.pending.push(SyncStateUpdate {
            id: id.clone(),
            peer_id: peer.clone(),
            synced: true,
        });
        self.all_synced.send_replace(self.unsynced.is_empty());
    }

    /// Forget `id` entirely; used when it is deleted.
    pub fn remove_all(&mut self, id: &CoId) {
        if let Some(peers) = self.unsynced.remove(id) {
            for peer in peers {
                self.pending.push(SyncStateUpdate {
                    id: id.clone(),
                    peer_id: peer,
                    synced: true,
                });
            }
            self.all_synced.send_replace(self.unsynced.is_empty());
        }
    }

    pub fn is_synced(&self, id: &CoId) -> bool {
        !self.unsynced.contains_key(id)
    }

    pub fn is_all_synced(&self) -> bool {
        self.unsynced.is_empty()
    }

    /// Peers `id` has not reached yet.
    pub fn peers_of(&self, id: &CoId) -> Vec<PeerId> {
        self.unsynced
            .get(id)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ids(&self) -> Vec<CoId> {
        self.unsynced.keys().cloned().collect()
    }

    /// Updates not yet written to storage.
    pub fn take_pending(&mut self) -> Vec<SyncStateUpdate> {
        std::mem::take(&mut self.pending)
    }

    /// Watch whether every value has reached every peer.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.all_synced.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn co(s: &str) -> CoId {
        CoId::parse(format!("co_z{s}")).unwrap()
    }

    #[test]
    fn test_add_remove_records_updates_once() {
        let mut tracker = UnsyncedTracker::new();
        let server = PeerId::from("server");

        tracker.add(&co("a"), &server);
        tracker.add(&co("a"), &server);
        assert!(!tracker.is_synced(&co("a")));
        assert_eq!(tracker.take_pending().len(), 1);

        tracker.remove(&co("a"), &server);
        tracker.remove(&co("a"), &server);
        let pending = tracker.take_pending();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].synced);
        assert!(tracker.is_all_synced());
    }

    #[test]
    fn test_synced_only_when_every_peer_acknowledged() {
        let mut tracker = UnsyncedTracker::new();
        tracker.add(&co("a"), &PeerId::from("s1"));
        tracker.add(&co("a"), &PeerId::from("s2"));
        tracker.remove(&co("a"), &PeerId::from("s1"));
        assert!(!tracker.is_synced(&co("a")));
        assert_eq!(tracker.peers_of(&co("a")), vec![PeerId::from("s2")]);
        tracker.remove_all(&co("a"));
        assert!(tracker.is_synced(&co("a")));
        assert!(tracker.ids().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_all_synced() {
        let mut tracker = UnsyncedTracker::new();
        let mut rx = tracker.subscribe();
        assert!(*rx.borrow());

        tracker.add(&co("a"), &PeerId::from("s"));
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());

        tracker.remove(&co("a"), &PeerId::from("s"));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
