//! Cache of what storage holds per CoValue, with sync waiters.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::Notify;

use covalue_core::{CoId, KnownState};

#[derive(Default)]
pub struct StorageKnownState {
    states: Mutex<HashMap<CoId, KnownState>>,
    changed: Notify,
}

impl StorageKnownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached state, or an empty one.
    pub fn get(&self, id: &CoId) -> KnownState {
        self.states
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| KnownState::empty(id.clone()))
    }

    pub fn get_cached(&self, id: &CoId) -> Option<KnownState> {
        self.states.lock().get(id).cloned()
    }

    /// Overwrite the cached state.
    pub fn set(&self, id: &CoId, known: KnownState) {
        self.states.lock().insert(id.clone(), known);
        self.changed.notify_waiters();
    }

    /// Merge `known` into the cached state and wake waiters.
    pub fn handle_update(&self, id: &CoId, known: &KnownState) {
        self.states
            .lock()
            .entry(id.clone())
            .or_insert_with(|| KnownState::empty(id.clone()))
            .combine_with(known);
        self.changed.notify_waiters();
    }

    pub fn remove(&self, id: &CoId) {
        self.states.lock().remove(id);
    }

    pub fn clear(&self) {
        self.states.lock().clear();
        self.changed.notify_waiters();
    }

    /// Resolves once the cached state for `id` covers `target`.
    pub async fn wait_for_sync(&self, id: &CoId, target: &KnownState) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if target.is_subset_of(&self.get(id)) {
                return;
            }
            notified.await;
        }
    }
}
