//! What a node knows about each connected peer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use covalue_core::{CoId, KnownState, PeerId};

use crate::load_queue::{LoadQueueConfig, OutgoingLoadQueue};
use crate::messages::SyncMessage;
use crate::transport::Transport;

/// The role a peer plays towards this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Authoritative upstream: loads go here and local changes are pushed.
    Server,
    /// Downstream: receives only what it subscribed to.
    Client,
}

/// State held per connected peer.
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    transport: Arc<dyn Transport>,

    /// Acknowledged by the peer.
    known: Mutex<HashMap<CoId, KnownState>>,
    /// What we assume the peer has after our own sends.
    optimistic: Mutex<HashMap<CoId, KnownState>>,
    /// Values we already told the peer about.
    told_known: Mutex<HashSet<CoId>>,

    load_queue: Mutex<OutgoingLoadQueue>,
}

impl fmt::Debug for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerState")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerState {
    pub fn new(
        id: PeerId,
        role: PeerRole,
        transport: Arc<dyn Transport>,
        load_queue: LoadQueueConfig,
        timer_tx: Option<mpsc::UnboundedSender<PeerId>>,
    ) -> Self {
        Self {
            load_queue: Mutex::new(OutgoingLoadQueue::new(id.clone(), load_queue, timer_tx)),
            id,
            role,
            transport,
            known: Mutex::new(HashMap::new()),
            optimistic: Mutex::new(HashMap::new()),
            told_known: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == PeerRole::Server
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Send `msg`, logging instead of failing if the peer is gone.
    pub fn push(&self, msg: SyncMessage) {
        if let Err(e) = self.transport.send(msg) {
            warn!(peer = %self.id, error = %e, "Failed to send message");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Known states
    // ─────────────────────────────────────────────────────────────────────────

    /// What the peer acknowledged for `id`.
    pub fn known_state(&self, id: &CoId) -> Option<KnownState> {
        self.known.lock().get(id).cloned()
    }

    /// What we assume the peer has, falling back to what it acknowledged.
    pub fn optimistic_known_state(&self, id: &CoId) -> Option<KnownState> {
        self.optimistic
            .lock()
            .get(id)
            .cloned()
            .or_else(|| self.known_state(id))
    }

    /// Is the peer following `id`?
    pub fn is_subscribed(&self, id: &CoId) -> bool {
        self.known.lock().contains_key(id) || self.optimistic.lock().contains_key(id)
    }

    /// Replace both views with what the peer declared.
    pub fn set_known_state(&self, known: KnownState) {
        self.optimistic.lock().insert(known.id.clone(), known.clone());
        self.known.lock().insert(known.id.clone(), known);
    }

    /// Merge an acknowledgement into both views.
    pub fn combine_known_state(&self, known: &KnownState) {
        for map in [&self.known, &self.optimistic] {
            map.lock()
                .entry(known.id.clone())
                .and_modify(|current| current.combine_with(known))
                .or_insert_with(|| known.clone());
        }
    }

    /// Assume the peer now also has `sent`.
    pub fn combine_optimistic(&self, sent: &KnownState) {
        let confirmed = self.known_state(&sent.id);
        self.optimistic
            .lock()
            .entry(sent.id.clone())
            .or_insert_with(|| confirmed.unwrap_or_else(|| KnownState::empty(sent.id.clone())))
            .combine_with(sent);
    }

    /// Mark that `id` was announced to the peer. Returns false if it already was.
    pub fn mark_told_known(&self, id: &CoId) -> bool {
        self.told_known.lock().insert(id.clone())
    }

    pub fn was_told_known(&self, id: &CoId) -> bool {
        self.told_known.lock().contains(id)
    }

    /// Forget everything about `id`.
    pub fn forget(&self, id: &CoId) {
        self.known.lock().remove(id);
        self.optimistic.lock().remove(id);
        self.told_known.lock().remove(id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Load queue
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `f` with the load queue locked.
    pub fn with_load_queue<R>(&self, f: impl FnOnce(&mut OutgoingLoadQueue) -> R) -> R {
        f(&mut self.load_queue.lock())
    }

    /// Close the connection and drop queued loads.
    pub fn close(&self) {
        self.load_queue.lock().clear();
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::connected_pair;
    use covalue_core::SessionId;

    fn peer() -> (PeerState, crate::transport::memory::MemoryTransport) {
        let (ours, theirs) = connected_pair("local", "server");
        let state = PeerState::new(
            PeerId::from("server"),
            PeerRole::Server,
            Arc::new(ours),
            LoadQueueConfig::default(),
            None,
        );
        (state, theirs)
    }

    fn known(n: u32) -> KnownState {
        let mut known = KnownState::empty(CoId::parse("co_zpeer").unwrap());
        known.header = true;
        known.set_session_counter(SessionId::new_session("sealer_z01/signer_z01", "a"), n);
        known
    }

    #[test]
    fn test_optimistic_runs_ahead_of_confirmed() {
        let (state, _other) = peer();
        let id = known(0).id;

        assert!(!state.is_subscribed(&id));
        state.set_known_state(known(1));
        state.combine_optimistic(&known(4));

        assert_eq!(state.known_state(&id), Some(known(1)));
        assert_eq!(state.optimistic_known_state(&id), Some(known(4)));

        // A smaller acknowledgement never moves either view back
        state.combine_known_state(&known(3));
        assert_eq!(state.known_state(&id), Some(known(3)));
        assert_eq!(state.optimistic_known_state(&id), Some(known(4)));
    }

    #[test]
    fn test_set_known_state_resets_optimistic() {
        let (state, _other) = peer();
        let id = known(0).id;
        state.combine_optimistic(&known(5));
        state.set_known_state(known(2));
        assert_eq!(state.optimistic_known_state(&id), Some(known(2)));
    }

    #[test]
    fn test_told_known_and_forget() {
        let (state, _other) = peer();
        let id = known(0).id;
        assert!(state.mark_told_known(&id));
        assert!(!state.mark_told_known(&id));
        state.set_known_state(known(1));
        state.forget(&id);
        assert!(!state.was_told_known(&id));
        assert!(!state.is_subscribed(&id));
    }

    #[tokio::test]
    async fn test_push_and_close() {
        let (state, other) = peer();
        state.push(SyncMessage::Load(known(0)));
        assert!(matches!(other.recv().await.unwrap(), Some(SyncMessage::Load(_))));

        state.close();
        assert!(state.is_closed());
        // Sending after close only logs
        state.push(SyncMessage::Load(known(0)));
    }
}
