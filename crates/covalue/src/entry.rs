//! Lifecycle of one CoValue inside a node.
//!
//! ```text
//!   Unknown ──load──► Loading ──content──► Available
//!      │                 │  ▲
//!      │                 │  └──retry──┐
//!      │                 └──all peers not found, retries exhausted──► Unavailable
//!      └──content with header────────────────────────────────────────► Available
//! ```
//!
//! `Available` is terminal: late not-found answers only update upload
//! bookkeeping. Waiters observe transitions through a watch channel whose
//! version also moves whenever the content changes.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tokio::sync::watch;

use covalue_core::{CoId, NewContentMessage, PeerId, SessionId};

use crate::value::CoValueCore;

/// Public view of an entry's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingStatus {
    Unknown,
    Loading,
    Available,
    Unavailable,
}

/// The answer of one peer during a load round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLoad {
    Pending,
    NotFound,
}

/// State transitions driven by loads and incoming content.
#[derive(Debug)]
pub enum EntryAction {
    /// A load round was started towards these peers.
    LoadRequested(Vec<PeerId>),
    /// The peer does not have the value.
    NotFoundInPeer(PeerId),
    /// The value became available.
    Available(Box<CoValueCore>),
}

#[derive(Debug)]
enum EntryState {
    Unknown,
    Loading { peers: BTreeMap<PeerId, PeerLoad> },
    Available(Box<CoValueCore>),
    Unavailable,
}

impl EntryState {
    fn status(&self) -> LoadingStatus {
        match self {
            EntryState::Unknown => LoadingStatus::Unknown,
            EntryState::Loading { .. } => LoadingStatus::Loading,
            EntryState::Available(_) => LoadingStatus::Available,
            EntryState::Unavailable => LoadingStatus::Unavailable,
        }
    }

    fn round_settled(&self) -> bool {
        match self {
            EntryState::Loading { peers } => peers.values().all(|p| *p == PeerLoad::NotFound),
            _ => true,
        }
    }
}

/// Snapshot published on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub status: LoadingStatus,
    /// True unless a load round still waits on some peer.
    pub round_settled: bool,
    /// Moves on every state or content change.
    pub version: u64,
}

/// Per-peer upload progress of a value.
#[derive(Debug, Clone, Default)]
pub struct UploadState {
    /// Peer -> whether the peer confirmed having everything.
    peers: BTreeMap<PeerId, bool>,
    /// Peers that told us they do not have the value.
    unaware_peers: BTreeSet<PeerId>,
}

impl UploadState {
    pub fn set_pending(&mut self, peer: &PeerId) {
        self.peers.entry(peer.clone()).or_insert(false);
    }

    pub fn set_completed(&mut self, peer: &PeerId) {
        self.peers.insert(peer.clone(), true);
        self.unaware_peers.remove(peer);
    }

    pub fn is_completed(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).copied().unwrap_or(false)
    }

    pub fn mark_unaware(&mut self, peer: &PeerId) {
        self.unaware_peers.insert(peer.clone());
    }

    pub fn unaware_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.unaware_peers.iter()
    }

    /// Fold in progress recorded elsewhere; completion is never undone.
    pub fn merge_from(&mut self, other: &UploadState) {
        for (peer, completed) in &other.peers {
            if *completed {
                self.set_completed(peer);
            } else {
                self.set_pending(peer);
            }
        }
        for peer in &other.unaware_peers {
            if !self.is_completed(peer) {
                self.unaware_peers.insert(peer.clone());
            }
        }
    }
}

/// Content that arrived before its dependencies.
#[derive(Debug, Clone)]
pub struct QueuedContent {
    pub from: Option<PeerId>,
    pub msg: NewContentMessage,
}

#[derive(Debug)]
struct EntryInner {
    state: EntryState,
    upload: UploadState,
    /// Sessions whose content from a peer failed verification.
    errored_in_peer: BTreeMap<PeerId, BTreeSet<SessionId>>,
    missing_dependencies: BTreeSet<CoId>,
    queued: Vec<QueuedContent>,
    driving_load: bool,
    version: u64,
}

/// One CoValue tracked by a node, in whatever state it is.
#[derive(Debug)]
pub struct CoValueEntry {
    id: CoId,
    inner: Mutex<EntryInner>,
    changes: watch::Sender<EntrySnapshot>,
}

impl CoValueEntry {
    pub fn new(id: CoId) -> Self {
        let snapshot = EntrySnapshot {
            status: LoadingStatus::Unknown,
            round_settled: true,
            version: 0,
        };
        Self {
            id,
            inner: Mutex::new(EntryInner {
                state: EntryState::Unknown,
                upload: UploadState::default(),
                errored_in_peer: BTreeMap::new(),
                missing_dependencies: BTreeSet::new(),
                queued: Vec::new(),
                driving_load: false,
                version: 0,
            }),
            changes: watch::Sender::new(snapshot),
        }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn status(&self) -> LoadingStatus {
        self.inner.lock().state.status()
    }

    pub fn is_available(&self) -> bool {
        self.status() == LoadingStatus::Available
    }

    pub fn subscribe(&self) -> watch::Receiver<EntrySnapshot> {
        self.changes.subscribe()
    }

    /// Apply a state transition.
    pub fn dispatch(&self, action: EntryAction) {
        let mut inner = self.inner.lock();
        match action {
            EntryAction::LoadRequested(requested) => match &mut inner.state {
                EntryState::Available(_) => return,
                EntryState::Loading { peers } => {
                    for peer in requested {
                        peers.insert(peer, PeerLoad::Pending);
                    }
                }
                state @ (EntryState::Unknown | EntryState::Unavailable) => {
                    *state = EntryState::Loading {
                        peers: requested
                            .into_iter()
                            .map(|peer| (peer, PeerLoad::Pending))
                            .collect(),
                    };
                }
            },
            EntryAction::NotFoundInPeer(peer) => {
                if let EntryState::Loading { peers } = &mut inner.state {
                    peers.insert(peer.clone(), PeerLoad::NotFound);
                }
                inner.upload.mark_unaware(&peer);
            }
            EntryAction::Available(core) => {
                inner.state = EntryState::Available(core);
            }
        }
        self.publish(&mut inner);
    }

    /// Give up loading: nothing answered with content.
    pub fn mark_unavailable(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, EntryState::Loading { .. } | EntryState::Unknown) {
            inner.state = EntryState::Unavailable;
            self.publish(&mut inner);
        }
    }

    /// Result of each peer in the current load round.
    pub fn loading_peers(&self) -> BTreeMap<PeerId, PeerLoad> {
        match &self.inner.lock().state {
            EntryState::Loading { peers } => peers.clone(),
            _ => BTreeMap::new(),
        }
    }

    /// Claim the right to drive a load. Returns false if someone else is.
    pub fn try_begin_load(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.driving_load {
            return false;
        }
        inner.driving_load = true;
        true
    }

    pub fn end_load(&self) {
        self.inner.lock().driving_load = false;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────────

    pub fn with_core<R>(&self, f: impl FnOnce(&CoValueCore) -> R) -> Option<R> {
        match &self.inner.lock().state {
            EntryState::Available(core) => Some(f(core)),
            _ => None,
        }
    }

    /// Mutate the available core and notify waiters.
    pub fn with_core_mut<R>(&self, f: impl FnOnce(&mut CoValueCore) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        let result = match &mut inner.state {
            EntryState::Available(core) => f(core),
            _ => return None,
        };
        self.publish(&mut inner);
        Some(result)
    }

    /// Like [`CoValueEntry::with_core_mut`], creating the core with `init`
    /// first if the value is not available yet. Waiters only ever see the
    /// core after `f` ran.
    pub fn with_core_or_init<R>(
        &self,
        init: impl FnOnce() -> Option<CoValueCore>,
        f: impl FnOnce(&mut CoValueCore) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, EntryState::Available(_)) {
            inner.state = EntryState::Available(Box::new(init()?));
        }
        let EntryState::Available(core) = &mut inner.state else {
            return None;
        };
        let result = f(core);
        self.publish(&mut inner);
        Some(result)
    }

    /// Wait until `predicate` holds for the available core.
    pub async fn wait_for(&self, predicate: impl Fn(&CoValueCore) -> bool) {
        let mut rx = self.subscribe();
        loop {
            if self.with_core(&predicate).unwrap_or(false) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until the value is available or given up on.
    pub async fn wait_settled(&self) -> LoadingStatus {
        let mut rx = self.subscribe();
        loop {
            let status = self.status();
            if matches!(status, LoadingStatus::Available | LoadingStatus::Unavailable) {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Wait until the current load round has an answer from every peer.
    pub async fn wait_round(&self) -> LoadingStatus {
        let mut rx = self.subscribe();
        loop {
            let (status, settled) = {
                let inner = self.inner.lock();
                (inner.state.status(), inner.state.round_settled())
            };
            if status != LoadingStatus::Loading || settled {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dependencies
    // ─────────────────────────────────────────────────────────────────────────

    /// Park `msg` until `missing` are available.
    pub fn queue_content(&self, from: Option<PeerId>, msg: NewContentMessage, missing: BTreeSet<CoId>) {
        let mut inner = self.inner.lock();
        inner.missing_dependencies.extend(missing);
        inner.queued.push(QueuedContent { from, msg });
    }

    pub fn missing_dependencies(&self) -> BTreeSet<CoId> {
        self.inner.lock().missing_dependencies.clone()
    }

    /// `dep` became available. Returns the parked content once nothing is
    /// missing anymore.
    pub fn dependency_available(&self, dep: &CoId) -> Vec<QueuedContent> {
        let mut inner = self.inner.lock();
        inner.missing_dependencies.remove(dep);
        if inner.missing_dependencies.is_empty() {
            std::mem::take(&mut inner.queued)
        } else {
            Vec::new()
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn mark_errored(&self, peer: &PeerId, session: &SessionId) {
        self.inner
            .lock()
            .errored_in_peer
            .entry(peer.clone())
            .or_default()
            .insert(session.clone());
    }

    pub fn is_errored_in_peer(&self, peer: &PeerId, session: &SessionId) -> bool {
        self.inner
            .lock()
            .errored_in_peer
            .get(peer)
            .is_some_and(|sessions| sessions.contains(session))
    }

    pub fn clear_errored(&self, peer: &PeerId, session: &SessionId) {
        let mut inner = self.inner.lock();
        if let Some(sessions) = inner.errored_in_peer.get_mut(peer) {
            sessions.remove(session);
            if sessions.is_empty() {
                inner.errored_in_peer.remove(peer);
            }
        }
    }

    pub fn with_upload<R>(&self, f: impl FnOnce(&mut UploadState) -> R) -> R {
        f(&mut self.inner.lock().upload)
    }

    fn publish(&self, inner: &mut EntryInner) {
        inner.version += 1;
        self.changes.send_replace(EntrySnapshot {
            status: inner.state.status(),
            round_settled: inner.state.round_settled(),
            version: inner.version,
        });
    }
}
