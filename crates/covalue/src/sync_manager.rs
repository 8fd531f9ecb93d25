//! Peer protocol handling.
//!
//! Incoming messages are queued per peer and drained by a single pass at a
//! time, interleaved with content streamed out of storage: medium priority
//! storage chunks first, then peer messages round-robin, then low priority
//! chunks. Handlers never block; anything that has to wait (storage loads,
//! retries, recovery) is spawned.
//!
//! ## Content intake
//!
//! ```text
//! content ──► header known? ──no──► known{header:false, isCorrection}
//!                 │
//!                 ▼
//!          dependencies available? ──no──► queue, load dependencies
//!                 │
//!                 ▼
//!          per session: slice what is new ──after > known──► correction
//!                 │
//!                 ▼
//!          verify signature ──fail──► mark errored, error(SignatureMismatch)
//!                 │
//!                 ▼
//!          store, ack, forward to subscribed peers
//! ```

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn, Instrument};

use covalue_core::{
    CoId, CoreError, KnownState, NewContentMessage, PeerId, Priority, SessionId, SessionNewContent,
};
use covalue_perms::is_delete_marker;
use covalue_sync::{
    DoneMessage, ErrorMessage, KnownMessage, LoadMode, LoadStatus, PeerState, SyncErrorType,
    SyncMessage,
};

use crate::config::SyncWhen;
use crate::value::CoValueCore;
use crate::entry::{CoValueEntry, EntryAction, LoadingStatus, PeerLoad};
use crate::node::NodeInner;

/// Where a piece of content came from.
#[derive(Debug, Clone)]
pub(crate) enum Source {
    /// Read back from local storage; already verified when it was stored.
    Storage,
    Peer(PeerId),
}

impl Source {
    fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Source::Storage => None,
            Source::Peer(peer) => Some(peer),
        }
    }
}

/// What applying one content message did to a core.
#[derive(Debug)]
struct Applied {
    /// The part of the message that was new and valid.
    accepted: NewContentMessage,
    invalid_assumption: bool,
    mismatched: Vec<SessionId>,
    added: Vec<SessionId>,
    known: KnownState,
    streaming: bool,
}

fn apply_content(core: &mut CoValueCore, msg: &NewContentMessage, skip_verify: bool) -> Applied {
    let mut accepted = NewContentMessage::create(msg.id.clone(), core.header(), msg.header.is_some());
    let mut invalid_assumption = false;
    let mut mismatched = Vec::new();
    let mut added = Vec::new();

    for (session, content) in &msg.new {
        let known = core.transactions_count(session);
        let Some(new_transactions) = content.new_transactions_for(known) else {
            debug!(id = %msg.id, session = %session, after = content.after, known, "Content starts past what we have");
            invalid_assumption = true;
            continue;
        };
        if new_transactions.is_empty() {
            continue;
        }
        match core.try_add_transactions(session, new_transactions, &content.last_signature, skip_verify) {
            Ok(()) => {
                accepted.new.insert(
                    session.clone(),
                    SessionNewContent {
                        after: known,
                        new_transactions: new_transactions.to_vec(),
                        last_signature: content.last_signature.clone(),
                    },
                );
                added.push(session.clone());
            }
            Err(CoreError::InvalidSignature(_)) => mismatched.push(session.clone()),
            Err(CoreError::DeletedCoValue(_)) => {
                debug!(id = %msg.id, session = %session, "Ignoring content for deleted value");
            }
            Err(e) => warn!(id = %msg.id, session = %session, error = %e, "Rejecting session content"),
        }
    }

    if let Some(until) = &msg.expect_content_until {
        core.verified_mut().set_streaming_known_state(until);
    }

    Applied {
        accepted,
        invalid_assumption,
        mismatched,
        added,
        known: core.known_state_with_streaming(),
        streaming: core.is_streaming(),
    }
}

impl NodeInner {
    // ─────────────────────────────────────────────────────────────────────────
    // Drain loop
    // ─────────────────────────────────────────────────────────────────────────

    /// Process queued work unless a pass is already running, in which case
    /// that pass picks the request up before it stops.
    pub(crate) fn request_drain(self: &Arc<Self>) {
        self.drain_requested.store(true, Ordering::Release);
        loop {
            if self
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.drain_requested.store(false, Ordering::Release);
            self.span.in_scope(|| self.drain());
            self.processing.store(false, Ordering::Release);

            if !self.drain_requested.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn drain(self: &Arc<Self>) {
        loop {
            if let Some(chunk) = self.pull_streamed(Priority::Medium) {
                self.handle_content(Source::Storage, chunk);
                continue;
            }
            let next = self.incoming.lock().pull();
            if let Some((peer, msg)) = next {
                self.handle_message(&peer, msg);
                continue;
            }
            if let Some(chunk) = self.pull_streamed(Priority::Low) {
                self.handle_content(Source::Storage, chunk);
                continue;
            }
            break;
        }
    }

    fn pull_streamed(&self, lowest: Priority) -> Option<NewContentMessage> {
        self.storage.as_ref()?.streaming_queue().pull_up_to(lowest)
    }

    fn handle_message(self: &Arc<Self>, from: &PeerId, msg: SyncMessage) {
        let Some(peer) = self.peer(from) else {
            debug!(peer = %from, action = msg.action(), "Message from disconnected peer");
            return;
        };
        debug!(peer = %from, action = msg.action(), id = %msg.id(), "Handling message");
        match msg {
            SyncMessage::Load(known) => self.handle_load(&peer, known),
            SyncMessage::Known(known) if known.is_correction => self.handle_correction(&peer, known),
            SyncMessage::Known(known) => self.handle_known(&peer, known),
            SyncMessage::Content(content) => self.handle_content(Source::Peer(from.clone()), content),
            SyncMessage::Done(done) => self.handle_done(&peer, done),
            SyncMessage::Error(error) => self.handle_error(&peer, error),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Handlers
    // ─────────────────────────────────────────────────────────────────────────

    fn handle_load(self: &Arc<Self>, peer: &Arc<PeerState>, known: KnownState) {
        let id = known.id.clone();
        peer.set_known_state(known);

        let entry = self.entry(&id);
        if entry.is_available() {
            self.send_new_content(peer, &id, true);
            return;
        }

        // Another load is already running, answer with what we have now;
        // the peer is subscribed and gets the content once it arrives.
        if !entry.try_begin_load() {
            self.send_new_content(peer, &id, true);
            return;
        }

        let node = self.clone();
        let peer = peer.clone();
        tokio::spawn(
            async move {
                node.drive_load(&entry, LoadMode::HighPriority, Some(peer.id()), 1)
                    .await;
                entry.end_load();
                node.send_new_content(&peer, &id, true);
            }
            .instrument(self.span.clone()),
        );
    }

    fn handle_known(self: &Arc<Self>, peer: &Arc<PeerState>, msg: KnownMessage) {
        let id = msg.id.clone();
        peer.combine_known_state(&msg.known_state());

        let entry = self.entry(&id);
        if !msg.header {
            entry.dispatch(EntryAction::NotFoundInPeer(peer.id().clone()));
        }

        let next = peer.with_load_queue(|queue| {
            if queue.is_in_flight(&id) {
                queue.track_complete(&id, false)
            } else {
                Vec::new()
            }
        });
        self.send_loads(peer, next);

        if entry.is_available() {
            self.send_new_content(peer, &id, false);
            self.check_upload_complete(peer, &entry);
        }
        self.acks.notify_waiters();
    }

    /// The peer has less than we assumed; start over from what it has.
    fn handle_correction(self: &Arc<Self>, peer: &Arc<PeerState>, msg: KnownMessage) {
        let id = msg.id.clone();
        debug!(peer = %peer.id(), id = %id, "Peer corrected our assumption");
        peer.set_known_state(msg.known_state());

        let entry = self.entry(&id);
        if entry.is_available() {
            self.send_new_content(peer, &id, false);
        } else if !msg.header {
            entry.dispatch(EntryAction::NotFoundInPeer(peer.id().clone()));
        }
        self.acks.notify_waiters();
    }

    fn handle_done(&self, peer: &PeerState, msg: DoneMessage) {
        debug!(peer = %peer.id(), id = %msg.id, "Peer is done with value");
        peer.forget(&msg.id);
    }

    fn handle_error(self: &Arc<Self>, peer: &PeerState, msg: ErrorMessage) {
        match msg.error_type {
            SyncErrorType::SignatureMismatch => {
                warn!(
                    peer = %peer.id(),
                    id = %msg.id,
                    session = %msg.session_id,
                    reason = %msg.reason,
                    "Peer reported a signature mismatch"
                );
                let node = self.clone();
                let from = peer.id().clone();
                tokio::spawn(
                    async move {
                        let id = msg.id.clone();
                        if let Err(e) = node.recover_session(&from, msg).await {
                            error!(id = %id, peer = %from, error = %e, "Session recovery failed");
                        }
                    }
                    .instrument(self.span.clone()),
                );
            }
        }
    }

    pub(crate) fn handle_content(self: &Arc<Self>, source: Source, msg: NewContentMessage) {
        let id = msg.id.clone();
        let peer = match source.peer_id() {
            Some(peer_id) => match self.peer(peer_id) {
                Some(peer) => Some(peer),
                None => return,
            },
            None => None,
        };
        let entry = self.entry(&id);

        let header = entry
            .with_core(|core| core.header().clone())
            .or_else(|| msg.header.clone());
        let Some(header) = header else {
            debug!(id = %id, "Content without header for a value we do not have");
            if let Some(peer) = &peer {
                peer.push(SyncMessage::Known(KnownMessage::correction(KnownState::empty(id))));
            }
            return;
        };

        let missing: BTreeSet<CoId> = msg
            .depended_on(&header)
            .into_iter()
            .filter(|dep| dep != &id && !self.is_available(dep))
            .collect();
        if !missing.is_empty() {
            debug!(id = %id, missing = missing.len(), "Content waits for dependencies");
            {
                let mut waiting = self.waiting_on.lock();
                for dep in &missing {
                    waiting.entry(dep.clone()).or_default().insert(id.clone());
                }
            }
            entry.queue_content(source.peer_id().cloned(), msg, missing.clone());
            for dep in missing {
                // The sender has the dependency even when it is not a server.
                if let Some(peer) = peer.as_ref().filter(|peer| !peer.is_server()) {
                    self.request_load(peer, &dep, LoadMode::Immediate);
                }
                self.spawn_load(dep, LoadMode::Immediate);
            }
            return;
        }

        let was_available = entry.is_available();
        let skip_verify = matches!(source, Source::Storage);
        let crypto = self.crypto.clone();
        let max_tx_size = self.config.max_tx_size;
        let applied = entry.with_core_or_init(
            || match CoValueCore::new(id.clone(), header.clone(), crypto, max_tx_size) {
                Ok(core) => Some(core),
                Err(e) => {
                    warn!(id = %id, error = %e, "Rejecting content with invalid header");
                    None
                }
            },
            |core| apply_content(core, &msg, skip_verify),
        );
        let Some(applied) = applied else {
            return;
        };

        for session in &applied.mismatched {
            self.report_mismatch(&entry, peer.as_deref(), session);
        }
        if let Some(peer) = &peer {
            for session in &applied.added {
                if entry.is_errored_in_peer(peer.id(), session) {
                    info!(id = %id, peer = %peer.id(), session = %session, "Session reconciled");
                    entry.clear_errored(peer.id(), session);
                }
            }
        }
        if applied.added.iter().any(SessionId::is_delete_session) {
            self.check_deletion(&id);
        }

        let changed = !applied.added.is_empty() || !was_available;
        if peer.is_some() && !applied.accepted.is_empty() {
            self.store(applied.accepted.clone());
        }
        if !was_available {
            self.on_available(&id);
        }

        if let Some(peer) = &peer {
            let mut theirs = msg.known_state();
            theirs.header = true;
            peer.combine_known_state(&theirs);

            let reply = if applied.invalid_assumption {
                KnownMessage::correction(applied.known.clone())
            } else {
                KnownMessage::new(applied.known.clone())
            };
            peer.push(SyncMessage::Known(reply));

            let next = peer.with_load_queue(|queue| {
                if !queue.is_in_flight(&id) {
                    Vec::new()
                } else if applied.streaming {
                    queue.track_update(&id);
                    Vec::new()
                } else {
                    queue.track_complete(&id, false)
                }
            });
            self.send_loads(peer, next);
            self.acks.notify_waiters();
        }

        if changed {
            self.forward(&id, source.peer_id());
        }
    }

    fn report_mismatch(&self, entry: &CoValueEntry, peer: Option<&PeerState>, session: &SessionId) {
        let id = entry.id();
        let Some(peer) = peer else {
            error!(id = %id, session = %session, "Stored content failed verification");
            return;
        };
        if entry.is_errored_in_peer(peer.id(), session) {
            warn!(id = %id, peer = %peer.id(), session = %session, "Repeated signature mismatch");
            return;
        }
        entry.mark_errored(peer.id(), session);
        let content = entry
            .with_core(|core| core.full_session_content(session))
            .unwrap_or_default();
        warn!(id = %id, peer = %peer.id(), session = %session, "Signature mismatch, sending our history");
        peer.push(SyncMessage::Error(ErrorMessage::signature_mismatch(
            id.clone(),
            session.clone(),
            content,
            "new transactions do not verify against the known session history",
        )));
    }

    /// Mark `id` deleted once a valid delete marker is part of it.
    pub(crate) fn check_deletion(&self, id: &CoId) {
        let Some((records, valid)) = self.evaluate(id) else {
            return;
        };
        let has_valid_marker = records.iter().any(|tx| {
            tx.id.session_id.is_delete_session() && valid.contains(&tx.id) && is_delete_marker(id, tx)
        });
        if !has_valid_marker {
            debug!(id = %id, "Delete session without a valid marker");
            return;
        }
        let newly_deleted = self
            .get_entry(id)
            .and_then(|entry| {
                entry.with_core_mut(|core| {
                    let was_deleted = core.is_deleted();
                    core.verified_mut().mark_as_deleted();
                    !was_deleted
                })
            })
            .unwrap_or(false);
        if newly_deleted {
            info!(id = %id, "CoValue deleted");
            if let Some(storage) = &self.storage {
                storage.mark_delete_as_valid(id);
            }
        }
    }

    /// Replay content that was waiting for `id`.
    fn on_available(self: &Arc<Self>, id: &CoId) {
        let dependents = self.waiting_on.lock().remove(id).unwrap_or_default();
        for dependent in dependents {
            let Some(entry) = self.get_entry(&dependent) else {
                continue;
            };
            for queued in entry.dependency_available(id) {
                let source = queued.from.map_or(Source::Storage, Source::Peer);
                self.handle_content(source, queued.msg);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pushing content
    // ─────────────────────────────────────────────────────────────────────────

    /// Send `peer` whatever it lacks of `id`, dependencies first. With
    /// `force_known` a `known` message goes out when there is nothing new.
    pub(crate) fn send_new_content(&self, peer: &PeerState, id: &CoId, force_known: bool) {
        let mut seen = HashSet::new();
        self.send_new_content_inner(peer, id, force_known, &mut seen);
    }

    fn send_new_content_inner(
        &self,
        peer: &PeerState,
        id: &CoId,
        force_known: bool,
        seen: &mut HashSet<CoId>,
    ) {
        if !seen.insert(id.clone()) {
            return;
        }
        let entry = self.get_entry(id);
        let Some(dependencies) = entry.as_ref().and_then(|e| e.with_core(CoValueCore::dependencies)) else {
            if force_known {
                peer.push(SyncMessage::Known(KnownMessage::not_found(id.clone())));
                peer.mark_told_known(id);
            }
            return;
        };
        for dependency in &dependencies {
            self.send_new_content_inner(peer, dependency, false, seen);
        }

        let Some(entry) = entry else {
            return;
        };
        let theirs = peer.optimistic_known_state(id);
        let Some((pieces, ours)) = entry.with_core(|core| {
            (
                core.new_content_since(theirs.as_ref()),
                core.known_state_with_streaming(),
            )
        }) else {
            return;
        };

        match pieces {
            Some(pieces) => {
                entry.with_upload(|upload| upload.set_pending(peer.id()));
                for piece in pieces {
                    peer.combine_optimistic(&piece.known_state());
                    peer.push(SyncMessage::Content(piece));
                }
                peer.mark_told_known(id);
            }
            None if force_known => {
                peer.push(SyncMessage::Known(KnownMessage::new(ours)));
                peer.mark_told_known(id);
            }
            None => {}
        }
    }

    /// Persist a local change and push it to server and subscribed peers.
    pub(crate) fn sync_local_transaction(&self, id: &CoId, msg: NewContentMessage) {
        self.store(msg);
        for peer in self.peers_snapshot() {
            if peer.is_closed() {
                continue;
            }
            if peer.is_server() {
                if self.config.sync_when == SyncWhen::Never {
                    continue;
                }
                self.unsynced.lock().add(id, peer.id());
                self.send_new_content(&peer, id, false);
            } else if peer.is_subscribed(id) {
                self.send_new_content(&peer, id, false);
            }
        }
        self.flush_sync_state();
    }

    /// Push `id` to every peer that follows it, and up to servers when it
    /// came from another peer.
    pub(crate) fn forward(&self, id: &CoId, except: Option<&PeerId>) {
        for peer in self.peers_snapshot() {
            if Some(peer.id()) == except || peer.is_closed() {
                continue;
            }
            let relay = peer.is_server() && except.is_some();
            if relay || peer.is_subscribed(id) {
                self.send_new_content(&peer, id, false);
            }
        }
    }

    fn check_upload_complete(&self, peer: &PeerState, entry: &CoValueEntry) {
        let id = entry.id();
        let Some(ours) = entry.with_core(CoValueCore::known_state) else {
            return;
        };
        let Some(theirs) = peer.known_state(id) else {
            return;
        };
        if !ours.is_subset_of(&theirs) {
            return;
        }
        entry.with_upload(|upload| upload.set_completed(peer.id()));
        self.unsynced.lock().remove(id, peer.id());
        self.flush_sync_state();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Load `id` from storage, then from server peers with retries.
    pub(crate) async fn load_covalue(self: &Arc<Self>, id: &CoId, mode: LoadMode) -> LoadingStatus {
        let entry = self.entry(id);
        if entry.is_available() {
            return LoadingStatus::Available;
        }
        if !entry.try_begin_load() {
            return entry.wait_settled().await;
        }
        let status = self
            .drive_load(&entry, mode, None, self.config.retry.max_retries)
            .await;
        entry.end_load();
        status
    }

    fn spawn_load(self: &Arc<Self>, id: CoId, mode: LoadMode) {
        let node = self.clone();
        tokio::spawn(
            async move {
                let status = node.load_covalue(&id, mode).await;
                if status != LoadingStatus::Available {
                    warn!(id = %id, ?status, "Dependency could not be loaded");
                }
            }
            .instrument(self.span.clone()),
        );
    }

    /// One load: storage first, then up to `attempts` rounds over the server
    /// peers (except `exclude`), backing off between rounds. The entry is
    /// unavailable afterwards unless some round produced content.
    pub(crate) async fn drive_load(
        self: &Arc<Self>,
        entry: &Arc<CoValueEntry>,
        mode: LoadMode,
        exclude: Option<&PeerId>,
        attempts: u32,
    ) -> LoadingStatus {
        let id = entry.id().clone();
        if let Some(storage) = &self.storage {
            match storage.load(&id).await {
                Ok(outcome) if outcome.found => {
                    for msg in outcome.content {
                        self.handle_content(Source::Storage, msg);
                    }
                }
                Ok(_) => debug!(id = %id, "Not in storage"),
                Err(e) => warn!(id = %id, error = %e, "Storage load failed"),
            }
        }

        for attempt in 0..attempts {
            if entry.is_available() {
                break;
            }
            if attempt > 0 {
                let delay = self.config.retry.delay_for(attempt);
                debug!(id = %id, attempt, ?delay, "Retrying load");
                tokio::time::sleep(delay).await;
                if entry.is_available() {
                    break;
                }
            }

            let peers: Vec<Arc<PeerState>> = self
                .peers_snapshot()
                .into_iter()
                .filter(|peer| peer.is_server() && !peer.is_closed() && Some(peer.id()) != exclude)
                .collect();
            if peers.is_empty() {
                break;
            }
            entry.dispatch(EntryAction::LoadRequested(
                peers.iter().map(|peer| peer.id().clone()).collect(),
            ));
            for peer in &peers {
                self.request_load(peer, &id, mode);
            }
            entry.wait_round().await;
        }

        if !entry.is_available() {
            debug!(id = %id, "CoValue unavailable");
            entry.mark_unavailable();
        }
        entry.status()
    }

    pub(crate) fn request_load(&self, peer: &PeerState, id: &CoId, mode: LoadMode) {
        let to_send = peer.with_load_queue(|queue| queue.enqueue(id.clone(), mode));
        self.send_loads(peer, to_send);
    }

    fn send_loads(&self, peer: &PeerState, ids: Vec<CoId>) {
        for id in ids {
            let known = self
                .get_entry(&id)
                .and_then(|entry| entry.with_core(CoValueCore::known_state_with_streaming))
                .unwrap_or_else(|| KnownState::empty(id.clone()));
            peer.push(SyncMessage::Load(known));
        }
    }

    pub(crate) fn handle_load_timeout(self: &Arc<Self>, peer_id: &PeerId) {
        let _enter = self.span.enter();
        let Some(peer) = self.peer(peer_id) else {
            return;
        };
        let report = peer.with_load_queue(|queue| queue.check_timeouts(|id| self.load_status(id)));
        for id in &report.not_found {
            warn!(id = %id, peer = %peer_id, "Load timed out");
            self.entry(id)
                .dispatch(EntryAction::NotFoundInPeer(peer_id.clone()));
        }
        for id in &report.slow {
            debug!(id = %id, peer = %peer_id, "Streaming load is slow");
        }
        self.send_loads(&peer, report.to_send);
    }

    fn load_status(&self, id: &CoId) -> LoadStatus {
        match self
            .get_entry(id)
            .and_then(|entry| entry.with_core(CoValueCore::is_streaming))
        {
            Some(true) => LoadStatus::Streaming,
            Some(false) => LoadStatus::Available,
            None => LoadStatus::Unavailable,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask a new server peer about everything we hold, and resume changes
    /// it has not acknowledged yet.
    pub(crate) fn start_reconciliation(self: &Arc<Self>, peer: &Arc<PeerState>) {
        let available: Vec<CoId> = self
            .entries_snapshot()
            .into_iter()
            .filter(|entry| entry.is_available())
            .map(|entry| entry.id().clone())
            .collect();
        debug!(peer = %peer.id(), count = available.len(), "Reconciling with server");
        for id in &available {
            self.request_load(peer, id, LoadMode::LowPriority);
        }

        if self.config.sync_when == SyncWhen::Never {
            return;
        }
        let node = self.clone();
        let peer = peer.clone();
        tokio::spawn(
            async move { node.resume_unsynced(peer).await }.instrument(self.span.clone()),
        );
    }

    async fn resume_unsynced(self: Arc<Self>, peer: Arc<PeerState>) {
        let mut ids: BTreeSet<CoId> = self.unsynced.lock().ids().into_iter().collect();
        if let Some(storage) = &self.storage {
            match storage.get_unsynced_covalue_ids().await {
                Ok(stored) => ids.extend(stored),
                Err(e) => warn!(error = %e, "Failed to read unsynced values"),
            }
        }
        if ids.is_empty() {
            return;
        }
        info!(peer = %peer.id(), count = ids.len(), "Resuming unsynced values");
        for id in ids {
            if peer.is_closed() {
                return;
            }
            if self.load_covalue(&id, LoadMode::LowPriority).await != LoadingStatus::Available {
                continue;
            }
            self.unsynced.lock().add(&id, peer.id());
            self.request_load(&peer, &id, LoadMode::LowPriority);
        }
        self.flush_sync_state();
    }

    /// Drop the peer `id`. With `only` set, nothing happens if the peer was
    /// replaced in the meantime.
    pub(crate) fn disconnect(&self, id: &PeerId, only: Option<&Arc<PeerState>>) {
        let removed = {
            let mut peers = self.peers.write();
            match (peers.get(id), only) {
                (Some(current), Some(only)) if !Arc::ptr_eq(current, only) => None,
                _ => peers.remove(id),
            }
        };
        let Some(peer) = removed else {
            return;
        };
        peer.close();
        self.incoming.lock().remove_peer(id);

        for entry in self.entries_snapshot() {
            if entry.loading_peers().get(id) == Some(&PeerLoad::Pending) {
                entry.dispatch(EntryAction::NotFoundInPeer(id.clone()));
            }
        }
        info!(peer = %id, "Peer disconnected");
        self.acks.notify_waiters();
    }
}
