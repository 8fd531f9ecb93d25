//! Reconciliation layer shared by every [`DbClient`] backend.
//!
//! [`StorageSync`] turns row-level access into the node-facing
//! [`StorageApi`]: it writes signature checkpoints when a session grows past
//! the recommended size, detects stale `after` assumptions and asks for a
//! correction, loads dependencies before dependants and streams the chunks
//! of large values through the [`StorageStreamingQueue`].
//!
//! Database calls are blocking and run on `spawn_blocking`, one at a time
//! under the database mutex.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use covalue_core::config::MAX_RECOMMENDED_TX_SIZE;
use covalue_core::{
    exceeds_recommended_size, CoId, KnownState, NewContentMessage, Priority, SessionId,
    SessionNewContent, Signature, Transaction,
};

use crate::eraser::{DeletedCoValuesEraser, EraseRun, EraserConfig};
use crate::error::{Result, StoreError};
use crate::known_state::StorageKnownState;
use crate::streaming::StorageStreamingQueue;
use crate::traits::{
    DbClient, DbTransaction, LoadOutcome, RowId, SessionReplacement, SessionRow, StorageApi,
    StoreOutcome, StoredCoValueRow, StoredSessionRow, SyncStateUpdate,
};

/// Settings of a [`StorageSync`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Checkpoint size. Must match the `max_tx_size` of the nodes writing
    /// through this storage, or stored signature boundaries drift from the
    /// in-memory ones.
    pub max_tx_size: usize,
    pub eraser: EraserConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_tx_size: MAX_RECOMMENDED_TX_SIZE,
            eraser: EraserConfig::default(),
        }
    }
}

/// [`StorageApi`] over any [`DbClient`].
pub struct StorageSync<D: DbClient> {
    inner: Arc<SyncInner<D>>,
}

struct SyncInner<D> {
    db: Mutex<D>,
    known: StorageKnownState,
    /// Values the node holds in memory; loads do not send them again.
    in_memory: Mutex<HashSet<CoId>>,
    /// Values whose delete transaction was validated.
    deleted_values: Mutex<HashSet<CoId>>,
    streaming: StorageStreamingQueue,
    max_tx_size: usize,
    eraser_config: EraserConfig,
    eraser: Mutex<Option<DeletedCoValuesEraser>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PutOptions {
    force_signature_after: bool,
    disable_threshold_signature: bool,
}

/// One signature boundary of a stored session: transactions up to and
/// including `idx` are covered by `signature`.
#[derive(Debug, Clone)]
struct Boundary {
    idx: u32,
    signature: Signature,
}

impl<D: DbClient> StorageSync<D> {
    pub fn new(db: D) -> Self {
        Self::with_config(db, StorageConfig::default())
    }

    pub fn with_eraser_config(db: D, eraser: EraserConfig) -> Self {
        Self::with_config(
            db,
            StorageConfig {
                eraser,
                ..StorageConfig::default()
            },
        )
    }

    pub fn with_config(db: D, config: StorageConfig) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                db: Mutex::new(db),
                known: StorageKnownState::new(),
                in_memory: Mutex::new(HashSet::new()),
                deleted_values: Mutex::new(HashSet::new()),
                streaming: StorageStreamingQueue::new(),
                max_tx_size: config.max_tx_size,
                eraser_config: config.eraser,
                eraser: Mutex::new(None),
            }),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SyncInner<D>) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl<D: DbClient> SyncInner<D> {
    fn load(&self, id: &CoId) -> Result<LoadOutcome> {
        let db = self.db.lock();
        let mut outcome = LoadOutcome::default();
        let mut streamed = Vec::new();
        outcome.found = self.load_into(&*db, id, &mut outcome.content, &mut streamed)?;
        drop(db);

        if !streamed.is_empty() {
            for msg in streamed {
                let priority = msg.priority;
                self.streaming.push(msg, priority);
            }
            self.streaming.emit();
        }
        Ok(outcome)
    }

    /// Append `id` (after its dependencies) to `out`; chunks past the first
    /// checkpoint of non-high-priority values go to `streamed`.
    fn load_into(
        &self,
        db: &D,
        id: &CoId,
        out: &mut Vec<NewContentMessage>,
        streamed: &mut Vec<NewContentMessage>,
    ) -> Result<bool> {
        let Some(row) = db.get_covalue(id)? else {
            return Ok(false);
        };
        let sessions = db.get_covalue_sessions(row.row_id)?;

        let mut streaming = false;
        let mut known = KnownState::empty(id.clone());
        known.header = true;
        let mut boundaries = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let mut bounds: Vec<Boundary> = db
                .get_signatures(session.row_id, 0)?
                .into_iter()
                .map(|s| Boundary {
                    idx: s.idx,
                    signature: s.signature,
                })
                .collect();
            if !bounds.is_empty() {
                streaming = true;
            }
            if bounds.last().map(|b| &b.signature) != Some(&session.last_signature) {
                bounds.push(Boundary {
                    idx: session.last_idx.saturating_sub(1),
                    signature: session.last_signature.clone(),
                });
            }
            known.set_session_counter(session.session_id.clone(), session.last_idx);
            boundaries.push(bounds);
        }

        self.in_memory.lock().insert(id.clone());

        let mut first = NewContentMessage::create(id.clone(), &row.header, true);
        if streaming {
            first.expect_content_until = Some(known.sessions.clone());
        }

        let mut rest = Vec::new();
        for (session, bounds) in sessions.iter().zip(&boundaries) {
            if session.last_idx == 0 {
                continue;
            }
            let mut from = 0;
            for (i, bound) in bounds.iter().enumerate() {
                if i == 0 {
                    collect_txs(db, &mut first, session, from, bound)?;
                } else {
                    let mut chunk = NewContentMessage::create(id.clone(), &row.header, false);
                    collect_txs(db, &mut chunk, session, from, bound)?;
                    if !chunk.new.is_empty() {
                        rest.push(chunk);
                    }
                }
                from = bound.idx + 1;
            }
        }

        self.push_with_dependencies(db, &row, first, out, streamed)?;
        self.known.handle_update(id, &known);

        for chunk in rest {
            if chunk.priority == Priority::High {
                self.push_with_dependencies(db, &row, chunk, out, streamed)?;
            } else {
                streamed.push(chunk);
            }
        }
        Ok(true)
    }

    fn push_with_dependencies(
        &self,
        db: &D,
        row: &StoredCoValueRow,
        msg: NewContentMessage,
        out: &mut Vec<NewContentMessage>,
        streamed: &mut Vec<NewContentMessage>,
    ) -> Result<()> {
        for dependency in msg.depended_on(&row.header) {
            if self.in_memory.lock().contains(&dependency) {
                continue;
            }
            if !self.load_into(db, &dependency, out, streamed)? {
                debug!(id = %row.id, dependency = %dependency, "Dependency not in storage");
            }
        }
        out.push(msg);
        Ok(())
    }
}

fn collect_txs<D: DbClient>(
    db: &D,
    msg: &mut NewContentMessage,
    session: &StoredSessionRow,
    from: u32,
    bound: &Boundary,
) -> Result<()> {
    for row in db.get_new_transactions_in_session(session.row_id, from, bound.idx)? {
        msg.add_transaction(&session.session_id, row.tx, row.idx, bound.signature.clone());
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Storing
// ─────────────────────────────────────────────────────────────────────────────

impl<D: DbClient> SyncInner<D> {
    fn store_single(&self, msg: &NewContentMessage) -> Result<StoreOutcome> {
        let id = &msg.id;
        let mut db = self.db.lock();

        let Some(covalue) = db.upsert_covalue(id, msg.header.as_ref())? else {
            let known = KnownState::empty(id.clone());
            self.known.set(id, known.clone());
            return Ok(StoreOutcome::NeedsCorrection(known));
        };

        let mut known = self.known.get(id);
        known.header = true;
        let delete_is_valid = self.deleted_values.lock().contains(id);

        let invalid_assumptions = db.transaction(|tx| {
            let mut invalid = false;
            for (session, content) in &msg.new {
                if delete_is_valid && session.is_delete_session() {
                    tx.mark_covalue_as_deleted(id)?;
                }

                let existing = tx.get_single_session(covalue, session)?;
                let stored = existing.as_ref().map_or(0, |row| row.last_idx);
                known.set_session_counter(session.clone(), stored);

                if stored < content.after {
                    invalid = true;
                    continue;
                }
                let new_last = put_new_txs(
                    tx,
                    covalue,
                    session,
                    content,
                    existing.as_ref(),
                    PutOptions::default(),
                    self.max_tx_size,
                )?;
                known.set_session_counter(session.clone(), new_last);
            }
            Ok(invalid)
        })?;
        drop(db);

        self.mark_updated(id, &known);

        if invalid_assumptions {
            debug!(id = %id, "Content assumed more than storage has");
            Ok(StoreOutcome::NeedsCorrection(known))
        } else {
            Ok(StoreOutcome::Stored(known))
        }
    }

    fn replace_session_history(&self, replacement: &SessionReplacement) -> Result<()> {
        let SessionReplacement {
            id,
            session_id,
            content,
        } = replacement;
        let mut db = self.db.lock();

        let Some(covalue) = db.upsert_covalue(id, None)? else {
            return Err(StoreError::UnknownCoValue(id.clone()));
        };

        db.transaction(|tx| {
            if let Some(existing) = tx.get_single_session(covalue, session_id)? {
                tx.delete_session(existing.row_id)?;
            }

            let mut expected_after = 0;
            for piece in content {
                if piece.after != expected_after {
                    return Err(StoreError::InvalidReplacement {
                        id: id.clone(),
                        reason: format!(
                            "session {session_id}: expected after={expected_after}, got after={}",
                            piece.after
                        ),
                    });
                }
                expected_after = piece.end();
            }

            for (i, piece) in content.iter().enumerate() {
                let current = tx.get_single_session(covalue, session_id)?;
                put_new_txs(
                    tx,
                    covalue,
                    session_id,
                    piece,
                    current.as_ref(),
                    PutOptions {
                        force_signature_after: i + 1 < content.len(),
                        disable_threshold_signature: true,
                    },
                    self.max_tx_size,
                )?;
            }
            Ok(())
        })?;

        let known = db
            .get_covalue_known_state(id)?
            .unwrap_or_else(|| KnownState::empty(id.clone()));
        drop(db);

        self.known.set(id, known.clone());
        self.mark_updated(id, &known);
        Ok(())
    }

    fn mark_updated(&self, id: &CoId, known: &KnownState) {
        self.in_memory.lock().insert(id.clone());
        self.known.handle_update(id, known);
    }

    /// Erase pending deleted values until `budget` runs out; returns whether
    /// any remain.
    fn erase_deleted(&self, budget: Option<Duration>) -> Result<bool> {
        let started = Instant::now();
        let mut db = self.db.lock();

        for id in db.get_all_covalues_waiting_for_delete()? {
            if budget.is_some_and(|budget| started.elapsed() >= budget) {
                break;
            }
            db.erase_covalue_but_keep_tombstone(&id)?;
            let known = db
                .get_covalue_known_state(&id)?
                .unwrap_or_else(|| KnownState::empty(id.clone()));
            self.known.set(&id, known);
            debug!(id = %id, "Erased deleted CoValue");
        }

        Ok(!db.get_all_covalues_waiting_for_delete()?.is_empty())
    }
}

/// Append the part of `content` storage does not have yet. Returns the new
/// session count.
fn put_new_txs(
    tx: &mut dyn DbTransaction,
    covalue: RowId,
    session_id: &SessionId,
    content: &SessionNewContent,
    existing: Option<&StoredSessionRow>,
    options: PutOptions,
    max_tx_size: usize,
) -> Result<u32> {
    let last_idx = existing.map_or(0, |row| row.last_idx);
    let new_txs = content.new_transactions_for(last_idx).ok_or_else(|| {
        StoreError::InvalidData(format!(
            "session {session_id} starts after {} but storage has {last_idx}",
            content.after
        ))
    })?;
    if new_txs.is_empty() {
        return Ok(last_idx);
    }

    let new_size: usize = new_txs.iter().map(Transaction::size).sum();
    let mut bytes_since = existing.map_or(0, |row| row.bytes_since_last_signature);
    let mut write_signature = false;

    if !options.disable_threshold_signature && exceeds_recommended_size(bytes_since, new_size, max_tx_size) {
        write_signature = true;
        bytes_since = 0;
    } else {
        bytes_since += new_size;
    }
    if options.force_signature_after {
        write_signature = true;
        bytes_since = 0;
    }

    let new_last = last_idx + new_txs.len() as u32;
    let session = tx.add_session_update(&SessionRow {
        covalue,
        session_id: session_id.clone(),
        last_idx: new_last,
        last_signature: content.last_signature.clone(),
        bytes_since_last_signature: bytes_since,
    })?;

    if write_signature {
        tx.add_signature_after(session, new_last - 1, &content.last_signature)?;
    }
    for (offset, transaction) in new_txs.iter().enumerate() {
        tx.add_transaction(session, last_idx + offset as u32, transaction)?;
    }
    Ok(new_last)
}

// ─────────────────────────────────────────────────────────────────────────────
// StorageApi
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl<D: DbClient> StorageApi for StorageSync<D> {
    fn get_known_state(&self, id: &CoId) -> KnownState {
        self.inner.known.get(id)
    }

    async fn load_known_state(&self, id: &CoId) -> Result<Option<KnownState>> {
        let id = id.clone();
        self.blocking(move |inner| {
            let known = inner.db.lock().get_covalue_known_state(&id)?;
            if let Some(known) = &known {
                inner.known.handle_update(&id, known);
            }
            Ok(known)
        })
        .await
    }

    async fn load(&self, id: &CoId) -> Result<LoadOutcome> {
        let id = id.clone();
        self.blocking(move |inner| inner.load(&id)).await
    }

    async fn store_single(&self, msg: NewContentMessage) -> Result<StoreOutcome> {
        self.blocking(move |inner| inner.store_single(&msg)).await
    }

    async fn replace_session_history(&self, replacement: SessionReplacement) -> Result<()> {
        self.blocking(move |inner| inner.replace_session_history(&replacement))
            .await
    }

    fn mark_delete_as_valid(&self, id: &CoId) {
        self.inner.deleted_values.lock().insert(id.clone());
        if let Some(eraser) = self.inner.eraser.lock().as_ref() {
            eraser.on_enqueue_deleted_covalue();
        }
    }

    fn enable_deleted_covalues_erasure(&self) {
        let mut slot = self.inner.eraser.lock();
        if slot.is_some() {
            return;
        }

        let weak: Weak<SyncInner<D>> = Arc::downgrade(&self.inner);
        let budget = self.inner.eraser_config.budget;
        let run: EraseRun = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(false);
                };
                tokio::task::spawn_blocking(move || inner.erase_deleted(Some(budget)))
                    .await
                    .map_err(|e| StoreError::Task(e.to_string()))?
            })
        });

        let eraser = DeletedCoValuesEraser::new(self.inner.eraser_config.clone(), run);
        eraser.schedule_startup_drain();
        *slot = Some(eraser);
    }

    async fn erase_all_deleted_covalues(&self) -> Result<()> {
        self.blocking(|inner| inner.erase_deleted(None).map(|_| ()))
            .await
    }

    async fn track_covalues_sync_state(&self, updates: Vec<SyncStateUpdate>) -> Result<()> {
        self.blocking(move |inner| inner.db.lock().track_covalues_sync_state(&updates))
            .await
    }

    async fn get_unsynced_covalue_ids(&self) -> Result<Vec<CoId>> {
        self.blocking(|inner| inner.db.lock().get_unsynced_covalue_ids())
            .await
    }

    async fn stop_tracking_sync_state(&self, id: &CoId) -> Result<()> {
        let id = id.clone();
        self.blocking(move |inner| inner.db.lock().stop_tracking_sync_state(&id))
            .await
    }

    fn on_covalue_unmounted(&self, id: &CoId) {
        self.inner.in_memory.lock().remove(id);
        self.inner.known.remove(id);
    }

    async fn wait_for_sync(&self, id: &CoId, target: &KnownState) -> Result<()> {
        self.inner.known.wait_for_sync(id, target).await;
        Ok(())
    }

    fn streaming_queue(&self) -> &StorageStreamingQueue {
        &self.inner.streaming
    }

    async fn close(&self) -> Result<()> {
        if let Some(eraser) = self.inner.eraser.lock().take() {
            eraser.dispose();
        }
        self.inner.in_memory.lock().clear();
        self.inner.known.clear();
        if !self.inner.streaming.is_empty() {
            warn!("Closing storage with streamed content still queued");
        }
        Ok(())
    }
}
