//! Storage traits: the node-facing [`StorageApi`] and the row-level
//! [`DbClient`] every durable backend implements.
//!
//! The reconciliation logic (checkpoint writes, invalid-assumption
//! detection, dependency-first loading, streaming) lives once in
//! [`crate::StorageSync`], on top of any `DbClient`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use covalue_core::{
    CoId, CoValueHeader, KnownState, NewContentMessage, PeerId, SessionId, SessionNewContent,
    Signature, Transaction,
};

use crate::error::Result;
use crate::streaming::StorageStreamingQueue;

/// Database row identifier.
pub type RowId = i64;

// ─────────────────────────────────────────────────────────────────────────────
// Rows
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StoredCoValueRow {
    pub row_id: RowId,
    pub id: CoId,
    pub header: CoValueHeader,
}

/// A session row before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub covalue: RowId,
    pub session_id: SessionId,
    pub last_idx: u32,
    pub last_signature: Signature,
    pub bytes_since_last_signature: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSessionRow {
    pub row_id: RowId,
    pub covalue: RowId,
    pub session_id: SessionId,
    pub last_idx: u32,
    pub last_signature: Signature,
    pub bytes_since_last_signature: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRow {
    pub ses: RowId,
    pub idx: u32,
    pub tx: Transaction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureAfterRow {
    pub idx: u32,
    pub signature: Signature,
}

/// Status of an entry in the deleted CoValues work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStatus {
    Pending = 0,
    Done = 1,
}

/// One sync-state change: whether `id` has fully reached `peer_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateUpdate {
    pub id: CoId,
    pub peer_id: PeerId,
    pub synced: bool,
}

/// Authoritative history for one session, used by signature-mismatch
/// recovery. Pieces must be contiguous starting at 0; every piece but the
/// last ends at a signature checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReplacement {
    pub id: CoId,
    pub session_id: SessionId,
    pub content: Vec<SessionNewContent>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Result of storing one content message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOutcome {
    /// Everything applicable was written; the storage now knows this much.
    Stored(KnownState),
    /// The message assumed more than storage has (or lacked a header for an
    /// unknown value); the storage knows only this much.
    NeedsCorrection(KnownState),
}

impl StoreOutcome {
    pub fn known_state(&self) -> &KnownState {
        match self {
            StoreOutcome::Stored(known) | StoreOutcome::NeedsCorrection(known) => known,
        }
    }
}

/// Content found by a load, dependencies first.
#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    pub found: bool,
    pub content: Vec<NewContentMessage>,
}

/// Supplies the content storage is missing, given what it has.
///
/// Returning `None` means the caller cannot help; the store is abandoned.
pub type CorrectionCallback<'a> =
    &'a (dyn Fn(&KnownState) -> Option<Vec<NewContentMessage>> + Send + Sync);

// ─────────────────────────────────────────────────────────────────────────────
// StorageApi
// ─────────────────────────────────────────────────────────────────────────────

/// The capability a node uses to persist and reload CoValues.
///
/// Every backend honours the same ordering and correction guarantees:
/// dependencies are returned before dependants, in-session indices are
/// applied strictly in order, and a stale assumption is answered through the
/// correction callback instead of leaving a gap.
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Cached known state; empty if storage has not seen the value yet.
    fn get_known_state(&self, id: &CoId) -> KnownState;

    /// Known state read from the backend (cached afterwards).
    async fn load_known_state(&self, id: &CoId) -> Result<Option<KnownState>>;

    /// Load a value and its dependencies.
    ///
    /// Content beyond the first signature checkpoint of medium and low
    /// priority values is handed to [`StorageApi::streaming_queue`] instead.
    async fn load(&self, id: &CoId) -> Result<LoadOutcome>;

    /// Persist one content message without asking for corrections.
    async fn store_single(&self, msg: NewContentMessage) -> Result<StoreOutcome>;

    /// Persist a content message, asking `on_correction` for what is missing
    /// if the message does not apply. Returns whether everything got stored.
    ///
    /// Content supplied by the correction must apply as is; a second
    /// correction request abandons the store.
    async fn store(
        &self,
        msg: NewContentMessage,
        on_correction: CorrectionCallback<'_>,
    ) -> Result<bool> {
        let known = match self.store_single(msg).await? {
            StoreOutcome::Stored(_) => return Ok(true),
            StoreOutcome::NeedsCorrection(known) => known,
        };

        let Some(correction) = on_correction(&known) else {
            error!(id = %known.id, "Correction callback returned nothing");
            return Ok(false);
        };

        for msg in correction {
            let id = msg.id.clone();
            if let StoreOutcome::NeedsCorrection(known) = self.store_single(msg).await? {
                error!(id = %id, sessions = known.sessions.len(), "Double correction requested");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Replace the stored history of one session.
    async fn replace_session_history(&self, replacement: SessionReplacement) -> Result<()>;

    /// Flag that the delete transaction of `id` was validated.
    fn mark_delete_as_valid(&self, id: &CoId);

    /// Start the background eraser that drains the deleted values queue.
    fn enable_deleted_covalues_erasure(&self);

    /// Physically erase every pending deleted value, keeping tombstones.
    async fn erase_all_deleted_covalues(&self) -> Result<()>;

    /// Record per-peer sync state changes durably.
    async fn track_covalues_sync_state(&self, updates: Vec<SyncStateUpdate>) -> Result<()>;

    /// Values with at least one peer they have not reached yet.
    async fn get_unsynced_covalue_ids(&self) -> Result<Vec<CoId>>;

    /// Forget the sync state of `id` for every peer.
    async fn stop_tracking_sync_state(&self, id: &CoId) -> Result<()>;

    /// The value was dropped from memory; reload it in full next time.
    fn on_covalue_unmounted(&self, id: &CoId);

    /// Resolves once storage knows at least `target`.
    async fn wait_for_sync(&self, id: &CoId, target: &KnownState) -> Result<()>;

    /// Streamed content waiting to be pulled by the node.
    fn streaming_queue(&self) -> &StorageStreamingQueue;

    async fn close(&self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// DbClient
// ─────────────────────────────────────────────────────────────────────────────

/// Writes performed atomically inside [`DbClient::transaction`].
pub trait DbTransaction {
    fn get_single_session(&self, covalue: RowId, session: &SessionId)
        -> Result<Option<StoredSessionRow>>;

    /// Enqueue `id` for erasure. Idempotent.
    fn mark_covalue_as_deleted(&mut self, id: &CoId) -> Result<()>;

    /// Insert or update a session row, returning its row ID.
    fn add_session_update(&mut self, update: &SessionRow) -> Result<RowId>;

    fn add_transaction(&mut self, session: RowId, idx: u32, tx: &Transaction) -> Result<()>;

    fn add_signature_after(&mut self, session: RowId, idx: u32, signature: &Signature)
        -> Result<()>;

    /// Remove a session with its transactions and checkpoints.
    fn delete_session(&mut self, session: RowId) -> Result<()>;
}

/// Row-level access to a durable backend.
pub trait DbClient: Send + 'static {
    fn get_covalue(&self, id: &CoId) -> Result<Option<StoredCoValueRow>>;

    /// Insert the value if a header is given; returns its row, or `None` if
    /// the value is unknown and no header was supplied.
    fn upsert_covalue(&mut self, id: &CoId, header: Option<&CoValueHeader>) -> Result<Option<RowId>>;

    fn get_covalue_sessions(&self, covalue: RowId) -> Result<Vec<StoredSessionRow>>;

    /// Transactions with `from <= idx <= to`, in index order.
    fn get_new_transactions_in_session(&self, session: RowId, from: u32, to: u32)
        -> Result<Vec<TransactionRow>>;

    /// Checkpoints with `idx >= first_new_idx`, in index order.
    fn get_signatures(&self, session: RowId, first_new_idx: u32) -> Result<Vec<SignatureAfterRow>>;

    fn transaction<T>(&mut self, f: impl FnOnce(&mut dyn DbTransaction) -> Result<T>) -> Result<T>;

    fn get_all_covalues_waiting_for_delete(&self) -> Result<Vec<CoId>>;

    /// Erase every non-delete session of `id` and mark its queue entry done.
    fn erase_covalue_but_keep_tombstone(&mut self, id: &CoId) -> Result<()>;

    fn track_covalues_sync_state(&mut self, updates: &[SyncStateUpdate]) -> Result<()>;

    fn get_unsynced_covalue_ids(&self) -> Result<Vec<CoId>>;

    fn stop_tracking_sync_state(&mut self, id: &CoId) -> Result<()>;

    /// Known state straight from the rows.
    fn get_covalue_known_state(&self, id: &CoId) -> Result<Option<KnownState>> {
        let Some(row) = self.get_covalue(id)? else {
            return Ok(None);
        };
        let mut known = KnownState::empty(id.clone());
        known.header = true;
        for session in self.get_covalue_sessions(row.row_id)? {
            known.set_session_counter(session.session_id, session.last_idx);
        }
        Ok(Some(known))
    }
}
