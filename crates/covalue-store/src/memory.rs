//! In-memory implementation of the DbClient trait.
//!
//! Same semantics as SQLite but nothing is persisted. Clones share the same
//! tables, so several nodes can be pointed at one in-memory database.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use covalue_core::{CoId, CoValueHeader, SessionId, Signature, Transaction};

use crate::error::Result;
use crate::traits::{
    DbClient, DbTransaction, DeletionStatus, RowId, SessionRow, SignatureAfterRow,
    StoredCoValueRow, StoredSessionRow, SyncStateUpdate, TransactionRow,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    next_row_id: RowId,
    covalues: BTreeMap<CoId, StoredCoValueRow>,
    sessions: BTreeMap<RowId, StoredSessionRow>,
    transactions: BTreeMap<(RowId, u32), Transaction>,
    signatures: BTreeMap<(RowId, u32), Signature>,
    deleted: BTreeMap<CoId, DeletionStatus>,
    unsynced: BTreeSet<(CoId, String)>,
}

impl Tables {
    fn next_id(&mut self) -> RowId {
        self.next_row_id += 1;
        self.next_row_id
    }

    fn find_session(&self, covalue: RowId, session: &SessionId) -> Option<&StoredSessionRow> {
        self.sessions
            .values()
            .find(|row| row.covalue == covalue && &row.session_id == session)
    }

    fn remove_session(&mut self, session: RowId) {
        self.sessions.remove(&session);
        self.transactions.retain(|(ses, _), _| *ses != session);
        self.signatures.retain(|(ses, _), _| *ses != session);
    }
}

/// In-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored transactions, for tests.
    pub fn transaction_count(&self) -> usize {
        self.tables.lock().transactions.len()
    }
}

struct MemoryTx<'a> {
    tables: &'a mut Tables,
}

impl DbTransaction for MemoryTx<'_> {
    fn get_single_session(
        &self,
        covalue: RowId,
        session: &SessionId,
    ) -> Result<Option<StoredSessionRow>> {
        Ok(self.tables.find_session(covalue, session).cloned())
    }

    fn mark_covalue_as_deleted(&mut self, id: &CoId) -> Result<()> {
        self.tables
            .deleted
            .entry(id.clone())
            .or_insert(DeletionStatus::Pending);
        Ok(())
    }

    fn add_session_update(&mut self, update: &SessionRow) -> Result<RowId> {
        let existing = self
            .tables
            .find_session(update.covalue, &update.session_id)
            .map(|row| row.row_id);
        let row_id = match existing {
            Some(row_id) => row_id,
            None => self.tables.next_id(),
        };
        self.tables.sessions.insert(
            row_id,
            StoredSessionRow {
                row_id,
                covalue: update.covalue,
                session_id: update.session_id.clone(),
                last_idx: update.last_idx,
                last_signature: update.last_signature.clone(),
                bytes_since_last_signature: update.bytes_since_last_signature,
            },
        );
        Ok(row_id)
    }

    fn add_transaction(&mut self, session: RowId, idx: u32, tx: &Transaction) -> Result<()> {
        self.tables.transactions.insert((session, idx), tx.clone());
        Ok(())
    }

    fn add_signature_after(&mut self, session: RowId, idx: u32, signature: &Signature) -> Result<()> {
        self.tables.signatures.insert((session, idx), signature.clone());
        Ok(())
    }

    fn delete_session(&mut self, session: RowId) -> Result<()> {
        self.tables.remove_session(session);
        Ok(())
    }
}

impl DbClient for MemoryDb {
    fn get_covalue(&self, id: &CoId) -> Result<Option<StoredCoValueRow>> {
        Ok(self.tables.lock().covalues.get(id).cloned())
    }

    fn upsert_covalue(&mut self, id: &CoId, header: Option<&CoValueHeader>) -> Result<Option<RowId>> {
        let mut tables = self.tables.lock();
        if let Some(row) = tables.covalues.get(id) {
            return Ok(Some(row.row_id));
        }
        let Some(header) = header else {
            return Ok(None);
        };
        let row_id = tables.next_id();
        tables.covalues.insert(
            id.clone(),
            StoredCoValueRow {
                row_id,
                id: id.clone(),
                header: header.clone(),
            },
        );
        Ok(Some(row_id))
    }

    fn get_covalue_sessions(&self, covalue: RowId) -> Result<Vec<StoredSessionRow>> {
        Ok(self
            .tables
            .lock()
            .sessions
            .values()
            .filter(|row| row.covalue == covalue)
            .cloned()
            .collect())
    }

    fn get_new_transactions_in_session(
        &self,
        session: RowId,
        from: u32,
        to: u32,
    ) -> Result<Vec<TransactionRow>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .tables
            .lock()
            .transactions
            .range((session, from)..=(session, to))
            .map(|((ses, idx), tx)| TransactionRow {
                ses: *ses,
                idx: *idx,
                tx: tx.clone(),
            })
            .collect())
    }

    fn get_signatures(&self, session: RowId, first_new_idx: u32) -> Result<Vec<SignatureAfterRow>> {
        Ok(self
            .tables
            .lock()
            .signatures
            .range((session, first_new_idx)..=(session, u32::MAX))
            .map(|((_, idx), signature)| SignatureAfterRow {
                idx: *idx,
                signature: signature.clone(),
            })
            .collect())
    }

    fn transaction<T>(&mut self, f: impl FnOnce(&mut dyn DbTransaction) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.lock();
        let snapshot = tables.clone();
        let result = f(&mut MemoryTx {
            tables: &mut tables,
        });
        if result.is_err() {
            *tables = snapshot;
        }
        result
    }

    fn get_all_covalues_waiting_for_delete(&self) -> Result<Vec<CoId>> {
        Ok(self
            .tables
            .lock()
            .deleted
            .iter()
            .filter(|(_, status)| **status == DeletionStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn erase_covalue_but_keep_tombstone(&mut self, id: &CoId) -> Result<()> {
        let mut tables = self.tables.lock();
        let Some(row_id) = tables.covalues.get(id).map(|row| row.row_id) else {
            tracing::warn!(id = %id, "CoValue not found, skipping erase");
            return Ok(());
        };
        let doomed: Vec<RowId> = tables
            .sessions
            .values()
            .filter(|row| row.covalue == row_id && !row.session_id.is_delete_session())
            .map(|row| row.row_id)
            .collect();
        for session in doomed {
            tables.remove_session(session);
        }
        tables.deleted.insert(id.clone(), DeletionStatus::Done);
        Ok(())
    }

    fn track_covalues_sync_state(&mut self, updates: &[SyncStateUpdate]) -> Result<()> {
        let mut tables = self.tables.lock();
        for update in updates {
            let key = (update.id.clone(), update.peer_id.as_str().to_string());
            if update.synced {
                tables.unsynced.remove(&key);
            } else {
                tables.unsynced.insert(key);
            }
        }
        Ok(())
    }

    fn get_unsynced_covalue_ids(&self) -> Result<Vec<CoId>> {
        let tables = self.tables.lock();
        let ids: BTreeSet<CoId> = tables.unsynced.iter().map(|(id, _)| id.clone()).collect();
        Ok(ids.into_iter().collect())
    }

    fn stop_tracking_sync_state(&mut self, id: &CoId) -> Result<()> {
        self.tables.lock().unsynced.retain(|(unsynced, _)| unsynced != id);
        Ok(())
    }
}
