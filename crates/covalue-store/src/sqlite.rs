//! SQLite implementation of the DbClient trait.
//!
//! The primary durable backend. Headers and transactions are stored as JSON
//! text; identifiers and signatures as their string form.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use covalue_core::{CoId, CoValueHeader, SessionId, Signature, Transaction};

use crate::error::Result;
use crate::migration;
use crate::traits::{
    DbClient, DbTransaction, RowId, SessionRow, SignatureAfterRow, StoredCoValueRow,
    StoredSessionRow, SyncStateUpdate, TransactionRow,
};

/// SQLite-backed database.
///
/// Clones share one connection.
#[derive(Clone)]
pub struct SqliteDb {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDb {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

struct RawSession {
    row_id: RowId,
    covalue: RowId,
    session_id: String,
    last_idx: u32,
    last_signature: String,
    bytes_since_last_signature: i64,
}

const SESSION_COLUMNS: &str =
    "rowID, coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature";

fn raw_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok(RawSession {
        row_id: row.get(0)?,
        covalue: row.get(1)?,
        session_id: row.get(2)?,
        last_idx: row.get(3)?,
        last_signature: row.get(4)?,
        bytes_since_last_signature: row.get(5)?,
    })
}

impl RawSession {
    fn parse(self) -> Result<StoredSessionRow> {
        Ok(StoredSessionRow {
            row_id: self.row_id,
            covalue: self.covalue,
            session_id: SessionId::parse(self.session_id)?,
            last_idx: self.last_idx,
            last_signature: Signature::parse(self.last_signature)?,
            bytes_since_last_signature: self.bytes_since_last_signature.max(0) as usize,
        })
    }
}

fn query_single_session(
    conn: &Connection,
    covalue: RowId,
    session: &SessionId,
) -> Result<Option<StoredSessionRow>> {
    let raw = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE coValue = ?1 AND sessionID = ?2"),
            params![covalue, session.as_str()],
            raw_session,
        )
        .optional()?;
    raw.map(RawSession::parse).transpose()
}

fn remove_session(conn: &Connection, session: RowId) -> Result<()> {
    conn.execute("DELETE FROM transactions WHERE ses = ?1", params![session])?;
    conn.execute("DELETE FROM signatureAfter WHERE ses = ?1", params![session])?;
    conn.execute("DELETE FROM sessions WHERE rowID = ?1", params![session])?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Transactions
// ─────────────────────────────────────────────────────────────────────────────

struct SqliteTx<'a, 'conn> {
    tx: &'a rusqlite::Transaction<'conn>,
}

impl DbTransaction for SqliteTx<'_, '_> {
    fn get_single_session(
        &self,
        covalue: RowId,
        session: &SessionId,
    ) -> Result<Option<StoredSessionRow>> {
        query_single_session(self.tx, covalue, session)
    }

    fn mark_covalue_as_deleted(&mut self, id: &CoId) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO deletedCoValues (coValueID) VALUES (?1)",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn add_session_update(&mut self, update: &SessionRow) -> Result<RowId> {
        let row_id = self.tx.query_row(
            "INSERT INTO sessions (coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (coValue, sessionID) DO UPDATE SET
                lastIdx = excluded.lastIdx,
                lastSignature = excluded.lastSignature,
                bytesSinceLastSignature = excluded.bytesSinceLastSignature
             RETURNING rowID",
            params![
                update.covalue,
                update.session_id.as_str(),
                update.last_idx,
                update.last_signature.as_str(),
                update.bytes_since_last_signature as i64,
            ],
            |row| row.get(0),
        )?;
        Ok(row_id)
    }

    fn add_transaction(&mut self, session: RowId, idx: u32, tx: &Transaction) -> Result<()> {
        self.tx.execute(
            "INSERT INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)",
            params![session, idx, serde_json::to_string(tx)?],
        )?;
        Ok(())
    }

    fn add_signature_after(&mut self, session: RowId, idx: u32, signature: &Signature) -> Result<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO signatureAfter (ses, idx, signature) VALUES (?1, ?2, ?3)",
            params![session, idx, signature.as_str()],
        )?;
        Ok(())
    }

    fn delete_session(&mut self, session: RowId) -> Result<()> {
        remove_session(self.tx, session)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DbClient
// ─────────────────────────────────────────────────────────────────────────────

impl DbClient for SqliteDb {
    fn get_covalue(&self, id: &CoId) -> Result<Option<StoredCoValueRow>> {
        let conn = self.conn.lock();
        let raw: Option<(RowId, String)> = conn
            .query_row(
                "SELECT rowID, header FROM coValues WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        raw.map(|(row_id, header)| -> Result<StoredCoValueRow> {
            Ok(StoredCoValueRow {
                row_id,
                id: id.clone(),
                header: serde_json::from_str(&header)?,
            })
        })
        .transpose()
    }

    fn upsert_covalue(&mut self, id: &CoId, header: Option<&CoValueHeader>) -> Result<Option<RowId>> {
        let conn = self.conn.lock();
        let Some(header) = header else {
            return Ok(conn
                .query_row(
                    "SELECT rowID FROM coValues WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?);
        };
        let row_id = conn.query_row(
            "INSERT INTO coValues (id, header) VALUES (?1, ?2)
             ON CONFLICT (id) DO UPDATE SET id = excluded.id
             RETURNING rowID",
            params![id.as_str(), serde_json::to_string(header)?],
            |row| row.get(0),
        )?;
        Ok(Some(row_id))
    }

    fn get_covalue_sessions(&self, covalue: RowId) -> Result<Vec<StoredSessionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE coValue = ?1 ORDER BY rowID"
        ))?;
        let raw = stmt
            .query_map(params![covalue], raw_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawSession::parse).collect()
    }

    fn get_new_transactions_in_session(
        &self,
        session: RowId,
        from: u32,
        to: u32,
    ) -> Result<Vec<TransactionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ses, idx, tx FROM transactions
             WHERE ses = ?1 AND idx >= ?2 AND idx <= ?3
             ORDER BY idx",
        )?;
        let raw = stmt
            .query_map(params![session, from, to], |row| {
                Ok((row.get::<_, RowId>(0)?, row.get::<_, u32>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|(ses, idx, tx)| -> Result<TransactionRow> {
                Ok(TransactionRow {
                    ses,
                    idx,
                    tx: serde_json::from_str(&tx)?,
                })
            })
            .collect()
    }

    fn get_signatures(&self, session: RowId, first_new_idx: u32) -> Result<Vec<SignatureAfterRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT idx, signature FROM signatureAfter
             WHERE ses = ?1 AND idx >= ?2
             ORDER BY idx",
        )?;
        let raw = stmt
            .query_map(params![session, first_new_idx], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|(idx, signature)| -> Result<SignatureAfterRow> {
                Ok(SignatureAfterRow {
                    idx,
                    signature: Signature::parse(signature)?,
                })
            })
            .collect()
    }

    fn transaction<T>(&mut self, f: impl FnOnce(&mut dyn DbTransaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&mut SqliteTx { tx: &tx })?;
        tx.commit()?;
        Ok(result)
    }

    fn get_all_covalues_waiting_for_delete(&self) -> Result<Vec<CoId>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT coValueID FROM deletedCoValues WHERE status = 0 ORDER BY coValueID")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|id| CoId::parse(id).map_err(Into::into))
            .collect()
    }

    fn erase_covalue_but_keep_tombstone(&mut self, id: &CoId) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row_id: Option<RowId> = tx
            .query_row(
                "SELECT rowID FROM coValues WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(row_id) = row_id else {
            tracing::warn!(id = %id, "CoValue not found, skipping erase");
            return Ok(());
        };

        let sessions = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE coValue = ?1"
            ))?;
            let raw = stmt
                .query_map(params![row_id], raw_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raw.into_iter()
                .map(RawSession::parse)
                .collect::<Result<Vec<_>>>()?
        };
        for session in sessions {
            if !session.session_id.is_delete_session() {
                remove_session(&tx, session.row_id)?;
            }
        }

        tx.execute(
            "INSERT INTO deletedCoValues (coValueID, status) VALUES (?1, 1)
             ON CONFLICT (coValueID) DO UPDATE SET status = 1",
            params![id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn track_covalues_sync_state(&mut self, updates: &[SyncStateUpdate]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for update in updates {
            if update.synced {
                tx.execute(
                    "DELETE FROM unsynced_covalues WHERE co_value_id = ?1 AND peer_id = ?2",
                    params![update.id.as_str(), update.peer_id.as_str()],
                )?;
            } else {
                tx.execute(
                    "INSERT OR REPLACE INTO unsynced_covalues (co_value_id, peer_id) VALUES (?1, ?2)",
                    params![update.id.as_str(), update.peer_id.as_str()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_unsynced_covalue_ids(&self) -> Result<Vec<CoId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT co_value_id FROM unsynced_covalues ORDER BY co_value_id",
        )?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|id| CoId::parse(id).map_err(Into::into))
            .collect()
    }

    fn stop_tracking_sync_state(&mut self, id: &CoId) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM unsynced_covalues WHERE co_value_id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }
}
