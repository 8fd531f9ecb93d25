//! All verified sessions of one CoValue.

use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

use crate::content::NewContentMessage;
use crate::crypto::{CryptoProvider, KeyId, KeySecret, Signature, SignerId, SignerSecret};
use crate::error::{CoreError, Result};
use crate::header::CoValueHeader;
use crate::ids::{CoId, SessionId, TransactionId};
use crate::known_state::{combine_sessions, sessions_to_send, KnownState, KnownStateSessions};
use crate::session_log::SessionLog;
use crate::transaction::{
    meta_nonce_material, nonce_material, PrivateTransaction, Transaction, TrustingTransaction,
};

/// A locally authored transaction and the signature now heading its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub signature: Signature,
    pub transaction: Transaction,
}

/// The verified state of a CoValue: its header plus every session log.
///
/// Sessions keep insertion order, which is the order content is emitted in.
#[derive(Clone)]
pub struct SessionMap {
    id: CoId,
    header: CoValueHeader,
    crypto: Arc<dyn CryptoProvider>,
    sessions: IndexMap<SessionId, SessionLog>,
    streaming_known_state: Option<KnownStateSessions>,
    deleted: bool,
    max_tx_size: usize,
}

impl std::fmt::Debug for SessionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMap")
            .field("id", &self.id)
            .field("sessions", &self.sessions.len())
            .field("deleted", &self.deleted)
            .field("streaming", &self.streaming_known_state.is_some())
            .finish()
    }
}

impl SessionMap {
    pub fn new(
        id: CoId,
        header: CoValueHeader,
        crypto: Arc<dyn CryptoProvider>,
        max_tx_size: usize,
    ) -> Self {
        Self {
            id,
            header,
            crypto,
            sessions: IndexMap::new(),
            streaming_known_state: None,
            deleted: false,
            max_tx_size,
        }
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    pub fn get(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &SessionLog)> {
        self.sessions.iter()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn transactions_count(&self, session: &SessionId) -> Option<u32> {
        self.sessions.get(session).map(SessionLog::len)
    }

    /// Append remote or stored transactions to `session`.
    ///
    /// The signer defaults to the signing key of the agent that owns the
    /// session. A failed verification leaves the map untouched.
    pub fn add_transactions(
        &mut self,
        session: &SessionId,
        signer: Option<&SignerId>,
        transactions: &[Transaction],
        signature: &Signature,
        skip_verify: bool,
    ) -> Result<()> {
        if self.deleted && !session.is_delete_session() {
            return Err(CoreError::DeletedCoValue(self.id.clone()));
        }

        let owner_signer = session.owner_agent().map(|agent| agent.signer_id());
        let signer = signer.or(owner_signer.as_ref());
        let crypto = self.crypto.clone();

        match self.sessions.get_mut(session) {
            Some(log) => log.try_add(
                crypto.as_ref(),
                signer,
                transactions,
                signature,
                skip_verify,
                self.max_tx_size,
            )?,
            None => {
                let mut log = SessionLog::new(session.clone(), None);
                log.try_add(
                    crypto.as_ref(),
                    signer,
                    transactions,
                    signature,
                    skip_verify,
                    self.max_tx_size,
                )?;
                if !log.is_empty() {
                    self.sessions.insert(session.clone(), log);
                }
            }
        }

        self.clear_streaming_if_complete();
        Ok(())
    }

    /// Record a checkpoint supplied from outside (storage piece boundaries).
    pub fn force_signature_after(&mut self, session: &SessionId, index: u32, signature: Signature) {
        if let Some(log) = self.sessions.get_mut(session) {
            log.force_signature_after(index, signature);
        }
    }

    /// Replace a session wholesale with verified authoritative content.
    pub fn replace_session(
        &mut self,
        session: &SessionId,
        signer: Option<&SignerId>,
        transactions: &[Transaction],
        signature: &Signature,
    ) -> Result<()> {
        let owner_signer = session.owner_agent().map(|agent| agent.signer_id());
        let signer = signer.or(owner_signer.as_ref());

        let mut log = SessionLog::new(session.clone(), None);
        log.try_add(
            self.crypto.as_ref(),
            signer,
            transactions,
            signature,
            false,
            self.max_tx_size,
        )?;
        self.sessions.insert(session.clone(), log);
        Ok(())
    }

    pub fn make_new_trusting_transaction(
        &mut self,
        session: &SessionId,
        signer_secret: &SignerSecret,
        changes: &[Value],
        meta: Option<&Value>,
        made_at: u64,
    ) -> Result<SignedTransaction> {
        if self.deleted {
            return Err(CoreError::DeletedCoValue(self.id.clone()));
        }
        let transaction = Transaction::Trusting(TrustingTransaction {
            changes: serde_json::to_string(changes)?,
            made_at,
            meta: meta.map(serde_json::to_string).transpose()?,
        });
        self.append_local(session, signer_secret, transaction)
    }

    pub fn make_new_private_transaction(
        &mut self,
        session: &SessionId,
        signer_secret: &SignerSecret,
        changes: &[Value],
        key_id: &KeyId,
        key_secret: &KeySecret,
        meta: Option<&Value>,
        made_at: u64,
    ) -> Result<SignedTransaction> {
        if self.deleted {
            return Err(CoreError::DeletedCoValue(self.id.clone()));
        }
        let index = self.transactions_count(session).unwrap_or(0);
        let tx_id = TransactionId::new(session.clone(), index);
        let nonce = nonce_material(&self.id, &tx_id)?;

        let plaintext = serde_json::to_vec(changes)?;
        let encrypted_changes = self.crypto.encrypt(&plaintext, key_secret, &nonce)?;
        let meta = match meta {
            Some(meta) => Some(self.crypto.encrypt(
                &serde_json::to_vec(meta)?,
                key_secret,
                &meta_nonce_material(&self.id, &tx_id)?,
            )?),
            None => None,
        };

        let transaction = Transaction::Private(PrivateTransaction {
            encrypted_changes,
            key_used: key_id.clone(),
            made_at,
            meta,
        });
        self.append_local(session, signer_secret, transaction)
    }

    fn append_local(
        &mut self,
        session: &SessionId,
        signer_secret: &SignerSecret,
        transaction: Transaction,
    ) -> Result<SignedTransaction> {
        let crypto = self.crypto.clone();
        let max_tx_size = self.max_tx_size;
        let log = self
            .sessions
            .entry(session.clone())
            .or_insert_with(|| SessionLog::new(session.clone(), None));
        let signature =
            log.add_new_transaction(crypto.as_ref(), signer_secret, transaction.clone(), max_tx_size)?;
        Ok(SignedTransaction {
            signature,
            transaction,
        })
    }

    pub fn decrypt_transaction(
        &self,
        session: &SessionId,
        index: u32,
        key: &KeySecret,
    ) -> Result<Option<Vec<Value>>> {
        match self.sessions.get(session) {
            Some(log) => log.decrypt_transaction(self.crypto.as_ref(), &self.id, index, key),
            None => Ok(None),
        }
    }

    pub fn decrypt_transaction_meta(
        &self,
        session: &SessionId,
        index: u32,
        key: &KeySecret,
    ) -> Result<Option<Value>> {
        match self.sessions.get(session) {
            Some(log) => log.decrypt_transaction_meta(self.crypto.as_ref(), &self.id, index, key),
            None => Ok(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Known state
    // ─────────────────────────────────────────────────────────────────────────

    /// Per-session counts actually held. Once deleted, only delete sessions
    /// are reported.
    pub fn known_state(&self) -> KnownState {
        let mut state = KnownState::empty(self.id.clone());
        state.header = true;
        for (session, log) in &self.sessions {
            if self.deleted && !session.is_delete_session() {
                continue;
            }
            state.sessions.insert(session.clone(), log.len());
        }
        state
    }

    /// Known state including content announced but still arriving.
    pub fn known_state_with_streaming(&self) -> KnownState {
        let mut state = self.known_state();
        if let Some(streaming) = &self.streaming_known_state {
            combine_sessions(&mut state.sessions, streaming);
        }
        state
    }

    /// Announce the counts this value will reach once streaming completes.
    pub fn set_streaming_known_state(&mut self, target: &KnownStateSessions) {
        if self.deleted {
            return;
        }
        let mut merged = self.streaming_known_state.take().unwrap_or_default();
        combine_sessions(&mut merged, target);
        self.streaming_known_state = Some(merged);
        self.clear_streaming_if_complete();
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_known_state.is_some()
    }

    fn clear_streaming_if_complete(&mut self) {
        let complete = match &self.streaming_known_state {
            Some(target) => target.iter().all(|(session, count)| {
                self.sessions.get(session).map_or(0, SessionLog::len) >= *count
            }),
            None => false,
        };
        if complete {
            self.streaming_known_state = None;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deletion
    // ─────────────────────────────────────────────────────────────────────────

    /// One-way: from now on only delete sessions are reported or accepted.
    pub fn mark_as_deleted(&mut self) {
        self.deleted = true;
        self.streaming_known_state = None;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// True if any delete session holds transactions.
    pub fn has_delete_session(&self) -> bool {
        self.sessions
            .iter()
            .any(|(session, log)| session.is_delete_session() && !log.is_empty())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────────

    /// Content a party with `known` is missing, split into pieces.
    ///
    /// A session is cut at every checkpoint so each piece carries a signature
    /// the receiver can verify. Sessions that would push a piece past the
    /// size limit start a new piece. The header goes on the first piece when
    /// the receiver lacks it; `expectContentUntil` is set when the content
    /// spans several pieces or this value is itself still streaming.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Vec<NewContentMessage>> {
        let mut pieces = vec![NewContentMessage::create(self.id.clone(), &self.header, false)];
        let mut piece_size = 0usize;

        for (session, log) in &self.sessions {
            if self.deleted && !session.is_delete_session() {
                continue;
            }
            let Some(last_signature) = log.last_signature() else {
                continue;
            };

            let start = known.map_or(0, |k| k.session_count(session));
            let len = log.len();
            let mut session_size = 0usize;

            for index in start..len {
                let Some(tx) = log.transaction(index) else {
                    break;
                };
                session_size += tx.size();
                let is_last = index == len - 1;
                let current = pieces.len() - 1;

                if let Some(checkpoint) = log.signature_after(index) {
                    pieces[current].add_transaction(session, tx.clone(), index, checkpoint.clone());
                    move_session_to_standalone_piece(&mut pieces, session, &self.id, &self.header);
                    session_size = 0;
                } else if is_last {
                    pieces[current].add_transaction(session, tx.clone(), index, last_signature.clone());
                    if session_size > self.max_tx_size {
                        move_session_to_standalone_piece(&mut pieces, session, &self.id, &self.header);
                    } else if piece_size + session_size > self.max_tx_size {
                        pieces.push(NewContentMessage::create(self.id.clone(), &self.header, false));
                        piece_size = 0;
                    } else {
                        piece_size += session_size;
                    }
                } else {
                    // Signature is overwritten by a checkpoint or the last one
                    pieces[current].add_transaction(session, tx.clone(), index, last_signature.clone());
                }
            }
        }

        if !known.map_or(false, |k| k.header) {
            pieces[0].header = Some(self.header.clone());
        }

        let mut pieces: Vec<NewContentMessage> =
            pieces.into_iter().filter(|p| !p.is_empty()).collect();
        if pieces.is_empty() {
            return None;
        }

        if pieces.len() > 1 || self.is_streaming() {
            let target = self.known_state_with_streaming().sessions;
            pieces[0].expect_content_until = Some(match known {
                Some(known) => sessions_to_send(&target, &known.sessions),
                None => target,
            });
        }
        Some(pieces)
    }
}

/// Move `session`'s entry out of the current (last) piece into its own piece,
/// placed just before the current one so transaction order is preserved.
fn move_session_to_standalone_piece(
    pieces: &mut Vec<NewContentMessage>,
    session: &SessionId,
    id: &CoId,
    header: &CoValueHeader,
) {
    let current = pieces.len() - 1;
    let Some(content) = pieces[current].new.shift_remove(session) else {
        return;
    };
    let mut piece = NewContentMessage::create(id.clone(), header, false);
    piece.new.insert(session.clone(), content);
    pieces.insert(current, piece);
}
