//! Signature mismatch recovery.
//!
//! When a peer rejects one of our sessions it replies with its own copy of
//! that session. If the session belongs to this agent, the copy is adopted
//! and the transactions only we have are re-signed on top of it, keeping
//! their original timestamps. Sessions of other agents are left alone.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use covalue_core::{
    CoId, KeyId, KeySecret, KnownState, PeerId, SessionId, SessionMap, SessionNewContent,
    SignerSecret, Transaction,
};
use covalue_store::SessionReplacement;
use covalue_sync::ErrorMessage;

use crate::error::{NodeError, Result};
use crate::node::NodeInner;

/// A session rebuilt from a peer's authoritative copy.
#[derive(Debug)]
pub(crate) struct RebuiltSession {
    pub verified: SessionMap,
    /// Transactions taken from the peer's copy.
    pub authoritative_len: u32,
    /// Local transactions re-signed after them.
    pub replayed: u32,
}

fn recovery_error(id: &CoId, reason: impl Into<String>) -> NodeError {
    NodeError::Recovery {
        id: id.clone(),
        reason: reason.into(),
    }
}

/// Rebuild `session` of `current` from `authoritative`, then re-sign the
/// local transactions past the longest common prefix on top of it. Other
/// sessions are carried over unchanged.
pub(crate) fn rebuild_session(
    current: &SessionMap,
    session: &SessionId,
    authoritative: &[SessionNewContent],
    signer: &SignerSecret,
    read_key: &dyn Fn(&KeyId) -> Option<KeySecret>,
    max_tx_size: usize,
) -> Result<RebuiltSession> {
    let id = current.id();
    let mut rebuilt = SessionMap::new(
        id.clone(),
        current.header().clone(),
        current.crypto().clone(),
        max_tx_size,
    );

    for (other, log) in current.sessions() {
        if other == session {
            continue;
        }
        for piece in log.full_content() {
            rebuilt.add_transactions(other, None, &piece.new_transactions, &piece.last_signature, true)?;
        }
    }

    for piece in authoritative {
        let have = rebuilt.transactions_count(session).unwrap_or(0);
        if piece.after != have {
            return Err(recovery_error(
                id,
                format!("piece starts at {} but {have} transactions precede it", piece.after),
            ));
        }
        rebuilt
            .add_transactions(session, None, &piece.new_transactions, &piece.last_signature, false)
            .map_err(|e| recovery_error(id, format!("authoritative content does not verify: {e}")))?;
    }
    let authoritative_len = rebuilt.transactions_count(session).unwrap_or(0);

    let local: &[Transaction] = current.get(session).map(|log| log.transactions()).unwrap_or(&[]);
    let theirs: &[Transaction] = rebuilt.get(session).map(|log| log.transactions()).unwrap_or(&[]);
    let common = local
        .iter()
        .zip(theirs)
        .take_while(|(ours, theirs)| ours == theirs)
        .count();

    let mut replayed = 0;
    for (index, tx) in local.iter().enumerate().skip(common) {
        let index = index as u32;
        match tx {
            Transaction::Trusting(trusting) => {
                let changes = tx.trusting_changes()?.unwrap_or_default();
                let meta: Option<Value> = trusting
                    .meta
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()
                    .map_err(covalue_core::CoreError::from)?;
                rebuilt.make_new_trusting_transaction(session, signer, &changes, meta.as_ref(), trusting.made_at)?;
            }
            Transaction::Private(private) => {
                let secret = read_key(&private.key_used).ok_or_else(|| {
                    recovery_error(id, format!("no read key {} for transaction {index}", private.key_used))
                })?;
                let changes = current
                    .decrypt_transaction(session, index, &secret)?
                    .unwrap_or_default();
                let meta = current.decrypt_transaction_meta(session, index, &secret)?;
                rebuilt.make_new_private_transaction(
                    session,
                    signer,
                    &changes,
                    &private.key_used,
                    &secret,
                    meta.as_ref(),
                    private.made_at,
                )?;
            }
        }
        replayed += 1;
    }

    if current.is_deleted() {
        rebuilt.mark_as_deleted();
    }

    Ok(RebuiltSession {
        verified: rebuilt,
        authoritative_len,
        replayed,
    })
}

impl NodeInner {
    /// Adopt `peer`'s copy of a session it rejected, if the session is ours.
    pub(crate) async fn recover_session(self: &Arc<Self>, peer: &PeerId, msg: ErrorMessage) -> Result<()> {
        let id = msg.id.clone();
        let session = msg.session_id.clone();
        if session.owner_agent().as_ref() != Some(&self.agent_id) {
            info!(id = %id, session = %session, "Mismatch in a session we do not own, ignoring");
            return Ok(());
        }
        if self.storage.is_none() {
            warn!(id = %id, session = %session, "No storage to persist a rebuilt session, skipping recovery");
            return Ok(());
        }
        let Some(entry) = self.get_entry(&id) else {
            debug!(id = %id, "Mismatch reported for a value we do not hold");
            return Ok(());
        };
        let Some(snapshot) = entry.with_core(|core| core.verified().clone()) else {
            return Ok(());
        };

        let group = snapshot.header().owner_group().cloned();
        let rebuilt = rebuild_session(
            &snapshot,
            &session,
            &msg.content,
            &self.agent.signer,
            &|key| self.read_key(group.as_ref(), key),
            self.config.max_tx_size,
        )?;
        info!(
            id = %id,
            session = %session,
            authoritative = rebuilt.authoritative_len,
            replayed = rebuilt.replayed,
            "Rebuilt session from peer history"
        );

        let content = rebuilt
            .verified
            .get(&session)
            .map(|log| log.full_content())
            .unwrap_or_default();
        self.replace_session_history(SessionReplacement {
            id: id.clone(),
            session_id: session.clone(),
            content,
        })
        .await?;

        entry.with_core_mut(|core| core.replace_verified(rebuilt.verified));

        if let Some(peer) = self.peer(peer) {
            let mut known = peer
                .known_state(&id)
                .unwrap_or_else(|| KnownState::empty(id.clone()));
            known.header = true;
            known.sessions.insert(session.clone(), rebuilt.authoritative_len);
            peer.set_known_state(known);
        }
        for peer in self.peers_snapshot() {
            if !peer.is_closed() && (peer.is_server() || peer.is_subscribed(&id)) {
                self.send_new_content(&peer, &id, false);
            }
        }
        Ok(())
    }
}
