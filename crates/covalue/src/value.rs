//! The in-memory state of one available CoValue.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use covalue_core::{
    CoId, CoValueHeader, CryptoProvider, KeyId, KeySecret, KnownState, NewContentMessage,
    SessionId, SessionMap, SessionNewContent, Signature, SignedTransaction, SignerSecret,
    Transaction, TransactionId,
};
use covalue_perms::{referenced_parent_groups, TxRecord};

use crate::error::Result;

/// How a new local transaction is written.
#[derive(Debug, Clone)]
pub enum Privacy {
    /// Changes in the clear.
    Trusting,
    /// Changes encrypted under a group read key.
    Private { key_id: KeyId, key_secret: KeySecret },
}

/// A verified CoValue: header plus signed sessions.
#[derive(Debug, Clone)]
pub struct CoValueCore {
    verified: SessionMap,
}

impl CoValueCore {
    /// Start an empty CoValue from its header, checking that the header
    /// hashes to `id`.
    pub fn new(
        id: CoId,
        header: CoValueHeader,
        crypto: Arc<dyn CryptoProvider>,
        max_tx_size: usize,
    ) -> Result<Self> {
        header.validate()?;
        header.verify_id(&id, crypto.as_ref())?;
        Ok(Self {
            verified: SessionMap::new(id, header, crypto, max_tx_size),
        })
    }

    pub fn from_verified(verified: SessionMap) -> Self {
        Self { verified }
    }

    pub fn id(&self) -> &CoId {
        self.verified.id()
    }

    pub fn header(&self) -> &CoValueHeader {
        self.verified.header()
    }

    pub fn verified(&self) -> &SessionMap {
        &self.verified
    }

    pub fn verified_mut(&mut self) -> &mut SessionMap {
        &mut self.verified
    }

    /// Swap in a rebuilt session map, keeping nothing of the old one.
    pub fn replace_verified(&mut self, verified: SessionMap) {
        self.verified = verified;
    }

    pub fn known_state(&self) -> KnownState {
        self.verified.known_state()
    }

    pub fn known_state_with_streaming(&self) -> KnownState {
        self.verified.known_state_with_streaming()
    }

    pub fn is_streaming(&self) -> bool {
        self.verified.is_streaming()
    }

    pub fn is_deleted(&self) -> bool {
        self.verified.is_deleted()
    }

    pub fn transactions_count(&self, session: &SessionId) -> u32 {
        self.verified.transactions_count(session).unwrap_or(0)
    }

    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Vec<NewContentMessage>> {
        self.verified.new_content_since(known)
    }

    /// All content of `session`, cut at its checkpoints.
    pub fn full_session_content(&self, session: &SessionId) -> Vec<SessionNewContent> {
        self.verified
            .get(session)
            .map(|log| log.full_content())
            .unwrap_or_default()
    }

    pub fn try_add_transactions(
        &mut self,
        session: &SessionId,
        transactions: &[Transaction],
        signature: &Signature,
        skip_verify: bool,
    ) -> covalue_core::Result<()> {
        self.verified
            .add_transactions(session, None, transactions, signature, skip_verify)
    }

    /// Append a local transaction to `session`.
    pub fn make_transaction(
        &mut self,
        session: &SessionId,
        signer: &SignerSecret,
        changes: &[Value],
        privacy: &Privacy,
        meta: Option<&Value>,
        made_at: u64,
    ) -> Result<SignedTransaction> {
        let signed = match privacy {
            Privacy::Trusting => self
                .verified
                .make_new_trusting_transaction(session, signer, changes, meta, made_at)?,
            Privacy::Private { key_id, key_secret } => self.verified.make_new_private_transaction(
                session, signer, changes, key_id, key_secret, meta, made_at,
            )?,
        };
        Ok(signed)
    }

    /// A content message carrying exactly one freshly made transaction.
    pub fn content_for_transaction(
        &self,
        session: &SessionId,
        signed: &SignedTransaction,
    ) -> NewContentMessage {
        let index = self.transactions_count(session).saturating_sub(1);
        let mut msg = NewContentMessage::create(self.id().clone(), self.header(), false);
        msg.add_transaction(
            session,
            signed.transaction.clone(),
            index,
            signed.signature.clone(),
        );
        msg
    }

    /// CoValues that must be available before this one can be evaluated:
    /// the owning group, and the parents a group extends.
    pub fn dependencies(&self) -> BTreeSet<CoId> {
        let mut deps = BTreeSet::new();
        if let Some(group) = self.header().owner_group() {
            deps.insert(group.clone());
        }
        if self.header().is_group() {
            deps.extend(referenced_parent_groups(&self.tx_records(&|_| None)));
        }
        deps
    }

    /// Every transaction as seen by permission evaluation. Private changes
    /// are decrypted when `key` knows their read key.
    pub fn tx_records(&self, key: &dyn Fn(&KeyId) -> Option<KeySecret>) -> Vec<TxRecord> {
        let mut records = Vec::new();
        for (session, log) in self.verified.sessions() {
            for (index, tx) in log.transactions().iter().enumerate() {
                let index = index as u32;
                let (changes, meta) = match tx {
                    Transaction::Trusting(trusting) => (
                        tx.trusting_changes().ok().flatten(),
                        trusting
                            .meta
                            .as_deref()
                            .and_then(|meta| serde_json::from_str(meta).ok()),
                    ),
                    Transaction::Private(private) => match key(&private.key_used) {
                        Some(secret) => (
                            self.verified
                                .decrypt_transaction(session, index, &secret)
                                .ok()
                                .flatten(),
                            self.verified
                                .decrypt_transaction_meta(session, index, &secret)
                                .ok()
                                .flatten(),
                        ),
                        None => (None, None),
                    },
                };
                records.push(TxRecord {
                    id: TransactionId::new(session.clone(), index),
                    author: session.owner_agent(),
                    made_at: tx.made_at(),
                    changes,
                    private: tx.is_private(),
                    meta,
                });
            }
        }
        records
    }

    /// Read keys used by private transactions.
    pub fn keys_used(&self) -> BTreeSet<KeyId> {
        self.verified
            .sessions()
            .flat_map(|(_, log)| log.transactions().iter())
            .filter_map(|tx| match tx {
                Transaction::Private(private) => Some(private.key_used.clone()),
                Transaction::Trusting(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::{AgentSecret, CoValueType, DefaultCrypto, Uniqueness};
    use serde_json::json;

    fn crypto() -> Arc<dyn CryptoProvider> {
        Arc::new(DefaultCrypto::new())
    }

    fn new_core(header: CoValueHeader) -> CoValueCore {
        let crypto = crypto();
        let id = header.id(crypto.as_ref()).unwrap();
        CoValueCore::new(id, header, crypto, 1024).unwrap()
    }

    #[test]
    fn test_header_must_match_id() {
        let crypto = crypto();
        let header = CoValueHeader::unsafe_allow_all(CoValueType::Comap, Uniqueness::Null);
        let wrong = CoId::parse("co_zdeadbeef").unwrap();
        assert!(CoValueCore::new(wrong, header, crypto, 1024).is_err());
    }

    #[test]
    fn test_local_transactions_round_trip_to_records() {
        let crypto = crypto();
        let agent = AgentSecret::generate(crypto.as_ref());
        let agent_id = agent.id(crypto.as_ref()).unwrap();
        let session = crypto.new_random_session_id(agent_id.as_str());
        let (key_id, key_secret) = crypto.new_key_secret();

        let mut core = new_core(CoValueHeader::unsafe_allow_all(
            CoValueType::Comap,
            Uniqueness::random(crypto.as_ref()),
        ));
        let first = core
            .make_transaction(&session, &agent.signer, &[json!({"op": "set", "key": "a", "value": 1})], &Privacy::Trusting, None, 10)
            .unwrap();
        core.make_transaction(
            &session,
            &agent.signer,
            &[json!({"op": "set", "key": "b", "value": 2})],
            &Privacy::Private { key_id: key_id.clone(), key_secret: key_secret.clone() },
            Some(&json!({"note": "secret"})),
            11,
        )
        .unwrap();

        let msg = core.content_for_transaction(&session, &first);
        assert_eq!(msg.new[&session].after, 1);
        assert_eq!(core.keys_used().into_iter().collect::<Vec<_>>(), vec![key_id.clone()]);

        let hidden = core.tx_records(&|_| None);
        assert_eq!(hidden.len(), 2);
        assert!(hidden[0].changes.is_some());
        assert_eq!(hidden[0].author.as_ref(), Some(&agent_id));
        assert!(hidden[1].private && hidden[1].changes.is_none());

        let revealed = core.tx_records(&|id| (id == &key_id).then(|| key_secret.clone()));
        assert_eq!(revealed[1].changes.as_ref().unwrap()[0]["value"], json!(2));
        assert_eq!(revealed[1].meta, Some(json!({"note": "secret"})));
    }

    #[test]
    fn test_dependencies_of_owned_value() {
        let group = CoId::parse("co_zgroup").unwrap();
        let core = new_core(CoValueHeader::owned_by_group(
            CoValueType::Comap,
            group.clone(),
            Uniqueness::Null,
        ));
        assert_eq!(core.dependencies().into_iter().collect::<Vec<_>>(), vec![group]);
    }

    #[test]
    fn test_full_session_content_reapplies() {
        let crypto = crypto();
        let agent = AgentSecret::generate(crypto.as_ref());
        let session = crypto.new_random_session_id(agent.id(crypto.as_ref()).unwrap().as_str());
        let header = CoValueHeader::unsafe_allow_all(CoValueType::Colist, Uniqueness::Null);
        let mut core = new_core(header.clone());
        for n in 0..4 {
            core.make_transaction(&session, &agent.signer, &[json!("x".repeat(600))], &Privacy::Trusting, None, n)
                .unwrap();
        }

        let pieces = core.full_session_content(&session);
        assert!(pieces.len() > 1);

        let mut copy = new_core(header);
        for piece in &pieces {
            copy.try_add_transactions(&session, &piece.new_transactions, &piece.last_signature, false)
                .unwrap();
        }
        assert_eq!(copy.known_state(), core.known_state());
    }
}
