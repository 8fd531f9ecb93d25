//! A single session's append-only, signed transaction log.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::exceeds_recommended_size;
use crate::content::SessionNewContent;
use crate::crypto::{CryptoProvider, KeySecret, SessionHasher, Signature, SignerId, SignerSecret};
use crate::error::{CoreError, Result};
use crate::ids::{CoId, SessionId, TransactionId};
use crate::transaction::{meta_nonce_material, nonce_material, parse_changes, Transaction};

/// Transactions of one session plus their signature chain.
///
/// Indices are contiguous from 0. The running hash after transaction *i*
/// covers `[0..=i]`; `last_signature` signs the hash after the last
/// transaction, and `signature_after` keeps the checkpoints recorded whenever
/// the bytes since the previous checkpoint exceeded the size threshold.
#[derive(Debug, Clone)]
pub struct SessionLog {
    session_id: SessionId,
    signer_id: Option<SignerId>,
    transactions: Vec<Transaction>,
    last_signature: Option<Signature>,
    signature_after: BTreeMap<u32, Signature>,
    last_signature_checkpoint: Option<u32>,
    bytes_since_last_signature: usize,
    hasher: SessionHasher,
}

impl SessionLog {
    pub fn new(session_id: SessionId, signer_id: Option<SignerId>) -> Self {
        Self {
            session_id,
            signer_id,
            transactions: Vec::new(),
            last_signature: None,
            signature_after: BTreeMap::new(),
            last_signature_checkpoint: None,
            bytes_since_last_signature: 0,
            hasher: SessionHasher::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn signer_id(&self) -> Option<&SignerId> {
        self.signer_id.as_ref()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn transaction(&self, index: u32) -> Option<&Transaction> {
        self.transactions.get(index as usize)
    }

    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    /// Checkpoint signature recorded after transaction `index`.
    pub fn signature_after(&self, index: u32) -> Option<&Signature> {
        self.signature_after.get(&index)
    }

    /// All checkpoints, in index order.
    pub fn signature_checkpoints(&self) -> impl Iterator<Item = (u32, &Signature)> {
        self.signature_after.iter().map(|(i, s)| (*i, s))
    }

    pub fn last_signature_checkpoint(&self) -> Option<u32> {
        self.last_signature_checkpoint
    }

    /// The whole session as contiguous pieces, cut after every checkpoint.
    ///
    /// Each piece carries the signature covering everything up to its last
    /// transaction, so the pieces can be re-applied one by one.
    pub fn full_content(&self) -> Vec<SessionNewContent> {
        let Some(last_signature) = &self.last_signature else {
            return Vec::new();
        };
        let mut pieces = Vec::new();
        let mut after = 0u32;
        let mut buffer = Vec::new();
        for (index, tx) in self.transactions.iter().enumerate() {
            let index = index as u32;
            buffer.push(tx.clone());
            let signature = match self.signature_after.get(&index) {
                Some(checkpoint) => checkpoint,
                None if index + 1 == self.len() => last_signature,
                None => continue,
            };
            pieces.push(SessionNewContent {
                after,
                new_transactions: std::mem::take(&mut buffer),
                last_signature: signature.clone(),
            });
            after = index + 1;
        }
        pieces
    }

    /// Append transactions signed by `signer`.
    ///
    /// The signature must cover the hash chain after the last new
    /// transaction. Nothing is appended if verification fails.
    pub fn try_add(
        &mut self,
        crypto: &dyn CryptoProvider,
        signer: Option<&SignerId>,
        new_transactions: &[Transaction],
        signature: &Signature,
        skip_verify: bool,
        max_tx_size: usize,
    ) -> Result<()> {
        if new_transactions.is_empty() {
            return Ok(());
        }

        let mut hasher = self.hasher.clone();
        for tx in new_transactions {
            hasher.update(&tx.canonical_bytes()?);
        }

        if !skip_verify {
            let signer = signer
                .or(self.signer_id.as_ref())
                .ok_or_else(|| CoreError::UnknownSigner(self.session_id.clone()))?;
            let digest = hasher.digest();
            if !crypto.verify(signer, digest.as_str().as_bytes(), signature) {
                return Err(CoreError::InvalidSignature(self.session_id.clone()));
            }
        }

        if self.signer_id.is_none() {
            self.signer_id = signer.cloned();
        }
        self.hasher = hasher;
        self.commit(new_transactions.to_vec(), signature.clone(), max_tx_size);
        Ok(())
    }

    /// Sign and append one locally authored transaction.
    pub fn add_new_transaction(
        &mut self,
        crypto: &dyn CryptoProvider,
        signer_secret: &SignerSecret,
        tx: Transaction,
        max_tx_size: usize,
    ) -> Result<Signature> {
        let mut hasher = self.hasher.clone();
        hasher.update(&tx.canonical_bytes()?);
        let signature = crypto.sign(signer_secret, hasher.digest().as_str().as_bytes())?;

        if self.signer_id.is_none() {
            self.signer_id = Some(crypto.signer_id(signer_secret)?);
        }
        self.hasher = hasher;
        self.commit(vec![tx], signature.clone(), max_tx_size);
        Ok(signature)
    }

    /// Record a checkpoint taken by someone else, e.g. storage replaying
    /// piece boundaries.
    pub fn force_signature_after(&mut self, index: u32, signature: Signature) {
        self.signature_after.insert(index, signature);
        if self.last_signature_checkpoint.map_or(true, |last| index > last) {
            self.last_signature_checkpoint = Some(index);
        }
    }

    fn commit(&mut self, new_transactions: Vec<Transaction>, signature: Signature, max_tx_size: usize) {
        let added: usize = new_transactions.iter().map(Transaction::size).sum();
        self.transactions.extend(new_transactions);
        let checkpoint = exceeds_recommended_size(self.bytes_since_last_signature, added, max_tx_size);
        self.bytes_since_last_signature += added;

        if checkpoint {
            let index = self.len() - 1;
            self.signature_after.insert(index, signature.clone());
            self.last_signature_checkpoint = Some(index);
            self.bytes_since_last_signature = 0;
        }
        self.last_signature = Some(signature);
    }

    /// Decrypted (or parsed, for trusting transactions) changes at `index`.
    ///
    /// Returns `Ok(None)` when there is no such transaction.
    pub fn decrypt_transaction(
        &self,
        crypto: &dyn CryptoProvider,
        co_id: &CoId,
        index: u32,
        key: &KeySecret,
    ) -> Result<Option<Vec<Value>>> {
        let Some(tx) = self.transaction(index) else {
            return Ok(None);
        };
        match tx {
            Transaction::Trusting(tx) => parse_changes(&tx.changes).map(Some),
            Transaction::Private(tx) => {
                let tx_id = TransactionId::new(self.session_id.clone(), index);
                let nonce = nonce_material(co_id, &tx_id)?;
                let plaintext = crypto.decrypt(&tx.encrypted_changes, key, &nonce)?;
                let changes = String::from_utf8(plaintext)
                    .map_err(|e| CoreError::InvalidTransaction(e.to_string()))?;
                parse_changes(&changes).map(Some)
            }
        }
    }

    /// Decrypted metadata at `index`, if the transaction carries any.
    pub fn decrypt_transaction_meta(
        &self,
        crypto: &dyn CryptoProvider,
        co_id: &CoId,
        index: u32,
        key: &KeySecret,
    ) -> Result<Option<Value>> {
        let Some(tx) = self.transaction(index) else {
            return Ok(None);
        };
        match tx {
            Transaction::Trusting(tx) => match &tx.meta {
                Some(meta) => Ok(Some(serde_json::from_str(meta)?)),
                None => Ok(None),
            },
            Transaction::Private(tx) => {
                let Some(meta) = &tx.meta else {
                    return Ok(None);
                };
                let tx_id = TransactionId::new(self.session_id.clone(), index);
                let nonce = meta_nonce_material(co_id, &tx_id)?;
                let plaintext = crypto.decrypt(meta, key, &nonce)?;
                Ok(Some(serde_json::from_slice(&plaintext)?))
            }
        }
    }
}
