//! Transactions: one signed unit of change within a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{Encrypted, KeyId};
use crate::error::{CoreError, Result};
use crate::ids::{CoId, TransactionId};
use crate::json::stable_stringify;

/// Plaintext changes, authenticated by the session signature only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustingTransaction {
    /// JSON-stringified change list.
    pub changes: String,
    pub made_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
}

/// Changes encrypted under a group read key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateTransaction {
    pub encrypted_changes: Encrypted,
    pub key_used: KeyId,
    pub made_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Encrypted>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "lowercase")]
pub enum Transaction {
    Trusting(TrustingTransaction),
    Private(PrivateTransaction),
}

impl Transaction {
    /// A trusting transaction from already-parsed changes.
    pub fn trusting(changes: &[Value], meta: Option<&Value>, made_at: u64) -> Result<Self> {
        Ok(Transaction::Trusting(TrustingTransaction {
            changes: serde_json::to_string(changes)?,
            made_at,
            meta: meta.map(serde_json::to_string).transpose()?,
        }))
    }

    pub fn made_at(&self) -> u64 {
        match self {
            Transaction::Trusting(tx) => tx.made_at,
            Transaction::Private(tx) => tx.made_at,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private(_))
    }

    /// Size of the changes payload, the unit for checkpoint thresholds.
    pub fn size(&self) -> usize {
        match self {
            Transaction::Trusting(tx) => tx.changes.len(),
            Transaction::Private(tx) => tx.encrypted_changes.as_str().len(),
        }
    }

    /// Canonical bytes fed into the session hash chain.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(stable_stringify(self)?.into_bytes())
    }

    /// Parsed changes of a trusting transaction.
    pub fn trusting_changes(&self) -> Result<Option<Vec<Value>>> {
        match self {
            Transaction::Trusting(tx) => parse_changes(&tx.changes).map(Some),
            Transaction::Private(_) => Ok(None),
        }
    }
}

/// Parse a stringified change list.
pub fn parse_changes(changes: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(changes)?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(CoreError::InvalidTransaction(format!(
            "changes must be a JSON array, got {}",
            other
        ))),
    }
}

/// Nonce material binding a private payload to its position.
///
/// Serialized as `{"in": coId, "tx": txId}` in stable form.
pub fn nonce_material(id: &CoId, tx_id: &TransactionId) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct NonceMaterial<'a> {
        #[serde(rename = "in")]
        in_id: &'a CoId,
        tx: &'a TransactionId,
    }
    Ok(stable_stringify(&NonceMaterial { in_id: id, tx: tx_id })?.into_bytes())
}

/// Nonce material for the encrypted metadata of a private transaction.
pub fn meta_nonce_material(id: &CoId, tx_id: &TransactionId) -> Result<Vec<u8>> {
    let mut material = nonce_material(id, tx_id)?;
    material.extend_from_slice(b"/meta");
    Ok(material)
}
