//! CoValue headers.
//!
//! A header is fixed at creation and is the root of trust for everything
//! appended afterwards: the CoValue ID is derived from its stable JSON form,
//! and its ruleset decides who may write.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::config::SHORT_HASH_LENGTH;
use crate::crypto::CryptoProvider;
use crate::error::{CoreError, Result};
use crate::ids::{AgentId, CoId};
use crate::json::stable_stringify;

/// The kind of content a CoValue holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueType {
    Comap,
    Colist,
    Costream,
    Coplaintext,
}

/// Permission ruleset fixed in the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Ruleset {
    /// The CoValue is itself a group; its content holds role assignments.
    #[serde(rename = "group", rename_all = "camelCase")]
    Group { initial_admin: AgentId },
    /// Writes are authorised by the role of the writer in `group`.
    #[serde(rename = "ownedByGroup", rename_all = "camelCase")]
    OwnedByGroup {
        group: CoId,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        restrict_deletion: bool,
    },
    /// Every valid signature is accepted.
    #[serde(rename = "unsafeAllowAll")]
    UnsafeAllowAll,
}

/// Salt that makes otherwise identical headers produce distinct IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Uniqueness {
    Null,
    Bool(bool),
    String(String),
    Object(BTreeMap<String, String>),
}

impl Uniqueness {
    /// Random string uniqueness.
    pub fn random(crypto: &dyn CryptoProvider) -> Self {
        Uniqueness::String(hex::encode(crypto.random_bytes(12)))
    }

    /// Object uniqueness may not contain empty keys.
    pub fn validate(&self) -> Result<()> {
        if let Uniqueness::Object(map) = self {
            if map.keys().any(|k| k.is_empty()) {
                return Err(CoreError::InvalidHeader(
                    "uniqueness object contains an empty key".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Immutable header of a CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub co_type: CoValueType,
    pub ruleset: Ruleset,
    pub meta: Option<Map<String, Value>>,
    pub uniqueness: Uniqueness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl CoValueHeader {
    /// Header of a new group with `initial_admin` as bootstrap admin.
    pub fn new_group(initial_admin: AgentId, uniqueness: Uniqueness) -> Self {
        Self {
            co_type: CoValueType::Comap,
            ruleset: Ruleset::Group { initial_admin },
            meta: None,
            uniqueness,
            created_at: None,
        }
    }

    /// Header of a value owned by `group`.
    pub fn owned_by_group(co_type: CoValueType, group: CoId, uniqueness: Uniqueness) -> Self {
        Self {
            co_type,
            ruleset: Ruleset::OwnedByGroup {
                group,
                restrict_deletion: false,
            },
            meta: None,
            uniqueness,
            created_at: None,
        }
    }

    /// Header of a value that accepts every valid signature.
    pub fn unsafe_allow_all(co_type: CoValueType, uniqueness: Uniqueness) -> Self {
        Self {
            co_type,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            uniqueness,
            created_at: None,
        }
    }

    /// Attach metadata.
    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// True when this header describes a group.
    pub fn is_group(&self) -> bool {
        matches!(self.ruleset, Ruleset::Group { .. })
    }

    /// The owning group, for group-owned values.
    pub fn owner_group(&self) -> Option<&CoId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group, .. } => Some(group),
            _ => None,
        }
    }

    /// The `type` field of the metadata, if any.
    pub fn meta_type(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.get("type"))
            .and_then(Value::as_str)
    }

    /// Structural checks a receiver applies before trusting a header.
    pub fn validate(&self) -> Result<()> {
        self.uniqueness.validate()?;
        if let Some(created_at) = &self.created_at {
            if !created_at.starts_with('2') {
                return Err(CoreError::InvalidHeader(format!(
                    "malformed createdAt {:?}",
                    created_at
                )));
            }
        }
        Ok(())
    }

    /// Content-derived ID: `co_z` + hex of the short Blake3 digest of the
    /// stable JSON form.
    pub fn id(&self, crypto: &dyn CryptoProvider) -> Result<CoId> {
        let json = stable_stringify(self)?;
        let digest = crypto.hash_bytes(json.as_bytes());
        Ok(CoId::from_payload(&hex::encode(&digest[..SHORT_HASH_LENGTH])))
    }

    /// Check that `id` was derived from this header.
    pub fn verify_id(&self, id: &CoId, crypto: &dyn CryptoProvider) -> Result<()> {
        let actual = self.id(crypto)?;
        if &actual != id {
            return Err(CoreError::IdMismatch {
                expected: id.clone(),
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCrypto;
    use serde_json::json;

    fn agent() -> AgentId {
        AgentId::parse("sealer_zaa/signer_zbb").unwrap()
    }

    #[test]
    fn test_ruleset_wire_shape() {
        let header = CoValueHeader::new_group(agent(), Uniqueness::Null);
        let value = serde_json::to_value(&header).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "comap",
                "ruleset": {"type": "group", "initialAdmin": "sealer_zaa/signer_zbb"},
                "meta": null,
                "uniqueness": null,
            })
        );

        let owned = CoValueHeader::owned_by_group(
            CoValueType::Colist,
            CoId::parse("co_zgroup").unwrap(),
            Uniqueness::String("salt".into()),
        );
        let value = serde_json::to_value(&owned).unwrap();
        assert_eq!(value["ruleset"], json!({"type": "ownedByGroup", "group": "co_zgroup"}));
    }

    #[test]
    fn test_header_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), "v".to_string());
        let header = CoValueHeader::unsafe_allow_all(CoValueType::Costream, Uniqueness::Object(map))
            .with_meta(json!({"type": "binary"}).as_object().cloned().unwrap());
        let json = serde_json::to_string(&header).unwrap();
        let back: CoValueHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(back, header);
        assert_eq!(back.meta_type(), Some("binary"));
    }

    #[test]
    fn test_id_is_deterministic_and_salted() {
        let crypto = DefaultCrypto;
        let a = CoValueHeader::new_group(agent(), Uniqueness::String("1".into()));
        let b = CoValueHeader::new_group(agent(), Uniqueness::String("2".into()));

        let id = a.id(&crypto).unwrap();
        assert_eq!(id, a.clone().id(&crypto).unwrap());
        assert_ne!(id, b.id(&crypto).unwrap());
        assert_eq!(id.payload().len(), SHORT_HASH_LENGTH * 2);
        assert!(a.verify_id(&id, &crypto).is_ok());
        assert!(matches!(
            b.verify_id(&id, &crypto),
            Err(CoreError::IdMismatch { .. })
        ));
    }

    #[test]
    fn test_uniqueness_rejects_empty_keys() {
        let mut map = BTreeMap::new();
        map.insert(String::new(), "v".to_string());
        let header = CoValueHeader::new_group(agent(), Uniqueness::Object(map));
        assert!(header.validate().is_err());
    }
}
