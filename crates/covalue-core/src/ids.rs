//! Strong identifier types.
//!
//! Every identifier is a human-inspectable, prefix-tagged string. The newtypes
//! validate their prefix on parse and on deserialization so a malformed ID is
//! rejected at the boundary instead of deep inside the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Declares a prefix-tagged string newtype.
///
/// The `secret` form redacts the value in `Debug` output.
macro_rules! tagged_string {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        tagged_string!(@define $(#[$meta])* $name, $prefix);

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
    (secret $(#[$meta:meta])* $name:ident, $prefix:expr) => {
        tagged_string!(@define $(#[$meta])* $name, $prefix);

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}(<redacted>)", stringify!($name))
            }
        }
    };
    (@define $(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub(crate) String);

        impl $name {
            /// The string prefix every value of this type carries.
            pub const PREFIX: &'static str = $prefix;

            /// Parse and validate a tagged string.
            pub fn parse(s: impl Into<String>) -> $crate::error::Result<Self> {
                let s = s.into();
                if s.len() > Self::PREFIX.len() && s.starts_with(Self::PREFIX) {
                    Ok(Self(s))
                } else {
                    Err($crate::error::CoreError::InvalidId(format!(
                        "expected {} prefix, got {:?}",
                        Self::PREFIX,
                        s
                    )))
                }
            }

            #[allow(dead_code)]
            pub(crate) fn from_payload(payload: &str) -> Self {
                Self(format!("{}{}", Self::PREFIX, payload))
            }

            /// The part after the prefix.
            pub fn payload(&self) -> &str {
                &self.0[Self::PREFIX.len()..]
            }

            /// The full tagged string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::error::CoreError;

            fn try_from(s: String) -> $crate::error::Result<Self> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::CoreError;

            fn from_str(s: &str) -> $crate::error::Result<Self> {
                Self::parse(s)
            }
        }
    };
}

pub(crate) use tagged_string;

tagged_string!(
    /// Content-derived identifier of a CoValue: `co_z` + hex(short Blake3 of the header).
    CoId,
    "co_z"
);

/// Identifier of an agent: its public sealing and signing keys.
///
/// Format: `sealer_z…/signer_z…`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Build an agent ID from its two public keys.
    pub fn from_parts(sealer: &crate::crypto::SealerId, signer: &crate::crypto::SignerId) -> Self {
        Self(format!("{}/{}", sealer, signer))
    }

    /// Parse and validate an agent ID.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let (sealer, signer) = s
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidId(format!("malformed agent id {:?}", s)))?;
        crate::crypto::SealerId::parse(sealer)?;
        crate::crypto::SignerId::parse(signer)?;
        Ok(Self(s))
    }

    /// The public signing key of this agent.
    pub fn signer_id(&self) -> crate::crypto::SignerId {
        let signer = self.0.split_once('/').map(|(_, s)| s).unwrap_or_default();
        crate::crypto::SignerId(signer.to_string())
    }

    /// The public sealing key of this agent.
    pub fn sealer_id(&self) -> crate::crypto::SealerId {
        let sealer = self.0.split_once('/').map(|(s, _)| s).unwrap_or_default();
        crate::crypto::SealerId(sealer.to_string())
    }

    /// The full string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AgentId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<AgentId> for String {
    fn from(value: AgentId) -> String {
        value.0
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.0)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

const SESSION_MARKER: &str = "_session_";
const DELETE_SESSION_MARKER: &str = "_session_d";

/// Identifier of one writer/device log within a CoValue.
///
/// Normal sessions look like `{owner}_session_z{random}`. Delete sessions look
/// like `{owner}_session_d{random}$`; the trailing `$` is what storage
/// queries match on, so it is kept verbatim everywhere.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Parse and validate a session ID.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let Some(pos) = s.rfind(SESSION_MARKER) else {
            return Err(CoreError::InvalidId(format!("malformed session id {:?}", s)));
        };
        let suffix = &s[pos + SESSION_MARKER.len()..];
        let valid_suffix = match suffix.as_bytes().first() {
            Some(b'z') => suffix.len() > 1 && !suffix.ends_with('$'),
            Some(b'd') => suffix.len() > 2 && suffix.ends_with('$'),
            _ => false,
        };
        if pos == 0 || !valid_suffix {
            return Err(CoreError::InvalidId(format!("malformed session id {:?}", s)));
        }
        Ok(Self(s))
    }

    /// A normal session owned by `owner`.
    pub fn new_session(owner: &str, random: &str) -> Self {
        Self(format!("{}{}z{}", owner, SESSION_MARKER, random))
    }

    /// A delete-marker session owned by `owner`.
    pub fn new_delete_session(owner: &str, random: &str) -> Self {
        Self(format!("{}{}d{}$", owner, SESSION_MARKER, random))
    }

    /// The account or agent that owns this session.
    pub fn owner(&self) -> &str {
        match self.0.rfind(SESSION_MARKER) {
            Some(pos) => &self.0[..pos],
            None => &self.0,
        }
    }

    /// The owner as an agent, when the session is owned directly by one.
    pub fn owner_agent(&self) -> Option<AgentId> {
        AgentId::parse(self.owner()).ok()
    }

    /// True for `…_session_d…$` sessions.
    pub fn is_delete_session(&self) -> bool {
        self.0.contains(DELETE_SESSION_MARKER) && self.0.ends_with('$')
    }

    /// The full string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> String {
        value.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Position of a transaction: session plus index within that session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "txIndex")]
    pub tx_index: u32,
}

impl TransactionId {
    pub fn new(session_id: SessionId, tx_index: u32) -> Self {
        Self {
            session_id,
            tx_index,
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.tx_index)
    }
}

/// Identifier of a connected peer, chosen by whoever registers it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
