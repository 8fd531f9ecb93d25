//! # CoValue Core
//!
//! Pure primitives for replicated CoValues: identifiers, headers, signed
//! per-session transaction logs, known states, content messages and the
//! list-operation compaction codec.
//!
//! This crate contains no I/O, no storage, no networking. Cryptography is
//! reached only through the [`CryptoProvider`] trait; [`DefaultCrypto`] is the
//! bundled implementation (Ed25519, X25519, ChaCha20-Poly1305, Blake3).
//!
//! ## Key Types
//!
//! - [`CoId`] - Content-derived identifier of a CoValue (`co_z…`)
//! - [`SessionId`] - One writer/device log (`…_session_z…`, `…_session_d…$`)
//! - [`CoValueHeader`] - Immutable root of trust for a CoValue
//! - [`SessionMap`] - All verified sessions of one CoValue
//! - [`KnownState`] - "How much of this CoValue have I seen"
//! - [`NewContentMessage`] - A chunk of new transactions per session
//!
//! ## Signature Chains
//!
//! Each session keeps a running Blake3 hash over its transactions. The
//! signature stored after transaction *i* signs the hash after *i*, so it
//! covers transactions `[0..=i]`. When the bytes written since the last
//! checkpoint exceed [`config::MAX_RECOMMENDED_TX_SIZE`], the signature is
//! kept as a checkpoint so content can be streamed and verified in pieces.

pub mod config;
pub mod content;
pub mod crypto;
pub mod error;
pub mod header;
pub mod ids;
pub mod json;
pub mod known_state;
pub mod pack;
pub mod session_log;
pub mod session_map;
pub mod transaction;

pub use config::exceeds_recommended_size;
pub use content::{NewContentMessage, Priority, SessionNewContent};
pub use crypto::{
    AgentSecret, CryptoProvider, DefaultCrypto, Encrypted, Hash, KeyId, KeySecret, Sealed,
    SealerId, SealerSecret, SessionHasher, Signature, SignerId, SignerSecret,
};
pub use error::{CoreError, Result};
pub use header::{CoValueHeader, CoValueType, Ruleset, Uniqueness};
pub use ids::{AgentId, CoId, PeerId, SessionId, TransactionId};
pub use json::stable_stringify;
pub use known_state::{KnownState, KnownStateSessions};
pub use pack::{
    pack_changes, pack_map_changes, unpack_changes, unpack_map_changes, ListOp, MapOp,
};
pub use session_log::SessionLog;
pub use session_map::{SessionMap, SignedTransaction};
pub use transaction::{PrivateTransaction, Transaction, TrustingTransaction};
