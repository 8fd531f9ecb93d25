//! # CoValue Permissions
//!
//! Group-based access control for CoValues.
//!
//! ## Overview
//!
//! Permissions are not flags stored next to the data. A group is itself a
//! CoValue whose transactions assign roles, and its state is recomputed by
//! replaying those transactions. Every other CoValue names its owning group in
//! its header, and each of its transactions is accepted only if the author
//! held a writing role in that group when the transaction was made.
//!
//! ## Key Concepts
//!
//! - **Role**: `reader`, `writer`, `admin`, `writeOnly` or `revoked`
//! - **GroupState**: the replayed roles, entries and parent groups of a group
//! - **Read key**: a symmetric key that encrypts private transactions,
//!   revealed to members by sealing it to their agent
//!
//! ## Encryption Model
//!
//! 1. **Read key**: private transactions are encrypted with the group's
//!    current read key (ChaCha20-Poly1305)
//! 2. **Revelations**: the read key is sealed to each member (X25519) and
//!    stored in the group under `{keyId}_for_{agentId}`

pub mod error;
pub mod group;
pub mod keys;
pub mod role;
pub mod rules;

pub use error::{PermsError, Result};
pub use group::{
    referenced_parent_groups, GroupEntry, GroupLookup, GroupState, MapOp, NoGroups, ParentRole,
    TxRecord,
};
pub use keys::{
    current_read_key, read_key_secret, reveal_read_key, reveal_read_key_to_everyone, set_read_key,
};
pub use role::{Role, EVERYONE};
pub use rules::{determine_valid_transactions, is_delete_marker, DELETED_META_KEY};
