//! # CoValue
//!
//! A local-first, multi-writer replication engine. Every CoValue is a set of
//! append-only, signed sessions; nodes exchange the sessions they are missing
//! with their peers and persist them to local storage.
//!
//! ## Overview
//!
//! - **Sessions**: each writer appends to its own hash-chained, signed log
//! - **Groups**: permissions and read keys are themselves CoValues
//! - **Content**: maps and lists, stored as packed change arrays
//! - **Sync**: `load` / `known` / `content` / `done` / `error` between peers,
//!   with corrections when an assumption about a peer turns out wrong
//! - **Recovery**: a writer whose session diverged from a peer's copy adopts
//!   the peer's history and re-signs its own tail on top of it
//! - **Deletion**: a marker in a `$`-suffixed delete session makes a value a
//!   tombstone that storage can erase
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use covalue::core::{AgentSecret, DefaultCrypto};
//! use covalue::store::{MemoryDb, StorageApi, StorageSync};
//! use covalue::{LocalNode, NodeConfig};
//!
//! async fn example() -> covalue::Result<()> {
//!     let agent = AgentSecret::generate(&DefaultCrypto::new());
//!     let config = NodeConfig::default();
//!     let storage: Arc<dyn StorageApi> =
//!         Arc::new(StorageSync::with_config(MemoryDb::new(), config.storage_config()));
//!     let node = LocalNode::new(agent, Some(storage), config)?;
//!
//!     let group = node.create_group()?;
//!     let map = node.create_map(&group)?;
//!     node.map_set(&map, "title", "hello")?;
//!
//!     assert_eq!(node.map(&map)?.get("title"), Some(&"hello".into()));
//!     node.shutdown().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `covalue::core` - IDs, headers, transactions, session logs, crypto
//! - `covalue::perms` - group roles, read keys, transaction validity
//! - `covalue::store` - the storage API with memory and SQLite backends
//! - `covalue::sync` - wire messages, peer state, transports

pub mod config;
pub mod content;
pub mod entry;
pub mod error;
pub mod node;
mod recovery;
mod sync_manager;
pub mod value;

pub use covalue_core as core;
pub use covalue_perms as perms;
pub use covalue_store as store;
pub use covalue_sync as sync;

pub use config::{NodeConfig, RetryConfig, SyncWhen};
pub use content::{GroupView, ListView, MapEntry, MapView, OpId};
pub use entry::{CoValueEntry, LoadingStatus};
pub use error::{NodeError, Result};
pub use node::LocalNode;
pub use value::{CoValueCore, Privacy};

pub use covalue_core::{AgentId, AgentSecret, CoId, KnownState, PeerId, SessionId};
pub use covalue_perms::Role;
pub use covalue_sync::PeerRole;
