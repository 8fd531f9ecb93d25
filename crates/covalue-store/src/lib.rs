//! # CoValue Store
//!
//! Storage abstraction for CoValues. Nodes persist and reload through the
//! [`StorageApi`] trait; durable backends only implement the row-level
//! [`DbClient`] and get the reconciliation logic from [`StorageSync`].
//!
//! ## Key Types
//!
//! - [`StorageApi`] - The async trait a node stores through
//! - [`StorageSync`] - Reconciliation layer over any [`DbClient`]
//! - [`SqliteDb`] - SQLite-based persistent backend
//! - [`MemoryDb`] - In-memory backend for tests
//! - [`WorkerStorage`] - Any storage moved onto its own worker task
//! - [`StorageStreamingQueue`] - Chunks of large values waiting to be pulled
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalue_store::{SqliteDb, StorageApi, StorageSync, WorkerStorage};
//!
//! async fn example() {
//!     // Persistent storage on the current runtime
//!     let storage = StorageSync::new(SqliteDb::open("covalues.db").unwrap());
//!
//!     // Or behind a worker boundary
//!     let worker = WorkerStorage::spawn(StorageSync::new(SqliteDb::open_memory().unwrap()));
//!     # let _ = (storage, worker);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Ordered sessions**: transactions of a session are stored strictly in
//!   index order; content starting past what is stored triggers a correction
//! - **Checkpoints**: a signature is kept whenever the bytes written since
//!   the last one exceed the recommended size, so loads can stream
//! - **Dependencies first**: owning and parent groups are returned before
//!   the values that need them
//! - **Tombstones**: erasing a deleted value keeps its header and its delete
//!   sessions

pub mod eraser;
pub mod error;
pub mod known_state;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod storage_sync;
pub mod streaming;
pub mod traits;
pub mod worker;

pub use eraser::{DeletedCoValuesEraser, EraserConfig};
pub use error::{Result, StoreError};
pub use known_state::StorageKnownState;
pub use memory::MemoryDb;
pub use sqlite::SqliteDb;
pub use storage_sync::{StorageConfig, StorageSync};
pub use streaming::StorageStreamingQueue;
pub use traits::{
    CorrectionCallback, DbClient, DbTransaction, DeletionStatus, LoadOutcome, SessionReplacement,
    StorageApi, StoreOutcome, SyncStateUpdate,
};
pub use worker::WorkerStorage;
