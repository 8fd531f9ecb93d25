//! # CoValue Sync
//!
//! Building blocks of the peer sync protocol: the wire messages, per-peer
//! state, the outgoing load scheduler and the incoming message queue. The
//! protocol logic that ties them to CoValues lives in the `covalue` crate.
//!
//! ## Key Properties
//!
//! - **Idempotent**: content that is already known is sliced away on arrival
//! - **Self-correcting**: a wrong assumption about the peer is answered with a
//!   `known` correction instead of leaving a gap
//! - **Bounded**: at most [`LoadQueueConfig::max_in_flight`] loads per peer
//! - **Fair**: incoming messages are served round-robin across peers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalue_core::{CoId, KnownState};
//! use covalue_sync::{connected_pair, SyncMessage, Transport};
//!
//! async fn example() {
//!     let (client, server) = connected_pair("client", "server");
//!     let id = CoId::parse("co_zexample").unwrap();
//!     client.send(SyncMessage::Load(KnownState::empty(id))).unwrap();
//!     let _msg = server.recv().await.unwrap();
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Client                              Server
//!   |-------- load (known state) ----->|
//!   |<------- content (new txs) -------|
//!   |-------- known (ack) ------------>|
//!   |-------- content (local txs) ---->|
//!   |<------- known (ack) -------------|
//!   |                                  |
//!   |-------- content (stale after) -->|
//!   |<------- known (isCorrection) ----|
//!   |-------- content (from there) --->|
//!   |                                  |
//!   |-------- content (bad signature)->|
//!   |<------- error (mismatch) --------|
//! ```

pub mod error;
pub mod incoming;
pub mod linked_list;
pub mod load_queue;
pub mod messages;
pub mod peer;
pub mod transport;
pub mod unsynced;

pub use error::{Result, SyncError};
pub use incoming::IncomingMessagesQueue;
pub use linked_list::{LinkedList, NodeHandle};
pub use load_queue::{LoadMode, LoadQueueConfig, LoadStatus, OutgoingLoadQueue, TimeoutReport};
pub use messages::{DoneMessage, ErrorMessage, KnownMessage, SyncErrorType, SyncMessage};
pub use peer::{PeerRole, PeerState};
pub use transport::{
    memory::{connected_pair, MemoryTransport},
    Transport,
};
pub use unsynced::UnsyncedTracker;
