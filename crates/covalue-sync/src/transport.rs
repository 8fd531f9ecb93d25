//! Transport abstraction for the sync protocol.
//!
//! A transport is one bidirectional connection to one peer. Framing is up to
//! the implementation; the node only hands it [`SyncMessage`]s. Sending never
//! waits, so it can be called while node state is locked.

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::SyncMessage;

/// One connection to a peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a message for the peer.
    fn send(&self, message: SyncMessage) -> Result<()>;

    /// Receive the next message. `None` once the connection is closed.
    async fn recv(&self) -> Result<Option<SyncMessage>>;

    /// Close the connection in both directions.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// In-memory transport for tests.
///
/// Messages cross the connection as JSON text, so both ends exercise the
/// wire format.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use parking_lot::{Mutex, RwLock};
    use tokio::sync::mpsc;

    use crate::error::SyncError;

    /// Decides whether an outgoing message is delivered.
    pub type MessageFilter = Box<dyn Fn(&SyncMessage) -> bool + Send + Sync>;

    /// One end of an in-memory connection.
    pub struct MemoryTransport {
        name: String,
        sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
        receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
        closed: Arc<AtomicBool>,
        filter: RwLock<Option<MessageFilter>>,
    }

    /// Create two connected ends.
    pub fn connected_pair(
        a: impl Into<String>,
        b: impl Into<String>,
    ) -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let end = |name: String, tx, rx| MemoryTransport {
            name,
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            closed: Arc::clone(&closed),
            filter: RwLock::new(None),
        };
        (end(a.into(), a_tx, a_rx), end(b.into(), b_tx, b_rx))
    }

    impl MemoryTransport {
        pub fn name(&self) -> &str {
            &self.name
        }

        /// Only deliver outgoing messages for which `filter` returns true.
        pub fn set_outgoing_filter(
            &self,
            filter: impl Fn(&SyncMessage) -> bool + Send + Sync + 'static,
        ) {
            *self.filter.write() = Some(Box::new(filter));
        }

        pub fn clear_outgoing_filter(&self) {
            *self.filter.write() = None;
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        fn send(&self, message: SyncMessage) -> Result<()> {
            if let Some(filter) = self.filter.read().as_ref() {
                if !filter(&message) {
                    return Ok(());
                }
            }
            let frame = message.to_json()?;
            let sender = self.sender.lock();
            let Some(sender) = sender.as_ref() else {
                return Err(SyncError::Closed);
            };
            sender
                .send(frame)
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }

        async fn recv(&self) -> Result<Option<SyncMessage>> {
            let mut rx = self.receiver.lock().await;
            match rx.recv().await {
                Some(frame) => SyncMessage::from_json(&frame).map(Some),
                None => Ok(None),
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.sender.lock().take();
            self.receiver.try_lock().map(|mut rx| rx.close()).ok();
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
