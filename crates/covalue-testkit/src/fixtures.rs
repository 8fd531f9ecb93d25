//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: agents, storage and links
//! between nodes.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use covalue::{LocalNode, NodeConfig, PeerRole};
use covalue_core::{AgentId, AgentSecret, CryptoProvider, DefaultCrypto, PeerId, SessionId};
use covalue_store::{MemoryDb, SqliteDb, StorageApi, StorageSync, WorkerStorage};
use covalue_sync::{connected_pair, MemoryTransport, Transport};

/// Log to the test writer. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

/// Default node settings with a short sync timeout.
pub fn test_config() -> NodeConfig {
    NodeConfig {
        sync_timeout: Duration::from_secs(5),
        ..NodeConfig::default()
    }
}

/// In-memory storage with checkpoints matching [`test_config`].
pub fn memory_storage() -> Arc<dyn StorageApi> {
    Arc::new(StorageSync::with_config(MemoryDb::new(), test_config().storage_config()))
}

/// SQLite storage at `path`, driven from a worker task.
pub fn sqlite_storage(path: impl AsRef<Path>) -> covalue_store::Result<Arc<dyn StorageApi>> {
    let db = SqliteDb::open(path)?;
    Ok(Arc::new(WorkerStorage::spawn(StorageSync::with_config(
        db,
        test_config().storage_config(),
    ))))
}

/// An agent with its secret, ready to start nodes.
pub struct TestAgent {
    pub secret: AgentSecret,
    pub id: AgentId,
    pub crypto: Arc<dyn CryptoProvider>,
}

impl TestAgent {
    /// Create an agent with fresh random keys.
    pub fn new() -> Self {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(DefaultCrypto::new());
        let secret = AgentSecret::generate(crypto.as_ref());
        let id = secret
            .id(crypto.as_ref())
            .unwrap_or_else(|e| panic!("generated agent has no id: {e}"));
        Self { secret, id, crypto }
    }

    /// A new random session of this agent.
    pub fn session(&self) -> SessionId {
        self.crypto.new_random_session_id(self.id.as_str())
    }

    /// Start a node in a fresh session.
    pub fn node(&self, storage: Option<Arc<dyn StorageApi>>) -> covalue::Result<LocalNode> {
        self.node_in_session(self.session(), storage, test_config())
    }

    /// Start a node writing to `session`.
    pub fn node_in_session(
        &self,
        session: SessionId,
        storage: Option<Arc<dyn StorageApi>>,
        config: NodeConfig,
    ) -> covalue::Result<LocalNode> {
        LocalNode::with_session(self.secret.clone(), session, self.crypto.clone(), storage, config)
    }
}

impl Default for TestAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// Create several agents for multi-party tests.
pub fn multi_agent(count: usize) -> Vec<TestAgent> {
    (0..count).map(|_| TestAgent::new()).collect()
}

static NEXT_LINK: AtomicU64 = AtomicU64::new(0);

/// Nodes of one agent may share a session, so names carry a link counter.
fn peer_name(node: &LocalNode, link: u64) -> PeerId {
    PeerId::new(format!("peer_{}_{link}", node.session_id()))
}

/// An in-memory connection from a client node to a server node.
pub struct Link {
    /// The server, as the client knows it.
    pub server: PeerId,
    /// The client, as the server knows it.
    pub client: PeerId,
    client_end: Arc<MemoryTransport>,
    server_end: Arc<MemoryTransport>,
}

impl Link {
    /// The transport the client sends on.
    pub fn client_end(&self) -> &MemoryTransport {
        &self.client_end
    }

    /// The transport the server sends on.
    pub fn server_end(&self) -> &MemoryTransport {
        &self.server_end
    }

    /// Drop the connection on both sides.
    pub fn close(&self) {
        self.client_end.close();
        self.server_end.close();
    }
}

/// Connect `client` to `server`: the client sees a server peer, the server
/// a client peer.
pub fn connect(client: &LocalNode, server: &LocalNode) -> covalue::Result<Link> {
    let link = NEXT_LINK.fetch_add(1, Ordering::Relaxed);
    let server_id = peer_name(server, link);
    let client_id = peer_name(client, link);
    let (client_end, server_end) = connected_pair(client_id.as_str(), server_id.as_str());
    let client_end = Arc::new(client_end);
    let server_end = Arc::new(server_end);

    server.add_peer(client_id.clone(), PeerRole::Client, server_end.clone())?;
    client.add_peer(server_id.clone(), PeerRole::Server, client_end.clone())?;
    Ok(Link {
        server: server_id,
        client: client_id,
        client_end,
        server_end,
    })
}
