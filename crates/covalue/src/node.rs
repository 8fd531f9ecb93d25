//! The local node: CoValue entries, connected peers and storage of one agent
//! session.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use covalue_core::{
    pack_changes, pack_map_changes, AgentId, AgentSecret, CoId, CoValueHeader, CoValueType,
    CryptoProvider, DefaultCrypto, KeyId, KeySecret, KnownState, ListOp, NewContentMessage, PeerId,
    Ruleset, SessionId, TransactionId, Uniqueness,
};
use covalue_perms::{
    current_read_key, determine_valid_transactions, read_key_secret, reveal_read_key,
    set_read_key, GroupLookup, GroupState, MapOp, Role, TxRecord, DELETED_META_KEY,
};
use covalue_store::{SessionReplacement, StorageApi, SyncStateUpdate};
use covalue_sync::{
    IncomingMessagesQueue, LoadMode, PeerRole, PeerState, SyncMessage, Transport, UnsyncedTracker,
};

use crate::config::NodeConfig;
use crate::content::{GroupView, ListView, MapView, LIST_END, LIST_START};
use crate::value::{CoValueCore, Privacy};
use crate::entry::{CoValueEntry, LoadingStatus};
use crate::error::{NodeError, Result};

/// Work for the storage writer. Writes are applied one at a time, in order.
pub(crate) enum StorageJob {
    Store(NewContentMessage),
    ReplaceSession(SessionReplacement, oneshot::Sender<covalue_store::Result<()>>),
    TrackSyncState(Vec<SyncStateUpdate>),
    StopTracking(CoId),
    /// Resolves once every job queued before it is done.
    Flush(oneshot::Sender<()>),
}

pub(crate) struct NodeInner {
    pub(crate) agent: AgentSecret,
    pub(crate) agent_id: AgentId,
    pub(crate) session_id: SessionId,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) config: NodeConfig,
    pub(crate) storage: Option<Arc<dyn StorageApi>>,

    entries: Mutex<HashMap<CoId, Arc<CoValueEntry>>>,
    /// Dependency -> values whose content waits for it.
    pub(crate) waiting_on: Mutex<HashMap<CoId, BTreeSet<CoId>>>,
    pub(crate) peers: RwLock<BTreeMap<PeerId, Arc<PeerState>>>,
    pub(crate) incoming: Mutex<IncomingMessagesQueue<SyncMessage>>,
    pub(crate) processing: AtomicBool,
    pub(crate) drain_requested: AtomicBool,
    pub(crate) unsynced: Mutex<UnsyncedTracker>,
    /// Signalled whenever a peer acknowledges something.
    pub(crate) acks: Notify,

    read_keys: Mutex<HashMap<KeyId, KeySecret>>,
    last_made_at: Mutex<u64>,
    storage_tx: mpsc::UnboundedSender<StorageJob>,
    pub(crate) timer_tx: mpsc::UnboundedSender<PeerId>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    pub(crate) span: Span,
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// A node holding CoValues for one agent session.
///
/// Cheap to clone; all clones share the same state. Must be created inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("agent", &self.inner.agent_id.as_str())
            .field("session", &self.inner.session_id.as_str())
            .finish()
    }
}

impl LocalNode {
    /// Start a node for `agent` with a fresh random session.
    pub fn new(
        agent: AgentSecret,
        storage: Option<Arc<dyn StorageApi>>,
        config: NodeConfig,
    ) -> Result<Self> {
        Self::with_crypto(agent, Arc::new(DefaultCrypto::new()), storage, config)
    }

    pub fn with_crypto(
        agent: AgentSecret,
        crypto: Arc<dyn CryptoProvider>,
        storage: Option<Arc<dyn StorageApi>>,
        config: NodeConfig,
    ) -> Result<Self> {
        let agent_id = agent.id(crypto.as_ref())?;
        let session_id = crypto.new_random_session_id(agent_id.as_str());
        Self::with_session(agent, session_id, crypto, storage, config)
    }

    /// Start a node that writes to an existing session of `agent`.
    ///
    /// Two live nodes must never share a session; a session reused after
    /// the other writer went away is reconciled through signature mismatch
    /// recovery.
    pub fn with_session(
        agent: AgentSecret,
        session_id: SessionId,
        crypto: Arc<dyn CryptoProvider>,
        storage: Option<Arc<dyn StorageApi>>,
        config: NodeConfig,
    ) -> Result<Self> {
        let agent_id = agent.id(crypto.as_ref())?;
        let span = info_span!("node", session = %session_id);
        let (storage_tx, storage_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(NodeInner {
            agent,
            agent_id,
            session_id,
            crypto,
            config,
            storage,
            entries: Mutex::new(HashMap::new()),
            waiting_on: Mutex::new(HashMap::new()),
            peers: RwLock::new(BTreeMap::new()),
            incoming: Mutex::new(IncomingMessagesQueue::new()),
            processing: AtomicBool::new(false),
            drain_requested: AtomicBool::new(false),
            unsynced: Mutex::new(UnsyncedTracker::new()),
            acks: Notify::new(),
            read_keys: Mutex::new(HashMap::new()),
            last_made_at: Mutex::new(0),
            storage_tx,
            timer_tx,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            span,
        });

        let weak = Arc::downgrade(&inner);
        let mut tasks = vec![tokio::spawn(
            run_load_timer(weak.clone(), timer_rx).instrument(inner.span.clone()),
        )];
        if let Some(storage) = &inner.storage {
            tasks.push(tokio::spawn(
                run_storage_writer(storage.clone(), weak.clone(), storage_rx)
                    .instrument(inner.span.clone()),
            ));
            tasks.push(tokio::spawn(
                run_streaming_watcher(storage.clone(), weak).instrument(inner.span.clone()),
            ));
            if inner.config.erase_deleted_covalues {
                storage.enable_deleted_covalues_erasure();
            }
        }
        inner.tasks.lock().extend(tasks);

        inner.span.in_scope(|| info!(agent = %inner.agent_id, "Node started"));
        Ok(Self { inner })
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.inner.agent_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.inner.crypto
    }

    pub fn storage(&self) -> Option<&Arc<dyn StorageApi>> {
        self.inner.storage.as_ref()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creating values
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a CoValue from `header` and make it available locally.
    pub fn create(&self, header: CoValueHeader) -> Result<CoId> {
        self.inner.ensure_open()?;
        let id = header.id(self.inner.crypto.as_ref())?;
        let core = CoValueCore::new(
            id.clone(),
            header.clone(),
            self.inner.crypto.clone(),
            self.inner.config.max_tx_size,
        )?;
        let entry = self.inner.entry(&id);
        entry.with_core_or_init(|| Some(core), |_| ());
        self.inner
            .store(NewContentMessage::create(id.clone(), &header, true));
        debug!(parent: &self.inner.span, id = %id, "Created CoValue");
        Ok(id)
    }

    /// Create a group with this agent as admin and a fresh read key.
    pub fn create_group(&self) -> Result<CoId> {
        let inner = &self.inner;
        let header = CoValueHeader::new_group(
            inner.agent_id.clone(),
            Uniqueness::random(inner.crypto.as_ref()),
        );
        let id = self.create(header)?;

        let (key_id, key_secret) = inner.crypto.new_key_secret();
        inner.read_keys.lock().insert(key_id.clone(), key_secret.clone());

        let admin = MapOp::set(inner.agent_id.as_str(), Role::Admin.as_str());
        let reveal = reveal_read_key(
            inner.crypto.as_ref(),
            &id,
            &key_id,
            &key_secret,
            &inner.agent,
            &inner.agent_id,
        )?;
        for op in [admin, reveal, set_read_key(&key_id)] {
            inner.write(&id, &inner.session_id, &pack_map_changes(&[op]), Privacy::Trusting, None)?;
        }
        Ok(id)
    }

    /// Give `agent` a role in `group`, revealing the read key to readers.
    pub fn add_member(&self, group: &CoId, agent: &AgentId, role: Role) -> Result<()> {
        let inner = &self.inner;
        let state = inner.require_group(group)?;
        if !state.role_of(&inner.agent_id).is_some_and(Role::can_admin) {
            return Err(NodeError::NotAuthorized(format!("not an admin of {group}")));
        }

        let mut ops = vec![MapOp::set(agent.as_str(), role.as_str())];
        if role.can_read() {
            let (key_id, key_secret) =
                current_read_key(inner.crypto.as_ref(), &state, &inner.agent_id, &inner.agent)?;
            ops.push(reveal_read_key(
                inner.crypto.as_ref(),
                group,
                &key_id,
                &key_secret,
                &inner.agent,
                agent,
            )?);
        }
        for op in ops {
            inner.write(group, &inner.session_id, &pack_map_changes(&[op]), Privacy::Trusting, None)?;
        }
        Ok(())
    }

    /// Let every member of `parent` inherit their role in `child`.
    pub fn extend_group(&self, child: &CoId, parent: &CoId) -> Result<()> {
        let inner = &self.inner;
        let state = inner.require_group(child)?;
        inner.require_group(parent)?;
        if !state.role_of(&inner.agent_id).is_some_and(Role::can_admin) {
            return Err(NodeError::NotAuthorized(format!("not an admin of {child}")));
        }
        let op = MapOp::set(format!("parent_{parent}"), "extend");
        inner.write(child, &inner.session_id, &pack_map_changes(&[op]), Privacy::Trusting, None)
    }

    /// Create an empty map owned by `group`.
    pub fn create_map(&self, group: &CoId) -> Result<CoId> {
        self.inner.require_group(group)?;
        self.create(CoValueHeader::owned_by_group(
            CoValueType::Comap,
            group.clone(),
            Uniqueness::random(self.inner.crypto.as_ref()),
        ))
    }

    /// Create an empty list owned by `group`.
    pub fn create_list(&self, group: &CoId) -> Result<CoId> {
        self.inner.require_group(group)?;
        self.create(CoValueHeader::owned_by_group(
            CoValueType::Colist,
            group.clone(),
            Uniqueness::random(self.inner.crypto.as_ref()),
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────────

    /// Set `key` in the map `id`. Group-owned maps are written privately
    /// under the group's current read key.
    pub fn map_set(&self, id: &CoId, key: &str, value: impl Into<Value>) -> Result<()> {
        self.map_op(id, MapOp::set(key, value))
    }

    pub fn map_delete(&self, id: &CoId, key: &str) -> Result<()> {
        self.map_op(
            id,
            MapOp::Del {
                key: key.to_string(),
            },
        )
    }

    fn map_op(&self, id: &CoId, op: MapOp) -> Result<()> {
        let inner = &self.inner;
        let header = inner.require_header(id)?;
        if header.co_type != CoValueType::Comap {
            return Err(NodeError::WrongType {
                id: id.clone(),
                expected: "map",
            });
        }
        let privacy = inner.privacy_for(id, &header)?;
        inner.write(id, &inner.session_id, &pack_map_changes(&[op]), privacy, None)
    }

    /// Append `items` to the end of the list `id`, in one transaction.
    pub fn list_append(&self, id: &CoId, items: impl IntoIterator<Item = Value>) -> Result<()> {
        let list = self.list(id)?;
        let after = match list.len().checked_sub(1).and_then(|last| list.op_id(last)) {
            Some(op_id) => serde_json::to_value(op_id).map_err(|e| NodeError::Core(e.into()))?,
            None => Value::from(LIST_START),
        };
        let mut ops: Vec<ListOp> = items
            .into_iter()
            .map(|value| ListOp::App {
                value,
                after: after.clone(),
            })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        if after != Value::from(LIST_START) {
            // Successors of one anchor read newest first.
            ops.reverse();
        }
        self.list_ops(id, &ops)
    }

    /// Insert `value` before the item at `index`; `index == len` inserts at
    /// the end.
    pub fn list_insert(&self, id: &CoId, index: usize, value: impl Into<Value>) -> Result<()> {
        let list = self.list(id)?;
        let before = match list.op_id(index) {
            Some(op_id) => serde_json::to_value(op_id).map_err(|e| NodeError::Core(e.into()))?,
            None if index == list.len() => Value::from(LIST_END),
            None => {
                return Err(NodeError::InvalidIndex {
                    id: id.clone(),
                    index,
                })
            }
        };
        self.list_ops(
            id,
            &[ListOp::Pre {
                value: value.into(),
                before,
            }],
        )
    }

    pub fn list_delete(&self, id: &CoId, index: usize) -> Result<()> {
        let list = self.list(id)?;
        let op_id = list.op_id(index).ok_or_else(|| NodeError::InvalidIndex {
            id: id.clone(),
            index,
        })?;
        let insertion = serde_json::to_value(op_id).map_err(|e| NodeError::Core(e.into()))?;
        self.list_ops(id, &[ListOp::Del { insertion }])
    }

    /// List edits are stored packed.
    fn list_ops(&self, id: &CoId, ops: &[ListOp]) -> Result<()> {
        let inner = &self.inner;
        let header = inner.require_header(id)?;
        let privacy = inner.privacy_for(id, &header)?;
        inner.write(id, &inner.session_id, &pack_changes(ops), privacy, None)
    }

    /// Delete `id`: append a delete marker in a fresh delete session.
    ///
    /// Other sessions stop being reported or accepted once the marker is
    /// accepted by the permission rules.
    pub fn delete_covalue(&self, id: &CoId) -> Result<()> {
        let inner = &self.inner;
        let header = inner.require_header(id)?;
        if header.is_group() {
            return Err(NodeError::WrongType {
                id: id.clone(),
                expected: "deletable value",
            });
        }
        let session = inner.crypto.new_delete_session_id(inner.agent_id.as_str());
        let mut meta = serde_json::Map::new();
        meta.insert(DELETED_META_KEY.to_string(), Value::String(id.to_string()));
        let meta = Value::Object(meta);
        let msg = inner.make_local_transaction(id, &session, &[], Privacy::Trusting, Some(&meta))?;
        // Storage has to know the delete is valid before it sees the session.
        inner.check_deletion(id);
        inner.sync_local_transaction(id, msg);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Load `id` from storage or peers, retrying with backoff.
    pub async fn load(&self, id: &CoId) -> Result<()> {
        self.inner.ensure_open()?;
        let status = self
            .inner
            .load_covalue(id, LoadMode::HighPriority)
            .instrument(self.inner.span.clone())
            .await;
        match status {
            LoadingStatus::Available => Ok(()),
            _ => Err(NodeError::Unavailable(id.clone())),
        }
    }

    pub fn status(&self, id: &CoId) -> LoadingStatus {
        self.inner
            .get_entry(id)
            .map_or(LoadingStatus::Unknown, |entry| entry.status())
    }

    pub fn known_state(&self, id: &CoId) -> Option<KnownState> {
        self.inner.known_state(id)
    }

    pub fn is_deleted(&self, id: &CoId) -> bool {
        self.inner
            .get_entry(id)
            .and_then(|entry| entry.with_core(CoValueCore::is_deleted))
            .unwrap_or(false)
    }

    /// Current content of the map `id`.
    pub fn map(&self, id: &CoId) -> Result<MapView> {
        let header = self.inner.require_header(id)?;
        if header.co_type != CoValueType::Comap || header.is_group() {
            return Err(NodeError::WrongType {
                id: id.clone(),
                expected: "map",
            });
        }
        let (records, valid) = self
            .inner
            .evaluate(id)
            .ok_or_else(|| NodeError::Unavailable(id.clone()))?;
        Ok(MapView::materialize(id, &records, &valid))
    }

    /// Current content of the list `id`.
    pub fn list(&self, id: &CoId) -> Result<ListView> {
        let header = self.inner.require_header(id)?;
        if header.co_type != CoValueType::Colist {
            return Err(NodeError::WrongType {
                id: id.clone(),
                expected: "list",
            });
        }
        let (records, valid) = self
            .inner
            .evaluate(id)
            .ok_or_else(|| NodeError::Unavailable(id.clone()))?;
        Ok(ListView::materialize(id, &records, &valid))
    }

    /// Current state of the group `id`.
    pub fn group(&self, id: &CoId) -> Result<GroupView> {
        self.inner.require_group(id).map(GroupView::new)
    }

    /// Wait until `predicate` holds for the value's content.
    pub async fn wait_for(&self, id: &CoId, predicate: impl Fn(&CoValueCore) -> bool) {
        self.inner.entry(id).wait_for(predicate).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Connect a peer. Server peers get every local value reconciled and
    /// the changes they missed pushed.
    pub fn add_peer(&self, id: PeerId, role: PeerRole, transport: Arc<dyn Transport>) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let peer = Arc::new(PeerState::new(
            id.clone(),
            role,
            transport,
            inner.config.load_queue.clone(),
            Some(inner.timer_tx.clone()),
        ));
        if let Some(previous) = inner.peers.write().insert(id.clone(), peer.clone()) {
            previous.close();
        }

        let reader = tokio::spawn(
            run_peer_reader(Arc::downgrade(inner), peer.clone()).instrument(inner.span.clone()),
        );
        {
            let mut tasks = inner.tasks.lock();
            // Readers of peers that went away
            tasks.retain(|task| !task.is_finished());
            tasks.push(reader);
        }

        let _enter = inner.span.enter();
        info!(peer = %id, ?role, "Peer connected");
        if peer.is_server() {
            inner.start_reconciliation(&peer);
        }
        Ok(())
    }

    pub fn remove_peer(&self, id: &PeerId) {
        let _enter = self.inner.span.enter();
        self.inner.disconnect(id, None);
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.peers.read().keys().cloned().collect()
    }

    /// Wait until local storage and every connected server peer hold
    /// everything this node has of `id`.
    pub async fn wait_for_sync(&self, id: &CoId) -> Result<()> {
        let inner = self.inner.clone();
        let timeout = inner.config.sync_timeout;
        let id = id.clone();
        let wait = async {
            inner.flush_storage().await;
            if let (Some(storage), Some(known)) = (&inner.storage, inner.known_state(&id)) {
                storage.wait_for_sync(&id, &known).await?;
            }
            if inner.config.sync_when == crate::config::SyncWhen::Always {
                inner.wait_for_servers(&id).await;
            }
            Ok::<_, NodeError>(())
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| NodeError::Timeout(format!("sync of {id}")))?
    }

    /// Values with changes some server peer has not acknowledged.
    pub fn unsynced_ids(&self) -> Vec<CoId> {
        self.inner.unsynced.lock().ids()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop `id` from memory. Pending changes stay tracked in storage.
    pub fn unmount(&self, id: &CoId) {
        let inner = &self.inner;
        let Some(entry) = inner.get_entry(id) else {
            return;
        };
        if entry.status() == LoadingStatus::Loading {
            return;
        }
        inner.entries.lock().remove(id);
        for peer in inner.peers_snapshot() {
            peer.forget(id);
        }
        if let Some(storage) = &inner.storage {
            storage.on_covalue_unmounted(id);
        }
    }

    /// Erase the history of deleted values from storage, keeping their
    /// tombstones.
    pub async fn erase_deleted_covalues(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(storage) = inner.storage.clone() else {
            return Ok(());
        };
        let deleted: Vec<CoId> = inner
            .entries_snapshot()
            .into_iter()
            .filter(|entry| entry.with_core(CoValueCore::is_deleted).unwrap_or(false))
            .map(|entry| entry.id().clone())
            .collect();
        for id in deleted {
            inner.unsynced.lock().remove_all(&id);
            inner.send_storage_job(StorageJob::StopTracking(id));
        }
        inner.flush_sync_state();
        inner.flush_storage().await;
        storage.erase_all_deleted_covalues().await?;
        Ok(())
    }

    /// Disconnect every peer, flush and close storage.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let peers: Vec<Arc<PeerState>> =
            std::mem::take(&mut *inner.peers.write()).into_values().collect();
        for peer in peers {
            peer.close();
        }
        inner.flush_storage().await;
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(storage) = &inner.storage {
            storage.close().await?;
        }
        inner.span.in_scope(|| info!("Node shut down"));
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

impl NodeInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::Closed);
        }
        Ok(())
    }

    /// The entry for `id`, created in the unknown state if needed.
    pub(crate) fn entry(&self, id: &CoId) -> Arc<CoValueEntry> {
        self.entries
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(CoValueEntry::new(id.clone())))
            .clone()
    }

    pub(crate) fn get_entry(&self, id: &CoId) -> Option<Arc<CoValueEntry>> {
        self.entries.lock().get(id).cloned()
    }

    pub(crate) fn entries_snapshot(&self) -> Vec<Arc<CoValueEntry>> {
        self.entries.lock().values().cloned().collect()
    }

    pub(crate) fn is_available(&self, id: &CoId) -> bool {
        self.get_entry(id).is_some_and(|entry| entry.is_available())
    }

    pub(crate) fn known_state(&self, id: &CoId) -> Option<KnownState> {
        self.get_entry(id)?.with_core(CoValueCore::known_state)
    }

    pub(crate) fn peer(&self, id: &PeerId) -> Option<Arc<PeerState>> {
        self.peers.read().get(id).cloned()
    }

    pub(crate) fn peers_snapshot(&self) -> Vec<Arc<PeerState>> {
        self.peers.read().values().cloned().collect()
    }

    fn require_header(&self, id: &CoId) -> Result<CoValueHeader> {
        self.get_entry(id)
            .and_then(|entry| entry.with_core(|core| core.header().clone()))
            .ok_or_else(|| NodeError::Unavailable(id.clone()))
    }

    fn require_group(&self, id: &CoId) -> Result<GroupState> {
        let header = self.require_header(id)?;
        if !header.is_group() {
            return Err(NodeError::WrongType {
                id: id.clone(),
                expected: "group",
            });
        }
        self.group_state(id)
            .ok_or_else(|| NodeError::Unavailable(id.clone()))
    }

    /// Strictly increasing timestamps for local transactions.
    fn next_made_at(&self) -> u64 {
        let mut last = self.last_made_at.lock();
        *last = now_millis().max(*last + 1);
        *last
    }

    /// Append a local transaction to `session` of `id` and sync it.
    pub(crate) fn write(
        &self,
        id: &CoId,
        session: &SessionId,
        changes: &[Value],
        privacy: Privacy,
        meta: Option<&Value>,
    ) -> Result<()> {
        let msg = self.make_local_transaction(id, session, changes, privacy, meta)?;
        self.sync_local_transaction(id, msg);
        Ok(())
    }

    /// Append a signed transaction to the in-memory value without telling
    /// storage or peers yet.
    pub(crate) fn make_local_transaction(
        &self,
        id: &CoId,
        session: &SessionId,
        changes: &[Value],
        privacy: Privacy,
        meta: Option<&Value>,
    ) -> Result<NewContentMessage> {
        self.ensure_open()?;
        let entry = self
            .get_entry(id)
            .ok_or_else(|| NodeError::Unavailable(id.clone()))?;
        let made_at = self.next_made_at();
        entry
            .with_core_mut(|core| -> Result<NewContentMessage> {
                let signed =
                    core.make_transaction(session, &self.agent.signer, changes, &privacy, meta, made_at)?;
                Ok(core.content_for_transaction(session, &signed))
            })
            .ok_or_else(|| NodeError::Unavailable(id.clone()))?
    }

    fn privacy_for(&self, id: &CoId, header: &CoValueHeader) -> Result<Privacy> {
        let Some(group) = header.owner_group() else {
            return Ok(Privacy::Trusting);
        };
        let state = self
            .group_state(group)
            .ok_or_else(|| NodeError::Unavailable(group.clone()))?;
        if !state.role_of(&self.agent_id).is_some_and(Role::can_write) {
            return Err(NodeError::NotAuthorized(format!("cannot write to {id}")));
        }
        let (key_id, key_secret) =
            current_read_key(self.crypto.as_ref(), &state, &self.agent_id, &self.agent)?;
        self.read_keys.lock().insert(key_id.clone(), key_secret.clone());
        Ok(Privacy::Private { key_id, key_secret })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Permissions
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn group_state(&self, id: &CoId) -> Option<GroupState> {
        NodeGroups::new(self).group_state(id)
    }

    fn replay_group(&self, id: &CoId, lookup: &dyn GroupLookup) -> Option<GroupState> {
        let (header, records) = self
            .get_entry(id)?
            .with_core(|core| (core.header().clone(), core.tx_records(&|_| None)))?;
        let Ruleset::Group { initial_admin } = &header.ruleset else {
            return None;
        };
        Some(GroupState::replay(id.clone(), initial_admin, &records, lookup))
    }

    /// The secret of `key_id`, if the owning group revealed it to us.
    pub(crate) fn read_key(&self, group: Option<&CoId>, key_id: &KeyId) -> Option<KeySecret> {
        if let Some(secret) = self.read_keys.lock().get(key_id) {
            return Some(secret.clone());
        }
        let state = self.group_state(group?)?;
        match read_key_secret(self.crypto.as_ref(), &state, key_id, &self.agent_id, &self.agent) {
            Ok(Some(secret)) => {
                self.read_keys.lock().insert(key_id.clone(), secret.clone());
                Some(secret)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(group = ?group, key = %key_id, error = %e, "Failed to open read key");
                None
            }
        }
    }

    /// Decrypted transactions of `id` and the ones its ruleset accepts.
    pub(crate) fn evaluate(&self, id: &CoId) -> Option<(Vec<TxRecord>, BTreeSet<TransactionId>)> {
        let entry = self.get_entry(id)?;
        let (header, keys) = entry.with_core(|core| (core.header().clone(), core.keys_used()))?;
        let secrets: HashMap<KeyId, KeySecret> = keys
            .into_iter()
            .filter_map(|key| {
                let secret = self.read_key(header.owner_group(), &key)?;
                Some((key, secret))
            })
            .collect();
        let records = entry.with_core(|core| core.tx_records(&|key| secrets.get(key).cloned()))?;
        let valid = determine_valid_transactions(id, &header, &records, &NodeGroups::new(self));
        Some((records, valid))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Storage
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn send_storage_job(&self, job: StorageJob) {
        if self.storage.is_some() && self.storage_tx.send(job).is_err() {
            warn!("Storage writer is gone");
        }
    }

    pub(crate) fn store(&self, msg: NewContentMessage) {
        self.send_storage_job(StorageJob::Store(msg));
    }

    pub(crate) fn flush_sync_state(&self) {
        let pending = self.unsynced.lock().take_pending();
        if !pending.is_empty() {
            self.send_storage_job(StorageJob::TrackSyncState(pending));
        }
    }

    /// Wait for every storage job queued so far.
    pub(crate) async fn flush_storage(&self) {
        if self.storage.is_none() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.storage_tx.send(StorageJob::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) async fn replace_session_history(&self, replacement: SessionReplacement) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.storage_tx
            .send(StorageJob::ReplaceSession(replacement, tx))
            .map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)??;
        Ok(())
    }

    async fn wait_for_servers(&self, id: &CoId) {
        loop {
            let notified = self.acks.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_synced_with_servers(id) {
                return;
            }
            notified.await;
        }
    }

    fn is_synced_with_servers(&self, id: &CoId) -> bool {
        let Some(ours) = self.known_state(id) else {
            return true;
        };
        self.peers_snapshot()
            .iter()
            .filter(|peer| peer.is_server() && !peer.is_closed())
            .all(|peer| {
                peer.known_state(id)
                    .is_some_and(|theirs| ours.is_subset_of(&theirs))
            })
    }
}

/// Group resolution for permission evaluation, guarding against cycles in
/// the parent chain.
struct NodeGroups<'a> {
    node: &'a NodeInner,
    visiting: RefCell<BTreeSet<CoId>>,
}

impl<'a> NodeGroups<'a> {
    fn new(node: &'a NodeInner) -> Self {
        Self {
            node,
            visiting: RefCell::new(BTreeSet::new()),
        }
    }
}

impl GroupLookup for NodeGroups<'_> {
    fn group_state(&self, id: &CoId) -> Option<GroupState> {
        if !self.visiting.borrow_mut().insert(id.clone()) {
            debug!(group = %id, "Cycle in group parents");
            return None;
        }
        let state = self.node.replay_group(id, self);
        self.visiting.borrow_mut().remove(id);
        state
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn run_storage_writer(
    storage: Arc<dyn StorageApi>,
    node: Weak<NodeInner>,
    mut jobs: mpsc::UnboundedReceiver<StorageJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            StorageJob::Store(msg) => {
                let id = msg.id.clone();
                let weak = node.clone();
                let on_correction = move |known: &KnownState| -> Option<Vec<NewContentMessage>> {
                    let node = weak.upgrade()?;
                    let entry = node.get_entry(&known.id)?;
                    entry
                        .with_core(|core| core.new_content_since(Some(known)))
                        .flatten()
                };
                match storage.store(msg, &on_correction).await {
                    Ok(true) => {}
                    Ok(false) => warn!(id = %id, "Storage could not reconcile content"),
                    Err(e) => warn!(id = %id, error = %e, "Failed to store content"),
                }
            }
            StorageJob::ReplaceSession(replacement, reply) => {
                let _ = reply.send(storage.replace_session_history(replacement).await);
            }
            StorageJob::TrackSyncState(updates) => {
                if let Err(e) = storage.track_covalues_sync_state(updates).await {
                    warn!(error = %e, "Failed to track sync state");
                }
            }
            StorageJob::StopTracking(id) => {
                if let Err(e) = storage.stop_tracking_sync_state(&id).await {
                    warn!(id = %id, error = %e, "Failed to stop tracking sync state");
                }
            }
            StorageJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn run_streaming_watcher(storage: Arc<dyn StorageApi>, node: Weak<NodeInner>) {
    loop {
        storage.streaming_queue().notified().await;
        let Some(node) = node.upgrade() else {
            break;
        };
        node.request_drain();
    }
}

async fn run_load_timer(node: Weak<NodeInner>, mut fired: mpsc::UnboundedReceiver<PeerId>) {
    while let Some(peer) = fired.recv().await {
        let Some(node) = node.upgrade() else {
            break;
        };
        node.handle_load_timeout(&peer);
    }
}

async fn run_peer_reader(node: Weak<NodeInner>, peer: Arc<PeerState>) {
    loop {
        let msg = match peer.transport().recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %peer.id(), error = %e, "Dropping undecodable message");
                continue;
            }
        };
        let Some(node) = node.upgrade() else {
            return;
        };
        node.incoming.lock().push(peer.id().clone(), msg);
        node.request_drain();
    }
    if let Some(node) = node.upgrade() {
        node.disconnect(peer.id(), Some(&peer));
    }
}
