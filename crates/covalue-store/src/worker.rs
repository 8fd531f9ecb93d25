//! Storage running behind a worker boundary.
//!
//! [`WorkerStorage`] owns any [`StorageApi`] on its own task and talks to it
//! only through CBOR-encoded frames. Each request carries an ID; a dispatcher
//! task matches response frames to the waiting callers. When the worker task
//! ends for any reason other than [`StorageApi::close`], every pending and
//! future request fails with [`StoreError::WorkerCrashed`].
//!
//! Corrections are resolved on the caller's side: the worker only stores
//! single messages, so the correction callback never crosses the boundary.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use covalue_core::{CoId, KnownState, NewContentMessage};

use crate::error::{Result, StoreError};
use crate::known_state::StorageKnownState;
use crate::streaming::StorageStreamingQueue;
use crate::traits::{LoadOutcome, SessionReplacement, StorageApi, StoreOutcome, SyncStateUpdate};

// ─────────────────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    id: u64,
    body: T,
}

#[derive(Debug, Serialize, Deserialize)]
enum Request {
    LoadKnownState(CoId),
    Load(CoId),
    StoreSingle(NewContentMessage),
    ReplaceSessionHistory(SessionReplacement),
    MarkDeleteAsValid(CoId),
    EnableErasure,
    EraseAll,
    TrackSyncState(Vec<SyncStateUpdate>),
    GetUnsynced,
    StopTracking(CoId),
    Unmounted(CoId),
    Close,
}

#[derive(Debug, Serialize, Deserialize)]
enum Response {
    Done,
    KnownState(Option<KnownState>),
    Loaded {
        found: bool,
        content: Vec<NewContentMessage>,
        streamed: Vec<NewContentMessage>,
        known: Vec<KnownState>,
    },
    Stored(StoreOutcome),
    Unsynced(Vec<CoId>),
    Failed(String),
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Bytes::from(buf))
}

fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    ciborium::from_reader(frame).map_err(|e| StoreError::Serialization(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Pending {
    waiting: HashMap<u64, oneshot::Sender<Result<Response>>>,
    /// Set once the worker is gone; no new request may register after that.
    ended: Option<Ended>,
}

#[derive(Debug, Clone, Copy)]
enum Ended {
    Closed,
    Crashed,
}

impl Ended {
    fn error(self) -> StoreError {
        match self {
            Ended::Closed => StoreError::Closed,
            Ended::Crashed => StoreError::WorkerCrashed,
        }
    }
}

struct Shared {
    pending: Mutex<Pending>,
    closing: AtomicBool,
}

/// [`StorageApi`] proxy for a storage owned by a worker task.
pub struct WorkerStorage {
    requests: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    known: StorageKnownState,
    streaming: StorageStreamingQueue,
    worker: Mutex<Option<JoinHandle<()>>>,
    dispatcher: JoinHandle<()>,
}

impl WorkerStorage {
    /// Move `storage` onto a worker task. Requires a tokio runtime.
    pub fn spawn<S: StorageApi + 'static>(storage: S) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            closing: AtomicBool::new(false),
        });

        let worker = tokio::spawn(run_worker(storage, request_rx, response_tx));
        let dispatcher = tokio::spawn(dispatch(shared.clone(), response_rx));

        Self {
            requests: request_tx,
            shared,
            next_id: AtomicU64::new(1),
            known: StorageKnownState::new(),
            streaming: StorageStreamingQueue::new(),
            worker: Mutex::new(Some(worker)),
            dispatcher,
        }
    }

    /// Kill the worker task. Everything in flight is rejected.
    pub fn terminate(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }

    async fn request(&self, body: Request) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode(&Envelope { id, body })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if let Some(ended) = pending.ended {
                return Err(ended.error());
            }
            pending.waiting.insert(id, tx);
        }

        if self.requests.send(frame).is_err() {
            self.shared.pending.lock().waiting.remove(&id);
            return Err(StoreError::WorkerCrashed);
        }

        match rx.await {
            Ok(Ok(Response::Failed(reason))) => Err(StoreError::InvalidData(reason)),
            Ok(result) => result,
            Err(_) => Err(StoreError::WorkerCrashed),
        }
    }

    /// Send without waiting for the outcome.
    fn notify(&self, body: Request) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sent = encode(&Envelope { id, body }).and_then(|frame| {
            self.requests
                .send(frame)
                .map_err(|_| StoreError::WorkerCrashed)
        });
        if let Err(err) = sent {
            warn!(error = %err, "Storage worker notification dropped");
        }
    }
}

impl Drop for WorkerStorage {
    fn drop(&mut self) {
        self.terminate();
        self.dispatcher.abort();
    }
}

fn unexpected(response: Response) -> StoreError {
    StoreError::InvalidData(format!("unexpected worker response: {response:?}"))
}

async fn dispatch(shared: Arc<Shared>, mut responses: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = responses.recv().await {
        let envelope: Envelope<Response> = match decode(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = %err, "Undecodable storage worker frame");
                continue;
            }
        };
        let waiter = shared.pending.lock().waiting.remove(&envelope.id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(envelope.body));
            }
            None => debug!(request = envelope.id, "Storage worker reply without waiter"),
        }
    }

    let ended = if shared.closing.load(Ordering::SeqCst) {
        Ended::Closed
    } else {
        error!("Storage worker crashed, rejecting pending requests");
        Ended::Crashed
    };
    let waiting = {
        let mut pending = shared.pending.lock();
        pending.ended = Some(ended);
        std::mem::take(&mut pending.waiting)
    };
    for (_, waiter) in waiting {
        let _ = waiter.send(Err(ended.error()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

async fn run_worker<S: StorageApi>(
    storage: S,
    mut requests: mpsc::UnboundedReceiver<Bytes>,
    responses: mpsc::UnboundedSender<Bytes>,
) {
    while let Some(frame) = requests.recv().await {
        let Envelope { id, body } = match decode::<Envelope<Request>>(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = %err, "Undecodable storage request frame");
                continue;
            }
        };
        let close = matches!(body, Request::Close);

        let body = handle(&storage, body)
            .await
            .unwrap_or_else(|err| Response::Failed(err.to_string()));
        match encode(&Envelope { id, body }) {
            Ok(frame) => {
                if responses.send(frame).is_err() {
                    return;
                }
            }
            Err(err) => error!(request = id, error = %err, "Unencodable storage response"),
        }

        if close {
            return;
        }
    }
}

async fn handle<S: StorageApi>(storage: &S, request: Request) -> Result<Response> {
    Ok(match request {
        Request::LoadKnownState(id) => Response::KnownState(storage.load_known_state(&id).await?),
        Request::Load(id) => {
            let LoadOutcome { found, content } = storage.load(&id).await?;
            let streamed: Vec<_> = std::iter::from_fn(|| storage.streaming_queue().pull()).collect();
            let ids: BTreeSet<&CoId> = content.iter().chain(&streamed).map(|m| &m.id).collect();
            let known = ids.into_iter().map(|id| storage.get_known_state(id)).collect();
            Response::Loaded {
                found,
                content,
                streamed,
                known,
            }
        }
        Request::StoreSingle(msg) => Response::Stored(storage.store_single(msg).await?),
        Request::ReplaceSessionHistory(replacement) => {
            storage.replace_session_history(replacement).await?;
            Response::Done
        }
        Request::MarkDeleteAsValid(id) => {
            storage.mark_delete_as_valid(&id);
            Response::Done
        }
        Request::EnableErasure => {
            storage.enable_deleted_covalues_erasure();
            Response::Done
        }
        Request::EraseAll => {
            storage.erase_all_deleted_covalues().await?;
            Response::Done
        }
        Request::TrackSyncState(updates) => {
            storage.track_covalues_sync_state(updates).await?;
            Response::Done
        }
        Request::GetUnsynced => Response::Unsynced(storage.get_unsynced_covalue_ids().await?),
        Request::StopTracking(id) => {
            storage.stop_tracking_sync_state(&id).await?;
            Response::Done
        }
        Request::Unmounted(id) => {
            storage.on_covalue_unmounted(&id);
            Response::Done
        }
        Request::Close => {
            storage.close().await?;
            Response::Done
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// StorageApi
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl StorageApi for WorkerStorage {
    fn get_known_state(&self, id: &CoId) -> KnownState {
        self.known.get(id)
    }

    async fn load_known_state(&self, id: &CoId) -> Result<Option<KnownState>> {
        match self.request(Request::LoadKnownState(id.clone())).await? {
            Response::KnownState(known) => {
                if let Some(known) = &known {
                    self.known.handle_update(id, known);
                }
                Ok(known)
            }
            other => Err(unexpected(other)),
        }
    }

    async fn load(&self, id: &CoId) -> Result<LoadOutcome> {
        match self.request(Request::Load(id.clone())).await? {
            Response::Loaded {
                found,
                content,
                streamed,
                known,
            } => {
                for known in &known {
                    self.known.handle_update(&known.id, known);
                }
                if !streamed.is_empty() {
                    for msg in streamed {
                        let priority = msg.priority;
                        self.streaming.push(msg, priority);
                    }
                    self.streaming.emit();
                }
                Ok(LoadOutcome { found, content })
            }
            other => Err(unexpected(other)),
        }
    }

    async fn store_single(&self, msg: NewContentMessage) -> Result<StoreOutcome> {
        let id = msg.id.clone();
        match self.request(Request::StoreSingle(msg)).await? {
            Response::Stored(outcome) => {
                match &outcome {
                    StoreOutcome::Stored(known) => self.known.handle_update(&id, known),
                    StoreOutcome::NeedsCorrection(known) => self.known.set(&id, known.clone()),
                }
                Ok(outcome)
            }
            other => Err(unexpected(other)),
        }
    }

    async fn replace_session_history(&self, replacement: SessionReplacement) -> Result<()> {
        let id = replacement.id.clone();
        self.request(Request::ReplaceSessionHistory(replacement)).await?;
        if let Some(known) = self.load_known_state(&id).await? {
            self.known.set(&id, known);
        }
        Ok(())
    }

    fn mark_delete_as_valid(&self, id: &CoId) {
        self.notify(Request::MarkDeleteAsValid(id.clone()));
    }

    fn enable_deleted_covalues_erasure(&self) {
        self.notify(Request::EnableErasure);
    }

    async fn erase_all_deleted_covalues(&self) -> Result<()> {
        self.request(Request::EraseAll).await.map(|_| ())
    }

    async fn track_covalues_sync_state(&self, updates: Vec<SyncStateUpdate>) -> Result<()> {
        self.notify(Request::TrackSyncState(updates));
        Ok(())
    }

    async fn get_unsynced_covalue_ids(&self) -> Result<Vec<CoId>> {
        match self.request(Request::GetUnsynced).await? {
            Response::Unsynced(ids) => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    async fn stop_tracking_sync_state(&self, id: &CoId) -> Result<()> {
        self.request(Request::StopTracking(id.clone())).await.map(|_| ())
    }

    fn on_covalue_unmounted(&self, id: &CoId) {
        self.known.remove(id);
        self.notify(Request::Unmounted(id.clone()));
    }

    async fn wait_for_sync(&self, id: &CoId, target: &KnownState) -> Result<()> {
        self.known.wait_for_sync(id, target).await;
        Ok(())
    }

    fn streaming_queue(&self) -> &StorageStreamingQueue {
        &self.streaming
    }

    async fn close(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let result = self.request(Request::Close).await.map(|_| ());
        self.known.clear();
        result
    }
}
