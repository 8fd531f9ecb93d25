//! Per-peer scheduler for outgoing `load` requests.
//!
//! At most [`LoadQueueConfig::max_in_flight`] loads are outstanding towards a
//! peer. The rest wait in one of two FIFO lists: the high-priority list is
//! always drained first, the low-priority one only when it is empty.
//! Immediate loads skip both lists and the cap.
//!
//! The queue never sends anything itself. Every mutating call returns the IDs
//! whose `load` message must go out now, and the caller sends them. Timeouts
//! are checked by a single timer task per queue, which notifies the owner by
//! sending the peer ID on the timer channel; the owner then calls
//! [`OutgoingLoadQueue::check_timeouts`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use covalue_core::{CoId, PeerId};

use crate::linked_list::{LinkedList, NodeHandle};

/// Load queue tuning.
#[derive(Debug, Clone)]
pub struct LoadQueueConfig {
    /// Maximum outstanding loads per peer.
    pub max_in_flight: usize,
    /// How long a load may stay unanswered.
    pub timeout: Duration,
}

impl Default for LoadQueueConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            timeout: Duration::from_secs(30),
        }
    }
}

/// How a load request is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// FIFO, ahead of every low-priority request.
    #[default]
    HighPriority,
    /// Served only when no high-priority request waits.
    LowPriority,
    /// Sent right away, ignoring the cap.
    Immediate,
}

/// What the owner knows about a value whose load timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Nothing usable arrived.
    Unavailable,
    /// Content is arriving in chunks but the last chunk is late.
    Streaming,
    /// The value is available and complete.
    Available,
}

/// Outcome of a timeout check.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TimeoutReport {
    /// Loads that expired without content; mark them not found in the peer.
    pub not_found: Vec<CoId>,
    /// Loads that expired mid-stream; they stay in flight.
    pub slow: Vec<CoId>,
    /// Loads to send now that slots were freed.
    pub to_send: Vec<CoId>,
}

/// Outgoing load scheduler for one peer.
#[derive(Debug)]
pub struct OutgoingLoadQueue {
    peer_id: PeerId,
    config: LoadQueueConfig,

    in_flight: HashMap<CoId, Instant>,
    high: LinkedList<CoId>,
    low: LinkedList<CoId>,
    /// Low-priority entries by ID, for O(1) upgrades.
    low_nodes: HashMap<CoId, NodeHandle>,
    /// Every ID that is queued or in flight.
    requested: HashSet<CoId>,

    timer_tx: Option<mpsc::UnboundedSender<PeerId>>,
    timer: Option<JoinHandle<()>>,
}

impl OutgoingLoadQueue {
    /// Create a queue. Without `timer_tx` no timeouts are scheduled.
    pub fn new(
        peer_id: PeerId,
        config: LoadQueueConfig,
        timer_tx: Option<mpsc::UnboundedSender<PeerId>>,
    ) -> Self {
        Self {
            peer_id,
            config,
            in_flight: HashMap::new(),
            high: LinkedList::new(),
            low: LinkedList::new(),
            low_nodes: HashMap::new(),
            requested: HashSet::new(),
            timer_tx,
            timer: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Request a load of `id`, returning the IDs to send now.
    ///
    /// A value that is already queued or in flight is not queued twice; a
    /// higher-priority request for a low-priority entry upgrades it.
    pub fn enqueue(&mut self, id: CoId, mode: LoadMode) -> Vec<CoId> {
        if self.in_flight.contains_key(&id) || self.requested.contains(&id) {
            if mode == LoadMode::LowPriority {
                return Vec::new();
            }
            let Some(handle) = self.low_nodes.remove(&id) else {
                return Vec::new();
            };
            let Some(id) = self.low.remove(handle) else {
                return Vec::new();
            };

            debug!(id = %id, peer = %self.peer_id, ?mode, "Upgrading low-priority load");
            if mode == LoadMode::Immediate {
                self.track_sent(id.clone());
                return vec![id];
            }
            self.high.push(id);
            return self.process();
        }

        self.requested.insert(id.clone());
        match mode {
            LoadMode::Immediate => {
                self.track_sent(id.clone());
                vec![id]
            }
            LoadMode::LowPriority => {
                let handle = self.low.push(id.clone());
                self.low_nodes.insert(id, handle);
                self.process()
            }
            LoadMode::HighPriority => {
                self.high.push(id);
                self.process()
            }
        }
    }

    /// Content for `id` arrived; restart its timeout.
    pub fn track_update(&mut self, id: &CoId) {
        if let Some(sent_at) = self.in_flight.get_mut(id) {
            *sent_at = Instant::now();
        }
    }

    /// The load of `id` was answered. While the value is still streaming the
    /// slot stays taken until the last chunk arrives.
    pub fn track_complete(&mut self, id: &CoId, is_streaming: bool) -> Vec<CoId> {
        if !self.in_flight.contains_key(id) || is_streaming {
            return Vec::new();
        }
        self.in_flight.remove(id);
        self.requested.remove(id);
        self.process()
    }

    /// Expire loads older than the timeout, rescheduling the timer for the
    /// next deadline.
    pub fn check_timeouts(&mut self, status: impl Fn(&CoId) -> LoadStatus) -> TimeoutReport {
        self.timer = None;

        let now = Instant::now();
        let mut report = TimeoutReport::default();
        let mut next_deadline: Option<Instant> = None;

        let expired: Vec<CoId> = self
            .in_flight
            .iter()
            .filter_map(|(id, sent_at)| {
                let deadline = *sent_at + self.config.timeout;
                if now >= deadline {
                    Some(id.clone())
                } else {
                    next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                    None
                }
            })
            .collect();

        for id in expired {
            match status(&id) {
                LoadStatus::Unavailable => {
                    warn!(id = %id, peer = %self.peer_id, "Load request timed out");
                    self.in_flight.remove(&id);
                    self.requested.remove(&id);
                    report.not_found.push(id);
                }
                LoadStatus::Streaming => {
                    warn!(
                        id = %id,
                        peer = %self.peer_id,
                        timeout_secs = self.config.timeout.as_secs(),
                        "Content streaming is taking longer than the load timeout"
                    );
                    self.in_flight.insert(id.clone(), now);
                    let deadline = now + self.config.timeout;
                    next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                    report.slow.push(id);
                }
                LoadStatus::Available => {
                    self.in_flight.remove(&id);
                    self.requested.remove(&id);
                }
            }
        }

        if let Some(deadline) = next_deadline {
            self.schedule_timeout_check(deadline.saturating_duration_since(now));
        }
        report.to_send = self.process();
        report
    }

    /// Drop every queued and in-flight load. Called when the peer goes away.
    pub fn clear(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.in_flight.clear();
        self.requested.clear();
        self.high.clear();
        self.low.clear();
        self.low_nodes.clear();
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: &CoId) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.high.len() + self.low.len()
    }

    pub fn high_priority_pending_count(&self) -> usize {
        self.high.len()
    }

    pub fn low_priority_pending_count(&self) -> usize {
        self.low.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal
    // ─────────────────────────────────────────────────────────────────────────

    fn can_send(&self) -> bool {
        self.in_flight.len() < self.config.max_in_flight
    }

    fn process(&mut self) -> Vec<CoId> {
        let mut to_send = Vec::new();
        while self.can_send() {
            let next = match self.high.shift() {
                Some(id) => id,
                None => match self.low.shift() {
                    Some(id) => {
                        self.low_nodes.remove(&id);
                        id
                    }
                    None => break,
                },
            };
            self.track_sent(next.clone());
            to_send.push(next);
        }
        to_send
    }

    fn track_sent(&mut self, id: CoId) {
        self.in_flight.insert(id, Instant::now());
        self.schedule_timeout_check(self.config.timeout);
    }

    fn schedule_timeout_check(&mut self, delay: Duration) {
        if self.timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let Some(tx) = self.timer_tx.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let peer_id = self.peer_id.clone();
        self.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(peer_id);
        }));
    }
}

impl Drop for OutgoingLoadQueue {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn co(n: u32) -> CoId {
        CoId::parse(format!("co_z{n:04}")).unwrap()
    }

    fn queue(max_in_flight: usize) -> OutgoingLoadQueue {
        let config = LoadQueueConfig {
            max_in_flight,
            ..LoadQueueConfig::default()
        };
        OutgoingLoadQueue::new(PeerId::from("server"), config, None)
    }

    #[test]
    fn test_sends_up_to_cap_then_queues() {
        let mut q = queue(2);
        assert_eq!(q.enqueue(co(1), LoadMode::HighPriority), vec![co(1)]);
        assert_eq!(q.enqueue(co(2), LoadMode::HighPriority), vec![co(2)]);
        assert!(q.enqueue(co(3), LoadMode::HighPriority).is_empty());
        assert_eq!(q.in_flight_count(), 2);
        assert_eq!(q.pending_count(), 1);

        assert_eq!(q.track_complete(&co(1), false), vec![co(3)]);
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_enqueue_is_noop() {
        let mut q = queue(1);
        q.enqueue(co(1), LoadMode::HighPriority);
        assert!(q.enqueue(co(1), LoadMode::HighPriority).is_empty());
        q.enqueue(co(2), LoadMode::HighPriority);
        assert!(q.enqueue(co(2), LoadMode::LowPriority).is_empty());
        assert_eq!(q.pending_count(), 1);
    }

    #[test]
    fn test_high_priority_drains_before_low() {
        let mut q = queue(1);
        q.enqueue(co(1), LoadMode::HighPriority);
        q.enqueue(co(2), LoadMode::LowPriority);
        q.enqueue(co(3), LoadMode::HighPriority);
        assert_eq!(q.high_priority_pending_count(), 1);
        assert_eq!(q.low_priority_pending_count(), 1);

        assert_eq!(q.track_complete(&co(1), false), vec![co(3)]);
        assert_eq!(q.track_complete(&co(3), false), vec![co(2)]);
    }

    #[test]
    fn test_upgrade_moves_low_to_high() {
        let mut q = queue(1);
        q.enqueue(co(1), LoadMode::HighPriority);
        q.enqueue(co(2), LoadMode::LowPriority);
        q.enqueue(co(3), LoadMode::LowPriority);
        q.enqueue(co(4), LoadMode::HighPriority);

        // Upgraded entries join the back of the high-priority list
        assert!(q.enqueue(co(3), LoadMode::HighPriority).is_empty());
        assert_eq!(q.low_priority_pending_count(), 1);
        assert_eq!(q.high_priority_pending_count(), 2);

        assert_eq!(q.track_complete(&co(1), false), vec![co(4)]);
        assert_eq!(q.track_complete(&co(4), false), vec![co(3)]);
        assert_eq!(q.track_complete(&co(3), false), vec![co(2)]);
    }

    #[test]
    fn test_immediate_bypasses_cap_and_upgrades() {
        let mut q = queue(1);
        q.enqueue(co(1), LoadMode::HighPriority);
        q.enqueue(co(2), LoadMode::LowPriority);

        assert_eq!(q.enqueue(co(3), LoadMode::Immediate), vec![co(3)]);
        assert_eq!(q.enqueue(co(2), LoadMode::Immediate), vec![co(2)]);
        assert_eq!(q.in_flight_count(), 3);
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn test_streaming_keeps_slot() {
        let mut q = queue(1);
        q.enqueue(co(1), LoadMode::HighPriority);
        q.enqueue(co(2), LoadMode::HighPriority);

        assert!(q.track_complete(&co(1), true).is_empty());
        assert!(q.is_in_flight(&co(1)));
        assert_eq!(q.track_complete(&co(1), false), vec![co(2)]);
    }

    #[test]
    fn test_complete_unknown_is_ignored() {
        let mut q = queue(1);
        assert!(q.track_complete(&co(9), false).is_empty());
        q.track_update(&co(9));
        assert_eq!(q.in_flight_count(), 0);
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut q = queue(1);
        q.enqueue(co(1), LoadMode::HighPriority);
        q.enqueue(co(2), LoadMode::LowPriority);
        q.clear();
        assert_eq!(q.in_flight_count(), 0);
        assert_eq!(q.pending_count(), 0);

        // Requests are accepted again after a reconnect
        assert_eq!(q.enqueue(co(2), LoadMode::HighPriority), vec![co(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_reports_expired_loads() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut q = OutgoingLoadQueue::new(
            PeerId::from("server"),
            LoadQueueConfig {
                max_in_flight: 2,
                timeout: Duration::from_secs(30),
            },
            Some(tx),
        );

        q.enqueue(co(1), LoadMode::HighPriority);
        tokio::time::sleep(Duration::from_secs(10)).await;
        q.enqueue(co(2), LoadMode::HighPriority);
        q.enqueue(co(3), LoadMode::HighPriority);

        // First deadline: only co(1) has expired
        assert_eq!(rx.recv().await, Some(PeerId::from("server")));
        let report = q.check_timeouts(|_| LoadStatus::Unavailable);
        assert_eq!(report.not_found, vec![co(1)]);
        assert_eq!(report.to_send, vec![co(3)]);

        // The timer was rescheduled for co(2), 10s later
        let fired_at = Instant::now();
        assert_eq!(rx.recv().await, Some(PeerId::from("server")));
        assert_eq!(Instant::now() - fired_at, Duration::from_secs(10));
        let report = q.check_timeouts(|_| LoadStatus::Unavailable);
        assert_eq!(report.not_found, vec![co(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_timeout_keeps_waiting() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut q = OutgoingLoadQueue::new(PeerId::from("server"), LoadQueueConfig::default(), Some(tx));
        q.enqueue(co(1), LoadMode::HighPriority);

        rx.recv().await;
        let report = q.check_timeouts(|_| LoadStatus::Streaming);
        assert_eq!(report.slow, vec![co(1)]);
        assert!(report.not_found.is_empty());
        assert!(q.is_in_flight(&co(1)));

        rx.recv().await;
        let report = q.check_timeouts(|_| LoadStatus::Available);
        assert!(report.not_found.is_empty());
        assert_eq!(q.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_postpones_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut q = OutgoingLoadQueue::new(PeerId::from("server"), LoadQueueConfig::default(), Some(tx));
        q.enqueue(co(1), LoadMode::HighPriority);

        tokio::time::sleep(Duration::from_secs(20)).await;
        q.track_update(&co(1));

        rx.recv().await;
        let report = q.check_timeouts(|_| LoadStatus::Unavailable);
        assert!(report.not_found.is_empty());

        rx.recv().await;
        let report = q.check_timeouts(|_| LoadStatus::Unavailable);
        assert_eq!(report.not_found, vec![co(1)]);
    }
}
