//! Queue of streamed storage content waiting to be pulled by the node.
//!
//! Chunks of large values beyond their first signature checkpoint are not
//! handed back from `load` directly. They wait here, ordered by priority and
//! FIFO within one priority, so that the node can interleave them with peer
//! messages.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use covalue_core::{NewContentMessage, Priority};

#[derive(Default)]
struct Tiers {
    high: VecDeque<NewContentMessage>,
    medium: VecDeque<NewContentMessage>,
    low: VecDeque<NewContentMessage>,
}

impl Tiers {
    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<NewContentMessage> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }
}

#[derive(Default)]
pub struct StorageStreamingQueue {
    tiers: Mutex<Tiers>,
    notify: Notify,
}

impl StorageStreamingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a chunk without waking anyone.
    pub fn push(&self, msg: NewContentMessage, priority: Priority) {
        self.tiers.lock().tier_mut(priority).push_back(msg);
    }

    /// Wake the consumer.
    pub fn emit(&self) {
        self.notify.notify_one();
    }

    /// Wait until [`StorageStreamingQueue::emit`] is called.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// The most urgent chunk, if any.
    pub fn pull(&self) -> Option<NewContentMessage> {
        self.pull_up_to(Priority::Low)
    }

    /// The most urgent chunk whose priority is at least `lowest`.
    pub fn pull_up_to(&self, lowest: Priority) -> Option<NewContentMessage> {
        let mut tiers = self.tiers.lock();
        [Priority::High, Priority::Medium, Priority::Low]
            .into_iter()
            .filter(|p| *p <= lowest)
            .find_map(|p| tiers.tier_mut(p).pop_front())
    }

    pub fn is_empty(&self) -> bool {
        let tiers = self.tiers.lock();
        tiers.high.is_empty() && tiers.medium.is_empty() && tiers.low.is_empty()
    }

    pub fn clear(&self) {
        *self.tiers.lock() = Tiers::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::{CoId, CoValueHeader, CoValueType, Uniqueness};

    fn chunk(name: &str) -> NewContentMessage {
        let header = CoValueHeader::unsafe_allow_all(CoValueType::Colist, Uniqueness::Null);
        NewContentMessage::create(CoId::parse(format!("co_z{name}")).unwrap(), &header, false)
    }

    #[test]
    fn test_starts_empty() {
        let queue = StorageStreamingQueue::new();
        assert!(queue.is_empty());
        assert!(queue.pull().is_none());
    }

    #[test]
    fn test_medium_before_low() {
        let queue = StorageStreamingQueue::new();
        queue.push(chunk("low1"), Priority::Low);
        queue.push(chunk("med1"), Priority::Medium);
        queue.push(chunk("low2"), Priority::Low);
        queue.push(chunk("med2"), Priority::Medium);

        let order: Vec<String> = std::iter::from_fn(|| queue.pull())
            .map(|m| m.id.payload().to_string())
            .collect();
        assert_eq!(order, vec!["med1", "med2", "low1", "low2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pull_up_to_leaves_lower_tiers() {
        let queue = StorageStreamingQueue::new();
        queue.push(chunk("low"), Priority::Low);
        queue.push(chunk("med"), Priority::Medium);

        assert_eq!(queue.pull_up_to(Priority::Medium).unwrap().id.payload(), "med");
        assert!(queue.pull_up_to(Priority::Medium).is_none());
        assert!(!queue.is_empty());
        assert_eq!(queue.pull().unwrap().id.payload(), "low");
    }

    #[tokio::test]
    async fn test_emit_wakes_consumer() {
        let queue = std::sync::Arc::new(StorageStreamingQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.notified().await })
        };
        queue.push(chunk("a"), Priority::Medium);
        queue.emit();
        waiter.await.unwrap();
    }
}
