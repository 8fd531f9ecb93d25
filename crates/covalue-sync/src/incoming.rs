//! Incoming messages, served round-robin across peers.
//!
//! One chatty peer cannot starve the others: each [`pull`] takes the oldest
//! message of the next peer in rotation.
//!
//! [`pull`]: IncomingMessagesQueue::pull

use std::collections::{HashMap, VecDeque};

use covalue_core::PeerId;

use crate::linked_list::LinkedList;

#[derive(Debug)]
pub struct IncomingMessagesQueue<M> {
    queues: HashMap<PeerId, LinkedList<M>>,
    /// Peers with at least one waiting message, in service order.
    rotation: VecDeque<PeerId>,
    len: usize,
}

impl<M> Default for IncomingMessagesQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> IncomingMessagesQueue<M> {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            rotation: VecDeque::new(),
            len: 0,
        }
    }

    pub fn push(&mut self, peer: PeerId, msg: M) {
        let queue = self.queues.entry(peer.clone()).or_default();
        if queue.is_empty() {
            self.rotation.push_back(peer);
        }
        queue.push(msg);
        self.len += 1;
    }

    pub fn pull(&mut self) -> Option<(PeerId, M)> {
        let peer = self.rotation.pop_front()?;
        let queue = self.queues.get_mut(&peer)?;
        let msg = queue.shift()?;
        if !queue.is_empty() {
            self.rotation.push_back(peer.clone());
        }
        self.len -= 1;
        Some((peer, msg))
    }

    /// Drop everything still waiting from `peer`.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        if let Some(queue) = self.queues.remove(peer) {
            self.len -= queue.len();
        }
        self.rotation.retain(|p| p != peer);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
