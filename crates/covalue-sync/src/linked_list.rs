//! Doubly linked list with O(1) push, shift and removal by handle.
//!
//! Nodes live in a slab and link to each other by index. [`push`] returns a
//! [`NodeHandle`] that can later remove the node from the middle of the list
//! without a scan. Handles carry a generation, so a handle to a node that was
//! already shifted or removed is simply ignored.
//!
//! [`push`]: LinkedList::push

/// Handle to a node returned by [`LinkedList::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u64, node: Node<T> },
    Vacant { generation: u64, next_free: Option<usize> },
}

#[derive(Debug)]
pub struct LinkedList<T> {
    slots: Vec<Slot<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Option<usize>,
    len: usize,
}

impl<T> Default for LinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LinkedList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
            free: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `value` at the tail.
    pub fn push(&mut self, value: T) -> NodeHandle {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };

        let (index, generation) = match self.free {
            Some(index) => {
                let Slot::Vacant { generation, next_free } = self.slots[index] else {
                    unreachable!("free list points at an occupied slot");
                };
                self.free = next_free;
                let generation = generation + 1;
                self.slots[index] = Slot::Occupied { generation, node };
                (index, generation)
            }
            None => {
                self.slots.push(Slot::Occupied { generation: 0, node });
                (self.slots.len() - 1, 0)
            }
        };

        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        NodeHandle { index, generation }
    }

    /// Remove and return the head.
    pub fn shift(&mut self) -> Option<T> {
        let head = self.head?;
        Some(self.unlink(head))
    }

    /// Remove the node behind `handle`. Returns `None` if it is already gone.
    pub fn remove(&mut self, handle: NodeHandle) -> Option<T> {
        match self.slots.get(handle.index) {
            Some(Slot::Occupied { generation, .. }) if *generation == handle.generation => {
                Some(self.unlink(handle.index))
            }
            _ => None,
        }
    }

    pub fn peek(&self) -> Option<&T> {
        self.head.map(|head| &self.node(head).value)
    }

    /// Values from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            let node = self.node(index);
            cursor = node.next;
            Some(&node.value)
        })
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    fn unlink(&mut self, index: usize) -> T {
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }

        let generation = match &self.slots[index] {
            Slot::Occupied { generation, .. } | Slot::Vacant { generation, .. } => *generation,
        };
        let slot = std::mem::replace(
            &mut self.slots[index],
            Slot::Vacant {
                generation,
                next_free: self.free,
            },
        );
        self.free = Some(index);
        self.len -= 1;

        match slot {
            Slot::Occupied { node, .. } => node.value,
            Slot::Vacant { .. } => unreachable!("unlinked a vacant slot"),
        }
    }

    fn node(&self, index: usize) -> &Node<T> {
        match &self.slots[index] {
            Slot::Occupied { node, .. } => node,
            Slot::Vacant { .. } => unreachable!("linked index points at a vacant slot"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        match &mut self.slots[index] {
            Slot::Occupied { node, .. } => node,
            Slot::Vacant { .. } => unreachable!("linked index points at a vacant slot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn test_fifo_order() {
        let mut list = LinkedList::new();
        list.push(1);
        list.push(2);
        list.push(3);
        assert_eq!(list.len(), 3);
        assert_eq!(list.shift(), Some(1));
        assert_eq!(list.shift(), Some(2));
        assert_eq!(list.shift(), Some(3));
        assert_eq!(list.shift(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_middle_head_and_tail() {
        let mut list = LinkedList::new();
        let a = list.push("a");
        let b = list.push("b");
        let c = list.push("c");
        let d = list.push("d");

        assert_eq!(list.remove(b), Some("b"));
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec!["a", "c", "d"]);
        assert_eq!(list.remove(a), Some("a"));
        assert_eq!(list.remove(d), Some("d"));
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(list.remove(c), Some("c"));
        assert!(list.is_empty());
        assert_eq!(list.peek(), None);
    }

    #[test]
    fn test_stale_handle_is_ignored() {
        let mut list = LinkedList::new();
        let first = list.push(1);
        assert_eq!(list.shift(), Some(1));

        // The slot is reused by the next push
        let second = list.push(2);
        assert_eq!(list.remove(first), None);
        assert_eq!(list.len(), 1);
        assert_eq!(list.remove(second), Some(2));
        assert_eq!(list.remove(second), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u32),
        Shift,
        Remove(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u32>().prop_map(Op::Push),
            Just(Op::Shift),
            (0usize..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        /// The list behaves like a deque with removal by handle.
        #[test]
        fn prop_matches_reference_model(ops in prop::collection::vec(arb_op(), 0..64)) {
            let mut list = LinkedList::new();
            let mut model: VecDeque<(NodeHandle, u32)> = VecDeque::new();
            let mut handles = Vec::new();

            for op in ops {
                match op {
                    Op::Push(v) => {
                        let handle = list.push(v);
                        handles.push(handle);
                        model.push_back((handle, v));
                    }
                    Op::Shift => {
                        prop_assert_eq!(list.shift(), model.pop_front().map(|(_, v)| v));
                    }
                    Op::Remove(i) => {
                        let Some(handle) = handles.get(i).copied() else { continue };
                        let expected = model
                            .iter()
                            .position(|(h, _)| *h == handle)
                            .and_then(|pos| model.remove(pos))
                            .map(|(_, v)| v);
                        prop_assert_eq!(list.remove(handle), expected);
                    }
                }
                prop_assert_eq!(list.len(), model.len());
                let values: Vec<u32> = list.iter().copied().collect();
                let expected: Vec<u32> = model.iter().map(|(_, v)| *v).collect();
                prop_assert_eq!(values, expected);
            }
        }
    }
}
