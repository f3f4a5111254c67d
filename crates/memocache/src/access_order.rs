//! Recency ordering of cache keys.
//!
//! The [`AccessOrder`] is a doubly linked list of keys, ordered from least to most recently
//! accessed. Nodes live in an arena of slots and link to each other by stable [`Handle`]s, so
//! moving a key to the most-recently-used end and popping the least-recently-used key are both
//! O(1) without any pointer juggling.
//!
//! ```text
//!   head ─► [h1: a] ◄──► [h2: b] ◄──► [h3: c] ◄── tail
//!           oldest                     newest
//! ```
//!
//! The list is not synchronized. The cache only ever touches it while holding the eviction
//! claim.

use std::hash::Hash;

use rustc_hash::FxHashMap;

/// Stable index of a node in the [`AccessOrder`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Handle(usize);

#[derive(Debug)]
struct Node<K> {
    key: K,
    previous: Option<Handle>,
    next: Option<Handle>,
}

/// A set of keys ordered by last access.
#[derive(Debug)]
pub struct AccessOrder<K> {
    slots: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    handles: FxHashMap<K, Handle>,
    head: Option<Handle>,
    tail: Option<Handle>,
}

impl<K> AccessOrder<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty order.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty order with room for `capacity` keys.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            handles: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            head: None,
            tail: None,
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Marks `key` as the most recently used one.
    ///
    /// Unknown keys are appended at the tail, known keys are unlinked from their current position
    /// and relinked at the tail.
    pub fn add(&mut self, key: K) {
        match self.handles.get(&key) {
            Some(&handle) => {
                if self.tail == Some(handle) {
                    return;
                }
                self.unlink(handle);
                self.link_tail(handle);
            }
            None => {
                let handle = self.allocate(Node {
                    key: key.clone(),
                    previous: None,
                    next: None,
                });
                self.handles.insert(key, handle);
                self.link_tail(handle);
            }
        }
    }

    /// Removes and returns the least recently used key.
    pub fn remove_oldest(&mut self) -> Option<K> {
        let handle = self.head?;
        self.unlink(handle);

        let node = self.slots.get_mut(handle.0).and_then(Option::take)?;
        self.free.push(handle.0);
        self.handles.remove(&node.key);

        Some(node.key)
    }

    /// Stops tracking `key`. Returns `false` if it was not tracked.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(handle) = self.handles.remove(key) else {
            return false;
        };
        self.unlink(handle);
        if let Some(slot) = self.slots.get_mut(handle.0) {
            *slot = None;
            self.free.push(handle.0);
        }
        true
    }

    /// Forgets all keys.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.handles.clear();
        self.head = None;
        self.tail = None;
    }

    /// Iterates the keys from least to most recently used.
    pub fn iter(&self) -> impl Iterator<Item = &K> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.slot(cursor?)?;
            cursor = node.next;
            Some(&node.key)
        })
    }

    fn allocate(&mut self, node: Node<K>) -> Handle {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                Handle(index)
            }
            None => {
                self.slots.push(Some(node));
                Handle(self.slots.len() - 1)
            }
        }
    }

    fn slot(&self, handle: Handle) -> Option<&Node<K>> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Node<K>> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    fn unlink(&mut self, handle: Handle) {
        let Some(node) = self.slot_mut(handle) else {
            return;
        };
        let previous = node.previous.take();
        let next = node.next.take();

        match previous.and_then(|previous| self.slot_mut(previous)) {
            Some(previous) => previous.next = next,
            None => self.head = next,
        }
        match next.and_then(|next| self.slot_mut(next)) {
            Some(next) => next.previous = previous,
            None => self.tail = previous,
        }
    }

    fn link_tail(&mut self, handle: Handle) {
        let old_tail = self.tail;
        if let Some(node) = self.slot_mut(handle) {
            node.previous = old_tail;
            node.next = None;
        }

        match old_tail.and_then(|tail| self.slot_mut(tail)) {
            Some(tail) => tail.next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
    }
}

impl<K> Default for AccessOrder<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
