//! Event space - hierarchical listener registry.
//!
//! A trie keyed by [`KeySegment`]s. Every node holds its own listeners plus
//! a child map; nodes live in a flat arena and link to each other by index,
//! so there is no cyclic ownership. Empty nodes are pruned as soon as their
//! last listener and child are gone.
//!
//! Trigger operations never call listeners themselves: they return clones
//! of the matching listeners so the caller can release its lock before
//! running them. Listeners registered with [`EventSpace::register_once`] are
//! removed by the trigger that returns them.
//!
//! # Example
//!
//! ```
//! use remote_invoke::event_key;
//! use remote_invoke::event_space::EventSpace;
//! use remote_invoke::protocol::MessageType;
//!
//! let mut space: EventSpace<&'static str> = EventSpace::new();
//! space.register(&event_key![MessageType::Broadcast, "a"], "namespace");
//! space.register(&event_key![MessageType::Broadcast, "a", "b"], "exact");
//!
//! let fired = space.trigger_ancestors(&event_key![MessageType::Broadcast, "a", "b"], true);
//! assert_eq!(fired, vec!["exact", "namespace"]);
//! ```

mod key;

pub use key::{EventKey, KeySegment};

use std::collections::HashMap;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Entry<H> {
    id: ListenerId,
    handler: H,
    once: bool,
}

struct Node<H> {
    parent: usize,
    segment: Option<KeySegment>,
    children: HashMap<KeySegment, usize>,
    entries: Vec<Entry<H>>,
    live: bool,
}

impl<H> Node<H> {
    fn new(parent: usize, segment: Option<KeySegment>) -> Self {
        Self {
            parent,
            segment,
            children: HashMap::new(),
            entries: Vec::new(),
            live: true,
        }
    }
}

const ROOT: usize = 0;

/// Hierarchical listener registry.
pub struct EventSpace<H> {
    nodes: Vec<Node<H>>,
    free: Vec<usize>,
    next_listener: u64,
}

impl<H: Clone> EventSpace<H> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(ROOT, None)],
            free: Vec::new(),
            next_listener: 0,
        }
    }

    /// Register a listener at `key`.
    pub fn register(&mut self, key: &EventKey, handler: H) -> ListenerId {
        self.insert(key, handler, false)
    }

    /// Register a listener at `key` that is removed after it fires once.
    pub fn register_once(&mut self, key: &EventKey, handler: H) -> ListenerId {
        self.insert(key, handler, true)
    }

    /// Remove one listener (`Some(id)`) or every listener (`None`) at `key`.
    ///
    /// Returns `true` if anything was removed.
    pub fn cancel(&mut self, key: &EventKey, id: Option<ListenerId>) -> bool {
        let Some(idx) = self.find(key) else {
            return false;
        };
        let node = &mut self.nodes[idx];
        let before = node.entries.len();
        match id {
            Some(id) => node.entries.retain(|e| e.id != id),
            None => node.entries.clear(),
        }
        let removed = node.entries.len() != before;
        self.prune(idx);
        removed
    }

    /// Check if any listener is registered exactly at `key`.
    pub fn has(&self, key: &EventKey) -> bool {
        self.find(key)
            .is_some_and(|idx| !self.nodes[idx].entries.is_empty())
    }

    /// Number of listeners registered exactly at `key`.
    pub fn listener_count(&self, key: &EventKey) -> usize {
        self.find(key)
            .map_or(0, |idx| self.nodes[idx].entries.len())
    }

    /// Listeners registered exactly at `key`.
    pub fn trigger(&mut self, key: &EventKey) -> Vec<H> {
        let mut fired = Vec::new();
        if let Some(idx) = self.find(key) {
            self.drain(idx, &mut fired);
            self.prune(idx);
        }
        fired
    }

    /// Check if a listener is registered at any prefix of `key`.
    pub fn has_ancestors(&self, key: &EventKey, include_self: bool) -> bool {
        self.ancestor_nodes(key, include_self)
            .iter()
            .any(|&idx| !self.nodes[idx].entries.is_empty())
    }

    /// Listeners registered at every prefix of `key`, most specific first.
    pub fn trigger_ancestors(&mut self, key: &EventKey, include_self: bool) -> Vec<H> {
        let mut fired = Vec::new();
        let nodes = self.ancestor_nodes(key, include_self);
        for &idx in nodes.iter().rev() {
            self.drain(idx, &mut fired);
        }
        for &idx in nodes.iter().rev() {
            self.prune(idx);
        }
        fired
    }

    /// Remove every listener registered at a prefix of `key`.
    pub fn cancel_ancestors(&mut self, key: &EventKey, include_self: bool) {
        let nodes = self.ancestor_nodes(key, include_self);
        for &idx in nodes.iter().rev() {
            self.nodes[idx].entries.clear();
        }
        for &idx in nodes.iter().rev() {
            self.prune(idx);
        }
    }

    /// Check if a listener is registered anywhere below `key`.
    pub fn has_descendants(&self, key: &EventKey, include_self: bool) -> bool {
        self.descendant_nodes(key, include_self)
            .iter()
            .any(|&idx| !self.nodes[idx].entries.is_empty())
    }

    /// Listeners registered anywhere below `key`.
    pub fn trigger_descendants(&mut self, key: &EventKey, include_self: bool) -> Vec<H> {
        let mut fired = Vec::new();
        let nodes = self.descendant_nodes(key, include_self);
        for &idx in &nodes {
            self.drain(idx, &mut fired);
        }
        for &idx in nodes.iter().rev() {
            self.prune(idx);
        }
        fired
    }

    /// Remove every listener registered anywhere below `key`.
    pub fn cancel_descendants(&mut self, key: &EventKey, include_self: bool) {
        let nodes = self.descendant_nodes(key, include_self);
        for &idx in &nodes {
            self.nodes[idx].entries.clear();
        }
        for &idx in nodes.iter().rev() {
            self.prune(idx);
        }
    }

    /// Every key at or below `prefix` that has at least one listener.
    pub fn keys(&self, prefix: &EventKey) -> Vec<EventKey> {
        self.descendant_nodes(prefix, true)
            .into_iter()
            .filter(|&idx| !self.nodes[idx].entries.is_empty())
            .map(|idx| self.key_of(idx))
            .collect()
    }

    /// Check if no listener is registered anywhere.
    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].children.is_empty() && self.nodes[ROOT].entries.is_empty()
    }

    fn insert(&mut self, key: &EventKey, handler: H, once: bool) -> ListenerId {
        let idx = self.find_or_create(key);
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.nodes[idx].entries.push(Entry { id, handler, once });
        id
    }

    fn find(&self, key: &EventKey) -> Option<usize> {
        let mut idx = ROOT;
        for segment in key.segments() {
            idx = *self.nodes[idx].children.get(segment)?;
        }
        Some(idx)
    }

    fn find_or_create(&mut self, key: &EventKey) -> usize {
        let mut idx = ROOT;
        for segment in key.segments() {
            idx = match self.nodes[idx].children.get(segment) {
                Some(&child) => child,
                None => {
                    let child = self.alloc(idx, segment.clone());
                    self.nodes[idx].children.insert(segment.clone(), child);
                    child
                }
            };
        }
        idx
    }

    fn alloc(&mut self, parent: usize, segment: KeySegment) -> usize {
        let node = Node::new(parent, Some(segment));
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Nodes along `key` from the root down, stopping at the first missing segment.
    fn ancestor_nodes(&self, key: &EventKey, include_self: bool) -> Vec<usize> {
        let segments = key.segments();
        let mut nodes = vec![ROOT];
        let mut idx = ROOT;
        for (depth, segment) in segments.iter().enumerate() {
            let is_self = depth + 1 == segments.len();
            if is_self && !include_self {
                break;
            }
            match self.nodes[idx].children.get(segment) {
                Some(&child) => {
                    nodes.push(child);
                    idx = child;
                }
                None => break,
            }
        }
        if !segments.is_empty() || include_self {
            nodes
        } else {
            Vec::new()
        }
    }

    /// Nodes in the subtree at `key`, parents before children.
    fn descendant_nodes(&self, key: &EventKey, include_self: bool) -> Vec<usize> {
        let Some(start) = self.find(key) else {
            return Vec::new();
        };
        let mut nodes = Vec::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            if idx != start || include_self {
                nodes.push(idx);
            }
            stack.extend(self.nodes[idx].children.values().copied());
        }
        nodes
    }

    fn drain(&mut self, idx: usize, fired: &mut Vec<H>) {
        let node = &mut self.nodes[idx];
        fired.extend(node.entries.iter().map(|e| e.handler.clone()));
        node.entries.retain(|e| !e.once);
    }

    /// Free `idx` and its empty ancestors.
    fn prune(&mut self, mut idx: usize) {
        while idx != ROOT {
            let node = &self.nodes[idx];
            if !node.live || !node.entries.is_empty() || !node.children.is_empty() {
                return;
            }
            let parent = node.parent;
            if let Some(segment) = self.nodes[idx].segment.take() {
                self.nodes[parent].children.remove(&segment);
            }
            self.nodes[idx].live = false;
            self.free.push(idx);
            idx = parent;
        }
    }

    fn key_of(&self, mut idx: usize) -> EventKey {
        let mut segments = Vec::new();
        while idx != ROOT {
            if let Some(segment) = &self.nodes[idx].segment {
                segments.push(segment.clone());
            }
            idx = self.nodes[idx].parent;
        }
        segments.reverse();
        EventKey::from(segments)
    }
}

impl<H: Clone> Default for EventSpace<H> {
    fn default() -> Self {
        Self::new()
    }
}
