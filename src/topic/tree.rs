//! A trie over topic levels.
//!
//! A trie is used instead of a flat filter list because wildcard matching cost
//! then scales with the branching of the tree rather than the total number of
//! subscriptions.

use std::hash::Hash;

use slotmap::{Key, SlotMap};

use crate::collections::FnvHashMap;

use super::{Filter, Segment, TopicName};

slotmap::new_key_type! { struct NodeId; }

struct Node<T> {
    parent: NodeId,

    /// Child levels, sorted for binary search. A `+` wildcard is stored as
    /// the literal level `"+"`; topic names cannot contain that character, so
    /// there is no ambiguity.
    children: Vec<(Box<str>, NodeId)>,

    /// Value for filters (or topics) ending exactly at this node.
    exact: Option<T>,

    /// Value for a filter ending in `#` at this node. It covers this node
    /// itself and its whole subtree [MQTT-4.7.1-2].
    wild: Option<T>,
}

impl<T> Node<T> {
    fn new(parent: NodeId) -> Self {
        Self {
            parent,
            children: Vec::new(),
            exact: None,
            wild: None,
        }
    }

    fn root() -> Self {
        Self::new(NodeId::null())
    }

    fn is_root(&self) -> bool {
        self.parent.is_null()
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.exact.is_none() && self.wild.is_none()
    }

    fn child(&self, level: &str) -> Option<NodeId> {
        self.children
            .binary_search_by(|(l, _)| (**l).cmp(level))
            .ok()
            .map(|idx| self.children[idx].1)
    }
}

pub struct Tree<T> {
    nodes: SlotMap<NodeId, Node<T>>,
    root: NodeId,
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        let mut nodes = SlotMap::default();
        let root = nodes.insert(Node::root());

        Self { nodes, root }
    }
}

impl<T> Tree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the tree holds no values at all. Removals prune empty
    /// branches, so a tree emptied of every value is structurally identical
    /// to a fresh one.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.nodes[self.root].is_empty()
    }

    /// Insert a value at `filter`, returning the value it replaced.
    pub fn insert(&mut self, filter: &Filter, value: T) -> Option<T> {
        let mut node_id = self.root;
        let mut wild = false;

        for segment in filter.segments() {
            let level: &str = match segment {
                Segment::Literal(literal) => literal,
                Segment::SingleLevel => "+",
                Segment::MultiLevel => {
                    // Validation guarantees `#` is the final segment.
                    wild = true;
                    break;
                }
            };

            node_id = match self.nodes[node_id]
                .children
                .binary_search_by(|(l, _)| (**l).cmp(level))
            {
                Ok(idx) => self.nodes[node_id].children[idx].1,
                Err(idx) => {
                    let child = self.nodes.insert(Node::new(node_id));
                    self.nodes[node_id].children.insert(idx, (level.into(), child));
                    child
                }
            };
        }

        let node = &mut self.nodes[node_id];
        let slot = if wild { &mut node.wild } else { &mut node.exact };

        slot.replace(value)
    }

    fn lookup(&self, filter: &Filter) -> Option<(NodeId, bool)> {
        let mut node_id = self.root;
        let mut wild = false;

        for segment in filter.segments() {
            let level: &str = match segment {
                Segment::Literal(literal) => literal,
                Segment::SingleLevel => "+",
                Segment::MultiLevel => {
                    wild = true;
                    break;
                }
            };

            node_id = self.nodes[node_id].child(level)?;
        }

        Some((node_id, wild))
    }

    pub fn get(&self, filter: &Filter) -> Option<&T> {
        let (node_id, wild) = self.lookup(filter)?;
        let node = &self.nodes[node_id];

        if wild { &node.wild } else { &node.exact }.as_ref()
    }

    pub fn get_mut(&mut self, filter: &Filter) -> Option<&mut T> {
        let (node_id, wild) = self.lookup(filter)?;
        let node = &mut self.nodes[node_id];

        if wild { &mut node.wild } else { &mut node.exact }.as_mut()
    }

    /// Remove the value at `filter` and prune any branches left empty.
    pub fn remove(&mut self, filter: &Filter) -> Option<T> {
        let (node_id, wild) = self.lookup(filter)?;
        let node = &mut self.nodes[node_id];

        let value = if wild { &mut node.wild } else { &mut node.exact }.take()?;

        let mut current = node_id;
        loop {
            let node = &self.nodes[current];
            if !node.is_empty() || node.is_root() {
                break;
            }

            let parent = node.parent;
            let idx = self.nodes[parent]
                .children
                .iter()
                .position(|(_, id)| *id == current)
                .expect("orphaned node reached through parent");

            self.nodes[parent].children.remove(idx);
            self.nodes.remove(current);

            current = parent;
        }

        Some(value)
    }

    /// Visit every value whose filter matches the concrete `topic`,
    /// implementing the MQTT §4.7 rules including `$`-topic isolation.
    pub fn visit_matches(&self, topic: &TopicName<'_>, f: &mut impl FnMut(&T)) {
        self.visit_matches_inner(self.root, topic.levels(), 0, f);
    }

    fn visit_matches_inner(
        &self,
        node_id: NodeId,
        levels: &[&str],
        depth: usize,
        f: &mut impl FnMut(&T),
    ) {
        let node = &self.nodes[node_id];

        let Some((next, rest)) = levels.split_first() else {
            if let Some(value) = &node.exact {
                f(value);
            }

            // A trailing `#` also matches zero remaining levels.
            if let Some(value) = &node.wild {
                f(value);
            }

            return;
        };

        // Wildcards at the first level do not match `$`-topics.
        let reserved = depth == 0 && next.starts_with('$');

        if !reserved {
            if let Some(value) = &node.wild {
                f(value);
            }

            if let Some(child) = node.child("+") {
                self.visit_matches_inner(child, rest, depth + 1, f);
            }
        }

        if let Some(child) = node.child(next) {
            self.visit_matches_inner(child, rest, depth + 1, f);
        }
    }

    /// The inverse of [`Self::visit_matches`]: visit every value stored at a
    /// concrete topic that the given `filter` admits.
    ///
    /// This is how the retained store is queried when a new subscription
    /// arrives.
    pub fn visit_search(&self, filter: &Filter, f: &mut impl FnMut(&T)) {
        let segments: Vec<Segment<'_>> = filter.segments().collect();
        self.visit_search_inner(self.root, &segments, 0, f);
    }

    fn visit_search_inner(
        &self,
        node_id: NodeId,
        segments: &[Segment<'_>],
        depth: usize,
        f: &mut impl FnMut(&T),
    ) {
        let node = &self.nodes[node_id];

        let Some((segment, rest)) = segments.split_first() else {
            if let Some(value) = &node.exact {
                f(value);
            }

            return;
        };

        match segment {
            // `#` matches this node and everything below it.
            Segment::MultiLevel => self.visit_subtree(node_id, depth, f),
            Segment::SingleLevel => {
                for (level, child) in &node.children {
                    if depth == 0 && level.starts_with('$') {
                        continue;
                    }

                    self.visit_search_inner(*child, rest, depth + 1, f);
                }
            }
            Segment::Literal(literal) => {
                if let Some(child) = node.child(literal) {
                    self.visit_search_inner(child, rest, depth + 1, f);
                }
            }
        }
    }

    fn visit_subtree(&self, node_id: NodeId, depth: usize, f: &mut impl FnMut(&T)) {
        let node = &self.nodes[node_id];

        if let Some(value) = &node.exact {
            f(value);
        }

        for (level, child) in &node.children {
            if depth == 0 && level.starts_with('$') {
                continue;
            }

            self.visit_subtree(*child, depth + 1, f);
        }
    }
}

/// A [`Tree`] whose nodes hold one value per key, used for the subscription
/// index: the key is the subscribing session and the value its granted QoS.
///
/// Subscribing twice with the same filter replaces the previous entry for
/// that session [MQTT-3.8.4-3].
pub struct SubscriptionTree<K, V> {
    tree: Tree<FnvHashMap<K, V>>,
    len: usize,
}

impl<K, V> Default for SubscriptionTree<K, V> {
    fn default() -> Self {
        Self {
            tree: Tree::default(),
            len: 0,
        }
    }
}

impl<K: Eq + Hash, V> SubscriptionTree<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn subscribe(&mut self, filter: &Filter, key: K, value: V) -> Option<V> {
        if let Some(entries) = self.tree.get_mut(filter) {
            let replaced = entries.insert(key, value);
            self.len += replaced.is_none() as usize;
            return replaced;
        }

        let mut entries = FnvHashMap::default();
        entries.insert(key, value);
        self.tree.insert(filter, entries);

        self.len += 1;
        None
    }

    pub fn unsubscribe(&mut self, filter: &Filter, key: &K) -> Option<V> {
        let entries = self.tree.get_mut(filter)?;
        let removed = entries.remove(key);

        if entries.is_empty() {
            self.tree.remove(filter);
        }

        self.len -= removed.is_some() as usize;
        removed
    }

    pub fn visit_matches(&self, topic: &TopicName<'_>, mut f: impl FnMut(&K, &V)) {
        self.tree.visit_matches(topic, &mut |entries| {
            entries.iter().for_each(|(k, v)| f(k, v));
        });
    }
}
