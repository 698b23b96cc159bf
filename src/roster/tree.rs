/// Node arena and sibling-list linkage.
///
/// Nodes live in a handle-addressed arena. Parent, first-child and sibling
/// links are stored as optional `NodeId`s, so detaching a node never touches
/// (or frees) its children. Top-level groups form the root sibling list,
/// whose head is kept by the arena itself.

use std::collections::HashMap;

use crate::roster::ids::NodeId;
use crate::roster::node::{Node, NodeKind};

// ---------------------------------------------------------------------------
// NodeArena
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct NodeArena {
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
    /// Head of the top-level group list.
    root: Option<NodeId>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a detached node.
    pub(crate) fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let id = self.next_id;
        self.next_id = id.next();
        self.nodes.insert(id, Node::detached(kind));
        id
    }

    /// Drop a node from the arena. The node must already be unlinked.
    pub(crate) fn free(&mut self, id: NodeId) -> Option<Node> {
        debug_assert!(!self.is_attached(id), "freeing attached node {}", id);
        self.nodes.remove(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Whether the node sits in some sibling list (the root list included).
    pub fn is_attached(&self, id: NodeId) -> bool {
        match self.nodes.get(&id) {
            None => false,
            Some(n) => n.parent.is_some() || n.prev.is_some() || self.root == Some(id),
        }
    }

    /// Children of `parent`, or the top-level groups when `parent` is `None`.
    pub fn children(&self, parent: Option<NodeId>) -> Children<'_> {
        Children {
            arena: self,
            cursor: self.head(parent),
        }
    }

    pub fn last_child(&self, parent: Option<NodeId>) -> Option<NodeId> {
        self.children(parent).last()
    }

    /// True when `node` is attached under `parent` directly after `anchor`
    /// (or at the head when `anchor` is `None`).
    pub fn is_at(&self, node: NodeId, anchor: Option<NodeId>, parent: Option<NodeId>) -> bool {
        match self.nodes.get(&node) {
            Some(n) => self.is_attached(node) && n.parent == parent && n.prev == anchor,
            None => false,
        }
    }

    fn head(&self, parent: Option<NodeId>) -> Option<NodeId> {
        match parent {
            None => self.root,
            Some(p) => self.nodes.get(&p).and_then(|n| n.first_child),
        }
    }

    fn set_head(&mut self, parent: Option<NodeId>, head: Option<NodeId>) {
        match parent {
            None => self.root = head,
            Some(p) => {
                if let Some(n) = self.nodes.get_mut(&p) {
                    n.first_child = head;
                }
            }
        }
    }

    fn set_next(&mut self, id: NodeId, next: Option<NodeId>) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.next = next;
        }
    }

    fn set_prev(&mut self, id: NodeId, prev: Option<NodeId>) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.prev = prev;
        }
    }

    // -----------------------------------------------------------------------
    // Linkage
    // -----------------------------------------------------------------------

    /// Splice `node` into `parent`'s child list right after `anchor`, or at
    /// the head when `anchor` is `None`.
    ///
    /// No-op when the node already sits at that position. The node must be
    /// detached otherwise; an anchor that is not a child of `parent` falls
    /// back to a head insert.
    pub(crate) fn insert_after(
        &mut self,
        node: NodeId,
        anchor: Option<NodeId>,
        parent: Option<NodeId>,
    ) {
        if self.is_at(node, anchor, parent) || !self.contains(node) {
            return;
        }
        debug_assert!(!self.is_attached(node), "insert of attached node {}", node);
        if self.is_attached(node) {
            self.unlink(node);
        }

        let anchor = anchor.filter(|a| {
            let valid = *a != node
                && self.is_attached(*a)
                && self.nodes.get(a).map(|n| n.parent) == Some(parent);
            if !valid {
                log::warn!("insert anchor {} is not a child of {:?}; inserting at head", a, parent);
            }
            valid
        });

        match anchor {
            Some(a) => {
                let next = self.nodes.get(&a).and_then(|n| n.next);
                self.set_next(a, Some(node));
                if let Some(nx) = next {
                    self.set_prev(nx, Some(node));
                }
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.prev = Some(a);
                    n.next = next;
                    n.parent = parent;
                }
            }
            None => {
                let head = self.head(parent);
                if let Some(h) = head {
                    self.set_prev(h, Some(node));
                }
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.prev = None;
                    n.next = head;
                    n.parent = parent;
                }
                self.set_head(parent, Some(node));
            }
        }
    }

    /// Detach `node` from its sibling list, leaving its own children intact.
    /// No-op when already detached.
    pub(crate) fn unlink(&mut self, node: NodeId) {
        if !self.is_attached(node) {
            return;
        }
        let (parent, prev, next) = match self.nodes.get(&node) {
            Some(n) => (n.parent, n.prev, n.next),
            None => return,
        };

        match prev {
            Some(p) => self.set_next(p, next),
            None => self.set_head(parent, next),
        }
        if let Some(nx) = next {
            self.set_prev(nx, prev);
        }

        if let Some(n) = self.nodes.get_mut(&node) {
            n.parent = None;
            n.prev = None;
            n.next = None;
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Walk every sibling list reachable from the root and check that
    /// prev/next/parent links agree pairwise.
    pub fn verify_links(&self) -> Result<(), String> {
        let mut stack: Vec<Option<NodeId>> = vec![None];
        while let Some(parent) = stack.pop() {
            let mut prev: Option<NodeId> = None;
            let mut cursor = self.head(parent);
            while let Some(id) = cursor {
                let node = self
                    .nodes
                    .get(&id)
                    .ok_or_else(|| format!("dangling link to {}", id))?;
                if node.parent != parent {
                    return Err(format!("{} has parent {:?}, expected {:?}", id, node.parent, parent));
                }
                if node.prev != prev {
                    return Err(format!("{} has prev {:?}, expected {:?}", id, node.prev, prev));
                }
                stack.push(Some(id));
                prev = Some(id);
                cursor = node.next;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Children iterator
// ---------------------------------------------------------------------------

pub struct Children<'a> {
    arena: &'a NodeArena,
    cursor: Option<NodeId>,
}

impl<'a> Iterator for Children<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cursor?;
        self.cursor = self.arena.get(id).and_then(|n| n.next);
        Some(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
