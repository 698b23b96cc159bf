/// Roster node model: a closed tagged union over the four node kinds.
///
/// Every node carries tree linkage (as `NodeId` handles into the arena), a
/// string-keyed settings map and a transient flag. The kind-specific payload
/// lives in `NodeKind`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::roster::ids::{AccountId, NodeId};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// A single per-node setting value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum SettingValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl SettingValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Ordered so that persisted output and state hashes are deterministic.
pub type Settings = BTreeMap<String, SettingValue>;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Aggregate counters carried by Group and MetaContact nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Qualifying children, independent of connection state.
    pub total: u32,
    /// Children whose owning account is connected.
    pub current: u32,
    /// Children currently online.
    pub online: u32,
}

// ---------------------------------------------------------------------------
// Kind payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Group {
    pub name: String,
    pub(crate) counters: Counters,
}

#[derive(Clone, Debug, Default)]
pub struct Contact {
    pub alias: Option<String>,
    pub(crate) counters: Counters,
    /// Cached best buddy; refreshed on every membership or presence change.
    pub(crate) priority: Option<NodeId>,
}

#[derive(Clone, Debug)]
pub struct Buddy {
    pub account: AccountId,
    pub name: String,
    /// `name` run through the account's normalizer; the hashing key.
    pub(crate) normalized: String,
    pub alias: Option<String>,
    pub server_alias: Option<String>,
    /// Connection snapshot the parent counters were computed from.
    pub(crate) connected: bool,
    /// Presence snapshot the parent counters were computed from.
    pub(crate) online: bool,
}

impl Buddy {
    pub fn normalized_name(&self) -> &str {
        &self.normalized
    }

    /// Presence as last seen by the roster.
    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Clone, Debug)]
pub struct Chat {
    pub account: AccountId,
    pub alias: Option<String>,
    /// Opaque protocol-specific join parameters.
    pub components: BTreeMap<String, String>,
    pub(crate) connected: bool,
}

impl Chat {
    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

/// The node kinds, without payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Group,
    Contact,
    Buddy,
    Chat,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Group => "group",
            NodeType::Contact => "contact",
            NodeType::Buddy => "buddy",
            NodeType::Chat => "chat",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Group(Group),
    Contact(Contact),
    Buddy(Buddy),
    Chat(Chat),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Group(_) => NodeType::Group,
            NodeKind::Contact(_) => NodeType::Contact,
            NodeKind::Buddy(_) => NodeType::Buddy,
            NodeKind::Chat(_) => NodeType::Chat,
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) first_child: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
    pub(crate) prev: Option<NodeId>,
    pub(crate) settings: Settings,
    /// Excluded from persistence.
    pub(crate) transient: bool,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn detached(kind: NodeKind) -> Self {
        Node {
            parent: None,
            first_child: None,
            next: None,
            prev: None,
            settings: Settings::new(),
            transient: false,
            kind,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn first_child(&self) -> Option<NodeId> {
        self.first_child
    }

    pub fn next_sibling(&self) -> Option<NodeId> {
        self.next
    }

    pub fn prev_sibling(&self) -> Option<NodeId> {
        self.prev
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Counters, for the two counting kinds.
    pub fn counters(&self) -> Option<&Counters> {
        match &self.kind {
            NodeKind::Group(g) => Some(&g.counters),
            NodeKind::Contact(c) => Some(&c.counters),
            _ => None,
        }
    }

    pub(crate) fn counters_mut(&mut self) -> Option<&mut Counters> {
        match &mut self.kind {
            NodeKind::Group(g) => Some(&mut g.counters),
            NodeKind::Contact(c) => Some(&mut c.counters),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match &self.kind {
            NodeKind::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_contact(&self) -> Option<&Contact> {
        match &self.kind {
            NodeKind::Contact(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_buddy(&self) -> Option<&Buddy> {
        match &self.kind {
            NodeKind::Buddy(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_chat(&self) -> Option<&Chat> {
        match &self.kind {
            NodeKind::Chat(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn as_group_mut(&mut self) -> Option<&mut Group> {
        match &mut self.kind {
            NodeKind::Group(g) => Some(g),
            _ => None,
        }
    }

    pub(crate) fn as_contact_mut(&mut self) -> Option<&mut Contact> {
        match &mut self.kind {
            NodeKind::Contact(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn as_buddy_mut(&mut self) -> Option<&mut Buddy> {
        match &mut self.kind {
            NodeKind::Buddy(b) => Some(b),
            _ => None,
        }
    }

    pub(crate) fn as_chat_mut(&mut self) -> Option<&mut Chat> {
        match &mut self.kind {
            NodeKind::Chat(c) => Some(c),
            _ => None,
        }
    }

    /// Account owning a buddy or chat.
    pub fn account(&self) -> Option<&AccountId> {
        match &self.kind {
            NodeKind::Buddy(b) => Some(&b.account),
            NodeKind::Chat(c) => Some(&c.account),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
