/// Identity types for the roster.
///
/// - `NodeId`: stable handle of a node in the roster arena
/// - `AccountId`: protocol + username pair that owns buddies and chats

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Stable handle for a roster node.
///
/// Handles are allocated monotonically and never reused, so a handle that
/// outlives its node simply stops resolving instead of aliasing a newer node.
/// `0` is reserved so every valid handle is non-zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Lowest valid handle.
    pub const MIN: Self = NodeId(1);

    /// Wrap a raw handle value. Returns `None` for the reserved `0`.
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(NodeId(raw))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        NodeId(self.0 + 1)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::MIN
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// AccountId
// ---------------------------------------------------------------------------

/// An account on a given protocol, e.g. `("xmpp", "me@example.org")`.
///
/// The roster never interprets either field; normalization and connection
/// state are answered by the `AccountDirectory` collaborator.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId {
    pub protocol: String,
    pub username: String,
}

impl AccountId {
    pub fn new(protocol: impl Into<String>, username: impl Into<String>) -> Self {
        AccountId {
            protocol: protocol.into(),
            username: username.into(),
        }
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({}:{})", self.protocol, self.username)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.username)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
