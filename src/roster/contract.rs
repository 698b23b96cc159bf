/// Collaborator contracts the roster consumes (app implements).
///
/// The roster never talks to the network, the account store or the disk on
/// its own. Everything outside the in-memory tree reaches it through these
/// traits, which the host hands over in `RosterServices`.
///
/// Server-side calls are fire-and-forget: a rejected move or remove is
/// reported by the protocol layer through its own channels and never rolls
/// back a committed in-memory mutation.

use unicode_normalization::UnicodeNormalization;

use crate::roster::ids::{AccountId, NodeId};
use crate::roster::node::Buddy;
use crate::roster::state::Roster;

// ---------------------------------------------------------------------------
// Accounts & presence
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

pub trait AccountDirectory {
    fn connection_state(&self, account: &AccountId) -> ConnectionState;

    /// Protocol-specific canonical form of a screen name. The default keeps
    /// case and only applies Unicode compatibility normalization.
    fn normalize_name(&self, _account: &AccountId, name: &str) -> String {
        name.nfkc().collect()
    }

    /// Every account the host knows about.
    fn accounts(&self) -> Vec<AccountId>;
}

pub trait PresenceProvider {
    fn is_online(&self, buddy: &Buddy) -> bool;

    /// Ordering used to pick a contact's priority buddy; higher wins.
    fn presence_rank(&self, buddy: &Buddy) -> u8 {
        u8::from(self.is_online(buddy))
    }
}

// ---------------------------------------------------------------------------
// Server-side roster sync
// ---------------------------------------------------------------------------

/// Outcome of asking a protocol for its own chat lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeChatLookup {
    /// The protocol has no native lookup; fall back to the component scan.
    Unsupported,
    NotFound,
    Found(NodeId),
}

pub trait ProtocolServerOps {
    fn move_buddy(&self, buddy: &Buddy, old_group: &str, new_group: &str);

    /// Drop `buddy` from `group` on the server (duplicate cleanup).
    fn remove_buddy(&self, buddy: &Buddy, group: &str);

    fn remove_group(&self, account: &AccountId, group: &str);

    fn rename_group(&self, _account: &AccountId, _old_name: &str, _new_name: &str) {}

    fn find_native_chat(&self, _roster: &Roster, _account: &AccountId, _name: &str) -> NativeChatLookup {
        NativeChatLookup::Unsupported
    }

    /// Component key whose value names a chat on this account's protocol.
    fn chat_identifying_component(&self, account: &AccountId) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Persistence & notification
// ---------------------------------------------------------------------------

pub trait PersistenceAdapter {
    /// Request a (debounced) save. Must not block.
    fn schedule_save(&self);
}

/// UI-facing observer, dispatched synchronously after each committed
/// mutation, in the order the mutation produced its events.
pub trait RosterObserver {
    fn on_added(&self, _roster: &Roster, _node: NodeId) {}

    /// Fired while the removed node is still resolvable, right before it is
    /// destroyed.
    fn on_removed(&self, _roster: &Roster, _node: NodeId) {}

    fn on_updated(&self, _roster: &Roster, _node: NodeId) {}

    fn on_save(&self, _roster: &Roster) {}
}

/// The collaborators a roster is built with.
pub struct RosterServices {
    pub accounts: Box<dyn AccountDirectory>,
    pub presence: Box<dyn PresenceProvider>,
    pub server: Box<dyn ProtocolServerOps>,
    pub persistence: Box<dyn PersistenceAdapter>,
}

// ---------------------------------------------------------------------------
// No-op collaborators
// ---------------------------------------------------------------------------

/// Collaborator that answers "nothing connected, nothing online" and drops
/// every request. Useful for offline tooling that only edits saved rosters.
#[derive(Clone, Copy, Debug, Default)]
pub struct Offline;

impl AccountDirectory for Offline {
    fn connection_state(&self, _account: &AccountId) -> ConnectionState {
        ConnectionState::Disconnected
    }

    fn accounts(&self) -> Vec<AccountId> {
        Vec::new()
    }
}

impl PresenceProvider for Offline {
    fn is_online(&self, _buddy: &Buddy) -> bool {
        false
    }
}

impl ProtocolServerOps for Offline {
    fn move_buddy(&self, _buddy: &Buddy, _old_group: &str, _new_group: &str) {}

    fn remove_buddy(&self, _buddy: &Buddy, _group: &str) {}

    fn remove_group(&self, _account: &AccountId, _group: &str) {}

    fn chat_identifying_component(&self, _account: &AccountId) -> Option<String> {
        None
    }
}

impl PersistenceAdapter for Offline {
    fn schedule_save(&self) {}
}

impl RosterServices {
    pub fn offline() -> Self {
        RosterServices {
            accounts: Box::new(Offline),
            presence: Box::new(Offline),
            server: Box::new(Offline),
            persistence: Box::new(Offline),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
