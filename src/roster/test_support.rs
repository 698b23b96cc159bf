//! Fake collaborators for unit tests.
//!
//! Every fake is a cheap clone around shared `Rc` state: one clone goes into
//! the roster's boxed services, the other stays with the test for driving
//! and inspection.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::config::RosterConfig;
use crate::roster::contract::{
    AccountDirectory, ConnectionState, NativeChatLookup, PersistenceAdapter, PresenceProvider, ProtocolServerOps,
    RosterObserver, RosterServices,
};
use crate::roster::ids::{AccountId, NodeId};
use crate::roster::node::Buddy;
use crate::roster::state::{Roster, RosterEvent};

pub fn account(protocol: &str, username: &str) -> AccountId {
    AccountId::new(protocol, username)
}

// ---------------------------------------------------------------------------
// Accounts & presence
// ---------------------------------------------------------------------------

/// Accounts start disconnected. Names normalize to lowercase.
#[derive(Clone, Default)]
pub struct FakeAccounts {
    known: Rc<RefCell<BTreeSet<AccountId>>>,
    connected: Rc<RefCell<BTreeSet<AccountId>>>,
}

impl FakeAccounts {
    pub fn connect(&self, account: &AccountId) {
        self.known.borrow_mut().insert(account.clone());
        self.connected.borrow_mut().insert(account.clone());
    }

    pub fn disconnect(&self, account: &AccountId) {
        self.known.borrow_mut().insert(account.clone());
        self.connected.borrow_mut().remove(account);
    }
}

impl AccountDirectory for FakeAccounts {
    fn connection_state(&self, account: &AccountId) -> ConnectionState {
        if self.connected.borrow().contains(account) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn normalize_name(&self, _account: &AccountId, name: &str) -> String {
        name.to_lowercase()
    }

    fn accounts(&self) -> Vec<AccountId> {
        self.known.borrow().iter().cloned().collect()
    }
}

/// Online set keyed by normalized buddy name.
#[derive(Clone, Default)]
pub struct FakePresence {
    online: Rc<RefCell<BTreeSet<String>>>,
}

impl FakePresence {
    pub fn set_online(&self, name: &str, online: bool) {
        let mut set = self.online.borrow_mut();
        if online {
            set.insert(name.to_lowercase());
        } else {
            set.remove(&name.to_lowercase());
        }
    }
}

impl PresenceProvider for FakePresence {
    fn is_online(&self, buddy: &Buddy) -> bool {
        self.online.borrow().contains(buddy.normalized_name())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerLog {
    moves: Vec<(String, String, String)>,
    removed_buddies: Vec<(String, String)>,
    removed_groups: Vec<(AccountId, String)>,
    renamed_groups: Vec<(AccountId, String, String)>,
    chat_component: Option<String>,
    native_chat: Option<NativeChatLookup>,
}

#[derive(Clone, Default)]
pub struct RecordingServer {
    log: Rc<RefCell<ServerLog>>,
}

impl RecordingServer {
    pub fn set_chat_component(&self, key: &str) {
        self.log.borrow_mut().chat_component = Some(key.to_string());
    }

    pub fn set_native_chat(&self, lookup: NativeChatLookup) {
        self.log.borrow_mut().native_chat = Some(lookup);
    }

    /// `(buddy, old group, new group)`
    pub fn moves(&self) -> Vec<(String, String, String)> {
        self.log.borrow().moves.clone()
    }

    /// `(buddy, group)`
    pub fn removed_buddies(&self) -> Vec<(String, String)> {
        self.log.borrow().removed_buddies.clone()
    }

    pub fn removed_groups(&self) -> Vec<(AccountId, String)> {
        self.log.borrow().removed_groups.clone()
    }

    /// `(account, old name, new name)`
    pub fn renamed_groups(&self) -> Vec<(AccountId, String, String)> {
        self.log.borrow().renamed_groups.clone()
    }
}

impl ProtocolServerOps for RecordingServer {
    fn move_buddy(&self, buddy: &Buddy, old_group: &str, new_group: &str) {
        self.log
            .borrow_mut()
            .moves
            .push((buddy.name.clone(), old_group.to_string(), new_group.to_string()));
    }

    fn remove_buddy(&self, buddy: &Buddy, group: &str) {
        self.log
            .borrow_mut()
            .removed_buddies
            .push((buddy.name.clone(), group.to_string()));
    }

    fn remove_group(&self, account: &AccountId, group: &str) {
        self.log
            .borrow_mut()
            .removed_groups
            .push((account.clone(), group.to_string()));
    }

    fn rename_group(&self, account: &AccountId, old_name: &str, new_name: &str) {
        self.log
            .borrow_mut()
            .renamed_groups
            .push((account.clone(), old_name.to_string(), new_name.to_string()));
    }

    fn find_native_chat(&self, _roster: &Roster, _account: &AccountId, _name: &str) -> NativeChatLookup {
        self.log.borrow().native_chat.unwrap_or(NativeChatLookup::Unsupported)
    }

    fn chat_identifying_component(&self, _account: &AccountId) -> Option<String> {
        self.log.borrow().chat_component.clone()
    }
}

// ---------------------------------------------------------------------------
// Persistence & observer
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct CountingSaves {
    count: Rc<Cell<usize>>,
}

impl CountingSaves {
    pub fn count(&self) -> usize {
        self.count.get()
    }
}

impl PersistenceAdapter for CountingSaves {
    fn schedule_save(&self) {
        self.count.set(self.count.get() + 1);
    }
}

#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Rc<RefCell<Vec<RosterEvent>>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<RosterEvent> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl RosterObserver for RecordingObserver {
    fn on_added(&self, roster: &Roster, node: NodeId) {
        assert!(roster.node(node).is_some(), "added {} does not resolve", node);
        self.events.borrow_mut().push(RosterEvent::Added(node));
    }

    fn on_removed(&self, roster: &Roster, node: NodeId) {
        assert!(roster.node(node).is_some(), "removed {} already destroyed", node);
        self.events.borrow_mut().push(RosterEvent::Removed(node));
    }

    fn on_updated(&self, _roster: &Roster, node: NodeId) {
        self.events.borrow_mut().push(RosterEvent::Updated(node));
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub roster: Roster,
    pub accounts: FakeAccounts,
    pub presence: FakePresence,
    pub server: RecordingServer,
    pub saves: CountingSaves,
    pub observer: RecordingObserver,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RosterConfig::default())
    }

    pub fn with_config(config: RosterConfig) -> Self {
        let accounts = FakeAccounts::default();
        let presence = FakePresence::default();
        let server = RecordingServer::default();
        let saves = CountingSaves::default();
        let observer = RecordingObserver::default();

        let services = RosterServices {
            accounts: Box::new(accounts.clone()),
            presence: Box::new(presence.clone()),
            server: Box::new(server.clone()),
            persistence: Box::new(saves.clone()),
        };
        let mut roster = Roster::new(config, services);
        roster.add_observer(Box::new(observer.clone()));

        Harness {
            roster,
            accounts,
            presence,
            server,
            saves,
            observer,
        }
    }

    /// New group appended to the top-level list.
    pub fn attached_group(&mut self, name: &str) -> NodeId {
        let group = self.roster.new_group(name);
        let last = self.roster.groups().last();
        self.roster.add_group(group, last).unwrap();
        group
    }
}
