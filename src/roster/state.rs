/// Roster state: the tree, both indices and the collaborators, owned by one
/// explicitly constructed context.
///
/// Read-side API lives here: node access, index lookups, display names,
/// traversal and the invariant checker. Every mutation goes through the
/// transaction helpers at the bottom of this file (`Txn` + `commit`), which
/// hold back observer callbacks and the save request until the tree, the
/// indices and the counters are consistent again.

use std::collections::BTreeSet;
use thiserror::Error;

use crate::config::RosterConfig;
use crate::roster::contract::{NativeChatLookup, RosterObserver, RosterServices};
use crate::roster::counts;
use crate::roster::ids::{AccountId, NodeId};
use crate::roster::index::{fold_name, BuddyIndex, GroupIndex};
use crate::roster::node::{Buddy, Chat, Contact, Counters, Group, Node, NodeKind, NodeType, SettingValue};
use crate::roster::privacy::PrivacyLists;
use crate::roster::tree::{Children, NodeArena};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Node {node} is not a {expected}")]
    WrongKind { node: NodeId, expected: NodeType },

    #[error("Node {0} is not attached to the roster")]
    NotAttached(NodeId),

    #[error("Node {0} is still attached to the roster")]
    StillAttached(NodeId),

    #[error("Contact {0} has no buddies")]
    EmptyContact(NodeId),

    #[error("A different group named '{0}' already exists")]
    DuplicateGroup(String),

    #[error("{account} '{name}' is already in group {group}")]
    DuplicateBuddy {
        account: AccountId,
        name: String,
        group: NodeId,
    },

    #[error("Invalid roster document: {0}")]
    InvalidDocument(String),
}

pub type Result<T> = std::result::Result<T, RosterError>;

// ---------------------------------------------------------------------------
// Events & transactions
// ---------------------------------------------------------------------------

/// Observer-facing change record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RosterEvent {
    Added(NodeId),
    Removed(NodeId),
    Updated(NodeId),
}

/// Work collected by one mutation and released by `Roster::commit`.
#[derive(Debug, Default)]
pub(crate) struct Txn {
    events: Vec<RosterEvent>,
    /// Unlinked nodes destroyed after observers saw their removal.
    doomed: Vec<NodeId>,
    save: bool,
}

impl Txn {
    pub(crate) fn added(&mut self, node: NodeId) {
        self.events.push(RosterEvent::Added(node));
    }

    pub(crate) fn removed(&mut self, node: NodeId) {
        self.events.push(RosterEvent::Removed(node));
        self.doomed.push(node);
    }

    /// Destroy a node observers never saw.
    pub(crate) fn discard(&mut self, node: NodeId) {
        self.doomed.push(node);
    }

    pub(crate) fn updated(&mut self, node: NodeId) {
        let redundant = self.events.iter().rev().take(2).any(|e| {
            matches!(e, RosterEvent::Updated(n) | RosterEvent::Added(n) if *n == node)
        });
        if !redundant {
            self.events.push(RosterEvent::Updated(node));
        }
    }

    pub(crate) fn touch(&mut self) {
        self.save = true;
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty() && self.doomed.is_empty() && !self.save
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

pub struct Roster {
    pub(crate) config: RosterConfig,
    pub(crate) arena: NodeArena,
    pub(crate) buddy_index: BuddyIndex,
    pub(crate) group_index: GroupIndex,
    pub(crate) default_group: Option<NodeId>,
    pub(crate) privacy: PrivacyLists,
    pub(crate) services: RosterServices,
    observers: Vec<Box<dyn RosterObserver>>,
    /// Set while a document is being loaded; suppresses save requests.
    pub(crate) loading: bool,
}

impl Roster {
    pub fn new(config: RosterConfig, services: RosterServices) -> Self {
        Roster {
            config,
            arena: NodeArena::new(),
            buddy_index: BuddyIndex::new(),
            group_index: GroupIndex::new(),
            default_group: None,
            privacy: PrivacyLists::default(),
            services,
            observers: Vec::new(),
            loading: false,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn RosterObserver>) {
        self.observers.push(observer);
    }

    pub fn config(&self) -> &RosterConfig {
        &self.config
    }

    pub fn services(&self) -> &RosterServices {
        &self.services
    }

    pub fn buddy_index(&self) -> &BuddyIndex {
        &self.buddy_index
    }

    pub fn group_index(&self) -> &GroupIndex {
        &self.group_index
    }

    // -----------------------------------------------------------------------
    // Node access
    // -----------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    pub fn is_attached(&self, id: NodeId) -> bool {
        self.arena.is_attached(id)
    }

    pub fn group(&self, id: NodeId) -> Option<&Group> {
        self.arena.get(id).and_then(Node::as_group)
    }

    pub fn contact(&self, id: NodeId) -> Option<&Contact> {
        self.arena.get(id).and_then(Node::as_contact)
    }

    pub fn buddy(&self, id: NodeId) -> Option<&Buddy> {
        self.arena.get(id).and_then(Node::as_buddy)
    }

    pub fn chat(&self, id: NodeId) -> Option<&Chat> {
        self.arena.get(id).and_then(Node::as_chat)
    }

    pub fn counters(&self, id: NodeId) -> Option<Counters> {
        self.arena.get(id).and_then(Node::counters).copied()
    }

    /// Top-level groups in order.
    pub fn groups(&self) -> Children<'_> {
        self.arena.children(None)
    }

    pub fn children(&self, id: NodeId) -> Children<'_> {
        self.arena.children(Some(id))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).and_then(Node::parent)
    }

    /// Contact owning a buddy.
    pub fn contact_of(&self, buddy: NodeId) -> Option<NodeId> {
        self.buddy(buddy)?;
        self.parent(buddy)
    }

    /// Group a node lives in (a group is its own group).
    pub fn group_of(&self, id: NodeId) -> Option<NodeId> {
        match self.arena.get(id)?.node_type() {
            NodeType::Group => Some(id),
            NodeType::Contact | NodeType::Chat => self.parent(id),
            NodeType::Buddy => self.parent(id).and_then(|c| self.parent(c)),
        }
    }

    /// Every attached buddy, in tree order.
    pub fn buddies(&self) -> Vec<NodeId> {
        self.walk()
            .filter(|id| self.buddy(*id).is_some())
            .collect()
    }

    pub fn setting(&self, id: NodeId, key: &str) -> Option<&SettingValue> {
        self.arena.get(id)?.settings().get(key)
    }

    pub fn setting_string(&self, id: NodeId, key: &str) -> Option<&str> {
        self.setting(id, key).and_then(SettingValue::as_str)
    }

    pub fn setting_int(&self, id: NodeId, key: &str) -> Option<i64> {
        self.setting(id, key).and_then(SettingValue::as_int)
    }

    pub fn setting_bool(&self, id: NodeId, key: &str) -> Option<bool> {
        self.setting(id, key).and_then(SettingValue::as_bool)
    }

    pub fn is_transient(&self, id: NodeId) -> bool {
        self.arena.get(id).map(Node::is_transient).unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub(crate) fn normalize(&self, account: &AccountId, name: &str) -> String {
        self.services.accounts.normalize_name(account, name)
    }

    pub(crate) fn account_connected(&self, account: &AccountId) -> bool {
        self.services.accounts.connection_state(account).is_connected()
    }

    pub fn default_group(&self) -> Option<NodeId> {
        self.default_group
    }

    /// Resolve a group by name; `None` resolves to the default group.
    pub fn find_group(&self, name: Option<&str>) -> Option<NodeId> {
        match name {
            None => self.default_group,
            Some(name) => self.group_index.get(name),
        }
    }

    /// Any buddy with this name on the account, regardless of group.
    pub fn find_buddy(&self, account: &AccountId, name: &str) -> Option<NodeId> {
        self.buddy_index.first(account, &self.normalize(account, name))
    }

    pub fn find_buddy_in_group(&self, account: &AccountId, name: &str, group: NodeId) -> Option<NodeId> {
        self.buddy_index.get(account, &self.normalize(account, name), group)
    }

    /// All buddies with this name on the account, or every buddy of the
    /// account when `name` is `None`.
    pub fn find_buddies(&self, account: &AccountId, name: Option<&str>) -> Vec<NodeId> {
        match name {
            Some(name) => self
                .buddy_index
                .named(account, &self.normalize(account, name))
                .to_vec(),
            None => self.buddy_index.for_account(account),
        }
    }

    /// Locate a chat by name. Only answers for connected accounts; asks the
    /// protocol's own lookup first and falls back to comparing the chat's
    /// identifying component.
    pub fn find_chat(&self, account: &AccountId, name: &str) -> Option<NodeId> {
        if !self.account_connected(account) {
            return None;
        }
        match self.services.server.find_native_chat(self, account, name) {
            NativeChatLookup::Found(id) => return Some(id),
            NativeChatLookup::NotFound => return None,
            NativeChatLookup::Unsupported => {}
        }

        let component = self.services.server.chat_identifying_component(account)?;
        let wanted = self.normalize(account, name);
        self.walk().find(|id| {
            self.chat(*id)
                .filter(|chat| chat.account == *account)
                .and_then(|chat| chat.components.get(&component))
                .map(|value| self.normalize(account, value) == wanted)
                .unwrap_or(false)
        })
    }

    pub fn priority_buddy(&self, contact: NodeId) -> Option<NodeId> {
        self.contact(contact)?.priority
    }

    // -----------------------------------------------------------------------
    // Display names
    // -----------------------------------------------------------------------

    pub fn buddy_display_name(&self, buddy: NodeId) -> Option<&str> {
        let b = self.buddy(buddy)?;
        Some(
            b.alias
                .as_deref()
                .or(b.server_alias.as_deref())
                .unwrap_or(&b.name),
        )
    }

    pub fn contact_display_name(&self, contact: NodeId) -> Option<&str> {
        let c = self.contact(contact)?;
        match c.alias.as_deref() {
            Some(alias) => Some(alias),
            None => c
                .priority
                .or_else(|| self.arena.children(Some(contact)).next())
                .and_then(|b| self.buddy_display_name(b)),
        }
    }

    pub fn chat_display_name(&self, chat: NodeId) -> Option<String> {
        let c = self.chat(chat)?;
        if let Some(alias) = &c.alias {
            return Some(alias.clone());
        }
        let component = self.services.server.chat_identifying_component(&c.account)?;
        c.components.get(&component).cloned()
    }

    pub fn group_display_name(&self, group: NodeId) -> Option<&str> {
        let g = self.group(group)?;
        if self.default_group == Some(group) {
            Some(self.config.default_group_display_name())
        } else {
            Some(&g.name)
        }
    }

    // -----------------------------------------------------------------------
    // Group / contact summaries
    // -----------------------------------------------------------------------

    /// Buddies and chats in the group; only those on connected accounts
    /// unless `include_offline`.
    pub fn group_size(&self, group: NodeId, include_offline: bool) -> u32 {
        self.counters(group)
            .filter(|_| self.group(group).is_some())
            .map(|c| if include_offline { c.total } else { c.current })
            .unwrap_or(0)
    }

    pub fn group_online_count(&self, group: NodeId) -> u32 {
        self.counters(group)
            .filter(|_| self.group(group).is_some())
            .map(|c| c.online)
            .unwrap_or(0)
    }

    /// Connected accounts with at least one buddy in the group.
    pub fn group_accounts(&self, group: NodeId) -> Vec<AccountId> {
        let mut accounts = BTreeSet::new();
        for contact in self.arena.children(Some(group)) {
            for buddy in self.arena.children(Some(contact)) {
                if let Some(b) = self.buddy(buddy).filter(|b| b.connected) {
                    accounts.insert(b.account.clone());
                }
            }
        }
        accounts.into_iter().collect()
    }

    pub fn group_on_account(&self, group: NodeId, account: &AccountId) -> bool {
        self.arena.children(Some(group)).any(|child| match self.arena.get(child).map(Node::kind) {
            Some(NodeKind::Contact(_)) => self.contact_on_account(child, account),
            Some(NodeKind::Chat(c)) => c.account == *account && c.connected,
            _ => false,
        })
    }

    pub fn contact_on_account(&self, contact: NodeId, account: &AccountId) -> bool {
        self.arena
            .children(Some(contact))
            .filter_map(|b| self.buddy(b))
            .any(|b| b.account == *account && b.connected)
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    /// Depth-first pre-order successor of `node`. Buddies on disconnected
    /// accounts are skipped unless `include_offline`.
    pub fn node_next(&self, node: NodeId, include_offline: bool) -> Option<NodeId> {
        let mut cursor = self.preorder_next(node, true);
        while let Some(id) = cursor {
            let skip = !include_offline && self.buddy(id).map(|b| !b.connected).unwrap_or(false);
            if !skip {
                return Some(id);
            }
            cursor = self.preorder_next(id, true);
        }
        None
    }

    fn preorder_next(&self, node: NodeId, descend: bool) -> Option<NodeId> {
        let n = self.arena.get(node)?;
        if descend {
            if let Some(child) = n.first_child() {
                return Some(child);
            }
        }
        if let Some(next) = n.next_sibling() {
            return Some(next);
        }
        self.preorder_next(n.parent()?, false)
    }

    /// Every attached node in pre-order, offline buddies included.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            roster: self,
            cursor: self.arena.root(),
        }
    }

    // -----------------------------------------------------------------------
    // Invariants
    // -----------------------------------------------------------------------

    /// Verify linkage, counters, indices and the no-empty-contact rule
    /// against a from-scratch recount.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.arena.verify_links()?;

        let mut attached_buddies = 0usize;
        for id in self.walk() {
            let node = self.arena.get(id).ok_or_else(|| format!("{} vanished", id))?;
            match node.kind() {
                NodeKind::Group(g) => {
                    if node.parent().is_some() {
                        return Err(format!("group {} is nested", id));
                    }
                    if self.group_index.get(&g.name) != Some(id) {
                        return Err(format!("group '{}' ({}) not indexed", g.name, id));
                    }
                }
                NodeKind::Contact(_) => {
                    if self.arena.children(Some(id)).next().is_none() {
                        return Err(format!("contact {} is empty", id));
                    }
                }
                NodeKind::Buddy(b) => {
                    attached_buddies += 1;
                    let group = self.group_of(id).ok_or_else(|| format!("buddy {} has no group", id))?;
                    if self.buddy_index.get(&b.account, &b.normalized, group) != Some(id) {
                        return Err(format!("buddy {} missing from group index", id));
                    }
                    if !self.buddy_index.account_contains(&b.account, &b.normalized, id) {
                        return Err(format!("buddy {} missing from account index", id));
                    }
                }
                NodeKind::Chat(_) => {}
            }
            if let Some(stored) = node.counters() {
                let expected = counts::recount(&self.arena, id);
                if *stored != expected {
                    return Err(format!("{} counters {:?}, expected {:?}", id, stored, expected));
                }
            }
        }
        if attached_buddies != self.buddy_index.len() {
            return Err(format!(
                "buddy index holds {} entries for {} attached buddies",
                self.buddy_index.len(),
                attached_buddies
            ));
        }
        let aliases = std::iter::once(self.config.default_group_name.as_str())
            .chain(self.config.localized_default_group_name.as_deref());
        for alias in aliases {
            match (self.default_group, self.find_group(Some(alias))) {
                (Some(default), found) if found != Some(default) => {
                    return Err(format!("default group alias '{}' resolves to {:?}, not {}", alias, found, default));
                }
                (None, Some(owner)) => {
                    return Err(format!("{} answers to default alias '{}' but is not the default group", owner, alias));
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transaction plumbing
    // -----------------------------------------------------------------------

    pub(crate) fn require(&self, id: NodeId, expected: NodeType) -> Result<&Node> {
        let node = self.arena.get(id).ok_or(RosterError::UnknownNode(id))?;
        if node.node_type() != expected {
            return Err(RosterError::WrongKind { node: id, expected });
        }
        Ok(node)
    }

    pub(crate) fn require_attached(&self, id: NodeId, expected: NodeType) -> Result<&Node> {
        let node = self.require(id, expected)?;
        if !self.arena.is_attached(id) {
            return Err(RosterError::NotAttached(id));
        }
        Ok(node)
    }

    /// Whether `name` is one of the default group's names.
    pub(crate) fn is_default_group_name(&self, name: &str) -> bool {
        let folded = fold_name(name);
        folded == fold_name(&self.config.default_group_name)
            || self
                .config
                .localized_default_group_name
                .as_deref()
                .map(|l| fold_name(l) == folded)
                .unwrap_or(false)
    }

    /// Register a group's name (and the default aliases when it is the
    /// default group).
    pub(crate) fn index_group(&mut self, group: NodeId) {
        let Some(name) = self.group(group).map(|g| g.name.clone()) else {
            return;
        };
        if self.default_group.is_none() && self.is_default_group_name(&name) {
            self.default_group = Some(group);
        }
        self.group_index.insert(&name, group);
        if self.default_group == Some(group) {
            let canonical = self.config.default_group_name.clone();
            self.claim_alias(&canonical, group);
            if let Some(localized) = self.config.localized_default_group_name.clone() {
                self.claim_alias(&localized, group);
            }
        }
    }

    /// Point `alias` at `group` unless another group already owns the name.
    pub(crate) fn claim_alias(&mut self, alias: &str, group: NodeId) {
        match self.group_index.get(alias) {
            Some(owner) if owner != group => {
                log::warn!("group alias '{}' already belongs to {}; not claimed by {}", alias, owner, group);
            }
            _ => {
                self.group_index.insert(alias, group);
            }
        }
    }

    pub(crate) fn unindex_group(&mut self, group: NodeId) {
        self.group_index.remove_group(group);
        if self.default_group == Some(group) {
            self.default_group = None;
        }
    }

    /// Release a finished transaction: observers first, then destruction of
    /// removed nodes, then the save request.
    pub(crate) fn commit(&mut self, txn: Txn) {
        if txn.is_empty() {
            return;
        }
        log::debug!(
            "roster commit: {} event(s), {} removed, save={}",
            txn.events.len(),
            txn.doomed.len(),
            txn.save
        );

        let this: &Roster = self;
        for event in &txn.events {
            for observer in &this.observers {
                match *event {
                    RosterEvent::Added(id) => observer.on_added(this, id),
                    RosterEvent::Removed(id) => observer.on_removed(this, id),
                    RosterEvent::Updated(id) => observer.on_updated(this, id),
                }
            }
        }

        for id in txn.doomed {
            self.arena.free(id);
        }

        if txn.save && !self.loading {
            self.services.persistence.schedule_save();
            let this: &Roster = self;
            for observer in &this.observers {
                observer.on_save(this);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Walk iterator
// ---------------------------------------------------------------------------

pub struct Walk<'a> {
    roster: &'a Roster,
    cursor: Option<NodeId>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cursor?;
        self.cursor = self.roster.preorder_next(id, true);
        Some(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
