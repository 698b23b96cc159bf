/// Roster mutation API.
///
/// Every public method here is one transaction:
/// 1. validate handles and compute a plan (no state touched, errors return
///    with the roster unchanged),
/// 2. withdraw the node's old contribution and unlink it,
/// 3. relink and reindex at the destination, apply the new contribution,
/// 4. commit: observer callbacks in order, then one save request.
///
/// Cascades (an emptied contact disappearing, duplicates deleted on a group
/// change) happen inside the same transaction.

use std::collections::BTreeMap;

use crate::roster::counts;
use crate::roster::ids::{AccountId, NodeId};
use crate::roster::index::fold_name;
use crate::roster::node::{Buddy, Chat, Contact, Counters, Group, Node, NodeKind, NodeType, SettingValue};
use crate::roster::state::{Result, Roster, RosterError, Txn};

/// Where a buddy's contact comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContactTarget {
    Existing(NodeId),
    /// A never-attached contact, appended to the group first.
    AttachDetached(NodeId),
    Fresh,
}

#[derive(Clone, Copy, Debug)]
struct BuddyPlan {
    buddy: NodeId,
    target: ContactTarget,
    /// `None` means the default group, created on demand.
    group: Option<NodeId>,
    anchor: Option<NodeId>,
}

/// Destination of a group child (contact or chat).
#[derive(Clone, Copy, Debug)]
struct PlacePlan {
    node: NodeId,
    group: Option<NodeId>,
    anchor: Option<NodeId>,
}

fn clean(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

impl Roster {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// A detached group, or the attached one already using this name.
    pub fn new_group(&mut self, name: &str) -> NodeId {
        if let Some(existing) = self.group_index.get(name) {
            return existing;
        }
        self.arena.alloc(NodeKind::Group(Group {
            name: name.to_string(),
            counters: Counters::default(),
        }))
    }

    pub fn new_contact(&mut self) -> NodeId {
        self.arena.alloc(NodeKind::Contact(Contact::default()))
    }

    pub fn new_buddy(&mut self, account: AccountId, name: &str, alias: Option<&str>) -> NodeId {
        let normalized = self.normalize(&account, name);
        self.arena.alloc(NodeKind::Buddy(Buddy {
            account,
            name: name.to_string(),
            normalized,
            alias: clean(alias),
            server_alias: None,
            connected: false,
            online: false,
        }))
    }

    pub fn new_chat(
        &mut self,
        account: AccountId,
        alias: Option<&str>,
        components: BTreeMap<String, String>,
    ) -> NodeId {
        self.arena.alloc(NodeKind::Chat(Chat {
            account,
            alias: clean(alias),
            components,
            connected: false,
        }))
    }

    /// Destroy a node that was never attached (or was removed).
    pub fn discard(&mut self, node: NodeId) -> Result<()> {
        if !self.arena.contains(node) {
            return Err(RosterError::UnknownNode(node));
        }
        if self.arena.is_attached(node) {
            return Err(RosterError::StillAttached(node));
        }
        self.arena.free(node);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // add_buddy
    // -----------------------------------------------------------------------

    /// Place `buddy` into a contact.
    ///
    /// - `after` is a buddy: insert right after it, in its contact.
    /// - else `contact`: insert at the head of that contact (a detached
    ///   contact is appended to `group`, or the default group, first).
    /// - else a new contact is appended to `group` (default group when
    ///   `None`), unless the buddy already sits in that group.
    pub fn add_buddy(
        &mut self,
        buddy: NodeId,
        contact: Option<NodeId>,
        group: Option<NodeId>,
        after: Option<NodeId>,
    ) -> Result<()> {
        let Some(plan) = self.plan_add_buddy(buddy, contact, group, after)? else {
            return Ok(());
        };
        let mut txn = Txn::default();
        self.apply_add_buddy(&mut txn, plan);
        self.commit(txn);
        Ok(())
    }

    fn plan_add_buddy(
        &self,
        buddy: NodeId,
        contact: Option<NodeId>,
        group: Option<NodeId>,
        after: Option<NodeId>,
    ) -> Result<Option<BuddyPlan>> {
        self.require(buddy, NodeType::Buddy)?;
        if after == Some(buddy) {
            return Ok(None);
        }

        let anchor = after.filter(|a| self.buddy(*a).is_some() && self.arena.is_attached(*a));
        let plan = if let Some(a) = anchor {
            let c = self.parent(a).ok_or(RosterError::NotAttached(a))?;
            BuddyPlan {
                buddy,
                target: ContactTarget::Existing(c),
                group: self.parent(c),
                anchor: Some(a),
            }
        } else if let Some(c) = contact {
            self.require(c, NodeType::Contact)?;
            if self.arena.is_attached(c) {
                BuddyPlan {
                    buddy,
                    target: ContactTarget::Existing(c),
                    group: self.parent(c),
                    anchor: None,
                }
            } else {
                BuddyPlan {
                    buddy,
                    target: ContactTarget::AttachDetached(c),
                    group: self.resolve_group(group)?,
                    anchor: None,
                }
            }
        } else {
            BuddyPlan {
                buddy,
                target: ContactTarget::Fresh,
                group: self.resolve_group(group)?,
                anchor: None,
            }
        };

        match plan.target {
            ContactTarget::Existing(c) if self.arena.is_at(buddy, plan.anchor, Some(c)) => return Ok(None),
            ContactTarget::Fresh if plan.group.is_some() && self.group_of(buddy) == plan.group => {
                return Ok(None)
            }
            _ => {}
        }

        if let (Some(g), Some(b)) = (plan.group, self.buddy(buddy)) {
            if let Some(other) = self.buddy_index.get(&b.account, &b.normalized, g) {
                if other != buddy {
                    return Err(RosterError::DuplicateBuddy {
                        account: b.account.clone(),
                        name: b.name.clone(),
                        group: g,
                    });
                }
            }
        }
        Ok(Some(plan))
    }

    fn resolve_group(&self, group: Option<NodeId>) -> Result<Option<NodeId>> {
        match group {
            Some(g) => {
                self.require_attached(g, NodeType::Group)?;
                Ok(Some(g))
            }
            None => Ok(self.default_group),
        }
    }

    fn apply_add_buddy(&mut self, txn: &mut Txn, plan: BuddyPlan) {
        let buddy = plan.buddy;
        let group = match plan.group {
            Some(g) => g,
            None => self.ensure_default_group(txn),
        };
        let contact = match plan.target {
            ContactTarget::Existing(c) => c,
            ContactTarget::AttachDetached(c) => {
                self.append_to_group(c, group);
                txn.added(c);
                c
            }
            ContactTarget::Fresh => {
                let c = self.new_contact();
                self.append_to_group(c, group);
                txn.added(c);
                c
            }
        };

        let old = self.detach_buddy(buddy);
        if let Some(account) = self.buddy(buddy).map(|b| b.account.clone()) {
            let connected = self.account_connected(&account);
            self.update_buddy_snapshot(buddy, connected);
        }
        self.arena.insert_after(buddy, plan.anchor, Some(contact));
        let c = counts::contribution(&self.arena, buddy);
        counts::apply_contribution(&mut self.arena, contact, c, 1);
        self.index_buddy(buddy, group);

        match old {
            Some((old_contact, old_group)) => {
                if old_group != group {
                    let (from, to) = (self.group_name(old_group), self.group_name(group));
                    if let Some(b) = self.buddy(buddy) {
                        self.services.server.move_buddy(b, &from, &to);
                    }
                }
                txn.updated(buddy);
                if old_contact != contact {
                    self.after_buddy_left(txn, old_contact);
                }
            }
            None => txn.added(buddy),
        }
        if self.refresh_priority(contact) {
            txn.updated(contact);
        }
        txn.touch();
    }

    fn append_to_group(&mut self, node: NodeId, group: NodeId) {
        let last = self.arena.last_child(Some(group));
        self.arena.insert_after(node, last, Some(group));
        let c = counts::contribution(&self.arena, node);
        counts::apply_contribution(&mut self.arena, group, c, 1);
    }

    /// Withdraw an attached buddy from its contact and the indices. Returns
    /// the old `(contact, group)`.
    fn detach_buddy(&mut self, buddy: NodeId) -> Option<(NodeId, NodeId)> {
        if !self.arena.is_attached(buddy) {
            return None;
        }
        let contact = self.parent(buddy)?;
        let group = self.parent(contact)?;
        let c = counts::contribution(&self.arena, buddy);
        counts::apply_contribution(&mut self.arena, contact, c, -1);
        self.arena.unlink(buddy);
        if let Some((account, name)) = self.buddy(buddy).map(|b| (b.account.clone(), b.normalized.clone())) {
            self.buddy_index.remove(&account, &name, group, buddy);
        }
        Some((contact, group))
    }

    fn index_buddy(&mut self, buddy: NodeId, group: NodeId) {
        if let Some((account, name)) = self.buddy(buddy).map(|b| (b.account.clone(), b.normalized.clone())) {
            self.buddy_index.insert(&account, &name, group, buddy);
        }
    }

    /// Cascade-remove an emptied contact, or re-elect its priority buddy.
    fn after_buddy_left(&mut self, txn: &mut Txn, contact: NodeId) {
        if self.arena.children(Some(contact)).next().is_none() {
            self.remove_contact_in(txn, contact);
        } else if self.refresh_priority(contact) {
            txn.updated(contact);
        }
    }

    pub(crate) fn group_name(&self, group: NodeId) -> String {
        self.group(group).map(|g| g.name.clone()).unwrap_or_default()
    }

    pub(crate) fn ensure_default_group(&mut self, txn: &mut Txn) -> NodeId {
        if let Some(g) = self.default_group {
            return g;
        }
        let name = self.config.default_group_name.clone();
        let g = self.arena.alloc(NodeKind::Group(Group {
            name,
            counters: Counters::default(),
        }));
        let last = self.arena.last_child(None);
        self.arena.insert_after(g, last, None);
        self.default_group = Some(g);
        self.index_group(g);
        txn.added(g);
        txn.touch();
        g
    }

    // -----------------------------------------------------------------------
    // add_contact / add_chat / add_group
    // -----------------------------------------------------------------------

    /// Place a contact into a group, after `after` (a contact or chat) or
    /// at the head of `group` (default group when `None`).
    ///
    /// On a group change every buddy already present in the destination is
    /// deleted here (and on the server); the rest move with the contact.
    pub fn add_contact(&mut self, contact: NodeId, group: Option<NodeId>, after: Option<NodeId>) -> Result<()> {
        self.require(contact, NodeType::Contact)?;
        if self.arena.children(Some(contact)).next().is_none() {
            return Err(RosterError::EmptyContact(contact));
        }
        let Some(plan) = self.plan_group_child(contact, group, after)? else {
            return Ok(());
        };
        let mut txn = Txn::default();
        self.apply_add_contact(&mut txn, plan);
        self.commit(txn);
        Ok(())
    }

    pub fn add_chat(&mut self, chat: NodeId, group: Option<NodeId>, after: Option<NodeId>) -> Result<()> {
        self.require(chat, NodeType::Chat)?;
        let Some(plan) = self.plan_group_child(chat, group, after)? else {
            return Ok(());
        };
        let mut txn = Txn::default();
        self.apply_add_chat(&mut txn, plan);
        self.commit(txn);
        Ok(())
    }

    fn plan_group_child(&self, node: NodeId, group: Option<NodeId>, after: Option<NodeId>) -> Result<Option<PlacePlan>> {
        if after == Some(node) {
            return Ok(None);
        }
        let anchor = after.filter(|a| {
            self.arena.is_attached(*a)
                && matches!(
                    self.node(*a).map(Node::node_type),
                    Some(NodeType::Contact) | Some(NodeType::Chat)
                )
        });
        let (dest, anchor) = match anchor {
            Some(a) => (self.parent(a), Some(a)),
            None => (self.resolve_group(group)?, None),
        };
        if let Some(d) = dest {
            if self.arena.is_at(node, anchor, Some(d)) {
                return Ok(None);
            }
        }
        Ok(Some(PlacePlan { node, group: dest, anchor }))
    }

    fn apply_add_contact(&mut self, txn: &mut Txn, plan: PlacePlan) {
        let contact = plan.node;
        let dest = match plan.group {
            Some(g) => g,
            None => self.ensure_default_group(txn),
        };
        let old_group = if self.arena.is_attached(contact) {
            self.parent(contact)
        } else {
            None
        };

        match old_group {
            Some(og) if og != dest => {
                // Classify every buddy before touching any of them.
                let (dupes, migrants): (Vec<NodeId>, Vec<NodeId>) =
                    self.arena.children(Some(contact)).partition(|b| {
                        self.buddy(*b)
                            .and_then(|bd| self.buddy_index.get(&bd.account, &bd.normalized, dest))
                            .is_some()
                    });
                let (from, to) = (self.group_name(og), self.group_name(dest));

                for b in dupes {
                    if let Some(bd) = self.buddy(b) {
                        log::debug!("dropping duplicate {} '{}' from '{}'", bd.account, bd.name, from);
                        self.services.server.remove_buddy(bd, &from);
                    }
                    self.remove_buddy_in(txn, b);
                }
                if migrants.is_empty() {
                    // The contact went away with its last duplicate.
                    return;
                }

                let c = counts::contribution(&self.arena, contact);
                counts::apply_contribution(&mut self.arena, og, c, -1);
                self.arena.unlink(contact);
                for b in &migrants {
                    if let Some((account, name)) = self.buddy(*b).map(|bd| (bd.account.clone(), bd.normalized.clone())) {
                        self.buddy_index.remove(&account, &name, og, *b);
                        self.buddy_index.insert(&account, &name, dest, *b);
                    }
                    if let Some(bd) = self.buddy(*b) {
                        self.services.server.move_buddy(bd, &from, &to);
                    }
                }
                self.arena.insert_after(contact, plan.anchor, Some(dest));
                counts::apply_contribution(&mut self.arena, dest, c, 1);
                txn.updated(contact);
                for b in migrants {
                    txn.updated(b);
                }
            }
            Some(og) => {
                let c = counts::contribution(&self.arena, contact);
                counts::apply_contribution(&mut self.arena, og, c, -1);
                self.arena.unlink(contact);
                self.arena.insert_after(contact, plan.anchor, Some(dest));
                counts::apply_contribution(&mut self.arena, dest, c, 1);
                txn.updated(contact);
            }
            None => {
                self.arena.insert_after(contact, plan.anchor, Some(dest));
                let c = counts::contribution(&self.arena, contact);
                counts::apply_contribution(&mut self.arena, dest, c, 1);
                txn.added(contact);
            }
        }
        txn.touch();
    }

    fn apply_add_chat(&mut self, txn: &mut Txn, plan: PlacePlan) {
        let chat = plan.node;
        let dest = match plan.group {
            Some(g) => g,
            None => self.ensure_default_group(txn),
        };
        let was_attached = self.arena.is_attached(chat);
        if was_attached {
            if let Some(og) = self.parent(chat) {
                let c = counts::contribution(&self.arena, chat);
                counts::apply_contribution(&mut self.arena, og, c, -1);
            }
            self.arena.unlink(chat);
        }
        if let Some(account) = self.chat(chat).map(|c| c.account.clone()) {
            let connected = self.account_connected(&account);
            self.update_chat_snapshot(chat, connected);
        }
        self.arena.insert_after(chat, plan.anchor, Some(dest));
        let c = counts::contribution(&self.arena, chat);
        counts::apply_contribution(&mut self.arena, dest, c, 1);
        if was_attached {
            txn.updated(chat);
        } else {
            txn.added(chat);
        }
        txn.touch();
    }

    /// Place a group in the top-level list after `after`, or at the head.
    pub fn add_group(&mut self, group: NodeId, after: Option<NodeId>) -> Result<()> {
        let name = self
            .require(group, NodeType::Group)?
            .as_group()
            .map(|g| g.name.clone())
            .unwrap_or_default();
        if after == Some(group) {
            return Ok(());
        }
        let anchor = after.filter(|a| self.group(*a).is_some() && self.arena.is_attached(*a));
        if let Some(existing) = self.group_index.get(&name) {
            if existing != group {
                return Err(RosterError::DuplicateGroup(name));
            }
        }
        if self.arena.is_at(group, anchor, None) {
            return Ok(());
        }

        let mut txn = Txn::default();
        if self.arena.is_attached(group) {
            self.arena.unlink(group);
            self.arena.insert_after(group, anchor, None);
            txn.updated(group);
        } else {
            self.arena.insert_after(group, anchor, None);
            self.index_group(group);
            txn.added(group);
        }
        txn.touch();
        self.commit(txn);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    pub fn remove_buddy(&mut self, buddy: NodeId) -> Result<()> {
        self.require(buddy, NodeType::Buddy)?;
        let mut txn = Txn::default();
        if self.arena.is_attached(buddy) {
            self.remove_buddy_in(&mut txn, buddy);
        } else {
            txn.discard(buddy);
        }
        self.commit(txn);
        Ok(())
    }

    /// Remove a contact with every buddy it holds.
    pub fn remove_contact(&mut self, contact: NodeId) -> Result<()> {
        self.require(contact, NodeType::Contact)?;
        let mut txn = Txn::default();
        if self.arena.is_attached(contact) {
            self.remove_contact_in(&mut txn, contact);
        } else {
            txn.discard(contact);
        }
        self.commit(txn);
        Ok(())
    }

    pub fn remove_chat(&mut self, chat: NodeId) -> Result<()> {
        self.require(chat, NodeType::Chat)?;
        let mut txn = Txn::default();
        if self.arena.is_attached(chat) {
            if let Some(group) = self.parent(chat) {
                let c = counts::contribution(&self.arena, chat);
                counts::apply_contribution(&mut self.arena, group, c, -1);
            }
            self.arena.unlink(chat);
            txn.removed(chat);
            txn.touch();
        } else {
            txn.discard(chat);
        }
        self.commit(txn);
        Ok(())
    }

    /// Remove an empty group. Returns `Ok(false)` (and logs) when the group
    /// still has children.
    pub fn remove_group(&mut self, group: NodeId) -> Result<bool> {
        self.require(group, NodeType::Group)?;
        if self.arena.children(Some(group)).next().is_some() {
            log::warn!(
                "refusing to remove group '{}' ({}): it still has children",
                self.group_name(group),
                group
            );
            return Ok(false);
        }
        let mut txn = Txn::default();
        if self.arena.is_attached(group) {
            self.remove_group_in(&mut txn, group);
        } else {
            txn.discard(group);
        }
        self.commit(txn);
        Ok(true)
    }

    pub(crate) fn remove_buddy_in(&mut self, txn: &mut Txn, buddy: NodeId) {
        let old = self.detach_buddy(buddy);
        txn.removed(buddy);
        if let Some((contact, _)) = old {
            self.after_buddy_left(txn, contact);
        }
        txn.touch();
    }

    fn remove_contact_in(&mut self, txn: &mut Txn, contact: NodeId) {
        let buddies: Vec<NodeId> = self.arena.children(Some(contact)).collect();
        if buddies.is_empty() {
            if let Some(group) = self.parent(contact) {
                let c = counts::contribution(&self.arena, contact);
                counts::apply_contribution(&mut self.arena, group, c, -1);
            }
            self.arena.unlink(contact);
            txn.removed(contact);
            txn.touch();
            return;
        }
        // The last buddy's removal cascades into the empty branch above.
        for b in buddies {
            self.remove_buddy_in(txn, b);
        }
    }

    fn remove_group_in(&mut self, txn: &mut Txn, group: NodeId) {
        let name = self.group_name(group);
        self.arena.unlink(group);
        self.unindex_group(group);
        for account in self.services.accounts.accounts() {
            if self.account_connected(&account) {
                self.services.server.remove_group(&account, &name);
            }
        }
        txn.removed(group);
        txn.touch();
    }

    // -----------------------------------------------------------------------
    // Renames & merges
    // -----------------------------------------------------------------------

    pub fn rename_buddy(&mut self, buddy: NodeId, new_name: &str) -> Result<()> {
        let (account, old_norm, old_name) = {
            let b = self
                .require(buddy, NodeType::Buddy)?
                .as_buddy()
                .ok_or(RosterError::WrongKind { node: buddy, expected: NodeType::Buddy })?;
            (b.account.clone(), b.normalized.clone(), b.name.clone())
        };
        if old_name == new_name {
            return Ok(());
        }
        let new_norm = self.normalize(&account, new_name);
        let group = if self.arena.is_attached(buddy) {
            self.group_of(buddy)
        } else {
            None
        };
        if let Some(g) = group {
            if let Some(other) = self.buddy_index.get(&account, &new_norm, g) {
                if other != buddy {
                    return Err(RosterError::DuplicateBuddy {
                        account,
                        name: new_name.to_string(),
                        group: g,
                    });
                }
            }
        }

        let mut txn = Txn::default();
        if let Some(g) = group {
            self.buddy_index.remove(&account, &old_norm, g, buddy);
        }
        if let Some(b) = self.arena.get_mut(buddy).and_then(Node::as_buddy_mut) {
            b.name = new_name.to_string();
            b.normalized = new_norm.clone();
        }
        if let Some(g) = group {
            self.buddy_index.insert(&account, &new_norm, g, buddy);
            txn.updated(buddy);
            txn.touch();
        }
        self.commit(txn);
        Ok(())
    }

    /// Rename a group. When another group already answers to `new_name`,
    /// everything moves into that group and this one is removed.
    pub fn rename_group(&mut self, group: NodeId, new_name: &str) -> Result<()> {
        let old_name = self
            .require(group, NodeType::Group)?
            .as_group()
            .map(|g| g.name.clone())
            .unwrap_or_default();
        if old_name == new_name {
            return Ok(());
        }
        let attached = self.arena.is_attached(group);
        let mut txn = Txn::default();

        match self.group_index.get(new_name) {
            Some(dest) if dest != group && attached => {
                log::info!("merging group '{}' into '{}'", old_name, self.group_name(dest));
                self.merge_group_into(&mut txn, group, dest);
            }
            _ => {
                let accounts = if attached { self.group_accounts(group) } else { Vec::new() };
                if attached {
                    self.unindex_group(group);
                }
                if let Some(g) = self.arena.get_mut(group).and_then(Node::as_group_mut) {
                    g.name = new_name.to_string();
                }
                if attached {
                    self.index_group(group);
                    for account in &accounts {
                        self.services.server.rename_group(account, &old_name, new_name);
                    }
                    txn.updated(group);
                    txn.touch();
                }
            }
        }
        self.commit(txn);
        Ok(())
    }

    pub(crate) fn merge_group_into(&mut self, txn: &mut Txn, source: NodeId, dest: NodeId) {
        let children: Vec<NodeId> = self.arena.children(Some(source)).collect();
        for child in children {
            let plan = PlacePlan {
                node: child,
                group: Some(dest),
                anchor: self.arena.last_child(Some(dest)),
            };
            match self.node(child).map(Node::node_type) {
                Some(NodeType::Contact) => self.apply_add_contact(txn, plan),
                Some(NodeType::Chat) => self.apply_add_chat(txn, plan),
                _ => {}
            }
        }
        self.remove_group_in(txn, source);
    }

    /// Move every buddy of `source` into the contact of `target` (a contact,
    /// or a buddy standing for its contact). Buddies already present in the
    /// target's group are deleted instead.
    pub fn merge_contact(&mut self, source: NodeId, target: NodeId) -> Result<()> {
        self.require_attached(source, NodeType::Contact)?;
        let target_contact = match self.node(target).map(Node::node_type) {
            None => return Err(RosterError::UnknownNode(target)),
            Some(NodeType::Contact) => target,
            Some(NodeType::Buddy) => self.parent(target).ok_or(RosterError::NotAttached(target))?,
            Some(_) => {
                return Err(RosterError::WrongKind {
                    node: target,
                    expected: NodeType::Contact,
                })
            }
        };
        self.require_attached(target_contact, NodeType::Contact)?;
        if source == target_contact {
            return Ok(());
        }
        let dest_group = self.parent(target_contact);
        let source_group = self.parent(source).map(|g| self.group_name(g)).unwrap_or_default();

        let mut txn = Txn::default();
        let buddies: Vec<NodeId> = self.arena.children(Some(source)).collect();
        for b in buddies {
            let duplicate = match (dest_group, self.buddy(b)) {
                (Some(g), Some(bd)) => self
                    .buddy_index
                    .get(&bd.account, &bd.normalized, g)
                    .filter(|other| *other != b)
                    .is_some(),
                _ => false,
            };
            if duplicate {
                if let Some(bd) = self.buddy(b) {
                    self.services.server.remove_buddy(bd, &source_group);
                }
                self.remove_buddy_in(&mut txn, b);
            } else {
                let plan = BuddyPlan {
                    buddy: b,
                    target: ContactTarget::Existing(target_contact),
                    group: dest_group,
                    anchor: self.arena.last_child(Some(target_contact)),
                };
                self.apply_add_buddy(&mut txn, plan);
            }
        }
        self.commit(txn);
        Ok(())
    }

    /// Change the localized name of the default group. A different group
    /// already using that name is merged into the default group.
    pub fn set_localized_default_group_name(&mut self, name: Option<String>) {
        let mut txn = Txn::default();
        if let Some(default) = self.default_group {
            if let Some(old) = self.config.localized_default_group_name.clone() {
                let stored = self.group_name(default);
                let folded = fold_name(&old);
                let keep = folded == fold_name(&stored) || folded == fold_name(&self.config.default_group_name);
                if !keep {
                    self.group_index.remove(&old, default);
                }
            }
        }
        self.config.localized_default_group_name = name.clone();

        match (self.default_group, name) {
            (Some(default), Some(new)) => {
                if let Some(other) = self.group_index.get(&new).filter(|g| *g != default) {
                    log::info!("localized default group name '{}' merges {} into {}", new, other, default);
                    self.merge_group_into(&mut txn, other, default);
                }
                self.claim_alias(&new, default);
                txn.updated(default);
            }
            (None, Some(new)) => {
                // A group already answering to the new name takes the default role.
                if let Some(owner) = self.group_index.get(&new) {
                    log::info!("group {} answers to '{}' and becomes the default group", owner, new);
                    self.default_group = Some(owner);
                    self.index_group(owner);
                    txn.updated(owner);
                    txn.touch();
                }
            }
            _ => {}
        }
        self.commit(txn);
    }

    // -----------------------------------------------------------------------
    // Aliases, settings, transient flag
    // -----------------------------------------------------------------------

    pub fn alias_buddy(&mut self, buddy: NodeId, alias: Option<&str>) -> Result<()> {
        self.require(buddy, NodeType::Buddy)?;
        let value = clean(alias);
        let changed = self
            .arena
            .get_mut(buddy)
            .and_then(Node::as_buddy_mut)
            .map(|b| replace_if_changed(&mut b.alias, value))
            .unwrap_or(false);
        self.finish_edit(buddy, changed, true);
        Ok(())
    }

    /// Alias reported by the server for this buddy.
    pub fn server_alias_buddy(&mut self, buddy: NodeId, alias: Option<&str>) -> Result<()> {
        self.require(buddy, NodeType::Buddy)?;
        let value = clean(alias);
        let changed = self
            .arena
            .get_mut(buddy)
            .and_then(Node::as_buddy_mut)
            .map(|b| replace_if_changed(&mut b.server_alias, value))
            .unwrap_or(false);
        self.finish_edit(buddy, changed, true);
        Ok(())
    }

    pub fn alias_contact(&mut self, contact: NodeId, alias: Option<&str>) -> Result<()> {
        self.require(contact, NodeType::Contact)?;
        let value = clean(alias);
        let changed = self
            .arena
            .get_mut(contact)
            .and_then(Node::as_contact_mut)
            .map(|c| replace_if_changed(&mut c.alias, value))
            .unwrap_or(false);
        self.finish_edit(contact, changed, true);
        Ok(())
    }

    pub fn alias_chat(&mut self, chat: NodeId, alias: Option<&str>) -> Result<()> {
        self.require(chat, NodeType::Chat)?;
        let value = clean(alias);
        let changed = self
            .arena
            .get_mut(chat)
            .and_then(Node::as_chat_mut)
            .map(|c| replace_if_changed(&mut c.alias, value))
            .unwrap_or(false);
        self.finish_edit(chat, changed, true);
        Ok(())
    }

    pub fn set_setting(&mut self, node: NodeId, key: &str, value: SettingValue) -> Result<()> {
        let n = self.arena.get_mut(node).ok_or(RosterError::UnknownNode(node))?;
        let changed = n.settings.get(key) != Some(&value);
        if changed {
            n.settings.insert(key.to_string(), value);
        }
        self.finish_edit(node, changed, false);
        Ok(())
    }

    pub fn remove_setting(&mut self, node: NodeId, key: &str) -> Result<()> {
        let n = self.arena.get_mut(node).ok_or(RosterError::UnknownNode(node))?;
        let changed = n.settings.remove(key).is_some();
        self.finish_edit(node, changed, false);
        Ok(())
    }

    /// Transient nodes stay in the tree but are left out of saved documents.
    pub fn set_transient(&mut self, node: NodeId, transient: bool) -> Result<()> {
        let n = self.arena.get_mut(node).ok_or(RosterError::UnknownNode(node))?;
        let changed = n.transient != transient;
        n.transient = transient;
        self.finish_edit(node, changed, false);
        Ok(())
    }

    /// Commit a single-node edit: save only when the value changed and the
    /// node is part of the tree.
    fn finish_edit(&mut self, node: NodeId, changed: bool, visible: bool) {
        if !changed || !self.arena.is_attached(node) {
            return;
        }
        let mut txn = Txn::default();
        if visible {
            txn.updated(node);
        }
        txn.touch();
        self.commit(txn);
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    /// Re-query the presence of one buddy and fix the counters above it.
    pub fn refresh_buddy_presence(&mut self, buddy: NodeId) -> Result<()> {
        let account = self
            .require(buddy, NodeType::Buddy)?
            .account()
            .cloned()
            .ok_or(RosterError::WrongKind { node: buddy, expected: NodeType::Buddy })?;
        let connected = self.account_connected(&account);
        let mut txn = Txn::default();
        if self.update_buddy_snapshot(buddy, connected) && self.arena.is_attached(buddy) {
            txn.updated(buddy);
        }
        if let Some(contact) = self.parent(buddy) {
            if self.refresh_priority(contact) {
                txn.updated(contact);
            }
        }
        self.commit(txn);
        Ok(())
    }

    /// Re-query an account's connection state and refresh every buddy and
    /// chat on it.
    pub fn refresh_account(&mut self, account: &AccountId) {
        let connected = self.account_connected(account);
        log::debug!("refreshing {} (connected={})", account, connected);
        let nodes: Vec<NodeId> = self
            .walk()
            .filter(|id| self.node(*id).and_then(Node::account) == Some(account))
            .collect();

        let mut txn = Txn::default();
        let mut contacts = Vec::new();
        for id in nodes {
            match self.node(id).map(Node::node_type) {
                Some(NodeType::Buddy) => {
                    if self.update_buddy_snapshot(id, connected) {
                        txn.updated(id);
                    }
                    if let Some(c) = self.parent(id) {
                        if !contacts.contains(&c) {
                            contacts.push(c);
                        }
                    }
                }
                Some(NodeType::Chat) => {
                    if self.update_chat_snapshot(id, connected) {
                        txn.updated(id);
                    }
                }
                _ => {}
            }
        }
        for contact in contacts {
            if self.refresh_priority(contact) {
                txn.updated(contact);
            }
        }
        self.commit(txn);
    }

    /// Store a new connected/online snapshot and push the difference into
    /// the parent contact's counters. Returns whether anything changed.
    fn update_buddy_snapshot(&mut self, buddy: NodeId, connected: bool) -> bool {
        let Some((old_connected, old_online, online)) = self
            .buddy(buddy)
            .map(|b| (b.connected, b.online, connected && self.services.presence.is_online(b)))
        else {
            return false;
        };
        if (old_connected, old_online) == (connected, online) {
            return false;
        }
        if let Some(b) = self.arena.get_mut(buddy).and_then(Node::as_buddy_mut) {
            b.connected = connected;
            b.online = online;
        }
        if self.arena.is_attached(buddy) {
            if let Some(contact) = self.parent(buddy) {
                counts::change_current(&mut self.arena, contact, i32::from(connected) - i32::from(old_connected));
                counts::change_online(&mut self.arena, contact, i32::from(online) - i32::from(old_online));
            }
        }
        true
    }

    fn update_chat_snapshot(&mut self, chat: NodeId, connected: bool) -> bool {
        let Some(old) = self.chat(chat).map(|c| c.connected) else {
            return false;
        };
        if old == connected {
            return false;
        }
        if let Some(c) = self.arena.get_mut(chat).and_then(Node::as_chat_mut) {
            c.connected = connected;
        }
        if self.arena.is_attached(chat) {
            if let Some(group) = self.parent(chat) {
                let delta = i32::from(connected) - i32::from(old);
                counts::change_current(&mut self.arena, group, delta);
                counts::change_online(&mut self.arena, group, delta);
            }
        }
        true
    }

    /// Re-elect a contact's priority buddy: connected beats disconnected,
    /// then higher presence rank, then earlier sibling. Returns whether the
    /// choice changed.
    pub(crate) fn refresh_priority(&mut self, contact: NodeId) -> bool {
        let mut best: Option<(NodeId, (bool, u8))> = None;
        for b in self.arena.children(Some(contact)) {
            let Some(buddy) = self.buddy(b) else {
                continue;
            };
            let rank = if buddy.connected {
                self.services.presence.presence_rank(buddy)
            } else {
                0
            };
            let key = (buddy.connected, rank);
            match best {
                Some((_, current)) if current >= key => {}
                _ => best = Some((b, key)),
            }
        }
        let chosen = best.map(|(b, _)| b);
        match self.arena.get_mut(contact).and_then(Node::as_contact_mut) {
            Some(c) if c.priority != chosen => {
                c.priority = chosen;
                true
            }
            _ => false,
        }
    }
}

fn replace_if_changed(slot: &mut Option<String>, value: Option<String>) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RosterConfig;
    use crate::roster::state::RosterEvent;
    use crate::roster::test_support::{account, Harness};
    use proptest::prelude::*;

    fn counters(h: &Harness, id: NodeId) -> Counters {
        h.roster.counters(id).unwrap()
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[test]
    fn test_add_buddy_without_destination_uses_default_group() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let _work = h.attached_group("Work");
        let alice = h.roster.new_buddy(me.clone(), "alice", None);

        h.roster.add_buddy(alice, None, None, None).unwrap();

        let default = h.roster.default_group().unwrap();
        let contact = h.roster.contact_of(alice).unwrap();
        assert_eq!(h.roster.parent(contact), Some(default));
        assert_eq!(counters(&h, default).total, 1);
        assert_eq!(h.roster.find_buddy(&me, "alice"), Some(alice));
        assert_eq!(h.saves.count(), 2);
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_online_buddy_counts_through_contact_and_group() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let seed = h.roster.new_buddy(me.clone(), "seed", None);
        h.roster.add_buddy(seed, None, Some(work), None).unwrap();
        let c1 = h.roster.contact_of(seed).unwrap();
        h.roster.remove_buddy(seed).unwrap();
        assert!(h.roster.contact(c1).is_none());

        let c1 = h.roster.new_contact();
        let bob = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(bob, Some(c1), Some(work), None).unwrap();
        assert_eq!(h.roster.parent(c1), Some(work));

        h.accounts.connect(&me);
        h.presence.set_online("bob", true);
        h.roster.refresh_account(&me);

        assert_eq!(counters(&h, c1), Counters { total: 1, current: 1, online: 1 });
        assert_eq!(counters(&h, work), Counters { total: 1, current: 1, online: 1 });
        assert_eq!(h.roster.priority_buddy(c1), Some(bob));
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_move_buddy_between_groups_cascades_contact() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let home = h.attached_group("Home");
        let bob = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(bob, None, Some(work), None).unwrap();
        let c1 = h.roster.contact_of(bob).unwrap();
        h.observer.clear();

        h.roster.add_buddy(bob, None, Some(home), None).unwrap();

        assert_eq!(counters(&h, work).total, 0);
        assert_eq!(counters(&h, home).total, 1);
        assert!(h.roster.contact(c1).is_none());
        assert_eq!(h.server.moves(), vec![("bob".to_string(), "Work".to_string(), "Home".to_string())]);
        assert!(h.observer.events().contains(&RosterEvent::Removed(c1)));
        assert_eq!(h.roster.find_buddy_in_group(&me, "bob", home), Some(bob));
        assert_eq!(h.roster.find_buddy_in_group(&me, "bob", work), None);
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_default_group_alias_survives_localized_reload() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let alice = h.roster.new_buddy(me, "alice", None);
        h.roster.add_buddy(alice, None, None, None).unwrap();
        let default = h.roster.default_group().unwrap();

        h.roster.set_localized_default_group_name(Some("Amigos".into()));
        assert_eq!(h.roster.find_group(Some("Buddies")), Some(default));
        assert_eq!(h.roster.find_group(None), Some(default));
        assert_eq!(h.roster.find_group(Some("amigos")), Some(default));
        assert_eq!(h.roster.group_display_name(default), Some("Amigos"));

        h.roster.set_localized_default_group_name(Some("Kumpels".into()));
        assert_eq!(h.roster.find_group(Some("Amigos")), None);
        assert_eq!(h.roster.find_group(Some("Kumpels")), Some(default));
        assert_eq!(h.roster.find_group(Some("Buddies")), Some(default));
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_localized_name_merges_existing_group() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let alice = h.roster.new_buddy(me.clone(), "alice", None);
        h.roster.add_buddy(alice, None, None, None).unwrap();
        let default = h.roster.default_group().unwrap();
        let amigos = h.attached_group("Amigos");
        let bob = h.roster.new_buddy(me, "bob", None);
        h.roster.add_buddy(bob, None, Some(amigos), None).unwrap();

        h.roster.set_localized_default_group_name(Some("Amigos".into()));

        assert!(h.roster.group(amigos).is_none());
        assert_eq!(h.roster.group_of(bob), Some(default));
        assert_eq!(counters(&h, default).total, 2);
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_cascades_contact_but_not_group() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let bob = h.roster.new_buddy(me, "bob", None);
        h.roster.add_buddy(bob, None, Some(work), None).unwrap();
        let contact = h.roster.contact_of(bob).unwrap();

        h.roster.remove_buddy(bob).unwrap();
        assert!(h.roster.contact(contact).is_none());
        assert!(h.roster.buddy(bob).is_none());
        assert!(h.roster.group(work).is_some());
        assert_eq!(h.roster.children(work).count(), 0);

        assert!(h.roster.remove_group(work).unwrap());
        assert!(h.roster.find_group(Some("Work")).is_none());
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_contact_removes_buddies_before_contact() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let bob = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(bob, None, Some(work), None).unwrap();
        let carol = h.roster.new_buddy(me.clone(), "carol", None);
        h.roster.add_buddy(carol, None, None, Some(bob)).unwrap();
        let contact = h.roster.contact_of(bob).unwrap();
        h.observer.clear();
        let saves = h.saves.count();

        h.roster.remove_contact(contact).unwrap();

        let events = h.observer.events();
        let at = |e: RosterEvent| events.iter().position(|x| *x == e).unwrap();
        assert!(at(RosterEvent::Removed(bob)) < at(RosterEvent::Removed(contact)));
        assert!(at(RosterEvent::Removed(carol)) < at(RosterEvent::Removed(contact)));
        assert_eq!(events.last(), Some(&RosterEvent::Removed(contact)));

        assert!(h.roster.contact(contact).is_none());
        assert_eq!(counters(&h, work).total, 0);
        assert_eq!(h.roster.find_buddy(&me, "bob"), None);
        assert_eq!(h.roster.find_buddy(&me, "carol"), None);
        assert!(h.roster.buddy_index().is_empty());
        assert_eq!(h.saves.count(), saves + 1);
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_localized_name_promotes_existing_group_before_default_exists() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let amigos = h.attached_group("Amigos");
        assert_eq!(h.roster.default_group(), None);

        h.roster.set_localized_default_group_name(Some("Amigos".into()));
        let alice = h.roster.new_buddy(me, "alice", None);
        h.roster.add_buddy(alice, None, None, None).unwrap();

        assert_eq!(h.roster.default_group(), Some(amigos));
        assert_eq!(h.roster.find_group(None), Some(amigos));
        assert_eq!(h.roster.find_group(Some("Amigos")), Some(amigos));
        assert_eq!(h.roster.find_group(Some("Buddies")), Some(amigos));
        assert_eq!(h.roster.group_of(alice), Some(amigos));
        assert_eq!(h.roster.groups().collect::<Vec<_>>(), vec![amigos]);
        h.roster.check_invariants().unwrap();
    }

    // -----------------------------------------------------------------------
    // add_buddy
    // -----------------------------------------------------------------------

    #[test]
    fn test_add_buddy_same_position_is_silent() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let a = h.roster.new_buddy(me.clone(), "a", None);
        let b = h.roster.new_buddy(me, "b", None);
        h.roster.add_buddy(a, None, Some(work), None).unwrap();
        let contact = h.roster.contact_of(a).unwrap();
        h.roster.add_buddy(b, None, None, Some(a)).unwrap();
        let before = (counters(&h, contact), counters(&h, work));
        h.observer.clear();
        let saves = h.saves.count();

        h.roster.add_buddy(b, None, None, Some(a)).unwrap();
        h.roster.add_buddy(a, Some(contact), None, None).unwrap();
        h.roster.add_buddy(a, None, Some(work), None).unwrap();

        assert_eq!((counters(&h, contact), counters(&h, work)), before);
        assert!(h.observer.events().is_empty());
        assert_eq!(h.saves.count(), saves);
    }

    #[test]
    fn test_add_buddy_after_buddy_ignores_explicit_destination() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let home = h.attached_group("Home");
        let a = h.roster.new_buddy(me.clone(), "a", None);
        h.roster.add_buddy(a, None, Some(work), None).unwrap();
        let b = h.roster.new_buddy(me, "b", None);

        h.roster.add_buddy(b, None, Some(home), Some(a)).unwrap();

        let contact = h.roster.contact_of(a).unwrap();
        assert_eq!(h.roster.contact_of(b), Some(contact));
        assert_eq!(h.roster.children(contact).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(counters(&h, work).total, 2);
        assert_eq!(counters(&h, home).total, 0);
    }

    #[test]
    fn test_add_buddy_rejects_duplicate_in_group() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let first = h.roster.new_buddy(me.clone(), "bob", None);
        let second = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(first, None, Some(work), None).unwrap();

        let err = h.roster.add_buddy(second, None, Some(work), None).unwrap_err();
        assert!(matches!(err, RosterError::DuplicateBuddy { group, .. } if group == work));
        assert!(!h.roster.is_attached(second));
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_add_buddy_into_detached_group_fails() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let loose = h.roster.new_group("Loose");
        let bob = h.roster.new_buddy(me, "bob", None);
        assert_eq!(
            h.roster.add_buddy(bob, None, Some(loose), None).unwrap_err(),
            RosterError::NotAttached(loose)
        );
        assert!(h.roster.default_group().is_none());
    }

    #[test]
    fn test_moving_within_contact_keeps_contact() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let a = h.roster.new_buddy(me.clone(), "a", None);
        let b = h.roster.new_buddy(me, "b", None);
        h.roster.add_buddy(a, None, Some(work), None).unwrap();
        h.roster.add_buddy(b, None, None, Some(a)).unwrap();
        let contact = h.roster.contact_of(a).unwrap();

        h.roster.add_buddy(b, Some(contact), None, None).unwrap();
        assert_eq!(h.roster.children(contact).collect::<Vec<_>>(), vec![b, a]);
        assert!(h.server.moves().is_empty());
        h.roster.check_invariants().unwrap();
    }

    // -----------------------------------------------------------------------
    // add_contact
    // -----------------------------------------------------------------------

    #[test]
    fn test_add_contact_merges_duplicates_and_migrates_rest() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let home = h.attached_group("Home");

        // Home already knows bob.
        let bob_home = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(bob_home, None, Some(home), None).unwrap();

        // Work contact holds bob (duplicate) sandwiched between two others.
        let carol = h.roster.new_buddy(me.clone(), "carol", None);
        h.roster.add_buddy(carol, None, Some(work), None).unwrap();
        let contact = h.roster.contact_of(carol).unwrap();
        let bob_work = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(bob_work, None, None, Some(carol)).unwrap();
        let dave = h.roster.new_buddy(me.clone(), "dave", None);
        h.roster.add_buddy(dave, None, None, Some(bob_work)).unwrap();

        h.roster.add_contact(contact, Some(home), None).unwrap();

        assert!(h.roster.buddy(bob_work).is_none());
        assert_eq!(h.roster.parent(contact), Some(home));
        assert_eq!(h.roster.children(contact).collect::<Vec<_>>(), vec![carol, dave]);
        assert_eq!(h.server.removed_buddies(), vec![("bob".to_string(), "Work".to_string())]);
        assert_eq!(h.server.moves().len(), 2);
        assert_eq!(counters(&h, work).total, 0);
        assert_eq!(counters(&h, home).total, 3);
        assert_eq!(h.roster.find_buddy_in_group(&me, "dave", home), Some(dave));
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_add_contact_all_duplicates_removes_contact() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let home = h.attached_group("Home");
        let home_bob = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(home_bob, None, Some(home), None).unwrap();
        let work_bob = h.roster.new_buddy(me, "bob", None);
        h.roster.add_buddy(work_bob, None, Some(work), None).unwrap();
        let contact = h.roster.contact_of(work_bob).unwrap();

        h.roster.add_contact(contact, Some(home), None).unwrap();

        assert!(h.roster.contact(contact).is_none());
        assert_eq!(counters(&h, home).total, 1);
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_add_contact_reorders_within_group() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let a = h.roster.new_buddy(me.clone(), "a", None);
        let b = h.roster.new_buddy(me, "b", None);
        h.roster.add_buddy(a, None, Some(work), None).unwrap();
        h.roster.add_buddy(b, None, Some(work), None).unwrap();
        let (ca, cb) = (h.roster.contact_of(a).unwrap(), h.roster.contact_of(b).unwrap());
        assert_eq!(h.roster.children(work).collect::<Vec<_>>(), vec![ca, cb]);

        h.roster.add_contact(cb, Some(work), None).unwrap();
        assert_eq!(h.roster.children(work).collect::<Vec<_>>(), vec![cb, ca]);
        assert_eq!(counters(&h, work).total, 2);
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_add_empty_contact_is_rejected() {
        let mut h = Harness::new();
        let c = h.roster.new_contact();
        assert_eq!(h.roster.add_contact(c, None, None).unwrap_err(), RosterError::EmptyContact(c));
        h.roster.discard(c).unwrap();
        assert!(h.roster.node(c).is_none());
    }

    // -----------------------------------------------------------------------
    // Groups & chats
    // -----------------------------------------------------------------------

    #[test]
    fn test_add_group_reorder_and_duplicate() {
        let mut h = Harness::new();
        let work = h.attached_group("Work");
        let home = h.roster.new_group("Home");
        h.roster.add_group(home, Some(work)).unwrap();
        assert_eq!(h.roster.groups().collect::<Vec<_>>(), vec![work, home]);

        h.observer.clear();
        h.roster.add_group(home, None).unwrap();
        assert_eq!(h.roster.groups().collect::<Vec<_>>(), vec![home, work]);
        assert_eq!(h.observer.events(), vec![RosterEvent::Updated(home)]);

        assert_eq!(h.roster.new_group("WORK"), work);
        let twin = h.roster.new_group("Twin");
        h.roster.rename_group(twin, "work").unwrap();
        assert_eq!(
            h.roster.add_group(twin, None).unwrap_err(),
            RosterError::DuplicateGroup("work".into())
        );
    }

    #[test]
    fn test_remove_non_empty_group_is_refused() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        h.accounts.connect(&me);
        let work = h.attached_group("Work");
        let bob = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(bob, None, Some(work), None).unwrap();

        assert!(!h.roster.remove_group(work).unwrap());
        assert!(h.roster.group(work).is_some());

        h.roster.remove_buddy(bob).unwrap();
        assert!(h.roster.remove_group(work).unwrap());
        assert_eq!(h.server.removed_groups(), vec![(me, "Work".to_string())]);
    }

    #[test]
    fn test_chat_counts_follow_connection() {
        let mut h = Harness::new();
        let me = account("irc", "me");
        let g = h.attached_group("Chats");
        let chat = h.roster.new_chat(me.clone(), Some("Rust"), BTreeMap::new());
        h.roster.add_chat(chat, Some(g), None).unwrap();
        assert_eq!(counters(&h, g), Counters { total: 1, current: 0, online: 0 });

        h.accounts.connect(&me);
        h.roster.refresh_account(&me);
        assert_eq!(counters(&h, g), Counters { total: 1, current: 1, online: 1 });

        h.roster.remove_chat(chat).unwrap();
        assert_eq!(counters(&h, g), Counters::default());
        h.roster.check_invariants().unwrap();
    }

    // -----------------------------------------------------------------------
    // Renames & merges
    // -----------------------------------------------------------------------

    #[test]
    fn test_rename_buddy_rekeys_indices() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let bob = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(bob, None, None, None).unwrap();

        h.roster.rename_buddy(bob, "robert").unwrap();
        assert_eq!(h.roster.find_buddy(&me, "bob"), None);
        assert_eq!(h.roster.find_buddy(&me, "robert"), Some(bob));
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_rename_group_into_existing_merges() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let office = h.attached_group("Office");
        let a = h.roster.new_buddy(me.clone(), "a", None);
        let b = h.roster.new_buddy(me.clone(), "b", None);
        h.roster.add_buddy(a, None, Some(work), None).unwrap();
        h.roster.add_buddy(b, None, Some(office), None).unwrap();

        h.roster.rename_group(office, "work").unwrap();

        assert!(h.roster.group(office).is_none());
        assert_eq!(h.roster.group_of(b), Some(work));
        assert_eq!(counters(&h, work).total, 2);
        assert_eq!(h.roster.groups().collect::<Vec<_>>(), vec![work]);
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_rename_group_plain() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let idle = account("irc", "me");
        let away = account("aim", "me");
        h.accounts.connect(&me);
        h.accounts.connect(&idle);
        h.accounts.disconnect(&away);
        let work = h.attached_group("Work");
        let bob = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(bob, None, Some(work), None).unwrap();
        let carol = h.roster.new_buddy(away, "carol", None);
        h.roster.add_buddy(carol, None, Some(work), None).unwrap();

        h.roster.rename_group(work, "Job").unwrap();

        assert_eq!(h.roster.find_group(Some("job")), Some(work));
        assert_eq!(h.roster.find_group(Some("work")), None);
        // Only connected accounts with buddies in the group hear about it.
        assert_eq!(
            h.server.renamed_groups(),
            vec![(me, "Work".to_string(), "Job".to_string())]
        );
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_contact_moves_all_buddies() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let other = account("irc", "me");
        let work = h.attached_group("Work");
        let a = h.roster.new_buddy(me.clone(), "alice", None);
        let b = h.roster.new_buddy(other.clone(), "alice", None);
        let c = h.roster.new_buddy(other, "al", None);
        h.roster.add_buddy(a, None, Some(work), None).unwrap();
        h.roster.add_buddy(b, None, Some(work), None).unwrap();
        h.roster.add_buddy(c, None, None, Some(b)).unwrap();
        let target = h.roster.contact_of(a).unwrap();
        let source = h.roster.contact_of(b).unwrap();

        h.roster.merge_contact(source, a).unwrap();

        assert!(h.roster.contact(source).is_none());
        assert_eq!(h.roster.children(target).collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(counters(&h, work).total, 3);
        assert!(h.server.moves().is_empty());
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_contact_drops_buddies_already_in_target_group() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        let home = h.attached_group("Home");
        let alice_work = h.roster.new_buddy(me.clone(), "alice", None);
        h.roster.add_buddy(alice_work, None, Some(work), None).unwrap();
        let target = h.roster.contact_of(alice_work).unwrap();

        let alice_home = h.roster.new_buddy(me.clone(), "alice", None);
        h.roster.add_buddy(alice_home, None, Some(home), None).unwrap();
        let source = h.roster.contact_of(alice_home).unwrap();
        let bob = h.roster.new_buddy(me.clone(), "bob", None);
        h.roster.add_buddy(bob, None, None, Some(alice_home)).unwrap();

        h.roster.merge_contact(source, target).unwrap();

        assert!(h.roster.buddy(alice_home).is_none());
        assert!(h.roster.contact(source).is_none());
        assert_eq!(h.server.removed_buddies(), vec![("alice".to_string(), "Home".to_string())]);
        assert_eq!(h.server.moves(), vec![("bob".to_string(), "Home".to_string(), "Work".to_string())]);
        assert_eq!(h.roster.children(target).collect::<Vec<_>>(), vec![alice_work, bob]);
        assert_eq!(h.roster.find_buddies(&me, Some("alice")), vec![alice_work]);
        assert_eq!(counters(&h, work).total, 2);
        assert_eq!(counters(&h, home).total, 0);
        h.roster.check_invariants().unwrap();
    }

    // -----------------------------------------------------------------------
    // Aliases, settings, presence
    // -----------------------------------------------------------------------

    #[test]
    fn test_alias_unchanged_is_silent() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        let bob = h.roster.new_buddy(me, "bob", None);
        h.roster.add_buddy(bob, None, None, None).unwrap();
        h.roster.alias_buddy(bob, Some("Bobby")).unwrap();
        let saves = h.saves.count();
        h.observer.clear();

        h.roster.alias_buddy(bob, Some("Bobby")).unwrap();
        assert_eq!(h.saves.count(), saves);
        assert!(h.observer.events().is_empty());

        h.roster.alias_buddy(bob, Some("")).unwrap();
        assert_eq!(h.roster.buddy(bob).unwrap().alias, None);
        assert_eq!(h.observer.events(), vec![RosterEvent::Updated(bob)]);
    }

    #[test]
    fn test_settings_and_transient() {
        let mut h = Harness::new();
        let g = h.attached_group("Work");
        h.roster.set_setting(g, "collapsed", SettingValue::Bool(true)).unwrap();
        h.roster.set_setting(g, "order", SettingValue::Int(3)).unwrap();
        assert_eq!(h.roster.setting_bool(g, "collapsed"), Some(true));
        assert_eq!(h.roster.setting_int(g, "order"), Some(3));
        assert_eq!(h.roster.setting_string(g, "order"), None);

        h.roster.remove_setting(g, "order").unwrap();
        assert!(h.roster.setting(g, "order").is_none());

        h.roster.set_transient(g, true).unwrap();
        assert!(h.roster.is_transient(g));
    }

    #[test]
    fn test_priority_prefers_online_then_order() {
        let mut h = Harness::new();
        let me = account("xmpp", "me");
        h.accounts.connect(&me);
        let a = h.roster.new_buddy(me.clone(), "a", None);
        let b = h.roster.new_buddy(me.clone(), "b", None);
        h.roster.add_buddy(a, None, None, None).unwrap();
        h.roster.add_buddy(b, None, None, Some(a)).unwrap();
        let contact = h.roster.contact_of(a).unwrap();
        assert_eq!(h.roster.priority_buddy(contact), Some(a));

        h.presence.set_online("b", true);
        h.roster.refresh_buddy_presence(b).unwrap();
        assert_eq!(h.roster.priority_buddy(contact), Some(b));
        assert_eq!(counters(&h, contact), Counters { total: 2, current: 2, online: 1 });

        h.roster.remove_buddy(b).unwrap();
        assert_eq!(h.roster.priority_buddy(contact), Some(a));
        h.roster.check_invariants().unwrap();
    }

    #[test]
    fn test_total_ignores_connection_state() {
        let mut h = Harness::with_config(RosterConfig::default());
        let me = account("xmpp", "me");
        let work = h.attached_group("Work");
        for name in ["a", "b", "c"] {
            let b = h.roster.new_buddy(me.clone(), name, None);
            h.roster.add_buddy(b, None, Some(work), None).unwrap();
        }
        let offline_total = counters(&h, work).total;
        h.accounts.connect(&me);
        h.roster.refresh_account(&me);
        assert_eq!(counters(&h, work).total, offline_total);
        assert_eq!(counters(&h, work).current, 3);
        assert_eq!(h.roster.group_size(work, false), 3);
        assert_eq!(h.roster.group_accounts(work), vec![me.clone()]);
        assert!(h.roster.group_on_account(work, &me));
    }

    // -----------------------------------------------------------------------
    // Counter property
    // -----------------------------------------------------------------------

    #[derive(Clone, Debug)]
    enum Op {
        Add { buddy: usize, group: usize },
        Join { buddy: usize, other: usize },
        Remove { buddy: usize },
        Connect(bool),
        Online { buddy: usize, online: bool },
        MoveContact { buddy: usize, group: usize },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6usize, 0..3usize).prop_map(|(buddy, group)| Op::Add { buddy, group }),
            (0..6usize, 0..6usize).prop_map(|(buddy, other)| Op::Join { buddy, other }),
            (0..6usize).prop_map(|buddy| Op::Remove { buddy }),
            any::<bool>().prop_map(Op::Connect),
            (0..6usize, any::<bool>()).prop_map(|(buddy, online)| Op::Online { buddy, online }),
            (0..6usize, 0..3usize).prop_map(|(buddy, group)| Op::MoveContact { buddy, group }),
        ]
    }

    proptest! {
        #[test]
        fn prop_counters_match_recount(ops in proptest::collection::vec(op(), 1..40)) {
            let mut h = Harness::new();
            let me = account("xmpp", "me");
            let groups: Vec<NodeId> = ["G0", "G1", "G2"].iter().map(|n| h.attached_group(n)).collect();
            let names = ["b0", "b1", "b2", "b3", "b4", "b5"];
            let mut slots: Vec<NodeId> = names.iter().map(|n| h.roster.new_buddy(me.clone(), n, None)).collect();

            for op in ops {
                match op {
                    Op::Add { buddy, group } => {
                        let _ = h.roster.add_buddy(slots[buddy], None, Some(groups[group]), None);
                    }
                    Op::Join { buddy, other } => {
                        if h.roster.is_attached(slots[other]) {
                            let _ = h.roster.add_buddy(slots[buddy], None, None, Some(slots[other]));
                        }
                    }
                    Op::Remove { buddy } => {
                        if h.roster.is_attached(slots[buddy]) {
                            h.roster.remove_buddy(slots[buddy]).unwrap();
                            slots[buddy] = h.roster.new_buddy(me.clone(), names[buddy], None);
                        }
                    }
                    Op::Connect(up) => {
                        if up { h.accounts.connect(&me) } else { h.accounts.disconnect(&me) }
                        h.roster.refresh_account(&me);
                    }
                    Op::Online { buddy, online } => {
                        h.presence.set_online(names[buddy], online);
                        h.roster.refresh_buddy_presence(slots[buddy]).unwrap();
                    }
                    Op::MoveContact { buddy, group } => {
                        if let Some(contact) = h.roster.contact_of(slots[buddy]) {
                            h.roster.add_contact(contact, Some(groups[group]), None).unwrap();
                        }
                    }
                }
                prop_assert_eq!(h.roster.check_invariants(), Ok(()));
            }

            let attached = slots.iter().filter(|b| h.roster.is_attached(**b)).count() as u32;
            let total: u32 = groups.iter().map(|g| h.roster.counters(*g).unwrap().total).sum();
            prop_assert_eq!(total, attached);
        }
    }
}
