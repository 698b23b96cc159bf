/// Hash indices over the roster tree.
///
/// - `BuddyIndex`: `(account, normalized name, group)` → buddy, plus a
///   per-account `normalized name` → buddies map for group-agnostic lookup.
/// - `GroupIndex`: folded group name → group, including the default-group
///   aliases.
///
/// Both indices store handles only; callers normalize names with the owning
/// account's rules before calling in.

use std::collections::HashMap;
use unicode_normalization::UnicodeNormalization;

use crate::roster::ids::{AccountId, NodeId};

/// Locale-independent, case-insensitive key for group names.
pub fn fold_name(name: &str) -> String {
    name.nfkc().collect::<String>().to_lowercase()
}

// ---------------------------------------------------------------------------
// BuddyIndex
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BuddyKey {
    account: AccountId,
    name: String,
    group: NodeId,
}

impl BuddyKey {
    fn new(account: &AccountId, name: &str, group: NodeId) -> Self {
        BuddyKey {
            account: account.clone(),
            name: name.to_string(),
            group,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BuddyIndex {
    by_group: HashMap<BuddyKey, NodeId>,
    by_account: HashMap<AccountId, HashMap<String, Vec<NodeId>>>,
}

impl BuddyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed buddies.
    pub fn len(&self) -> usize {
        self.by_group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_group.is_empty()
    }

    pub(crate) fn insert(&mut self, account: &AccountId, name: &str, group: NodeId, buddy: NodeId) {
        if let Some(previous) = self.by_group.insert(BuddyKey::new(account, name, group), buddy) {
            if previous != buddy {
                log::error!(
                    "buddy index collision for {} '{}' in {}: {} replaced {}",
                    account,
                    name,
                    group,
                    buddy,
                    previous
                );
                self.remove_from_account(account, name, previous);
            }
        }
        let named = self
            .by_account
            .entry(account.clone())
            .or_default()
            .entry(name.to_string())
            .or_default();
        if !named.contains(&buddy) {
            named.push(buddy);
        }
    }

    pub(crate) fn remove(&mut self, account: &AccountId, name: &str, group: NodeId, buddy: NodeId) {
        let key = BuddyKey::new(account, name, group);
        if self.by_group.get(&key) == Some(&buddy) {
            self.by_group.remove(&key);
        }
        self.remove_from_account(account, name, buddy);
    }

    fn remove_from_account(&mut self, account: &AccountId, name: &str, buddy: NodeId) {
        let Some(names) = self.by_account.get_mut(account) else {
            return;
        };
        if let Some(named) = names.get_mut(name) {
            named.retain(|b| *b != buddy);
            if named.is_empty() {
                names.remove(name);
            }
        }
        if names.is_empty() {
            self.by_account.remove(account);
        }
    }

    pub fn get(&self, account: &AccountId, name: &str, group: NodeId) -> Option<NodeId> {
        self.by_group.get(&BuddyKey::new(account, name, group)).copied()
    }

    /// Earliest-indexed buddy with this name on the account, in any group.
    pub fn first(&self, account: &AccountId, name: &str) -> Option<NodeId> {
        self.named(account, name).first().copied()
    }

    pub fn named(&self, account: &AccountId, name: &str) -> &[NodeId] {
        self.by_account
            .get(account)
            .and_then(|names| names.get(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn for_account(&self, account: &AccountId) -> Vec<NodeId> {
        self.by_account
            .get(account)
            .map(|names| names.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the per-account side holds `buddy` under `name`.
    pub fn account_contains(&self, account: &AccountId, name: &str, buddy: NodeId) -> bool {
        self.named(account, name).contains(&buddy)
    }
}

// ---------------------------------------------------------------------------
// GroupIndex
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct GroupIndex {
    by_name: HashMap<String, NodeId>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered names (aliases included).
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(&fold_name(name)).copied()
    }

    pub(crate) fn insert(&mut self, name: &str, group: NodeId) -> Option<NodeId> {
        self.by_name.insert(fold_name(name), group)
    }

    /// Remove `name` only if it still points at `group`.
    pub(crate) fn remove(&mut self, name: &str, group: NodeId) {
        let key = fold_name(name);
        if self.by_name.get(&key) == Some(&group) {
            self.by_name.remove(&key);
        }
    }

    /// Drop every name pointing at `group`.
    pub(crate) fn remove_group(&mut self, group: NodeId) {
        self.by_name.retain(|_, g| *g != group);
    }

    pub fn names_of(&self, group: NodeId) -> Vec<&str> {
        self.by_name
            .iter()
            .filter(|(_, g)| **g == group)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
