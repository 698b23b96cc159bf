/// Per-account allow/deny lists.
///
/// Kept beside the tree, not in it: the lists name people by screen name
/// whether or not they are buddies. Names are stored normalized with the
/// account's rules, so lookups match however the caller spelled them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::roster::ids::AccountId;
use crate::roster::state::{Roster, Txn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyMode {
    #[default]
    AllowAll,
    DenyAll,
    /// Only names on the permit list.
    AllowUsers,
    /// Everyone except names on the deny list.
    DenyUsers,
    /// Only people who are buddies on this account.
    AllowBuddyList,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountPrivacy {
    pub mode: PrivacyMode,
    pub permit: BTreeSet<String>,
    pub deny: BTreeSet<String>,
}

impl AccountPrivacy {
    fn is_default(&self) -> bool {
        self.mode == PrivacyMode::AllowAll && self.permit.is_empty() && self.deny.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct PrivacyLists {
    accounts: BTreeMap<AccountId, AccountPrivacy>,
}

impl PrivacyLists {
    pub fn get(&self, account: &AccountId) -> Option<&AccountPrivacy> {
        self.accounts.get(account)
    }

    /// Accounts with non-default settings, in account order.
    pub fn iter(&self) -> impl Iterator<Item = (&AccountId, &AccountPrivacy)> {
        self.accounts.iter().filter(|(_, p)| !p.is_default())
    }

    pub(crate) fn entry(&mut self, account: &AccountId) -> &mut AccountPrivacy {
        self.accounts.entry(account.clone()).or_default()
    }

    pub(crate) fn clear(&mut self) {
        self.accounts.clear();
    }
}

#[derive(Clone, Copy)]
enum List {
    Permit,
    Deny,
}

impl Roster {
    pub fn privacy(&self) -> &PrivacyLists {
        &self.privacy
    }

    pub fn privacy_mode(&self, account: &AccountId) -> PrivacyMode {
        self.privacy.get(account).map(|p| p.mode).unwrap_or_default()
    }

    pub fn set_privacy_mode(&mut self, account: &AccountId, mode: PrivacyMode) {
        let entry = self.privacy.entry(account);
        if entry.mode == mode {
            return;
        }
        entry.mode = mode;
        self.privacy_changed();
    }

    /// Returns `false` when the name was already listed.
    pub fn privacy_permit_add(&mut self, account: &AccountId, who: &str) -> bool {
        self.edit_list(account, who, List::Permit, true)
    }

    pub fn privacy_permit_remove(&mut self, account: &AccountId, who: &str) -> bool {
        self.edit_list(account, who, List::Permit, false)
    }

    pub fn privacy_deny_add(&mut self, account: &AccountId, who: &str) -> bool {
        self.edit_list(account, who, List::Deny, true)
    }

    pub fn privacy_deny_remove(&mut self, account: &AccountId, who: &str) -> bool {
        self.edit_list(account, who, List::Deny, false)
    }

    /// Whether `who` may contact the account under its current mode.
    pub fn privacy_check(&self, account: &AccountId, who: &str) -> bool {
        let name = self.normalize(account, who);
        let Some(p) = self.privacy.get(account) else {
            return true;
        };
        match p.mode {
            PrivacyMode::AllowAll => true,
            PrivacyMode::DenyAll => false,
            PrivacyMode::AllowUsers => p.permit.contains(&name),
            PrivacyMode::DenyUsers => !p.deny.contains(&name),
            PrivacyMode::AllowBuddyList => self.buddy_index.first(account, &name).is_some(),
        }
    }

    fn edit_list(&mut self, account: &AccountId, who: &str, list: List, add: bool) -> bool {
        let name = self.normalize(account, who);
        let entry = self.privacy.entry(account);
        let set = match list {
            List::Permit => &mut entry.permit,
            List::Deny => &mut entry.deny,
        };
        let changed = if add { set.insert(name) } else { set.remove(&name) };
        if changed {
            self.privacy_changed();
        }
        changed
    }

    fn privacy_changed(&mut self) {
        let mut txn = Txn::default();
        txn.touch();
        self.commit(txn);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
