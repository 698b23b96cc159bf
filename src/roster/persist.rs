/// Persisted roster document.
///
/// The on-disk layout is an ordered forest plus a privacy section:
///
/// ```text
/// RosterDocument
/// ├── groups[]      GroupRecord { name (None = default group), settings, children[] }
/// │   └── children[]  Contact(ContactRecord { alias, settings, buddies[] }) | Chat(ChatRecord)
/// └── privacy[]     PrivacyRecord { account, mode, permit[], deny[] }
/// ```
///
/// Records use externally tagged enums and no skipped fields so the same
/// types round-trip through both JSON (`to_json`) and bincode (`to_bytes`).
/// Transient nodes are never written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::roster::ids::{AccountId, NodeId};
use crate::roster::node::{Node, NodeKind, SettingValue, Settings};
use crate::roster::privacy::PrivacyMode;
use crate::roster::state::{Roster, RosterError};

/// Current document layout.
pub const DOCUMENT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary encoding error: {0}")]
    Binary(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported roster document version {0}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Roster(#[from] RosterError),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RosterDocument {
    pub version: u32,
    pub saved_at: Option<DateTime<Utc>>,
    pub groups: Vec<GroupRecord>,
    pub privacy: Vec<PrivacyRecord>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupRecord {
    /// `None` for the default group.
    pub name: Option<String>,
    pub settings: Settings,
    pub children: Vec<GroupChild>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum GroupChild {
    Contact(ContactRecord),
    Chat(ChatRecord),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContactRecord {
    pub alias: Option<String>,
    pub settings: Settings,
    pub buddies: Vec<BuddyRecord>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BuddyRecord {
    pub account: AccountId,
    pub name: String,
    pub alias: Option<String>,
    pub server_alias: Option<String>,
    pub settings: Settings,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatRecord {
    pub account: AccountId,
    pub alias: Option<String>,
    pub components: BTreeMap<String, String>,
    pub settings: Settings,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PrivacyRecord {
    pub account: AccountId,
    pub mode: PrivacyMode,
    pub permit: Vec<String>,
    pub deny: Vec<String>,
}

impl RosterDocument {
    pub fn empty() -> Self {
        RosterDocument {
            version: DOCUMENT_VERSION,
            saved_at: None,
            groups: Vec::new(),
            privacy: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PersistError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PersistError> {
        Ok(bincode::deserialize(data)?)
    }

    /// BLAKE3 fingerprint of the content (groups, children, privacy), in
    /// order. `version` and `saved_at` are not part of it.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();

        // --- Tree ---
        hasher.update(b"T");
        for group in &self.groups {
            hasher.update(b"G");
            put_opt(&mut hasher, group.name.as_deref());
            put_settings(&mut hasher, &group.settings);
            for child in &group.children {
                match child {
                    GroupChild::Contact(c) => {
                        hasher.update(b"C");
                        put_opt(&mut hasher, c.alias.as_deref());
                        put_settings(&mut hasher, &c.settings);
                        for b in &c.buddies {
                            hasher.update(b"B");
                            put_account(&mut hasher, &b.account);
                            put(&mut hasher, &b.name);
                            put_opt(&mut hasher, b.alias.as_deref());
                            put_opt(&mut hasher, b.server_alias.as_deref());
                            put_settings(&mut hasher, &b.settings);
                        }
                    }
                    GroupChild::Chat(c) => {
                        hasher.update(b"H");
                        put_account(&mut hasher, &c.account);
                        put_opt(&mut hasher, c.alias.as_deref());
                        for (k, v) in &c.components {
                            put(&mut hasher, k);
                            put(&mut hasher, v);
                        }
                        put_settings(&mut hasher, &c.settings);
                    }
                }
            }
        }

        // --- Privacy ---
        hasher.update(b"P");
        for p in &self.privacy {
            put_account(&mut hasher, &p.account);
            hasher.update(&[p.mode as u8]);
            hasher.update(&(p.permit.len() as u64).to_le_bytes());
            for who in &p.permit {
                put(&mut hasher, who);
            }
            hasher.update(&(p.deny.len() as u64).to_le_bytes());
            for who in &p.deny {
                put(&mut hasher, who);
            }
        }

        *hasher.finalize().as_bytes()
    }
}

fn put(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn put_opt(hasher: &mut blake3::Hasher, s: Option<&str>) {
    match s {
        None => {
            hasher.update(&[0]);
        }
        Some(s) => {
            hasher.update(&[1]);
            put(hasher, s);
        }
    }
}

fn put_account(hasher: &mut blake3::Hasher, account: &AccountId) {
    put(hasher, &account.protocol);
    put(hasher, &account.username);
}

fn put_settings(hasher: &mut blake3::Hasher, settings: &Settings) {
    hasher.update(&(settings.len() as u64).to_le_bytes());
    for (key, value) in settings {
        put(hasher, key);
        match value {
            SettingValue::String(s) => {
                hasher.update(&[0]);
                put(hasher, s);
            }
            SettingValue::Int(i) => {
                hasher.update(&[1]);
                hasher.update(&i.to_le_bytes());
            }
            SettingValue::Bool(b) => {
                hasher.update(&[2, *b as u8]);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Roster <-> document
// ---------------------------------------------------------------------------

impl Roster {
    fn persisted(&self, id: NodeId) -> bool {
        self.config.persist_transient || !self.is_transient(id)
    }

    /// Snapshot the tree and privacy lists, leaving out transient nodes.
    pub fn to_document(&self) -> RosterDocument {
        let mut groups = Vec::new();
        for g in self.groups().filter(|g| self.persisted(*g)) {
            let Some(node) = self.node(g) else { continue };
            let Some(group) = node.as_group() else { continue };
            let name = if self.default_group == Some(g) {
                None
            } else {
                Some(group.name.clone())
            };

            let mut children = Vec::new();
            for child in self.children(g).filter(|c| self.persisted(*c)) {
                let Some(child_node) = self.node(child) else { continue };
                match child_node.kind() {
                    NodeKind::Contact(contact) => {
                        let buddies: Vec<BuddyRecord> = self
                            .children(child)
                            .filter(|b| self.persisted(*b))
                            .filter_map(|b| self.node(b))
                            .filter_map(buddy_record)
                            .collect();
                        if buddies.is_empty() {
                            continue;
                        }
                        children.push(GroupChild::Contact(ContactRecord {
                            alias: contact.alias.clone(),
                            settings: child_node.settings().clone(),
                            buddies,
                        }));
                    }
                    NodeKind::Chat(chat) => children.push(GroupChild::Chat(ChatRecord {
                        account: chat.account.clone(),
                        alias: chat.alias.clone(),
                        components: chat.components.clone(),
                        settings: child_node.settings().clone(),
                    })),
                    _ => {}
                }
            }
            groups.push(GroupRecord {
                name,
                settings: node.settings().clone(),
                children,
            });
        }

        let privacy = self
            .privacy
            .iter()
            .map(|(account, p)| PrivacyRecord {
                account: account.clone(),
                mode: p.mode,
                permit: p.permit.iter().cloned().collect(),
                deny: p.deny.iter().cloned().collect(),
            })
            .collect();

        RosterDocument {
            version: DOCUMENT_VERSION,
            saved_at: Some(Utc::now()),
            groups,
            privacy,
        }
    }

    /// Fingerprint of what `to_document` would persist.
    pub fn state_hash(&self) -> [u8; 32] {
        self.to_document().content_hash()
    }

    /// Write the current document to `store`.
    pub fn save_to(&self, store: &JsonFileStore) -> Result<(), PersistError> {
        store.store(&self.to_document())
    }

    /// Populate an empty roster from a document. Observers see every node
    /// being added; no save is scheduled.
    pub fn load_document(&mut self, doc: &RosterDocument) -> Result<(), PersistError> {
        if doc.version != DOCUMENT_VERSION {
            return Err(PersistError::UnsupportedVersion(doc.version));
        }
        if !self.arena.is_empty() {
            return Err(RosterError::InvalidDocument("roster is not empty".into()).into());
        }

        self.loading = true;
        let result = self.load_records(doc);
        self.loading = false;
        result?;

        log::info!(
            "loaded roster: {} group(s), {} buddies, state {}",
            doc.groups.len(),
            self.buddy_index.len(),
            hex::encode(&self.state_hash()[..8])
        );
        Ok(())
    }

    fn load_records(&mut self, doc: &RosterDocument) -> Result<(), RosterError> {
        self.privacy.clear();

        for record in &doc.groups {
            let name = record
                .name
                .clone()
                .unwrap_or_else(|| self.config.default_group_name.clone());
            let group = self.new_group(&name);
            if !self.is_attached(group) {
                let last = self.arena.last_child(None);
                self.add_group(group, last)?;
            }
            self.merge_settings(group, &record.settings);

            for child in &record.children {
                match child {
                    GroupChild::Contact(c) => self.load_contact(group, c)?,
                    GroupChild::Chat(c) => {
                        let chat = self.new_chat(c.account.clone(), c.alias.as_deref(), c.components.clone());
                        self.merge_settings(chat, &c.settings);
                        let last = self.arena.last_child(Some(group));
                        self.add_chat(chat, Some(group), last)?;
                    }
                }
            }
        }

        for p in &doc.privacy {
            let permit: Vec<String> = p.permit.iter().map(|w| self.normalize(&p.account, w)).collect();
            let deny: Vec<String> = p.deny.iter().map(|w| self.normalize(&p.account, w)).collect();
            let entry = self.privacy.entry(&p.account);
            entry.mode = p.mode;
            entry.permit.extend(permit);
            entry.deny.extend(deny);
        }
        Ok(())
    }

    fn load_contact(&mut self, group: NodeId, record: &ContactRecord) -> Result<(), RosterError> {
        let contact = self.new_contact();
        if let Some(c) = self.arena.get_mut(contact).and_then(Node::as_contact_mut) {
            c.alias = record.alias.clone();
        }
        self.merge_settings(contact, &record.settings);

        let mut last: Option<NodeId> = None;
        for b in &record.buddies {
            let buddy = self.new_buddy(b.account.clone(), &b.name, b.alias.as_deref());
            if let Some(bd) = self.arena.get_mut(buddy).and_then(Node::as_buddy_mut) {
                bd.server_alias = b.server_alias.clone();
            }
            self.merge_settings(buddy, &b.settings);

            let placed = match last {
                None => self.add_buddy(buddy, Some(contact), Some(group), None),
                Some(prev) => self.add_buddy(buddy, None, None, Some(prev)),
            };
            match placed {
                Ok(()) => last = Some(buddy),
                Err(RosterError::DuplicateBuddy { account, name, .. }) => {
                    log::warn!("skipping duplicate {} '{}' in saved roster", account, name);
                    self.discard(buddy)?;
                }
                Err(e) => return Err(e),
            }
        }
        if last.is_none() {
            self.discard(contact)?;
        }
        Ok(())
    }

    fn merge_settings(&mut self, id: NodeId, settings: &Settings) {
        if let Some(node) = self.arena.get_mut(id) {
            node.settings
                .extend(settings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

fn buddy_record(node: &Node) -> Option<BuddyRecord> {
    let b = node.as_buddy()?;
    Some(BuddyRecord {
        account: b.account.clone(),
        name: b.name.clone(),
        alias: b.alias.clone(),
        server_alias: b.server_alias.clone(),
        settings: node.settings().clone(),
    })
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// JSON document on disk, replaced atomically on every store.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no roster has been saved yet.
    pub fn load(&self) -> Result<Option<RosterDocument>, PersistError> {
        match fs::read_to_string(&self.path) {
            Ok(json) => Ok(Some(RosterDocument::from_json(&json)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn store(&self, doc: &RosterDocument) -> Result<(), PersistError> {
        let json = doc.to_json()?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &self.path)?;
        log::info!(
            "stored roster to {} ({} bytes, state {})",
            self.path.display(),
            json.len(),
            hex::encode(&doc.content_hash()[..8])
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
