//! Buddy roster: a four-level tree of groups, meta-contacts, buddies and
//! chats with hash indices and cascading presence counters.
//!
//! Nodes live in an arena addressed by `NodeId`. Every mutation relinks the
//! tree, rekeys the indices and cascades counter deltas as one transaction,
//! then notifies observers and asks the persistence collaborator for a save.
//!
//! # Module structure
//! - `ids`: NodeId, AccountId identity types
//! - `node`: Node, NodeKind payloads, settings and counters
//! - `tree`: NodeArena with sibling-list linkage (insert_after, unlink)
//! - `counts`: total/current/online cascades and node contributions
//! - `index`: BuddyIndex and GroupIndex
//! - `contract`: collaborator traits the host implements
//! - `state`: Roster context, errors, lookups, traversal, commit
//! - `mutate`: the mutation API (add/remove/move/rename/merge/alias/presence)
//! - `privacy`: per-account allow/deny lists
//! - `persist`: RosterDocument, load/save, state_hash, JsonFileStore
//! - `saver`: tokio save debouncer (`native` feature)

pub mod contract;
pub(crate) mod counts;
pub mod ids;
pub mod index;
pub mod mutate;
pub mod node;
pub mod persist;
pub mod privacy;
#[cfg(feature = "native")]
pub mod saver;
pub mod state;
pub mod tree;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export core types for convenience
pub use contract::{
    AccountDirectory, ConnectionState, NativeChatLookup, Offline, PersistenceAdapter, PresenceProvider,
    ProtocolServerOps, RosterObserver, RosterServices,
};
pub use ids::{AccountId, NodeId};
pub use index::{fold_name, BuddyIndex, GroupIndex};
pub use node::{Buddy, Chat, Contact, Counters, Group, Node, NodeKind, NodeType, SettingValue, Settings};
pub use persist::{
    BuddyRecord, ChatRecord, ContactRecord, GroupChild, GroupRecord, JsonFileStore, PersistError, PrivacyRecord,
    RosterDocument, DOCUMENT_VERSION,
};
pub use privacy::{AccountPrivacy, PrivacyLists, PrivacyMode};
#[cfg(feature = "native")]
pub use saver::{SaveDebouncer, SaveTick};
pub use state::{Roster, RosterError, RosterEvent, Walk};
pub use tree::{Children, NodeArena};
