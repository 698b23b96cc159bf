//! # Buddy Roster
//!
//! **An in-memory buddy list engine for multi-protocol instant messaging.**
//!
//! The roster keeps a four-level tree (groups, meta-contacts, buddies and
//! chats) together with two hash indices and per-node presence counters,
//! and keeps all three consistent across every move, rename, merge and
//! removal:
//!
//! - **O(1) lookups** by `(account, normalized name, group)` and by group
//!   name, including the default group's canonical and localized aliases
//! - **Cascading counters** (`total`, `current`, `online`) on groups and
//!   meta-contacts, updated incrementally
//! - **Transactional mutations**: observers and the save request only ever
//!   see a consistent tree
//! - **Pluggable collaborators** for account state, presence, server-side
//!   roster sync and persistence
//!
//! ## Quick Start
//!
//! ```rust
//! use buddy_roster::{AccountId, Roster, RosterConfig, RosterServices};
//!
//! let mut roster = Roster::new(RosterConfig::default(), RosterServices::offline());
//! let me = AccountId::new("xmpp", "me@example.org");
//!
//! let alice = roster.new_buddy(me.clone(), "alice@example.org", Some("Alice"));
//! roster.add_buddy(alice, None, None, None).unwrap();
//!
//! let buddies = roster.find_group(Some("Buddies")).unwrap();
//! assert_eq!(roster.find_buddy(&me, "alice@example.org"), Some(alice));
//! assert_eq!(roster.group_size(buddies, true), 1);
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Roster configuration (default group names, save delay) |
//! | [`roster`] | Node arena, indices, counters, mutation API, privacy, persistence |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `std` | Yes | Standard library support |
//! | `native` | Yes | tokio-backed save debouncer (`SaveDebouncer`) |

// Crate-level lint configuration: suppress stylistic warnings that don't affect correctness.
#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::type_complexity,
    clippy::new_without_default
)]

// ── Public modules ──────────────────────────────────────────────────────────

/// Roster configuration.
pub mod config;

/// The roster tree, its indices and counters, and everything built on them.
pub mod roster;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use config::{RosterConfig, DEFAULT_GROUP_NAME, DEFAULT_SAVE_DELAY};

pub use roster::{
    AccountDirectory, AccountId, Buddy, Chat, ConnectionState, Contact, Counters, Group, JsonFileStore,
    NativeChatLookup, Node, NodeId, NodeKind, NodeType, PersistError, PersistenceAdapter, PresenceProvider,
    PrivacyMode, ProtocolServerOps, Roster, RosterDocument, RosterError, RosterEvent, RosterObserver,
    RosterServices, SettingValue,
};

#[cfg(feature = "native")]
pub use roster::{SaveDebouncer, SaveTick};

// ── Library metadata ────────────────────────────────────────────────────────

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────
