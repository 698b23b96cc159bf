//! Roster configuration.

use std::fmt;
use std::time::Duration;

/// Canonical name of the group that catches buddies added without one.
pub const DEFAULT_GROUP_NAME: &str = "Buddies";

/// Coalescing window for persistence requests.
pub const DEFAULT_SAVE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RosterConfig {
    /// Canonical default-group name; always resolves to the default group.
    pub default_group_name: String,
    /// Display name of the default group in the user's locale, registered as
    /// an extra alias in the group index.
    pub localized_default_group_name: Option<String>,
    /// How long the save debouncer waits for more changes before writing.
    pub save_delay: Duration,
    /// Serialize transient nodes too (debug dumps).
    pub persist_transient: bool,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            default_group_name: DEFAULT_GROUP_NAME.to_string(),
            localized_default_group_name: None,
            save_delay: DEFAULT_SAVE_DELAY,
            persist_transient: false,
        }
    }
}

impl RosterConfig {
    /// Default config with a localized default-group name.
    pub fn localized(name: impl Into<String>) -> Self {
        Self {
            localized_default_group_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Name shown for the default group.
    pub fn default_group_display_name(&self) -> &str {
        self.localized_default_group_name
            .as_deref()
            .unwrap_or(&self.default_group_name)
    }
}

impl fmt::Display for RosterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RosterConfig(default_group={}, localized={:?}, save_delay={}ms)",
            self.default_group_name,
            self.localized_default_group_name,
            self.save_delay.as_millis()
        )
    }
}
