//! Process-wide preferences.
//!
//! A small TOML file (`prefs.toml` under the app data directory) holds
//! the toggles that gate core behavior. Persistence is OFF by default:
//! a fresh install stores nothing durable until the user opts in.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Preferences file name under the data directory.
pub const PREFS_FILE: &str = "prefs.toml";

/// Recognized process-wide toggles and their effects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Preferences {
    /// Gates every durable message write; reads return empty when off.
    pub persistence_enabled: bool,
    /// When on, inbound messages from unknown identities are dropped.
    pub show_contacts_only: bool,
    /// Whether incoming friend requests are handled at all.
    pub accept_friend_requests: bool,
    /// Retention cutoff: messages older than this are deleted.
    pub message_retention_days: u32,
    /// Per-conversation cap for the durable message store.
    pub message_cap: usize,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            persistence_enabled: false,
            show_contacts_only: false,
            accept_friend_requests: true,
            message_retention_days: crate::DEFAULT_RETENTION_DAYS,
            message_cap: crate::MESSAGE_CAP,
        }
    }
}

impl Preferences {
    /// Load preferences from the data directory, returning defaults if
    /// the file does not exist yet.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = prefs_path(data_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        toml::from_str(&contents).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Save preferences to the data directory.
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Encoding(e.to_string()))?;
        std::fs::write(prefs_path(data_dir), contents)?;
        Ok(())
    }

    /// Retention window as a chrono duration.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.message_retention_days))
    }
}

/// Path of the preferences file under a data directory.
pub fn prefs_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PREFS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let prefs = Preferences::default();
        assert!(!prefs.persistence_enabled);
        assert!(!prefs.show_contacts_only);
        assert!(prefs.accept_friend_requests);
        assert_eq!(prefs.message_retention_days, 30);
        assert_eq!(prefs.message_cap, 1000);
    }

    #[test]
    fn test_load_missing_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = Preferences::load(dir.path()).expect("load");
        assert_eq!(prefs, Preferences::default());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut prefs = Preferences::default();
        prefs.persistence_enabled = true;
        prefs.message_retention_days = 7;
        prefs.save(dir.path()).expect("save");

        let loaded = Preferences::load(dir.path()).expect("load");
        assert_eq!(loaded, prefs);
    }
}
