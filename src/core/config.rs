//! Store manifest (`store.toml`) and process-level runtime options.

use crate::core::error::BurrowError;
use crate::core::schemas;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

const LOCK_TIMEOUT_ENV: &str = "BURROW_LOCK_TIMEOUT_MS";
const LOCK_STALE_ENV: &str = "BURROW_LOCK_STALE_SECS";
const WRITE_ATTEMPTS_ENV: &str = "BURROW_WRITE_ATTEMPTS";
const PAGE_SIZE_ENV: &str = "BURROW_PAGE_SIZE";

/// What a transition or create does when the target state is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityPolicy {
    /// Fail with `CapacityExceeded`.
    Reject,
    /// Allow the move and surface a warning on the outcome.
    Warn,
}

/// How view entries point back at canonical documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    /// Small JSON index record naming the canonical path.
    #[default]
    Record,
    /// Relative symbolic link (unix only; other platforms fall back to records).
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

impl StateDef {
    pub fn new(id: &str, name: &str, capacity: Option<usize>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_priority")]
    pub default_priority: String,
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,
    /// Deliberately has no serde default: a manifest must say which policy it wants.
    pub capacity_policy: CapacityPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_state: Option<String>,
    #[serde(default)]
    pub view_mode: ViewMode,
    /// Escalation target for `documents::reassign_to_superagent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_superagent: Option<String>,
    /// Moving a document into this state notifies whoever requested it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_state: Option<String>,
}

fn default_priority() -> String {
    "medium".to_string()
}

fn default_id_prefix() -> String {
    "T".to_string()
}

/// Optional rules for the built-in validator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_title_len: Option<usize>,
    #[serde(default)]
    pub allowed_priorities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub store_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_manifest_version")]
    pub version: u32,
    pub settings: StoreSettings,
    pub states: Vec<StateDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRules>,
}

fn default_manifest_version() -> u32 {
    schemas::SCHEMA_VERSION
}

impl StoreManifest {
    /// The default work board: backlog, todo(10), doing(5), blocked(5), done, archived.
    pub fn board(store_id: &str, name: &str, capacity_policy: CapacityPolicy) -> Self {
        Self {
            store_id: store_id.to_string(),
            name: name.to_string(),
            version: schemas::SCHEMA_VERSION,
            settings: StoreSettings {
                default_priority: default_priority(),
                id_prefix: default_id_prefix(),
                capacity_policy,
                archive_state: Some("archived".to_string()),
                view_mode: ViewMode::Record,
                default_superagent: None,
                completion_state: Some("done".to_string()),
            },
            states: vec![
                StateDef::new("backlog", "Backlog", None),
                StateDef::new("todo", "To Do", Some(10)),
                StateDef::new("doing", "Doing", Some(5)),
                StateDef::new("blocked", "Blocked", Some(5)),
                StateDef::new("done", "Done", None),
                StateDef::new("archived", "Archived", None),
            ],
            validation: None,
        }
    }

    pub fn state(&self, id: &str) -> Option<&StateDef> {
        self.states.iter().find(|s| s.id == id)
    }

    pub fn state_index(&self, id: &str) -> Option<usize> {
        self.states.iter().position(|s| s.id == id)
    }

    pub fn state_ids(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(|s| s.id.as_str())
    }

    /// Structural checks that must hold before any directory is derived from the manifest.
    pub fn check(&self, path: &Path) -> Result<(), BurrowError> {
        let config_err = |reason: String| BurrowError::ConfigError {
            path: path.to_path_buf(),
            reason,
        };

        schemas::validate_identifier(&self.store_id)
            .map_err(|_| config_err(format!("store_id '{}' is not a valid identifier", self.store_id)))?;
        schemas::validate_identifier(&self.settings.id_prefix).map_err(|_| {
            config_err(format!(
                "id_prefix '{}' is not a valid identifier",
                self.settings.id_prefix
            ))
        })?;
        if self.states.is_empty() {
            return Err(config_err("at least one state must be declared".to_string()));
        }

        let mut seen = HashSet::new();
        for state in &self.states {
            schemas::validate_identifier(&state.id)
                .map_err(|_| config_err(format!("state '{}' is not a valid identifier", state.id)))?;
            if schemas::RESERVED_NAMES.contains(&state.id.as_str()) {
                return Err(config_err(format!("state '{}' uses a reserved name", state.id)));
            }
            if !seen.insert(state.id.as_str()) {
                return Err(config_err(format!("state '{}' declared twice", state.id)));
            }
        }

        if let Some(archive) = &self.settings.archive_state {
            if self.state(archive).is_none() {
                return Err(config_err(format!(
                    "archive_state '{}' is not a declared state",
                    archive
                )));
            }
        }
        if let Some(completion) = &self.settings.completion_state {
            if self.state(completion).is_none() {
                return Err(config_err(format!(
                    "completion_state '{}' is not a declared state",
                    completion
                )));
            }
        }
        if let Some(superagent) = &self.settings.default_superagent {
            schemas::validate_identifier(superagent).map_err(|_| {
                config_err(format!(
                    "default_superagent '{}' is not a valid identifier",
                    superagent
                ))
            })?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, BurrowError> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                BurrowError::NotFound(format!("store manifest {}", path.display()))
            }
            _ => BurrowError::IoError(e),
        })?;
        let manifest: StoreManifest = toml::from_str(&content).map_err(|e| BurrowError::ConfigError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        manifest.check(path)?;
        Ok(manifest)
    }

    pub fn to_toml(&self) -> Result<String, BurrowError> {
        toml::to_string_pretty(self).map_err(|e| BurrowError::EncodeError(e.to_string()))
    }
}

/// Process-level knobs; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub lock_timeout: Duration,
    pub lock_stale_after: Duration,
    pub lock_poll_initial: Duration,
    pub lock_poll_max: Duration,
    pub write_attempts: u32,
    pub write_retry_delay: Duration,
    pub page_size: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            lock_stale_after: Duration::from_secs(300),
            lock_poll_initial: Duration::from_millis(10),
            lock_poll_max: Duration::from_millis(250),
            write_attempts: 3,
            write_retry_delay: Duration::from_millis(50),
            page_size: 50,
        }
    }
}

impl RuntimeOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` yields; zero or unparsable values are ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let positive = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
        };

        let mut options = Self::default();
        if let Some(ms) = positive(LOCK_TIMEOUT_ENV) {
            options.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = positive(LOCK_STALE_ENV) {
            options.lock_stale_after = Duration::from_secs(secs);
        }
        if let Some(n) = positive(WRITE_ATTEMPTS_ENV) {
            options.write_attempts = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(n) = positive(PAGE_SIZE_ENV) {
            options.page_size = usize::try_from(n).unwrap_or(usize::MAX);
        }
        options
    }
}
