//! Centralized on-disk layout for a store.
//!
//! ```text
//! <store_root>/
//! ├── store.toml                    # manifest: states, settings, validation
//! ├── subjects.json                 # subject catalog
//! ├── store.events.jsonl            # mutation audit journal
//! ├── <state>/<document_id>.json    # canonical documents (one dir per declared state)
//! ├── views/<subject>/<state>/<document_id>.json   # derived, rebuildable
//! ├── locks/<resource>.lock         # advisory lock markers
//! ├── events/<subject>/<event_id>.json   # per-subject notification inbox
//! └── registry/catalog.json         # optional store registry
//! ```

use crate::core::error::BurrowError;
use regex::Regex;
use std::sync::OnceLock;

/// Schema version stamped into every encoded record.
pub const SCHEMA_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "store.toml";
pub const SUBJECTS_FILE: &str = "subjects.json";
pub const JOURNAL_FILE: &str = "store.events.jsonl";
pub const VIEWS_DIR: &str = "views";
pub const LOCKS_DIR: &str = "locks";
pub const EVENTS_DIR: &str = "events";
pub const REGISTRY_DIR: &str = "registry";
pub const REGISTRY_FILE: &str = "catalog.json";

pub const DOCUMENT_EXT: &str = "json";
pub const BACKUP_SUFFIX: &str = ".bak";
pub const LOCK_SUFFIX: &str = ".lock";
pub const TEMP_SUFFIX: &str = ".tmp";

/// Names a declared state may not take, since they share the store root with state dirs.
pub const RESERVED_NAMES: &[&str] = &[
    VIEWS_DIR,
    LOCKS_DIR,
    EVENTS_DIR,
    REGISTRY_DIR,
    MANIFEST_FILE,
    SUBJECTS_FILE,
    JOURNAL_FILE,
];

/// Lock resources that are not documents.
pub const VIEWS_LOCK: &str = "views";
pub const SUBJECTS_LOCK: &str = "subjects";
pub const REGISTRY_LOCK: &str = "registry";

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("identifier pattern compiles")
    })
}

/// Identifiers become path segments, so they must not escape their directory.
pub fn validate_identifier(id: &str) -> Result<(), BurrowError> {
    if identifier_regex().is_match(id) && !id.contains("..") {
        Ok(())
    } else {
        Err(BurrowError::InvalidIdentifier(id.to_string()))
    }
}

pub fn document_file_name(id: &str) -> String {
    format!("{}.{}", id, DOCUMENT_EXT)
}

/// Inverse of [`document_file_name`]; skips temp files, backups, and dotfiles.
pub fn document_id_from_file_name(name: &str) -> Option<&str> {
    if name.starts_with('.') {
        return None;
    }
    name.strip_suffix(&format!(".{}", DOCUMENT_EXT))
        .filter(|id| !id.is_empty())
}
