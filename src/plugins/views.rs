//! Per-subject views: `views/<subject>/<state>/<id>.json`.
//!
//! A view entry is a weak reference to a canonical document, either a small index
//! record or a relative symlink depending on the manifest's `view_mode`. Views hold no
//! data of their own. `rebuild` recomputes all of them from the state partitions and
//! swaps the result into place, which must always reproduce what incremental
//! `sync_document` calls maintain.

use crate::core::codec;
use crate::core::config::{StoreManifest, ViewMode};
use crate::core::error::BurrowError;
use crate::core::schemas;
use crate::core::store::Store;
use crate::plugins::documents::{self, Document};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use ulid::Ulid;

/// subject -> state -> document ids.
pub type ViewSnapshot = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

/// Index-record form of a view entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEntry {
    pub document_id: String,
    pub state: String,
    /// Canonical path relative to the store root.
    pub target: String,
}

pub fn initialize_views(root: &Path, _manifest: &StoreManifest) -> Result<(), BurrowError> {
    fs::create_dir_all(root.join(schemas::VIEWS_DIR)).map_err(BurrowError::IoError)
}

/// Bring every subject's view in line with document `id`: drop entries that no longer
/// apply and add one per current owner under the document's state.
///
/// The record is re-read under the `views` lock, so when syncs from racing writers land
/// out of order the last one still projects the newest canonical state. A document that
/// no longer exists loses all of its entries.
pub fn sync_document(store: &Store, id: &str) -> Result<(), BurrowError> {
    schemas::validate_identifier(id)?;
    store.locks().with_lock(schemas::VIEWS_LOCK, || {
        let current = match documents::read(store, id) {
            Ok(doc) => Some(doc),
            Err(BurrowError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        sync_into(store, &store.views_dir(), id, current.as_ref())
    })
}

fn sync_into(
    store: &Store,
    views_root: &Path,
    id: &str,
    doc: Option<&Document>,
) -> Result<(), BurrowError> {
    let file_name = schemas::document_file_name(id);
    for subject in list_dirs(views_root)? {
        for state in list_dirs(&views_root.join(&subject))? {
            let keep = doc.is_some_and(|d| state == d.state && d.is_owned_by(&subject));
            if keep {
                continue;
            }
            let entry = views_root.join(&subject).join(&state).join(&file_name);
            if fs::symlink_metadata(&entry).is_ok() {
                store.writer().remove(&entry)?;
                debug!(id = %id, subject = %subject, state = %state, "view entry removed");
            }
        }
    }
    if let Some(doc) = doc {
        for owner in &doc.owners {
            write_entry(store, views_root, owner, &doc.state, &doc.id)?;
        }
    }
    Ok(())
}

/// Current on-disk views.
pub fn snapshot(store: &Store) -> Result<ViewSnapshot, BurrowError> {
    store
        .locks()
        .with_lock(schemas::VIEWS_LOCK, || read_snapshot(&store.views_dir()))
}

pub fn for_subject(store: &Store, subject: &str) -> Result<BTreeMap<String, BTreeSet<String>>, BurrowError> {
    Ok(snapshot(store)?.remove(subject).unwrap_or_default())
}

/// Follow a view entry to the canonical document. The entry only proves the document
/// was visible to `subject`; what comes back is always read from the partitions.
pub fn resolve(store: &Store, subject: &str, state: &str, id: &str) -> Result<Document, BurrowError> {
    schemas::validate_identifier(subject)?;
    schemas::validate_identifier(state)?;
    schemas::validate_identifier(id)?;
    let entry = store
        .views_dir()
        .join(subject)
        .join(state)
        .join(schemas::document_file_name(id));
    let present = store
        .locks()
        .with_lock(schemas::VIEWS_LOCK, || Ok(fs::symlink_metadata(&entry).is_ok()))?;
    if !present {
        return Err(BurrowError::NotFound(format!(
            "view entry {}/{}/{}",
            subject, state, id
        )));
    }
    documents::read(store, id)
}

/// The views the canonical partitions call for. Documents that fail to decode cannot
/// contribute and are skipped with a warning.
pub fn expected(store: &Store) -> Result<ViewSnapshot, BurrowError> {
    let mut paths = Vec::new();
    for state in store.manifest().state_ids() {
        for id in documents::list_ids(store, state)? {
            paths.push(store.document_path(state, &id));
        }
    }

    let docs: Vec<Document> = paths
        .par_iter()
        .filter_map(|path| match documents::read_at(path) {
            Ok(doc) => Some(doc),
            Err(BurrowError::NotFound(_)) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping undecodable document");
                None
            }
        })
        .collect();

    let mut out = ViewSnapshot::new();
    for doc in docs {
        for owner in &doc.owners {
            out.entry(owner.clone())
                .or_default()
                .entry(doc.state.clone())
                .or_default()
                .insert(doc.id.clone());
        }
    }
    Ok(out)
}

/// Recompute every view from the canonical partitions. The new tree is built in a
/// sibling directory and swapped in with renames, so readers holding the `views` lock
/// see either the old tree or the new one.
pub fn rebuild(store: &Store) -> Result<ViewSnapshot, BurrowError> {
    store
        .broker()
        .with_lock(schemas::VIEWS_LOCK, "views.rebuild", schemas::VIEWS_DIR, || {
            let expected = expected(store)?;
            let live = store.views_dir();
            let staging = store.root.join(format!(".{}.{}.tmp", schemas::VIEWS_DIR, Ulid::new()));
            fs::create_dir_all(&staging).map_err(BurrowError::IoError)?;

            let built = (|| {
                for (subject, states) in &expected {
                    for (state, ids) in states {
                        for id in ids {
                            write_entry(store, &staging, subject, state, id)?;
                        }
                    }
                }
                Ok::<(), BurrowError>(())
            })();
            if let Err(e) = built {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }

            swap_in(&staging, &live)?;
            let entries: usize = expected.values().flat_map(|s| s.values()).map(|ids| ids.len()).sum();
            info!(subjects = expected.len(), entries, "views rebuilt");
            Ok(expected)
        })
}

fn swap_in(staging: &Path, live: &Path) -> Result<(), BurrowError> {
    let retired = live.with_file_name(format!(".{}.{}.old", schemas::VIEWS_DIR, Ulid::new()));
    let had_live = match fs::rename(live, &retired) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            let _ = fs::remove_dir_all(staging);
            return Err(BurrowError::IoError(e));
        }
    };
    if let Err(e) = fs::rename(staging, live) {
        if had_live {
            let _ = fs::rename(&retired, live);
        }
        let _ = fs::remove_dir_all(staging);
        return Err(BurrowError::IoError(e));
    }
    if had_live {
        if let Err(e) = fs::remove_dir_all(&retired) {
            warn!(path = %retired.display(), error = %e, "could not remove retired views tree");
        }
    }
    Ok(())
}

fn write_entry(store: &Store, views_root: &Path, subject: &str, state: &str, id: &str) -> Result<(), BurrowError> {
    let dir = views_root.join(subject).join(state);
    fs::create_dir_all(&dir).map_err(BurrowError::IoError)?;
    let path = dir.join(schemas::document_file_name(id));
    let target = format!("{}/{}", state, schemas::document_file_name(id));

    match store.manifest().settings.view_mode {
        ViewMode::Symlink if cfg!(unix) => link_entry(&path, &target),
        _ => {
            let entry = ViewEntry {
                document_id: id.to_string(),
                state: state.to_string(),
                target,
            };
            store.writer().replace(&path, &codec::encode(&entry)?)
        }
    }
}

/// Relative link `../../../<state>/<id>.json`, placed with a rename so an existing entry
/// is replaced atomically.
#[cfg(unix)]
fn link_entry(path: &Path, target: &str) -> Result<(), BurrowError> {
    let relative = PathBuf::from("../../..").join(target);
    let tmp = crate::core::durable::temp_path(path);
    std::os::unix::fs::symlink(&relative, &tmp).map_err(BurrowError::IoError)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        BurrowError::IoError(e)
    })
}

#[cfg(not(unix))]
fn link_entry(_path: &Path, _target: &str) -> Result<(), BurrowError> {
    Err(BurrowError::IoError(std::io::Error::from(ErrorKind::Unsupported)))
}

pub(crate) fn read_snapshot(views_root: &Path) -> Result<ViewSnapshot, BurrowError> {
    let mut out = ViewSnapshot::new();
    for subject in list_dirs(views_root)? {
        for state in list_dirs(&views_root.join(&subject))? {
            let entries = match fs::read_dir(views_root.join(&subject).join(&state)) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(BurrowError::IoError(e)),
            };
            let mut ids = BTreeSet::new();
            for entry in entries {
                let name = entry.map_err(BurrowError::IoError)?.file_name();
                if let Some(id) = name.to_str().and_then(schemas::document_id_from_file_name) {
                    ids.insert(id.to_string());
                }
            }
            if !ids.is_empty() {
                out.entry(subject.clone()).or_default().insert(state, ids);
            }
        }
    }
    Ok(out)
}

/// Visible subdirectory names, sorted.
fn list_dirs(dir: &Path) -> Result<Vec<String>, BurrowError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BurrowError::IoError(e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(BurrowError::IoError)?;
        if !entry.file_type().map_err(BurrowError::IoError)?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                out.push(name.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}
