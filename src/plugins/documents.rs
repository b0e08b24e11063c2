//! Document store: one JSON file per document, partitioned by state directory.
//!
//! `<store_root>/<state>/<id>.json` is the only authoritative copy of a document. The
//! directory a file lives in *is* its state; moving between states is a rename.
//!
//! Every mutation runs under the document's lock (`doc-<id>`) and goes through the
//! durable writer, so a mutation either lands completely (including its history entry)
//! or leaves the file as it was. View synchronization happens after the document lock
//! is released, under the separate `views` lock.

use crate::core::codec;
use crate::core::config::{CapacityPolicy, StoreManifest};
use crate::core::error::BurrowError;
use crate::core::fields::{self, FieldChange, FieldUpdates, MutableFields};
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::{events, subjects, views};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Unlocked scans attempted before `read` falls back to scanning under the document lock.
const OPTIMISTIC_SCANS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Created,
    Updated,
    Moved,
    Reassigned,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub actor: String,
    pub kind: HistoryKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub state: String,
    #[serde(default = "schema_version")]
    pub version: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
    /// Ids of documents this one waits on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Subject told when the document reaches the manifest's `completion_state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Append-only; never edited or truncated.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

fn schema_version() -> u32 {
    schemas::SCHEMA_VERSION
}

impl MutableFields for Document {
    const MUTABLE_FIELDS: &'static [&'static str] =
        &["title", "description", "tags", "priority", "due", "metadata", "dependencies"];
    const MAP_FIELDS: &'static [&'static str] = &["metadata"];
}

impl Document {
    fn push_history(&mut self, actor: &str, kind: HistoryKind, detail: String) {
        let timestamp = time::now_epoch_z();
        self.updated_at = timestamp.clone();
        self.history.push(HistoryEntry {
            timestamp,
            actor: actor.to_string(),
            kind,
            detail,
        });
    }

    pub fn last_history(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    pub fn is_owned_by(&self, subject: &str) -> bool {
        self.owners.iter().any(|o| o == subject)
    }
}

/// Caller-supplied fields for a new document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewDocument {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Falls back to the manifest's `default_priority`.
    pub priority: Option<String>,
    pub due: Option<String>,
    pub metadata: BTreeMap<String, JsonValue>,
    pub dependencies: Vec<String>,
    /// Falls back to the store's actor.
    pub requested_by: Option<String>,
}

impl NewDocument {
    pub fn titled(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: &str) -> Self {
        self.priority = Some(priority.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_dependencies(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn requested_by(mut self, subject: &str) -> Self {
        self.requested_by = Some(subject.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReassignMode {
    /// Owners become exactly the proposed set.
    Replace,
    /// Proposed owners are added to the current ones.
    Augment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub document: Document,
    /// False when the document was already in the target state.
    pub moved: bool,
    /// Set when the target state was over capacity under the `warn` policy.
    pub warning: Option<String>,
}

pub(crate) fn doc_lock(id: &str) -> String {
    format!("doc-{}", id)
}

/// Layout initializer: one directory per declared state.
pub fn initialize_partitions(root: &Path, manifest: &StoreManifest) -> Result<(), BurrowError> {
    for state in manifest.state_ids() {
        fs::create_dir_all(root.join(state)).map_err(BurrowError::IoError)?;
    }
    Ok(())
}

pub fn create(
    store: &Store,
    initial_state: &str,
    new: NewDocument,
    owners: &[&str],
) -> Result<Document, BurrowError> {
    store.require_state(initial_state)?;
    let mut owners = dedup(owners.iter().map(|o| o.to_string()));
    if owners.is_empty() {
        owners.push(store.actor().to_string());
    }
    subjects::require_known(store, &owners)?;
    let requested_by = new.requested_by.unwrap_or_else(|| store.actor().to_string());
    subjects::require_known(store, std::slice::from_ref(&requested_by))?;

    let id = time::new_document_id(&store.manifest().settings.id_prefix);
    let now = time::now_epoch_z();
    let mut doc = Document {
        id: id.clone(),
        state: initial_state.to_string(),
        version: schemas::SCHEMA_VERSION,
        title: new.title,
        description: new.description,
        owners,
        tags: new.tags,
        priority: new
            .priority
            .unwrap_or_else(|| store.manifest().settings.default_priority.clone()),
        due: new.due,
        metadata: new.metadata,
        dependencies: dedup(new.dependencies),
        requested_by: Some(requested_by),
        created_at: now.clone(),
        updated_at: now,
        history: Vec::new(),
    };
    check_dependencies(&doc)?;
    doc.push_history(store.actor(), HistoryKind::Created, format!("created in {}", initial_state));

    let path = store.document_path(initial_state, &id);
    let bytes = codec::encode_validated(&path, &doc, store.validator())?;

    store
        .broker()
        .with_lock(&doc_lock(&id), "document.create", &id, || {
            check_capacity(store, initial_state)?;
            store.writer().write(&path, &bytes)
        })?;
    info!(id = %doc.id, state = %doc.state, "document created");

    sync_views(store, &doc.id)?;
    events::notify_assigned(store, &doc, &doc.owners);
    Ok(doc)
}

/// Find the canonical file for `id`. Scans optimistically first; if a concurrent move
/// hides the file from both scans, rescans while holding the document lock, which no
/// cooperating mover can be inside.
pub fn locate(store: &Store, id: &str) -> Result<(String, PathBuf), BurrowError> {
    schemas::validate_identifier(id)?;
    for _ in 0..OPTIMISTIC_SCANS {
        if let Some(found) = scan(store, id)? {
            return Ok(found);
        }
    }
    store
        .locks()
        .with_lock(&doc_lock(id), || locate_locked(store, id))
}

pub fn read(store: &Store, id: &str) -> Result<Document, BurrowError> {
    schemas::validate_identifier(id)?;
    for attempt in 0..OPTIMISTIC_SCANS {
        let Some((_, path)) = scan(store, id)? else {
            continue;
        };
        match fs::read(&path) {
            Ok(bytes) => return decode_document(&path, &bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(id, attempt, "document moved while reading; rescanning");
            }
            Err(e) => return Err(BurrowError::IoError(e)),
        }
    }
    store.locks().with_lock(&doc_lock(id), || {
        let (_, path) = locate_locked(store, id)?;
        read_at(&path)
    })
}

/// Locked read-modify-write with a fixed set of updates.
pub fn update_fields(store: &Store, id: &str, updates: &FieldUpdates) -> Result<Document, BurrowError> {
    fields::check_allowed::<Document>(updates)?;
    modify(store, id, |_| Ok(updates.clone()))
}

/// Locked read-modify-write where `f` derives the updates from the current record.
/// Appends a single `updated` history entry summarizing every changed field.
/// Empty updates leave the document and its history untouched.
pub fn modify<F>(store: &Store, id: &str, f: F) -> Result<Document, BurrowError>
where
    F: FnOnce(&Document) -> Result<FieldUpdates, BurrowError>,
{
    schemas::validate_identifier(id)?;
    store
        .broker()
        .with_lock(&doc_lock(id), "document.update", id, || {
            let (_, path) = locate_locked(store, id)?;
            let current = read_at(&path)?;
            let updates = f(&current)?;
            if updates.is_empty() {
                return Ok(current);
            }
            let (mut updated, changes) = fields::apply(&current, &updates)?;
            check_dependencies(&updated)?;
            updated.push_history(store.actor(), HistoryKind::Updated, FieldChange::summary(&changes));
            write_document(store, &path, &updated)?;
            debug!(id, fields = changes.len(), "document updated");
            Ok(updated)
        })
}

/// Move a document to `new_state`. Moving to the current state is a no-op.
///
/// The new content (state changed, `moved` appended) is first written durably in place,
/// then a single rename carries it into the target partition. If the rename fails the
/// old content is written back. A crash between the two steps leaves a complete record
/// whose `state` disagrees with its directory; the next transition or a doctor repair
/// finishes the move.
pub fn transition(store: &Store, id: &str, new_state: &str) -> Result<TransitionOutcome, BurrowError> {
    store.require_state(new_state)?;
    schemas::validate_identifier(id)?;
    let outcome = store
        .broker()
        .with_lock(&doc_lock(id), "document.transition", id, || {
            transition_locked(store, id, new_state)
        })?;
    if outcome.moved {
        sync_views(store, &outcome.document.id)?;
        if store.manifest().settings.completion_state.as_deref() == Some(new_state) {
            events::notify_completed(store, &outcome.document);
        }
    }
    Ok(outcome)
}

fn transition_locked(store: &Store, id: &str, new_state: &str) -> Result<TransitionOutcome, BurrowError> {
    let (dir_state, path) = locate_locked(store, id)?;
    let old_bytes = fs::read(&path).map_err(BurrowError::IoError)?;
    let mut doc = decode_document(&path, &old_bytes)?;
    let target = store.document_path(new_state, id);

    if doc.state == new_state {
        if dir_state == new_state {
            return Ok(TransitionOutcome {
                document: doc,
                moved: false,
                warning: None,
            });
        }
        warn!(id, from = %dir_state, to = new_state, "completing interrupted transition");
        store.writer().relocate(&path, &target)?;
        return Ok(TransitionOutcome {
            document: doc,
            moved: true,
            warning: None,
        });
    }

    let warning = check_capacity(store, new_state)?;
    let old_state = std::mem::replace(&mut doc.state, new_state.to_string());
    doc.push_history(store.actor(), HistoryKind::Moved, format!("{} -> {}", old_state, new_state));

    let bytes = codec::encode_validated(&target, &doc, store.validator())?;
    store.writer().write(&path, &bytes)?;
    if let Err(e) = store.writer().relocate(&path, &target) {
        if let Err(rollback) = store.writer().replace(&path, &old_bytes) {
            warn!(id, error = %rollback, "rollback after failed relocation did not complete");
        }
        return Err(e);
    }

    info!(id, from = %old_state, to = new_state, "document moved");
    Ok(TransitionOutcome {
        document: doc,
        moved: true,
        warning,
    })
}

/// Move into the manifest's `archive_state`. Documents are never deleted.
pub fn archive(store: &Store, id: &str) -> Result<TransitionOutcome, BurrowError> {
    let Some(archive_state) = store.manifest().settings.archive_state.clone() else {
        return Err(BurrowError::ConfigError {
            path: store.root.join(schemas::MANIFEST_FILE),
            reason: "no archive_state configured".to_string(),
        });
    };
    transition(store, id, &archive_state)
}

/// Change owners. Every proposed owner must be a known subject. The history entry
/// records the literal owner lists before and after, e.g. `["a1"]->["a2"]`. Owners
/// gained by the change, other than the actor, get an assignment event.
pub fn reassign(
    store: &Store,
    id: &str,
    new_owners: &[&str],
    mode: ReassignMode,
) -> Result<Document, BurrowError> {
    schemas::validate_identifier(id)?;
    let proposed = dedup(new_owners.iter().map(|o| o.to_string()));
    subjects::require_known(store, &proposed)?;

    let (doc, added) = store
        .broker()
        .with_lock(&doc_lock(id), "document.reassign", id, || {
            let (_, path) = locate_locked(store, id)?;
            let mut doc = read_at(&path)?;
            let before = doc.owners.clone();
            let after = match mode {
                ReassignMode::Replace => proposed.clone(),
                ReassignMode::Augment => dedup(before.iter().chain(proposed.iter()).cloned()),
            };
            let added: Vec<String> = after.iter().filter(|o| !before.contains(o)).cloned().collect();
            let detail = format!("{}->{}", owner_list(&before)?, owner_list(&after)?);
            doc.owners = after;
            doc.push_history(store.actor(), HistoryKind::Reassigned, detail);
            write_document(store, &path, &doc)?;
            Ok((doc, added))
        })?;

    sync_views(store, &doc.id)?;
    events::notify_assigned(store, &doc, &added);
    Ok(doc)
}

/// Escalate to the manifest's `default_superagent`. Fails with `ConfigError` when none
/// is configured and `UnknownSubject` when it names no catalog entry.
pub fn reassign_to_superagent(store: &Store, id: &str, mode: ReassignMode) -> Result<Document, BurrowError> {
    let Some(superagent) = store.manifest().settings.default_superagent.clone() else {
        return Err(BurrowError::ConfigError {
            path: store.root.join(schemas::MANIFEST_FILE),
            reason: "no default_superagent configured".to_string(),
        });
    };
    reassign(store, id, &[superagent.as_str()], mode)
}

/// Pure history append.
pub fn comment(store: &Store, id: &str, text: &str) -> Result<Document, BurrowError> {
    schemas::validate_identifier(id)?;
    store
        .broker()
        .with_lock(&doc_lock(id), "document.comment", id, || {
            let (_, path) = locate_locked(store, id)?;
            let mut doc = read_at(&path)?;
            doc.push_history(store.actor(), HistoryKind::Comment, text.to_string());
            write_document(store, &path, &doc)?;
            Ok(doc)
        })
}

/// Put the `.bak` copy back in place, for a document that fails to decode or was
/// damaged by an external writer. The restored record is moved to the partition its
/// `state` names.
pub fn restore_backup(store: &Store, id: &str) -> Result<Document, BurrowError> {
    schemas::validate_identifier(id)?;
    let doc = store
        .broker()
        .with_lock(&doc_lock(id), "document.restore", id, || {
            let (dir_state, path) = locate_locked(store, id)?;
            if !store.writer().restore_backup(&path)? {
                return Err(BurrowError::NotFound(format!("backup of document {}", id)));
            }
            let doc = read_at(&path)?;
            if doc.state != dir_state {
                store.require_state(&doc.state)?;
                store
                    .writer()
                    .relocate(&path, &store.document_path(&doc.state, id))?;
            }
            warn!(id, state = %doc.state, "document restored from backup");
            Ok(doc)
        })?;
    sync_views(store, &doc.id)?;
    Ok(doc)
}

pub fn count_in_state(store: &Store, state: &str) -> Result<usize, BurrowError> {
    store.require_state(state)?;
    Ok(list_ids(store, state)?.len())
}

/// Ids in one partition, sorted (ULID order is creation order).
pub(crate) fn list_ids(store: &Store, state: &str) -> Result<Vec<String>, BurrowError> {
    let entries = match fs::read_dir(store.state_dir(state)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BurrowError::IoError(e)),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(BurrowError::IoError)?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(schemas::document_id_from_file_name) {
            ids.push(id.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

pub(crate) fn read_at(path: &Path) -> Result<Document, BurrowError> {
    match fs::read(path) {
        Ok(bytes) => decode_document(path, &bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(BurrowError::NotFound(format!(
            "document at {}",
            path.display()
        ))),
        Err(e) => Err(BurrowError::IoError(e)),
    }
}

fn decode_document(path: &Path, bytes: &[u8]) -> Result<Document, BurrowError> {
    codec::decode_required(path, bytes)
}

fn write_document(store: &Store, path: &Path, doc: &Document) -> Result<(), BurrowError> {
    let bytes = codec::encode_validated(path, doc, store.validator())?;
    store.writer().write(path, &bytes)
}

/// One pass over the declared partitions, in manifest order.
fn scan(store: &Store, id: &str) -> Result<Option<(String, PathBuf)>, BurrowError> {
    for state in store.manifest().state_ids() {
        let path = store.document_path(state, id);
        match fs::metadata(&path) {
            Ok(m) if m.is_file() => return Ok(Some((state.to_string(), path))),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(BurrowError::IoError(e)),
        }
    }
    Ok(None)
}

/// Caller holds the document lock, so the file cannot be mid-move.
pub(crate) fn locate_locked(store: &Store, id: &str) -> Result<(String, PathBuf), BurrowError> {
    scan(store, id)?.ok_or_else(|| BurrowError::NotFound(format!("document {}", id)))
}

/// `None` when the state has room; `Some(warning)` when it is full under `warn`.
fn check_capacity(store: &Store, state: &str) -> Result<Option<String>, BurrowError> {
    let Some(limit) = store.require_state(state)?.capacity else {
        return Ok(None);
    };
    let count = list_ids(store, state)?.len();
    if count < limit {
        return Ok(None);
    }
    match store.manifest().settings.capacity_policy {
        CapacityPolicy::Reject => Err(BurrowError::CapacityExceeded {
            state: state.to_string(),
            limit,
            count,
        }),
        CapacityPolicy::Warn => {
            warn!(state, limit, count, "state over capacity");
            Ok(Some(format!(
                "state '{}' is over capacity ({}/{})",
                state,
                count + 1,
                limit
            )))
        }
    }
}

fn sync_views(store: &Store, id: &str) -> Result<(), BurrowError> {
    views::sync_document(store, id).map_err(|e| BurrowError::ViewSync {
        document_id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Dependencies name other documents by id: valid identifiers, never the document itself.
fn check_dependencies(doc: &Document) -> Result<(), BurrowError> {
    for dep in &doc.dependencies {
        schemas::validate_identifier(dep).map_err(|_| BurrowError::InvalidFieldValue {
            field: "dependencies".to_string(),
            reason: format!("'{}' is not a valid document id", dep),
        })?;
        if *dep == doc.id {
            return Err(BurrowError::InvalidFieldValue {
                field: "dependencies".to_string(),
                reason: format!("{} cannot depend on itself", doc.id),
            });
        }
    }
    Ok(())
}

fn owner_list(owners: &[String]) -> Result<String, BurrowError> {
    serde_json::to_string(owners).map_err(|e| BurrowError::EncodeError(e.to_string()))
}

/// Drop repeats, keeping first-seen order.
fn dedup<I: IntoIterator<Item = String>>(items: I) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
