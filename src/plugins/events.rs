//! Per-subject notification inbox: `events/<subject>/<event_id>.json`.
//!
//! An event tells one subject that something concerning them happened, typically a
//! document assigned to them or a document they requested reaching the completion
//! state. Each event is its own file written through the durable writer under the
//! `events-<subject>` lock, so inboxes of different subjects never contend.
//!
//! Events start `pending` and move to `read` or `archived`. They are never deleted.

use crate::core::codec;
use crate::core::config::StoreManifest;
use crate::core::error::BurrowError;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::documents::{self, Document};
use crate::plugins::subjects;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Kind of the event raised when a subject gains a document.
pub const ASSIGNED: &str = "document_assigned";
/// Kind of the event raised when a document reaches the completion state.
pub const COMPLETED: &str = "document_completed";

const EVENT_ID_PREFIX: &str = "EVT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Pending,
    Read,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: String,
    pub created_by: String,
    pub notify_subject: String,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub data: BTreeMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
}

impl Event {
    pub fn is_pending(&self) -> bool {
        self.status == EventStatus::Pending
    }

    /// The `document_id` carried in `data`, when the event is about a document.
    pub fn document_id(&self) -> Option<&str> {
        self.data.get("document_id").and_then(JsonValue::as_str)
    }
}

pub fn initialize_events(root: &Path, _manifest: &StoreManifest) -> Result<(), BurrowError> {
    fs::create_dir_all(root.join(schemas::EVENTS_DIR)).map_err(BurrowError::IoError)
}

fn events_lock(subject: &str) -> String {
    format!("events-{}", subject)
}

pub fn inbox_dir(store: &Store, subject: &str) -> PathBuf {
    store.events_dir().join(subject)
}

fn event_path(store: &Store, subject: &str, id: &str) -> PathBuf {
    inbox_dir(store, subject).join(schemas::document_file_name(id))
}

/// Raise an event of `kind` in `notify_subject`'s inbox, created by the store's actor.
pub fn create_event(
    store: &Store,
    kind: &str,
    notify_subject: &str,
    data: BTreeMap<String, JsonValue>,
) -> Result<Event, BurrowError> {
    schemas::validate_identifier(kind)?;
    schemas::validate_identifier(notify_subject)?;
    subjects::require_known(store, &[notify_subject.to_string()])?;

    let event = Event {
        id: format!("{}-{}", EVENT_ID_PREFIX, time::new_event_id()),
        kind: kind.to_string(),
        created_at: time::now_epoch_z(),
        created_by: store.actor().to_string(),
        notify_subject: notify_subject.to_string(),
        status: EventStatus::Pending,
        data,
        read_at: None,
        archived_at: None,
    };
    let path = event_path(store, notify_subject, &event.id);
    let bytes = codec::encode(&event)?;

    store
        .broker()
        .with_lock(&events_lock(notify_subject), "event.create", &event.id, || {
            fs::create_dir_all(inbox_dir(store, notify_subject)).map_err(BurrowError::IoError)?;
            store.writer().write(&path, &bytes)
        })?;
    info!(id = %event.id, kind, subject = notify_subject, "event created");
    Ok(event)
}

/// Tell `assigned_to` that document `document_id` is now theirs. The document's title
/// and description are copied in when it can be read.
pub fn create_assignment_event(
    store: &Store,
    document_id: &str,
    assigned_to: &str,
    notes: Option<&str>,
) -> Result<Event, BurrowError> {
    let doc = read_if_present(store, document_id)?;
    let data = assignment_data(store, document_id, doc.as_ref(), assigned_to, notes);
    create_event(store, ASSIGNED, assigned_to, data)
}

/// Tell `notify_subject` that document `document_id` was completed by the store's actor.
pub fn create_completion_event(
    store: &Store,
    document_id: &str,
    notify_subject: &str,
    notes: Option<&str>,
) -> Result<Event, BurrowError> {
    let doc = read_if_present(store, document_id)?;
    let data = completion_data(store, document_id, doc.as_ref(), notes);
    create_event(store, COMPLETED, notify_subject, data)
}

fn read_if_present(store: &Store, document_id: &str) -> Result<Option<Document>, BurrowError> {
    match documents::read(store, document_id) {
        Ok(doc) => Ok(Some(doc)),
        Err(BurrowError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn document_data(document_id: &str, doc: Option<&Document>) -> BTreeMap<String, JsonValue> {
    let mut data = BTreeMap::new();
    data.insert("document_id".to_string(), JsonValue::from(document_id));
    if let Some(doc) = doc {
        data.insert("document_title".to_string(), JsonValue::from(doc.title.as_str()));
        data.insert("document_description".to_string(), JsonValue::from(doc.description.as_str()));
    }
    data
}

fn assignment_data(
    store: &Store,
    document_id: &str,
    doc: Option<&Document>,
    assigned_to: &str,
    notes: Option<&str>,
) -> BTreeMap<String, JsonValue> {
    let mut data = document_data(document_id, doc);
    data.insert("assigned_to".to_string(), JsonValue::from(assigned_to));
    data.insert("assigned_by".to_string(), JsonValue::from(store.actor()));
    data.insert("assigned_at".to_string(), JsonValue::from(time::now_epoch_z()));
    if let Some(notes) = notes {
        data.insert("assignment_notes".to_string(), JsonValue::from(notes));
    }
    data
}

fn completion_data(
    store: &Store,
    document_id: &str,
    doc: Option<&Document>,
    notes: Option<&str>,
) -> BTreeMap<String, JsonValue> {
    let mut data = document_data(document_id, doc);
    data.insert("completed_by".to_string(), JsonValue::from(store.actor()));
    data.insert("completed_at".to_string(), JsonValue::from(time::now_epoch_z()));
    if let Some(notes) = notes {
        data.insert("completion_notes".to_string(), JsonValue::from(notes));
    }
    data
}

/// Assignment events for every subject in `added` other than the actor. Failures are
/// logged and never fail the mutation that raised them.
pub(crate) fn notify_assigned(store: &Store, doc: &Document, added: &[String]) {
    for subject in added.iter().filter(|s| s.as_str() != store.actor()) {
        let data = assignment_data(store, &doc.id, Some(doc), subject, None);
        if let Err(e) = create_event(store, ASSIGNED, subject, data) {
            warn!(id = %doc.id, subject = %subject, error = %e, "failed to raise assignment event");
        }
    }
}

/// Completion event for the document's requester, unless the requester completed it.
pub(crate) fn notify_completed(store: &Store, doc: &Document) {
    let Some(requester) = doc.requested_by.as_deref() else {
        return;
    };
    if requester == store.actor() {
        return;
    }
    let data = completion_data(store, &doc.id, Some(doc), None);
    if let Err(e) = create_event(store, COMPLETED, requester, data) {
        warn!(id = %doc.id, subject = requester, error = %e, "failed to raise completion event");
    }
}

pub fn get_event(store: &Store, subject: &str, id: &str) -> Result<Event, BurrowError> {
    schemas::validate_identifier(subject)?;
    schemas::validate_identifier(id)?;
    read_event(&event_path(store, subject, id))
}

fn read_event(path: &Path) -> Result<Event, BurrowError> {
    match fs::read(path) {
        Ok(bytes) => codec::decode_required(path, &bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(BurrowError::NotFound(format!("event at {}", path.display())))
        }
        Err(e) => Err(BurrowError::IoError(e)),
    }
}

/// Every event in a subject's inbox, newest first. Files that fail to decode are
/// skipped with a warning.
pub fn list_events(store: &Store, subject: &str) -> Result<Vec<Event>, BurrowError> {
    schemas::validate_identifier(subject)?;
    let dir = inbox_dir(store, subject);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BurrowError::IoError(e)),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(BurrowError::IoError)?;
        if let Some(id) = entry.file_name().to_str().and_then(schemas::document_id_from_file_name) {
            ids.push(id.to_string());
        }
    }
    // ULID suffixes sort by creation time.
    ids.sort_unstable_by(|a, b| b.cmp(a));

    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let path = event_path(store, subject, &id);
        match read_event(&path) {
            Ok(event) => out.push(event),
            Err(BurrowError::NotFound(_)) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping undecodable event"),
        }
    }
    Ok(out)
}

/// Pending events, newest first, optionally of one kind, at most `limit`.
pub fn list_pending(
    store: &Store,
    subject: &str,
    kind: Option<&str>,
    limit: usize,
) -> Result<Vec<Event>, BurrowError> {
    Ok(list_events(store, subject)?
        .into_iter()
        .filter(|e| e.is_pending())
        .filter(|e| kind.is_none_or(|k| e.kind == k))
        .take(limit)
        .collect())
}

/// Locked read-modify-write of one event.
fn update_event<F>(store: &Store, subject: &str, id: &str, op: &str, f: F) -> Result<Event, BurrowError>
where
    F: FnOnce(&mut Event) -> bool,
{
    schemas::validate_identifier(subject)?;
    schemas::validate_identifier(id)?;
    let path = event_path(store, subject, id);
    store.broker().with_lock(&events_lock(subject), op, id, || {
        let mut event = read_event(&path)?;
        if f(&mut event) {
            store.writer().write(&path, &codec::encode(&event)?)?;
            debug!(id, subject, status = ?event.status, "event updated");
        }
        Ok(event)
    })
}

/// Pending becomes read. Read and archived events are returned unchanged.
pub fn mark_read(store: &Store, subject: &str, id: &str) -> Result<Event, BurrowError> {
    update_event(store, subject, id, "event.read", |event| {
        if !event.is_pending() {
            return false;
        }
        event.status = EventStatus::Read;
        event.read_at = Some(time::now_epoch_z());
        true
    })
}

/// Any status becomes archived. Archiving twice keeps the first `archived_at`.
pub fn archive_event(store: &Store, subject: &str, id: &str) -> Result<Event, BurrowError> {
    update_event(store, subject, id, "event.archive", |event| {
        if event.status == EventStatus::Archived {
            return false;
        }
        event.status = EventStatus::Archived;
        event.archived_at = Some(time::now_epoch_z());
        true
    })
}

/// Mark every pending event in the inbox read. Returns how many changed.
pub fn clear_all(store: &Store, subject: &str) -> Result<usize, BurrowError> {
    let mut cleared = 0;
    for event in list_pending(store, subject, None, usize::MAX)? {
        let before = event.status;
        if mark_read(store, subject, &event.id)?.status != before {
            cleared += 1;
        }
    }
    info!(subject, cleared, "inbox cleared");
    Ok(cleared)
}
