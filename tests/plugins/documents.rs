use burrow::core::codec;
use burrow::core::schemas;
use burrow::plugins::documents::{self, HistoryKind, NewDocument, ReassignMode};
use burrow::plugins::query::{self, DocumentFilter};
use burrow::{
    BurrowError, CapacityPolicy, FieldUpdates, RecoveryHint, RuntimeOptions, Store, StoreManifest,
    Subject, ValidationRules,
};
use serde_json::json;
use std::fs;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

fn open_board(manifest: StoreManifest) -> (TempDir, Store) {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("board");
    let subjects = [
        Subject::human("a1", "Ada"),
        Subject::automated("a2", "Builder"),
        Subject::human("a3", "Cy"),
    ];
    Store::init(&root, &manifest, &subjects).unwrap();
    let options = RuntimeOptions {
        lock_timeout: Duration::from_secs(5),
        ..RuntimeOptions::default()
    };
    let store = Store::open_with(&root, "a1", options).unwrap();
    (tmp, store)
}

fn board(policy: CapacityPolicy) -> (TempDir, Store) {
    open_board(StoreManifest::board("ops", "Ops", policy))
}

fn updates(pairs: &[(&str, serde_json::Value)]) -> FieldUpdates {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn test_board_scenario() {
    let (_tmp, store) = board(CapacityPolicy::Reject);

    // 1. Create
    let d1 = documents::create(&store, "backlog", NewDocument::titled("X"), &["a1"]).unwrap();
    let backlog_path = store.document_path("backlog", &d1.id);
    assert!(backlog_path.is_file());

    // 2. Transition relocates and appends `moved`
    let outcome = documents::transition(&store, &d1.id, "doing").unwrap();
    assert!(outcome.moved);
    assert!(!backlog_path.exists());
    assert!(store.document_path("doing", &d1.id).is_file());
    let moved = outcome.document.last_history().unwrap();
    assert_eq!(moved.kind, HistoryKind::Moved);
    assert_eq!(moved.detail, "backlog -> doing");

    // 3. Reassign with replace
    let doc = documents::reassign(&store, &d1.id, &["a2"], ReassignMode::Replace).unwrap();
    assert_eq!(doc.owners, vec!["a2".to_string()]);
    let reassigned = doc.last_history().unwrap();
    assert_eq!(reassigned.kind, HistoryKind::Reassigned);
    assert_eq!(reassigned.detail, r#"["a1"]->["a2"]"#);

    // 4. Enumerate by state
    let doing: Vec<_> = query::enumerate(&store, DocumentFilter::default().in_state("doing"))
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(doing.iter().any(|d| d.id == d1.id));

    // 5. The file on disk agrees with what the calls returned
    let on_disk = documents::read(&store, &d1.id).unwrap();
    assert_eq!(on_disk, doc);
    let kinds: Vec<_> = on_disk.history.iter().map(|h| h.kind).collect();
    assert_eq!(
        kinds,
        vec![HistoryKind::Created, HistoryKind::Moved, HistoryKind::Reassigned]
    );
}

#[test]
fn test_create_defaults() {
    let (_tmp, store) = board(CapacityPolicy::Reject);

    let doc = documents::create(&store, "backlog", NewDocument::titled("Defaults"), &[]).unwrap();
    assert!(doc.id.starts_with("T-"));
    assert_eq!(doc.state, "backlog");
    assert_eq!(doc.version, schemas::SCHEMA_VERSION);
    assert_eq!(doc.priority, "medium");
    assert_eq!(doc.owners, vec!["a1".to_string()]);
    assert_eq!(doc.history.len(), 1);
    assert_eq!(doc.history[0].kind, HistoryKind::Created);
    assert_eq!(doc.history[0].actor, "a1");

    let raw: serde_json::Value =
        serde_json::from_slice(&fs::read(store.document_path("backlog", &doc.id)).unwrap()).unwrap();
    assert_eq!(raw["id"], json!(doc.id));
    assert_eq!(raw["version"], json!(1));
    assert!(raw["history"].is_array());

    let other = documents::create(&store, "backlog", NewDocument::titled("Defaults"), &[]).unwrap();
    assert_ne!(doc.id, other.id);
}

#[test]
fn test_create_rejects_unknown_state_and_owner() {
    let (_tmp, store) = board(CapacityPolicy::Reject);

    assert!(matches!(
        documents::create(&store, "someday", NewDocument::titled("X"), &[]),
        Err(BurrowError::UnknownState(s)) if s == "someday"
    ));
    assert!(matches!(
        documents::create(&store, "backlog", NewDocument::titled("X"), &["a1", "ghost"]),
        Err(BurrowError::UnknownSubject(s)) if s == "ghost"
    ));
    assert_eq!(documents::count_in_state(&store, "backlog").unwrap(), 0);
}

#[test]
fn test_transition_to_current_state_is_noop() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    let doc = documents::create(&store, "todo", NewDocument::titled("Stay"), &["a1"]).unwrap();

    let outcome = documents::transition(&store, &doc.id, "todo").unwrap();
    assert!(!outcome.moved);
    assert_eq!(outcome.document.history.len(), 1);

    let again = documents::read(&store, &doc.id).unwrap();
    assert_eq!(again.history.len(), 1);
    assert_eq!(again, doc);
}

#[test]
fn test_transition_to_undeclared_state_leaves_document() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    let doc = documents::create(&store, "todo", NewDocument::titled("Stay"), &["a1"]).unwrap();

    assert!(matches!(
        documents::transition(&store, &doc.id, "views"),
        Err(BurrowError::UnknownState(_))
    ));
    assert_eq!(documents::locate(&store, &doc.id).unwrap().0, "todo");
}

#[test]
fn test_update_fields_allow_list() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    let doc = documents::create(&store, "backlog", NewDocument::titled("Old"), &["a1"]).unwrap();
    let path = store.document_path("backlog", &doc.id);

    // 1. Allowed fields, including a single metadata key
    let updated = documents::update_fields(
        &store,
        &doc.id,
        &updates(&[("title", json!("New")), ("metadata.points", json!(3))]),
    )
    .unwrap();
    assert_eq!(updated.title, "New");
    assert_eq!(updated.metadata["points"], json!(3));
    assert_eq!(updated.history.len(), 2);
    let entry = updated.last_history().unwrap();
    assert_eq!(entry.kind, HistoryKind::Updated);
    assert!(entry.detail.contains("title: \"Old\" -> \"New\""), "{}", entry.detail);

    // 2. Structural fields are never settable
    let before = fs::read(&path).unwrap();
    for field in ["id", "state", "history", "owners", "version", "created_at", "requested_by"] {
        let result = documents::update_fields(&store, &doc.id, &updates(&[(field, json!("x"))]));
        assert!(matches!(result, Err(BurrowError::UnknownField(_))), "{} was settable", field);
    }

    // 3. Wrong type names the field
    match documents::update_fields(&store, &doc.id, &updates(&[("tags", json!(42))])) {
        Err(BurrowError::InvalidFieldValue { field, .. }) => assert_eq!(field, "tags"),
        other => panic!("expected InvalidFieldValue, got {:?}", other),
    }
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn test_modify_derives_updates_from_current_record() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    let doc = documents::create(&store, "backlog", NewDocument::titled("Count"), &["a1"]).unwrap();

    for _ in 0..3 {
        documents::modify(&store, &doc.id, |current| {
            let n = current.metadata.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
            Ok(updates(&[("metadata.n", json!(n + 1))]))
        })
        .unwrap();
    }
    let doc = documents::read(&store, &doc.id).unwrap();
    assert_eq!(doc.metadata["n"], json!(3));
    assert_eq!(doc.history.len(), 4);

    // Empty updates change nothing.
    let same = documents::modify(&store, &doc.id, |_| Ok(FieldUpdates::new())).unwrap();
    assert_eq!(same.history.len(), 4);
}

#[test]
fn test_capacity_reject_policy() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    for i in 0..5 {
        documents::create(&store, "doing", NewDocument::titled(&format!("busy {}", i)), &[]).unwrap();
    }
    let extra = documents::create(&store, "backlog", NewDocument::titled("one more"), &[]).unwrap();

    match documents::transition(&store, &extra.id, "doing") {
        Err(BurrowError::CapacityExceeded { state, limit, count }) => {
            assert_eq!(state, "doing");
            assert_eq!(limit, 5);
            assert_eq!(count, 5);
        }
        other => panic!("expected CapacityExceeded, got {:?}", other),
    }
    let still = documents::read(&store, &extra.id).unwrap();
    assert_eq!(still.state, "backlog");
    assert_eq!(still.history.len(), 1);

    assert!(matches!(
        documents::create(&store, "doing", NewDocument::titled("direct"), &[]),
        Err(BurrowError::CapacityExceeded { .. })
    ));
    assert_eq!(documents::count_in_state(&store, "doing").unwrap(), 5);
}

#[test]
fn test_capacity_warn_policy() {
    let (_tmp, store) = board(CapacityPolicy::Warn);
    for i in 0..5 {
        documents::create(&store, "doing", NewDocument::titled(&format!("busy {}", i)), &[]).unwrap();
    }
    let extra = documents::create(&store, "backlog", NewDocument::titled("one more"), &[]).unwrap();

    let outcome = documents::transition(&store, &extra.id, "doing").unwrap();
    assert!(outcome.moved);
    let warning = outcome.warning.unwrap();
    assert!(warning.contains("doing"), "{}", warning);
    assert_eq!(documents::count_in_state(&store, "doing").unwrap(), 6);
}

#[test]
fn test_reassign_modes_and_unknown_subject() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    let doc = documents::create(&store, "todo", NewDocument::titled("Share"), &["a1"]).unwrap();

    let doc2 = documents::reassign(&store, &doc.id, &["a3", "a1"], ReassignMode::Augment).unwrap();
    assert_eq!(doc2.owners, vec!["a1".to_string(), "a3".to_string()]);
    assert_eq!(doc2.last_history().unwrap().detail, r#"["a1"]->["a1","a3"]"#);

    let err = documents::reassign(&store, &doc.id, &["a2", "nobody"], ReassignMode::Replace);
    assert!(matches!(err, Err(BurrowError::UnknownSubject(s)) if s == "nobody"));
    assert_eq!(documents::read(&store, &doc.id).unwrap(), doc2);

    // Reassigning to the same set still records the event.
    let doc3 = documents::reassign(&store, &doc.id, &["a1", "a3"], ReassignMode::Replace).unwrap();
    assert_eq!(doc3.history.len(), doc2.history.len() + 1);
}

#[test]
fn test_dependencies_are_editable_ids() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    let base = documents::create(&store, "todo", NewDocument::titled("Base"), &["a1"]).unwrap();

    // 1. Set at create, repeats dropped
    let doc = documents::create(
        &store,
        "backlog",
        NewDocument::titled("Follow-up").with_dependencies(&[base.id.as_str(), base.id.as_str()]),
        &["a1"],
    )
    .unwrap();
    assert_eq!(doc.dependencies, vec![base.id.clone()]);
    assert_eq!(doc.requested_by.as_deref(), Some("a1"));

    // 2. Editable like any other mutable field
    let updated = documents::update_fields(&store, &doc.id, &updates(&[("dependencies", json!([]))])).unwrap();
    assert!(updated.dependencies.is_empty());

    // 3. Self-references and path-like ids are rejected before any write
    let before = fs::read(store.document_path("backlog", &doc.id)).unwrap();
    for bad in [json!([doc.id.clone()]), json!(["../escape"])] {
        match documents::update_fields(&store, &doc.id, &updates(&[("dependencies", bad)])) {
            Err(BurrowError::InvalidFieldValue { field, .. }) => assert_eq!(field, "dependencies"),
            other => panic!("expected InvalidFieldValue, got {:?}", other),
        }
    }
    assert_eq!(fs::read(store.document_path("backlog", &doc.id)).unwrap(), before);
    assert!(matches!(
        documents::create(&store, "backlog", NewDocument::titled("Bad").with_dependencies(&["a/b"]), &[]),
        Err(BurrowError::InvalidFieldValue { .. })
    ));
}

#[test]
fn test_reassign_to_superagent() {
    // 1. Without a configured superagent the escalation is a configuration error
    let (_tmp, store) = board(CapacityPolicy::Reject);
    let doc = documents::create(&store, "todo", NewDocument::titled("Stuck"), &["a2"]).unwrap();
    assert!(matches!(
        documents::reassign_to_superagent(&store, &doc.id, ReassignMode::Replace),
        Err(BurrowError::ConfigError { .. })
    ));

    // 2. Configured: replace hands the document over
    let mut manifest = StoreManifest::board("ops", "Ops", CapacityPolicy::Reject);
    manifest.settings.default_superagent = Some("a3".to_string());
    let (_tmp, store) = open_board(manifest);
    let doc = documents::create(&store, "todo", NewDocument::titled("Stuck"), &["a2"]).unwrap();
    let escalated = documents::reassign_to_superagent(&store, &doc.id, ReassignMode::Replace).unwrap();
    assert_eq!(escalated.owners, vec!["a3".to_string()]);
    assert_eq!(escalated.last_history().unwrap().detail, r#"["a2"]->["a3"]"#);

    // 3. A superagent missing from the catalog is an unknown subject
    let mut manifest = StoreManifest::board("ops", "Ops", CapacityPolicy::Reject);
    manifest.settings.default_superagent = Some("lead".to_string());
    let (_tmp, store) = open_board(manifest);
    let doc = documents::create(&store, "todo", NewDocument::titled("Stuck"), &["a2"]).unwrap();
    assert!(matches!(
        documents::reassign_to_superagent(&store, &doc.id, ReassignMode::Augment),
        Err(BurrowError::UnknownSubject(s)) if s == "lead"
    ));
}

#[test]
fn test_comment_and_archive() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    let doc = documents::create(&store, "done", NewDocument::titled("Wrap up"), &[]).unwrap();

    let doc = documents::comment(&store, &doc.id, "shipped in 1.2").unwrap();
    let entry = doc.last_history().unwrap();
    assert_eq!(entry.kind, HistoryKind::Comment);
    assert_eq!(entry.detail, "shipped in 1.2");
    assert_eq!(doc.title, "Wrap up");

    let outcome = documents::archive(&store, &doc.id).unwrap();
    assert_eq!(outcome.document.state, "archived");
    assert_eq!(documents::locate(&store, &doc.id).unwrap().0, "archived");
}

#[test]
fn test_truncated_document_is_corrupt_and_recoverable() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    let doc = documents::create(&store, "backlog", NewDocument::titled("Original"), &[]).unwrap();
    documents::update_fields(&store, &doc.id, &updates(&[("title", json!("Edited"))])).unwrap();
    let path = store.document_path("backlog", &doc.id);

    // 1. Truncate
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    match documents::read(&store, &doc.id) {
        Err(BurrowError::CorruptRecord { path: p, recovery, .. }) => {
            assert_eq!(p, path);
            assert_eq!(recovery, RecoveryHint::Backup(codec::backup_path(&path)));
        }
        other => panic!("expected CorruptRecord, got {:?}", other),
    }

    // 2. Empty is corrupt too, never a blank record
    fs::write(&path, b"").unwrap();
    assert!(matches!(
        documents::read(&store, &doc.id),
        Err(BurrowError::CorruptRecord { .. })
    ));

    // 3. The backup still decodes, and restoring it recovers the prior version
    let backup: documents::Document =
        codec::decode_required(&path, &fs::read(codec::backup_path(&path)).unwrap()).unwrap();
    assert_eq!(backup.title, "Original");
    let restored = documents::restore_backup(&store, &doc.id).unwrap();
    assert_eq!(restored.title, "Original");
    assert_eq!(documents::read(&store, &doc.id).unwrap().title, "Original");
}

#[test]
fn test_read_unknown_and_malformed_ids() {
    let (_tmp, store) = board(CapacityPolicy::Reject);
    assert!(matches!(documents::read(&store, "T-NOPE"), Err(BurrowError::NotFound(_))));
    assert!(matches!(
        documents::read(&store, "../store"),
        Err(BurrowError::InvalidIdentifier(_))
    ));
}

#[test]
fn test_enumerate_filters_and_pages() {
    let (_tmp, store) = board(CapacityPolicy::Warn);
    let mut ids = Vec::new();
    for i in 0..7 {
        let tags: &[&str] = if i % 2 == 0 { &["ui"] } else { &["api"] };
        let owner = if i < 4 { "a1" } else { "a2" };
        let new = NewDocument::titled(&format!("Item {}", i))
            .with_tags(tags)
            .with_description(if i == 6 { "needs Review" } else { "" });
        ids.push(documents::create(&store, "todo", new, &[owner]).unwrap().id);
    }
    documents::create(&store, "backlog", NewDocument::titled("Elsewhere"), &[]).unwrap();
    // Ids only order by creation across milliseconds; within one they order by ULID.
    ids.sort();

    // 1. Pages of three, restartable from any cursor
    let filter = DocumentFilter::default().in_state("todo").page_size(3);
    let first = query::page(&store, &filter, None).unwrap();
    assert_eq!(first.documents.len(), 3);
    let second = query::page(&store, &filter, first.next.as_ref()).unwrap();
    assert_eq!(second.documents.len(), 3);
    let third = query::page(&store, &filter, second.next.as_ref()).unwrap();
    assert_eq!(third.documents.len(), 1);
    assert!(third.next.is_none());
    let seen: Vec<_> = first
        .documents
        .iter()
        .chain(&second.documents)
        .chain(&third.documents)
        .map(|d| d.id.clone())
        .collect();
    assert_eq!(seen, ids);

    let resumed: Vec<_> = query::enumerate_from(&store, filter.clone(), first.next.clone())
        .map(|d| d.unwrap().id)
        .collect();
    assert_eq!(resumed, ids[3..].to_vec());

    // 2. Filters
    let count = |f: DocumentFilter| query::enumerate(&store, f).count();
    assert_eq!(count(DocumentFilter::default()), 8);
    assert_eq!(count(DocumentFilter::default().tagged("ui")), 4);
    assert_eq!(count(DocumentFilter::default().owned_by("a2")), 3);
    assert_eq!(count(DocumentFilter::default().owned_by("a2").tagged("api")), 1);
    assert_eq!(count(DocumentFilter::default().matching("review")), 1);
    assert_eq!(count(DocumentFilter::default().matching("ITEM")), 7);

    // 3. Unknown state in a filter is an error, surfaced once
    let mut bad = query::enumerate(&store, DocumentFilter::default().in_state("nope"));
    assert!(matches!(bad.next(), Some(Err(BurrowError::UnknownState(_)))));
    assert!(bad.next().is_none());
}

#[test]
fn test_manifest_validation_blocks_writes() {
    let mut manifest = StoreManifest::board("ops", "Ops", CapacityPolicy::Reject);
    manifest.validation = Some(ValidationRules {
        required_fields: vec!["title".to_string()],
        max_title_len: Some(10),
        allowed_priorities: vec!["low".to_string(), "medium".to_string(), "high".to_string()],
    });
    let (_tmp, store) = open_board(manifest);

    assert!(matches!(
        documents::create(&store, "backlog", NewDocument::titled("a title that is too long"), &[]),
        Err(BurrowError::SchemaValidationError { .. })
    ));
    assert!(matches!(
        documents::create(&store, "backlog", NewDocument::titled(""), &[]),
        Err(BurrowError::SchemaValidationError { .. })
    ));
    assert_eq!(documents::count_in_state(&store, "backlog").unwrap(), 0);

    let doc = documents::create(&store, "backlog", NewDocument::titled("ok"), &[]).unwrap();
    let result = documents::update_fields(&store, &doc.id, &updates(&[("priority", json!("urgent"))]));
    assert!(matches!(result, Err(BurrowError::SchemaValidationError { .. })));
    assert_eq!(documents::read(&store, &doc.id).unwrap().priority, "medium");

    // Without the validator the same write goes through.
    let relaxed = store.clone().without_validator();
    documents::update_fields(&relaxed, &doc.id, &updates(&[("priority", json!("urgent"))])).unwrap();
}
