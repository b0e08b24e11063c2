use burrow::core::broker::{self, StoreBroker};
use burrow::core::codec::{self, RuleValidator};
use burrow::core::config::{CapacityPolicy, RuntimeOptions, StoreManifest, ValidationRules};
use burrow::core::durable::DurableWriter;
use burrow::core::error::{BurrowError, RecoveryHint};
use burrow::core::lock::{LockManager, LockMarker};
use burrow::core::schemas;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn quick_options() -> RuntimeOptions {
    RuntimeOptions {
        lock_timeout: Duration::from_millis(200),
        ..RuntimeOptions::default()
    }
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct Counter {
    #[serde(default)]
    version: Option<u32>,
    name: String,
    value: u64,
}

#[test]
fn lock_is_exclusive_and_names_the_holder_on_timeout() {
    let tmp = tempdir().unwrap();
    let locks_dir = tmp.path().join("locks");
    let alice = LockManager::new(&locks_dir, "alice", &quick_options());
    let bob = LockManager::new(&locks_dir, "bob", &quick_options());

    let guard = alice.acquire("doc-1").unwrap();
    let started = Instant::now();
    match bob.acquire("doc-1") {
        Err(BurrowError::LockTimeout { resource, holder, .. }) => {
            assert_eq!(resource, "doc-1");
            assert_eq!(holder.as_deref(), Some("alice"));
        }
        other => panic!("expected LockTimeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(200));

    // Other resources are independent.
    bob.acquire("doc-2").unwrap();

    drop(guard);
    assert!(!alice.marker_path("doc-1").exists());
    bob.acquire("doc-1").unwrap();
}

#[test]
fn stale_marker_is_reclaimed_without_waiting_for_timeout() {
    let tmp = tempdir().unwrap();
    let locks_dir = tmp.path().join("locks");
    fs::create_dir_all(&locks_dir).unwrap();
    let options = RuntimeOptions {
        lock_timeout: Duration::from_secs(10),
        ..RuntimeOptions::default()
    };
    let manager = LockManager::new(&locks_dir, "second", &options);

    // 1. A crashed holder left a marker from ten minutes ago.
    let abandoned = LockMarker {
        resource: "doc-1".to_string(),
        holder: "crashed".to_string(),
        pid: 1,
        acquired_at_ms: burrow::core::time::now_unix_millis() - 600_000,
        token: "old".to_string(),
    };
    fs::write(manager.marker_path("doc-1"), serde_json::to_vec(&abandoned).unwrap()).unwrap();
    assert_eq!(manager.stale_markers().unwrap().len(), 1);

    // 2. The next acquirer takes it over well inside its timeout.
    let started = Instant::now();
    let guard = manager.acquire("doc-1").unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    let marker = manager.inspect("doc-1").unwrap().unwrap();
    assert_eq!(marker.holder, "second");
    assert_ne!(marker.token, "old");

    drop(guard);
    assert!(manager.inspect("doc-1").unwrap().is_none());
}

#[test]
fn fresh_marker_is_not_reclaimed() {
    let tmp = tempdir().unwrap();
    let locks_dir = tmp.path().join("locks");
    let first = LockManager::new(&locks_dir, "first", &quick_options());
    let second = LockManager::new(&locks_dir, "second", &quick_options());

    let _guard = first.acquire("views").unwrap();
    assert!(matches!(second.acquire("views"), Err(BurrowError::LockTimeout { .. })));
    assert_eq!(first.inspect("views").unwrap().unwrap().holder, "first");
}

#[test]
fn remove_if_stale_rechecks_the_marker() {
    let tmp = tempdir().unwrap();
    let locks_dir = tmp.path().join("locks");
    fs::create_dir_all(&locks_dir).unwrap();
    let manager = LockManager::new(&locks_dir, "doctor", &quick_options());
    let path = manager.marker_path("doc-1");

    // 1. Listed as stale
    let abandoned = LockMarker {
        resource: "doc-1".to_string(),
        holder: "crashed".to_string(),
        pid: 1,
        acquired_at_ms: burrow::core::time::now_unix_millis() - 600_000,
        token: "old".to_string(),
    };
    fs::write(&path, serde_json::to_vec(&abandoned).unwrap()).unwrap();
    assert_eq!(manager.stale_markers().unwrap().len(), 1);

    // 2. A live holder takes it over before the removal runs
    let live = LockManager::new(&locks_dir, "live", &quick_options());
    let guard = live.acquire("doc-1").unwrap();
    assert!(!manager.remove_if_stale(&path).unwrap());
    assert_eq!(manager.inspect("doc-1").unwrap().unwrap().holder, "live");

    // 3. The live holder still releases its own marker
    drop(guard);
    assert!(!path.exists());

    // 4. A marker that is still stale is removed
    fs::write(&path, serde_json::to_vec(&abandoned).unwrap()).unwrap();
    assert!(manager.remove_if_stale(&path).unwrap());
    assert!(!path.exists());
    assert!(!manager.remove_if_stale(&path).unwrap());
}

#[test]
fn guard_leaves_a_marker_it_cannot_read() {
    let tmp = tempdir().unwrap();
    let manager = LockManager::new(&tmp.path().join("locks"), "first", &quick_options());
    let guard = manager.acquire("doc-1").unwrap();
    let path = guard.path().to_path_buf();

    // Reclaimed, and the next holder is halfway through writing its marker.
    fs::write(&path, b"{\"resource\":\"doc-1\",\"hol").unwrap();
    drop(guard);
    assert_eq!(fs::read(&path).unwrap(), b"{\"resource\":\"doc-1\",\"hol");
}

#[test]
fn with_lock_releases_on_error_and_panic() {
    let tmp = tempdir().unwrap();
    let manager = LockManager::new(&tmp.path().join("locks"), "t", &quick_options());

    let result: Result<(), BurrowError> =
        manager.with_lock("doc-1", || Err(BurrowError::NotFound("x".to_string())));
    assert!(matches!(result, Err(BurrowError::NotFound(_))));
    assert!(!manager.marker_path("doc-1").exists());

    let panicked = std::panic::catch_unwind(|| {
        let _ = manager.with_lock("doc-1", || -> Result<(), BurrowError> { panic!("simulated crash") });
    });
    assert!(panicked.is_err());
    assert!(!manager.marker_path("doc-1").exists());
}

#[test]
fn locked_increments_are_never_lost() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let counter_path = root.join("counter.json");
    let options = RuntimeOptions {
        lock_timeout: Duration::from_secs(20),
        ..RuntimeOptions::default()
    };
    let writers = 4;
    let rounds = 5;
    let barrier = Arc::new(Barrier::new(writers));

    std::thread::scope(|scope| {
        for w in 0..writers {
            let barrier = Arc::clone(&barrier);
            let root = root.clone();
            let counter_path = counter_path.clone();
            let options = options.clone();
            scope.spawn(move || {
                let locks = LockManager::new(&root.join("locks"), &format!("w{}", w), &options);
                let writer = DurableWriter::from_options(&options);
                barrier.wait();
                for _ in 0..rounds {
                    locks
                        .with_lock("counter", || {
                            let mut c: Counter = codec::read_record(&counter_path, Counter::default)?;
                            std::thread::sleep(Duration::from_millis(2));
                            c.value += 1;
                            writer.write(&counter_path, &codec::encode(&c)?)
                        })
                        .unwrap();
                }
            });
        }
    });

    let c: Counter = codec::read_record(&counter_path, Counter::default).unwrap();
    assert_eq!(c.value, (writers * rounds) as u64);
}

#[test]
fn decode_distinguishes_absent_corrupt_and_mismatched() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("c.json");

    // 1. Empty is absent.
    let c: Counter = codec::decode(&path, b"  \n", Counter::default).unwrap();
    assert_eq!(c, Counter::default());

    // 2. Garbage is corrupt; no backup yet.
    match codec::decode::<Counter, _>(&path, b"{\"name\": \"x\", \"val", Counter::default) {
        Err(BurrowError::CorruptRecord { recovery, .. }) => assert_eq!(recovery, RecoveryHint::NoBackup),
        other => panic!("expected CorruptRecord, got {:?}", other),
    }

    // 3. With a backup on disk the hint points at it.
    fs::write(codec::backup_path(&path), b"{\"name\":\"x\",\"value\":1}").unwrap();
    match codec::decode::<Counter, _>(&path, b"not json", Counter::default) {
        Err(BurrowError::CorruptRecord { recovery, path: p, .. }) => {
            assert_eq!(p, path);
            assert_eq!(recovery, RecoveryHint::Backup(codec::backup_path(&path)));
        }
        other => panic!("expected CorruptRecord, got {:?}", other),
    }

    // 4. Valid JSON, wrong shape.
    assert!(matches!(
        codec::decode::<Counter, _>(&path, b"{\"name\": 5}", Counter::default),
        Err(BurrowError::SchemaMismatch { .. })
    ));

    // 5. Required records treat empty as corruption.
    assert!(matches!(
        codec::decode_required::<Counter>(&path, b""),
        Err(BurrowError::CorruptRecord { .. })
    ));
}

#[test]
fn encode_stamps_version_only_when_absent() {
    let fresh = Counter {
        version: None,
        name: "a".to_string(),
        value: 1,
    };
    let value: serde_json::Value = serde_json::from_slice(&codec::encode(&fresh).unwrap()).unwrap();
    assert_eq!(value["version"], serde_json::json!(schemas::SCHEMA_VERSION));

    let pinned = Counter {
        version: Some(7),
        ..fresh
    };
    let bytes = codec::encode(&pinned).unwrap();
    assert!(bytes.ends_with(b"\n"));
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["version"], serde_json::json!(7));
}

#[test]
fn validator_rejects_before_anything_is_written() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("doc.json");
    let validator = RuleValidator::new(ValidationRules {
        required_fields: vec!["title".to_string()],
        max_title_len: Some(5),
        allowed_priorities: vec!["low".to_string(), "high".to_string()],
    });
    let record = serde_json::json!({ "title": "far too long", "priority": "urgent" });

    match codec::encode_validated(&path, &record, Some(&validator)) {
        Err(BurrowError::SchemaValidationError { violations, .. }) => assert_eq!(violations.len(), 2),
        other => panic!("expected SchemaValidationError, got {:?}", other),
    }
    assert!(!path.exists());

    // Without a validator the same record encodes fine.
    assert!(codec::encode_validated(&path, &record, None).is_ok());
}

#[test]
fn durable_write_keeps_one_backup_and_no_temp_files() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("doing").join("T-1.json");
    let writer = DurableWriter::default();

    writer.write(&path, b"{\"v\":1}\n").unwrap();
    assert!(!codec::backup_path(&path).exists());
    writer.write(&path, b"{\"v\":2}\n").unwrap();
    writer.write(&path, b"{\"v\":3}\n").unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"{\"v\":3}\n");
    assert_eq!(fs::read(codec::backup_path(&path)).unwrap(), b"{\"v\":2}\n");

    let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(schemas::TEMP_SUFFIX))
        .collect();
    assert!(leftovers.is_empty(), "temp files left: {:?}", leftovers);

    // Restoring puts the previous generation back.
    assert!(writer.restore_backup(&path).unwrap());
    assert_eq!(fs::read(&path).unwrap(), b"{\"v\":2}\n");
}

#[test]
fn relocate_carries_the_backup_along() {
    let tmp = tempdir().unwrap();
    let from = tmp.path().join("backlog").join("T-1.json");
    let to = tmp.path().join("doing").join("T-1.json");
    let writer = DurableWriter::default();
    writer.write(&from, b"{\"v\":1}\n").unwrap();
    writer.write(&from, b"{\"v\":2}\n").unwrap();

    writer.relocate(&from, &to).unwrap();

    assert!(!from.exists());
    assert!(!codec::backup_path(&from).exists());
    assert_eq!(fs::read(&to).unwrap(), b"{\"v\":2}\n");
    assert_eq!(fs::read(codec::backup_path(&to)).unwrap(), b"{\"v\":1}\n");
}

#[test]
fn broker_journals_every_gated_call() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let locks = LockManager::new(&root.join("locks"), "a1", &quick_options());
    let broker = StoreBroker::new(root, "a1", locks);

    broker.with_lock("doc-1", "document.update", "T-1", || Ok(())).unwrap();
    let _ = broker.with_lock("doc-1", "document.update", "T-2", || -> Result<(), BurrowError> {
        Err(BurrowError::NotFound("T-2".to_string()))
    });

    let events = broker::read_events(root).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].target, "T-1");
    assert_eq!(events[0].status, "success");
    assert_eq!(events[0].actor, "a1");
    assert_eq!(events[1].status, "error");
    assert!(ulid::Ulid::from_string(&events[1].event_id).is_ok());
}

#[test]
fn manifest_load_reports_config_errors_with_path() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join(schemas::MANIFEST_FILE);

    assert!(matches!(StoreManifest::load(&path), Err(BurrowError::NotFound(_))));

    fs::write(&path, "store_id = \"ops\"\n[settings]\n[[states]]\nid = \"todo\"\n").unwrap();
    match StoreManifest::load(&path) {
        Err(BurrowError::ConfigError { path: p, reason }) => {
            assert_eq!(p, path);
            assert!(reason.contains("capacity_policy"), "{}", reason);
        }
        other => panic!("expected ConfigError, got {:?}", other),
    }

    let manifest = StoreManifest::board("ops", "Ops", CapacityPolicy::Warn);
    fs::write(&path, manifest.to_toml().unwrap()).unwrap();
    assert_eq!(StoreManifest::load(&path).unwrap(), manifest);
    assert!(Path::new(&path).is_file());
}
