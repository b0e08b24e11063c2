use crate::core::error::BurrowError;
use crate::core::lock::LockManager;
use crate::core::schemas;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// The mutation gate. Every write to a store goes through a named lock and leaves one
/// line in `store.events.jsonl`.
#[derive(Debug, Clone)]
pub struct StoreBroker {
    journal_path: PathBuf,
    actor: String,
    locks: LockManager,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub target: String,
    pub status: String,
}

impl StoreBroker {
    pub fn new(root: &Path, actor: &str, locks: LockManager) -> Self {
        Self {
            journal_path: root.join(schemas::JOURNAL_FILE),
            actor: actor.to_string(),
            locks,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Execute a closure while holding `resource`, then journal the outcome.
    /// A lock timeout is journaled too, since the caller never got to run.
    pub fn with_lock<F, R>(&self, resource: &str, op: &str, target: &str, f: F) -> Result<R, BurrowError>
    where
        F: FnOnce() -> Result<R, BurrowError>,
    {
        let result = self.locks.with_lock(resource, f);
        self.record(op, target, status_of(&result));
        result
    }

    /// The journal is informational. A failed append never undoes or fails a mutation
    /// that already committed.
    pub fn record(&self, op: &str, target: &str, status: &str) {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: self.actor.clone(),
            op: op.to_string(),
            target: target.to_string(),
            status: status.to_string(),
        };
        if let Err(e) = append_event(&self.journal_path, &ev) {
            warn!(op, target, error = %e, "failed to append journal event");
        }
    }
}

fn status_of<R>(result: &Result<R, BurrowError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(BurrowError::LockTimeout { .. }) => "lock_timeout",
        Err(_) => "error",
    }
}

fn append_event(path: &Path, ev: &BrokerEvent) -> Result<(), BurrowError> {
    let mut line = serde_json::to_string(ev).map_err(|e| BurrowError::EncodeError(e.to_string()))?;
    line.push('\n');
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(BurrowError::IoError)?;
    // One write per line keeps concurrent appenders from interleaving mid-line.
    f.write_all(line.as_bytes()).map_err(BurrowError::IoError)?;
    Ok(())
}

/// Read the journal back. Lines that fail to parse (a crashed appender) are skipped.
pub fn read_events(root: &Path) -> Result<Vec<BrokerEvent>, BurrowError> {
    let path = root.join(schemas::JOURNAL_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BurrowError::IoError(e)),
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
