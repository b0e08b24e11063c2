//! Advisory, marker-file locks with staleness reclaim.
//!
//! A lock is a sidecar file created with `create_new`, which gives single-winner
//! semantics per path across threads and processes. The marker records who holds
//! it and when it was taken. A marker older than the staleness window belongs to a
//! crashed holder and may be reclaimed once per acquisition attempt.
//!
//! This protects cooperating writers from abandoned locks. It is not a defense
//! against writers that ignore the markers.

use crate::core::config::{RuntimeOptions, StoreManifest};
use crate::core::error::BurrowError;
use crate::core::schemas;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, warn};
use ulid::Ulid;

/// Contents of a lock marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub resource: String,
    pub holder: String,
    pub pid: u32,
    pub acquired_at_ms: u64,
    /// Unique per acquisition so a guard never removes somebody else's marker.
    pub token: String,
}

impl LockMarker {
    pub fn age(&self) -> Duration {
        Duration::from_millis(time::now_unix_millis().saturating_sub(self.acquired_at_ms))
    }
}

/// What we could learn about an existing marker.
#[derive(Debug, Clone)]
struct Observed {
    marker: Option<LockMarker>,
    age: Duration,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    holder: String,
    timeout: Duration,
    stale_after: Duration,
    poll_initial: Duration,
    poll_max: Duration,
}

impl LockManager {
    pub fn new(dir: &Path, holder: &str, options: &RuntimeOptions) -> Self {
        Self {
            dir: dir.to_path_buf(),
            holder: holder.to_string(),
            timeout: options.lock_timeout,
            stale_after: options.lock_stale_after,
            poll_initial: options.lock_poll_initial,
            poll_max: options.lock_poll_max,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn marker_path(&self, resource: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", sanitize_resource(resource), schemas::LOCK_SUFFIX))
    }

    pub fn acquire(&self, resource: &str) -> Result<LockGuard, BurrowError> {
        self.acquire_with_timeout(resource, self.timeout)
    }

    /// Poll with exponential backoff until the marker is ours or `timeout` elapses.
    pub fn acquire_with_timeout(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<LockGuard, BurrowError> {
        fs::create_dir_all(&self.dir).map_err(BurrowError::IoError)?;
        let path = self.marker_path(resource);
        let started = Instant::now();
        let mut delay = self.poll_initial;
        let mut reclaimed = false;

        loop {
            if let Some(guard) = self.try_create(resource, &path)? {
                debug!(resource, holder = %self.holder, "lock acquired");
                return Ok(guard);
            }

            let observed = observe(&path)?;
            let Some(observed) = observed else {
                // Released between our create attempt and the read; go again immediately.
                continue;
            };

            if !reclaimed && observed.age > self.stale_after {
                reclaimed = true;
                warn!(
                    resource,
                    age_ms = observed.age.as_millis() as u64,
                    stale_holder = observed.marker.as_ref().map(|m| m.holder.as_str()).unwrap_or("unknown"),
                    "reclaiming stale lock"
                );
                reclaim(&path, &observed)?;
                continue;
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(BurrowError::LockTimeout {
                    resource: resource.to_string(),
                    waited_ms: waited.as_millis() as u64,
                    holder: observed.marker.map(|m| m.holder),
                });
            }
            std::thread::sleep(delay.min(timeout - waited));
            delay = (delay * 2).min(self.poll_max);
        }
    }

    /// Run `f` while holding `resource`; the marker is removed on every exit path,
    /// including errors and unwinding panics.
    pub fn with_lock<F, R>(&self, resource: &str, f: F) -> Result<R, BurrowError>
    where
        F: FnOnce() -> Result<R, BurrowError>,
    {
        let _guard = self.acquire(resource)?;
        f()
    }

    /// Current marker for `resource`, if any.
    pub fn inspect(&self, resource: &str) -> Result<Option<LockMarker>, BurrowError> {
        Ok(observe(&self.marker_path(resource))?.and_then(|o| o.marker))
    }

    /// Marker files older than the staleness window, as `(path, age)`.
    pub fn stale_markers(&self) -> Result<Vec<(PathBuf, Duration)>, BurrowError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BurrowError::IoError(e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry.map_err(BurrowError::IoError)?.path();
            let is_marker = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(schemas::LOCK_SUFFIX))
                .unwrap_or(false);
            if !is_marker {
                continue;
            }
            if let Some(observed) = observe(&path)? {
                if observed.age > self.stale_after {
                    out.push((path, observed.age));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Remove the marker at `path` if it is still stale when looked at now. Returns
    /// `false` if it is gone or fresh, or if a live holder replaced it mid-removal.
    pub fn remove_if_stale(&self, path: &Path) -> Result<bool, BurrowError> {
        let Some(observed) = observe(path)? else {
            return Ok(false);
        };
        if observed.age <= self.stale_after {
            return Ok(false);
        }
        reclaim(path, &observed)
    }

    fn try_create(&self, resource: &str, path: &Path) -> Result<Option<LockGuard>, BurrowError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(BurrowError::IoError(err)),
        };

        let marker = LockMarker {
            resource: resource.to_string(),
            holder: self.holder.clone(),
            pid: std::process::id(),
            acquired_at_ms: time::now_unix_millis(),
            token: Ulid::new().to_string(),
        };
        let written = serde_json::to_vec(&marker)
            .map_err(|e| BurrowError::EncodeError(e.to_string()))
            .and_then(|body| {
                file.write_all(&body)?;
                file.sync_all()?;
                Ok(())
            });
        if let Err(e) = written {
            // We created the file, so a half-written marker is ours to remove.
            let _ = fs::remove_file(path);
            return Err(e);
        }
        Ok(Some(LockGuard {
            path: path.to_path_buf(),
            resource: resource.to_string(),
            token: marker.token,
        }))
    }
}

/// Layout initializer: the marker directory exists before the first acquire.
pub fn initialize_lock_dir(root: &Path, _manifest: &StoreManifest) -> Result<(), BurrowError> {
    fs::create_dir_all(root.join(schemas::LOCKS_DIR)).map_err(BurrowError::IoError)
}

/// Scoped lock ownership. Dropping the guard removes the marker if it is still ours.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    resource: String,
    token: String,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only a marker carrying our token is ours. An unparsable one belongs to a
        // holder that is still writing it.
        let ours = matches!(read_marker(&self.path), Ok(Some(marker)) if marker.token == self.token);
        if !ours {
            warn!(resource = %self.resource, "lock was reclaimed by another holder before release");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(resource = %self.resource, "lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(resource = %self.resource, error = %e, "failed to remove lock marker"),
        }
    }
}

/// Resource keys become file names; anything outside `[A-Za-z0-9_.-]` becomes `-`.
fn sanitize_resource(resource: &str) -> String {
    let mut out = String::with_capacity(resource.len());
    for ch in resource.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    out.trim_start_matches('.').to_string()
}

/// `Ok(None)` when no marker exists. Unparsable markers (a holder that crashed mid-write)
/// come back with `marker: None` and the file mtime as their age.
fn observe(path: &Path) -> Result<Option<Observed>, BurrowError> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BurrowError::IoError(e)),
    };
    let marker = match read_marker(path) {
        Ok(marker) => marker,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BurrowError::IoError(e)),
    };
    let age = match &marker {
        Some(m) => m.age(),
        None => metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|t| Duration::from_millis(time::now_unix_millis().saturating_sub(t.as_millis() as u64)))
            .unwrap_or_default(),
    };
    Ok(Some(Observed { marker, age }))
}

fn read_marker(path: &Path) -> std::io::Result<Option<LockMarker>> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes).ok())
}

/// Move the stale marker aside, then confirm that what we moved is the marker we judged
/// stale. If a fresh holder slipped in between, put its marker back with `hard_link`,
/// which refuses to overwrite.
///
/// Returns whether the stale marker was the one removed.
fn reclaim(path: &Path, stale: &Observed) -> Result<bool, BurrowError> {
    let tombstone = path.with_extension(format!("{}.stale", Ulid::new()));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(BurrowError::IoError(e)),
    }

    let moved = read_marker(&tombstone).ok().flatten();
    let same = match (&moved, &stale.marker) {
        (Some(a), Some(b)) => a.token == b.token,
        (None, None) => true,
        _ => false,
    };
    if !same {
        if let Err(e) = fs::hard_link(&tombstone, path) {
            warn!(path = %path.display(), error = %e, "could not restore live lock marker after reclaim race");
        }
    }
    let _ = fs::remove_file(&tombstone);
    Ok(same)
}
