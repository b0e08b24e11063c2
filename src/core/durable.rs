//! Durable writer: backup, write a sibling temp file, atomic rename.
//!
//! Readers never observe a partially written target: the new bytes are fully written
//! and synced to `.<name>.<ulid>.tmp` before a single `rename` replaces the target.
//! The prior content is copied to `<name>.bak` first (one generation only).
//!
//! Transient I/O failures are retried a fixed number of times with a short fixed
//! delay. Validation and corruption failures never reach this layer, so they are
//! never retried.

use crate::core::codec;
use crate::core::config::RuntimeOptions;
use crate::core::error::BurrowError;
use crate::core::schemas;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use ulid::Ulid;

#[derive(Debug, Clone)]
pub struct DurableWriter {
    attempts: u32,
    delay: Duration,
}

impl Default for DurableWriter {
    fn default() -> Self {
        Self::from_options(&RuntimeOptions::default())
    }
}

impl DurableWriter {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_options(options: &RuntimeOptions) -> Self {
        Self::new(options.write_attempts, options.write_retry_delay)
    }

    /// Replace `path` with `bytes`, keeping the previous content as `<path>.bak`.
    pub fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), BurrowError> {
        self.commit(path, bytes, true)
    }

    /// Replace `path` with `bytes` without taking a backup (derived files).
    pub fn replace(&self, path: &Path, bytes: &[u8]) -> Result<(), BurrowError> {
        self.commit(path, bytes, false)
    }

    fn commit(&self, path: &Path, bytes: &[u8], keep_backup: bool) -> Result<(), BurrowError> {
        let parent = parent_dir(path)?;
        retry_transient(path, self.attempts, self.delay, || {
            fs::create_dir_all(&parent)?;
            if keep_backup {
                backup(path)?;
            }
            write_then_rename(path, bytes)?;
            sync_dir(&parent);
            Ok(())
        })?;
        debug!(path = %path.display(), bytes = bytes.len(), "durable write committed");
        Ok(())
    }

    /// Move a file to `to`. Within one filesystem this is a single `rename`, so the file
    /// is never absent from both places. Across filesystems the content is durably
    /// written to `to`, read back and digest-checked, and only then removed from `from`.
    /// The `.bak` sibling follows on a best-effort basis.
    pub fn relocate(&self, from: &Path, to: &Path) -> Result<(), BurrowError> {
        let to_parent = parent_dir(to)?;
        fs::create_dir_all(&to_parent).map_err(BurrowError::IoError)?;

        let renamed = retry_transient(from, self.attempts, self.delay, || {
            match fs::rename(from, to) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::CrossesDevices => Ok(false),
                Err(e) => Err(e),
            }
        })?;

        if renamed {
            sync_dir(&to_parent);
            if let Ok(from_parent) = parent_dir(from) {
                sync_dir(&from_parent);
            }
        } else {
            warn!(from = %from.display(), to = %to.display(), "rename crosses devices; copying");
            self.copy_then_remove(from, to)?;
        }

        let from_backup = codec::backup_path(from);
        if from_backup.exists() {
            let to_backup = codec::backup_path(to);
            let moved = fs::rename(&from_backup, &to_backup)
                .or_else(|_| fs::copy(&from_backup, &to_backup).and_then(|_| fs::remove_file(&from_backup)));
            if let Err(e) = moved {
                warn!(backup = %from_backup.display(), error = %e, "backup did not follow relocated file");
            }
        }
        Ok(())
    }

    /// Copy `from` to `to`, read the copy back, and remove `from` only once the digests
    /// match. On any failure `from` is left untouched and a partial `to` is removed.
    pub fn copy_then_remove(&self, from: &Path, to: &Path) -> Result<(), BurrowError> {
        self.copy_verified(from, to, |path| fs::read(path))
    }

    fn copy_verified<R>(&self, from: &Path, to: &Path, read_back: R) -> Result<(), BurrowError>
    where
        R: Fn(&Path) -> io::Result<Vec<u8>>,
    {
        let bytes = fs::read(from).map_err(BurrowError::IoError)?;
        self.replace(to, &bytes)?;
        let verified = match read_back(to) {
            Ok(written) => Sha256::digest(&written) == Sha256::digest(&bytes),
            Err(_) => false,
        };
        if !verified {
            let _ = fs::remove_file(to);
            return Err(BurrowError::IoError(io::Error::other(format!(
                "copy of {} to {} did not verify",
                from.display(),
                to.display()
            ))));
        }
        self.remove(from)
    }

    pub fn remove(&self, path: &Path) -> Result<(), BurrowError> {
        retry_transient(path, self.attempts, self.delay, || match fs::remove_file(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        })
    }

    /// Put the `.bak` content back in place. Returns `false` if there is no backup.
    /// The backup must itself decode as JSON; a corrupt backup is not restored.
    pub fn restore_backup(&self, path: &Path) -> Result<bool, BurrowError> {
        let backup = codec::backup_path(path);
        let bytes = match fs::read(&backup) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(BurrowError::IoError(e)),
        };
        codec::decode_required::<serde_json::Value>(&backup, &bytes)?;
        self.replace(path, &bytes)?;
        Ok(true)
    }
}

/// Kinds worth another attempt: the same call may succeed a moment later.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::ResourceBusy
            | ErrorKind::StorageFull
            | ErrorKind::Other
    )
}

/// Run `op` up to `attempts` times while it fails transiently; surface the last error
/// once the budget is spent. Non-transient errors return immediately.
pub fn retry_transient<T, F>(
    path: &Path,
    attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, BurrowError>
where
    F: FnMut() -> io::Result<T>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt < attempts => {
                warn!(path = %path.display(), attempt, error = %e, "transient I/O failure; retrying");
                thread::sleep(delay);
            }
            Err(e) if is_transient(&e) => {
                return Err(BurrowError::RetryExhausted {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => return Err(BurrowError::IoError(e)),
        }
    }
}

fn parent_dir(path: &Path) -> Result<PathBuf, BurrowError> {
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| BurrowError::NotFound(format!("parent directory of {}", path.display())))
}

pub fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}{}", name, Ulid::new(), schemas::TEMP_SUFFIX))
}

/// Copy the current target to `<target>.bak` through its own temp file so a crash never
/// leaves a half-written backup.
fn backup(path: &Path) -> io::Result<()> {
    let backup = codec::backup_path(path);
    let tmp = temp_path(&backup);
    match fs::copy(path, &tmp) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    }
    fs::rename(&tmp, &backup).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

fn write_then_rename(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_path(path);
    let written = (|| {
        let mut file: File = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

/// Persist directory entries after a rename. Best effort: not every platform can open
/// a directory for syncing.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
