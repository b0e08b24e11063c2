use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Where a caller can look to recover a record that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryHint {
    /// A `.bak` sibling holding the immediately-prior content exists.
    Backup(PathBuf),
    NoBackup,
}

impl fmt::Display for RecoveryHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryHint::Backup(path) => write!(f, "previous content kept at {}", path.display()),
            RecoveryHint::NoBackup => write!(f, "no backup available"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BurrowError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("I/O error on {} after {attempts} attempt(s): {source}", .path.display())]
    RetryExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Corrupt record at {}: {reason} ({recovery})", .path.display())]
    CorruptRecord {
        path: PathBuf,
        reason: String,
        recovery: RecoveryHint,
    },
    #[error("Schema mismatch at {}: {reason} ({recovery})", .path.display())]
    SchemaMismatch {
        path: PathBuf,
        reason: String,
        recovery: RecoveryHint,
    },
    #[error("Schema validation failed for {}: {}", .path.display(), .violations.join("; "))]
    SchemaValidationError {
        path: PathBuf,
        violations: Vec<String>,
    },
    #[error("Timed out after {waited_ms}ms waiting for lock on '{resource}' (held by {})", .holder.as_deref().unwrap_or("unknown"))]
    LockTimeout {
        resource: String,
        waited_ms: u64,
        holder: Option<String>,
    },
    #[error("State '{state}' is at capacity ({count}/{limit})")]
    CapacityExceeded {
        state: String,
        limit: usize,
        count: usize,
    },
    #[error("Unknown field: {0}")]
    UnknownField(String),
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),
    #[error("Unknown state: {0}")]
    UnknownState(String),
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidFieldValue { field: String, reason: String },
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Store id already registered: {0}")]
    DuplicateStoreId(String),
    #[error("Subject already exists: {0}")]
    DuplicateSubject(String),
    #[error("Parent chain for '{store_id}' would cycle: {}", .chain.join(" -> "))]
    CyclicHierarchy { store_id: String, chain: Vec<String> },
    #[error("Store '{store_id}' cannot move from {from} to {to}")]
    InvalidLifecycle {
        store_id: String,
        from: String,
        to: String,
    },
    #[error("Configuration error in {}: {reason}", .path.display())]
    ConfigError { path: PathBuf, reason: String },
    #[error("Encode error: {0}")]
    EncodeError(String),
    #[error("View sync failed for {document_id} (canonical write committed): {reason}")]
    ViewSync { document_id: String, reason: String },
}
