//! Record codec: pretty JSON with stable field order, a stamped schema version,
//! and an optional pluggable validator run before anything reaches disk.
//!
//! Decoding distinguishes three outcomes that callers must not confuse:
//! - empty input is "absent" and yields the caller's default,
//! - unparsable input is `CorruptRecord`,
//! - well-formed input of the wrong shape is `SchemaMismatch`.

use crate::core::config::ValidationRules;
use crate::core::error::{BurrowError, RecoveryHint};
use crate::core::schemas;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Semantic checks over an encoded record. Returns human-readable violations.
pub trait Validator: Send + Sync {
    fn validate(&self, record: &JsonValue) -> Vec<String>;
}

/// Validator driven by the manifest's `[validation]` table.
#[derive(Debug, Clone, Default)]
pub struct RuleValidator {
    rules: ValidationRules,
}

impl RuleValidator {
    pub fn new(rules: ValidationRules) -> Self {
        Self { rules }
    }
}

impl Validator for RuleValidator {
    fn validate(&self, record: &JsonValue) -> Vec<String> {
        let mut violations = Vec::new();

        for field in &self.rules.required_fields {
            let present = match record.get(field) {
                None | Some(JsonValue::Null) => false,
                Some(JsonValue::String(s)) => !s.trim().is_empty(),
                Some(JsonValue::Array(a)) => !a.is_empty(),
                Some(_) => true,
            };
            if !present {
                violations.push(format!("required field '{}' is missing or empty", field));
            }
        }

        if let (Some(max), Some(title)) = (
            self.rules.max_title_len,
            record.get("title").and_then(|t| t.as_str()),
        ) {
            let len = title.chars().count();
            if len > max {
                violations.push(format!("title is {} chars, limit is {}", len, max));
            }
        }

        if !self.rules.allowed_priorities.is_empty() {
            if let Some(priority) = record.get("priority").and_then(|p| p.as_str()) {
                if !self.rules.allowed_priorities.iter().any(|p| p == priority) {
                    violations.push(format!(
                        "priority '{}' not in [{}]",
                        priority,
                        self.rules.allowed_priorities.join(", ")
                    ));
                }
            }
        }

        violations
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(schemas::BACKUP_SUFFIX);
    path.with_file_name(name)
}

pub fn recovery_hint(path: &Path) -> RecoveryHint {
    let backup = backup_path(path);
    if backup.is_file() {
        RecoveryHint::Backup(backup)
    } else {
        RecoveryHint::NoBackup
    }
}

/// Decode `bytes` read from `path`. Whitespace-only input yields `default()`.
pub fn decode<T, F>(path: &Path, bytes: &[u8], default: F) -> Result<T, BurrowError>
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    if is_blank(bytes) {
        return Ok(default());
    }
    parse(path, bytes)
}

/// Like [`decode`] but an empty record is itself corruption, for files that must exist
/// with content (documents).
pub fn decode_required<T>(path: &Path, bytes: &[u8]) -> Result<T, BurrowError>
where
    T: DeserializeOwned,
{
    if is_blank(bytes) {
        return Err(BurrowError::CorruptRecord {
            path: path.to_path_buf(),
            reason: "record is empty".to_string(),
            recovery: recovery_hint(path),
        });
    }
    parse(path, bytes)
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b.is_ascii_whitespace())
}

fn parse<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, BurrowError> {
    let value: JsonValue = serde_json::from_slice(bytes).map_err(|e| BurrowError::CorruptRecord {
        path: path.to_path_buf(),
        reason: e.to_string(),
        recovery: recovery_hint(path),
    })?;
    serde_json::from_value(value).map_err(|e| BurrowError::SchemaMismatch {
        path: path.to_path_buf(),
        reason: e.to_string(),
        recovery: recovery_hint(path),
    })
}

/// Read and decode a file; a missing file counts as absent and yields `default()`.
pub fn read_record<T, F>(path: &Path, default: F) -> Result<T, BurrowError>
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    match fs::read(path) {
        Ok(bytes) => decode(path, &bytes, default),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(default()),
        Err(e) => Err(BurrowError::IoError(e)),
    }
}

/// Serialize to a JSON value, stamping `version` when the record does not carry one.
pub fn to_stamped_value<T: Serialize>(record: &T) -> Result<JsonValue, BurrowError> {
    let mut value =
        serde_json::to_value(record).map_err(|e| BurrowError::EncodeError(e.to_string()))?;
    if let JsonValue::Object(map) = &mut value {
        let missing = matches!(map.get("version"), None | Some(JsonValue::Null));
        if missing {
            map.insert("version".to_string(), JsonValue::from(schemas::SCHEMA_VERSION));
        }
    }
    Ok(value)
}

pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, BurrowError> {
    let value = to_stamped_value(record)?;
    render(&value)
}

/// Encode `record` destined for `path`, running `validator` first when one is configured.
pub fn encode_validated<T: Serialize>(
    path: &Path,
    record: &T,
    validator: Option<&dyn Validator>,
) -> Result<Vec<u8>, BurrowError> {
    let value = to_stamped_value(record)?;
    validate(path, &value, validator)?;
    render(&value)
}

pub fn validate(
    path: &Path,
    record: &JsonValue,
    validator: Option<&dyn Validator>,
) -> Result<(), BurrowError> {
    let Some(validator) = validator else {
        return Ok(());
    };
    let violations = validator.validate(record);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(BurrowError::SchemaValidationError {
            path: path.to_path_buf(),
            violations,
        })
    }
}

fn render(value: &JsonValue) -> Result<Vec<u8>, BurrowError> {
    let mut bytes =
        serde_json::to_vec_pretty(value).map_err(|e| BurrowError::EncodeError(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}
