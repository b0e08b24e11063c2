//! Explicit per-kind mutable-field allow-lists.
//!
//! Field updates arrive as `name -> JSON value` pairs. Each record kind names the
//! fields callers may set; anything else (ids, state, history, timestamps) fails with
//! `UnknownField` before the record is touched. A field listed as a map may also be
//! addressed one key at a time as `<field>.<key>`.

use crate::core::error::BurrowError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

pub type FieldUpdates = BTreeMap<String, JsonValue>;

pub trait MutableFields: Serialize + DeserializeOwned {
    const MUTABLE_FIELDS: &'static [&'static str];
    /// Subset of `MUTABLE_FIELDS` holding string-keyed maps.
    const MAP_FIELDS: &'static [&'static str] = &[];
}

/// One applied change, with the value before and after.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old: JsonValue,
    pub new: JsonValue,
}

impl FieldChange {
    pub fn summary(changes: &[FieldChange]) -> String {
        changes
            .iter()
            .map(|c| format!("{}: {} -> {}", c.field, c.old, c.new))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Reject anything outside the allow-list without touching a record.
pub fn check_allowed<T: MutableFields>(updates: &FieldUpdates) -> Result<(), BurrowError> {
    for field in updates.keys() {
        if !is_allowed::<T>(field) {
            return Err(BurrowError::UnknownField(format!(
                "{} (mutable: {})",
                field,
                T::MUTABLE_FIELDS.join(", ")
            )));
        }
    }
    Ok(())
}

fn is_allowed<T: MutableFields>(field: &str) -> bool {
    if T::MUTABLE_FIELDS.contains(&field) {
        return true;
    }
    match field.split_once('.') {
        Some((base, key)) => !key.is_empty() && T::MAP_FIELDS.contains(&base),
        None => false,
    }
}

/// Apply `updates` to `record`, returning the changed record and the per-field diff.
/// Each value must deserialize into the field's type or the call fails with
/// `InvalidFieldValue` and `record` is left as it was.
pub fn apply<T: MutableFields>(
    record: &T,
    updates: &FieldUpdates,
) -> Result<(T, Vec<FieldChange>), BurrowError> {
    check_allowed::<T>(updates)?;

    let mut value =
        serde_json::to_value(record).map_err(|e| BurrowError::EncodeError(e.to_string()))?;
    let JsonValue::Object(obj) = &mut value else {
        return Err(BurrowError::EncodeError(
            "mutable records must encode as JSON objects".to_string(),
        ));
    };

    let mut changes = Vec::with_capacity(updates.len());
    for (field, new) in updates {
        let old = match field.split_once('.') {
            Some((base, key)) if !T::MUTABLE_FIELDS.contains(&field.as_str()) => {
                let slot = obj
                    .entry(base.to_string())
                    .or_insert_with(|| JsonValue::Object(Map::new()));
                let JsonValue::Object(map) = slot else {
                    return Err(BurrowError::InvalidFieldValue {
                        field: field.clone(),
                        reason: format!("'{}' is not a map", base),
                    });
                };
                map.insert(key.to_string(), new.clone())
            }
            _ => obj.insert(field.clone(), new.clone()),
        };
        changes.push(FieldChange {
            field: field.clone(),
            old: old.unwrap_or(JsonValue::Null),
            new: new.clone(),
        });

        // Type-check per field so the error names the offending one.
        serde_json::from_value::<T>(JsonValue::Object(obj.clone())).map_err(|e| {
            BurrowError::InvalidFieldValue {
                field: field.clone(),
                reason: e.to_string(),
            }
        })?;
    }

    let updated = serde_json::from_value::<T>(value).map_err(|e| BurrowError::InvalidFieldValue {
        field: updates.keys().cloned().collect::<Vec<_>>().join(","),
        reason: e.to_string(),
    })?;
    Ok((updated, changes))
}
