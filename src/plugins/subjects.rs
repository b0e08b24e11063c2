//! Subject catalog: the humans and automated agents that own and act on documents.
//!
//! Stored as one record at `<store_root>/subjects.json`. Subjects are never deleted,
//! only retired, so every actor named in a history entry stays resolvable.

use crate::core::codec;
use crate::core::durable::DurableWriter;
use crate::core::error::BurrowError;
use crate::core::fields::{self, FieldUpdates, MutableFields};
use crate::core::schemas;
use crate::core::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Human,
    Automated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub kind: SubjectKind,
    #[serde(default)]
    pub status: SubjectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Subject {
    pub fn human(id: &str, name: &str) -> Self {
        Self::new(id, name, SubjectKind::Human)
    }

    pub fn automated(id: &str, name: &str) -> Self {
        Self::new(id, name, SubjectKind::Automated)
    }

    fn new(id: &str, name: &str, kind: SubjectKind) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            status: SubjectStatus::Active,
            role: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == SubjectStatus::Active
    }
}

impl MutableFields for Subject {
    const MUTABLE_FIELDS: &'static [&'static str] = &["name", "role", "status", "capabilities"];
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubjectCatalog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

impl SubjectCatalog {
    pub fn get(&self, id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Subject> {
        self.subjects.iter_mut().find(|s| s.id == id)
    }

    fn insert(&mut self, subject: Subject) -> Result<(), BurrowError> {
        schemas::validate_identifier(&subject.id)?;
        if self.get(&subject.id).is_some() {
            return Err(BurrowError::DuplicateSubject(subject.id));
        }
        self.subjects.push(subject);
        Ok(())
    }
}

pub fn catalog_path(root: &Path) -> PathBuf {
    root.join(schemas::SUBJECTS_FILE)
}

pub fn load_catalog(root: &Path) -> Result<SubjectCatalog, BurrowError> {
    codec::read_record(&catalog_path(root), SubjectCatalog::default)
}

fn write_catalog(writer: &DurableWriter, root: &Path, catalog: &SubjectCatalog) -> Result<(), BurrowError> {
    let bytes = codec::encode(catalog)?;
    writer.write(&catalog_path(root), &bytes)
}

/// Write the initial catalog for a new store.
pub fn initialize_catalog(writer: &DurableWriter, root: &Path, subjects: &[Subject]) -> Result<(), BurrowError> {
    let mut catalog = SubjectCatalog::default();
    for subject in subjects {
        catalog.insert(subject.clone())?;
    }
    write_catalog(writer, root, &catalog)
}

pub fn subjects(store: &Store) -> Result<Vec<Subject>, BurrowError> {
    Ok(load_catalog(&store.root)?.subjects)
}

pub fn subject(store: &Store, id: &str) -> Result<Subject, BurrowError> {
    load_catalog(&store.root)?
        .get(id)
        .cloned()
        .ok_or_else(|| BurrowError::UnknownSubject(id.to_string()))
}

/// Fail with `UnknownSubject` naming the first id the catalog does not hold.
pub fn require_known(store: &Store, ids: &[String]) -> Result<(), BurrowError> {
    let catalog = load_catalog(&store.root)?;
    let known: HashSet<&str> = catalog.subjects.iter().map(|s| s.id.as_str()).collect();
    match ids.iter().find(|id| !known.contains(id.as_str())) {
        Some(missing) => Err(BurrowError::UnknownSubject(missing.clone())),
        None => Ok(()),
    }
}

pub fn add_subject(store: &Store, subject: Subject) -> Result<Subject, BurrowError> {
    let id = subject.id.clone();
    store
        .broker()
        .with_lock(schemas::SUBJECTS_LOCK, "subject.add", &id, || {
            let mut catalog = load_catalog(&store.root)?;
            catalog.insert(subject.clone())?;
            write_catalog(store.writer(), &store.root, &catalog)?;
            info!(subject = %id, "subject added");
            Ok(subject)
        })
}

pub fn update_subject(store: &Store, id: &str, updates: &FieldUpdates) -> Result<Subject, BurrowError> {
    fields::check_allowed::<Subject>(updates)?;
    store
        .broker()
        .with_lock(schemas::SUBJECTS_LOCK, "subject.update", id, || {
            let mut catalog = load_catalog(&store.root)?;
            let slot = catalog
                .get_mut(id)
                .ok_or_else(|| BurrowError::UnknownSubject(id.to_string()))?;
            let (updated, _changes) = fields::apply(&*slot, updates)?;
            *slot = updated.clone();
            write_catalog(store.writer(), &store.root, &catalog)?;
            Ok(updated)
        })
}

/// Mark a subject inactive. Documents it owns keep naming it.
pub fn retire_subject(store: &Store, id: &str) -> Result<Subject, BurrowError> {
    let mut updates = FieldUpdates::new();
    updates.insert("status".to_string(), serde_json::json!("inactive"));
    update_subject(store, id, &updates)
}
