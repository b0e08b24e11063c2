//! Store registry: a catalog of stores forming an optional parent/child forest.
//!
//! Entries live in `<root>/registry/catalog.json` and are only ever added or moved
//! between lifecycle states; nothing rebuilds or drops them silently. Every write
//! happens under the `registry` lock, and parent links are checked for cycles before
//! anything is written.

use crate::core::broker::StoreBroker;
use crate::core::codec;
use crate::core::config::{RuntimeOptions, StoreManifest};
use crate::core::durable::DurableWriter;
use crate::core::error::BurrowError;
use crate::core::lock::LockManager;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::subjects::Subject;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Active,
    Archived,
    Deleted,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Active => "active",
            Lifecycle::Archived => "archived",
            Lifecycle::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl Lifecycle {
    /// Deleted is terminal; everything else may move to deleted or between
    /// active and archived.
    pub fn can_become(self, to: Lifecycle) -> bool {
        matches!(
            (self, to),
            (Lifecycle::Active, Lifecycle::Archived)
                | (Lifecycle::Archived, Lifecycle::Active)
                | (Lifecycle::Active, Lifecycle::Deleted)
                | (Lifecycle::Archived, Lifecycle::Deleted)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub store_id: String,
    pub location: PathBuf,
    pub owner: String,
    pub status: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub registered_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryCatalog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub stores: Vec<RegistryEntry>,
}

impl RegistryCatalog {
    pub fn get(&self, store_id: &str) -> Option<&RegistryEntry> {
        self.stores.iter().find(|e| e.store_id == store_id)
    }

    fn get_mut(&mut self, store_id: &str) -> Option<&mut RegistryEntry> {
        self.stores.iter_mut().find(|e| e.store_id == store_id)
    }

    /// Walk up from `parent`; reaching `store_id` means the link would close a loop.
    /// The visited set also stops the walk on a loop already present on disk.
    fn check_acyclic(&self, store_id: &str, parent: &str) -> Result<(), BurrowError> {
        let mut chain = vec![store_id.to_string()];
        let mut seen = FxHashSet::default();
        let mut cursor = Some(parent.to_string());
        while let Some(id) = cursor {
            chain.push(id.clone());
            if id == store_id || !seen.insert(id.clone()) {
                return Err(BurrowError::CyclicHierarchy {
                    store_id: store_id.to_string(),
                    chain,
                });
            }
            cursor = self.get(&id).and_then(|e| e.parent.clone());
        }
        Ok(())
    }

    fn check_parent(&self, store_id: &str, parent: Option<&str>) -> Result<(), BurrowError> {
        let Some(parent) = parent else {
            return Ok(());
        };
        self.check_acyclic(store_id, parent)?;
        if self.get(parent).is_none() {
            return Err(BurrowError::NotFound(format!("parent store {}", parent)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryFilter {
    pub status: Option<Lifecycle>,
    pub owner: Option<String>,
    pub parent: Option<String>,
}

impl RegistryFilter {
    fn matches(&self, entry: &RegistryEntry) -> bool {
        self.status.is_none_or(|s| s == entry.status)
            && self.owner.as_ref().is_none_or(|o| *o == entry.owner)
            && self
                .parent
                .as_ref()
                .is_none_or(|p| entry.parent.as_deref() == Some(p.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    writer: DurableWriter,
    broker: StoreBroker,
}

impl Registry {
    pub fn open(root: &Path, actor: &str) -> Result<Self, BurrowError> {
        Self::open_with(root, actor, RuntimeOptions::from_env())
    }

    pub fn open_with(root: &Path, actor: &str, options: RuntimeOptions) -> Result<Self, BurrowError> {
        fs::create_dir_all(root.join(schemas::REGISTRY_DIR)).map_err(BurrowError::IoError)?;
        let locks = LockManager::new(&root.join(schemas::LOCKS_DIR), actor, &options);
        Ok(Self {
            root: root.to_path_buf(),
            writer: DurableWriter::from_options(&options),
            broker: StoreBroker::new(root, actor, locks),
        })
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(schemas::REGISTRY_DIR).join(schemas::REGISTRY_FILE)
    }

    pub fn load(&self) -> Result<RegistryCatalog, BurrowError> {
        codec::read_record(&self.catalog_path(), RegistryCatalog::default)
    }

    fn save(&self, catalog: &RegistryCatalog) -> Result<(), BurrowError> {
        self.writer.write(&self.catalog_path(), &codec::encode(catalog)?)
    }

    pub fn register(
        &self,
        store_id: &str,
        location: &Path,
        owner: &str,
        parent: Option<&str>,
    ) -> Result<RegistryEntry, BurrowError> {
        self.broker
            .with_lock(schemas::REGISTRY_LOCK, "registry.register", store_id, || {
                let mut catalog = self.load()?;
                let entry = self.prepare(&catalog, store_id, location, owner, parent)?;
                catalog.stores.push(entry.clone());
                self.save(&catalog)?;
                info!(store_id, parent = parent.unwrap_or("-"), "store registered");
                Ok(entry)
            })
    }

    /// Initialize a store at `location` and register it, as one registry-locked step.
    /// All registry checks run before the store directory is touched.
    pub fn create_store(
        &self,
        location: &Path,
        manifest: &StoreManifest,
        subjects: &[Subject],
        owner: &str,
        parent: Option<&str>,
    ) -> Result<RegistryEntry, BurrowError> {
        let store_id = manifest.store_id.as_str();
        self.broker
            .with_lock(schemas::REGISTRY_LOCK, "registry.create_store", store_id, || {
                let mut catalog = self.load()?;
                let entry = self.prepare(&catalog, store_id, location, owner, parent)?;
                Store::init(location, manifest, subjects)?;
                catalog.stores.push(entry.clone());
                self.save(&catalog)?;
                info!(store_id, location = %location.display(), "store created");
                Ok(entry)
            })
    }

    fn prepare(
        &self,
        catalog: &RegistryCatalog,
        store_id: &str,
        location: &Path,
        owner: &str,
        parent: Option<&str>,
    ) -> Result<RegistryEntry, BurrowError> {
        schemas::validate_identifier(store_id)?;
        schemas::validate_identifier(owner)?;
        if catalog.get(store_id).is_some() {
            return Err(BurrowError::DuplicateStoreId(store_id.to_string()));
        }
        catalog.check_parent(store_id, parent)?;
        let now = time::now_epoch_z();
        Ok(RegistryEntry {
            store_id: store_id.to_string(),
            location: location.to_path_buf(),
            owner: owner.to_string(),
            status: Lifecycle::Active,
            parent: parent.map(str::to_string),
            registered_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get(&self, store_id: &str) -> Result<RegistryEntry, BurrowError> {
        self.load()?
            .get(store_id)
            .cloned()
            .ok_or_else(|| BurrowError::NotFound(format!("store {}", store_id)))
    }

    pub fn list(&self, filter: &RegistryFilter) -> Result<Vec<RegistryEntry>, BurrowError> {
        Ok(self
            .load()?
            .stores
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }

    pub fn children(&self, store_id: &str) -> Result<Vec<RegistryEntry>, BurrowError> {
        self.list(&RegistryFilter {
            parent: Some(store_id.to_string()),
            ..RegistryFilter::default()
        })
    }

    /// Parent ids from nearest to root.
    pub fn ancestors(&self, store_id: &str) -> Result<Vec<String>, BurrowError> {
        let catalog = self.load()?;
        let mut out = Vec::new();
        let mut seen = FxHashSet::default();
        let mut cursor = catalog
            .get(store_id)
            .ok_or_else(|| BurrowError::NotFound(format!("store {}", store_id)))?
            .parent
            .clone();
        while let Some(id) = cursor {
            if !seen.insert(id.clone()) {
                break;
            }
            cursor = catalog.get(&id).and_then(|e| e.parent.clone());
            out.push(id);
        }
        Ok(out)
    }

    pub fn archive(&self, store_id: &str) -> Result<RegistryEntry, BurrowError> {
        self.set_status(store_id, Lifecycle::Archived)
    }

    pub fn activate(&self, store_id: &str) -> Result<RegistryEntry, BurrowError> {
        self.set_status(store_id, Lifecycle::Active)
    }

    /// Marks the entry deleted. The store's files are left alone.
    pub fn mark_deleted(&self, store_id: &str) -> Result<RegistryEntry, BurrowError> {
        self.set_status(store_id, Lifecycle::Deleted)
    }

    fn set_status(&self, store_id: &str, to: Lifecycle) -> Result<RegistryEntry, BurrowError> {
        self.broker
            .with_lock(schemas::REGISTRY_LOCK, "registry.status", store_id, || {
                let mut catalog = self.load()?;
                let entry = catalog
                    .get_mut(store_id)
                    .ok_or_else(|| BurrowError::NotFound(format!("store {}", store_id)))?;
                if entry.status == to {
                    return Ok(entry.clone());
                }
                if !entry.status.can_become(to) {
                    return Err(BurrowError::InvalidLifecycle {
                        store_id: store_id.to_string(),
                        from: entry.status.to_string(),
                        to: to.to_string(),
                    });
                }
                let from = entry.status;
                entry.status = to;
                entry.updated_at = time::now_epoch_z();
                let updated = entry.clone();
                self.save(&catalog)?;
                info!(store_id, %from, %to, "store lifecycle changed");
                Ok(updated)
            })
    }

    /// Move a store under a new parent (or to the top level with `None`).
    pub fn reparent(&self, store_id: &str, parent: Option<&str>) -> Result<RegistryEntry, BurrowError> {
        self.broker
            .with_lock(schemas::REGISTRY_LOCK, "registry.reparent", store_id, || {
                let mut catalog = self.load()?;
                if catalog.get(store_id).is_none() {
                    return Err(BurrowError::NotFound(format!("store {}", store_id)));
                }
                catalog.check_parent(store_id, parent)?;
                let entry = catalog
                    .get_mut(store_id)
                    .ok_or_else(|| BurrowError::NotFound(format!("store {}", store_id)))?;
                entry.parent = parent.map(str::to_string);
                entry.updated_at = time::now_epoch_z();
                let updated = entry.clone();
                self.save(&catalog)?;
                Ok(updated)
            })
    }
}
