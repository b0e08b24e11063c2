//! Store handle.
//!
//! A `Store` is an explicit, caller-owned handle on one store root: its manifest, the
//! acting subject, the runtime options, and the shared writer/lock machinery. Nothing
//! in the crate keeps a global "current store"; every operation takes a `&Store`.

use crate::core::broker::StoreBroker;
use crate::core::codec::{RuleValidator, Validator};
use crate::core::config::{RuntimeOptions, StateDef, StoreManifest};
use crate::core::durable::DurableWriter;
use crate::core::error::BurrowError;
use crate::core::lock::LockManager;
use crate::core::schemas;
use crate::plugins::subjects::{self, Subject};
use crate::subsystems;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Store handle representing one document store on disk.
#[derive(Clone)]
pub struct Store {
    /// Store root directory; state partitions live directly beneath it.
    pub root: PathBuf,
    manifest: StoreManifest,
    options: RuntimeOptions,
    actor: String,
    validator: Option<Arc<dyn Validator>>,
    writer: DurableWriter,
    broker: StoreBroker,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("store_id", &self.manifest.store_id)
            .field("actor", &self.actor)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl Store {
    /// Lay out a new store at `root`: state partitions, `views/`, `locks/`, the subject
    /// catalog, and finally `store.toml`. Fails if a manifest is already present.
    pub fn init(root: &Path, manifest: &StoreManifest, subjects: &[Subject]) -> Result<(), BurrowError> {
        let manifest_path = root.join(schemas::MANIFEST_FILE);
        manifest.check(&manifest_path)?;
        if manifest_path.exists() {
            return Err(BurrowError::ConfigError {
                path: manifest_path,
                reason: "store is already initialized".to_string(),
            });
        }

        fs::create_dir_all(root).map_err(BurrowError::IoError)?;
        subsystems::initialize_all(root, manifest)?;

        let writer = DurableWriter::from_options(&RuntimeOptions::from_env());
        subjects::initialize_catalog(&writer, root, subjects)?;
        // The manifest goes last: its presence is what marks the store as usable.
        writer.replace(&manifest_path, manifest.to_toml()?.as_bytes())?;

        info!(store_id = %manifest.store_id, root = %root.display(), states = manifest.states.len(), "store initialized");
        Ok(())
    }

    pub fn open(root: &Path, actor: &str) -> Result<Self, BurrowError> {
        Self::open_with(root, actor, RuntimeOptions::from_env())
    }

    /// Open an existing store acting as `actor`, which must be a known subject.
    pub fn open_with(root: &Path, actor: &str, options: RuntimeOptions) -> Result<Self, BurrowError> {
        let manifest = StoreManifest::load(&root.join(schemas::MANIFEST_FILE))?;
        let catalog = subjects::load_catalog(root)?;
        if catalog.get(actor).is_none() {
            return Err(BurrowError::UnknownSubject(actor.to_string()));
        }

        let locks = LockManager::new(&root.join(schemas::LOCKS_DIR), actor, &options);
        let validator = manifest
            .validation
            .clone()
            .map(|rules| Arc::new(RuleValidator::new(rules)) as Arc<dyn Validator>);

        Ok(Self {
            root: root.to_path_buf(),
            writer: DurableWriter::from_options(&options),
            broker: StoreBroker::new(root, actor, locks),
            manifest,
            options,
            actor: actor.to_string(),
            validator,
        })
    }

    /// Replace the validator installed from the manifest (if any).
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn without_validator(mut self) -> Self {
        self.validator = None;
        self
    }

    pub fn manifest(&self) -> &StoreManifest {
        &self.manifest
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn validator(&self) -> Option<&dyn Validator> {
        self.validator.as_deref()
    }

    pub fn writer(&self) -> &DurableWriter {
        &self.writer
    }

    pub fn broker(&self) -> &StoreBroker {
        &self.broker
    }

    pub fn locks(&self) -> &LockManager {
        self.broker.locks()
    }

    pub fn require_state(&self, state: &str) -> Result<&StateDef, BurrowError> {
        self.manifest
            .state(state)
            .ok_or_else(|| BurrowError::UnknownState(state.to_string()))
    }

    pub fn state_dir(&self, state: &str) -> PathBuf {
        self.root.join(state)
    }

    pub fn document_path(&self, state: &str, id: &str) -> PathBuf {
        self.state_dir(state).join(schemas::document_file_name(id))
    }

    pub fn views_dir(&self) -> PathBuf {
        self.root.join(schemas::VIEWS_DIR)
    }

    pub fn events_dir(&self) -> PathBuf {
        self.root.join(schemas::EVENTS_DIR)
    }
}
