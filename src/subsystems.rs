//! Subsystem registration: centralizes the on-disk layout initializers run by
//! `Store::init`.
//!
//! Adding a new subsystem: append one entry to `SUBSYSTEMS`.

use crate::core::config::StoreManifest;
use crate::core::error::BurrowError;
use crate::core::lock;
use crate::plugins::{documents, events, views};
use std::path::Path;
use tracing::debug;

pub(crate) struct SubsystemInit {
    /// Subsystem identifier, used in diagnostics.
    pub name: &'static str,
    pub initialize: fn(&Path, &StoreManifest) -> Result<(), BurrowError>,
}

/// Order matters: the lock directory must exist before anything takes a lock.
pub(crate) const SUBSYSTEMS: &[SubsystemInit] = &[
    SubsystemInit { name: "locks", initialize: lock::initialize_lock_dir },
    SubsystemInit { name: "partitions", initialize: documents::initialize_partitions },
    SubsystemInit { name: "views", initialize: views::initialize_views },
    SubsystemInit { name: "events", initialize: events::initialize_events },
];

/// Initialize every subsystem's layout under `root`, sequentially.
pub(crate) fn initialize_all(root: &Path, manifest: &StoreManifest) -> Result<(), BurrowError> {
    for sub in SUBSYSTEMS {
        (sub.initialize)(root, manifest)?;
        debug!(subsystem = sub.name, "layout initialized");
    }
    Ok(())
}
