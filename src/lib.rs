//! Burrow: a concurrency-safe document store on a plain filesystem.
//!
//! **Burrow keeps structured work items as JSON files, one directory per state.**
//!
//! There is no database engine and no daemon. Any number of independent processes may
//! open the same store; cross-process safety rests on advisory lock markers and atomic
//! rename-based writes.
//!
//! # Guarantees
//!
//! - **No partial writes**: every write goes to a sibling temp file and is renamed over
//!   the target; the prior content is kept as `<file>.bak`
//! - **No lost updates**: read-modify-write cycles run under a per-document lock
//! - **Never absent**: a state transition is a single rename (or a verified copy, then
//!   delete, across devices), so readers always find the document somewhere
//! - **Rebuildable views**: per-subject views are weak references derived from the
//!   canonical partitions and can be reconstructed at any time
//!
//! Writers that ignore the lock API only get "last writer wins at the rename".
//!
//! # Layout
//!
//! ```text
//! <store_root>/
//! ├── store.toml
//! ├── subjects.json
//! ├── store.events.jsonl
//! ├── <state>/<document_id>.json
//! ├── views/<subject>/<state>/<document_id>.json
//! ├── locks/<resource>.lock
//! ├── events/<subject>/<event_id>.json
//! └── registry/catalog.json
//! ```
//!
//! # Example
//!
//! ```no_run
//! use burrow::{documents, query, CapacityPolicy, NewDocument, Store, StoreManifest, Subject};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), burrow::BurrowError> {
//! let root = Path::new("/tmp/ops-board");
//! let manifest = StoreManifest::board("ops", "Ops", CapacityPolicy::Reject);
//! Store::init(root, &manifest, &[Subject::human("a1", "Ada")])?;
//!
//! let store = Store::open(root, "a1")?;
//! let doc = documents::create(&store, "backlog", NewDocument::titled("X"), &["a1"])?;
//! documents::transition(&store, &doc.id, "doing")?;
//!
//! let doing = query::DocumentFilter::default().in_state("doing");
//! for doc in query::enumerate(&store, doing) {
//!     println!("{}", doc?.title);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: Primitives (errors, manifest, locks, codec, durable writer, store handle)
//! - [`plugins`]: Subsystems (documents, query, subjects, views, events, registry, doctor)

pub mod core;
pub mod plugins;
mod subsystems;

pub use crate::core::codec::{RuleValidator, Validator};
pub use crate::core::config::{
    CapacityPolicy, RuntimeOptions, StateDef, StoreManifest, StoreSettings, ValidationRules,
    ViewMode,
};
pub use crate::core::error::{BurrowError, RecoveryHint};
pub use crate::core::fields::FieldUpdates;
pub use crate::core::lock::{LockGuard, LockManager};
pub use crate::core::store::Store;
pub use crate::plugins::documents::{
    Document, HistoryEntry, HistoryKind, NewDocument, ReassignMode, TransitionOutcome,
};
pub use crate::plugins::query::{Cursor, DocumentFilter, Page};
pub use crate::plugins::registry::{Lifecycle, Registry, RegistryEntry, RegistryFilter};
pub use crate::plugins::subjects::{Subject, SubjectKind, SubjectStatus};
pub use crate::plugins::views::ViewSnapshot;
pub use crate::plugins::events::{Event, EventStatus};
pub use crate::plugins::{doctor, documents, events, query, registry, subjects, views};
