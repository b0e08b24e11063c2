//! Doctor: consistency checks over a store, and the repairs that are safe to automate.
//!
//! Checks:
//! - Documents that fail to decode
//! - Documents whose directory disagrees with their `state` (interrupted transition)
//! - The same id in more than one partition (interrupted cross-device move)
//! - Owners missing from the subject catalog
//! - Orphaned temp files and stale lock markers left by crashed writers
//! - Views that differ from what the partitions call for
//!
//! Corrupt documents are reported, never deleted.

use crate::core::codec;
use crate::core::error::BurrowError;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::documents::{self, Document};
use crate::plugins::{subjects, views};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
    pub findings: Vec<Finding>,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
}

impl DoctorReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn of_kind(&self, kind: FindingKind) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    CorruptDocument,
    MisplacedDocument,
    DuplicateDocument,
    UnknownOwner,
    OrphanedTemp,
    StaleLock,
    ViewDrift,
}

impl FindingKind {
    const ALL: [FindingKind; 7] = [
        FindingKind::CorruptDocument,
        FindingKind::MisplacedDocument,
        FindingKind::DuplicateDocument,
        FindingKind::UnknownOwner,
        FindingKind::OrphanedTemp,
        FindingKind::StaleLock,
        FindingKind::ViewDrift,
    ];

    fn check_name(self) -> &'static str {
        match self {
            FindingKind::CorruptDocument => "documents decode",
            FindingKind::MisplacedDocument => "documents in their state partition",
            FindingKind::DuplicateDocument => "document ids unique",
            FindingKind::UnknownOwner => "owners known",
            FindingKind::OrphanedTemp => "no orphaned temp files",
            FindingKind::StaleLock => "no stale locks",
            FindingKind::ViewDrift => "views match partitions",
        }
    }

    /// Data-level problems fail; leftovers from crashed writers only warn.
    fn severity(self) -> CheckStatus {
        match self {
            FindingKind::CorruptDocument
            | FindingKind::MisplacedDocument
            | FindingKind::DuplicateDocument => CheckStatus::Fail,
            _ => CheckStatus::Warn,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: FindingKind,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct RepairReport {
    pub actions: Vec<String>,
    /// The check re-run after repairs.
    pub after: DoctorReport,
}

/// One decoded canonical file.
struct Located {
    dir_state: String,
    path: PathBuf,
    doc: Document,
}

struct Scan {
    documents: Vec<Located>,
    findings: Vec<Finding>,
}

pub fn check(store: &Store) -> Result<DoctorReport, BurrowError> {
    let scan = scan_partitions(store)?;
    let mut findings = scan.findings;

    // 1. Misplaced
    for located in &scan.documents {
        if located.doc.state != located.dir_state {
            findings.push(Finding {
                kind: FindingKind::MisplacedDocument,
                path: located.path.clone(),
                document_id: Some(located.doc.id.clone()),
                detail: format!(
                    "in '{}' but record state is '{}'",
                    located.dir_state, located.doc.state
                ),
            });
        }
    }

    // 2. Duplicates
    for (id, copies) in group_by_id(&scan.documents) {
        if copies.len() > 1 {
            let states: Vec<&str> = copies.iter().map(|l| l.dir_state.as_str()).collect();
            findings.push(Finding {
                kind: FindingKind::DuplicateDocument,
                path: copies[0].path.clone(),
                document_id: Some(id.to_string()),
                detail: format!("present in {}", states.join(", ")),
            });
        }
    }

    // 3. Owners
    let catalog = subjects::load_catalog(&store.root)?;
    let known: FxHashSet<&str> = catalog.subjects.iter().map(|s| s.id.as_str()).collect();
    for located in &scan.documents {
        for owner in &located.doc.owners {
            if !known.contains(owner.as_str()) {
                findings.push(Finding {
                    kind: FindingKind::UnknownOwner,
                    path: located.path.clone(),
                    document_id: Some(located.doc.id.clone()),
                    detail: format!("owner '{}' is not in the subject catalog", owner),
                });
            }
        }
    }

    // 4. Temp files
    findings.extend(orphaned_temps(store)?);

    // 5. Locks
    for (path, age) in store.locks().stale_markers()? {
        findings.push(Finding {
            kind: FindingKind::StaleLock,
            path,
            document_id: None,
            detail: format!("held for {}s", age.as_secs()),
        });
    }

    // 6. Views
    let expected = views::expected(store)?;
    let actual = views::snapshot(store)?;
    if expected != actual {
        warn!(root = %store.root.display(), "views differ from canonical partitions");
        findings.push(Finding {
            kind: FindingKind::ViewDrift,
            path: store.views_dir(),
            document_id: None,
            detail: drift_summary(&expected, &actual),
        });
    }

    Ok(summarize(findings))
}

/// Apply every automatic fix, then check again.
pub fn repair(store: &Store) -> Result<RepairReport, BurrowError> {
    let before = check(store)?;
    let mut actions = Vec::new();

    let duplicates: FxHashSet<String> = before
        .of_kind(FindingKind::DuplicateDocument)
        .filter_map(|f| f.document_id.clone())
        .collect();
    for id in &duplicates {
        actions.extend(drop_duplicates(store, id)?);
    }

    for finding in before.of_kind(FindingKind::MisplacedDocument) {
        let Some(id) = &finding.document_id else {
            continue;
        };
        if duplicates.contains(id) {
            continue;
        }
        actions.extend(relocate_misplaced(store, id)?);
    }

    for finding in before.of_kind(FindingKind::OrphanedTemp) {
        // Abandoned views staging trees are directories.
        if finding.path.is_dir() {
            fs::remove_dir_all(&finding.path).map_err(BurrowError::IoError)?;
        } else {
            store.writer().remove(&finding.path)?;
        }
        actions.push(format!("removed temp file {}", finding.path.display()));
    }

    // A live acquirer may have reclaimed a marker since the check ran, so each one is
    // re-checked and removed only if it is still the stale one.
    for finding in before.of_kind(FindingKind::StaleLock) {
        if store.locks().remove_if_stale(&finding.path)? {
            actions.push(format!("removed stale lock {}", finding.path.display()));
        } else {
            info!(path = %finding.path.display(), "lock no longer stale; left in place");
        }
    }

    let relocated = !duplicates.is_empty() || before.of_kind(FindingKind::MisplacedDocument).next().is_some();
    if relocated || before.of_kind(FindingKind::ViewDrift).next().is_some() {
        views::rebuild(store)?;
        actions.push("rebuilt views".to_string());
    }

    for action in &actions {
        info!(action = %action, "doctor repair");
    }
    Ok(RepairReport {
        actions,
        after: check(store)?,
    })
}

fn scan_partitions(store: &Store) -> Result<Scan, BurrowError> {
    let mut paths = Vec::new();
    for state in store.manifest().state_ids() {
        for id in documents::list_ids(store, state)? {
            paths.push((state.to_string(), store.document_path(state, &id)));
        }
    }

    let decoded: Vec<Result<Located, Finding>> = paths
        .into_par_iter()
        .filter_map(|(dir_state, path)| match documents::read_at(&path) {
            Ok(doc) => Some(Ok(Located {
                dir_state,
                path,
                doc,
            })),
            Err(BurrowError::NotFound(_)) => None,
            Err(e) => Some(Err(Finding {
                kind: FindingKind::CorruptDocument,
                document_id: path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(schemas::document_id_from_file_name)
                    .map(str::to_string),
                path,
                detail: e.to_string(),
            })),
        })
        .collect();

    let mut scan = Scan {
        documents: Vec::new(),
        findings: Vec::new(),
    };
    for item in decoded {
        match item {
            Ok(located) => scan.documents.push(located),
            Err(finding) => scan.findings.push(finding),
        }
    }
    Ok(scan)
}

fn group_by_id(documents: &[Located]) -> Vec<(&str, Vec<&Located>)> {
    let mut groups: FxHashMap<&str, Vec<&Located>> = FxHashMap::default();
    for located in documents {
        groups.entry(located.doc.id.as_str()).or_default().push(located);
    }
    let mut out: Vec<_> = groups.into_iter().collect();
    out.sort_by(|a, b| a.0.cmp(b.0));
    out
}

/// Keep the copy with the longest history (it saw every committed mutation); on a tie
/// prefer the one already in its own partition.
fn drop_duplicates(store: &Store, id: &str) -> Result<Vec<String>, BurrowError> {
    store
        .broker()
        .with_lock(&documents::doc_lock(id), "doctor.dedupe", id, || {
            let mut copies = Vec::new();
            for state in store.manifest().state_ids() {
                let path = store.document_path(state, id);
                if let Ok(doc) = documents::read_at(&path) {
                    copies.push(Located {
                        dir_state: state.to_string(),
                        path,
                        doc,
                    });
                }
            }
            let Some(keep) = copies
                .iter()
                .enumerate()
                .max_by_key(|(i, l)| (l.doc.history.len(), l.doc.state == l.dir_state, std::cmp::Reverse(*i)))
                .map(|(i, _)| i)
            else {
                return Ok(Vec::new());
            };

            let mut actions = Vec::new();
            for (i, located) in copies.iter().enumerate() {
                if i == keep {
                    continue;
                }
                store.writer().remove(&located.path)?;
                store.writer().remove(&codec::backup_path(&located.path))?;
                actions.push(format!("removed duplicate of {} from '{}'", id, located.dir_state));
            }
            let kept = &copies[keep];
            if kept.doc.state != kept.dir_state {
                store.require_state(&kept.doc.state)?;
                store
                    .writer()
                    .relocate(&kept.path, &store.document_path(&kept.doc.state, id))?;
                actions.push(format!("moved {} to '{}'", id, kept.doc.state));
            }
            Ok(actions)
        })
}

fn relocate_misplaced(store: &Store, id: &str) -> Result<Option<String>, BurrowError> {
    store
        .broker()
        .with_lock(&documents::doc_lock(id), "doctor.relocate", id, || {
            let (dir_state, path) = documents::locate_locked(store, id)?;
            let doc = documents::read_at(&path)?;
            if doc.state == dir_state {
                return Ok(None);
            }
            if store.manifest().state(&doc.state).is_none() {
                warn!(id, state = %doc.state, "record names an undeclared state; leaving in place");
                return Ok(None);
            }
            store
                .writer()
                .relocate(&path, &store.document_path(&doc.state, id))?;
            Ok(Some(format!("moved {} from '{}' to '{}'", id, dir_state, doc.state)))
        })
}

/// Temp files older than the lock staleness window, in the store root, partitions and
/// event inboxes.
fn orphaned_temps(store: &Store) -> Result<Vec<Finding>, BurrowError> {
    let threshold = store.options().lock_stale_after;
    let mut dirs = vec![store.root.clone()];
    dirs.extend(store.manifest().state_ids().map(|s| store.state_dir(s)));
    match fs::read_dir(store.events_dir()) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry.map_err(BurrowError::IoError)?;
                if entry.file_type().map_err(BurrowError::IoError)?.is_dir() {
                    dirs.push(entry.path());
                }
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(BurrowError::IoError(e)),
    }

    let mut out = Vec::new();
    for dir in dirs {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(BurrowError::IoError(e)),
        };
        for entry in entries {
            let entry = entry.map_err(BurrowError::IoError)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.starts_with('.') && name.ends_with(schemas::TEMP_SUFFIX)) {
                continue;
            }
            let path = entry.path();
            let age = file_age(&path);
            if age >= threshold {
                out.push(Finding {
                    kind: FindingKind::OrphanedTemp,
                    path,
                    document_id: None,
                    detail: format!("untouched for {}s", age.as_secs()),
                });
            }
        }
    }
    Ok(out)
}

fn file_age(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|t| Duration::from_millis(time::now_unix_millis().saturating_sub(t.as_millis() as u64)))
        .unwrap_or_default()
}

fn drift_summary(expected: &views::ViewSnapshot, actual: &views::ViewSnapshot) -> String {
    let flatten = |snap: &views::ViewSnapshot| -> FxHashSet<(String, String, String)> {
        snap.iter()
            .flat_map(|(subject, states)| {
                states.iter().flat_map(move |(state, ids)| {
                    ids.iter()
                        .map(move |id| (subject.clone(), state.clone(), id.clone()))
                })
            })
            .collect()
    };
    let expected = flatten(expected);
    let actual = flatten(actual);
    let missing = expected.difference(&actual).count();
    let extra = actual.difference(&expected).count();
    format!("{} missing entr(ies), {} extra entr(ies)", missing, extra)
}

fn summarize(findings: Vec<Finding>) -> DoctorReport {
    let mut checks = Vec::new();
    for kind in FindingKind::ALL {
        let count = findings.iter().filter(|f| f.kind == kind).count();
        let (status, message) = if count == 0 {
            (CheckStatus::Pass, "ok".to_string())
        } else {
            (kind.severity(), format!("{} finding(s)", count))
        };
        checks.push(CheckResult {
            name: kind.check_name().to_string(),
            status,
            message,
        });
    }

    let passed = checks.iter().filter(|c| c.status == CheckStatus::Pass).count();
    let failed = checks.iter().filter(|c| c.status == CheckStatus::Fail).count();
    let warnings = checks.iter().filter(|c| c.status == CheckStatus::Warn).count();

    DoctorReport {
        checks,
        findings,
        passed,
        failed,
        warnings,
    }
}
