//! Sync plan computation.
//!
//! [`plan`] classifies every path in the union of the three manifests and
//! buckets it by action. The resulting [`SyncPlan`] is what the transaction
//! coordinator executes; it is executable iff the conflict set is empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use strata_core::{Manifest, RepoPath};

use crate::state::{SyncAction, SyncState};

/// Conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Any conflict aborts the sync.
    #[default]
    Normal,
    /// Local wins three-way divergences; remote wins delete-vs-change.
    Force,
}

/// How the planner short-circuited, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanKind {
    /// Empty cache, non-empty remote: populate the working directory.
    Clone,
    /// Empty cache and remote, non-empty local: first upload.
    Init,
    /// Ordinary per-path three-way sync.
    PerPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: RepoPath,
    pub state: SyncState,
}

/// Per-path actions for one sync, in canonical path order per bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPlan {
    pub kind: PlanKind,
    pub uploads: Vec<RepoPath>,
    pub downloads: Vec<RepoPath>,
    pub delete_local: Vec<RepoPath>,
    pub delete_remote: Vec<RepoPath>,
    /// Paths whose cache record is refreshed without any transfer.
    pub cache_refresh: Vec<RepoPath>,
    /// Non-empty iff the plan is not executable.
    pub conflicts: Vec<Conflict>,
    /// Every path in the union, with its classified state.
    pub states: BTreeMap<RepoPath, SyncState>,
}

/// Counts for logs and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub uploads: usize,
    pub downloads: usize,
    pub delete_local: usize,
    pub delete_remote: usize,
    pub cache_refresh: usize,
    pub conflicts: usize,
    pub unchanged: usize,
}

impl SyncPlan {
    fn empty(kind: PlanKind) -> Self {
        SyncPlan {
            kind,
            uploads: Vec::new(),
            downloads: Vec::new(),
            delete_local: Vec::new(),
            delete_remote: Vec::new(),
            cache_refresh: Vec::new(),
            conflicts: Vec::new(),
            states: BTreeMap::new(),
        }
    }

    pub fn is_executable(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// True when executing the plan would change nothing anywhere.
    pub fn is_noop(&self) -> bool {
        self.uploads.is_empty()
            && self.downloads.is_empty()
            && self.delete_local.is_empty()
            && self.delete_remote.is_empty()
            && self.cache_refresh.is_empty()
            && self.conflicts.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            uploads: self.uploads.len(),
            downloads: self.downloads.len(),
            delete_local: self.delete_local.len(),
            delete_remote: self.delete_remote.len(),
            cache_refresh: self.cache_refresh.len(),
            conflicts: self.conflicts.len(),
            unchanged: self
                .states
                .values()
                .filter(|s| **s == SyncState::S1AllAgree)
                .count(),
        }
    }

    fn push(&mut self, path: RepoPath, state: SyncState, action: SyncAction) {
        self.states.insert(path.clone(), state);
        match action {
            SyncAction::Noop => {}
            SyncAction::Download => self.downloads.push(path),
            SyncAction::Upload => self.uploads.push(path),
            SyncAction::DeleteLocal => self.delete_local.push(path),
            SyncAction::DeleteRemote => self.delete_remote.push(path),
            SyncAction::RefreshCache => self.cache_refresh.push(path),
            SyncAction::Conflict => self.conflicts.push(Conflict { path, state }),
        }
    }
}

/// Compute the sync plan for (local, cache, remote) under `mode`.
pub fn plan(local: &Manifest, cache: &Manifest, remote: &Manifest, mode: SyncMode) -> SyncPlan {
    // Bulk shortcuts: a client with no cache is either cloning or
    // initializing; per-path three-way classification is meaningless.
    if cache.is_empty() && !remote.is_empty() {
        let mut out = SyncPlan::empty(PlanKind::Clone);
        for (path, _) in remote.iter() {
            out.push(path.clone(), SyncState::S12RemoteOnly, SyncAction::Download);
        }
        debug!(downloads = out.downloads.len(), "planned clone");
        return out;
    }
    if cache.is_empty() && remote.is_empty() && !local.is_empty() {
        let mut out = SyncPlan::empty(PlanKind::Init);
        for (path, _) in local.iter() {
            out.push(path.clone(), SyncState::S14LocalOnly, SyncAction::Upload);
        }
        debug!(uploads = out.uploads.len(), "planned init");
        return out;
    }

    let mut out = SyncPlan::empty(PlanKind::PerPath);

    let mut union: Vec<&RepoPath> = local
        .paths()
        .chain(cache.paths())
        .chain(remote.paths())
        .collect();
    union.sort();
    union.dedup();

    for path in union {
        let state = SyncState::classify(local.get(path), cache.get(path), remote.get(path));
        let action = match mode {
            SyncMode::Normal => state.action(),
            SyncMode::Force => state.forced_action(),
        };
        out.push(path.clone(), state, action);
    }

    let summary = out.summary();
    debug!(?summary, "planned sync");
    out
}
