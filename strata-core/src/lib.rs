//! Core Strata semantics.
//!
//! This crate provides the fundamental types and pure computation logic for
//! the sync engine. It is intentionally IO-free - all operations are pure
//! functions that operate on values, enabling easy testing and composition.
//!
//! # Key Modules
//!
//! - `repo_path` - Repository-relative paths: Unicode normalization,
//!   validation, repair classification
//! - `entry` - Tracked file and symlink entries, content equality
//! - `manifest` - The path → entry mapping, its metadata envelope, canonical
//!   serialization and the manifest hash
//! - `snapshot` - Snapshot ids and history records
//! - `layout` - The `.dsg/` control directory layout
//!
//! # Design Principles
//!
//! 1. **No IO**: No filesystem, no network, no `async`
//! 2. **Pure functions**: Deterministic, testable, referentially transparent
//! 3. **Explicit errors**: All fallible operations return `Result`

pub mod entry;
pub mod layout;
pub mod manifest;
pub mod repo_path;
pub mod snapshot;

pub use entry::Entry;
pub use layout::RepoLayout;
pub use manifest::{Manifest, ManifestError, ManifestFile, ManifestMeta};
pub use repo_path::{
    Classification, PathCheck, PathRejection, Repair, RepoPath, RepoPathError, Verdict,
    validate_link_target,
};
pub use snapshot::{ParseSnapshotIdError, SnapshotId, SnapshotRecord};
