//! Strata: content-addressed data versioning for research repositories.
//!
//! This crate wires the engine together: configuration, the operation
//! surface (`status`, `init`, `clone`, `sync`, `log`, `blame`), and the
//! top-level error taxonomy. The moving parts live in the sibling crates:
//!
//! - `strata-core` - paths, entries, manifests, snapshots (pure)
//! - `strata-scan` - filesystem scanning
//! - `strata-merge` - three-way classification and planning
//! - `strata-transport` - byte-stream transports and remote IO primitives
//! - `strata-transaction` - the two-sided transaction coordinator
//! - `strata-store` - the distributed lock and snapshot history
//!
//! A command-line surface is expected to sit on top of this crate; the
//! engine itself renders nothing and exits nowhere.

pub mod config;
pub mod engine;
pub mod error;

pub use config::{Config, RemoteSpec};
pub use engine::{Engine, ExclusionPredicate, StatusReport, SyncFlags, SyncReport};
pub use error::{EngineError, ErrorKind};

pub use strata_core::{Entry, Manifest, ManifestFile, RepoPath, SnapshotId, SnapshotRecord};
pub use strata_merge::{PlanKind, PlanSummary, SyncAction, SyncPlan, SyncState};
pub use strata_transaction::Recovery;
