//! Three-way manifest merger.
//!
//! Given the local scan, the cache (the last agreed-upon manifest), and the
//! remote manifest, every path classifies into one of fifteen canonical
//! states, each selecting one sync action. The planner buckets the union of
//! paths into a [`SyncPlan`] the transaction coordinator can execute.
//!
//! This crate is pure: no IO, no clocks, no randomness.

pub mod plan;
pub mod state;

pub use plan::{Conflict, PlanKind, PlanSummary, SyncMode, SyncPlan, plan};
pub use state::{SyncAction, SyncState};
