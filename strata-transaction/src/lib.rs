//! Two-sided transaction execution for Strata syncs.
//!
//! A sync mutates three places - the working directory, the remote tree,
//! and the remote's history - and must look atomic from every side. The
//! [`Coordinator`] drives a [`ClientFilesystem`] (staged `.pending-<tx>`
//! writes plus crash recovery), one of two [`RemoteFilesystem`] backends
//! (copy-on-write [`ZfsRemote`] or rename-based [`StagedRemote`]), and a
//! [`Transport`], committing remote-first.
//!
//! [`Transport`]: strata_transport::Transport

pub mod client;
pub mod coordinator;
mod fsutil;
pub mod remote;
pub mod staged;
pub mod txid;
pub mod zfs;

pub use client::{ClientFilesystem, ClientFsError, Recovery};
pub use coordinator::{Coordinator, SyncOutcome, TransactionError, build_new_manifest};
pub use remote::{RemoteFilesystem, RemoteFsError};
pub use staged::StagedRemote;
pub use txid::TxId;
pub use zfs::{SystemZfs, ZfsCli, ZfsRemote};
