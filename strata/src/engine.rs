//! The engine: one entry point per repository operation.
//!
//! Each mutating operation is one distributed-lock scope wrapping one
//! transaction; read-only operations (status, log, blame) take no lock.
//! Every operation that touches a working directory first completes any
//! interrupted transaction a previous run left behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{info, warn};

use strata_core::{Manifest, ManifestFile, RepoLayout, RepoPath, SnapshotId, SnapshotRecord};
use strata_merge::{PlanSummary, SyncMode, SyncPlan, plan};
use strata_scan::{Diagnostic, ScanOptions, ScanOutcome, scan, with_control_dir_excluded};
use strata_store::{LockGuard, LockOptions, LockRecord, SnapshotStore, SyncLock};
use strata_transaction::{
    ClientFilesystem, Coordinator, Recovery, RemoteFilesystem, StagedRemote, SystemZfs, TxId,
    ZfsRemote, build_new_manifest,
};
use strata_transport::{LocalTransport, RemoteIo, SshTransport, Transport};

use crate::config::{Config, RemoteSpec};
use crate::error::{EngineError, IoContext};

/// Paths the caller wants kept out of the repository, as a predicate over
/// repository-relative paths. Provided by external configuration; the
/// control directory is excluded regardless.
pub type ExclusionPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SyncFlags {
    /// Resolve conflicts: local wins divergences, remote wins
    /// delete-vs-change.
    pub force: bool,
    /// Repair repairable names (NFC, whitespace) instead of failing.
    pub normalize: bool,
    /// Human message recorded on the snapshot.
    pub message: Option<String>,
}

/// What `status` saw. No mutation beyond startup recovery.
#[derive(Debug)]
pub struct StatusReport {
    pub recovery: Recovery,
    pub plan: SyncPlan,
    pub diagnostics: Vec<Diagnostic>,
}

/// What a mutating operation did.
#[derive(Debug)]
pub struct SyncReport {
    pub recovery: Recovery,
    /// The snapshot the working directory now reflects.
    pub snapshot: Option<SnapshotId>,
    pub summary: PlanSummary,
    pub diagnostics: Vec<Diagnostic>,
    /// Remote-side cleanups that failed non-fatally, for operators.
    pub deferred_cleanups: Vec<String>,
}

pub struct Engine {
    config: Config,
    excluded: ExclusionPredicate,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            excluded: Arc::new(|_| false),
        }
    }

    pub fn with_exclusions(mut self, excluded: ExclusionPredicate) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sync plan summary plus conflicts; mutates nothing except completing
    /// a previously interrupted transaction.
    pub async fn status(&self, work_dir: &Path) -> Result<StatusReport, EngineError> {
        let mut client = ClientFilesystem::new(work_dir);
        let recovery = client.recover().await?;

        let outcome = self.scan_dir(work_dir, false, false).await?;
        let cache = load_entries(client.load_cache_manifest().await?);
        let remote = load_entries(self.load_remote_manifest().await?);
        let plan = plan(&outcome.manifest, &cache, &remote, SyncMode::Normal);

        Ok(StatusReport {
            recovery,
            plan,
            diagnostics: outcome.diagnostics,
        })
    }

    /// Create the repository: local tree becomes snapshot `s1`.
    pub async fn init(
        &self,
        work_dir: &Path,
        message: Option<String>,
    ) -> Result<SyncReport, EngineError> {
        let client = ClientFilesystem::new(work_dir);
        if client.load_cache_manifest().await?.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }

        let outcome = self.scan_dir(work_dir, true, false).await?;
        fail_on_fatal(&outcome)?;

        let guard = self
            .acquire_lock("init", self.config.clone_lock_timeout_secs)
            .await?;
        let result = self.init_locked(client, &outcome, message).await;
        guard.release().await;
        result.map(|(snapshot, summary, deferred)| SyncReport {
            recovery: Recovery::Clean,
            snapshot: Some(snapshot),
            summary,
            diagnostics: outcome.diagnostics,
            deferred_cleanups: deferred,
        })
    }

    async fn init_locked(
        &self,
        client: ClientFilesystem,
        outcome: &ScanOutcome,
        message: Option<String>,
    ) -> Result<(SnapshotId, PlanSummary, Vec<String>), EngineError> {
        if self.load_remote_manifest().await?.is_some()
            || self.snapshot_store().head().await?.is_some()
        {
            return Err(EngineError::RemoteNotEmpty);
        }

        let empty = Manifest::new();
        let init_plan = plan(&outcome.manifest, &empty, &empty, SyncMode::Normal);
        let manifest = build_new_manifest(
            &outcome.manifest,
            &empty,
            &empty,
            &init_plan,
            SnapshotId::FIRST,
            None,
            Local::now().fixed_offset(),
            &self.config.user,
            message,
        )?;

        let mut coordinator =
            Coordinator::new(client, self.make_remote(), self.make_transport());
        coordinator.execute(&init_plan, manifest).await?;
        info!(root = %self.remote_root().display(), "repository initialized at s1");
        Ok((
            SnapshotId::FIRST,
            init_plan.summary(),
            coordinator.remote().deferred_cleanups().to_vec(),
        ))
    }

    /// Populate an empty directory from the remote `HEAD`, mirroring the
    /// snapshot log and tag table.
    pub async fn clone(&self, dest_dir: &Path) -> Result<SyncReport, EngineError> {
        let dest_layout = RepoLayout::new(dest_dir);
        if std::fs::metadata(dest_layout.control_dir()).is_ok() {
            return Err(EngineError::AlreadyInitialized);
        }
        tokio::fs::create_dir_all(dest_dir)
            .await
            .io_context(|| format!("creating {}", dest_dir.display()))?;

        let guard = self
            .acquire_lock("clone", self.config.clone_lock_timeout_secs)
            .await?;
        let result = self.clone_locked(dest_dir).await;
        guard.release().await;
        result
    }

    async fn clone_locked(&self, dest_dir: &Path) -> Result<SyncReport, EngineError> {
        let head = self
            .load_remote_manifest()
            .await?
            .ok_or(EngineError::RemoteEmpty)?;

        let empty = Manifest::new();
        let clone_plan = plan(&empty, &empty, &head.entries, SyncMode::Normal);
        let snapshot = head.metadata.snapshot_id;

        let mut coordinator = Coordinator::new(
            ClientFilesystem::new(dest_dir),
            self.make_remote(),
            self.make_transport(),
        );
        coordinator.execute_local_update(&clone_plan, head).await?;

        self.mirror_history(dest_dir).await?;
        info!(dest = %dest_dir.display(), %snapshot, "clone complete");
        Ok(SyncReport {
            recovery: Recovery::Clean,
            snapshot: Some(snapshot),
            summary: clone_plan.summary(),
            diagnostics: Vec::new(),
            deferred_cleanups: Vec::new(),
        })
    }

    /// Three-way sync: scan, plan, execute, commit a snapshot if the
    /// remote changes.
    pub async fn sync(&self, work_dir: &Path, flags: SyncFlags) -> Result<SyncReport, EngineError> {
        let mut client = ClientFilesystem::new(work_dir);
        let recovery = client.recover().await?;

        let outcome = self.scan_dir(work_dir, true, flags.normalize).await?;
        fail_on_fatal(&outcome)?;
        client.apply_renames(&outcome.renames).await?;

        let cache = load_entries(client.load_cache_manifest().await?);
        let mode = if flags.force {
            SyncMode::Force
        } else {
            SyncMode::Normal
        };

        let guard = self
            .acquire_lock("sync", self.config.sync_lock_timeout_secs)
            .await?;
        let result = self
            .sync_locked(client, &outcome.manifest, &cache, mode, flags.message)
            .await;
        guard.release().await;

        let (snapshot, summary, deferred) = result?;
        Ok(SyncReport {
            recovery,
            snapshot,
            summary,
            diagnostics: outcome.diagnostics,
            deferred_cleanups: deferred,
        })
    }

    async fn sync_locked(
        &self,
        client: ClientFilesystem,
        local: &Manifest,
        cache: &Manifest,
        mode: SyncMode,
        message: Option<String>,
    ) -> Result<(Option<SnapshotId>, PlanSummary, Vec<String>), EngineError> {
        let remote_file = self.load_remote_manifest().await?;
        let remote = load_entries(remote_file.clone());
        let sync_plan = plan(local, cache, &remote, mode);
        let summary = sync_plan.summary();

        if sync_plan.is_noop() {
            info!("nothing to sync");
            let snapshot = remote_file.map(|f| f.metadata.snapshot_id);
            return Ok((snapshot, summary, Vec::new()));
        }
        if !sync_plan.is_executable() {
            return Err(EngineError::Conflict {
                paths: sync_plan
                    .conflicts
                    .iter()
                    .map(|c| c.path.clone())
                    .collect(),
            });
        }

        let remote_dirty =
            !sync_plan.uploads.is_empty() || !sync_plan.delete_remote.is_empty();
        let mut coordinator =
            Coordinator::new(client, self.make_remote(), self.make_transport());

        if remote_dirty {
            let head = self.snapshot_store().head().await?;
            let previous = head.as_ref().map(|h| h.snapshot_id);
            let snapshot_id = previous.map(|p| p.next()).unwrap_or(SnapshotId::FIRST);
            let manifest = build_new_manifest(
                local,
                cache,
                &remote,
                &sync_plan,
                snapshot_id,
                previous,
                Local::now().fixed_offset(),
                &self.config.user,
                message,
            )?;
            coordinator.execute(&sync_plan, manifest).await?;
            Ok((
                Some(snapshot_id),
                summary,
                coordinator.remote().deferred_cleanups().to_vec(),
            ))
        } else {
            let target = remote_file.ok_or(EngineError::RemoteEmpty)?;
            let snapshot = target.metadata.snapshot_id;
            coordinator
                .execute_local_update(&sync_plan, target)
                .await?;
            Ok((Some(snapshot), summary, Vec::new()))
        }
    }

    /// The ordered snapshot history.
    pub async fn log(&self) -> Result<Vec<SnapshotRecord>, EngineError> {
        Ok(self.snapshot_store().records().await?)
    }

    /// The last snapshot that touched `path`.
    pub async fn blame(&self, path: &RepoPath) -> Result<Option<SnapshotRecord>, EngineError> {
        Ok(self.snapshot_store().last_change(path).await?)
    }

    /// Complete or roll back an interrupted transaction without running
    /// any other operation.
    pub async fn recover_if_needed(&self, work_dir: &Path) -> Result<Recovery, EngineError> {
        let mut client = ClientFilesystem::new(work_dir);
        Ok(client.recover().await?)
    }

    async fn scan_dir(
        &self,
        root: &Path,
        hashes: bool,
        normalize: bool,
    ) -> Result<ScanOutcome, EngineError> {
        let mut options = ScanOptions::new(&self.config.user);
        options.compute_hashes = hashes;
        options.normalize = normalize;
        options.hash_workers = self.config.hash_workers;
        let excluded = self.excluded.clone();
        Ok(scan(
            root,
            with_control_dir_excluded(move |rel| excluded(rel)),
            options,
        )
        .await?)
    }

    fn remote_io(&self) -> RemoteIo {
        match &self.config.remote {
            RemoteSpec::Path { .. } | RemoteSpec::Zfs { .. } => RemoteIo::Local,
            RemoteSpec::Ssh { host, .. } => RemoteIo::Ssh { host: host.clone() },
        }
    }

    fn remote_root(&self) -> PathBuf {
        match &self.config.remote {
            RemoteSpec::Path { root } => root.clone(),
            RemoteSpec::Ssh { root, .. } => PathBuf::from(root),
            RemoteSpec::Zfs { mountpoint, .. } => mountpoint.clone(),
        }
    }

    fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(self.remote_io(), RepoLayout::new(self.remote_root()))
    }

    async fn load_remote_manifest(&self) -> Result<Option<ManifestFile>, EngineError> {
        let layout = RepoLayout::new(self.remote_root());
        match self.remote_io().read_opt(&layout.cache_manifest()).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(ManifestFile::from_json_slice(&bytes)?)),
        }
    }

    fn make_remote(&self) -> Box<dyn RemoteFilesystem> {
        match &self.config.remote {
            RemoteSpec::Zfs {
                dataset,
                mountpoint,
            } => Box::new(ZfsRemote::new(
                Box::new(SystemZfs),
                dataset.clone(),
                mountpoint.clone(),
            )),
            _ => Box::new(StagedRemote::new(self.remote_io(), self.remote_root())),
        }
    }

    fn make_transport(&self) -> Box<dyn Transport> {
        match &self.config.remote {
            RemoteSpec::Ssh { host, .. } => Box::new(SshTransport::new(
                host.clone(),
                self.config.inactivity_timeout(),
            )),
            _ => Box::new(LocalTransport::new(self.config.inactivity_timeout())),
        }
    }

    async fn acquire_lock(
        &self,
        operation: &str,
        timeout_secs: u64,
    ) -> Result<LockGuard, EngineError> {
        let lock = SyncLock::new(
            self.remote_io(),
            RepoLayout::new(self.remote_root()).lock_file(),
            LockOptions {
                stale_after: self.config.stale_after(),
                retry_after: Duration::from_secs(2),
            },
        );
        let record =
            LockRecord::for_current_process(&self.config.user, operation, TxId::random().to_string());
        match tokio::time::timeout(Duration::from_secs(timeout_secs), lock.acquire(record)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::LockTimeout { timeout_secs }),
        }
    }

    /// Copy the snapshot log and tag table into a fresh clone.
    async fn mirror_history(&self, dest_dir: &Path) -> Result<(), EngineError> {
        let io = self.remote_io();
        let remote_layout = RepoLayout::new(self.remote_root());
        let dest_layout = RepoLayout::new(dest_dir);

        if let Some(bytes) = io.read_opt(&remote_layout.snapshot_log()).await? {
            tokio::fs::write(dest_layout.snapshot_log(), bytes)
                .await
                .io_context(|| "mirroring snapshot log".to_string())?;
        }
        match io.read_opt(&remote_layout.tag_table()).await? {
            Some(bytes) => tokio::fs::write(dest_layout.tag_table(), bytes)
                .await
                .io_context(|| "mirroring tag table".to_string())?,
            None => {}
        }
        Ok(())
    }
}

fn load_entries(file: Option<ManifestFile>) -> Manifest {
    file.map(|f| f.entries).unwrap_or_default()
}

fn fail_on_fatal(outcome: &ScanOutcome) -> Result<(), EngineError> {
    if outcome.has_fatal_diagnostics() {
        let diagnostics: Vec<Diagnostic> = outcome
            .diagnostics
            .iter()
            .filter(|d| d.is_fatal())
            .cloned()
            .collect();
        warn!(count = diagnostics.len(), "scan found illegal paths");
        return Err(EngineError::Validation { diagnostics });
    }
    Ok(())
}
