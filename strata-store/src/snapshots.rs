//! The snapshot log, the tag table, and the manifest archive.
//!
//! `sync-messages.json` is the authoritative, append-only history; every
//! successful remote commit appends one record. `tag-messages.json` maps
//! version strings to snapshot ids. `archive/` holds one manifest file per
//! snapshot, the per-snapshot content view.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use strata_core::{ManifestError, ManifestFile, RepoLayout, RepoPath, SnapshotId, SnapshotRecord};
use strata_transport::{RemoteIo, TransportError};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] TransportError),

    #[error("corrupted {what}: {source}")]
    Corrupted {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("snapshot chain broken: appending {appended} after head {head:?}")]
    BrokenChain {
        appended: SnapshotId,
        head: Option<SnapshotId>,
    },

    #[error("tag {name:?} already points at {existing}")]
    TagExists { name: String, existing: SnapshotId },

    #[error("unknown snapshot {id}")]
    UnknownSnapshot { id: SnapshotId },
}

/// On-disk shape of `sync-messages.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SnapshotLogFile {
    snapshots: Vec<SnapshotRecord>,
}

/// One tag in `tag-messages.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub snapshot_id: SnapshotId,
    pub created_at: DateTime<FixedOffset>,
    pub message: Option<String>,
}

/// On-disk shape of `tag-messages.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TagTableFile {
    tags: BTreeMap<String, TagRecord>,
}

/// History access for one remote repository.
pub struct SnapshotStore {
    io: RemoteIo,
    layout: RepoLayout,
}

impl SnapshotStore {
    pub fn new(io: RemoteIo, layout: RepoLayout) -> Self {
        Self { io, layout }
    }

    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    /// All snapshot records, oldest first. An absent log is an empty one.
    pub async fn records(&self) -> Result<Vec<SnapshotRecord>, StoreError> {
        let path = self.layout.snapshot_log();
        match self.io.read_opt(&path).await? {
            None => Ok(Vec::new()),
            Some(bytes) => {
                let file: SnapshotLogFile =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupted {
                        what: "snapshot log".into(),
                        source,
                    })?;
                Ok(file.snapshots)
            }
        }
    }

    /// The most recent snapshot record, if any.
    pub async fn head(&self) -> Result<Option<SnapshotRecord>, StoreError> {
        Ok(self.records().await?.into_iter().next_back())
    }

    /// Append one record. The record's `previous` must name the current
    /// head; callers get this for free by building the new snapshot id
    /// from `head().next()` inside the lock scope.
    pub async fn append(&self, record: SnapshotRecord) -> Result<(), StoreError> {
        let mut records = self.records().await?;
        let head = records.last().map(|r| r.snapshot_id);
        if record.previous != head {
            return Err(StoreError::BrokenChain {
                appended: record.snapshot_id,
                head,
            });
        }
        info!(snapshot = %record.snapshot_id, by = %record.created_by, "appending snapshot record");
        records.push(record);
        self.write_log(&records).await
    }

    async fn write_log(&self, records: &[SnapshotRecord]) -> Result<(), StoreError> {
        let file = SnapshotLogFile {
            snapshots: records.to_vec(),
        };
        let mut bytes =
            serde_json::to_vec_pretty(&file).map_err(|source| StoreError::Corrupted {
                what: "snapshot log".into(),
                source,
            })?;
        bytes.push(b'\n');
        self.io
            .write_atomic(&self.layout.snapshot_log(), &bytes)
            .await?;
        Ok(())
    }

    /// Load an archived manifest by snapshot id.
    pub async fn manifest(&self, id: SnapshotId) -> Result<ManifestFile, StoreError> {
        let path = self.layout.archived_manifest(&id);
        let bytes = self
            .io
            .read_opt(&path)
            .await?
            .ok_or(StoreError::UnknownSnapshot { id })?;
        Ok(ManifestFile::from_json_slice(&bytes)?)
    }

    /// Archive a manifest under its snapshot id.
    pub async fn archive(&self, manifest: &ManifestFile) -> Result<(), StoreError> {
        self.io.mkdirp(&self.layout.archive_dir()).await?;
        let path = self.layout.archived_manifest(&manifest.metadata.snapshot_id);
        self.io.write_atomic(&path, &manifest.to_json_vec()?).await?;
        debug!(snapshot = %manifest.metadata.snapshot_id, "archived manifest");
        Ok(())
    }

    /// The last snapshot that touched `path`: the newest snapshot whose
    /// entry for the path differs from its predecessor's (including
    /// appearance and disappearance).
    pub async fn last_change(
        &self,
        path: &RepoPath,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let records = self.records().await?;
        let mut newer: Option<&SnapshotRecord> = None;
        for record in records.iter().rev() {
            let manifest = self.manifest(record.snapshot_id).await?;
            let entry = manifest.entries.get(path).cloned();
            if let Some(newer_record) = newer {
                let newer_manifest = self.manifest(newer_record.snapshot_id).await?;
                let newer_entry = newer_manifest.entries.get(path);
                let changed = match (entry.as_ref(), newer_entry) {
                    (Some(old), Some(new)) => !old.same_content(new),
                    (None, Some(_)) | (Some(_), None) => true,
                    (None, None) => false,
                };
                if changed {
                    return Ok(Some(newer_record.clone()));
                }
            }
            newer = Some(record);
        }
        // The oldest snapshot introduced the path, if it ever existed.
        match newer {
            Some(record) => {
                let manifest = self.manifest(record.snapshot_id).await?;
                if manifest.entries.contains(path) {
                    Ok(Some(record.clone()))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// All tags, name-ordered. An absent table is an empty one.
    pub async fn tags(&self) -> Result<BTreeMap<String, TagRecord>, StoreError> {
        let path = self.layout.tag_table();
        match self.io.read_opt(&path).await? {
            None => Ok(BTreeMap::new()),
            Some(bytes) => {
                let file: TagTableFile =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupted {
                        what: "tag table".into(),
                        source,
                    })?;
                Ok(file.tags)
            }
        }
    }

    /// Create a tag. Idempotent: re-creating a tag with the same target is
    /// a no-op; pointing an existing tag elsewhere is an error. The target
    /// snapshot must exist in the log.
    pub async fn create_tag(
        &self,
        name: impl Into<String>,
        record: TagRecord,
    ) -> Result<(), StoreError> {
        let name = name.into();
        let records = self.records().await?;
        if !records.iter().any(|r| r.snapshot_id == record.snapshot_id) {
            return Err(StoreError::UnknownSnapshot {
                id: record.snapshot_id,
            });
        }

        let mut tags = self.tags().await?;
        if let Some(existing) = tags.get(&name) {
            if existing.snapshot_id == record.snapshot_id {
                return Ok(());
            }
            return Err(StoreError::TagExists {
                name,
                existing: existing.snapshot_id,
            });
        }
        info!(tag = %name, snapshot = %record.snapshot_id, "creating tag");
        tags.insert(name, record);

        let file = TagTableFile { tags };
        let mut bytes =
            serde_json::to_vec_pretty(&file).map_err(|source| StoreError::Corrupted {
                what: "tag table".into(),
                source,
            })?;
        bytes.push(b'\n');
        self.io.write_atomic(&self.layout.tag_table(), &bytes).await?;
        Ok(())
    }
}
