//! Manifests: the full mapping of paths to entries defining a repository
//! state, plus the metadata envelope that turns one into a snapshot.
//!
//! The entry map is a `BTreeMap`, so iteration and serialization are always
//! in code-point order - the canonical order the manifest hash is defined
//! over. The hash covers the canonical serialization of the entries alone,
//! never the envelope.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use strata_utils_hash::{Context, Sha256};
use thiserror::Error;

use crate::entry::Entry;
use crate::repo_path::RepoPath;
use crate::snapshot::SnapshotId;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("corrupted manifest: {0}")]
    Corrupted(#[source] serde_json::Error),

    #[error("manifest hash mismatch: recorded {recorded}, computed {computed}")]
    HashMismatch { recorded: Sha256, computed: Sha256 },

    #[error("entry count mismatch: recorded {recorded}, actual {actual}")]
    EntryCountMismatch { recorded: u64, actual: u64 },
}

/// An ordered mapping from repository path to entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<RepoPath, Entry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (RepoPath, Entry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Insert an entry, returning the previous one under the same path.
    /// The map structure guarantees path uniqueness within a manifest.
    pub fn insert(&mut self, path: RepoPath, entry: Entry) -> Option<Entry> {
        self.entries.insert(path, entry)
    }

    pub fn remove(&mut self, path: &RepoPath) -> Option<Entry> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &RepoPath) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &RepoPath) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in canonical (code-point) path order.
    pub fn iter(&self) -> impl Iterator<Item = (&RepoPath, &Entry)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &RepoPath> {
        self.entries.keys()
    }

    /// The canonical hash of the entries: SHA-256 over the compact JSON
    /// serialization with entries in path order and object keys sorted.
    ///
    /// serde_json's default map type keeps keys sorted; the `preserve_order`
    /// feature must stay off anywhere in the workspace.
    pub fn canonical_hash(&self) -> Result<Sha256, ManifestError> {
        let value = serde_json::to_value(&self.entries).map_err(ManifestError::Serialize)?;
        let bytes = serde_json::to_vec(&value).map_err(ManifestError::Serialize)?;
        let mut ctx = Context::new();
        ctx.update(&bytes);
        Ok(ctx.finish())
    }
}

impl IntoIterator for Manifest {
    type Item = (RepoPath, Entry);
    type IntoIter = std::collections::btree_map::IntoIter<RepoPath, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(RepoPath, Entry)> for Manifest {
    fn from_iter<T: IntoIterator<Item = (RepoPath, Entry)>>(iter: T) -> Self {
        Self::from_entries(iter)
    }
}

/// The metadata envelope of a persisted manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub snapshot_id: SnapshotId,
    pub previous: Option<SnapshotId>,
    pub created_at: DateTime<FixedOffset>,
    pub created_by: String,
    pub message: Option<String>,
    pub entry_count: u64,
    pub manifest_hash: Sha256,
}

/// A persisted manifest: envelope plus entries, as stored in
/// `last-sync.json` and the archive. Immutable once written; an update
/// produces a new file referencing this one as `previous`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub metadata: ManifestMeta,
    pub entries: Manifest,
}

impl ManifestFile {
    /// Build the envelope around `entries`, computing count and hash.
    pub fn seal(
        entries: Manifest,
        snapshot_id: SnapshotId,
        previous: Option<SnapshotId>,
        created_at: DateTime<FixedOffset>,
        created_by: impl Into<String>,
        message: Option<String>,
    ) -> Result<ManifestFile, ManifestError> {
        let manifest_hash = entries.canonical_hash()?;
        Ok(ManifestFile {
            metadata: ManifestMeta {
                snapshot_id,
                previous,
                created_at,
                created_by: created_by.into(),
                message,
                entry_count: entries.len() as u64,
                manifest_hash,
            },
            entries,
        })
    }

    /// Check the envelope against the entries it claims to describe.
    pub fn verify(&self) -> Result<(), ManifestError> {
        let actual = self.entries.len() as u64;
        if self.metadata.entry_count != actual {
            return Err(ManifestError::EntryCountMismatch {
                recorded: self.metadata.entry_count,
                actual,
            });
        }
        let computed = self.entries.canonical_hash()?;
        if self.metadata.manifest_hash != computed {
            return Err(ManifestError::HashMismatch {
                recorded: self.metadata.manifest_hash,
                computed,
            });
        }
        Ok(())
    }

    /// Serialize to the on-disk format: pretty JSON, UTF-8, LF, trailing
    /// newline. Every writer uses this so the cache manifest and the remote
    /// manifest stay byte-identical after a sync.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, ManifestError> {
        let mut bytes = serde_json::to_vec_pretty(self).map_err(ManifestError::Serialize)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse and verify a manifest file.
    pub fn from_json_slice(bytes: &[u8]) -> Result<ManifestFile, ManifestError> {
        let file: ManifestFile = serde_json::from_slice(bytes).map_err(ManifestError::Corrupted)?;
        file.verify()?;
        Ok(file)
    }
}

#[cfg(test)]
mod unittests {
    use proptest::prelude::*;

    use super::*;

    fn mtime(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn file_entry(content: &str) -> Entry {
        Entry::File {
            hash: Some(Sha256::digest(content)),
            size: content.len() as u64,
            mtime: mtime("2025-05-30T09:00:00-07:00"),
            user: "alice@example.org".into(),
        }
    }

    fn sample() -> Manifest {
        Manifest::from_entries([
            (
                "task1/import/input/data.csv".parse().unwrap(),
                file_entry("1,2,3\n"),
            ),
            (
                "task1/analysis/out/link".parse().unwrap(),
                Entry::Link {
                    target: "../input/data.csv".into(),
                },
            ),
            ("a.txt".parse().unwrap(), file_entry("A")),
        ])
    }

    fn sealed(entries: Manifest) -> ManifestFile {
        ManifestFile::seal(
            entries,
            "s42".parse().unwrap(),
            Some("s41".parse().unwrap()),
            mtime("2025-06-01T12:34:56-07:00"),
            "alice@example.org",
            Some("refactor imports".into()),
        )
        .unwrap()
    }

    #[test]
    fn canonical_hash_ignores_insertion_order() {
        let forward = sample();
        let mut reversed = Manifest::new();
        let pairs: Vec<_> = sample().into_iter().collect();
        for (path, entry) in pairs.into_iter().rev() {
            reversed.insert(path, entry);
        }
        assert_eq!(
            forward.canonical_hash().unwrap(),
            reversed.canonical_hash().unwrap()
        );
    }

    #[test]
    fn canonical_hash_tracks_content() {
        let base = sample();
        let mut changed = sample();
        changed.insert("a.txt".parse().unwrap(), file_entry("A2"));
        assert_ne!(
            base.canonical_hash().unwrap(),
            changed.canonical_hash().unwrap()
        );
    }

    #[test]
    fn envelope_excluded_from_hash() {
        let file_a = sealed(sample());
        let mut other = sealed(sample());
        other.metadata.message = Some("different message".into());
        other.metadata.snapshot_id = "s99".parse().unwrap();
        assert_eq!(
            file_a.entries.canonical_hash().unwrap(),
            other.entries.canonical_hash().unwrap()
        );
    }

    #[test]
    fn seal_then_verify() {
        sealed(sample()).verify().unwrap();
    }

    #[test]
    fn verify_detects_tampered_entries() {
        let mut file = sealed(sample());
        file.entries.insert("b.txt".parse().unwrap(), file_entry("B"));
        assert!(matches!(
            file.verify(),
            Err(ManifestError::EntryCountMismatch { .. })
        ));

        let mut file = sealed(sample());
        file.entries.insert("a.txt".parse().unwrap(), file_entry("tampered"));
        assert!(matches!(
            file.verify(),
            Err(ManifestError::HashMismatch { .. })
        ));
    }

    #[test]
    fn json_roundtrip_is_identity() {
        let file = sealed(sample());
        let bytes = file.to_json_vec().unwrap();
        let back = ManifestFile::from_json_slice(&bytes).unwrap();
        assert_eq!(back, file);
        // Hash is stable across serialize/parse.
        assert_eq!(
            back.entries.canonical_hash().unwrap(),
            file.metadata.manifest_hash
        );
        // And so are the bytes themselves.
        assert_eq!(back.to_json_vec().unwrap(), bytes);
    }

    #[test]
    fn top_level_shape_matches_format() {
        let file = sealed(sample());
        let json: serde_json::Value =
            serde_json::from_slice(&file.to_json_vec().unwrap()).unwrap();
        assert!(json.get("metadata").is_some());
        assert!(json.get("entries").is_some());
        assert_eq!(json["metadata"]["snapshot_id"], "s42");
        assert_eq!(json["metadata"]["previous"], "s41");
        assert_eq!(json["metadata"]["entry_count"], 3);
        assert_eq!(
            json["entries"]["task1/analysis/out/link"]["type"],
            "link"
        );
    }

    #[test]
    fn corrupted_json_reported() {
        assert!(matches!(
            ManifestFile::from_json_slice(b"{not json"),
            Err(ManifestError::Corrupted(_))
        ));
    }

    prop_compose! {
        fn any_repo_path()(
            segments in prop::collection::vec("[a-z][a-z0-9_]{0,5}", 1..4)
        ) -> Option<RepoPath> {
            RepoPath::parse(&segments.join("/")).ok()
        }
    }

    prop_compose! {
        fn any_entry()(
            is_link in any::<bool>(),
            content in "[ -~]{0,16}",
            size in 0u64..1_000_000,
        ) -> Entry {
            if is_link {
                Entry::Link { target: content }
            } else {
                Entry::File {
                    hash: Some(Sha256::digest(&content)),
                    size,
                    mtime: DateTime::parse_from_rfc3339("2025-05-30T09:00:00-07:00").unwrap(),
                    user: "alice@example.org".into(),
                }
            }
        }
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary_manifests(
            pairs in prop::collection::vec((any_repo_path(), any_entry()), 0..12)
        ) {
            let entries = Manifest::from_entries(
                pairs.into_iter().filter_map(|(p, e)| p.map(|p| (p, e)))
            );
            let file = sealed(entries);
            let bytes = file.to_json_vec().unwrap();
            let back = ManifestFile::from_json_slice(&bytes).unwrap();
            prop_assert_eq!(back, file);
        }
    }
}
