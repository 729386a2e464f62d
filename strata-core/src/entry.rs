//! Tracked entries: files and symlinks.
//!
//! Directories are never tracked; they are implied by the paths of the files
//! beneath them. The serialized shape matches the manifest file format:
//! a `type` tag of `"file"` or `"link"` plus kind-specific fields.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use strata_utils_hash::Sha256;

/// Metadata for one tracked path.
///
/// A file's `hash` may be absent on freshly scanned local entries when the
/// scanner ran in fast (no-hash) mode; [`Entry::same_content`] falls back to
/// metadata comparison in that case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Entry {
    #[serde(rename = "file")]
    File {
        #[serde(skip_serializing_if = "Option::is_none")]
        hash: Option<Sha256>,
        size: u64,
        mtime: DateTime<FixedOffset>,
        user: String,
    },
    #[serde(rename = "link")]
    Link { target: String },
}

impl Entry {
    pub fn is_file(&self) -> bool {
        matches!(self, Entry::File { .. })
    }

    pub fn is_link(&self) -> bool {
        matches!(self, Entry::Link { .. })
    }

    pub fn hash(&self) -> Option<Sha256> {
        match self {
            Entry::File { hash, .. } => *hash,
            Entry::Link { .. } => None,
        }
    }

    /// Content equality across manifests.
    ///
    /// Same kind and all fields agree. When either side of a file pair lacks
    /// a hash, equality falls back to `(size, mtime)` metadata - this keeps
    /// fast scans (hashing deferred) comparable against hashed manifests.
    pub fn same_content(&self, other: &Entry) -> bool {
        match (self, other) {
            (
                Entry::File {
                    hash: h1,
                    size: s1,
                    mtime: m1,
                    ..
                },
                Entry::File {
                    hash: h2,
                    size: s2,
                    mtime: m2,
                    ..
                },
            ) => match (h1, h2) {
                (Some(h1), Some(h2)) => h1 == h2,
                _ => s1 == s2 && m1 == m2,
            },
            (Entry::Link { target: t1 }, Entry::Link { target: t2 }) => t1 == t2,
            // A kind change (file ↔ link) is never equal.
            _ => false,
        }
    }
}

#[cfg(test)]
mod unittests {
    use super::*;

    fn file(hash: Option<&str>, size: u64, mtime: &str) -> Entry {
        Entry::File {
            hash: hash.map(|h| h.parse().unwrap()),
            size,
            mtime: DateTime::parse_from_rfc3339(mtime).unwrap(),
            user: "alice@example.org".into(),
        }
    }

    const HASH_A: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const HASH_B: &str = "248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1";

    #[test]
    fn hashed_files_compare_by_hash() {
        let a = file(Some(HASH_A), 3, "2025-05-30T09:00:00-07:00");
        let same_hash_other_meta = file(Some(HASH_A), 99, "2020-01-01T00:00:00+00:00");
        let other_hash = file(Some(HASH_B), 3, "2025-05-30T09:00:00-07:00");

        assert!(a.same_content(&same_hash_other_meta));
        assert!(!a.same_content(&other_hash));
    }

    #[test]
    fn missing_hash_falls_back_to_metadata() {
        let scanned = file(None, 3, "2025-05-30T09:00:00-07:00");
        let cached = file(Some(HASH_A), 3, "2025-05-30T09:00:00-07:00");
        let touched = file(Some(HASH_A), 3, "2025-05-31T09:00:00-07:00");

        assert!(scanned.same_content(&cached));
        assert!(!scanned.same_content(&touched));
    }

    #[test]
    fn kind_change_is_never_equal() {
        let f = file(Some(HASH_A), 3, "2025-05-30T09:00:00-07:00");
        let l = Entry::Link {
            target: "b.txt".into(),
        };
        assert!(!f.same_content(&l));
        assert!(!l.same_content(&f));
    }

    #[test]
    fn links_compare_by_target() {
        let a = Entry::Link {
            target: "../input/data.csv".into(),
        };
        let b = Entry::Link {
            target: "../input/data.csv".into(),
        };
        let c = Entry::Link {
            target: "other".into(),
        };
        assert!(a.same_content(&b));
        assert!(!a.same_content(&c));
    }

    #[test]
    fn serde_shape_matches_manifest_format() {
        let f = file(Some(HASH_A), 1048576, "2025-05-30T09:00:00-07:00");
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["hash"], HASH_A);
        assert_eq!(json["size"], 1048576);
        assert_eq!(json["user"], "alice@example.org");

        let l = Entry::Link {
            target: "../input/data.csv".into(),
        };
        let json = serde_json::to_value(&l).unwrap();
        assert_eq!(json["type"], "link");
        assert_eq!(json["target"], "../input/data.csv");
    }

    #[test]
    fn unhashed_entry_omits_hash_field() {
        let f = file(None, 1, "2025-05-30T09:00:00-07:00");
        let json = serde_json::to_value(&f).unwrap();
        assert!(json.get("hash").is_none());
    }
}
