//! Snapshot ids and history records.
//!
//! Snapshots are numbered `s1, s2, …` in the remote's append-only history.
//! The id's numeric part drives ordering and the `next()` successor; the
//! string form is what every file format stores.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid snapshot id {0:?}: expected 's' followed by a positive integer")]
pub struct ParseSnapshotIdError(String);

/// A snapshot id: `s1`, `s2`, …
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(u64);

impl SnapshotId {
    /// The id of the initial snapshot of a repository.
    pub const FIRST: SnapshotId = SnapshotId(1);

    pub fn new(number: u64) -> Option<SnapshotId> {
        (number > 0).then_some(SnapshotId(number))
    }

    #[inline]
    pub fn number(&self) -> u64 {
        self.0
    }

    /// The id the next committed snapshot will carry.
    pub fn next(&self) -> SnapshotId {
        SnapshotId(self.0 + 1)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = ParseSnapshotIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = s
            .strip_prefix('s')
            .and_then(|n| n.parse::<u64>().ok())
            .and_then(|n| (n > 0).then_some(n))
            .ok_or_else(|| ParseSnapshotIdError(s.to_owned()))?;
        Ok(SnapshotId(number))
    }
}

impl Serialize for SnapshotId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SnapshotId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One line of the snapshot log (`sync-messages.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: SnapshotId,
    pub created_at: DateTime<FixedOffset>,
    pub created_by: String,
    pub message: Option<String>,
    pub previous: Option<SnapshotId>,
}

#[cfg(test)]
mod unittests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("s1", 1)]
    #[case("s42", 42)]
    #[case("s1000", 1000)]
    fn parse_and_display(#[case] s: &str, #[case] n: u64) {
        let id: SnapshotId = s.parse().unwrap();
        assert_eq!(id.number(), n);
        assert_eq!(id.to_string(), s);
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_prefix("42")]
    #[case::zero("s0")]
    #[case::negative("s-1")]
    #[case::junk("snapshot1")]
    fn parse_rejects(#[case] s: &str) {
        assert!(s.parse::<SnapshotId>().is_err());
    }

    #[test]
    fn ordering_is_numeric_not_lexical() {
        let s2: SnapshotId = "s2".parse().unwrap();
        let s10: SnapshotId = "s10".parse().unwrap();
        assert!(s2 < s10);
    }

    #[test]
    fn next_increments() {
        assert_eq!(SnapshotId::FIRST.next().to_string(), "s2");
    }

    #[test]
    fn serde_as_string() {
        let id: SnapshotId = "s7".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"s7\"");
        let back: SnapshotId = serde_json::from_str("\"s7\"").unwrap();
        assert_eq!(back, id);
    }
}
