//! The per-path sync state machine.
//!
//! For every path, the joint state of (local-on-disk, local-cache, remote)
//! collapses into one of fifteen canonical states. Presence in each of the
//! three manifests gives eight combinations; equality relations among the
//! present sides split them further. Each state maps to exactly one action.

use serde::{Deserialize, Serialize};

use strata_core::Entry;

/// Canonical joint state of one path across the three manifests.
///
/// Naming: the three digits are presence in (local, cache, remote).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// 111, L=C=R: all agree.
    S1AllAgree,
    /// 111, L=C≠R: remote changed.
    S2RemoteChanged,
    /// 111, L=R≠C: another client committed what we already have.
    S3CacheStale,
    /// 111, C=R≠L: local changed.
    S4LocalChanged,
    /// 111, all differ: three-way divergence.
    S5Divergent,
    /// 011, C=R: local deleted.
    S6LocalDeleted,
    /// 011, C≠R: local deleted but remote changed.
    S7DeleteVsChange,
    /// 101, L=R: cache lost, sides agree.
    S8CacheLostAgree,
    /// 101, L≠R: cache lost, sides disagree.
    S9CacheLostDiffer,
    /// 110, L=C: remote deleted by peer.
    S10RemoteDeleted,
    /// 110, L≠C: remote deleted but local changed.
    S11DeleteVsLocalChange,
    /// 001: only remote.
    S12RemoteOnly,
    /// 010: only cache (stale record).
    S13CacheOnly,
    /// 100: only local.
    S14LocalOnly,
    /// 000: nowhere. Unreachable for any path drawn from the union of the
    /// three manifests.
    S15Absent,
}

/// What the coordinator does about a path in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncAction {
    Noop,
    Download,
    Upload,
    DeleteLocal,
    DeleteRemote,
    RefreshCache,
    Conflict,
}

impl SyncState {
    /// Classify the joint state of one path.
    pub fn classify(local: Option<&Entry>, cache: Option<&Entry>, remote: Option<&Entry>) -> Self {
        use SyncState::*;
        match (local, cache, remote) {
            (Some(l), Some(c), Some(r)) => {
                let lc = l.same_content(c);
                let lr = l.same_content(r);
                let cr = c.same_content(r);
                // With hash-less fallback equality the three relations need
                // not be transitive, so the match is total: the local↔cache
                // and cache↔remote relations decide, local↔remote only
                // splits S3 from S5.
                match (lc, cr) {
                    (true, true) => S1AllAgree,
                    (true, false) => S2RemoteChanged,
                    (false, true) => S4LocalChanged,
                    (false, false) if lr => S3CacheStale,
                    (false, false) => S5Divergent,
                }
            }
            (None, Some(c), Some(r)) => {
                if c.same_content(r) {
                    S6LocalDeleted
                } else {
                    S7DeleteVsChange
                }
            }
            (Some(l), None, Some(r)) => {
                if l.same_content(r) {
                    S8CacheLostAgree
                } else {
                    S9CacheLostDiffer
                }
            }
            (Some(l), Some(c), None) => {
                if l.same_content(c) {
                    S10RemoteDeleted
                } else {
                    S11DeleteVsLocalChange
                }
            }
            (None, None, Some(_)) => S12RemoteOnly,
            (None, Some(_), None) => S13CacheOnly,
            (Some(_), None, None) => S14LocalOnly,
            (None, None, None) => S15Absent,
        }
    }

    /// The action this state selects under normal (non-force) policy.
    pub fn action(&self) -> SyncAction {
        use SyncAction::*;
        use SyncState::*;
        match self {
            S1AllAgree => Noop,
            S2RemoteChanged | S8CacheLostAgree | S12RemoteOnly => Download,
            S4LocalChanged | S14LocalOnly => Upload,
            S3CacheStale => RefreshCache,
            S6LocalDeleted => DeleteRemote,
            S10RemoteDeleted | S13CacheOnly => DeleteLocal,
            S5Divergent | S7DeleteVsChange | S9CacheLostDiffer | S11DeleteVsLocalChange => Conflict,
            // Never produced for a path present in any manifest.
            S15Absent => Noop,
        }
    }

    /// The action under `--force` policy: local wins three-way divergences,
    /// remote wins the delete-vs-change case.
    pub fn forced_action(&self) -> SyncAction {
        use SyncState::*;
        match self {
            S5Divergent | S9CacheLostDiffer | S11DeleteVsLocalChange => SyncAction::Upload,
            S7DeleteVsChange => SyncAction::Download,
            _ => self.action(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.action() == SyncAction::Conflict
    }
}

#[cfg(test)]
mod unittests {
    use chrono::DateTime;
    use rstest::rstest;
    use strata_utils_hash::Sha256;

    use super::SyncState::*;
    use super::*;

    fn file(content: &str) -> Entry {
        Entry::File {
            hash: Some(Sha256::digest(content)),
            size: content.len() as u64,
            mtime: DateTime::parse_from_rfc3339("2025-05-30T09:00:00-07:00").unwrap(),
            user: "alice@example.org".into(),
        }
    }

    fn link(target: &str) -> Entry {
        Entry::Link {
            target: target.into(),
        }
    }

    #[rstest]
    #[case::s1(Some("A"), Some("A"), Some("A"), S1AllAgree)]
    #[case::s2(Some("A"), Some("A"), Some("A2"), S2RemoteChanged)]
    #[case::s3(Some("A2"), Some("A"), Some("A2"), S3CacheStale)]
    #[case::s4(Some("A2"), Some("A"), Some("A"), S4LocalChanged)]
    #[case::s5(Some("A1"), Some("A2"), Some("A3"), S5Divergent)]
    #[case::s6(None, Some("A"), Some("A"), S6LocalDeleted)]
    #[case::s7(None, Some("A"), Some("A2"), S7DeleteVsChange)]
    #[case::s8(Some("A"), None, Some("A"), S8CacheLostAgree)]
    #[case::s9(Some("A"), None, Some("A2"), S9CacheLostDiffer)]
    #[case::s10(Some("A"), Some("A"), None, S10RemoteDeleted)]
    #[case::s11(Some("A2"), Some("A"), None, S11DeleteVsLocalChange)]
    #[case::s12(None, None, Some("A"), S12RemoteOnly)]
    #[case::s13(None, Some("A"), None, S13CacheOnly)]
    #[case::s14(Some("A"), None, None, S14LocalOnly)]
    #[case::s15(None, None, None, S15Absent)]
    fn classification_table(
        #[case] local: Option<&str>,
        #[case] cache: Option<&str>,
        #[case] remote: Option<&str>,
        #[case] expected: SyncState,
    ) {
        let local = local.map(file);
        let cache = cache.map(file);
        let remote = remote.map(file);
        assert_eq!(
            SyncState::classify(local.as_ref(), cache.as_ref(), remote.as_ref()),
            expected
        );
    }

    #[rstest]
    #[case(S1AllAgree, SyncAction::Noop)]
    #[case(S2RemoteChanged, SyncAction::Download)]
    #[case(S3CacheStale, SyncAction::RefreshCache)]
    #[case(S4LocalChanged, SyncAction::Upload)]
    #[case(S5Divergent, SyncAction::Conflict)]
    #[case(S6LocalDeleted, SyncAction::DeleteRemote)]
    #[case(S7DeleteVsChange, SyncAction::Conflict)]
    #[case(S8CacheLostAgree, SyncAction::Download)]
    #[case(S9CacheLostDiffer, SyncAction::Conflict)]
    #[case(S10RemoteDeleted, SyncAction::DeleteLocal)]
    #[case(S11DeleteVsLocalChange, SyncAction::Conflict)]
    #[case(S12RemoteOnly, SyncAction::Download)]
    #[case(S13CacheOnly, SyncAction::DeleteLocal)]
    #[case(S14LocalOnly, SyncAction::Upload)]
    fn action_table(#[case] state: SyncState, #[case] action: SyncAction) {
        assert_eq!(state.action(), action);
    }

    #[rstest]
    #[case(S5Divergent, SyncAction::Upload)]
    #[case(S9CacheLostDiffer, SyncAction::Upload)]
    #[case(S11DeleteVsLocalChange, SyncAction::Upload)]
    #[case(S7DeleteVsChange, SyncAction::Download)]
    #[case(S2RemoteChanged, SyncAction::Download)]
    fn forced_action_table(#[case] state: SyncState, #[case] action: SyncAction) {
        assert_eq!(state.forced_action(), action);
    }

    /// A file replaced by a symlink is a content change, not agreement.
    #[test]
    fn kind_change_classifies_as_local_change() {
        let l = link("b.txt");
        let c = file("A");
        let r = file("A");
        assert_eq!(
            SyncState::classify(Some(&l), Some(&c), Some(&r)),
            S4LocalChanged
        );
    }

    /// Metadata fallback: an unhashed fast-scan entry matching the cache's
    /// size and mtime still classifies as agreement.
    #[test]
    fn unhashed_local_can_agree() {
        let hashed = file("A");
        let unhashed = match &hashed {
            Entry::File { size, mtime, user, .. } => Entry::File {
                hash: None,
                size: *size,
                mtime: *mtime,
                user: user.clone(),
            },
            _ => unreachable!(),
        };
        assert_eq!(
            SyncState::classify(Some(&unhashed), Some(&hashed), Some(&hashed)),
            S1AllAgree
        );
    }
}
