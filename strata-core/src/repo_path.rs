//! Repository-relative paths.
//!
//! Every tracked path is stored in canonical form: Unicode NFC, forward-slash
//! separated, no leading/trailing component whitespace, no empty or dot
//! components. [`RepoPath::check`] classifies a raw string into the repairs
//! that canonicalization would apply and a verdict; [`RepoPath::parse`]
//! (strict) and [`RepoPath::parse_normalizing`] build validated paths.
//!
//! Names that can never be made legal (control characters, Windows device
//! names, editor temp files, …) are rejected outright, never repaired.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Longest accepted component, in bytes. Matches the limit of common
/// filesystems (ext4, APFS, NTFS).
pub const MAX_COMPONENT_BYTES: usize = 255;

/// Characters rejected in any component besides ASCII controls.
const ILLEGAL_ASCII: &[char] = &['<', '>', '"', '|', '?', '*'];

/// Zero-width / invisible format characters with no linguistic purpose in
/// file names. ZWNJ and ZWJ (U+200C, U+200D) are deliberately absent: they
/// are meaningful in Persian, Arabic and Indic scripts.
const ZERO_WIDTH: &[char] = &['\u{200B}', '\u{200E}', '\u{200F}', '\u{2060}', '\u{FEFF}'];

/// Windows reserved device names, matched case-insensitively against the
/// component stem (the part before the first dot).
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// A repair applied while canonicalizing a raw path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Repair {
    /// A component was re-encoded from a non-NFC form to NFC.
    NormalizedUnicode,
    /// Leading or trailing ASCII whitespace was trimmed from a component.
    TrimmedWhitespace,
    /// Redundant separators (empty components) were collapsed.
    CollapsedSeparators,
}

/// Why a path can never enter the repository.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathRejection {
    #[error("empty path")]
    Empty,

    #[error("component {component:?} contains a control character")]
    ControlCharacter { component: String },

    #[error("component {component:?} contains illegal character {ch:?}")]
    IllegalCharacter { component: String, ch: char },

    #[error("component {component:?} contains a Unicode line or paragraph separator")]
    LineSeparator { component: String },

    #[error("component {component:?} contains a bidirectional control character")]
    BidiControl { component: String },

    #[error("component {component:?} contains a zero-width format character")]
    ZeroWidth { component: String },

    #[error("component {component:?} is a reserved device name")]
    ReservedName { component: String },

    #[error("component {component:?} matches a temporary-file pattern")]
    TempFile { component: String },

    #[error("path contains a '.' or '..' component")]
    DotComponent,

    #[error("component {component:?} exceeds {MAX_COMPONENT_BYTES} bytes")]
    ComponentTooLong { component: String },

    #[error("symlink target is empty")]
    EmptyLinkTarget,

    #[error("symlink target {target:?} is absolute")]
    AbsoluteLinkTarget { target: String },

    #[error("symlink target {target:?} escapes the repository root")]
    LinkEscapesRoot { target: String },
}

/// Outcome of canonicalizing and validating a raw path string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCheck {
    /// The canonical form (meaningful even when the verdict is a rejection,
    /// as far as canonicalization got).
    pub normalized: String,
    /// Repairs canonicalization applied, in application order.
    pub repairs: Vec<Repair>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(PathRejection),
}

/// Diagnostic classification for user-facing reports: what would
/// normalization fix, and what is beyond repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Already canonical and legal.
    Clean,
    /// Legal once the recorded repairs are applied.
    Repairable,
    /// Rejected; no repair sequence makes this path legal.
    Fatal,
}

impl PathCheck {
    pub fn classification(&self) -> Classification {
        match &self.verdict {
            Verdict::Reject(_) => Classification::Fatal,
            Verdict::Accept if self.repairs.is_empty() => Classification::Clean,
            Verdict::Accept => Classification::Repairable,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepoPathError {
    #[error("illegal path {path:?}: {rejection}")]
    Rejected {
        path: String,
        rejection: PathRejection,
    },

    #[error("path {original:?} is not canonical (canonical form is {normalized:?})")]
    NotNormalized { original: String, normalized: String },
}

/// A validated repository-relative path in canonical form.
///
/// Ordering is code-point order on the canonical string, which is also the
/// canonical entry order of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoPath(String);

impl RepoPath {
    /// Canonicalize `raw` and classify it without building a path.
    pub fn check(raw: &str) -> PathCheck {
        let mut repairs = Vec::new();
        let mut components = Vec::new();

        if raw.is_empty() {
            return PathCheck {
                normalized: String::new(),
                repairs,
                verdict: Verdict::Reject(PathRejection::Empty),
            };
        }

        let mut rejection = None;
        let mut saw_empty_component = false;

        for component in raw.split('/') {
            let nfc: String = component.nfc().collect();
            if nfc != component && !repairs.contains(&Repair::NormalizedUnicode) {
                repairs.push(Repair::NormalizedUnicode);
            }

            let trimmed = nfc.trim_matches(|c: char| c.is_ascii_whitespace());
            if trimmed != nfc && !repairs.contains(&Repair::TrimmedWhitespace) {
                repairs.push(Repair::TrimmedWhitespace);
            }

            if trimmed.is_empty() {
                saw_empty_component = true;
                continue;
            }

            if rejection.is_none() {
                rejection = reject_component(trimmed);
            }
            components.push(trimmed.to_owned());
        }

        if saw_empty_component && !repairs.contains(&Repair::CollapsedSeparators) {
            repairs.push(Repair::CollapsedSeparators);
        }

        let normalized = components.join("/");
        let verdict = match rejection {
            Some(rejection) => Verdict::Reject(rejection),
            None if normalized.is_empty() => Verdict::Reject(PathRejection::Empty),
            None => Verdict::Accept,
        };

        PathCheck {
            normalized,
            repairs,
            verdict,
        }
    }

    /// Strict parse: the input must already be canonical and legal.
    pub fn parse(raw: &str) -> Result<RepoPath, RepoPathError> {
        let check = Self::check(raw);
        match check.verdict {
            Verdict::Reject(rejection) => Err(RepoPathError::Rejected {
                path: raw.to_owned(),
                rejection,
            }),
            Verdict::Accept if !check.repairs.is_empty() => Err(RepoPathError::NotNormalized {
                original: raw.to_owned(),
                normalized: check.normalized,
            }),
            Verdict::Accept => Ok(RepoPath(check.normalized)),
        }
    }

    /// Normalizing parse: apply repairs, returning them alongside the path.
    pub fn parse_normalizing(raw: &str) -> Result<(RepoPath, Vec<Repair>), RepoPathError> {
        let check = Self::check(raw);
        match check.verdict {
            Verdict::Reject(rejection) => Err(RepoPathError::Rejected {
                path: raw.to_owned(),
                rejection,
            }),
            Verdict::Accept => Ok((RepoPath(check.normalized), check.repairs)),
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.0.split('/')
    }

    /// Number of directories above this path's final component.
    pub fn depth(&self) -> usize {
        self.components().count() - 1
    }

    pub fn file_name(&self) -> &str {
        self.components().next_back().unwrap_or(&self.0)
    }

    /// Join onto a filesystem root, one component at a time so the canonical
    /// `/` separator maps onto the host separator.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for component in self.components() {
            out.push(component);
        }
        out
    }
}

/// Validate a symlink target string against the link's position.
///
/// Targets are stored verbatim, never dereferenced, so only their shape is
/// checked: non-empty, relative, and staying inside the repository root when
/// resolved from the link's directory.
pub fn validate_link_target(link: &RepoPath, target: &str) -> Result<(), PathRejection> {
    if target.is_empty() {
        return Err(PathRejection::EmptyLinkTarget);
    }
    if target.starts_with('/') {
        return Err(PathRejection::AbsoluteLinkTarget {
            target: target.to_owned(),
        });
    }

    let mut depth = link.depth() as isize;
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return Err(PathRejection::LinkEscapesRoot {
                        target: target.to_owned(),
                    });
                }
            }
            _ => depth += 1,
        }
    }
    Ok(())
}

fn reject_component(component: &str) -> Option<PathRejection> {
    if component == "." || component == ".." {
        return Some(PathRejection::DotComponent);
    }
    if component.len() > MAX_COMPONENT_BYTES {
        return Some(PathRejection::ComponentTooLong {
            component: component.to_owned(),
        });
    }

    for ch in component.chars() {
        if ch.is_control() {
            return Some(PathRejection::ControlCharacter {
                component: component.to_owned(),
            });
        }
        if ILLEGAL_ASCII.contains(&ch) {
            return Some(PathRejection::IllegalCharacter {
                component: component.to_owned(),
                ch,
            });
        }
        if ch == '\u{2028}' || ch == '\u{2029}' {
            return Some(PathRejection::LineSeparator {
                component: component.to_owned(),
            });
        }
        if ('\u{202A}'..='\u{202E}').contains(&ch) {
            return Some(PathRejection::BidiControl {
                component: component.to_owned(),
            });
        }
        if ZERO_WIDTH.contains(&ch) {
            return Some(PathRejection::ZeroWidth {
                component: component.to_owned(),
            });
        }
    }

    let stem = component.split('.').next().unwrap_or(component);
    if RESERVED_NAMES
        .iter()
        .any(|name| stem.eq_ignore_ascii_case(name))
    {
        return Some(PathRejection::ReservedName {
            component: component.to_owned(),
        });
    }

    if component.starts_with('~') || component.ends_with('~') {
        return Some(PathRejection::TempFile {
            component: component.to_owned(),
        });
    }

    None
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RepoPath {
    type Err = RepoPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RepoPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RepoPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod unittests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::simple("a.txt")]
    #[case::nested("task1/import/input/data.csv")]
    #[case::unicode_nfc("caf\u{e9}.txt")]
    #[case::zwnj_kept("\u{0645}\u{200C}\u{0627}.txt")]
    #[case::dots_inside("archive.tar.gz")]
    #[case::tilde_inside("a~b.txt")]
    fn accepts_clean_paths(#[case] raw: &str) {
        let path = RepoPath::parse(raw).unwrap();
        assert_eq!(path.as_str(), raw);
        assert_eq!(
            RepoPath::check(raw).classification(),
            Classification::Clean
        );
    }

    #[rstest]
    #[case::control("a\u{1}b.txt")]
    #[case::delete_char("a\u{7f}.txt")]
    #[case::angle("a<b.txt")]
    #[case::pipe("a|b")]
    #[case::question("what?.txt")]
    #[case::star("*.txt")]
    #[case::line_sep("a\u{2028}b")]
    #[case::bidi("a\u{202E}txt.exe")]
    #[case::zero_width("a\u{200B}b.txt")]
    #[case::reserved_plain("CON")]
    #[case::reserved_ext("nul.txt")]
    #[case::reserved_nested("data/com3.csv")]
    #[case::temp_leading("~lock.docx")]
    #[case::temp_trailing("draft.txt~")]
    #[case::office_lock("~$report.docx")]
    #[case::dot(".")]
    #[case::dotdot("a/../b")]
    fn rejects_illegal_paths(#[case] raw: &str) {
        assert!(RepoPath::parse(raw).is_err());
        assert!(matches!(RepoPath::check(raw).verdict, Verdict::Reject(_)));
    }

    #[test]
    fn component_at_byte_limit_accepted_above_rejected() {
        let max = "x".repeat(MAX_COMPONENT_BYTES);
        assert!(RepoPath::parse(&max).is_ok());

        let over = "x".repeat(MAX_COMPONENT_BYTES + 1);
        let err = RepoPath::parse(&over).unwrap_err();
        assert!(matches!(
            err,
            RepoPathError::Rejected {
                rejection: PathRejection::ComponentTooLong { .. },
                ..
            }
        ));
    }

    #[test]
    fn nfd_is_repaired_to_nfc() {
        // "café.txt" with a combining acute accent
        let nfd = "cafe\u{301}.txt";
        let nfc = "caf\u{e9}.txt";

        let err = RepoPath::parse(nfd).unwrap_err();
        assert!(matches!(err, RepoPathError::NotNormalized { .. }));

        let (path, repairs) = RepoPath::parse_normalizing(nfd).unwrap();
        assert_eq!(path.as_str(), nfc);
        assert_eq!(repairs, vec![Repair::NormalizedUnicode]);
        assert_eq!(
            RepoPath::check(nfd).classification(),
            Classification::Repairable
        );
    }

    #[test]
    fn nfd_and_nfc_normalize_to_same_path() {
        let (from_nfd, _) = RepoPath::parse_normalizing("cafe\u{301}.txt").unwrap();
        let from_nfc = RepoPath::parse("caf\u{e9}.txt").unwrap();
        assert_eq!(from_nfd, from_nfc);
    }

    #[test]
    fn whitespace_and_separators_are_repaired() {
        let (path, repairs) = RepoPath::parse_normalizing(" a /b//c.txt").unwrap();
        assert_eq!(path.as_str(), "a/b/c.txt");
        assert!(repairs.contains(&Repair::TrimmedWhitespace));
        assert!(repairs.contains(&Repair::CollapsedSeparators));
    }

    #[test]
    fn empty_and_slash_only_rejected() {
        for raw in ["", "/", "//", "  /  "] {
            let check = RepoPath::check(raw);
            assert_eq!(
                check.verdict,
                Verdict::Reject(PathRejection::Empty),
                "expected Empty for {raw:?}"
            );
        }
    }

    #[rstest]
    #[case::sibling("a/link", "b.txt")]
    #[case::up_and_over("task1/out/link", "../input/data.csv")]
    #[case::to_repo_root_child("task1/link", "../top.txt")]
    fn link_targets_inside_root_accepted(#[case] link: &str, #[case] target: &str) {
        let link = RepoPath::parse(link).unwrap();
        assert_eq!(validate_link_target(&link, target), Ok(()));
    }

    #[rstest]
    #[case::absolute("a/link", "/etc/passwd", PathRejection::AbsoluteLinkTarget { target: "/etc/passwd".into() })]
    #[case::escape("link", "../outside", PathRejection::LinkEscapesRoot { target: "../outside".into() })]
    #[case::deep_escape("a/link", "../../outside", PathRejection::LinkEscapesRoot { target: "../../outside".into() })]
    #[case::empty("a/link", "", PathRejection::EmptyLinkTarget)]
    fn link_targets_outside_root_rejected(
        #[case] link: &str,
        #[case] target: &str,
        #[case] expected: PathRejection,
    ) {
        let link = RepoPath::parse(link).unwrap();
        assert_eq!(validate_link_target(&link, target), Err(expected));
    }

    #[test]
    fn serde_rejects_illegal_manifest_paths() {
        let ok: Result<RepoPath, _> = serde_json::from_str("\"a/b.txt\"");
        assert!(ok.is_ok());
        let bad: Result<RepoPath, _> = serde_json::from_str("\"a/../b.txt\"");
        assert!(bad.is_err());
    }

    #[test]
    fn ordering_is_code_point_order() {
        let mut paths = vec![
            RepoPath::parse("b.txt").unwrap(),
            RepoPath::parse("a/z.txt").unwrap(),
            RepoPath::parse("a.txt").unwrap(),
        ];
        paths.sort();
        let order: Vec<&str> = paths.iter().map(RepoPath::as_str).collect();
        assert_eq!(order, vec!["a.txt", "a/z.txt", "b.txt"]);
    }
}
