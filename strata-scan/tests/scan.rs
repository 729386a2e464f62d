//! Integration tests for the scanner: real directory trees via tempfile.

use std::fs;
use std::os::unix::fs::symlink;

use tempfile::TempDir;

use strata_core::repo_path::PathRejection;
use strata_scan::{scan, with_control_dir_excluded, DiagnosticKind, ScanOptions};
use strata_utils_hash::Sha256;

fn options() -> ScanOptions {
    ScanOptions::new("alice@example.org")
}

async fn scan_all(root: &std::path::Path, options: ScanOptions) -> strata_scan::ScanOutcome {
    scan(root, with_control_dir_excluded(|_| false), options)
        .await
        .unwrap()
}

#[tokio::test]
async fn scans_nested_tree_in_canonical_order() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("task1/input")).unwrap();
    fs::write(dir.path().join("b.txt"), "B").unwrap();
    fs::write(dir.path().join("a.txt"), "A").unwrap();
    fs::write(dir.path().join("task1/input/data.csv"), "1,2,3\n").unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    assert!(outcome.diagnostics.is_empty());
    let paths: Vec<&str> = outcome.manifest.paths().map(|p| p.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "b.txt", "task1/input/data.csv"]);

    let entry = outcome
        .manifest
        .get(&"a.txt".parse().unwrap())
        .unwrap()
        .clone();
    assert_eq!(entry.hash(), Some(Sha256::digest("A")));
}

#[tokio::test]
async fn zero_byte_file_is_tracked_with_real_digest() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("empty"), "").unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    let entry = outcome
        .manifest
        .get(&"empty".parse().unwrap())
        .unwrap()
        .clone();
    assert_eq!(entry.hash(), Some(Sha256::digest("")));
    match entry {
        strata_core::Entry::File { size, .. } => assert_eq!(size, 0),
        other => panic!("expected file entry, got {other:?}"),
    }
}

#[tokio::test]
async fn fast_scan_defers_hashing() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), "A").unwrap();

    let outcome = scan_all(dir.path(), options().without_hashes()).await;

    let entry = outcome.manifest.get(&"a.txt".parse().unwrap()).unwrap();
    assert_eq!(entry.hash(), None);
}

#[tokio::test]
async fn exclusion_predicate_prunes_directories() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("out")).unwrap();
    fs::write(dir.path().join("out/artifact.bin"), "x").unwrap();
    fs::write(dir.path().join("keep.txt"), "k").unwrap();

    let outcome = scan(
        dir.path(),
        with_control_dir_excluded(|rel| rel == "out" || rel.starts_with("out/")),
        options(),
    )
    .await
    .unwrap();

    let paths: Vec<&str> = outcome.manifest.paths().map(|p| p.as_str()).collect();
    assert_eq!(paths, vec!["keep.txt"]);
}

#[tokio::test]
async fn control_directory_is_never_tracked() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join(".dsg/archive")).unwrap();
    fs::write(dir.path().join(".dsg/last-sync.json"), "{}").unwrap();
    fs::write(dir.path().join("a.txt"), "A").unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    let paths: Vec<&str> = outcome.manifest.paths().map(|p| p.as_str()).collect();
    assert_eq!(paths, vec!["a.txt"]);
}

#[tokio::test]
async fn relative_symlink_tracked_verbatim() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("data.csv"), "1\n").unwrap();
    symlink("data.csv", dir.path().join("link")).unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    assert!(outcome.diagnostics.is_empty());
    let entry = outcome.manifest.get(&"link".parse().unwrap()).unwrap();
    assert_eq!(
        entry,
        &strata_core::Entry::Link {
            target: "data.csv".into()
        }
    );
}

#[tokio::test]
async fn broken_symlink_reported_not_tracked() {
    let dir = TempDir::new().unwrap();
    symlink("missing", dir.path().join("dangling")).unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    assert!(outcome.manifest.is_empty());
    assert_eq!(outcome.diagnostics.len(), 1);
    assert_eq!(outcome.diagnostics[0].path, "dangling");
    assert_eq!(outcome.diagnostics[0].kind, DiagnosticKind::BrokenSymlink);
}

#[tokio::test]
async fn absolute_symlink_rejected() {
    let dir = TempDir::new().unwrap();
    symlink("/etc/hostname", dir.path().join("escape")).unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    assert!(outcome.manifest.is_empty());
    assert!(matches!(
        outcome.diagnostics[0].kind,
        DiagnosticKind::Rejected(PathRejection::AbsoluteLinkTarget { .. })
    ));
}

#[tokio::test]
async fn escaping_symlink_rejected() {
    let dir = TempDir::new().unwrap();
    symlink("../outside", dir.path().join("escape")).unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    assert!(outcome.manifest.is_empty());
    assert!(matches!(
        outcome.diagnostics[0].kind,
        DiagnosticKind::Rejected(PathRejection::LinkEscapesRoot { .. })
    ));
}

#[tokio::test]
async fn nfd_name_is_error_without_normalize() {
    let dir = TempDir::new().unwrap();
    let nfd = "cafe\u{301}.txt";
    fs::write(dir.path().join(nfd), "coffee").unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    assert!(outcome.manifest.is_empty());
    assert!(outcome.has_fatal_diagnostics());
    match &outcome.diagnostics[0].kind {
        DiagnosticKind::NotNormalized { normalized } => {
            assert_eq!(normalized, "caf\u{e9}.txt");
        }
        other => panic!("expected NotNormalized, got {other:?}"),
    }
}

#[tokio::test]
async fn nfd_name_repaired_with_normalize() {
    let dir = TempDir::new().unwrap();
    let nfd = "cafe\u{301}.txt";
    fs::write(dir.path().join(nfd), "coffee").unwrap();

    let outcome = scan_all(dir.path(), options().normalizing()).await;

    assert!(!outcome.has_fatal_diagnostics());
    assert!(outcome
        .manifest
        .contains(&"caf\u{e9}.txt".parse().unwrap()));
    // The planned disk rename is surfaced for the transaction to apply.
    assert_eq!(outcome.renames.len(), 1);
    assert_eq!(outcome.renames[0].1.as_str(), "caf\u{e9}.txt");
}

#[tokio::test]
async fn illegal_name_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("bad|name"), "x").unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    assert!(outcome.manifest.is_empty());
    assert!(matches!(
        outcome.diagnostics[0].kind,
        DiagnosticKind::Rejected(PathRejection::IllegalCharacter { .. })
    ));
}

#[tokio::test]
async fn socket_is_unsupported() {
    let dir = TempDir::new().unwrap();
    let _listener = std::os::unix::net::UnixListener::bind(dir.path().join("sock")).unwrap();
    fs::write(dir.path().join("a.txt"), "A").unwrap();

    let outcome = scan_all(dir.path(), options()).await;

    let paths: Vec<&str> = outcome.manifest.paths().map(|p| p.as_str()).collect();
    assert_eq!(paths, vec!["a.txt"]);
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::UnsupportedFileType));
}

#[tokio::test]
async fn unreadable_root_is_fatal() {
    let missing = std::path::Path::new("/nonexistent/strata-test-root");
    let result = scan(missing, |_| false, options()).await;
    assert!(result.is_err());
}
