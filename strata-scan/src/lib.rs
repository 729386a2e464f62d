//! Filesystem scanner building Strata manifests.
//!
//! A scan walks a working directory depth-first, validates every relative
//! path, and produces a [`Manifest`] plus a list of diagnostics. I/O errors
//! on individual entries are collected, never raised: the manifest is built
//! from what was readable and the diagnostics drive user-visible reports.
//!
//! The directory walk runs on the blocking pool; content hashing fans out
//! across a semaphore-bounded set of tasks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Local};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

use strata_core::repo_path::{PathRejection, Repair, RepoPath, Verdict};
use strata_core::{Entry, Manifest, RepoLayout, validate_link_target};
use strata_utils_hash::HashSink;

mod walk;

use walk::{RawEntry, RawKind};

/// Default width of the hashing worker pool.
pub const DEFAULT_HASH_WORKERS: usize = 8;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scan root {root} is not a readable directory: {source}")]
    RootUnreadable {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("hashing task panicked: {0}")]
    WorkerPanic(#[from] tokio::task::JoinError),
}

/// Scan configuration.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Hash file contents. When false, file entries carry no hash (fast
    /// scan for planning only) and comparisons fall back to metadata.
    pub compute_hashes: bool,
    /// Apply repairs (NFC, whitespace, separators) instead of reporting
    /// repairable paths as errors.
    pub normalize: bool,
    /// Recorded as the `user` of newly scanned file entries.
    pub user: String,
    /// Bound on concurrently hashed files.
    pub hash_workers: usize,
}

impl ScanOptions {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            compute_hashes: true,
            normalize: false,
            user: user.into(),
            hash_workers: DEFAULT_HASH_WORKERS,
        }
    }

    pub fn without_hashes(mut self) -> Self {
        self.compute_hashes = false;
        self
    }

    pub fn normalizing(mut self) -> Self {
        self.normalize = true;
        self
    }
}

/// One per-path problem found during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// The path as encountered on disk, relative to the root.
    pub path: String,
    pub kind: DiagnosticKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// The name can never enter the repository.
    Rejected(PathRejection),
    /// The name needs repairs and normalization was not enabled.
    NotNormalized { normalized: String },
    /// Repairs were applied (normalization enabled); the entry is tracked
    /// under the normalized name.
    Repaired {
        normalized: String,
        repairs: Vec<Repair>,
    },
    /// The entry could not be read.
    Unreadable { error: String },
    /// A symlink whose target does not exist.
    BrokenSymlink,
    /// Device, socket, or pipe.
    UnsupportedFileType,
    /// The file's size or mtime moved while it was being hashed; it is
    /// unreadable for this pass.
    ChangedDuringHash,
}

impl Diagnostic {
    /// Whether this diagnostic blocks a strict (non-normalizing) sync.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            DiagnosticKind::Rejected(_) | DiagnosticKind::NotNormalized { .. }
        )
    }
}

/// Result of a scan: what was tracked, and what was not.
#[derive(Debug)]
pub struct ScanOutcome {
    pub manifest: Manifest,
    pub diagnostics: Vec<Diagnostic>,
    /// Disk renames normalization decided on (original relative path →
    /// normalized), to be applied before transfer. Empty unless
    /// `normalize` was set.
    pub renames: Vec<(PathBuf, RepoPath)>,
}

impl ScanOutcome {
    pub fn has_fatal_diagnostics(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_fatal)
    }
}

/// Scan `root`, skipping paths the predicate excludes.
///
/// The predicate sees repository-relative paths with `/` separators and is
/// consulted for files and directories alike; an excluded directory is not
/// descended into. The control directory is always excluded.
pub async fn scan<F>(root: &Path, excluded: F, options: ScanOptions) -> Result<ScanOutcome, ScanError>
where
    F: Fn(&str) -> bool + Send + 'static,
{
    let raw = walk::walk(root.to_owned(), excluded).await?;

    let mut diagnostics = raw.diagnostics;
    let mut renames = Vec::new();
    let mut files = Vec::new();
    let mut entries = BTreeMap::new();

    for raw_entry in raw.entries {
        let Some(path) = validate_path(&raw_entry, &options, &mut diagnostics, &mut renames)
        else {
            continue;
        };

        match raw_entry.kind {
            RawKind::Link { target } => {
                if let Err(rejection) = validate_link_target(&path, &target) {
                    diagnostics.push(Diagnostic {
                        path: raw_entry.relative,
                        kind: DiagnosticKind::Rejected(rejection),
                    });
                    continue;
                }
                if raw_entry.broken_link {
                    diagnostics.push(Diagnostic {
                        path: raw_entry.relative,
                        kind: DiagnosticKind::BrokenSymlink,
                    });
                    continue;
                }
                entries.insert(path, Entry::Link { target });
            }
            RawKind::File { size, mtime } => {
                files.push(FileToHash {
                    absolute: raw_entry.absolute,
                    relative: raw_entry.relative,
                    path,
                    size,
                    mtime,
                });
            }
        }
    }

    if options.compute_hashes {
        hash_files(files, &options, &mut entries, &mut diagnostics).await?;
    } else {
        for file in files {
            entries.insert(
                file.path,
                Entry::File {
                    hash: None,
                    size: file.size,
                    mtime: file.mtime,
                    user: options.user.clone(),
                },
            );
        }
    }

    debug!(
        entries = entries.len(),
        diagnostics = diagnostics.len(),
        "scan complete"
    );

    Ok(ScanOutcome {
        manifest: Manifest::from_entries(entries),
        diagnostics,
        renames,
    })
}

struct FileToHash {
    absolute: PathBuf,
    relative: String,
    path: RepoPath,
    size: u64,
    mtime: DateTime<FixedOffset>,
}

fn validate_path(
    raw_entry: &RawEntry,
    options: &ScanOptions,
    diagnostics: &mut Vec<Diagnostic>,
    renames: &mut Vec<(PathBuf, RepoPath)>,
) -> Option<RepoPath> {
    let check = RepoPath::check(&raw_entry.relative);
    match check.verdict {
        Verdict::Reject(rejection) => {
            diagnostics.push(Diagnostic {
                path: raw_entry.relative.clone(),
                kind: DiagnosticKind::Rejected(rejection),
            });
            None
        }
        Verdict::Accept if check.repairs.is_empty() => {
            RepoPath::parse(&check.normalized).ok()
        }
        Verdict::Accept if options.normalize => {
            let path = RepoPath::parse(&check.normalized).ok()?;
            diagnostics.push(Diagnostic {
                path: raw_entry.relative.clone(),
                kind: DiagnosticKind::Repaired {
                    normalized: check.normalized,
                    repairs: check.repairs,
                },
            });
            renames.push((raw_entry.absolute.clone(), path.clone()));
            Some(path)
        }
        Verdict::Accept => {
            diagnostics.push(Diagnostic {
                path: raw_entry.relative.clone(),
                kind: DiagnosticKind::NotNormalized {
                    normalized: check.normalized,
                },
            });
            None
        }
    }
}

async fn hash_files(
    files: Vec<FileToHash>,
    options: &ScanOptions,
    entries: &mut BTreeMap<RepoPath, Entry>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<(), ScanError> {
    let semaphore = Arc::new(Semaphore::new(options.hash_workers.max(1)));
    let mut tasks = Vec::with_capacity(files.len());

    for file in files {
        let semaphore = semaphore.clone();
        let user = options.user.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("hash semaphore closed");
            hash_one(file, user).await
        }));
    }

    for task in tasks {
        match task.await? {
            HashResult::Hashed { path, entry } => {
                entries.insert(path, entry);
            }
            HashResult::Diagnostic(diagnostic) => diagnostics.push(diagnostic),
        }
    }
    Ok(())
}

enum HashResult {
    Hashed { path: RepoPath, entry: Entry },
    Diagnostic(Diagnostic),
}

async fn hash_one(file: FileToHash, user: String) -> HashResult {
    let mut source = match tokio::fs::File::open(&file.absolute).await {
        Ok(source) => source,
        Err(error) => {
            return HashResult::Diagnostic(Diagnostic {
                path: file.relative,
                kind: DiagnosticKind::Unreadable {
                    error: error.to_string(),
                },
            });
        }
    };

    let mut sink = HashSink::new();
    if let Err(error) = tokio::io::copy(&mut source, &mut sink).await {
        return HashResult::Diagnostic(Diagnostic {
            path: file.relative,
            kind: DiagnosticKind::Unreadable {
                error: error.to_string(),
            },
        });
    }
    let (hashed_size, hash) = sink.finish();

    // Writer-while-reader guard: re-stat after hashing; a moved size or
    // mtime means the digest may describe no version that ever existed.
    match tokio::fs::symlink_metadata(&file.absolute).await {
        Ok(meta) => {
            let mtime_now = meta
                .modified()
                .map(|t| DateTime::<Local>::from(t).fixed_offset())
                .ok();
            if meta.len() != file.size || hashed_size != file.size || mtime_now != Some(file.mtime)
            {
                return HashResult::Diagnostic(Diagnostic {
                    path: file.relative,
                    kind: DiagnosticKind::ChangedDuringHash,
                });
            }
        }
        Err(error) => {
            return HashResult::Diagnostic(Diagnostic {
                path: file.relative,
                kind: DiagnosticKind::Unreadable {
                    error: error.to_string(),
                },
            });
        }
    }

    HashResult::Hashed {
        path: file.path,
        entry: Entry::File {
            hash: Some(hash),
            size: file.size,
            mtime: file.mtime,
            user,
        },
    }
}

/// Always-excluded control paths, composed with the caller's predicate.
pub fn with_control_dir_excluded<F>(excluded: F) -> impl Fn(&str) -> bool + Send + 'static
where
    F: Fn(&str) -> bool + Send + 'static,
{
    move |relative: &str| RepoLayout::is_control_path(relative) || excluded(relative)
}
