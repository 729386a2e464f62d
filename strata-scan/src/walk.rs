//! The blocking directory walk.
//!
//! Runs on the tokio blocking pool and returns raw, unvalidated entries.
//! Directory listings are sorted by name so walk order (and with it
//! diagnostic order) is deterministic across filesystems.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, Local};

use crate::{Diagnostic, DiagnosticKind, ScanError};

pub(crate) struct RawEntry {
    pub absolute: PathBuf,
    /// Relative path with `/` separators, exactly as composed from the
    /// on-disk names.
    pub relative: String,
    pub kind: RawKind,
    /// For links: whether the target fails to resolve.
    pub broken_link: bool,
}

pub(crate) enum RawKind {
    File {
        size: u64,
        mtime: DateTime<FixedOffset>,
    },
    Link {
        target: String,
    },
}

pub(crate) struct WalkOutcome {
    pub entries: Vec<RawEntry>,
    pub diagnostics: Vec<Diagnostic>,
}

pub(crate) async fn walk<F>(root: PathBuf, excluded: F) -> Result<WalkOutcome, ScanError>
where
    F: Fn(&str) -> bool + Send + 'static,
{
    tokio::task::spawn_blocking(move || walk_sync(&root, &excluded)).await?
}

fn walk_sync(
    root: &PathBuf,
    excluded: &(dyn Fn(&str) -> bool + Send),
) -> Result<WalkOutcome, ScanError> {
    let mut outcome = WalkOutcome {
        entries: Vec::new(),
        diagnostics: Vec::new(),
    };
    // A failure to read the root itself is the one fatal scan error.
    fs::read_dir(root).map_err(|source| ScanError::RootUnreadable {
        root: root.clone(),
        source,
    })?;
    walk_dir(root, String::new(), excluded, &mut outcome);
    Ok(outcome)
}

fn walk_dir(
    dir: &PathBuf,
    prefix: String,
    excluded: &(dyn Fn(&str) -> bool + Send),
    outcome: &mut WalkOutcome,
) {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(error) => {
            outcome.diagnostics.push(Diagnostic {
                path: prefix,
                kind: DiagnosticKind::Unreadable {
                    error: error.to_string(),
                },
            });
            return;
        }
    };

    let mut names = Vec::new();
    for dir_entry in reader {
        match dir_entry {
            Ok(dir_entry) => names.push(dir_entry.file_name()),
            Err(error) => outcome.diagnostics.push(Diagnostic {
                path: prefix.clone(),
                kind: DiagnosticKind::Unreadable {
                    error: error.to_string(),
                },
            }),
        }
    }
    names.sort();

    for name in names {
        let absolute = dir.join(&name);
        let relative = match name.to_str() {
            Some(name) if prefix.is_empty() => name.to_owned(),
            Some(name) => format!("{prefix}/{name}"),
            None => {
                outcome.diagnostics.push(Diagnostic {
                    path: format!("{prefix}/{}", name.to_string_lossy()),
                    kind: DiagnosticKind::Unreadable {
                        error: "file name is not valid UTF-8".into(),
                    },
                });
                continue;
            }
        };

        if excluded(&relative) {
            continue;
        }

        let meta = match fs::symlink_metadata(&absolute) {
            Ok(meta) => meta,
            Err(error) => {
                outcome.diagnostics.push(Diagnostic {
                    path: relative,
                    kind: DiagnosticKind::Unreadable {
                        error: error.to_string(),
                    },
                });
                continue;
            }
        };

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            match fs::read_link(&absolute) {
                Ok(target) => {
                    let broken_link = fs::metadata(&absolute).is_err();
                    outcome.entries.push(RawEntry {
                        absolute,
                        relative,
                        kind: RawKind::Link {
                            target: target.to_string_lossy().into_owned(),
                        },
                        broken_link,
                    });
                }
                Err(error) => outcome.diagnostics.push(Diagnostic {
                    path: relative,
                    kind: DiagnosticKind::Unreadable {
                        error: error.to_string(),
                    },
                }),
            }
        } else if file_type.is_dir() {
            walk_dir(&absolute, relative, excluded, outcome);
        } else if file_type.is_file() {
            let mtime = match meta.modified() {
                Ok(mtime) => DateTime::<Local>::from(mtime).fixed_offset(),
                Err(error) => {
                    outcome.diagnostics.push(Diagnostic {
                        path: relative,
                        kind: DiagnosticKind::Unreadable {
                            error: error.to_string(),
                        },
                    });
                    continue;
                }
            };
            outcome.entries.push(RawEntry {
                absolute,
                relative,
                kind: RawKind::File {
                    size: meta.len(),
                    mtime,
                },
                broken_link: false,
            });
        } else {
            // Device, socket, or pipe.
            outcome.diagnostics.push(Diagnostic {
                path: relative,
                kind: DiagnosticKind::UnsupportedFileType,
            });
        }
    }
}
