//! Local staging of declared data files and the advisory remote diff.
//!
//! Declared paths are resolved against ordered search roots, walked with
//! exclusion rules applied, and copied into a local staging tree with one
//! flattened directory per declaration. Copies run on a bounded worker pool.

mod exclude;

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::{App, FileDeclaration, split_parent};

pub use exclude::ExcludeRules;

/// Errors raised while staging files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StageError {
    /// A declared path exists under none of the search roots.
    #[error("failed to find {path} under {roots}")]
    NotFound {
        /// Declared path.
        path: String,
        /// Search roots that were tried.
        roots: String,
    },
    /// Reading or copying a file failed.
    #[error("failed to stage {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// An exclusion pattern is not a valid glob.
    #[error("invalid exclude pattern {pattern:?}: {message}")]
    Pattern {
        /// Rejected pattern.
        pattern: String,
        /// Parser message.
        message: String,
    },
    /// A copy worker panicked or was cancelled.
    #[error("copy worker failed: {message}")]
    Worker {
        /// Join failure description.
        message: String,
    },
}

/// A declaration resolved to a concrete local path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagedDeclaration {
    /// The declaration from the descriptor.
    pub declaration: FileDeclaration,
    /// Resolved local path.
    pub source: Utf8PathBuf,
    /// Whether the path is a directory.
    pub is_dir: bool,
}

/// One file in the staging tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagedFile {
    /// Local source path.
    pub source: Utf8PathBuf,
    /// Staged copy.
    pub staged: Utf8PathBuf,
    /// Path relative to the staging root, e.g. `flattened_dir/sub/file`.
    pub relative: String,
    /// Size in bytes.
    pub size: u64,
    /// Larger than the warning threshold.
    pub oversized: bool,
}

/// The full staged file set, keyed by staging-relative path.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StagedSet {
    files: BTreeMap<String, StagedFile>,
}

impl StagedSet {
    /// Number of staged files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` when nothing was staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sum of staged file sizes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|file| file.size).sum()
    }

    /// Staged files in key order.
    pub fn iter(&self) -> impl Iterator<Item = &StagedFile> {
        self.files.values()
    }

    /// Looks up a file by staging-relative path.
    #[must_use]
    pub fn get(&self, relative: &str) -> Option<&StagedFile> {
        self.files.get(relative)
    }

    /// Compares against a host's `find <files_dir> -type f` listing by
    /// relative path only. Local-only files are reported as
    /// `+ <size> <path>`, remote-only files as `- <path>`.
    #[must_use]
    pub fn diff(&self, remote_listing: &str, files_dir: &str) -> String {
        let prefix = format!("{}/", files_dir.trim_end_matches('/'));
        let remote: BTreeSet<&str> = remote_listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.strip_prefix(prefix.as_str()).unwrap_or(line))
            .collect();

        let mut report = String::new();
        for file in self.files.values() {
            if !remote.contains(file.relative.as_str()) {
                report.push_str(&format!("+ {} {}\n", fmt_file_size(file.size), file.relative));
            }
        }
        for path in remote {
            if !self.files.contains_key(path) {
                report.push_str(&format!("- {path}\n"));
            }
        }
        report
    }

    /// Writes the inspection listing: source paths, count, and total size.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn write_summary(&self, mut out: impl Write) -> io::Result<()> {
        let mut sources: Vec<&Utf8PathBuf> = self.files.values().map(|file| &file.source).collect();
        sources.sort();
        for source in sources {
            writeln!(out, "{source}")?;
        }
        writeln!(out, "count: {}", self.len())?;
        writeln!(out, "size: {}", fmt_file_size(self.total_size()))
    }
}

/// Remote command listing the uploaded data files of an app.
#[must_use]
pub fn remote_listing_command(files_dir: &str) -> String {
    let quoted = crate::script::quote(files_dir);
    format!("if [ -d {quoted} ]; then find {quoted} -type f; fi")
}

/// Stages declared data files.
#[derive(Clone, Debug)]
pub struct FileSynchronizer {
    search_roots: Vec<Utf8PathBuf>,
    staging_root: Utf8PathBuf,
    default_excludes: Vec<String>,
    substring_fallback: bool,
    basename_match: bool,
    warning_size: u64,
    workers: Arc<Semaphore>,
}

enum WalkEntry {
    Dir(String),
    File(String),
}

struct CopyJob {
    source: Utf8PathBuf,
    staged: Utf8PathBuf,
    relative: String,
}

impl FileSynchronizer {
    /// Creates a synchronizer staging into `staging_root`.
    ///
    /// `cache_dir` is always excluded so the tool never stages its own
    /// working files. `soft_exclude` disables the substring fallback.
    #[must_use]
    pub fn new(
        app: &App,
        search_roots: Vec<Utf8PathBuf>,
        staging_root: Utf8PathBuf,
        cache_dir: &str,
        soft_exclude: bool,
    ) -> Self {
        let mut default_excludes = app.default_excludeds.clone();
        if !default_excludes.iter().any(|pattern| pattern == cache_dir) {
            default_excludes.push(cache_dir.to_owned());
        }
        let parallelism = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            search_roots,
            staging_root,
            default_excludes,
            substring_fallback: !soft_exclude,
            basename_match: !app.no_rel_match,
            warning_size: app.file_warning_size,
            workers: Arc::new(Semaphore::new(parallelism)),
        }
    }

    /// Root of the staging tree.
    #[must_use]
    pub fn staging_root(&self) -> &Utf8Path {
        &self.staging_root
    }

    /// Resolves each declaration against the search roots; the first root
    /// containing the path wins.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::NotFound`] for a path missing from every root.
    pub fn resolve(
        &self,
        declarations: &[FileDeclaration],
    ) -> Result<Vec<StagedDeclaration>, StageError> {
        declarations
            .iter()
            .map(|declaration| {
                let relative = declaration.path.trim_end_matches('/');
                self.search_roots
                    .iter()
                    .map(|root| root.join(relative))
                    .find_map(|candidate| {
                        candidate.metadata().ok().map(|meta| StagedDeclaration {
                            declaration: declaration.clone(),
                            is_dir: meta.is_dir(),
                            source: candidate,
                        })
                    })
                    .ok_or_else(|| StageError::NotFound {
                        path: declaration.path.clone(),
                        roots: self
                            .search_roots
                            .iter()
                            .map(Utf8PathBuf::as_path).map(Utf8Path::as_str)
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
            })
            .collect()
    }

    /// Copies every non-excluded file into the staging tree.
    ///
    /// # Errors
    ///
    /// Returns the first walk, copy, or worker failure.
    pub async fn stage(&self, declarations: &[StagedDeclaration]) -> Result<StagedSet, StageError> {
        self.collect(declarations, true).await
    }

    /// Records the staged file set without copying anything.
    ///
    /// # Errors
    ///
    /// Returns the first walk failure.
    pub async fn inspect(
        &self,
        declarations: &[StagedDeclaration],
    ) -> Result<StagedSet, StageError> {
        self.collect(declarations, false).await
    }

    async fn collect(
        &self,
        declarations: &[StagedDeclaration],
        copy: bool,
    ) -> Result<StagedSet, StageError> {
        let files = Arc::new(Mutex::new(BTreeMap::new()));
        let mut jobs = JoinSet::new();
        if copy {
            create_dir_all(&self.staging_root)?;
        }

        for staged in declarations {
            let flattened = staged.declaration.flattened();
            let dest_root = self.staging_root.join(&flattened);
            if !staged.is_dir {
                self.spawn_copy(
                    &mut jobs,
                    CopyJob {
                        source: staged.source.clone(),
                        staged: dest_root,
                        relative: flattened,
                    },
                    copy,
                    &files,
                );
                continue;
            }

            let rules = ExcludeRules::new(
                staged
                    .declaration
                    .excludeds
                    .iter()
                    .chain(self.default_excludes.iter()),
                self.substring_fallback,
                self.basename_match,
            )?;
            if copy {
                create_dir_all(&dest_root)?;
            }
            let mut pending = Vec::new();
            walk(&staged.source, &rules, &mut |entry| {
                match entry {
                    WalkEntry::Dir(relative) if copy => create_dir_all(&dest_root.join(relative))?,
                    WalkEntry::Dir(_) => {}
                    WalkEntry::File(relative) => pending.push(CopyJob {
                        source: staged.source.join(&relative),
                        staged: dest_root.join(&relative),
                        relative: format!("{flattened}/{relative}"),
                    }),
                }
                Ok(())
            })?;
            for job in pending {
                self.spawn_copy(&mut jobs, job, copy, &files);
            }
        }

        while let Some(joined) = jobs.join_next().await {
            joined.map_err(|err| StageError::Worker {
                message: err.to_string(),
            })??;
        }

        let collected = std::mem::take(&mut *files.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(StagedSet { files: collected })
    }

    fn spawn_copy(
        &self,
        jobs: &mut JoinSet<Result<(), StageError>>,
        job: CopyJob,
        copy: bool,
        files: &Arc<Mutex<BTreeMap<String, StagedFile>>>,
    ) {
        let workers = Arc::clone(&self.workers);
        let files = Arc::clone(files);
        let warning_size = self.warning_size;
        jobs.spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|err| StageError::Worker {
                    message: err.to_string(),
                })?;
            tokio::task::spawn_blocking(move || {
                let record = job.run(copy, warning_size)?;
                files
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(record.relative.clone(), record);
                Ok(())
            })
            .await
            .map_err(|err| StageError::Worker {
                message: err.to_string(),
            })?
        });
    }
}

impl CopyJob {
    fn run(self, copy: bool, warning_size: u64) -> Result<StagedFile, StageError> {
        let io_error = |path: &Utf8Path, err: io::Error| StageError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        };
        let size = self
            .source
            .metadata()
            .map_err(|err| io_error(&self.source, err))?
            .len();
        let oversized = size > warning_size;
        if oversized {
            warn!(size = %fmt_file_size(size), path = %self.source, "big file");
        }
        if copy {
            debug!(source = %self.source, staged = %self.staged, "staging file");
            copy_ambient(&self.source, &self.staged).map_err(|err| io_error(&self.source, err))?;
        }
        Ok(StagedFile {
            source: self.source,
            staged: self.staged,
            relative: self.relative,
            size,
            oversized,
        })
    }
}

/// Walks `root` depth first in name order, skipping excluded entries and
/// never descending into an excluded directory.
fn walk(
    root: &Utf8Path,
    rules: &ExcludeRules,
    visit: &mut dyn FnMut(WalkEntry) -> Result<(), StageError>,
) -> Result<(), StageError> {
    walk_relative(root, "", rules, visit)
}

fn walk_relative(
    root: &Utf8Path,
    relative: &str,
    rules: &ExcludeRules,
    visit: &mut dyn FnMut(WalkEntry) -> Result<(), StageError>,
) -> Result<(), StageError> {
    let dir_path = if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    };
    let io_error = |err: io::Error| StageError::Io {
        path: dir_path.clone(),
        message: err.to_string(),
    };
    let dir = Dir::open_ambient_dir(&dir_path, ambient_authority()).map_err(io_error)?;

    let mut names = Vec::new();
    for entry in dir.entries().map_err(io_error)? {
        let name = entry.map_err(io_error)?.file_name().map_err(io_error)?;
        names.push(name);
    }
    names.sort();

    for name in names {
        let child = if relative.is_empty() {
            name.clone()
        } else {
            format!("{relative}/{name}")
        };
        let is_dir = dir.metadata(&name).map_err(io_error)?.is_dir();
        if rules.excludes(&child, is_dir) {
            continue;
        }
        if is_dir {
            visit(WalkEntry::Dir(child.clone()))?;
            walk_relative(root, &child, rules, visit)?;
        } else {
            visit(WalkEntry::File(child))?;
        }
    }
    Ok(())
}

fn create_dir_all(path: &Utf8Path) -> Result<(), StageError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| StageError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn copy_ambient(source: &Utf8Path, target: &Utf8Path) -> io::Result<u64> {
    let (source_parent, source_name) = split_parent(source)?;
    let (target_parent, target_name) = split_parent(target)?;
    let from = Dir::open_ambient_dir(source_parent, ambient_authority())?;
    let to = Dir::open_ambient_dir(target_parent, ambient_authority())?;
    from.copy(source_name, &to, target_name)
}

/// Candidate search roots: `<entry>/src` for each `GOPATH` entry (or
/// `$HOME/go` when unset), then the working directory.
#[must_use]
pub fn search_roots(gopath: Option<&str>, home: Option<&str>) -> Vec<Utf8PathBuf> {
    let mut roots: Vec<Utf8PathBuf> = gopath
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .split(':')
                .filter(|entry| !entry.is_empty())
                .map(|entry| Utf8Path::new(entry).join("src"))
                .collect()
        })
        .or_else(|| home.map(|dir| vec![Utf8Path::new(dir).join("go").join("src")]))
        .unwrap_or_default();
    roots.push(Utf8PathBuf::from("."));
    roots
}

/// Human readable size with two decimals above 1 KiB.
#[must_use]
pub fn fmt_file_size(size: u64) -> String {
    const UNITS: [(u32, &str); 6] = [
        (60, "EB"),
        (50, "PB"),
        (40, "TB"),
        (30, "GB"),
        (20, "MB"),
        (10, "KB"),
    ];
    for (shift, unit) in UNITS {
        if size > (1_u64 << shift) {
            let whole = size >> shift;
            let remainder = u128::from(size & ((1_u64 << shift) - 1));
            let hundredths = (remainder * 100) >> shift;
            return format!("{whole}.{hundredths:02} {unit}");
        }
    }
    size.to_string()
}
