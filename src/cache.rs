//! Local working directory for one run.
//!
//! Everything built or staged for upload lives under the cache root:
//! the binary at `<root>/<app>`, data files under `<root>/files/`, and
//! migration builds under `<root>/migrations/`. The directory is created at
//! the start of a run and removed when it ends or is interrupted, except for
//! the last migration bundle, which `migrate --nb` uploads again.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use tracing::{debug, warn};

use crate::config::split_parent;

/// File name of the migration bundle inside the cache root.
pub const MIGRATION_ARCHIVE: &str = "migrations.tar.gz";

/// Paths inside the local cache directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalCache {
    root: Utf8PathBuf,
}

impl LocalCache {
    /// Describes a cache rooted at `root`; nothing is created yet.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Built application binary.
    #[must_use]
    pub fn binary(&self, app_name: &str) -> Utf8PathBuf {
        self.root.join(app_name)
    }

    /// Staging tree for data files.
    #[must_use]
    pub fn files_dir(&self) -> Utf8PathBuf {
        self.root.join("files")
    }

    /// Built migration binaries.
    #[must_use]
    pub fn migrations_dir(&self) -> Utf8PathBuf {
        self.root.join("migrations")
    }

    /// Migration bundle uploaded to every host.
    #[must_use]
    pub fn migration_archive(&self) -> Utf8PathBuf {
        self.root.join(MIGRATION_ARCHIVE)
    }

    /// Creates the cache root and its migrations directory.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn create(&self) -> io::Result<()> {
        Dir::create_ambient_dir_all(self.migrations_dir(), ambient_authority())
    }

    /// Removes everything the run staged. The migration bundle survives so
    /// it can be reused; the root goes too when there is no bundle. A cache
    /// that was never created is not an error.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn remove(&self) -> io::Result<()> {
        let (parent, name) = split_parent(&self.root)?;
        let parent_dir = Dir::open_ambient_dir(parent, ambient_authority())?;
        let dir = match parent_dir.open_dir(name) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut kept_bundle = false;
        for entry in dir.entries()? {
            let entry_handle = entry?;
            let entry_name = entry_handle.file_name()?;
            if entry_name == MIGRATION_ARCHIVE {
                kept_bundle = true;
            } else if entry_handle.file_type()?.is_dir() {
                dir.remove_dir_all(&entry_name)?;
            } else {
                dir.remove_file(&entry_name)?;
            }
        }
        if kept_bundle {
            return Ok(());
        }
        parent_dir.remove_dir(name)
    }

    /// Removes the cache, logging rather than returning failures; used on
    /// teardown paths where the run's outcome is already decided.
    pub fn cleanup(&self) {
        match self.remove() {
            Ok(()) => debug!(cache = %self.root, "removed local cache"),
            Err(err) => warn!(cache = %self.root, "failed to remove local cache: {err}"),
        }
    }
}
