//! One-off migration programs built locally and run on every host.
//!
//! A migration spec is a single string such as
//! `AppEnv=prod tools/migrate.go -dry-run`: environment tokens, then the
//! artifact source, then arguments. Artifacts are built once each, bundled
//! into one archive, uploaded once per host, and run in the given order.

use std::collections::BTreeSet;
use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::builder::{ArtifactBuilder, BuildError, BuildRequest};
use crate::cache::{LocalCache, MIGRATION_ARCHIVE};
use crate::config::Config;
use crate::script::{ScriptContext, ScriptError, ScriptTemplate, env_assignment, quote};
use crate::server::Server;
use crate::transport::{CommandRunner, TransportError};

/// Directory holding the built migrations, inside the bundle and on the
/// host.
pub const MIGRATION_DIR: &str = "migration";

/// File name of the uploaded bundle.
pub const ARCHIVE_NAME: &str = MIGRATION_ARCHIVE;

const KEY_HASH_BYTES: usize = 4;

/// Errors raised while preparing or running migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// No token of the spec names an existing file.
    #[error("can't find a migration file in {spec:?} (paths may not contain spaces)")]
    Unresolved {
        /// Spec as given.
        spec: String,
    },
    /// Building an artifact failed.
    #[error(transparent)]
    Build(#[from] BuildError),
    /// Preparing the local build directory failed.
    #[error("failed to prepare {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// `--nb` was given but no earlier run left a bundle in the cache.
    #[error("no migration bundle at {path}; run without --nb to build one")]
    MissingBundle {
        /// Expected bundle path.
        path: Utf8PathBuf,
    },
    /// Creating the bundle failed.
    #[error("failed to bundle migrations (status {status_text}): {output}")]
    Bundle {
        /// Exit status rendered for humans.
        status_text: String,
        /// Combined output of the archiver.
        output: String,
    },
    /// Generating the host script failed.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// Running the archiver failed to start.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One parsed migration spec.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Migration {
    /// Artifact source as written.
    pub file: String,
    /// Resolved local path of the source.
    pub source: Utf8PathBuf,
    /// Environment tokens, verbatim and in encounter order.
    pub envs: Vec<String>,
    /// Arguments passed to the artifact, verbatim.
    pub args: Vec<String>,
}

impl Migration {
    /// File name of the source.
    #[must_use]
    pub fn base(&self) -> &str {
        Utf8Path::new(&self.file).file_name().unwrap_or(&self.file)
    }
}

/// Parses specs, resolving artifact tokens against local search roots.
#[derive(Clone, Copy, Debug)]
pub struct MigrationParser<'a> {
    search_roots: &'a [Utf8PathBuf],
}

impl<'a> MigrationParser<'a> {
    /// Creates a parser; a token is an artifact when it exists as given or
    /// under one of `search_roots`. Files and package directories both
    /// count.
    #[must_use]
    pub const fn new(search_roots: &'a [Utf8PathBuf]) -> Self {
        Self { search_roots }
    }

    /// Parses one spec. Tokens are split on spaces; those containing `=`
    /// and those naming nothing on disk are environment, the first existing
    /// file or directory is the artifact, and everything after it is
    /// arguments.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Unresolved`] when no token names a file.
    pub fn parse(&self, spec: &str) -> Result<Migration, MigrationError> {
        let mut envs = Vec::new();
        let mut tokens = spec.split(' ').map(str::trim).filter(|token| !token.is_empty());
        while let Some(token) = tokens.next() {
            if token.contains('=') {
                envs.push(token.to_owned());
                continue;
            }
            let Some(source) = self.locate(token) else {
                envs.push(token.to_owned());
                continue;
            };
            return Ok(Migration {
                file: token.to_owned(),
                source,
                envs,
                args: tokens.map(str::to_owned).collect(),
            });
        }
        Err(MigrationError::Unresolved {
            spec: spec.to_owned(),
        })
    }

    /// Parses every spec, failing on the first unresolved one.
    ///
    /// # Errors
    ///
    /// Returns the first [`MigrationError::Unresolved`].
    pub fn parse_all(&self, specs: &[String]) -> Result<Vec<Migration>, MigrationError> {
        specs.iter().map(|spec| self.parse(spec)).collect()
    }

    fn locate(&self, token: &str) -> Option<Utf8PathBuf> {
        let direct = Utf8PathBuf::from(token);
        std::iter::once(direct)
            .chain(self.search_roots.iter().map(|root| root.join(token)))
            .find(|candidate| candidate.exists())
    }
}

/// A migration with the key its artifact is built and shipped under.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagedMigration {
    /// Parsed spec.
    pub migration: Migration,
    /// Artifact name: source stem plus a digest of the source path.
    pub key: String,
}

impl StagedMigration {
    /// Derives the artifact key for `migration`.
    #[must_use]
    pub fn new(migration: Migration) -> Self {
        let key = artifact_key(&migration.source);
        Self { migration, key }
    }
}

/// Artifact key for a source path. Distinct paths sharing a file name get
/// distinct keys.
#[must_use]
pub fn artifact_key(source: &Utf8Path) -> String {
    let stem = source.file_stem().unwrap_or("migration");
    let digest = Sha256::digest(source.as_str().as_bytes());
    let suffix: String = digest
        .iter()
        .take(KEY_HASH_BYTES)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("{stem}-{suffix}")
}

/// Built migrations ready for upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MigrationBundle {
    /// Migrations in run order.
    pub migrations: Vec<StagedMigration>,
    /// Local archive path.
    pub archive: Utf8PathBuf,
}

/// Builds each distinct artifact once and bundles them.
///
/// With `no_build` the bundle an earlier run left in the cache is reused.
///
/// # Errors
///
/// Returns build, I/O, and archiver failures, and
/// [`MigrationError::MissingBundle`] when `no_build` finds no bundle.
pub fn build_bundle<R: CommandRunner + ?Sized>(
    config: &Config,
    cache: &LocalCache,
    migrations: Vec<Migration>,
    builder: &dyn ArtifactBuilder,
    runner: &R,
    tar_bin: &str,
    no_build: bool,
) -> Result<MigrationBundle, MigrationError> {
    let staged: Vec<StagedMigration> = migrations.into_iter().map(StagedMigration::new).collect();
    let bundle = MigrationBundle {
        migrations: staged,
        archive: cache.migration_archive(),
    };
    if no_build {
        if !bundle.archive.is_file() {
            return Err(MigrationError::MissingBundle {
                path: bundle.archive,
            });
        }
        return Ok(bundle);
    }

    let build_root = cache.migrations_dir();
    let out_dir = build_root.join(MIGRATION_DIR);
    Dir::create_ambient_dir_all(&out_dir, ambient_authority()).map_err(|err| {
        MigrationError::Io {
            path: out_dir.clone(),
            message: err.to_string(),
        }
    })?;

    let mut built = BTreeSet::new();
    for staged in &bundle.migrations {
        if !built.insert(staged.key.as_str()) {
            debug!(key = %staged.key, "migration already built");
            continue;
        }
        let request = BuildRequest::for_config(
            config,
            staged.migration.source.as_str(),
            out_dir.join(&staged.key),
        );
        builder.build(&request)?;
    }

    info!(count = built.len(), "bundling migrations");
    let mut args = vec![
        OsString::from("-czf"),
        OsString::from(bundle.archive.as_str()),
        OsString::from("-C"),
        OsString::from(build_root.as_str()),
    ];
    args.extend(
        built
            .iter()
            .map(|key| OsString::from(format!("{MIGRATION_DIR}/{key}"))),
    );
    let output = runner.run(tar_bin, &args)?;
    if !output.is_success() {
        return Err(MigrationError::Bundle {
            status_text: output.status_text(),
            output: output.combined(),
        });
    }
    Ok(bundle)
}

/// Script unpacking the bundle on a host and running each migration in
/// order, stopping at the first failure.
///
/// Each run line sets the module root, then the host environment, then the
/// spec's own environment tokens.
///
/// # Errors
///
/// Returns [`ScriptError`] for invalid host environment keys or a custom
/// template that fails to render.
pub fn migration_script(
    context: &ScriptContext<'_>,
    server: &Server,
    migrations: &[StagedMigration],
    template: Option<&ScriptTemplate>,
) -> Result<String, MigrationError> {
    let layout = context.layout();
    let mut host_env = vec![env_assignment("GOPATH", &layout.gopath)?];
    for (key, value) in &server.envs {
        host_env.push(env_assignment(key, value)?);
    }

    let mut lines = Vec::with_capacity(migrations.len());
    for staged in migrations {
        let mut line = host_env.clone();
        line.extend(staged.migration.envs.iter().cloned());
        line.push(quote(&format!(
            "{}/{MIGRATION_DIR}/{}",
            layout.app_root, staged.key
        )));
        line.extend(staged.migration.args.iter().cloned());
        lines.push(format!(
            "echo {}\n{}",
            quote(&format!("running {}", staged.migration.base())),
            line.join(" ")
        ));
    }
    let runs = lines.join("\n");

    let default = format!(
        "set -e\ncd {}\ntar mxf {ARCHIVE_NAME}\ncd {}\n{runs}\n",
        quote(&layout.app_root),
        quote(&layout.module_src),
    );
    let Some(custom) = template else {
        return Ok(default);
    };
    let mut vars = context.variables();
    vars.set("Migrations", runs);
    vars.set("DefaultScript", default);
    Ok(custom.render(&vars)?)
}

/// Remote path the bundle is uploaded to.
#[must_use]
pub fn remote_archive(app_root: &str) -> String {
    format!("{app_root}/{ARCHIVE_NAME}")
}
