//! Fan-out of one action across the selected hosts.
//!
//! [`Deployment::prepare`] runs the local pre-flight for an action (build,
//! staging, migration bundling, template loading); any failure there aborts
//! before a host is contacted. [`Deployment::run`] then gives every host its
//! own task and waits for all of them, so one host's failure is reported
//! alongside its siblings' results instead of cancelling them.

mod fan_out;
mod report;

use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info};

use crate::build_info::{self, BuildInfo, BuildInfoError, ToolVersion};
use crate::builder::{ArtifactBuilder, BuildError, BuildRequest};
use crate::cache::LocalCache;
use crate::config::Config;
use crate::files::{FileSynchronizer, StageError, StagedDeclaration, StagedSet, remote_listing_command};
use crate::migration::{
    MigrationBundle, MigrationError, MigrationParser, build_bundle, migration_script,
    remote_archive,
};
use crate::release::{ReleaseClock, ReleaseManager, snapshot_script};
use crate::script::{ScriptContext, ScriptError, ScriptTemplates, quote, write_file_command};
use crate::server::Server;
use crate::transport::{CommandRunner, ConnectionPool, TransportError};

pub use fan_out::{HostOutcome, fan_out};
pub use report::DispatchReport;

/// What to do on every selected host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    /// Upload, sync, snapshot, restart, trim.
    Deploy,
    /// Restart the running process.
    Restart,
    /// Stop the running process.
    Kill,
    /// Roll back to `version`, or list releases when absent.
    Rollback {
        /// Release id to restore.
        version: Option<String>,
    },
    /// Print each host's build info.
    Info,
    /// Compare staged files with each host's uploaded set.
    Diff,
    /// Build and run one-off migrations.
    Migrate {
        /// Migration specs in run order.
        specs: Vec<String>,
    },
}

impl Action {
    /// Word used in reports.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Restart => "restart",
            Self::Kill => "kill",
            Self::Rollback { .. } => "rollback",
            Self::Info => "info",
            Self::Diff => "diff",
            Self::Migrate { .. } => "migrate",
        }
    }

    /// Actions that replace what a host runs, and so must pass the version
    /// check first.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Deploy | Self::Restart | Self::Rollback { version: Some(_) }
        )
    }
}

/// Runtime switches for one invocation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "each switch maps to one independent command-line flag"
)]
pub struct RunOptions {
    /// Reuse the previously built binary.
    pub no_build: bool,
    /// Skip uploading binaries, files, and bundles.
    pub no_upload: bool,
    /// Upload only; run nothing on the hosts.
    pub no_deploy: bool,
    /// Skip staging and uploading data files.
    pub no_files: bool,
    /// Deploy over hosts recorded by an older tool release.
    pub force: bool,
    /// Verbose logging, including generated scripts.
    pub debug: bool,
    /// Disable the substring fallback of exclude patterns.
    pub soft_exclude: bool,
    /// Print migration scripts instead of running them.
    pub hand: bool,
}

/// Local pre-flight failures; nothing has touched a host yet.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Preparing the local cache failed.
    #[error("failed to prepare local cache {path}: {message}")]
    Cache {
        /// Cache path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Declared files could not be staged.
    #[error(transparent)]
    Stage(#[from] StageError),
    /// The application failed to build.
    #[error(transparent)]
    Build(#[from] BuildError),
    /// Migrations could not be prepared.
    #[error(transparent)]
    Migration(#[from] MigrationError),
    /// A script template is unreadable or malformed.
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Failure of one host's unit of work.
#[derive(Debug, Error)]
pub enum HostError {
    /// Connecting or running a command failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A script for this host could not be generated.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// The host failed the version check.
    #[error(transparent)]
    Version(#[from] BuildInfoError),
    /// Migration script generation failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),
    /// The host's task panicked.
    #[error("{host}: task panicked")]
    Panicked {
        /// Host label.
        host: String,
    },
    /// The host's task was cancelled before it reported.
    #[error("{host}: task was cancelled")]
    Cancelled {
        /// Host label.
        host: String,
    },
}

/// Local inputs of a run besides the descriptor.
#[derive(Clone, Debug)]
pub struct Workspace {
    /// Local cache for built and staged artifacts.
    pub cache: LocalCache,
    /// Roots searched for declared files and migration sources.
    pub search_roots: Vec<Utf8PathBuf>,
    /// Archiver used for migration bundles.
    pub tar_bin: String,
}

impl Workspace {
    /// File synchronizer staging into the cache.
    #[must_use]
    pub fn synchronizer(&self, config: &Config, soft_exclude: bool) -> FileSynchronizer {
        let root = self.cache.root();
        FileSynchronizer::new(
            &config.app,
            self.search_roots.clone(),
            self.cache.files_dir(),
            root.file_name().unwrap_or(root.as_str()),
            soft_exclude,
        )
    }

    fn create_cache(&self) -> Result<(), DispatchError> {
        self.cache.create().map_err(|err| DispatchError::Cache {
            path: self.cache.root().to_path_buf(),
            message: err.to_string(),
        })
    }
}

/// Everything prepared locally for one action, shared by the host tasks.
#[derive(Debug)]
pub struct Deployment<R: CommandRunner> {
    action: Action,
    config: Arc<Config>,
    options: RunOptions,
    pool: Arc<ConnectionPool<R>>,
    workspace: Workspace,
    templates: ScriptTemplates,
    declarations: Vec<StagedDeclaration>,
    clock: ReleaseClock,
    local_version: ToolVersion,
    build_info: Option<String>,
    staged: Option<StagedSet>,
    migrations: Option<MigrationBundle>,
}

impl<R: CommandRunner + 'static> Deployment<R> {
    /// Runs the local pre-flight of `action`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when building, staging, bundling, or
    /// template loading fails.
    pub async fn prepare(
        action: Action,
        config: Arc<Config>,
        options: RunOptions,
        pool: Arc<ConnectionPool<R>>,
        workspace: Workspace,
        builder: &dyn ArtifactBuilder,
    ) -> Result<Self, DispatchError> {
        let templates = ScriptTemplates::load(&config.app)?;
        let mut deployment = Self {
            action,
            config,
            options,
            pool,
            workspace,
            templates,
            declarations: Vec::new(),
            clock: ReleaseClock::new(),
            local_version: ToolVersion::current(),
            build_info: None,
            staged: None,
            migrations: None,
        };
        match deployment.action.clone() {
            Action::Deploy => deployment.prepare_deploy(builder).await?,
            Action::Diff => {
                let synchronizer = deployment
                    .workspace
                    .synchronizer(&deployment.config, options.soft_exclude);
                deployment.declarations = synchronizer.resolve(&deployment.config.app.files)?;
                deployment.staged = Some(synchronizer.inspect(&deployment.declarations).await?);
            }
            Action::Migrate { specs } => deployment.prepare_migrations(&specs, builder)?,
            Action::Restart => {
                let synchronizer = deployment
                    .workspace
                    .synchronizer(&deployment.config, options.soft_exclude);
                deployment.declarations = synchronizer.resolve(&deployment.config.app.files)?;
            }
            Action::Kill | Action::Rollback { .. } | Action::Info => {}
        }
        Ok(deployment)
    }

    /// Pins the version this run compares host markers against.
    #[must_use]
    pub const fn with_local_version(mut self, version: ToolVersion) -> Self {
        self.local_version = version;
        self
    }

    /// Pins the release clock.
    #[must_use]
    pub fn with_clock(mut self, clock: ReleaseClock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the action on every server concurrently and waits for all.
    pub async fn run(self: Arc<Self>, servers: &[Server]) -> DispatchReport {
        let verb = self.action.verb();
        info!(hosts = servers.len(), "{verb} started");
        let outcomes = fan_out(servers, move |server| self.execute(server)).await;
        DispatchReport::new(verb, outcomes)
    }

    async fn prepare_deploy(&mut self, builder: &dyn ArtifactBuilder) -> Result<(), DispatchError> {
        let config = Arc::clone(&self.config);
        let options = self.options;
        self.workspace.create_cache()?;
        if !options.no_build {
            let binary = self.workspace.cache.binary(&config.app.name);
            builder.build(&BuildRequest::for_app(&config, binary))?;
        }

        let synchronizer = self.workspace.synchronizer(&config, options.soft_exclude);
        self.declarations = synchronizer.resolve(&config.app.files)?;
        if !options.no_files && !options.no_upload {
            info!("staging files");
            let staged = synchronizer.stage(&self.declarations).await?;
            debug!(count = staged.len(), "staged files");
            self.staged = Some(staged);
        }

        let info = BuildInfo::collect(
            self.pool.runner(),
            config.goos.as_deref(),
            config.goarch.as_deref(),
        );
        self.build_info = Some(info.render());
        Ok(())
    }

    fn prepare_migrations(
        &mut self,
        specs: &[String],
        builder: &dyn ArtifactBuilder,
    ) -> Result<(), DispatchError> {
        let migrations = MigrationParser::new(&self.workspace.search_roots).parse_all(specs)?;
        self.workspace.create_cache()?;
        let bundle = build_bundle(
            &self.config,
            &self.workspace.cache,
            migrations,
            builder,
            self.pool.runner(),
            &self.workspace.tar_bin,
            self.options.no_build,
        )?;
        self.migrations = Some(bundle);
        Ok(())
    }

    fn execute(&self, server: &Server) -> Result<String, HostError> {
        let paths = self.pool.paths(server)?;
        let context = ScriptContext::new(
            &self.config.app,
            server,
            &paths,
            &self.declarations,
            &self.templates,
        );
        if self.action.is_mutating() {
            self.check_version(server, &context)?;
        }

        match &self.action {
            Action::Deploy => self.deploy(server, &context),
            Action::Restart => {
                info!(host = %server.label(), "restarting");
                self.run_script(server, &context.restart_script()?)
            }
            Action::Kill => {
                info!(host = %server.label(), "killing");
                self.run_script(server, &context.kill_script())
            }
            Action::Rollback { version: None } => {
                let releases = ReleaseManager::new(&self.pool, context.layout()).list(server)?;
                Ok(releases.join("\n"))
            }
            Action::Rollback {
                version: Some(version),
            } => {
                info!(host = %server.label(), version, "rolling back");
                let command = format!(
                    "{} {}",
                    quote(&context.layout().control_script("rollback")),
                    quote(version)
                );
                Ok(self.pool.run_checked(server, &command)?)
            }
            Action::Info => Ok(self
                .pool
                .run_checked(server, &build_info::read_command(&context.layout().build_info))?),
            Action::Diff => self.diff(server, &context),
            Action::Migrate { .. } => self.migrate(server, &context),
        }
    }

    fn deploy(&self, server: &Server, context: &ScriptContext<'_>) -> Result<String, HostError> {
        let layout = context.layout();
        let label = server.label();
        self.pool
            .run_checked(server, &format!("mkdir -p {}", quote(&layout.files_dir)))?;

        if !self.options.no_upload {
            let mut sources = Vec::new();
            if !self.options.no_build {
                sources.push(self.workspace.cache.binary(&self.config.app.name));
            }
            if self.staged.is_some() {
                sources.push(self.workspace.cache.files_dir());
            }
            if !sources.is_empty() {
                info!(host = %label, "uploading");
                self.pool
                    .upload(server, &sources, &format!("{}/", layout.app_root))?;
            }
            if let Some(marker) = &self.build_info {
                self.pool
                    .run_checked(server, &write_file_command(&layout.build_info, marker, None)?)?;
            }
        }
        if self.options.no_deploy {
            return Ok(String::new());
        }

        for (name, body) in [
            ("restart", context.restart_script()?),
            ("kill", context.kill_script()),
            ("rollback", context.rollback_script()?),
        ] {
            let command = write_file_command(&layout.control_script(name), &body, Some("+x"))?;
            self.pool.run_checked(server, &command)?;
        }

        let retention = self.config.retention();
        let release_id = self.clock.release_id();
        let snapshot = retention
            .map(|_| snapshot_script(layout, &self.config.app, release_id))
            .unwrap_or_default();
        info!(host = %label, release = %release_id, "deploying");
        let output = self.run_script(server, &context.deploy_script(&snapshot, release_id.as_str())?)?;

        ReleaseManager::new(&self.pool, layout).trim(server, retention)?;
        Ok(output)
    }

    fn diff(&self, server: &Server, context: &ScriptContext<'_>) -> Result<String, HostError> {
        let files_dir = &context.layout().files_dir;
        let listing = self
            .pool
            .run_checked(server, &remote_listing_command(files_dir))?;
        Ok(self
            .staged
            .as_ref()
            .map(|staged| staged.diff(&listing, files_dir))
            .unwrap_or_default())
    }

    fn migrate(&self, server: &Server, context: &ScriptContext<'_>) -> Result<String, HostError> {
        let Some(bundle) = &self.migrations else {
            return Ok(String::new());
        };
        let layout = context.layout();
        let script = migration_script(
            context,
            server,
            &bundle.migrations,
            self.templates.migration.as_ref(),
        )?;
        if self.options.hand {
            return Ok(script);
        }

        self.pool
            .run_checked(server, &format!("mkdir -p {}", quote(&layout.app_root)))?;
        if !self.options.no_upload {
            info!(host = %server.label(), "uploading migrations");
            self.pool
                .copy_file(server, &bundle.archive, &remote_archive(&layout.app_root))?;
        }
        if self.options.no_deploy {
            return Ok(String::new());
        }
        info!(host = %server.label(), "running migrations");
        self.run_script(server, &script)
    }

    fn check_version(&self, server: &Server, context: &ScriptContext<'_>) -> Result<(), HostError> {
        let marker = self
            .pool
            .run_checked(server, &build_info::read_command(&context.layout().build_info))?;
        let recorded = build_info::parse_tool_version(&marker)?;
        build_info::check_compatibility(
            &server.label(),
            recorded,
            self.local_version,
            self.options.force,
        )?;
        Ok(())
    }

    fn run_script(&self, server: &Server, script: &str) -> Result<String, HostError> {
        debug!(host = %server.label(), "script:\n{script}");
        Ok(self.pool.run_checked(server, script)?)
    }
}
