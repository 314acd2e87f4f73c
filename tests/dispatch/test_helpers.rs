//! Shared fixtures for dispatch BDD scenarios.
//!
//! Hosts are answered by a [`ScriptedRunner`], so a scenario drives the real
//! [`Deployment`] fan-out without touching SSH. Scenario state lives behind
//! shared handles so every step observes what earlier steps recorded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use chrono::{TimeZone, Utc};
use harp::build_info::ToolVersion;
use harp::cache::LocalCache;
use harp::release::{ReleaseClock, ReleaseId};
use harp::test_support::ScriptedRunner;
use harp::{
    Action, ArtifactBuilder, BuildError, BuildRequest, Config, ConnectionPool, Deployment,
    DispatchError, RunOptions, Server, TransportOptions, Workspace,
};
use rstest::fixture;
use tempfile::TempDir;
use tokio::runtime::Runtime;

pub const MARKER_READ: &str = "cat /home/app/harp/app/harp-build.info";
pub const RELEASE_LIST: &str = "ls -1 /home/app/harp/app/releases 2>/dev/null";
pub const SNAPSHOT: &str = "if [ -f harp-build.info ]";

/// Builder that pretends every build succeeded.
#[derive(Debug)]
pub struct PrebuiltArtifacts;

impl ArtifactBuilder for PrebuiltArtifacts {
    fn build(&self, request: &BuildRequest) -> Result<Utf8PathBuf, BuildError> {
        Ok(request.output.clone())
    }
}

/// One host's reported result.
#[derive(Clone, Debug)]
pub struct HostResult {
    pub host: String,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
pub struct DispatchState {
    pub hosts: Vec<Server>,
    pub options: RunOptions,
    pub results: Vec<HostResult>,
    pub report: String,
}

#[derive(Clone, Debug)]
pub struct DispatchContext {
    pub runner: ScriptedRunner,
    root: Utf8PathBuf,
    state: Arc<Mutex<DispatchState>>,
    _temp: Arc<TempDir>,
}

impl DispatchContext {
    pub fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepares and runs `action` against the recorded hosts, keeping the
    /// per-host results and the rendered report.
    pub fn run(&self, action: Action) -> Result<(), DispatchError> {
        let (hosts, options) = {
            let state = self.state();
            (state.hosts.clone(), state.options)
        };
        let mut config = Config::default();
        config.app.name = String::from("app");
        config.app.import_path = String::from("example.com/app");
        let workspace = Workspace {
            cache: LocalCache::new(self.root.join(".harp")),
            search_roots: vec![self.root.clone()],
            tar_bin: String::from("tar"),
        };
        let pool = Arc::new(ConnectionPool::new(
            self.runner.clone(),
            TransportOptions::default(),
        ));
        let time = Utc
            .with_ymd_and_hms(2025, 1, 2, 3, 4, 5)
            .single()
            .unwrap_or_else(|| panic!("fixed release time should be valid"));

        let runtime =
            Runtime::new().unwrap_or_else(|err| panic!("tokio runtime should start: {err}"));
        let report = runtime.block_on(async move {
            let deployment = Deployment::prepare(
                action,
                Arc::new(config),
                options,
                pool,
                workspace,
                &PrebuiltArtifacts,
            )
            .await?
            .with_local_version(ToolVersion::new(0, 6, 0))
            .with_clock(ReleaseClock::fixed(ReleaseId::from_time(&time)));
            Ok::<_, DispatchError>(Arc::new(deployment).run(&hosts).await)
        })?;

        let mut rendered = Vec::new();
        report
            .write_to(&mut rendered)
            .unwrap_or_else(|err| panic!("report should render: {err}"));
        let mut state = self.state();
        state.results = report
            .outcomes()
            .iter()
            .map(|outcome| HostResult {
                host: outcome.server.host.clone(),
                succeeded: outcome.result.is_ok(),
            })
            .collect();
        state.report = String::from_utf8_lossy(&rendered).into_owned();
        Ok(())
    }

    /// Whether `host` ran a command containing `needle`.
    pub fn ran(&self, host: &str, needle: &str) -> bool {
        !self
            .runner
            .commands_matching(&[&format!("app@{host}"), needle])
            .is_empty()
    }
}

pub fn host(name: &str, set: &str) -> Server {
    Server {
        user: String::from("app"),
        host: name.to_owned(),
        port: 22,
        home: Some(String::from("/home/app")),
        gopath: Some(String::from("/home/app/go")),
        set: set.to_owned(),
        ..Server::default()
    }
}

/// Splits a comma separated list of host names.
pub fn names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

#[fixture]
pub fn dispatch_context() -> DispatchContext {
    let temp = TempDir::new().unwrap_or_else(|err| panic!("create dispatch workspace: {err}"));
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("workspace path should be UTF-8: {}", path.display()));
    DispatchContext {
        runner: ScriptedRunner::new(),
        root,
        state: Arc::new(Mutex::new(DispatchState::default())),
        _temp: Arc::new(temp),
    }
}
