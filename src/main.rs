//! Binary entry point for the harp CLI.

use std::env;
use std::error::Error as _;
use std::io::{self, Write};
use std::process;
use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use harp::cache::LocalCache;
use harp::cli::{Cli, Command, DEFAULT_LOG_LINES, GlobalArgs};
use harp::files::{StageError, search_roots};
use harp::{
    Action, Config, ConfigError, Console, Deployment, DispatchError, HarpSettings, LogError,
    LogMultiplexer, ProcessCommandRunner, RunOptions, Server, ServerError, SettingsError,
    ShellBuilder, TransportOptions, Workspace, select_servers,
};

/// Exit status after Ctrl-C.
const INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("server selection failed: {0}")]
    Servers(#[from] ServerError),
    #[error("pre-flight failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("file staging failed: {0}")]
    Stage(#[from] StageError),
    #[error("log streaming failed: {0}")]
    Logs(#[from] LogError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

/// Everything an invocation shares between subcommands.
struct Session {
    global: GlobalArgs,
    config: Arc<Config>,
    pool: Arc<harp::ConnectionPool<ProcessCommandRunner>>,
    workspace: Workspace,
    options: RunOptions,
}

impl Session {
    fn targets(&self) -> Result<Vec<Server>, CliError> {
        let sets = self.config.server_sets()?;
        Ok(select_servers(&sets, &self.global.sets, &self.global.servers)?)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let debug = cli.global.debug;
    init_tracing(debug);

    let settings = match HarpSettings::load_without_cli_args() {
        Ok(settings) => settings,
        Err(err) => {
            write_error(io::stderr(), &CliError::from(err), debug);
            process::exit(1);
        }
    };
    let cache = LocalCache::new(settings.cache_path());

    let exit_code = tokio::select! {
        result = dispatch(cli, settings) => match result {
            Ok(code) => code,
            Err(err) => {
                write_error(io::stderr(), &err, debug);
                1
            }
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!("failed to listen for interrupts: {err}");
            }
            warn!("interrupted");
            INTERRUPTED
        }
    };

    cache.cleanup();
    process::exit(exit_code);
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let initialised = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .without_time()
        .compact()
        .try_init();
    if let Err(err) = initialised {
        writeln!(io::stderr(), "failed to initialise logging: {err}").ok();
    }
}

async fn dispatch(cli: Cli, settings: HarpSettings) -> Result<i32, CliError> {
    settings.validate()?;
    let config = Arc::new(Config::load(Utf8Path::new(&cli.global.config))?);
    let gopath = env::var("GOPATH").ok();
    let home = env::var("HOME").ok();
    let session = Session {
        options: run_options(&cli.global, &cli.command),
        workspace: Workspace {
            cache: LocalCache::new(settings.cache_path()),
            search_roots: search_roots(gopath.as_deref(), home.as_deref()),
            tar_bin: settings.tar_bin.clone(),
        },
        pool: Arc::new(harp::ConnectionPool::new(
            ProcessCommandRunner,
            TransportOptions::from_settings(&settings),
        )),
        config,
        global: cli.global,
    };

    let result = match cli.command {
        Command::Files => list_files(&session).await,
        Command::Log(args) => follow_logs(&session, &session.targets()?, args.lines).await,
        Command::Console(args) => run_console(&session, args.identify).await,
        Command::Deploy => run_action(&session, Action::Deploy).await,
        Command::Restart => run_action(&session, Action::Restart).await,
        Command::Kill => run_action(&session, Action::Kill).await,
        Command::Rollback(args) => {
            run_action(&session, Action::Rollback { version: args.version }).await
        }
        Command::Info => run_action(&session, Action::Info).await,
        Command::Diff => run_action(&session, Action::Diff).await,
        Command::Migrate(args) => run_action(&session, Action::Migrate { specs: args.specs }).await,
    };
    session.pool.close_all();
    result
}

fn run_options(global: &GlobalArgs, command: &Command) -> RunOptions {
    RunOptions {
        no_build: global.no_build,
        no_upload: global.no_upload,
        no_deploy: global.no_deploy,
        no_files: global.no_files,
        force: global.force,
        debug: global.debug,
        soft_exclude: global.soft_exclude,
        hand: matches!(command, Command::Migrate(args) if args.hand),
    }
}

async fn run_action(session: &Session, action: Action) -> Result<i32, CliError> {
    let servers = session.targets()?;
    let follow = session.global.log && matches!(action, Action::Deploy | Action::Restart);
    let builder = ShellBuilder::new(ProcessCommandRunner);
    let deployment = Deployment::prepare(
        action,
        Arc::clone(&session.config),
        session.options,
        Arc::clone(&session.pool),
        session.workspace.clone(),
        &builder,
    )
    .await?;

    let report = Arc::new(deployment).run(&servers).await;
    report.write_to(io::stdout().lock())?;
    let exit_code = i32::from(!report.is_success());

    if follow {
        let healthy: Vec<Server> = report
            .outcomes()
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .map(|outcome| outcome.server.clone())
            .collect();
        if !healthy.is_empty() {
            follow_logs(session, &healthy, DEFAULT_LOG_LINES).await?;
        }
    }
    Ok(exit_code)
}

async fn follow_logs(session: &Session, servers: &[Server], lines: usize) -> Result<i32, CliError> {
    let multiplexer = LogMultiplexer::new(
        Arc::clone(&session.pool),
        session.config.app.clone(),
        lines,
    );
    multiplexer.tail(servers, io::stdout()).await?;
    Ok(0)
}

async fn run_console(session: &Session, identify: bool) -> Result<i32, CliError> {
    let servers = session.targets()?;
    let mut console = Console::new(Arc::clone(&session.pool));
    if identify {
        console.identify(&servers).await;
    }
    info!(hosts = servers.len(), "console ready; commands run on every host");
    let out = Arc::new(Mutex::new(io::stdout()));
    console
        .run(&servers, BufReader::new(tokio::io::stdin()), &out)
        .await?;
    Ok(0)
}

async fn list_files(session: &Session) -> Result<i32, CliError> {
    let synchronizer = session
        .workspace
        .synchronizer(&session.config, session.options.soft_exclude);
    let declarations = synchronizer.resolve(&session.config.app.files)?;
    let staged = synchronizer.inspect(&declarations).await?;
    staged.write_summary(io::stdout().lock())?;
    Ok(0)
}

fn write_error(mut target: impl Write, err: &CliError, debug: bool) {
    writeln!(target, "harp: {err}").ok();
    if !debug {
        return;
    }
    let mut cause = err.source();
    while let Some(inner) = cause {
        writeln!(target, "  caused by: {inner}").ok();
        cause = inner.source();
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
