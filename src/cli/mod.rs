//! Command-line interface definitions for the `harp` binary.
//!
//! This module only depends on clap so the build script can include it to
//! render the manual page.

use clap::{Args, Parser, Subcommand};

/// Default path of the deployment descriptor.
pub const DEFAULT_CONFIG: &str = "harp.json";

/// Default number of log lines printed before following.
pub const DEFAULT_LOG_LINES: usize = 20;

/// Top-level CLI for the `harp` binary.
#[derive(Debug, Parser)]
#[command(
    name = "harp",
    version,
    about = "Deploy a built artifact and its data files to a fleet of hosts over SSH",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Options shared by every subcommand.
    #[command(flatten)]
    pub global: GlobalArgs,
    /// Action to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Target selection and run switches.
#[derive(Clone, Debug, Default, Args)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "each switch maps to one independent command-line flag"
)]
pub struct GlobalArgs {
    /// Deployment descriptor to load.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        env = "HARP_CONFIG",
        default_value = DEFAULT_CONFIG,
        value_name = "PATH"
    )]
    pub config: String,
    /// Server sets to target; repeat or separate with commas.
    #[arg(short = 's', long = "set", global = true, value_delimiter = ',', value_name = "SET")]
    pub sets: Vec<String>,
    /// Ad-hoc hosts to target as `user@host:port`.
    #[arg(long = "server", global = true, value_name = "USER@HOST:PORT")]
    pub servers: Vec<String>,
    /// Verbose logging and full error chains.
    #[arg(long, global = true)]
    pub debug: bool,
    /// Skip building the binary.
    #[arg(long = "nb", global = true)]
    pub no_build: bool,
    /// Skip uploading the binary and files.
    #[arg(long = "nu", global = true)]
    pub no_upload: bool,
    /// Upload only; do not run deploy or migration scripts.
    #[arg(long = "nd", global = true)]
    pub no_deploy: bool,
    /// Skip staging and uploading data files.
    #[arg(long = "nf", global = true)]
    pub no_files: bool,
    /// Proceed on hosts whose build info was written by an older harp.
    #[arg(long, global = true)]
    pub force: bool,
    /// Tail the application log once a deploy or restart finishes.
    #[arg(long, global = true)]
    pub log: bool,
    /// Match exclude patterns as globs only, without the substring fallback.
    #[arg(long = "soft-exclude", global = true)]
    pub soft_exclude: bool,
}

/// Subcommands of `harp`.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build, upload, and restart the app on every host.
    Deploy,
    /// Restart the app from its current files.
    Restart,
    /// Stop the app.
    Kill,
    /// List releases, or roll back to the given one.
    Rollback(RollbackCommand),
    /// Print each host's build information.
    Info,
    /// Follow the app log on every host.
    Log(LogCommand),
    /// Run one-shot migration programs on every host.
    Migrate(MigrateCommand),
    /// List the files a deploy would upload.
    Files,
    /// Compare local files with each host's deployed files.
    Diff,
    /// Run shell commands read from stdin on every host.
    Console(ConsoleCommand),
}

/// Arguments for `harp rollback`.
#[derive(Debug, Args)]
pub struct RollbackCommand {
    /// Release to restore; lists releases when omitted.
    #[arg(value_name = "RELEASE")]
    pub version: Option<String>,
}

/// Arguments for `harp log`.
#[derive(Debug, Args)]
pub struct LogCommand {
    /// Lines of history printed before following.
    #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
    pub lines: usize,
}

/// Arguments for `harp migrate`.
#[derive(Debug, Args)]
pub struct MigrateCommand {
    /// Migration specs such as `"Env=prod path/to/migration.go -arg value"`.
    #[arg(required = true, value_name = "SPEC")]
    pub specs: Vec<String>,
    /// Print each host's migration script instead of running it.
    #[arg(long)]
    pub hand: bool,
}

/// Arguments for `harp console`.
#[derive(Debug, Args)]
pub struct ConsoleCommand {
    /// Prefix output with each host's `user@hostname:home` instead of its
    /// address.
    #[arg(long)]
    pub identify: bool,
}
