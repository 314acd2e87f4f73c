//! Core library for the harp deployment tool.
//!
//! harp builds an application locally, stages its declared data files, and
//! rolls both out to a fleet of hosts over SSH. Every host keeps timestamped
//! releases so a deploy can be rolled back without the tool, and the
//! generated control scripts stay on the host for the same reason.
//!
//! The pieces compose in one direction: [`config`] and [`server`] describe
//! what goes where, [`transport`] reaches the hosts, [`script`] renders what
//! runs there, and [`dispatch`] fans an action out across every selected
//! host, collecting one result per host.

pub mod build_info;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod files;
pub mod logs;
pub mod migration;
pub mod release;
pub mod script;
pub mod server;
pub mod settings;
pub mod test_support;
pub mod transport;

pub use builder::{ArtifactBuilder, BuildError, BuildRequest, ShellBuilder};
pub use config::{App, Config, ConfigError};
pub use console::Console;
pub use dispatch::{
    Action, Deployment, DispatchError, DispatchReport, HostError, RunOptions, Workspace,
};
pub use logs::{LogError, LogMultiplexer};
pub use server::{Server, ServerError, select_servers};
pub use settings::{HarpSettings, SettingsError};
pub use transport::{
    CommandOutput, CommandRunner, ConnectionPool, ProcessCommandRunner, TransportError,
    TransportOptions,
};
