//! Deployment descriptor (`harp.json`).
//!
//! The descriptor is decoded once with `serde_json` into an immutable
//! [`Config`] that every component borrows. Field names follow the
//! PascalCase keys of existing `harp.json` files.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use thiserror::Error;

use crate::server::{DEFAULT_SSH_PORT, Server, ServerError};

/// Default number of releases kept on each host.
pub const DEFAULT_ROLLBACK_COUNT: usize = 3;

/// Default signal sent to the running process on restart.
pub const DEFAULT_KILL_SIGNAL: &str = "KILL";

/// Default size above which staged files are flagged (1 MiB).
pub const DEFAULT_FILE_WARNING_SIZE: u64 = 1 << 20;

/// Errors raised while loading or validating the descriptor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when the descriptor cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the descriptor is not valid JSON for [`Config`].
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Descriptor path.
        path: Utf8PathBuf,
        /// Decoder message including line and column.
        message: String,
    },
    /// Raised when a required field is blank.
    #[error("App.{field} is required in the deployment descriptor")]
    MissingField {
        /// Missing field name.
        field: &'static str,
    },
    /// Raised when a `Files` entry has an empty path.
    #[error("App.Files entry {index} has an empty Path")]
    EmptyFilePath {
        /// Position of the entry.
        index: usize,
    },
    /// Raised when a server port is not a valid number.
    #[error("server {user}@{host} in set {set:?} has invalid port {port:?}")]
    InvalidPort {
        /// Set containing the server.
        set: String,
        /// Login user.
        user: String,
        /// Host name.
        host: String,
        /// Rejected port text.
        port: String,
    },
    /// Raised when a server descriptor is invalid.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Root of the deployment descriptor.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Target operating system for cross builds.
    #[serde(rename = "GOOS", default)]
    pub goos: Option<String>,
    /// Target architecture for cross builds.
    #[serde(rename = "GOARCH", default)]
    pub goarch: Option<String>,
    /// Disables release snapshots and trimming.
    #[serde(default)]
    pub no_rollback: bool,
    /// Number of releases kept on each host.
    #[serde(default = "default_rollback_count")]
    pub rollback_count: usize,
    /// The deployed application.
    #[serde(default)]
    pub app: App,
    /// Named server sets.
    #[serde(default)]
    pub servers: BTreeMap<String, Vec<ServerEntry>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            goos: None,
            goarch: None,
            no_rollback: false,
            rollback_count: DEFAULT_ROLLBACK_COUNT,
            app: App::default(),
            servers: BTreeMap::new(),
        }
    }
}

/// Application section of the descriptor.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct App {
    /// Application name; also the binary and remote directory name.
    #[serde(default)]
    pub name: String,
    /// Module import path, relative to the module root's `src`.
    #[serde(default)]
    pub import_path: String,
    /// Data files uploaded alongside the binary.
    #[serde(default)]
    pub files: Vec<FileDeclaration>,
    /// Arguments passed to the binary on launch.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment applied on launch, before per-host overrides.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Build command template overriding the default `go build`.
    #[serde(default)]
    pub build_cmd: Option<String>,
    /// Signal sent to the running process before relaunch.
    #[serde(default = "default_kill_signal")]
    pub kill_sig: String,
    /// Size in bytes above which staged files are flagged.
    #[serde(default = "default_file_warning_size")]
    pub file_warning_size: u64,
    /// Exclusion patterns applied to every declared path.
    #[serde(default)]
    pub default_excludeds: Vec<String>,
    /// Disables matching exclusion patterns against basenames.
    #[serde(default)]
    pub no_rel_match: bool,
    /// Custom deploy script template.
    #[serde(default)]
    pub deploy_script: Option<Utf8PathBuf>,
    /// Custom restart script template.
    #[serde(default)]
    pub restart_script: Option<Utf8PathBuf>,
    /// Custom migration script template.
    #[serde(default)]
    pub migration_script: Option<Utf8PathBuf>,
}

impl Default for App {
    fn default() -> Self {
        Self {
            name: String::new(),
            import_path: String::new(),
            files: Vec::new(),
            args: Vec::new(),
            envs: BTreeMap::new(),
            build_cmd: None,
            kill_sig: default_kill_signal(),
            file_warning_size: DEFAULT_FILE_WARNING_SIZE,
            default_excludeds: Vec::new(),
            no_rel_match: false,
            deploy_script: None,
            restart_script: None,
            migration_script: None,
        }
    }
}

/// One declared data path.
///
/// Accepts either a bare string or `{ "Path", "Excludeds", "Delete" }`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(from = "RawFileDeclaration")]
pub struct FileDeclaration {
    /// Path relative to a search root.
    pub path: String,
    /// Exclusion patterns specific to this path.
    pub excludeds: Vec<String>,
    /// Delete remote files absent from the local copy.
    pub delete: bool,
}

impl FileDeclaration {
    /// Declaration without excludes or deletion.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            excludeds: Vec::new(),
            delete: false,
        }
    }

    /// Flattened staging name: the path with `/` replaced by `_`.
    #[must_use]
    pub fn flattened(&self) -> String {
        self.path.trim_end_matches('/').replace('/', "_")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFileDeclaration {
    Bare(String),
    #[serde(rename_all = "PascalCase")]
    Detailed {
        path: String,
        #[serde(default)]
        excludeds: Vec<String>,
        #[serde(default)]
        delete: bool,
    },
}

impl From<RawFileDeclaration> for FileDeclaration {
    fn from(raw: RawFileDeclaration) -> Self {
        match raw {
            RawFileDeclaration::Bare(path) => Self::new(path),
            RawFileDeclaration::Detailed {
                path,
                excludeds,
                delete,
            } => Self {
                path,
                excludeds,
                delete,
            },
        }
    }
}

/// Server entry as written in the descriptor.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ServerEntry {
    /// Optional stable identifier.
    #[serde(rename = "ID", default)]
    pub id: Option<String>,
    /// Login user.
    #[serde(default)]
    pub user: String,
    /// Host name or address.
    #[serde(default)]
    pub host: String,
    /// Port as a number, `"22"`, or the legacy `":22"` form.
    #[serde(default)]
    pub port: Option<PortValue>,
    /// Per-host environment overrides.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Remote home override.
    #[serde(default)]
    pub home: Option<String>,
    /// Remote module root override.
    #[serde(default)]
    pub go_path: Option<String>,
    /// Log directory override.
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Jump host.
    #[serde(default)]
    pub proxy: Option<Box<ServerEntry>>,
}

/// Port in either numeric or textual form.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum PortValue {
    /// Numeric port.
    Number(u16),
    /// Textual port, optionally prefixed with `:`.
    Text(String),
}

impl ServerEntry {
    /// Converts the entry into a [`Server`] labelled with `set`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPort`] when a port (here or on the
    /// proxy) does not parse.
    pub fn to_server(&self, set: &str) -> Result<Server, ConfigError> {
        let proxy = match self.proxy.as_deref() {
            Some(entry) => Some(Box::new(entry.to_server(set)?)),
            None => None,
        };
        Ok(Server {
            id: self.id.clone().filter(|id| !id.is_empty()),
            user: self.user.trim().to_owned(),
            host: self.host.trim().to_owned(),
            port: self.resolve_port(set)?,
            proxy,
            envs: self.envs.clone(),
            home: non_blank(self.home.as_deref()),
            gopath: non_blank(self.go_path.as_deref()),
            log_dir: non_blank(self.log_dir.as_deref()),
            set: set.to_owned(),
        })
    }

    fn resolve_port(&self, set: &str) -> Result<u16, ConfigError> {
        match &self.port {
            None => Ok(DEFAULT_SSH_PORT),
            Some(PortValue::Number(port)) => Ok(*port),
            Some(PortValue::Text(text)) => {
                let trimmed = text.trim().trim_start_matches(':');
                if trimmed.is_empty() {
                    return Ok(DEFAULT_SSH_PORT);
                }
                trimmed.parse().map_err(|_| ConfigError::InvalidPort {
                    set: set.to_owned(),
                    user: self.user.clone(),
                    host: self.host.clone(),
                    port: text.clone(),
                })
            }
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn default_rollback_count() -> usize {
    DEFAULT_ROLLBACK_COUNT
}

fn default_kill_signal() -> String {
    DEFAULT_KILL_SIGNAL.to_owned()
}

const fn default_file_warning_size() -> u64 {
    DEFAULT_FILE_WARNING_SIZE
}

impl Config {
    /// Reads and decodes the descriptor at `path`, then validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read,
    /// [`ConfigError::Parse`] for malformed JSON, and validation errors from
    /// [`Config::validate`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = read_to_string_ambient(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::parse(path, &contents)
    }

    /// Decodes descriptor text; `path` is used for error messages only.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or a validation error.
    pub fn parse(path: &Utf8Path, contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the app name or import path
    /// is blank, or [`ConfigError::EmptyFilePath`] for an empty declaration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.name.trim().is_empty() {
            return Err(ConfigError::MissingField { field: "Name" });
        }
        if self.app.import_path.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "ImportPath",
            });
        }
        if let Some(index) = self
            .app
            .files
            .iter()
            .position(|file| file.path.trim().is_empty())
        {
            return Err(ConfigError::EmptyFilePath { index });
        }
        Ok(())
    }

    /// Server sets converted to descriptors, keyed by set name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPort`] for unparsable ports.
    pub fn server_sets(&self) -> Result<BTreeMap<String, Vec<Server>>, ConfigError> {
        self.servers
            .iter()
            .map(|(set, entries)| {
                let servers = entries
                    .iter()
                    .map(|entry| entry.to_server(set))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((set.clone(), servers))
            })
            .collect()
    }

    /// Releases kept per host, or `None` when rollback is disabled.
    #[must_use]
    pub const fn retention(&self) -> Option<usize> {
        if self.no_rollback {
            None
        } else {
            Some(self.rollback_count)
        }
    }
}

/// Reads a UTF-8 file through a capability handle on its parent directory.
pub(crate) fn read_to_string_ambient(path: &Utf8Path) -> io::Result<String> {
    let (parent, file_name) = split_parent(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    dir.read_to_string(file_name)
}

/// Splits `path` into an openable parent directory and a file name.
pub(crate) fn split_parent(path: &Utf8Path) -> io::Result<(&Utf8Path, &str)> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no file name: {path}"),
        )
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    Ok((parent, file_name))
}

#[cfg(test)]
mod tests;
