//! Tool settings for the external programs harp drives.
//!
//! [`HarpSettings`] is layered through `ortho-config`: built-in defaults, then
//! configuration files, then `HARP_*` environment variables. It only covers
//! how harp talks to hosts (binaries and SSH client options); what to deploy
//! lives in the deployment descriptor, see [`crate::config`].

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default local cache directory, relative to the working directory.
pub const DEFAULT_CACHE_DIR: &str = ".harp";

/// Transport and local cache settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HARP",
    discovery(
        app_name = "harp",
        env_var = "HARP_SETTINGS_PATH",
        config_file_name = "harp.toml",
        dotfile_name = ".harp.toml",
        project_file_name = "harp.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "user-facing SSH toggles are naturally expressed as booleans"
)]
pub struct HarpSettings {
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `tar` executable used to bundle migrations.
    #[ortho_config(default = "tar".to_owned())]
    pub tar_bin: String,
    /// Whether to force batch mode so SSH never prompts; authentication then
    /// relies on the running SSH agent.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = true)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override. Optional; OpenSSH defaults apply when unset.
    pub ssh_known_hosts_file: Option<String>,
    /// Directory for SSH control sockets. When set, each host gets one
    /// control master and every later command multiplexes over it.
    pub ssh_control_dir: Option<String>,
    /// Seconds a control master lingers after its last session.
    #[ortho_config(default = 60)]
    pub ssh_control_persist: u32,
    /// Local working directory for staged artifacts.
    #[ortho_config(default = DEFAULT_CACHE_DIR.to_owned())]
    pub cache_dir: String,
}

/// Errors raised when loading or validating settings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("settings parsing failed: {0}")]
    Parse(String),
    /// Raised when a required value is blank.
    #[error("missing {field}: set HARP_{env_suffix} or add {field} to harp.toml", env_suffix = field.to_uppercase())]
    InvalidValue {
        /// Setting that failed validation.
        field: String,
    },
}

impl Default for HarpSettings {
    fn default() -> Self {
        Self {
            rsync_bin: String::from("rsync"),
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            tar_bin: String::from("tar"),
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: true,
            ssh_known_hosts_file: None,
            ssh_control_dir: None,
            ssh_control_persist: 60,
            cache_dir: DEFAULT_CACHE_DIR.to_owned(),
        }
    }
}

impl HarpSettings {
    /// Loads settings from defaults, configuration files, and environment
    /// variables without parsing process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        Self::load_from_iter([std::ffi::OsString::from("harp")])
            .map_err(|err| SettingsError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidValue`] naming the first blank field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        Self::require_value(&self.rsync_bin, "rsync_bin")?;
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.tar_bin, "tar_bin")?;
        Self::require_value(&self.cache_dir, "cache_dir")?;
        Self::require_optional_value(self.ssh_known_hosts_file.as_deref(), "ssh_known_hosts_file")?;
        Self::require_optional_value(self.ssh_control_dir.as_deref(), "ssh_control_dir")?;
        Ok(())
    }

    /// Local cache directory as a path.
    #[must_use]
    pub fn cache_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.cache_dir)
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), SettingsError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(SettingsError::InvalidValue {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), SettingsError> {
        Self::require_optional_value(Some(value), field)
    }
}
