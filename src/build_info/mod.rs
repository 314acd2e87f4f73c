//! Build-info marker written next to every deployed binary.
//!
//! The marker is a line-oriented `Key: value` text. Its `Harp Version` line
//! records which release of this tool deployed the host and drives the
//! compatibility check run before any mutating action.

use std::ffi::OsString;
use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use chrono::Local;
use thiserror::Error;
use tracing::debug;

use crate::transport::CommandRunner;

/// Version of the running tool.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// File name of the marker on the host.
pub const BUILD_INFO_FILE: &str = "harp-build.info";

const VERSION_KEY: &str = "Harp Version";

/// Errors raised by the build-info marker.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildInfoError {
    /// A version string is not `MAJOR.MINOR.PATCH`.
    #[error("invalid tool version {input:?}")]
    InvalidVersion {
        /// Rejected text.
        input: String,
    },
    /// The host was deployed by an older tool release.
    #[error(
        "{host} was deployed by harp {remote}, older than the running {local}; pass --force to deploy anyway"
    )]
    Incompatible {
        /// Host label.
        host: String,
        /// Version recorded on the host.
        remote: ToolVersion,
        /// Version of the running tool.
        local: ToolVersion,
    },
}

/// Semantic version of the tool, compared numerically.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ToolVersion {
    major: u64,
    minor: u64,
    patch: u64,
}

impl ToolVersion {
    /// Builds a version from its parts.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Version of the running binary.
    #[must_use]
    pub fn current() -> Self {
        TOOL_VERSION.parse().unwrap_or_default()
    }
}

impl FromStr for ToolVersion {
    type Err = BuildInfoError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || BuildInfoError::InvalidVersion {
            input: input.to_owned(),
        };
        let trimmed = input.trim();
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = bare.split(['-', '+']).next().unwrap_or(bare);
        let mut parts = core.split('.');
        let mut next = || -> Result<u64, BuildInfoError> {
            parts
                .next()
                .map_or(Ok(0), |part| part.parse().map_err(|_| invalid()))
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() || core.is_empty() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Contents of the marker.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BuildInfo {
    /// Tool version that produced the build.
    pub harp_version: String,
    /// `go version` output, when a toolchain is available.
    pub go_version: Option<String>,
    /// Target operating system.
    pub goos: Option<String>,
    /// Target architecture.
    pub goarch: Option<String>,
    /// VCS revision of the working tree.
    pub git_checksum: Option<String>,
    /// Author recorded in the VCS configuration.
    pub composer: Option<String>,
    /// Local build time.
    pub build_at: String,
}

impl BuildInfo {
    /// Gathers build metadata from the local toolchain and working tree.
    /// Tools that are missing or fail simply leave their line out.
    #[must_use]
    pub fn collect<R: CommandRunner + ?Sized>(
        runner: &R,
        goos: Option<&str>,
        goarch: Option<&str>,
    ) -> Self {
        let using_git = Utf8Path::new(".git").exists();
        Self {
            harp_version: TOOL_VERSION.to_owned(),
            go_version: query_tool(runner, "go", &["version"]),
            goos: goos.filter(|value| !value.is_empty()).map(str::to_owned),
            goarch: goarch.filter(|value| !value.is_empty()).map(str::to_owned),
            git_checksum: using_git
                .then(|| query_tool(runner, "git", &["rev-parse", "HEAD"]))
                .flatten(),
            composer: using_git
                .then(|| query_tool(runner, "git", &["config", "user.name"]))
                .flatten(),
            build_at: Local::now().format("%Y-%m-%d %H:%M:%S %z").to_string(),
        }
    }

    /// Renders the marker text.
    #[must_use]
    pub fn render(&self) -> String {
        let optional = [
            ("Go Version", self.go_version.as_deref()),
            ("GOOS", self.goos.as_deref()),
            ("GOARCH", self.goarch.as_deref()),
            ("Git Checksum", self.git_checksum.as_deref()),
            ("Composer", self.composer.as_deref()),
        ];
        let mut lines = vec![format!("{VERSION_KEY}: {}", self.harp_version)];
        lines.extend(
            optional
                .into_iter()
                .filter_map(|(key, value)| value.map(|text| format!("{key}: {text}"))),
        );
        lines.push(format!("Build At: {}", self.build_at));
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

/// Reads the tool version from marker text. Hosts deployed before the
/// marker carried a version line yield `None`.
///
/// # Errors
///
/// Returns [`BuildInfoError::InvalidVersion`] for a malformed version line.
pub fn parse_tool_version(marker: &str) -> Result<Option<ToolVersion>, BuildInfoError> {
    marker
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == VERSION_KEY)
        .map(|(_, value)| value.parse())
        .transpose()
}

/// Shell command printing the marker, or nothing on a fresh host.
#[must_use]
pub fn read_command(build_info_path: &str) -> String {
    format!(
        "cat {} 2>/dev/null || true",
        crate::script::quote(build_info_path)
    )
}

/// Fails when the host was deployed by an older tool release, unless
/// `force` is set. Hosts with no recorded version pass.
///
/// # Errors
///
/// Returns [`BuildInfoError::Incompatible`] naming both versions.
pub fn check_compatibility(
    host: &str,
    remote: Option<ToolVersion>,
    local: ToolVersion,
    force: bool,
) -> Result<(), BuildInfoError> {
    match remote {
        Some(recorded) if recorded < local && !force => Err(BuildInfoError::Incompatible {
            host: host.to_owned(),
            remote: recorded,
            local,
        }),
        _ => Ok(()),
    }
}

fn query_tool<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[&str],
) -> Option<String> {
    let argv: Vec<OsString> = args.iter().map(OsString::from).collect();
    match runner.run(program, &argv) {
        Ok(output) if output.is_success() => {
            let text = output.stdout.trim();
            (!text.is_empty()).then(|| text.to_owned())
        }
        Ok(output) => {
            debug!(program, status = %output.status_text(), "build metadata query failed");
            None
        }
        Err(err) => {
            debug!(program, "build metadata query unavailable: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests;
