//! Local build collaborator.
//!
//! Orchestration only needs "build this source into that path"; the shell
//! builder realises it with the configured build command.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::script::quote;
use crate::transport::{CommandRunner, TransportError};

/// Errors raised while building artifacts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    /// The build command exited unsuccessfully.
    #[error("build failed (status {status_text}): {command}\n{output}")]
    Command {
        /// Shell command that failed.
        command: String,
        /// Exit status rendered for humans.
        status_text: String,
        /// Combined output of the build.
        output: String,
    },
    /// The shell could not be started.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One artifact to build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildRequest {
    /// Where the built binary goes.
    pub output: Utf8PathBuf,
    /// Package import path or source file.
    pub source: String,
    /// Target operating system.
    pub goos: Option<String>,
    /// Target architecture.
    pub goarch: Option<String>,
    /// Operator build command; `%s` markers receive the output path, then
    /// the source.
    pub command_template: Option<String>,
}

impl BuildRequest {
    /// Request building `source` into `output` with the descriptor's target
    /// platform and build command.
    #[must_use]
    pub fn for_config(config: &Config, source: impl Into<String>, output: Utf8PathBuf) -> Self {
        Self {
            output,
            source: source.into(),
            goos: non_empty(config.goos.as_deref()),
            goarch: non_empty(config.goarch.as_deref()),
            command_template: config.app.build_cmd.clone(),
        }
    }

    /// Request building the app binary into `output`.
    #[must_use]
    pub fn for_app(config: &Config, output: Utf8PathBuf) -> Self {
        Self::for_config(config, config.app.import_path.clone(), output)
    }

    /// Shell command line performing the build.
    #[must_use]
    pub fn command(&self) -> String {
        let output = quote(self.output.as_str());
        let source = quote(&self.source);
        let build = self.command_template.as_deref().map_or_else(
            || format!("go build -o {output} {source}"),
            |template| fill_markers(template, &[&output, &source]),
        );
        let mut env = Vec::new();
        if let Some(goos) = &self.goos {
            env.push(format!("GOOS={}", quote(goos)));
        }
        if let Some(goarch) = &self.goarch {
            env.push(format!("GOARCH={}", quote(goarch)));
        }
        env.push(build);
        env.join(" ")
    }
}

/// Builds artifacts locally.
pub trait ArtifactBuilder: Send + Sync {
    /// Builds the request and returns the produced binary path.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] when the build fails.
    fn build(&self, request: &BuildRequest) -> Result<Utf8PathBuf, BuildError>;
}

/// Runs the build command through `sh -c`.
#[derive(Clone, Debug)]
pub struct ShellBuilder<R> {
    runner: R,
}

impl<R: CommandRunner> ShellBuilder<R> {
    /// Creates a builder using `runner`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> ArtifactBuilder for ShellBuilder<R> {
    fn build(&self, request: &BuildRequest) -> Result<Utf8PathBuf, BuildError> {
        let command = request.command();
        info!(source = %request.source, "building");
        debug!(command = %command, "build command");
        let output = self
            .runner
            .run("sh", &[OsString::from("-c"), OsString::from(&command)])?;
        if !output.is_success() {
            return Err(BuildError::Command {
                command,
                status_text: output.status_text(),
                output: output.combined(),
            });
        }
        let combined = output.combined();
        if !combined.trim().is_empty() {
            debug!(output = %combined.trim_end(), "build output");
        }
        Ok(request.output.clone())
    }
}

/// Replaces successive `%s` markers with `values`; extra markers stay.
fn fill_markers(template: &str, values: &[&str]) -> String {
    let mut filled = String::with_capacity(template.len());
    let mut rest = template;
    for value in values {
        let Some((before, after)) = rest.split_once("%s") else {
            break;
        };
        filled.push_str(before);
        filled.push_str(value);
        rest = after;
    }
    filled.push_str(rest);
    filled
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;
    use crate::test_support::ScriptedRunner;

    fn request(template: Option<&str>) -> BuildRequest {
        BuildRequest {
            output: Utf8PathBuf::from(".harp/app"),
            source: String::from("example.com/app"),
            goos: Some(String::from("linux")),
            goarch: None,
            command_template: template.map(str::to_owned),
        }
    }

    #[test]
    fn default_command_targets_platform() {
        assert_eq!(
            request(None).command(),
            "GOOS=linux go build -o .harp/app example.com/app"
        );
    }

    #[test]
    fn template_markers_receive_output_then_source() {
        assert_eq!(
            request(Some("go build -tags prod -o %s %s")).command(),
            "GOOS=linux go build -tags prod -o .harp/app example.com/app"
        );
    }

    #[test]
    fn template_without_markers_runs_verbatim() {
        assert_eq!(request(Some("make build")).command(), "GOOS=linux make build");
    }

    #[test]
    fn for_app_uses_descriptor() {
        let mut config = Config::default();
        config.app.import_path = String::from("example.com/app");
        config.goarch = Some(String::from("arm64"));
        let built = BuildRequest::for_app(&config, Utf8Path::new(".harp").join("app"));
        assert_eq!(built.command(), "GOARCH=arm64 go build -o .harp/app example.com/app");
    }

    #[test]
    fn shell_builder_runs_through_sh() {
        let runner = ScriptedRunner::new();
        let built = ShellBuilder::new(runner.clone())
            .build(&request(None))
            .expect("build succeeds");
        assert_eq!(built, Utf8PathBuf::from(".harp/app"));
        assert_eq!(
            runner.commands(),
            vec![String::from("sh -c GOOS=linux go build -o .harp/app example.com/app")]
        );
    }

    #[test]
    fn shell_builder_reports_failures_with_output() {
        let runner = ScriptedRunner::new();
        runner.fail(&["go build"], 2, "main.go:3: syntax error");
        let err = ShellBuilder::new(runner)
            .build(&request(None))
            .expect_err("build fails");
        let BuildError::Command { status_text, output, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(status_text, "2");
        assert!(output.contains("syntax error"));
    }
}
