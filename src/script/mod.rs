//! Remote shell script generation.
//!
//! Every script is a deterministic function of the app descriptor, the
//! server descriptor, and the host's discovered paths. Scripts that mutate
//! host state start with `set -e` so a failing step stops the rest of that
//! host's sequence.

mod template;

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use minijinja::Value;
use shell_escape::unix::escape;
use thiserror::Error;

use crate::config::App;
use crate::files::StagedDeclaration;
use crate::server::Server;
use crate::transport::RemotePaths;

pub use template::{ScriptTemplate, ScriptTemplates, TemplateVars};

/// Heredoc delimiter used when writing files on the host.
pub const HEREDOC_DELIMITER: &str = "HARP_EOF";

/// Errors raised while generating scripts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptError {
    /// A template file could not be read.
    #[error("failed to read script template {path}: {message}")]
    Read {
        /// Template path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// A template does not compile.
    #[error("invalid script template {template}: {message}")]
    Syntax {
        /// Template origin.
        template: String,
        /// Engine error.
        message: String,
    },
    /// A template failed to render, usually because it names a variable
    /// with no value for this script kind.
    #[error("failed to render script template {template}: {message}")]
    Render {
        /// Template origin.
        template: String,
        /// Engine error.
        message: String,
    },
    /// An environment key is not a valid shell variable name.
    #[error("environment key {key:?} is not a valid shell variable name")]
    InvalidEnvKey {
        /// Rejected key.
        key: String,
    },
    /// Content written through a heredoc contains the delimiter line.
    #[error("content for {target} contains the line {HEREDOC_DELIMITER}")]
    DelimiterCollision {
        /// Remote file being written.
        target: String,
    },
}

/// Remote filesystem layout of one app on one host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteLayout {
    /// Remote home directory.
    pub home: String,
    /// Remote module root.
    pub gopath: String,
    /// `$HOME/harp/<app>`.
    pub app_root: String,
    /// Uploaded data files, one flattened directory per declaration.
    pub files_dir: String,
    /// PID file of the running process.
    pub pid: String,
    /// Log directory.
    pub log_dir: String,
    /// Application log file.
    pub log: String,
    /// Build-info marker.
    pub build_info: String,
    /// Uploaded binary.
    pub binary: String,
    /// Module source tree the app runs from.
    pub module_src: String,
    /// Installed binary path.
    pub bin_path: String,
    /// Release snapshots.
    pub releases_dir: String,
    /// Unpacked migration binaries.
    pub migration_dir: String,
}

impl RemoteLayout {
    /// Computes the layout for `app` on a host with the given paths.
    #[must_use]
    pub fn new(app: &App, server: &Server, paths: &RemotePaths) -> Self {
        let app_root = format!("{}/harp/{}", paths.home, app.name);
        let log_dir = server
            .log_dir
            .clone()
            .unwrap_or_else(|| format!("{app_root}/log"));
        Self {
            home: paths.home.clone(),
            gopath: paths.gopath.clone(),
            files_dir: format!("{app_root}/files"),
            pid: format!("{app_root}/app.pid"),
            log: format!("{log_dir}/app.log"),
            log_dir,
            build_info: format!("{app_root}/harp-build.info"),
            binary: format!("{app_root}/{}", app.name),
            module_src: format!("{}/src/{}", paths.gopath, app.import_path),
            bin_path: format!("{}/bin/{}", paths.gopath, app.name),
            releases_dir: format!("{app_root}/releases"),
            migration_dir: format!("{app_root}/migration"),
            app_root,
        }
    }

    /// Path of a persisted control script such as `restart.sh`.
    #[must_use]
    pub fn control_script(&self, name: &str) -> String {
        format!("{}/{name}.sh", self.app_root)
    }
}

/// Generates the scripts for one app on one host.
#[derive(Clone, Debug)]
pub struct ScriptContext<'a> {
    app: &'a App,
    server: &'a Server,
    layout: RemoteLayout,
    declarations: &'a [StagedDeclaration],
    templates: &'a ScriptTemplates,
}

impl<'a> ScriptContext<'a> {
    /// Builds a context from descriptors and discovered paths.
    #[must_use]
    pub fn new(
        app: &'a App,
        server: &'a Server,
        paths: &RemotePaths,
        declarations: &'a [StagedDeclaration],
        templates: &'a ScriptTemplates,
    ) -> Self {
        Self {
            app,
            server,
            layout: RemoteLayout::new(app, server, paths),
            declarations,
            templates,
        }
    }

    /// Remote layout of this host.
    #[must_use]
    pub const fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    /// Copies uploaded data files into the module source tree, then the
    /// build info and the binary into place.
    #[must_use]
    pub fn sync_files(&self) -> String {
        let layout = &self.layout;
        let mut lines = vec![format!(
            "mkdir -p {} {} {}",
            quote(&format!("{}/bin", layout.gopath)),
            quote(&format!("{}/src", layout.gopath)),
            quote(&layout.module_src),
        )];

        for staged in self.declarations {
            let declaration = &staged.declaration;
            let relative = declaration.path.trim_end_matches('/');
            let dst = format!("{}/src/{relative}", layout.gopath);
            let src = format!("{}/{}", layout.files_dir, declaration.flattened());
            let dst_parent = Utf8Path::new(&dst)
                .parent()
                .map_or_else(|| layout.gopath.clone(), ToString::to_string);
            let suffix = if staged.is_dir { "/" } else { "" };

            lines.push(format!("mkdir -p {}", quote(&dst_parent)));
            let mut rsync = vec![String::from("rsync -az")];
            if declaration.delete {
                rsync.push(String::from("--delete"));
            }
            rsync.extend(
                declaration
                    .excludeds
                    .iter()
                    .map(|exclude| format!("--exclude {}", quote(exclude))),
            );
            rsync.push(format!("{}{suffix}", quote(&src)));
            rsync.push(format!("{}{suffix}", quote(&dst)));
            lines.push(rsync.join(" "));
        }

        lines.push(format!(
            "cp {} {}/",
            quote(&layout.build_info),
            quote(&layout.module_src)
        ));
        lines.push(format!(
            "rsync -az {} {}",
            quote(&layout.binary),
            quote(&layout.bin_path)
        ));
        lines.join("\n")
    }

    /// Signals the recorded process if it is still alive; an already dead
    /// process is not an error.
    #[must_use]
    pub fn kill_fragment(&self) -> String {
        let pid = quote(&self.layout.pid);
        format!(
            "if [ -f {pid} ]; then\n\
             \ttarget=$(cat {pid})\n\
             \tif ps -p \"$target\" > /dev/null 2>&1; then\n\
             \t\tkill -{sig} \"$target\" > /dev/null 2>&1 || true\n\
             \tfi\n\
             fi",
            sig = self.app.kill_sig
        )
    }

    /// Stops the old process and launches the binary detached, appending
    /// its output to the log and recording the new PID.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::InvalidEnvKey`] for an environment key that
    /// is not a shell identifier.
    pub fn restart_fragment(&self) -> Result<String, ScriptError> {
        let layout = &self.layout;
        let log = quote(&layout.log);
        let envs = self
            .launch_env()?
            .into_iter()
            .map(|(key, value)| format!("{key}={}", quote(&value)))
            .collect::<Vec<_>>()
            .join(" ");
        let mut launch = format!("{envs} nohup {}", quote(&layout.bin_path));
        for arg in &self.app.args {
            launch.push(' ');
            launch.push_str(&quote(arg));
        }

        Ok(format!(
            "{kill}\n\
             mkdir -p {log_dir}\n\
             touch {log}\n\
             cd {module_src}\n\
             echo \"[harp] $(date) server deployed/restarted\" >> {log}\n\
             {launch} >> {log} 2>&1 &\n\
             echo $! > {pid}\n\
             cd {home}",
            kill = self.kill_fragment(),
            log_dir = quote(&layout.log_dir),
            module_src = quote(&layout.module_src),
            pid = quote(&layout.pid),
            home = quote(&layout.home),
        ))
    }

    /// Environment for the launched process: the module root first, then
    /// the app map, then the server map. A later entry replaces the value of
    /// an earlier one with the same key, keeping the earlier position.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::InvalidEnvKey`] for a non-identifier key.
    pub fn launch_env(&self) -> Result<Vec<(String, String)>, ScriptError> {
        let mut merged: Vec<(String, String)> =
            vec![(String::from("GOPATH"), self.layout.gopath.clone())];
        let layers = self.app.envs.iter().chain(self.server.envs.iter());
        for (key, value) in layers {
            if !is_shell_identifier(key) {
                return Err(ScriptError::InvalidEnvKey { key: key.clone() });
            }
            if let Some(slot) = merged.iter_mut().find(|(existing, _)| existing == key) {
                slot.1.clone_from(value);
            } else {
                merged.push((key.clone(), value.clone()));
            }
        }
        Ok(merged)
    }

    /// `kill.sh` body.
    #[must_use]
    pub fn kill_script(&self) -> String {
        format!("set -e\n{}\n", self.kill_fragment())
    }

    /// `restart.sh` body, honouring an operator template.
    ///
    /// # Errors
    ///
    /// Returns environment and template rendering errors.
    pub fn restart_script(&self) -> Result<String, ScriptError> {
        let restart = self.restart_fragment()?;
        let default = format!("set -e\n{restart}\n");
        let Some(template) = self.templates.restart.as_ref() else {
            return Ok(default);
        };
        let mut vars = self.variables();
        vars.set("RestartServer", restart);
        vars.set("DefaultScript", default);
        template.render(&vars)
    }

    /// Deploy script: sync files, snapshot the release, restart. The order
    /// is fixed so the snapshot captures exactly what is about to run.
    ///
    /// `snapshot` is the release fragment; it is empty when rollback is
    /// disabled.
    ///
    /// # Errors
    ///
    /// Returns environment and template rendering errors.
    pub fn deploy_script(&self, snapshot: &str, release_id: &str) -> Result<String, ScriptError> {
        let sync = self.sync_files();
        let restart = self.restart_fragment()?;
        let default = format!("set -e\n{sync}\n{snapshot}\n{restart}\n");
        let Some(template) = self.templates.deploy.as_ref() else {
            return Ok(default);
        };
        let mut vars = self.variables();
        vars.set("SyncFiles", sync);
        vars.set("SaveRelease", snapshot);
        vars.set("RestartServer", restart);
        vars.set("ReleaseId", release_id);
        vars.set("DefaultScript", default);
        template.render(&vars)
    }

    /// `rollback.sh` body. Without an argument it lists the available
    /// releases and fails; with one it replaces every live entry present in
    /// that release, then re-syncs files and restarts.
    ///
    /// # Errors
    ///
    /// Returns environment errors from the restart fragment.
    pub fn rollback_script(&self) -> Result<String, ScriptError> {
        let layout = &self.layout;
        let releases = quote(&layout.releases_dir);
        let app_root = quote(&layout.app_root);
        Ok(format!(
            "set -e\n\
             version=\"$1\"\n\
             if [ -z \"$version\" ]; then\n\
             \techo \"please specify version in the following list to rollback:\"\n\
             \tls -1 {releases}\n\
             \texit 1\n\
             fi\n\
             if [ ! -d {releases}/\"$version\" ]; then\n\
             \techo \"release $version not found in {releases_text}\"\n\
             \texit 1\n\
             fi\n\
             for file in $(ls {releases}/\"$version\"); do\n\
             \trm -rf {app_root}/\"$file\"\n\
             \tcp -rf {releases}/\"$version\"/\"$file\" {app_root}/\"$file\"\n\
             done\n\
             {sync}\n\
             {restart}\n",
            releases_text = layout.releases_dir,
            sync = self.sync_files(),
            restart = self.restart_fragment()?,
        ))
    }

    /// Variables shared by every template kind: flat names such as
    /// `AppName` and `Host`, plus `App` and `Server` maps.
    #[must_use]
    pub fn variables(&self) -> TemplateVars {
        let layout = &self.layout;
        let server = self.server;
        let server_id = server.id.clone().unwrap_or_default();
        let mut vars = TemplateVars::default();
        for (name, value) in [
            ("AppName", self.app.name.as_str()),
            ("ImportPath", self.app.import_path.as_str()),
            ("Home", layout.home.as_str()),
            ("GoPath", layout.gopath.as_str()),
            ("AppRoot", layout.app_root.as_str()),
            ("LogDir", layout.log_dir.as_str()),
            ("LogPath", layout.log.as_str()),
            ("PidPath", layout.pid.as_str()),
            ("User", server.user.as_str()),
            ("Host", server.host.as_str()),
            ("ServerId", server_id.as_str()),
            ("Set", server.set.as_str()),
        ] {
            vars.set(name, value);
        }
        vars.set("Port", server.port);
        vars.set_map(
            "App",
            &BTreeMap::from([
                ("Name", Value::from(self.app.name.as_str())),
                ("ImportPath", Value::from(self.app.import_path.as_str())),
                ("KillSig", Value::from(self.app.kill_sig.as_str())),
                ("Args", Value::from_serialize(&self.app.args)),
                ("Envs", Value::from_serialize(&self.app.envs)),
            ]),
        );
        vars.set_map(
            "Server",
            &BTreeMap::from([
                ("Home", Value::from(layout.home.as_str())),
                ("GoPath", Value::from(layout.gopath.as_str())),
                ("User", Value::from(server.user.as_str())),
                ("Host", Value::from(server.host.as_str())),
                ("Port", Value::from(server.port)),
                ("ID", Value::from(server_id.as_str())),
                ("Set", Value::from(server.set.as_str())),
                ("Envs", Value::from_serialize(&server.envs)),
            ]),
        );
        vars.set("SyncFiles", self.sync_files());
        vars.set("KillServer", self.kill_fragment());
        vars
    }
}

/// Command writing `content` to `target` on the host through a heredoc with
/// a quoted delimiter, so the content is not expanded. `mode` is applied
/// with `chmod` when given.
///
/// # Errors
///
/// Returns [`ScriptError::DelimiterCollision`] when `content` contains the
/// delimiter line.
pub fn write_file_command(
    target: &str,
    content: &str,
    mode: Option<&str>,
) -> Result<String, ScriptError> {
    if content.lines().any(|line| line == HEREDOC_DELIMITER) {
        return Err(ScriptError::DelimiterCollision {
            target: target.to_owned(),
        });
    }
    let target_quoted = quote(target);
    let chmod = mode
        .map(|bits| format!("\nchmod {bits} {target_quoted}"))
        .unwrap_or_default();
    Ok(format!(
        "cat > {target_quoted} <<'{HEREDOC_DELIMITER}'\n{}\n{HEREDOC_DELIMITER}{chmod}",
        content.trim_end_matches('\n')
    ))
}

/// Quotes `value` for a POSIX shell when needed.
#[must_use]
pub fn quote(value: &str) -> String {
    escape(value.into()).into_owned()
}

/// `KEY=value` with the value quoted for the shell.
///
/// # Errors
///
/// Returns [`ScriptError::InvalidEnvKey`] when `key` is not a shell
/// identifier.
pub fn env_assignment(key: &str, value: &str) -> Result<String, ScriptError> {
    if !is_shell_identifier(key) {
        return Err(ScriptError::InvalidEnvKey {
            key: key.to_owned(),
        });
    }
    Ok(format!("{key}={}", quote(value)))
}

fn is_shell_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
