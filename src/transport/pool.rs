//! Per-process registry of established connections and discovered paths.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use super::{CommandOutput, CommandRunner, Connection, TransportError, TransportOptions};
use crate::server::Server;

/// Remote directories resolved once per host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemotePaths {
    /// Remote home directory.
    pub home: String,
    /// Remote module root (`$GOPATH`, else home).
    pub gopath: String,
}

/// One host's connection, filled by whichever caller dials first.
type ConnectionSlot = Arc<Mutex<Option<Arc<Connection>>>>;

/// Connections keyed by host identity, established on first use.
///
/// The pool owns the command runner so every SSH, rsync, and scp call of a
/// run goes through one seam.
#[derive(Debug)]
pub struct ConnectionPool<R: CommandRunner> {
    runner: R,
    options: Arc<TransportOptions>,
    connections: Mutex<HashMap<String, ConnectionSlot>>,
    paths: Mutex<HashMap<String, RemotePaths>>,
}

impl<R: CommandRunner> ConnectionPool<R> {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(runner: R, options: TransportOptions) -> Self {
        Self {
            runner,
            options: Arc::new(options),
            connections: Mutex::new(HashMap::new()),
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Transport options shared by the pool's connections.
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Underlying command runner, for local commands that belong to the same
    /// run (builds, archives).
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Returns the cached connection for `server`, establishing it (and its
    /// proxy first) when absent.
    ///
    /// Concurrent callers for the same host wait on that host's slot, so a
    /// host is dialled at most once per pool.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] naming the hop that could not be
    /// dialled or authenticated.
    pub fn connect(&self, server: &Server) -> Result<Arc<Connection>, TransportError> {
        let slot = Arc::clone(self.lock_connections().entry(server.key()).or_default());
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = cached.as_ref() {
            return Ok(Arc::clone(existing));
        }

        let via = match server.proxy.as_deref() {
            Some(proxy) => Some(self.connect(proxy)?),
            None => None,
        };
        let connection = Arc::new(Connection::new(
            server.endpoint(),
            via,
            Arc::clone(&self.options),
        ));
        self.establish(&connection)?;
        *cached = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Runs `command` on the host and returns its output whatever the exit
    /// status.
    ///
    /// # Errors
    ///
    /// Returns connection failures and spawn failures.
    pub fn run(&self, server: &Server, command: &str) -> Result<CommandOutput, TransportError> {
        let connection = self.connect(server)?;
        debug!(host = %server.key(), command, "running remote command");
        self.runner
            .run(&self.options.ssh_bin, &connection.ssh_args(command))
    }

    /// Runs `command` and returns its combined output, failing on a non-zero
    /// exit status.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CommandFailure`] carrying the combined
    /// output when the remote command fails.
    pub fn run_checked(&self, server: &Server, command: &str) -> Result<String, TransportError> {
        let output = self.run(server, command)?;
        Self::check(&self.options.ssh_bin, server, output)
    }

    /// Resolves the remote home and module root, once per host.
    ///
    /// Descriptor overrides win; otherwise the home is `$HOME`, falling back
    /// to the login directory, and the module root is `$GOPATH`, falling
    /// back to the home.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Discovery`] when no home can be determined.
    pub fn paths(&self, server: &Server) -> Result<RemotePaths, TransportError> {
        let key = server.key();
        if let Some(cached) = self.lock_paths().get(&key) {
            return Ok(cached.clone());
        }

        let resolved = if let (Some(home), Some(gopath)) = (&server.home, &server.gopath) {
            RemotePaths {
                home: home.clone(),
                gopath: gopath.clone(),
            }
        } else {
            self.discover_paths(server)?
        };

        self.lock_paths().insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Mirrors local `sources` into `remote_dir` on the host with
    /// `rsync -az --delete`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CommandFailure`] when rsync fails.
    pub fn upload(
        &self,
        server: &Server,
        sources: &[Utf8PathBuf],
        remote_dir: &str,
    ) -> Result<(), TransportError> {
        let connection = self.connect(server)?;
        let mut args = vec![
            OsString::from("-az"),
            OsString::from("--delete"),
            OsString::from("-e"),
            OsString::from(connection.remote_shell()),
        ];
        args.extend(sources.iter().map(|source| OsString::from(source.as_str())));
        args.push(OsString::from(connection.remote_target(remote_dir)));

        debug!(host = %server.key(), remote_dir, "uploading staged artifacts");
        let output = self.runner.run(&self.options.rsync_bin, &args)?;
        Self::check(&self.options.rsync_bin, server, output)
            .map(|_| ())
    }

    /// Copies one local file to `remote_path` on the host with scp.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CommandFailure`] when scp fails.
    pub fn copy_file(
        &self,
        server: &Server,
        local: &Utf8Path,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        let connection = self.connect(server)?;
        let output = self
            .runner
            .run(&self.options.scp_bin, &connection.scp_args(local, remote_path))?;
        Self::check(&self.options.scp_bin, server, output)
            .map(|_| ())
    }

    /// Asks every control master to exit. Failures are logged, not returned,
    /// since teardown runs after results have been reported.
    pub fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = self
            .lock_connections()
            .drain()
            .filter_map(|(_, slot)| slot.lock().unwrap_or_else(PoisonError::into_inner).take())
            .collect();
        for connection in connections {
            let Some(args) = connection.exit_master_args() else {
                continue;
            };
            match self.runner.run(&self.options.ssh_bin, &args) {
                Ok(output) if output.is_success() => {}
                Ok(output) => {
                    debug!(host = %connection.endpoint(), stderr = %output.stderr.trim(), "control master already gone");
                }
                Err(err) => warn!(host = %connection.endpoint(), "failed to close control master: {err}"),
            }
        }
    }

    fn establish(&self, connection: &Connection) -> Result<(), TransportError> {
        let output = self
            .runner
            .run(&self.options.ssh_bin, &connection.ssh_args("true"))?;
        if output.is_success() {
            return Ok(());
        }
        Err(TransportError::Connect {
            hop: connection.endpoint().to_string(),
            via: connection.via().map(|via| via.endpoint().to_string()),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    fn discover_paths(&self, server: &Server) -> Result<RemotePaths, TransportError> {
        let output = self.run_checked(server, "echo \"$HOME\"; echo \"$GOPATH\"; pwd")?;
        let mut lines = output.lines().map(str::trim);
        let env_home = lines.next().unwrap_or_default();
        let env_gopath = lines.next().unwrap_or_default();
        let login_dir = lines.next().unwrap_or_default();

        let home = server
            .home
            .clone()
            .or_else(|| non_empty(env_home))
            .or_else(|| non_empty(login_dir))
            .ok_or_else(|| TransportError::Discovery { host: server.key() })?;
        let gopath = server
            .gopath
            .clone()
            .or_else(|| non_empty(env_gopath))
            .unwrap_or_else(|| home.clone());
        Ok(RemotePaths { home, gopath })
    }

    fn check(
        program: &str,
        server: &Server,
        output: CommandOutput,
    ) -> Result<String, TransportError> {
        if output.is_success() {
            return Ok(output.combined());
        }
        Err(TransportError::CommandFailure {
            program: program.to_owned(),
            host: server.key(),
            status: output.code,
            status_text: output.status_text(),
            output: output.combined(),
        })
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConnectionSlot>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_paths(&self) -> std::sync::MutexGuard<'_, HashMap<String, RemotePaths>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}
