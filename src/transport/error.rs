//! Transport failures.

use thiserror::Error;

/// Errors surfaced while connecting to hosts or running remote commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when a local program cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when dialling or authenticating a hop fails.
    #[error(
        "failed to connect to {hop}{via}: exit status {status_text}: {stderr}\n\
         harp authenticates through ssh-agent; check `ssh-add -l` lists your key",
        via = via.as_ref().map(|proxy| format!(" via {proxy}")).unwrap_or_default()
    )]
    Connect {
        /// Endpoint of the hop that failed.
        hop: String,
        /// Proxy the hop was tunnelled through, if any.
        via: Option<String>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the SSH client.
        stderr: String,
    },
    /// Raised when a remote or local command exits with a non-zero status.
    #[error("{program} on {host} exited with status {status_text}: {output}")]
    CommandFailure {
        /// Program used for the attempted operation.
        program: String,
        /// Host the command targeted.
        host: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Combined output captured from the command.
        output: String,
    },
    /// Raised when the remote home directory cannot be discovered.
    #[error("could not discover home directory on {host}")]
    Discovery {
        /// Host that returned no usable paths.
        host: String,
    },
}
