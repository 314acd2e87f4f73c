//! Interactive command broadcast.
//!
//! Every input line runs on all hosts at once. Execution is concurrent but
//! printing is not: each host's result is written as one block while holding
//! the output lock, so blocks never interleave. Blocks appear in completion
//! order.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

use crate::dispatch::{HostError, HostOutcome, fan_out};
use crate::server::Server;
use crate::transport::{CommandRunner, ConnectionPool};

const IDENTITY_COMMAND: &str = "echo \"$(whoami)@$(hostname):$HOME\"";

/// Broadcasts input lines to a set of hosts.
#[derive(Debug)]
pub struct Console<R: CommandRunner> {
    pool: Arc<ConnectionPool<R>>,
    prompts: BTreeMap<String, String>,
}

impl<R: CommandRunner + 'static> Console<R> {
    /// Creates a console whose blocks are headed by each host's label.
    #[must_use]
    pub const fn new(pool: Arc<ConnectionPool<R>>) -> Self {
        Self {
            pool,
            prompts: BTreeMap::new(),
        }
    }

    /// Replaces host labels in block headers with `user@hostname:home`
    /// as reported by each host. Hosts that cannot answer keep their label.
    pub async fn identify(&mut self, servers: &[Server]) {
        let pool = Arc::clone(&self.pool);
        let outcomes = fan_out(servers, move |server| {
            Ok(pool.run_checked(server, IDENTITY_COMMAND)?.trim().to_owned())
        })
        .await;
        for outcome in outcomes {
            match outcome.result {
                Ok(identity) if !identity.is_empty() => {
                    self.prompts.insert(outcome.server.key(), identity);
                }
                Ok(_) => {}
                Err(err) => warn!(host = %outcome.server.label(), "cannot identify host: {err}"),
            }
        }
    }

    /// Header line of a host's block.
    #[must_use]
    pub fn prompt(&self, server: &Server) -> String {
        let identity = self
            .prompts
            .get(&server.key())
            .cloned()
            .unwrap_or_else(|| server.label());
        format!("{identity}$")
    }

    /// Runs `line` on every host, printing each result as one block into
    /// `out` as soon as that host finishes.
    pub async fn broadcast<W>(
        &self,
        servers: &[Server],
        line: &str,
        out: &Arc<Mutex<W>>,
    ) -> Vec<HostOutcome>
    where
        W: Write + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        let writer = Arc::clone(out);
        let command = line.to_owned();
        let prompts: BTreeMap<String, String> = servers
            .iter()
            .map(|server| (server.key(), self.prompt(server)))
            .collect();

        fan_out(servers, move |server| {
            let result = pool
                .run_checked(server, &command)
                .map_err(HostError::from);
            let body = match &result {
                Ok(output) => output.clone(),
                Err(err) => format!("{err}\n"),
            };
            let header = prompts
                .get(&server.key())
                .cloned()
                .unwrap_or_else(|| server.label());
            let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = write_block(&mut *guard, &header, &command, &body) {
                warn!(host = %server.label(), "failed to print console output: {err}");
            }
            result
        })
        .await
    }

    /// Reads lines from `input` until it ends, broadcasting each non-blank
    /// line.
    ///
    /// # Errors
    ///
    /// Propagates read failures on `input`.
    pub async fn run<In, W>(
        &self,
        servers: &[Server],
        input: In,
        out: &Arc<Mutex<W>>,
    ) -> io::Result<()>
    where
        In: AsyncBufRead + Unpin,
        W: Write + Send + 'static,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            self.broadcast(servers, command, out).await;
        }
        Ok(())
    }
}

fn write_block(out: &mut impl Write, header: &str, command: &str, body: &str) -> io::Result<()> {
    let mut block = format!("{header} {command}\n");
    if !body.trim().is_empty() {
        block.push_str(body);
        if !body.ends_with('\n') {
            block.push('\n');
        }
    }
    out.write_all(block.as_bytes())?;
    out.flush()
}
