//! Live log tailing across hosts.
//!
//! Each host streams `tail -f` over its own SSH session. Output is buffered
//! per host and released in batches, either when a batch grows past a size
//! threshold or on a periodic flush. Batches from all hosts are interleaved
//! into one stream, with a host banner printed only when the host changes.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::App;
use crate::script::{RemoteLayout, quote};
use crate::server::Server;
use crate::transport::{CommandRunner, ConnectionPool, TransportError};

/// Bytes buffered per host before a batch is released early.
pub const FLUSH_THRESHOLD: usize = 1024;

/// Period after which buffered output is released regardless of size.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Lines of history printed when tailing starts.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Separator printed above a host label.
pub const BANNER: &str = "========================";

const READ_CHUNK: usize = 4096;

/// Errors raised while tailing logs.
#[derive(Debug, Error)]
pub enum LogError {
    /// Writing interleaved output failed.
    #[error("failed to write log output: {0}")]
    Output(#[source] io::Error),
    /// No host produced a log stream.
    #[error("no log stream could be started")]
    NoStreams,
}

/// Buffered output of one host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogBatch {
    /// Host label the output belongs to.
    pub label: String,
    /// Raw output bytes.
    pub data: Vec<u8>,
}

/// Accumulates one host's output until a batch is due.
#[derive(Debug)]
pub struct HostLogBuffer {
    label: String,
    pending: Vec<u8>,
    threshold: usize,
}

impl HostLogBuffer {
    /// Creates an empty buffer releasing batches of at least `threshold`
    /// bytes.
    #[must_use]
    pub fn new(label: impl Into<String>, threshold: usize) -> Self {
        Self {
            label: label.into(),
            pending: Vec::new(),
            threshold,
        }
    }

    /// Appends output; returns a batch once the threshold is reached.
    pub fn push(&mut self, data: &[u8]) -> Option<LogBatch> {
        self.pending.extend_from_slice(data);
        if self.pending.len() < self.threshold {
            return None;
        }
        self.flush()
    }

    /// Releases whatever is buffered.
    pub fn flush(&mut self) -> Option<LogBatch> {
        if self.pending.is_empty() {
            return None;
        }
        Some(LogBatch {
            label: self.label.clone(),
            data: std::mem::take(&mut self.pending),
        })
    }
}

/// Writes batches from many hosts into one stream.
#[derive(Debug)]
pub struct Interleaver<W> {
    out: W,
    current: Option<String>,
}

impl<W: Write> Interleaver<W> {
    /// Wraps `out`.
    pub const fn new(out: W) -> Self {
        Self { out, current: None }
    }

    /// Writes `batch`, preceded by the host banner when the host differs
    /// from the previous batch's.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn write_batch(&mut self, batch: &LogBatch) -> io::Result<()> {
        if self.current.as_deref() != Some(batch.label.as_str()) {
            writeln!(self.out, "{BANNER}\n{}", batch.label)?;
            self.current = Some(batch.label.clone());
        }
        self.out.write_all(&batch.data)?;
        if !batch.data.ends_with(b"\n") {
            writeln!(self.out)?;
        }
        self.out.flush()
    }

    /// Returns the wrapped writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads `reader` to the end, forwarding batches for `label` as they fall
/// due. Stops early when the receiving side has gone away.
///
/// # Errors
///
/// Propagates read failures.
pub async fn pump<Rd>(
    label: String,
    mut reader: Rd,
    batches: mpsc::Sender<LogBatch>,
    interval: Duration,
) -> io::Result<()>
where
    Rd: AsyncRead + Unpin,
{
    let mut buffer = HostLogBuffer::new(label, FLUSH_THRESHOLD);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut chunk = vec![0_u8; READ_CHUNK];

    loop {
        let due = tokio::select! {
            read = reader.read(&mut chunk) => {
                let count = read?;
                if count == 0 {
                    break;
                }
                buffer.push(chunk.get(..count).unwrap_or_default())
            }
            _ = ticker.tick() => buffer.flush(),
        };
        if let Some(batch) = due {
            if batches.send(batch).await.is_err() {
                return Ok(());
            }
        }
    }

    if let Some(batch) = buffer.flush() {
        if batches.send(batch).await.is_err() {
            debug!("log receiver closed before final flush");
        }
    }
    Ok(())
}

/// Tails the application log on every host.
#[derive(Debug)]
pub struct LogMultiplexer<R: CommandRunner> {
    pool: Arc<ConnectionPool<R>>,
    app: App,
    lines: usize,
    interval: Duration,
}

impl<R: CommandRunner + 'static> LogMultiplexer<R> {
    /// Creates a multiplexer starting each tail `lines` lines back.
    #[must_use]
    pub const fn new(pool: Arc<ConnectionPool<R>>, app: App, lines: usize) -> Self {
        Self {
            pool,
            app,
            lines,
            interval: FLUSH_INTERVAL,
        }
    }

    /// Remote tail command for `server`'s log.
    ///
    /// # Errors
    ///
    /// Returns path discovery failures.
    pub fn tail_command(&self, server: &Server) -> Result<String, TransportError> {
        tail_command(&self.pool, &self.app, self.lines, server)
    }

    /// Streams every host's log into `out` until all streams end or the
    /// future is dropped; dropping it stops the remote tails.
    ///
    /// A host whose stream cannot be started is skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NoStreams`] when no host could be tailed, or
    /// [`LogError::Output`] when writing fails.
    pub async fn tail<W: Write>(&self, servers: &[Server], out: W) -> Result<(), LogError> {
        let (sender, mut receiver) = mpsc::channel(64);
        let mut pumps = JoinSet::new();
        let mut children = Vec::new();

        for (label, started) in self.open_streams(servers).await {
            let mut command = match started {
                Ok(command) => command,
                Err(err) => {
                    warn!(host = %label, "cannot tail log: {err}");
                    continue;
                }
            };
            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(err) => {
                    warn!(host = %label, "cannot start tail: {err}");
                    continue;
                }
            };
            if let Some(stdout) = child.stdout.take() {
                pumps.spawn(pump(label.clone(), stdout, sender.clone(), self.interval));
            }
            if let Some(stderr) = child.stderr.take() {
                pumps.spawn(pump(label.clone(), stderr, sender.clone(), self.interval));
            }
            info!(host = %label, "tailing log");
            children.push(child);
        }
        drop(sender);
        if children.is_empty() {
            return Err(LogError::NoStreams);
        }

        let mut interleaver = Interleaver::new(out);
        while let Some(batch) = receiver.recv().await {
            interleaver.write_batch(&batch).map_err(LogError::Output)?;
        }
        while let Some(joined) = pumps.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("log stream failed: {err}"),
                Err(err) => warn!("log pump did not complete: {err}"),
            }
        }
        Ok(())
    }

    /// Connects to every host and builds its tail command. Connecting
    /// blocks on SSH, so each host runs on the blocking pool. Results keep
    /// server order.
    async fn open_streams(
        &self,
        servers: &[Server],
    ) -> Vec<(String, Result<Command, TransportError>)> {
        let mut tasks = JoinSet::new();
        for (index, server) in servers.iter().cloned().enumerate() {
            let pool = Arc::clone(&self.pool);
            let app = self.app.clone();
            let lines = self.lines;
            tasks.spawn_blocking(move || {
                let started = tail_command(&pool, &app, lines, &server).and_then(|command| {
                    let connection = pool.connect(&server)?;
                    Ok(connection.streaming_command(&command))
                });
                (index, server.label(), started)
            });
        }

        let mut opened = Vec::with_capacity(servers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(stream) => opened.push(stream),
                Err(err) => warn!("log stream setup did not complete: {err}"),
            }
        }
        opened.sort_by_key(|(index, _, _)| *index);
        opened
            .into_iter()
            .map(|(_, label, started)| (label, started))
            .collect()
    }
}

fn tail_command<R: CommandRunner>(
    pool: &ConnectionPool<R>,
    app: &App,
    lines: usize,
    server: &Server,
) -> Result<String, TransportError> {
    let paths = pool.paths(server)?;
    let layout = RemoteLayout::new(app, server, &paths);
    Ok(format!("tail -f -n {lines} {}", quote(&layout.log)))
}
