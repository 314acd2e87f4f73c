//! Release snapshots and retention.
//!
//! A release is a timestamped copy of what a host was running, taken during
//! deploy after files are synced and before the process restarts. Ids sort
//! lexicographically in chronological order, so retention only needs a
//! string sort.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, info};

use crate::config::App;
use crate::script::{RemoteLayout, quote};
use crate::server::Server;
use crate::transport::{CommandRunner, ConnectionPool, TransportError};

/// `chrono` format of release ids: two-digit year first so byte order is
/// time order.
pub const RELEASE_ID_FORMAT: &str = "%y-%m-%d-%H:%M:%S";

/// Name of one release directory.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ReleaseId(String);

impl ReleaseId {
    /// Formats `time` as a release id.
    #[must_use]
    pub fn from_time<Tz: TimeZone>(time: &DateTime<Tz>) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self(time.format(RELEASE_ID_FORMAT).to_string())
    }

    /// Id as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out one release id per run; every host deployed by the run shares
/// it.
#[derive(Debug, Default)]
pub struct ReleaseClock {
    id: OnceLock<ReleaseId>,
}

impl ReleaseClock {
    /// A clock that stamps the first request with the local time.
    #[must_use]
    pub const fn new() -> Self {
        Self { id: OnceLock::new() }
    }

    /// A clock pinned to `id`.
    #[must_use]
    pub fn fixed(id: ReleaseId) -> Self {
        let clock = Self::new();
        clock.id.get_or_init(|| id);
        clock
    }

    /// The run's release id, computed on first use.
    #[must_use]
    pub fn release_id(&self) -> &ReleaseId {
        self.id
            .get_or_init(|| ReleaseId::from_time(&Local::now()))
    }
}

/// Shell fragment saving the current deployment as release `id`.
///
/// Only hosts that already carry a build-info marker have something worth
/// saving; on a first deploy the fragment does nothing.
#[must_use]
pub fn snapshot_script(layout: &RemoteLayout, app: &App, id: &ReleaseId) -> String {
    let target = quote(&format!("releases/{id}"));
    format!(
        "cd {root}\n\
         if [ -f harp-build.info ]; then\n\
         \tmkdir -p {target}\n\
         \tcp -rf {binary} harp-build.info files kill.sh restart.sh rollback.sh {target}\n\
         fi",
        root = quote(&layout.app_root),
        binary = quote(&app.name),
    )
}

/// Releases to delete so that only the newest `keep` remain, oldest first.
#[must_use]
pub fn releases_to_trim(existing: &[String], keep: usize) -> Vec<String> {
    let mut releases: Vec<&str> = existing
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .collect();
    releases.sort_unstable();
    releases.dedup();
    let excess = releases.len().saturating_sub(keep);
    releases
        .into_iter()
        .take(excess)
        .map(str::to_owned)
        .collect()
}

/// Lists and trims the releases of one app on its hosts.
#[derive(Debug)]
pub struct ReleaseManager<'a, R: CommandRunner> {
    pool: &'a ConnectionPool<R>,
    layout: &'a RemoteLayout,
}

impl<'a, R: CommandRunner> ReleaseManager<'a, R> {
    /// Creates a manager for the host whose layout is `layout`.
    #[must_use]
    pub const fn new(pool: &'a ConnectionPool<R>, layout: &'a RemoteLayout) -> Self {
        Self { pool, layout }
    }

    /// Release ids present on the host, in listing order. A host that never
    /// saved a release has none.
    ///
    /// # Errors
    ///
    /// Returns transport failures.
    pub fn list(&self, server: &Server) -> Result<Vec<String>, TransportError> {
        let command = format!(
            "ls -1 {} 2>/dev/null || true",
            quote(&self.layout.releases_dir)
        );
        let output = self.pool.run_checked(server, &command)?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Deletes all but the newest `retention` releases and returns the ids
    /// removed. `None` means rollback is disabled and nothing is touched.
    ///
    /// Call only after a successful deploy so a failed one never destroys
    /// the rollback target.
    ///
    /// # Errors
    ///
    /// Returns transport failures from listing or removal.
    pub fn trim(
        &self,
        server: &Server,
        retention: Option<usize>,
    ) -> Result<Vec<String>, TransportError> {
        let Some(keep) = retention else {
            return Ok(Vec::new());
        };
        let stale = releases_to_trim(&self.list(server)?, keep);
        if stale.is_empty() {
            debug!(host = %server.key(), "no releases to trim");
            return Ok(stale);
        }

        let targets: Vec<String> = stale
            .iter()
            .map(|id| quote(&format!("{}/{id}", self.layout.releases_dir)))
            .collect();
        self.pool
            .run_checked(server, &format!("rm -rf {}", targets.join(" ")))?;
        info!(host = %server.key(), removed = stale.len(), "trimmed old releases");
        Ok(stale)
    }
}

#[cfg(test)]
mod tests;
