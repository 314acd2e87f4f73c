//! One blocking task per host, joined before the action completes.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use super::HostError;
use crate::server::Server;

/// Result of one host's unit of work.
#[derive(Debug)]
pub struct HostOutcome {
    /// Host the work ran against.
    pub server: Server,
    /// Output on success, the failure otherwise.
    pub result: Result<String, HostError>,
}

/// Runs `work` once per server concurrently and waits for every task.
///
/// A failing or panicking host never cancels its siblings. Outcomes come
/// back in server order, whatever order the tasks finished in.
pub async fn fan_out<F>(servers: &[Server], work: F) -> Vec<HostOutcome>
where
    F: Fn(&Server) -> Result<String, HostError> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let mut tasks = JoinSet::new();
    for (index, server) in servers.iter().cloned().enumerate() {
        let task_work = Arc::clone(&work);
        tasks.spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| task_work(&server)))
                .unwrap_or_else(|_| {
                    Err(HostError::Panicked {
                        host: server.label(),
                    })
                });
            (index, result)
        });
    }

    let mut results: Vec<Option<Result<String, HostError>>> =
        servers.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                if let Some(slot) = results.get_mut(index) {
                    *slot = Some(result);
                }
            }
            Err(err) => warn!("host task did not complete: {err}"),
        }
    }

    servers
        .iter()
        .cloned()
        .zip(results)
        .map(|(server, slot)| {
            let result = slot.unwrap_or_else(|| {
                Err(HostError::Cancelled {
                    host: server.label(),
                })
            });
            HostOutcome { server, result }
        })
        .collect()
}
