//! Per-host report of one dispatched action.

use std::io::{self, Write};

use super::HostOutcome;

/// Outcomes of one action across every selected host, in selection order.
#[derive(Debug)]
pub struct DispatchReport {
    verb: &'static str,
    outcomes: Vec<HostOutcome>,
}

impl DispatchReport {
    /// Wraps the outcomes of `verb`.
    #[must_use]
    pub const fn new(verb: &'static str, outcomes: Vec<HostOutcome>) -> Self {
        Self { verb, outcomes }
    }

    /// Every host outcome.
    #[must_use]
    pub fn outcomes(&self) -> &[HostOutcome] {
        &self.outcomes
    }

    /// Hosts whose work failed.
    pub fn failures(&self) -> impl Iterator<Item = &HostOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }

    /// `true` when every host succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Writes one status line per host, followed by any output the host
    /// produced, and a closing tally.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn write_to(&self, mut out: impl Write) -> io::Result<()> {
        for outcome in &self.outcomes {
            let label = outcome.server.label();
            match &outcome.result {
                Ok(output) => {
                    writeln!(out, "{label} {}: ok", self.verb)?;
                    write_body(&mut out, output)?;
                }
                Err(err) => {
                    writeln!(out, "{label} {}: failed", self.verb)?;
                    write_body(&mut out, &err.to_string())?;
                }
            }
        }
        let failed = self.failures().count();
        writeln!(
            out,
            "{}: {} succeeded, {failed} failed",
            self.verb,
            self.outcomes.len().saturating_sub(failed)
        )
    }
}

fn write_body(out: &mut impl Write, body: &str) -> io::Result<()> {
    let trimmed = body.trim_end();
    if trimmed.is_empty() {
        return Ok(());
    }
    writeln!(out, "{trimmed}")
}
