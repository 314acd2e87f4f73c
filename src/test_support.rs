//! Test support utilities shared across unit and integration tests.

use std::collections::BTreeSet;
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, MutexGuard};

use crate::transport::{CommandOutput, CommandRunner, TransportError};

/// Scripted command runner answering by rule instead of by call order.
///
/// Per-host work runs concurrently, so responses are matched against the
/// rendered command line: the first rule whose needle is a substring of the
/// command wins, and commands without a matching rule succeed with empty
/// output. Every invocation is recorded.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<std::sync::Mutex<RunnerState>>,
}

#[derive(Debug, Default)]
struct RunnerState {
    rules: Vec<Rule>,
    invocations: Vec<CommandInvocation>,
}

#[derive(Clone, Debug)]
struct Rule {
    needles: Vec<String>,
    output: CommandOutput,
}

impl Rule {
    fn matches(&self, command: &str) -> bool {
        self.needles.iter().all(|needle| command.contains(needle.as_str()))
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a runner where every command succeeds silently.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands containing every needle with `output`.
    pub fn on(&self, needles: &[&str], output: CommandOutput) {
        self.lock().rules.push(Rule {
            needles: needles.iter().map(|needle| (*needle).to_owned()).collect(),
            output,
        });
    }

    /// Answers matching commands with a successful exit and `stdout`.
    pub fn respond(&self, needles: &[&str], stdout: impl Into<String>) {
        self.on(
            needles,
            CommandOutput {
                code: Some(0),
                stdout: stdout.into(),
                stderr: String::new(),
            },
        );
    }

    /// Fails matching commands with `code` and `stderr`.
    pub fn fail(&self, needles: &[&str], code: i32, stderr: impl Into<String>) {
        self.on(
            needles,
            CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.into(),
            },
        );
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.lock().invocations.clone()
    }

    /// Rendered command lines of all invocations so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Rendered command lines containing every needle.
    #[must_use]
    pub fn commands_matching(&self, needles: &[&str]) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|command| needles.iter().all(|needle| command.contains(needle)))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, TransportError> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        let command = invocation.command_string();
        let mut state = self.lock();
        state.invocations.push(invocation);
        Ok(state
            .rules
            .iter()
            .find(|rule| rule.matches(&command))
            .map_or_else(
                || CommandOutput {
                    code: Some(0),
                    ..CommandOutput::default()
                },
                |rule| rule.output.clone(),
            ))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
