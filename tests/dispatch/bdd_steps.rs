//! BDD step definitions for dispatch behaviour.

use harp::{Action, DispatchError};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{DispatchContext, MARKER_READ, RELEASE_LIST, SNAPSHOT, host, names};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("\"{count}\" hosts in set \"{set}\"")]
fn hosts_in_set(dispatch_context: &DispatchContext, count: usize, set: String) {
    dispatch_context.state().hosts = (1..=count)
        .map(|index| host(&format!("h{index}"), &set))
        .collect();
}

#[given("hosts \"{list}\" cannot prepare the app directory")]
fn hosts_cannot_prepare(dispatch_context: &DispatchContext, list: String) {
    for name in names(&list) {
        dispatch_context.runner.fail(
            &[&format!("app@{name}"), "mkdir -p /home/app/harp/app/files"],
            1,
            "No space left on device",
        );
    }
}

#[given("host \"{name}\" was deployed by harp \"{version}\"")]
fn host_deployed_by(dispatch_context: &DispatchContext, name: String, version: String) {
    dispatch_context.runner.respond(
        &[&format!("app@{name}"), MARKER_READ],
        format!("Harp Version: {version}\nBuild At: 2025-01-01 00:00:00\n"),
    );
}

#[given("force is enabled")]
fn force_enabled(dispatch_context: &DispatchContext) {
    dispatch_context.state().options.force = true;
}

#[when("I deploy to every host")]
fn deploy_everywhere(dispatch_context: &DispatchContext) -> Result<(), StepError> {
    dispatch_context.run(Action::Deploy)?;
    Ok(())
}

#[when("I restart every host")]
fn restart_everywhere(dispatch_context: &DispatchContext) -> Result<(), StepError> {
    dispatch_context.run(Action::Restart)?;
    Ok(())
}

#[then("the report lists \"{count}\" outcomes")]
fn report_lists(dispatch_context: &DispatchContext, count: usize) -> Result<(), StepError> {
    let listed = dispatch_context.state().results.len();
    if listed == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} outcomes, got {listed}"
        )))
    }
}

#[then("hosts \"{list}\" completed the deploy")]
fn hosts_completed_deploy(dispatch_context: &DispatchContext, list: String) -> Result<(), StepError> {
    for name in names(&list) {
        for step in [SNAPSHOT, RELEASE_LIST] {
            if !dispatch_context.ran(&name, step) {
                return Err(StepError::Assertion(format!(
                    "{name} never ran a command containing {step:?}"
                )));
            }
        }
    }
    hosts_with_result(dispatch_context, &list, true)
}

#[then("hosts \"{list}\" succeeded")]
fn hosts_succeeded(dispatch_context: &DispatchContext, list: String) -> Result<(), StepError> {
    hosts_with_result(dispatch_context, &list, true)
}

#[then("hosts \"{list}\" failed")]
fn hosts_failed(dispatch_context: &DispatchContext, list: String) -> Result<(), StepError> {
    for name in names(&list) {
        if dispatch_context.ran(&name, SNAPSHOT) {
            return Err(StepError::Assertion(format!(
                "failed host {name} should not reach the deploy script"
            )));
        }
    }
    hosts_with_result(dispatch_context, &list, false)
}

#[then("the report ends with \"{summary}\"")]
fn report_ends_with(dispatch_context: &DispatchContext, summary: String) -> Result<(), StepError> {
    let report = dispatch_context.state().report.clone();
    if report.trim_end().ends_with(&summary) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "report should end with {summary:?}:\n{report}"
        )))
    }
}

fn hosts_with_result(
    dispatch_context: &DispatchContext,
    list: &str,
    succeeded: bool,
) -> Result<(), StepError> {
    let state = dispatch_context.state();
    for name in names(list) {
        let result = state
            .results
            .iter()
            .find(|result| result.host == name)
            .ok_or_else(|| StepError::Assertion(format!("no outcome for {name}")))?;
        if result.succeeded != succeeded {
            return Err(StepError::Assertion(format!(
                "{name} should have {}:\n{}",
                if succeeded { "succeeded" } else { "failed" },
                state.report
            )));
        }
    }
    Ok(())
}
