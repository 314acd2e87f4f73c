//! BDD scenarios for dispatch behaviour.

use rstest_bdd_macros::scenario;

use super::test_helpers::{DispatchContext, dispatch_context};

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "Failing hosts do not stop healthy hosts"
)]
fn scenario_partial_failure(dispatch_context: DispatchContext) {
    drop(dispatch_context);
}

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "A host recorded by an older harp is refused"
)]
fn scenario_older_host_refused(dispatch_context: DispatchContext) {
    drop(dispatch_context);
}

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "Forcing past the version check"
)]
fn scenario_force_overrides_version(dispatch_context: DispatchContext) {
    drop(dispatch_context);
}

#[scenario(
    path = "tests/features/dispatch.feature",
    name = "A host recorded by a newer harp is accepted"
)]
fn scenario_newer_host_accepted(dispatch_context: DispatchContext) {
    drop(dispatch_context);
}
