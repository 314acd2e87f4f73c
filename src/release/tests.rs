//! Unit tests for release ids, snapshots, and retention.

use chrono::{TimeZone, Utc};
use rstest::rstest;

use super::*;
use crate::test_support::ScriptedRunner;
use crate::transport::{RemotePaths, TransportOptions};

fn app() -> App {
    App {
        name: String::from("app"),
        import_path: String::from("example.com/app"),
        ..App::default()
    }
}

fn server() -> Server {
    Server {
        user: String::from("app"),
        host: String::from("10.0.0.5"),
        port: 22,
        ..Server::default()
    }
}

fn layout() -> RemoteLayout {
    RemoteLayout::new(
        &app(),
        &server(),
        &RemotePaths {
            home: String::from("/home/app"),
            gopath: String::from("/home/app/go"),
        },
    )
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_owned()).collect()
}

#[test]
fn release_id_sorts_chronologically() {
    let earlier = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).single().expect("valid time");
    let later = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).single().expect("valid time");

    let first = ReleaseId::from_time(&earlier);
    let second = ReleaseId::from_time(&later);

    assert_eq!(first.as_str(), "24-12-31-23:59:59");
    assert_eq!(second.as_str(), "25-01-02-03:04:05");
    assert!(first < second);
}

#[test]
fn clock_hands_out_one_id_per_run() {
    let clock = ReleaseClock::new();
    let first = clock.release_id().clone();
    std::thread::sleep(std::time::Duration::from_millis(1100));
    assert_eq!(clock.release_id(), &first);
}

#[test]
fn snapshot_copies_release_contents_when_marker_present() {
    let id = ReleaseId(String::from("25-01-02-03:04:05"));
    let script = snapshot_script(&layout(), &app(), &id);
    assert_eq!(
        script,
        "cd /home/app/harp/app\n\
         if [ -f harp-build.info ]; then\n\
         \tmkdir -p 'releases/25-01-02-03:04:05'\n\
         \tcp -rf app harp-build.info files kill.sh restart.sh rollback.sh 'releases/25-01-02-03:04:05'\n\
         fi"
    );
}

#[rstest]
#[case::five_keep_three(&["r1", "r2", "r3", "r4", "r5"], 3, &["r1", "r2"])]
#[case::unsorted(&["r5", "r1", "r4", "r2", "r3"], 3, &["r1", "r2"])]
#[case::under_limit(&["r1", "r2"], 3, &[])]
#[case::keep_none(&["r1", "r2"], 0, &["r1", "r2"])]
#[case::blank_lines(&["", "r1", " ", "r2"], 1, &["r1"])]
fn retention_removes_oldest(
    #[case] existing: &[&str],
    #[case] keep: usize,
    #[case] expected: &[&str],
) {
    assert_eq!(releases_to_trim(&names(existing), keep), names(expected));
}

#[test]
fn trim_removes_stale_releases_on_host() {
    let runner = ScriptedRunner::new();
    runner.respond(&["ls -1 /home/app/harp/app/releases"], "r1\nr2\nr3\nr4\nr5\n");
    let pool = ConnectionPool::new(runner.clone(), TransportOptions::default());
    let layout = layout();
    let manager = ReleaseManager::new(&pool, &layout);

    let removed = manager.trim(&server(), Some(3)).expect("trim succeeds");

    assert_eq!(removed, names(&["r1", "r2"]));
    let removals = runner.commands_matching(&["rm -rf"]);
    assert_eq!(removals.len(), 1);
    assert!(
        removals
            .first()
            .is_some_and(|cmd| cmd.ends_with("rm -rf /home/app/harp/app/releases/r1 /home/app/harp/app/releases/r2")),
        "{removals:?}"
    );
}

#[test]
fn trim_is_skipped_when_rollback_disabled() {
    let runner = ScriptedRunner::new();
    let pool = ConnectionPool::new(runner.clone(), TransportOptions::default());
    let layout = layout();

    let removed = ReleaseManager::new(&pool, &layout)
        .trim(&server(), None)
        .expect("nothing to do");

    assert!(removed.is_empty());
    assert!(runner.invocations().is_empty());
}

#[test]
fn trim_without_stale_releases_runs_no_removal() {
    let runner = ScriptedRunner::new();
    runner.respond(&["ls -1"], "r1\n");
    let pool = ConnectionPool::new(runner.clone(), TransportOptions::default());
    let layout = layout();

    ReleaseManager::new(&pool, &layout)
        .trim(&server(), Some(3))
        .expect("trim succeeds");

    assert!(runner.commands_matching(&["rm -rf"]).is_empty());
}
