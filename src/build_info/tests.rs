//! Unit tests for the build-info marker and version check.

use rstest::rstest;

use super::*;
use crate::test_support::ScriptedRunner;

#[rstest]
#[case("0.6.0", ToolVersion::new(0, 6, 0))]
#[case("v1.2.3", ToolVersion::new(1, 2, 3))]
#[case(" 0.5 ", ToolVersion::new(0, 5, 0))]
#[case("0.7.1-beta.2", ToolVersion::new(0, 7, 1))]
fn versions_parse(#[case] input: &str, #[case] expected: ToolVersion) {
    assert_eq!(input.parse::<ToolVersion>(), Ok(expected));
}

#[rstest]
#[case("")]
#[case("one.two")]
#[case("1.2.3.4")]
fn malformed_versions_are_rejected(#[case] input: &str) {
    assert!(matches!(
        input.parse::<ToolVersion>(),
        Err(BuildInfoError::InvalidVersion { .. })
    ));
}

#[test]
fn versions_compare_numerically() {
    assert!(ToolVersion::new(0, 10, 0) > ToolVersion::new(0, 9, 9));
    assert_eq!(ToolVersion::new(1, 0, 0).to_string(), "1.0.0");
}

#[test]
fn current_version_matches_package() {
    assert_eq!(ToolVersion::current().to_string(), TOOL_VERSION);
}

#[test]
fn render_lists_present_lines_in_order() {
    let info = BuildInfo {
        harp_version: String::from("0.6.0"),
        go_version: Some(String::from("go version go1.22.1 linux/amd64")),
        goos: Some(String::from("linux")),
        goarch: None,
        git_checksum: Some(String::from("abc123")),
        composer: Some(String::from("Ops")),
        build_at: String::from("2025-01-02 03:04:05 +0000"),
    };

    assert_eq!(
        info.render(),
        "Harp Version: 0.6.0\n\
         Go Version: go version go1.22.1 linux/amd64\n\
         GOOS: linux\n\
         Git Checksum: abc123\n\
         Composer: Ops\n\
         Build At: 2025-01-02 03:04:05 +0000\n"
    );
}

#[test]
fn parse_reads_version_line() {
    let marker = "Go Version: go1.22\nHarp Version: 0.5.0\nBuild At: now\n";
    assert_eq!(parse_tool_version(marker), Ok(Some(ToolVersion::new(0, 5, 0))));
}

#[test]
fn parse_tolerates_markers_without_version() {
    assert_eq!(parse_tool_version("Go Version: go1.4\n"), Ok(None));
    assert_eq!(parse_tool_version(""), Ok(None));
}

#[rstest]
#[case::older_host(Some(ToolVersion::new(0, 5, 0)), false, false)]
#[case::older_host_forced(Some(ToolVersion::new(0, 5, 0)), true, true)]
#[case::same_version(Some(ToolVersion::new(0, 6, 0)), false, true)]
#[case::newer_host(Some(ToolVersion::new(0, 7, 2)), false, true)]
#[case::fresh_host(None, false, true)]
fn compatibility_against_running_version(
    #[case] remote: Option<ToolVersion>,
    #[case] force: bool,
    #[case] passes: bool,
) {
    let result = check_compatibility("[prod] app@h1:22", remote, ToolVersion::new(0, 6, 0), force);
    assert_eq!(result.is_ok(), passes, "{result:?}");
}

#[test]
fn incompatible_error_names_both_versions() {
    let err = check_compatibility(
        "[prod] app@h1:22",
        Some(ToolVersion::new(0, 5, 0)),
        ToolVersion::new(0, 6, 0),
        false,
    )
    .expect_err("older host");
    let message = err.to_string();
    assert!(message.contains("0.5.0") && message.contains("0.6.0"), "{message}");
    assert!(message.contains("--force"), "{message}");
}

#[test]
fn collect_uses_toolchain_output_when_available() {
    let runner = ScriptedRunner::new();
    runner.respond(&["go version"], "go version go1.22.1 linux/amd64\n");

    let info = BuildInfo::collect(&runner, Some("linux"), Some(""));

    assert_eq!(info.harp_version, TOOL_VERSION);
    assert_eq!(info.go_version.as_deref(), Some("go version go1.22.1 linux/amd64"));
    assert_eq!(info.goos.as_deref(), Some("linux"));
    assert_eq!(info.goarch, None);
    assert!(info.render().starts_with("Harp Version: "));
}

#[test]
fn collect_skips_failing_queries() {
    let runner = ScriptedRunner::new();
    runner.fail(&["go"], 127, "go: not found");

    let info = BuildInfo::collect(&runner, None, None);

    assert_eq!(info.go_version, None);
}

#[test]
fn read_command_tolerates_missing_marker() {
    assert_eq!(
        read_command("/home/app/harp/app/harp-build.info"),
        "cat /home/app/harp/app/harp-build.info 2>/dev/null || true"
    );
}
