//! Unit tests for descriptor decoding.

use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;

use super::*;

const DESCRIPTOR: &str = r#"{
    "GOOS": "linux",
    "GOARCH": "amd64",
    "App": {
        "Name": "app",
        "ImportPath": "github.com/bom-d-van/harp/test",
        "Files": [
            "github.com/bom-d-van/harp/test/files",
            {
                "Path": "github.com/bom-d-van/harp/test/data",
                "Excludeds": ["*.tmp"],
                "Delete": true
            }
        ],
        "Args": ["-mode", "prod"],
        "Envs": {"AppEnv": "prod"},
        "DefaultExcludeds": [".git"]
    },
    "Servers": {
        "prod": [
            {"User": "app", "Host": "192.168.59.103", "Port": ":49153"},
            {
                "ID": "web-2",
                "User": "app",
                "Host": "10.0.0.2",
                "Port": 2222,
                "Envs": {"Region": "eu"},
                "Proxy": {"User": "jump", "Host": "bastion.example.com"}
            }
        ]
    }
}"#;

fn parse(contents: &str) -> Result<Config, ConfigError> {
    Config::parse(Utf8Path::new("harp.json"), contents)
}

#[test]
fn decodes_full_descriptor() {
    let config = parse(DESCRIPTOR).expect("descriptor parses");

    assert_eq!(config.goos.as_deref(), Some("linux"));
    assert_eq!(config.rollback_count, DEFAULT_ROLLBACK_COUNT);
    assert_eq!(config.app.kill_sig, "KILL");
    assert_eq!(config.app.file_warning_size, 1_048_576);
    assert_eq!(
        config.app.files,
        vec![
            FileDeclaration::new("github.com/bom-d-van/harp/test/files"),
            FileDeclaration {
                path: String::from("github.com/bom-d-van/harp/test/data"),
                excludeds: vec![String::from("*.tmp")],
                delete: true,
            },
        ]
    );
}

#[test]
fn server_sets_resolve_ports_and_proxies() {
    let config = parse(DESCRIPTOR).expect("descriptor parses");
    let sets = config.server_sets().expect("servers convert");
    let prod = sets.get("prod").expect("prod set");

    let first = prod.first().expect("first server");
    assert_eq!(first.port, 49153);
    assert_eq!(first.label(), "[prod] app@192.168.59.103:49153");

    let second = prod.get(1).expect("second server");
    assert_eq!(second.id.as_deref(), Some("web-2"));
    assert_eq!(second.port, 2222);
    let proxy = second.proxy.as_deref().expect("proxy");
    assert_eq!(proxy.key(), "jump@bastion.example.com:22");
}

#[rstest]
#[case::no_name(r#"{"App": {"ImportPath": "x"}}"#, "Name")]
#[case::no_import(r#"{"App": {"Name": "app"}}"#, "ImportPath")]
fn rejects_missing_required_fields(#[case] contents: &str, #[case] field: &str) {
    let err = parse(contents).expect_err("descriptor incomplete");
    assert!(
        matches!(err, ConfigError::MissingField { field: f } if f == field),
        "{err}"
    );
}

#[test]
fn rejects_invalid_port() {
    let config = parse(
        r#"{"App": {"Name": "a", "ImportPath": "b"},
            "Servers": {"dev": [{"User": "u", "Host": "h", "Port": ":ssh"}]}}"#,
    )
    .expect("descriptor parses");

    let err = config.server_sets().expect_err("port rejected");
    assert!(matches!(err, ConfigError::InvalidPort { .. }), "{err}");
}

#[test]
fn reports_malformed_json() {
    let err = parse("{").expect_err("malformed");
    assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
}

#[test]
fn load_reads_file_through_parent_dir() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    let path = root.join("harp.json");
    std::fs::write(&path, DESCRIPTOR).expect("write descriptor");

    let config = Config::load(&path).expect("descriptor loads");
    assert_eq!(config.app.name, "app");
}

#[test]
fn load_reports_missing_file() {
    let err = Config::load(Utf8Path::new("/nonexistent/harp.json")).expect_err("missing file");
    assert!(matches!(err, ConfigError::Io { .. }), "{err}");
}

#[test]
fn retention_is_disabled_with_no_rollback() {
    let config = Config {
        no_rollback: true,
        ..Config::default()
    };
    assert_eq!(config.retention(), None);
    assert_eq!(Config::default().retention(), Some(3));
}

#[test]
fn flattened_replaces_separators() {
    assert_eq!(
        FileDeclaration::new("github.com/x/files/").flattened(),
        "github.com_x_files"
    );
}
