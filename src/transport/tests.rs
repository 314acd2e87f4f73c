//! Unit tests for connection arguments and the connection pool.

use std::sync::Arc;

use camino::Utf8Path;
use rstest::{fixture, rstest};

use super::*;
use crate::server::Server;
use crate::test_support::ScriptedRunner;

fn target(host: &str) -> Server {
    Server {
        user: String::from("app"),
        host: host.to_owned(),
        port: 2222,
        set: String::from("prod"),
        ..Server::default()
    }
}

fn bastion() -> Server {
    Server {
        user: String::from("jump"),
        host: String::from("bastion.example.com"),
        port: 22,
        ..Server::default()
    }
}

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn pool(runner: &ScriptedRunner) -> ConnectionPool<ScriptedRunner> {
    ConnectionPool::new(runner.clone(), TransportOptions::default())
}

fn strings(args: &[std::ffi::OsString]) -> Vec<String> {
    args.iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[test]
fn ssh_args_place_command_after_destination() {
    let connection = Connection::new(
        target("10.0.0.5").endpoint(),
        None,
        Arc::new(TransportOptions::default()),
    );

    let args = strings(&connection.ssh_args("echo hi"));
    assert_eq!(
        args,
        vec!["-p", "2222", "-o", "BatchMode=yes", "app@10.0.0.5", "echo hi"]
    );
}

#[test]
fn optional_settings_add_ssh_options() {
    let options = TransportOptions {
        strict_host_key_checking: false,
        known_hosts_file: Some(String::from("/tmp/known")),
        control_dir: Some(String::from("/tmp/harp-ssh")),
        ..TransportOptions::default()
    };
    let connection = Connection::new(target("h").endpoint(), None, Arc::new(options));

    let rendered = strings(&connection.ssh_args("true")).join(" ");
    assert!(rendered.contains("StrictHostKeyChecking=no"), "{rendered}");
    assert!(rendered.contains("UserKnownHostsFile=/tmp/known"), "{rendered}");
    assert!(rendered.contains("ControlMaster=auto"), "{rendered}");
    assert!(rendered.contains("ControlPath=/tmp/harp-ssh/harp-%C"), "{rendered}");
    assert!(rendered.contains("ControlPersist=60"), "{rendered}");
}

#[test]
fn tunnelled_connection_uses_proxy_forwarding() {
    let options = Arc::new(TransportOptions::default());
    let via = Arc::new(Connection::new(bastion().endpoint(), None, Arc::clone(&options)));
    let connection = Connection::new(target("10.0.0.5").endpoint(), Some(via), options);

    let args = strings(&connection.ssh_args("true"));
    let proxy = args
        .iter()
        .find(|arg| arg.starts_with("ProxyCommand="))
        .expect("proxy option present");
    assert_eq!(
        proxy,
        "ProxyCommand=ssh -p 22 -o BatchMode=yes -W '%h:%p' 'jump@bastion.example.com'"
    );
}

#[test]
fn nested_proxy_tokens_are_escaped() {
    let options = Arc::new(TransportOptions::default());
    let outer = Arc::new(Connection::new(bastion().endpoint(), None, Arc::clone(&options)));
    let inner = Arc::new(Connection::new(
        target("10.0.0.1").endpoint(),
        Some(outer),
        Arc::clone(&options),
    ));
    let connection = Connection::new(target("10.0.0.2").endpoint(), Some(inner), options);

    let args = strings(&connection.ssh_args("true")).join(" ");
    assert!(args.contains("%%h:%%p"), "inner tokens survive expansion: {args}");
}

#[test]
fn remote_shell_quotes_arguments_with_spaces() {
    let options = Arc::new(TransportOptions::default());
    let via = Arc::new(Connection::new(bastion().endpoint(), None, Arc::clone(&options)));
    let connection = Connection::new(target("10.0.0.5").endpoint(), Some(via), options);

    let shell = connection.remote_shell();
    assert!(shell.starts_with("ssh -p 2222 -o BatchMode=yes -o \"ProxyCommand=ssh"), "{shell}");
    assert!(shell.ends_with('"'), "{shell}");
}

#[test]
fn scp_uses_upper_case_port_flag() {
    let connection = Connection::new(
        target("10.0.0.5").endpoint(),
        None,
        Arc::new(TransportOptions::default()),
    );
    let args = strings(&connection.scp_args(Utf8Path::new("/tmp/a.tar.gz"), "harp/app/a.tar.gz"));
    assert_eq!(
        args,
        vec![
            "-q",
            "-P",
            "2222",
            "-o",
            "BatchMode=yes",
            "/tmp/a.tar.gz",
            "app@10.0.0.5:harp/app/a.tar.gz"
        ]
    );
}

#[rstest]
fn connect_establishes_once_per_host(runner: ScriptedRunner) {
    let pool = pool(&runner);
    let server = target("10.0.0.5");

    pool.run(&server, "uptime").expect("first command");
    pool.run(&server, "uptime").expect("second command");

    assert_eq!(runner.commands_matching(&["app@10.0.0.5 true"]).len(), 1);
    assert_eq!(runner.commands_matching(&["uptime"]).len(), 2);
}

/// Delays every handshake so concurrent callers overlap.
struct SlowHandshake(ScriptedRunner);

impl CommandRunner for SlowHandshake {
    fn run(
        &self,
        program: &str,
        args: &[std::ffi::OsString],
    ) -> Result<CommandOutput, TransportError> {
        if args.last().is_some_and(|arg| arg == "true") {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        self.0.run(program, args)
    }
}

#[rstest]
fn concurrent_connects_dial_each_host_once(runner: ScriptedRunner) {
    let pool = ConnectionPool::new(SlowHandshake(runner.clone()), TransportOptions::default());
    let server = target("10.0.0.5");

    let connections: Vec<Arc<Connection>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| pool.connect(&server).expect("connect succeeds")))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("connect thread joins"))
            .collect()
    });

    assert_eq!(runner.commands_matching(&["app@10.0.0.5 true"]).len(), 1);
    let first = connections.first().expect("eight connections");
    assert!(connections.iter().all(|connection| Arc::ptr_eq(connection, first)));
}

#[rstest]
fn connect_dials_proxy_first(runner: ScriptedRunner) {
    let pool = pool(&runner);
    let mut server = target("10.0.0.5");
    server.proxy = Some(Box::new(bastion()));

    pool.connect(&server).expect("connect through bastion");

    let commands = runner.commands();
    let first = commands.first().expect("bastion dialled");
    assert!(first.ends_with("jump@bastion.example.com true"), "{first}");
    let second = commands.get(1).expect("target dialled");
    assert!(second.contains("ProxyCommand="), "{second}");
}

#[rstest]
fn connect_failure_names_the_failing_hop(runner: ScriptedRunner) {
    runner.fail(&["jump@bastion.example.com true"], 255, "Permission denied (publickey).");
    let pool = pool(&runner);
    let mut server = target("10.0.0.5");
    server.proxy = Some(Box::new(bastion()));

    let err = pool.connect(&server).expect_err("bastion refuses");
    assert!(
        matches!(err, TransportError::Connect { ref hop, .. } if hop == "jump@bastion.example.com:22"),
        "{err}"
    );
    assert!(runner.commands_matching(&["app@10.0.0.5"]).is_empty());
}

#[rstest]
fn run_checked_reports_combined_output(runner: ScriptedRunner) {
    runner.on(
        &["false-script"],
        CommandOutput {
            code: Some(3),
            stdout: String::from("partial\n"),
            stderr: String::from("boom\n"),
        },
    );
    let pool = pool(&runner);

    let err = pool
        .run_checked(&target("h"), "false-script")
        .expect_err("non-zero exit");
    let TransportError::CommandFailure { status, output, .. } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(status, Some(3));
    assert_eq!(output, "partial\nboom\n");
}

#[rstest]
#[case::env_vars("/home/app\n/opt/go\n/home/app\n", "/home/app", "/opt/go")]
#[case::no_gopath("/home/app\n\n/home/app\n", "/home/app", "/home/app")]
#[case::no_home("\n\n/srv/app\n", "/srv/app", "/srv/app")]
fn paths_fall_back_like_a_login_shell(
    runner: ScriptedRunner,
    #[case] stdout: &str,
    #[case] home: &str,
    #[case] gopath: &str,
) {
    runner.respond(&["echo \"$HOME\""], stdout);
    let pool = pool(&runner);

    let paths = pool.paths(&target("h")).expect("paths discovered");
    assert_eq!(paths.home, home);
    assert_eq!(paths.gopath, gopath);

    pool.paths(&target("h")).expect("cached");
    assert_eq!(runner.commands_matching(&["echo \"$HOME\""]).len(), 1);
}

#[rstest]
fn paths_honour_descriptor_overrides(runner: ScriptedRunner) {
    let pool = pool(&runner);
    let mut server = target("h");
    server.home = Some(String::from("/data"));
    server.gopath = Some(String::from("/data/go"));

    let paths = pool.paths(&server).expect("paths");
    assert_eq!(paths.home, "/data");
    assert!(runner.commands().is_empty(), "no remote discovery needed");
}

#[rstest]
fn upload_mirrors_sources_with_delete(runner: ScriptedRunner) {
    let pool = pool(&runner);
    pool.upload(
        &target("10.0.0.5"),
        &[".harp/app".into(), ".harp/files".into()],
        "/home/app/harp/app/",
    )
    .expect("upload");

    let rsync = runner.commands_matching(&["rsync"]);
    assert_eq!(
        rsync,
        vec![
            "rsync -az --delete -e ssh -p 2222 -o BatchMode=yes .harp/app .harp/files app@10.0.0.5:/home/app/harp/app/"
        ]
    );
}

#[rstest]
fn close_all_exits_control_masters(runner: ScriptedRunner) {
    let options = TransportOptions {
        control_dir: Some(String::from("/tmp/ctl")),
        ..TransportOptions::default()
    };
    let pool = ConnectionPool::new(runner.clone(), options);
    pool.connect(&target("a")).expect("connect a");
    pool.connect(&target("b")).expect("connect b");

    pool.close_all();

    assert_eq!(runner.commands_matching(&["-O exit"]).len(), 2);
}
