//! SSH argument construction for a (possibly tunnelled) host connection.

use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use shell_escape::unix::escape;

use crate::settings::HarpSettings;

/// Address of one SSH endpoint.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Endpoint {
    /// Login user.
    pub user: String,
    /// Host name or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
}

impl Endpoint {
    /// `user@host`, the form SSH expects as its destination argument.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// SSH client options shared by every connection in a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `rsync` executable.
    pub rsync_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Never prompt; authenticate through the agent only.
    pub batch_mode: bool,
    /// Enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    pub known_hosts_file: Option<String>,
    /// Control socket directory enabling connection multiplexing.
    pub control_dir: Option<String>,
    /// Seconds an idle control master is kept alive.
    pub control_persist: u32,
}

impl TransportOptions {
    /// Derives transport options from the loaded settings.
    #[must_use]
    pub fn from_settings(settings: &HarpSettings) -> Self {
        Self {
            ssh_bin: settings.ssh_bin.clone(),
            rsync_bin: settings.rsync_bin.clone(),
            scp_bin: settings.scp_bin.clone(),
            batch_mode: settings.ssh_batch_mode,
            strict_host_key_checking: settings.ssh_strict_host_key_checking,
            known_hosts_file: settings.ssh_known_hosts_file.clone(),
            control_dir: settings.ssh_control_dir.clone(),
            control_persist: settings.ssh_control_persist,
        }
    }

    /// Returns `true` when connections share a control master.
    #[must_use]
    pub const fn multiplexed(&self) -> bool {
        self.control_dir.is_some()
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_settings(&HarpSettings::default())
    }
}

/// One authenticated transport to a host.
///
/// A connection reached through a bastion holds the bastion's connection in
/// `via`; its SSH client opens a forwarding channel inside that connection
/// (`-W %h:%p`) and runs the target handshake over it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Connection {
    endpoint: Endpoint,
    via: Option<Arc<Connection>>,
    options: Arc<TransportOptions>,
}

impl Connection {
    /// Builds a connection description; nothing is dialled here.
    #[must_use]
    pub const fn new(
        endpoint: Endpoint,
        via: Option<Arc<Self>>,
        options: Arc<TransportOptions>,
    ) -> Self {
        Self {
            endpoint,
            via,
            options,
        }
    }

    /// Endpoint this connection reaches.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connection this one is tunnelled through.
    #[must_use]
    pub fn via(&self) -> Option<&Self> {
        self.via.as_deref()
    }

    /// Arguments for running `command` on the host over SSH.
    #[must_use]
    pub fn ssh_args(&self, command: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = self
            .options_with_port_flag("-p")
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(OsString::from(self.endpoint.destination()));
        args.push(OsString::from(command));
        args
    }

    /// Remote shell string for `rsync -e`.
    ///
    /// rsync splits this on spaces and honours double quotes, so arguments
    /// containing spaces are wrapped in double quotes.
    #[must_use]
    pub fn remote_shell(&self) -> String {
        let mut parts = vec![self.options.ssh_bin.clone()];
        parts.extend(
            self.options_with_port_flag("-p")
                .into_iter()
                .map(|arg| rsync_quote(&arg)),
        );
        parts.join(" ")
    }

    /// `user@host:path` for rsync and scp targets.
    #[must_use]
    pub fn remote_target(&self, path: &str) -> String {
        format!("{}:{path}", self.endpoint.destination())
    }

    /// Arguments for copying `local` to `remote` with scp.
    #[must_use]
    pub fn scp_args(&self, local: &Utf8Path, remote: &str) -> Vec<OsString> {
        let mut args = vec![OsString::from("-q")];
        args.extend(
            self.options_with_port_flag("-P")
                .into_iter()
                .map(OsString::from),
        );
        args.push(OsString::from(local.as_str()));
        args.push(OsString::from(self.remote_target(remote)));
        args
    }

    /// Arguments asking the control master to exit, when multiplexing is on.
    #[must_use]
    pub fn exit_master_args(&self) -> Option<Vec<OsString>> {
        if !self.options.multiplexed() {
            return None;
        }
        let mut args = vec![OsString::from("-O"), OsString::from("exit")];
        args.extend(
            self.options_with_port_flag("-p")
                .into_iter()
                .map(OsString::from),
        );
        args.push(OsString::from(self.endpoint.destination()));
        Some(args)
    }

    /// Streaming SSH command for long-running remote processes such as
    /// `tail -f`. Output is piped back to the caller.
    #[must_use]
    pub fn streaming_command(&self, command: &str) -> tokio::process::Command {
        let mut child = tokio::process::Command::new(&self.options.ssh_bin);
        child
            .args(self.ssh_args(command))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        child
    }

    fn options_with_port_flag(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![port_flag.to_owned(), self.endpoint.port.to_string()];
        let opts = &self.options;

        if opts.batch_mode {
            push_option(&mut args, "BatchMode=yes");
        }
        if !opts.strict_host_key_checking {
            push_option(&mut args, "StrictHostKeyChecking=no");
        }
        if let Some(known_hosts) = opts.known_hosts_file.as_deref() {
            push_option(&mut args, &format!("UserKnownHostsFile={known_hosts}"));
        }
        if let Some(dir) = opts.control_dir.as_deref() {
            push_option(&mut args, "ControlMaster=auto");
            push_option(&mut args, &format!("ControlPath={dir}/harp-%C"));
            push_option(
                &mut args,
                &format!("ControlPersist={}", opts.control_persist),
            );
        }
        if let Some(via) = self.via.as_deref() {
            push_option(&mut args, &format!("ProxyCommand={}", via.proxy_command()));
        }
        args
    }

    /// Command run by the outer SSH client to reach this connection's
    /// target through `self`.
    fn proxy_command(&self) -> String {
        let mut parts = vec![self.options.ssh_bin.clone()];
        parts.extend(
            self.options_with_port_flag("-p")
                .iter()
                .map(|arg| escape_tokens(arg)),
        );
        parts.push(String::from("-W"));
        parts.push(String::from("%h:%p"));
        parts.push(escape_tokens(&self.endpoint.destination()));
        parts
            .into_iter()
            .map(|part| escape(part.into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn push_option(args: &mut Vec<String>, value: &str) {
    args.push(String::from("-o"));
    args.push(value.to_owned());
}

/// SSH expands `%` tokens in `ProxyCommand`; the inner client's own tokens
/// must survive that expansion.
fn escape_tokens(arg: &str) -> String {
    arg.replace('%', "%%")
}

fn rsync_quote(arg: &str) -> String {
    if arg.contains(char::is_whitespace) {
        format!("\"{arg}\"")
    } else {
        arg.to_owned()
    }
}
