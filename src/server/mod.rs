//! Deployment targets and host selection.
//!
//! A [`Server`] is an immutable descriptor: connections and discovered paths
//! are cached by [`crate::transport::ConnectionPool`], never on the
//! descriptor itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use crate::transport::Endpoint;

/// Default SSH port used when a descriptor omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// One deployment target.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Server {
    /// Optional stable identifier from the descriptor.
    pub id: Option<String>,
    /// Login user.
    pub user: String,
    /// Host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Jump host the connection is tunnelled through. The proxy is never a
    /// deploy target unless listed separately.
    pub proxy: Option<Box<Server>>,
    /// Per-host environment overrides applied after the app environment.
    pub envs: BTreeMap<String, String>,
    /// Remote home directory override; discovered when unset.
    pub home: Option<String>,
    /// Remote module root override; defaults to `$GOPATH`, else home.
    pub gopath: Option<String>,
    /// Log directory override; defaults to `<app root>/log`.
    pub log_dir: Option<String>,
    /// Name of the set the server was selected from.
    pub set: String,
}

/// Errors raised while parsing or selecting servers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ServerError {
    /// The one-shot target is not of the form `user@host[:port]`.
    #[error("invalid server address {input:?}: expected user@host[:port]")]
    InvalidAddress {
        /// Rejected input.
        input: String,
    },
    /// The port is not a number in range.
    #[error("invalid port {port:?} for {input}")]
    InvalidPort {
        /// Address carrying the port.
        input: String,
        /// Rejected port text.
        port: String,
    },
    /// A descriptor field is blank.
    #[error("server set {set:?} contains a server with an empty {field}")]
    MissingField {
        /// Set carrying the incomplete server.
        set: String,
        /// Field that was empty.
        field: &'static str,
    },
    /// A proxy chain leads back to an endpoint already in the chain.
    #[error("proxy chain of {server} loops back to {repeated}")]
    ProxyCycle {
        /// Server whose chain loops.
        server: String,
        /// Endpoint that appears twice.
        repeated: String,
    },
    /// A requested set is not present in the descriptor.
    #[error("unknown server set {name:?}")]
    UnknownSet {
        /// Requested set name.
        name: String,
    },
    /// Neither a set nor an ad-hoc server was requested.
    #[error("no servers selected: pass -s <set> or --server user@host[:port]")]
    NothingSelected,
}

impl Server {
    /// Parses a one-shot target of the form `user@host[:port]`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidAddress`] for malformed input and
    /// [`ServerError::InvalidPort`] when the port does not fit in `u16`.
    pub fn parse_one_shot(input: &str) -> Result<Self, ServerError> {
        let invalid = || ServerError::InvalidAddress {
            input: input.to_owned(),
        };
        let (user, rest) = input.trim().split_once('@').ok_or_else(invalid)?;
        let (host, port) = match rest.split_once(':') {
            Some((name, port_text)) => (name, parse_port(input, port_text)?),
            None => (rest, DEFAULT_SSH_PORT),
        };
        if user.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            user: user.to_owned(),
            host: host.to_owned(),
            port,
            ..Self::default()
        })
    }

    /// Endpoint used for connecting.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Identity key, `user@host:port`, used for caching and de-duplication.
    #[must_use]
    pub fn key(&self) -> String {
        self.endpoint().to_string()
    }

    /// Report prefix, `[set] user@host:port`.
    #[must_use]
    pub fn label(&self) -> String {
        if self.set.is_empty() {
            self.key()
        } else {
            format!("[{}] {}", self.set, self.key())
        }
    }

    /// Checks required fields and rejects proxy chains that revisit an
    /// endpoint (including the server itself).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::MissingField`] or [`ServerError::ProxyCycle`].
    pub fn validate(&self) -> Result<(), ServerError> {
        let mut seen = BTreeSet::new();
        let mut current = Some(self);
        while let Some(hop) = current {
            if hop.user.trim().is_empty() {
                return Err(self.missing("user"));
            }
            if hop.host.trim().is_empty() {
                return Err(self.missing("host"));
            }
            if !seen.insert(hop.key()) {
                return Err(ServerError::ProxyCycle {
                    server: self.key(),
                    repeated: hop.key(),
                });
            }
            current = hop.proxy.as_deref();
        }
        Ok(())
    }

    fn missing(&self, field: &'static str) -> ServerError {
        ServerError::MissingField {
            set: self.set.clone(),
            field,
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

fn parse_port(input: &str, text: &str) -> Result<u16, ServerError> {
    text.parse::<u16>().map_err(|_| ServerError::InvalidPort {
        input: input.to_owned(),
        port: text.to_owned(),
    })
}

/// Resolves the target list: servers of each named set in argument order,
/// then ad-hoc targets in argument order, without duplicates.
///
/// An ad-hoc target that matches a configured server reuses that server's
/// descriptor so its proxy and environment still apply.
///
/// # Errors
///
/// Returns [`ServerError::UnknownSet`] for a set missing from `sets`,
/// propagates parse and validation failures, and returns
/// [`ServerError::NothingSelected`] when the result would be empty.
pub fn select_servers(
    sets: &BTreeMap<String, Vec<Server>>,
    set_names: &[String],
    adhoc: &[String],
) -> Result<Vec<Server>, ServerError> {
    let mut selected: Vec<Server> = Vec::new();
    let mut seen = BTreeSet::new();

    for name in set_names {
        let members = sets.get(name).ok_or_else(|| ServerError::UnknownSet {
            name: name.clone(),
        })?;
        for server in members {
            if seen.insert(server.key()) {
                selected.push(server.clone());
            }
        }
    }

    for address in adhoc {
        let parsed = Server::parse_one_shot(address)?;
        let key = parsed.key();
        if !seen.insert(key.clone()) {
            continue;
        }
        let known = sets
            .values()
            .flatten()
            .find(|server| server.key() == key)
            .cloned();
        selected.push(known.unwrap_or(parsed));
    }

    if selected.is_empty() {
        return Err(ServerError::NothingSelected);
    }
    for server in &selected {
        server.validate()?;
    }
    Ok(selected)
}
