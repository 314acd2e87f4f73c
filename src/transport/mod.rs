//! Remote connections over the system OpenSSH client.
//!
//! Authentication is delegated to the running SSH agent; harp never reads
//! key material. A [`ConnectionPool`] establishes one [`Connection`] per host
//! on first use (dialling any bastion first) and every later command runs as
//! an independent session over it. With a control directory configured the
//! sessions multiplex over one control master per host.

mod connection;
mod error;
mod pool;
mod types;

pub use connection::{Connection, Endpoint, TransportOptions};
pub use error::TransportError;
pub use pool::{ConnectionPool, RemotePaths};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner};

#[cfg(test)]
mod tests;
