//! SSH module - owns the outbound SSH session the tunnel runs over
//!
//! This module provides the SSH transport using the russh library.
//!
//! # Features
//! - Public-key authentication from in-memory key material
//! - Host key verification against known_hosts, or opt-in trust-on-use
//! - Single-owner Handle task vending direct-tcpip channels to concurrent callers
//! - Liveness watch that reports an unexpected session loss

mod client;
mod config;
mod handle_owner;
pub mod known_hosts;
mod session;
mod target;

#[cfg(test)]
pub(crate) mod test_keys;
#[cfg(test)]
pub(crate) mod test_server;

pub use client::{decode_private_key, ClientHandler, SshClient};
pub use config::{HostKeyPolicy, KnownHostsSource, SshConfig, DEFAULT_SSH_PORT};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use session::SshSession;
pub use target::{Network, Target};
