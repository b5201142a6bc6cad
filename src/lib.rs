//! sshsocks - a local SOCKS5 proxy tunneled through one SSH session
//!
//! Every SOCKS5 `CONNECT` is served by a `direct-tcpip` channel, so the target
//! is resolved and dialed from the SSH server's side of the network.

pub mod config;
pub mod error;
pub mod forwarding;
pub mod lifecycle;
pub mod logging;
pub mod ssh;

pub use config::TunnelConfig;
pub use error::{RefusalReason, TunnelError};
pub use lifecycle::{LifecycleController, LifecycleState, ShutdownHook, TunnelSession};
