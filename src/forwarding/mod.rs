//! Port Forwarding Module
//!
//! Provides dynamic (SOCKS5) forwarding over an SSH session: a local SOCKS5
//! listener whose CONNECT requests are served by direct-tcpip channels.

mod dynamic;
pub mod socks5;
mod stream;

pub use dynamic::{
    serve, start_dynamic_forward, start_dynamic_forward_with_disconnect, DynamicForward,
    DynamicForwardHandle, ForwardStats, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_OPEN_TIMEOUT,
    DEFAULT_SOCKS_ADDR, DEFAULT_STOP_GRACE,
};
pub use stream::{StreamOpener, TunnelIo, TunnelSession, TunneledStream};
