//! Seam between the SOCKS5 frontend and whatever carries the bytes

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::error::TunnelError;

/// A bidirectional byte stream to a remote target
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed stream handed back by a `StreamOpener`
pub type TunneledStream = Box<dyn TunnelIo>;

/// Opens a stream to `address` on the far side of the tunnel
///
/// `network` is `tcp`, `tcp4` or `tcp6`; `address` is `host:port` with IPv6
/// literals in brackets. Callers may hold clones and open concurrently.
#[async_trait]
pub trait StreamOpener: Clone + Send + Sync + 'static {
    async fn open_stream(&self, network: &str, address: &str)
        -> Result<TunneledStream, TunnelError>;
}

/// An open session the proxy can run on
#[async_trait]
pub trait TunnelSession: StreamOpener {
    /// Flips to `true` when the session is gone
    fn subscribe_disconnect(&self) -> watch::Receiver<bool>;

    async fn wait_closed(&self);

    /// Idempotent; `open_stream` fails once this returns
    async fn close(&self);
}
