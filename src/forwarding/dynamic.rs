//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Implements a local SOCKS5 proxy server that tunnels connections through SSH.
//! Example: Local SOCKS5 proxy on 127.0.0.1:1080 -> SSH tunnel -> any destination

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::socks5::{self, TargetAddr};
use super::stream::{StreamOpener, TunnelSession, TunneledStream};
use crate::error::{RefusalReason, TunnelError};

pub const DEFAULT_SOCKS_ADDR: &str = "127.0.0.1:1080";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period `serve` gives in-flight connections once the listener stops
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Forward statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Total connection count
    pub connection_count: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent (to remote)
    pub bytes_sent: u64,
    /// Total bytes received (from remote)
    pub bytes_received: u64,
}

/// Dynamic (SOCKS5) port forwarding configuration
#[derive(Debug, Clone)]
pub struct DynamicForward {
    /// Local address to bind SOCKS5 proxy (e.g., "127.0.0.1:1080")
    pub local_addr: String,
    /// Deadline for greeting plus request
    pub handshake_timeout: Duration,
    /// Deadline for the SSH server to answer a channel open
    pub open_timeout: Duration,
}

impl DynamicForward {
    /// Create a new dynamic forward
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

impl Default for DynamicForward {
    fn default() -> Self {
        Self {
            local_addr: DEFAULT_SOCKS_ADDR.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

/// Handle to a running dynamic forward (SOCKS5 proxy)
///
/// Dropping the handle stops the listener and cancels every in-flight connection.
pub struct DynamicForwardHandle {
    /// Forward configuration
    pub config: DynamicForward,
    /// Actual bound address
    pub bound_addr: SocketAddr,
    /// Cleared when shutdown begins; handlers check it before replying success
    running: Arc<AtomicBool>,
    /// Channel to signal stop
    stop_tx: mpsc::Sender<()>,
    /// Stats tracking
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
    /// Cancels handlers still running after the grace period
    abort: CancellationToken,
    /// Cancelled by the accept task once the listener has been dropped
    listener_closed: CancellationToken,
}

impl DynamicForwardHandle {
    /// Stop the SOCKS5 proxy
    ///
    /// Closes the listener first, then gives active connections up to `grace`
    /// to finish on their own before cancelling the rest. Returns the final stats.
    pub async fn stop(&self, grace: Duration) -> ForwardStats {
        info!("Stopping SOCKS5 proxy on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;
        self.listener_closed.cancelled().await;

        if !self.wait_idle(grace).await {
            warn!(
                "{} SOCKS5 connections still active on {} after {:?}, closing them",
                self.stats.read().active_connections,
                self.bound_addr,
                grace
            );
            self.abort.cancel();
            // Cancelled handlers unwind without further I/O
            self.wait_idle(Duration::from_secs(1)).await;
        }

        let stats = self.stats();
        info!(
            "SOCKS5 proxy on {} stopped: {} connections, {} bytes sent, {} bytes received",
            self.bound_addr, stats.connection_count, stats.bytes_sent, stats.bytes_received
        );
        stats
    }

    async fn wait_idle(&self, limit: Duration) -> bool {
        let start = Instant::now();
        while self.stats.read().active_connections > 0 {
            if start.elapsed() > limit {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Resolves once the listener is closed, whether by `stop` or by the
    /// SSH session going away
    pub async fn closed(&self) {
        self.listener_closed.cancelled().await;
    }

    /// Check if the proxy is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get current stats
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

impl Drop for DynamicForwardHandle {
    fn drop(&mut self) {
        // The accept loop sees stop_tx go away on its own
        self.abort.cancel();
    }
}

/// Start dynamic (SOCKS5) port forwarding over an SSH session
///
/// This function:
/// 1. Starts a local SOCKS5 proxy server
/// 2. For each incoming connection, performs SOCKS5 handshake
/// 3. Opens direct-tcpip channel through SSH to the requested destination
/// 4. Bridges data between the local socket and the SSH channel
///
/// The proxy stops by itself if the SSH session goes away.
pub async fn start_dynamic_forward<S: TunnelSession>(
    session: S,
    config: DynamicForward,
) -> Result<DynamicForwardHandle, TunnelError> {
    let disconnect_rx = session.subscribe_disconnect();
    start_dynamic_forward_with_disconnect(session, config, disconnect_rx).await
}

/// Run a SOCKS5 proxy over an SSH session until its listener closes
///
/// Only returns early with `BindFailure`; otherwise resolves after the SSH
/// session has gone away and the in-flight connections have drained.
pub async fn serve<S: TunnelSession>(
    session: S,
    config: DynamicForward,
) -> Result<ForwardStats, TunnelError> {
    let handle = start_dynamic_forward(session, config).await?;
    handle.closed().await;
    Ok(handle.stop(DEFAULT_STOP_GRACE).await)
}

/// Start dynamic forward with any stream opener and an explicit disconnect receiver
///
/// The listener closes when `disconnect_rx` flips to `true` or its sender is dropped.
pub async fn start_dynamic_forward_with_disconnect<S: StreamOpener>(
    opener: S,
    config: DynamicForward,
    mut disconnect_rx: watch::Receiver<bool>,
) -> Result<DynamicForwardHandle, TunnelError> {
    // Bind to local address
    let listener = TcpListener::bind(&config.local_addr)
        .await
        .map_err(|e| bind_error(&config.local_addr, e))?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| TunnelError::BindFailure(format!("Failed to get bound address: {}", e)))?;

    info!("SOCKS5 proxy listening on {}", bound_addr);

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let stats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));
    let stats_clone = stats.clone();
    let abort = CancellationToken::new();
    let abort_clone = abort.clone();
    let listener_closed = CancellationToken::new();
    let listener_closed_clone = listener_closed.clone();
    let timeouts = HandlerTimeouts {
        handshake: config.handshake_timeout,
        open: config.open_timeout,
    };

    // Spawn the proxy task
    tokio::spawn(async move {
        loop {
            tokio::select! {
                // Handle SSH disconnect signal. The watch guard must not
                // live into the arm body or the task stops being Send.
                _ = async { let _ = disconnect_rx.wait_for(|closed| *closed).await; } => {
                    info!("SOCKS5 proxy stopped: SSH disconnected");
                    break;
                }

                // Handle stop signal
                _ = stop_rx.recv() => {
                    info!("SOCKS5 proxy stopped by request");
                    break;
                }

                // Accept new connections
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if !running_clone.load(Ordering::SeqCst) {
                                break;
                            }

                            // Disable Nagle's algorithm for low-latency SOCKS5 proxy
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }

                            debug!("SOCKS5: Accepted connection from {}", peer_addr);

                            {
                                let mut s = stats_clone.write();
                                s.connection_count += 1;
                                s.active_connections += 1;
                            }

                            let opener = opener.clone();
                            let stats_for_conn = stats_clone.clone();
                            let running_for_conn = running_clone.clone();
                            let abort_for_conn = abort_clone.clone();

                            tokio::spawn(async move {
                                let result = tokio::select! {
                                    result = handle_socks5_connection(
                                        &opener,
                                        stream,
                                        timeouts,
                                        &running_for_conn,
                                        &stats_for_conn,
                                    ) => result,
                                    _ = abort_for_conn.cancelled() => {
                                        debug!("SOCKS5 connection from {} cancelled by shutdown", peer_addr);
                                        Ok(())
                                    }
                                };

                                {
                                    let mut s = stats_for_conn.write();
                                    s.active_connections = s.active_connections.saturating_sub(1);
                                }

                                if let Err(e) = result {
                                    warn!("SOCKS5 connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("SOCKS5 accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        running_clone.store(false, Ordering::SeqCst);
        drop(listener);
        listener_closed_clone.cancel();
        info!("SOCKS5 proxy task exited");
    });

    Ok(DynamicForwardHandle {
        config,
        bound_addr,
        running,
        stop_tx,
        stats,
        abort,
        listener_closed,
    })
}

fn bind_error(local_addr: &str, e: std::io::Error) -> TunnelError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => TunnelError::BindFailure(format!(
            "Port already in use: {}. Another application may be using this port.",
            local_addr
        )),
        std::io::ErrorKind::PermissionDenied => TunnelError::BindFailure(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            local_addr
        )),
        std::io::ErrorKind::AddrNotAvailable => TunnelError::BindFailure(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            local_addr
        )),
        _ => TunnelError::BindFailure(format!(
            "Failed to bind SOCKS5 proxy to {}: {}",
            local_addr, e
        )),
    }
}

#[derive(Debug, Clone, Copy)]
struct HandlerTimeouts {
    handshake: Duration,
    open: Duration,
}

/// Handle a single SOCKS5 connection
async fn handle_socks5_connection<S: StreamOpener>(
    opener: &S,
    mut stream: TcpStream,
    timeouts: HandlerTimeouts,
    running: &AtomicBool,
    stats: &parking_lot::RwLock<ForwardStats>,
) -> Result<(), TunnelError> {
    // Phase 1: greeting and request, under one deadline
    let target = tokio::time::timeout(timeouts.handshake, socks5_handshake(&mut stream))
        .await
        .map_err(|_| {
            TunnelError::Timeout(format!(
                "SOCKS5 handshake not completed within {:?}",
                timeouts.handshake
            ))
        })??;

    let address = target.to_string();
    debug!("SOCKS5: Connecting to {}", address);

    // Phase 2: open the tunneled stream
    let opened = match tokio::time::timeout(timeouts.open, opener.open_stream("tcp", &address)).await
    {
        Ok(result) => result,
        Err(_) => Err(TunnelError::refused(address.as_str(), RefusalReason::TimedOut)),
    };

    let upstream = match opened {
        Ok(upstream) => upstream,
        Err(e) => {
            socks5::write_reply(&mut stream, e.socks_reply()).await?;
            return Err(e);
        }
    };

    if !running.load(Ordering::SeqCst) {
        // The stream is about to be torn down with the rest of the proxy
        socks5::write_reply(&mut stream, socks5::REP_GENERAL_FAILURE).await?;
        debug!("SOCKS5: Refusing {} because the proxy is shutting down", address);
        return Ok(());
    }

    socks5::write_reply(&mut stream, socks5::REP_SUCCESS).await?;
    debug!("SOCKS5: Tunnel established to {}", address);

    // Phase 3: splice
    bridge_socks5_connection(stream, upstream, stats).await;
    debug!("SOCKS5: Connection to {} closed", address);
    Ok(())
}

/// Greeting plus request; sends the failure reply for a request it rejects
async fn socks5_handshake(stream: &mut TcpStream) -> Result<TargetAddr, TunnelError> {
    socks5::negotiate_method(stream).await?;

    match socks5::read_connect_request(stream).await {
        Ok(target) => Ok(target),
        Err(e) => {
            if let Some(code) = e.reply_code() {
                socks5::write_reply(stream, code).await.ok();
                stream.shutdown().await.ok();
            }
            Err(e.into())
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToRemote,
    ToClient,
}

/// Bridge data between SOCKS5 client and the tunneled stream
///
/// Each direction half-closes its destination when its source ends; returns
/// once both directions are done.
async fn bridge_socks5_connection(
    client: TcpStream,
    upstream: TunneledStream,
    stats: &parking_lot::RwLock<ForwardStats>,
) {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let (to_remote, to_client) = tokio::join!(
        pump(client_read, upstream_write, stats, Direction::ToRemote),
        pump(upstream_read, client_write, stats, Direction::ToClient),
    );

    if let Err(e) = to_remote {
        debug!("SOCKS5 client -> remote ended with error: {}", e);
    }
    if let Err(e) = to_client {
        debug!("SOCKS5 remote -> client ended with error: {}", e);
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    stats: &parking_lot::RwLock<ForwardStats>,
    direction: Direction,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let result = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        {
            let mut s = stats.write();
            match direction {
                Direction::ToRemote => s.bytes_sent += n as u64,
                Direction::ToClient => s.bytes_received += n as u64,
            }
        }
    };
    let _ = writer.shutdown().await;
    result
}
