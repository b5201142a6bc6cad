//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a `HandleController`, which sends commands over an mpsc channel.
//! Channel opens are spawned off the owner loop so a target that is slow to
//! answer does not hold up opens for other clients.
//!
//! The owner task ends when `close()` is called, when every controller is
//! dropped, or when the transport dies underneath it. In all cases the closed
//! flag is published on a watch channel and pending commands are failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelOpenFailure};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::target::Target;
use crate::error::{RefusalReason, TunnelError};
use crate::forwarding::{StreamOpener, TunnelSession, TunneledStream};

/// How often the owner task checks whether the transport is still alive
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cheap to clone; every clone has full control over the session,
/// including `close()`.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Flips to `true` once the owner task has torn the session down
    closed_rx: watch::Receiver<bool>,
    /// Set by `close()` before the owner task has finished
    closing: Arc<AtomicBool>,
}

impl HandleController {
    /// Build a controller around a raw command channel.
    ///
    /// Used by tests to script the owner side; production code gets its
    /// controller from `spawn_handle_owner_task`.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>, closed_rx: watch::Receiver<bool>) -> Self {
        Self {
            cmd_tx,
            closed_rx,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the session-closed flag
    pub fn subscribe_disconnect(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Resolves once the SSH session has gone away, for whatever reason
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        // Err means the owner task is gone, which is just as closed
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Check if the session can still open channels
    pub fn is_connected(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !*self.closed_rx.borrow() && !self.cmd_tx.is_closed()
    }

    /// Open a direct-tcpip channel to `host:port` on the remote side
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        if !self.is_connected() {
            return Err(TunnelError::SessionClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::SessionClosed)?;

        let target = format!("{}:{}", host, port);
        reply_rx
            .await
            .map_err(|_| TunnelError::SessionClosed)?
            .map_err(|e| channel_open_error(target, e))
    }

    /// Tear the session down and wait until it is gone.
    ///
    /// Idempotent. Channels opened from this session fail promptly afterwards
    /// and any later open returns `SessionClosed`.
    pub async fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            debug!("Closing SSH session");
        }
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
        self.wait_closed().await;
    }
}

/// Map a channel-open failure onto the refusal reasons the frontend understands
fn channel_open_error(target: String, err: russh::Error) -> TunnelError {
    match err {
        russh::Error::ChannelOpenFailure(reason) => {
            let reason = match reason {
                ChannelOpenFailure::ConnectFailed => RefusalReason::ConnectFailed,
                ChannelOpenFailure::AdministrativelyProhibited => RefusalReason::Prohibited,
                _ => RefusalReason::Unreachable,
            };
            TunnelError::refused(target, reason)
        }
        other => TunnelError::from(other),
    }
}

#[async_trait]
impl StreamOpener for HandleController {
    async fn open_stream(&self, network: &str, address: &str) -> Result<TunneledStream, TunnelError> {
        let target = Target::parse(network, address)?;
        let channel = self
            .open_direct_tcpip(&target.host, target.port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }
}

#[async_trait]
impl TunnelSession for HandleController {
    fn subscribe_disconnect(&self) -> watch::Receiver<bool> {
        HandleController::subscribe_disconnect(self)
    }

    async fn wait_closed(&self) {
        HandleController::wait_closed(self).await
    }

    async fn close(&self) {
        HandleController::close(self).await
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (closed_tx, closed_rx) = watch::channel(false);

    tokio::spawn(async move {
        let handle = Arc::new(handle);
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Handle owner task started for session {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            let result = handle
                                .channel_open_direct_tcpip(
                                    host,
                                    port,
                                    originator_host,
                                    originator_port,
                                )
                                .await;
                            if reply_tx.send(result).is_err() {
                                // Channel is dropped here, the server closes it
                                debug!("Caller dropped before receiving direct_tcpip result");
                            }
                        });
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for session {}", session_id);
                        break;
                    }
                    None => {
                        info!("All controllers dropped for session {}", session_id);
                        break;
                    }
                },

                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH session {} closed by the remote side", session_id);
                        break;
                    }
                }
            }
        }

        // === Cleanup phase ===
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;

        let _ = closed_tx.send(true);
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController::new(cmd_tx, closed_rx)
}

/// Drain all pending commands, returning a disconnect error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    // Close receiver first, prevent new messages
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
