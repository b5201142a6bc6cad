//! Lifecycle Controller
//!
//! Brings up the SSH session, then the SOCKS5 proxy on top of it, and tears
//! both down in order when a termination signal arrives or the session dies.
//!
//! # States
//!
//! `Initializing -> Running -> ShuttingDown -> Exited`. A failure while
//! initializing goes straight to `Exited`.
//!
//! # Shutdown order
//!
//! 1. SOCKS5 listener closed, so nothing new is accepted
//! 2. in-flight connections get the grace period, leftovers are cancelled
//! 3. SSH session closed
//! 4. shutdown hooks run

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::forwarding::start_dynamic_forward;
use crate::ssh::SshClient;

pub use crate::forwarding::TunnelSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Running,
    ShuttingDown,
    Exited,
}

/// What moved the controller out of `Running`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    SessionLost,
    ListenerClosed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownReason::Signal => "termination signal",
            ShutdownReason::SessionLost => "SSH session lost",
            ShutdownReason::ListenerClosed => "SOCKS5 listener closed",
        })
    }
}

/// External teardown run once the SSH session is closed
///
/// Errors are logged and do not stop later hooks.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_shutdown(&self) -> Result<(), TunnelError>;
}

/// Process termination signals, registered once up front
pub struct TerminationSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl TerminationSignal {
    /// Install handlers for SIGINT and SIGTERM
    pub fn register() -> Result<Self, TunnelError> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sigint: signal(SignalKind::interrupt())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolves on the first signal
    pub async fn wait(mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigterm.recv() => info!("Received SIGTERM"),
                _ = self.sigint.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C");
        }
    }
}

pub struct LifecycleController {
    config: TunnelConfig,
    hooks: Vec<Arc<dyn ShutdownHook>>,
    state_tx: watch::Sender<LifecycleState>,
}

impl LifecycleController {
    pub fn new(config: TunnelConfig) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Initializing);
        Self {
            config,
            hooks: Vec::new(),
            state_tx,
        }
    }

    /// Register a hook to run during `ShuttingDown`, in registration order
    pub fn with_hook(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: LifecycleState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            info!("Lifecycle: {:?} -> {:?}", prev, next);
        }
    }

    /// Run until SIGINT/SIGTERM or until the SSH session dies
    ///
    /// `Ok(())` means a clean shutdown after a signal.
    pub async fn run(self) -> Result<(), TunnelError> {
        let signal = TerminationSignal::register()?;
        self.run_until(signal.wait()).await
    }

    /// Like `run`, with the termination signal supplied by the caller
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), TunnelError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.set_state(LifecycleState::Initializing);

        let connect = SshClient::new(self.config.ssh.clone()).connect();
        let session = tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("Termination requested before the SSH session was up");
                self.set_state(LifecycleState::Exited);
                return Ok(());
            }

            result = connect => match result {
                Ok(session) => session,
                Err(e) => {
                    self.set_state(LifecycleState::Exited);
                    return Err(e);
                }
            },
        };

        info!("Connected to SSH server {}", session.endpoint());
        let controller = session.start();
        self.serve_session(controller, shutdown).await
    }

    /// Run the proxy over an established session, then shut everything down
    pub async fn serve_session<S, F>(&self, session: S, shutdown: F) -> Result<(), TunnelError>
    where
        S: TunnelSession,
        F: Future<Output = ()>,
    {
        let proxy = match start_dynamic_forward(session.clone(), self.config.socks.clone()).await {
            Ok(proxy) => proxy,
            Err(e) => {
                self.set_state(LifecycleState::ShuttingDown);
                session.close().await;
                self.run_hooks().await;
                self.set_state(LifecycleState::Exited);
                return Err(e);
            }
        };

        self.set_state(LifecycleState::Running);

        let reason = tokio::select! {
            biased;
            _ = shutdown => ShutdownReason::Signal,
            _ = session.wait_closed() => ShutdownReason::SessionLost,
            _ = proxy.closed() => ShutdownReason::ListenerClosed,
        };

        self.set_state(LifecycleState::ShuttingDown);
        info!("Shutting down: {}", reason);

        proxy.stop(self.config.shutdown_grace).await;

        session.close().await;
        info!("SSH session closed");

        self.run_hooks().await;
        self.set_state(LifecycleState::Exited);

        match reason {
            ShutdownReason::Signal => Ok(()),
            ShutdownReason::SessionLost => Err(TunnelError::SessionClosed),
            ShutdownReason::ListenerClosed => Err(TunnelError::Io(std::io::Error::other(
                "SOCKS5 listener closed unexpectedly",
            ))),
        }
    }

    async fn run_hooks(&self) {
        for hook in &self.hooks {
            info!("Running shutdown hook {}", hook.name());
            if let Err(e) = hook.on_shutdown().await {
                warn!("Shutdown hook {} failed: {}", hook.name(), e);
            }
        }
    }
}
