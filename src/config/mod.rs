//! Configuration Management Module
//!
//! Runtime configuration of the tunnel and the JSON file format it is loaded from.

pub mod storage;
pub mod types;

use std::time::Duration;

pub use storage::{expand_home, load_config_file, read_private_key, StorageError};
pub use types::{ConfigFile, HostKeyPolicyKind, SocksSection, SshSection, CONFIG_VERSION};

use crate::error::TunnelError;
use crate::forwarding::DynamicForward;
use crate::ssh::SshConfig;

/// Default time in-flight connections get to finish at shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to run the tunnel
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// SSH endpoint, credentials and host-key policy
    pub ssh: SshConfig,
    /// SOCKS5 listener
    pub socks: DynamicForward,
    /// How long in-flight connections may run after shutdown begins
    pub shutdown_grace: Duration,
}

impl TunnelConfig {
    pub fn new(ssh: SshConfig, socks: DynamicForward) -> Self {
        Self {
            ssh,
            socks,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Reject configurations that cannot possibly work
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.ssh.host.trim().is_empty() {
            return Err(TunnelError::ConfigInvalid("SSH host is empty".into()));
        }
        if self.ssh.port == 0 {
            return Err(TunnelError::ConfigInvalid("SSH port must not be 0".into()));
        }
        if self.ssh.username.trim().is_empty() {
            return Err(TunnelError::ConfigInvalid("SSH username is empty".into()));
        }
        if self.ssh.private_key.is_empty() {
            return Err(TunnelError::ConfigInvalid("SSH private key is empty".into()));
        }
        if self.socks.local_addr.trim().is_empty() {
            return Err(TunnelError::ConfigInvalid("SOCKS5 bind address is empty".into()));
        }
        if self.ssh.connect_timeout.is_zero()
            || self.socks.handshake_timeout.is_zero()
            || self.socks.open_timeout.is_zero()
        {
            return Err(TunnelError::ConfigInvalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
