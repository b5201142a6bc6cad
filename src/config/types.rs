//! Configuration file types
//!
//! Every field is optional on disk; command-line flags fill in or override
//! values before `ConfigFile::to_tunnel_config` checks that the required
//! ones are present.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::TunnelConfig;
use crate::error::TunnelError;
use crate::forwarding::DynamicForward;
use crate::ssh::{HostKeyPolicy, KnownHostsSource, SshConfig};

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

fn default_version() -> u32 {
    CONFIG_VERSION
}

/// Root of the JSON config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Format version
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub ssh: SshSection,

    #[serde(default)]
    pub socks: SocksSection,

    /// Grace period for in-flight connections at shutdown
    #[serde(default)]
    pub shutdown_grace_secs: Option<u64>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            ssh: SshSection::default(),
            socks: SocksSection::default(),
            shutdown_grace_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    /// Path of the PEM / OpenSSH private key
    pub private_key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub host_key_policy: Option<HostKeyPolicyKind>,
    /// Defaults to the user's `~/.ssh/known_hosts`
    pub known_hosts_path: Option<PathBuf>,
    pub connect_timeout_secs: Option<u64>,
    /// 0 disables keepalives
    pub keepalive_interval_secs: Option<u64>,
    pub keepalive_max: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicyKind {
    KnownHosts,
    TrustOnUse,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocksSection {
    /// Listen address, `127.0.0.1:1080` when unset
    pub bind: Option<String>,
    pub handshake_timeout_secs: Option<u64>,
    pub open_timeout_secs: Option<u64>,
}

impl ConfigFile {
    /// Private key location, required in every configuration
    pub fn private_key_path(&self) -> Result<&PathBuf, TunnelError> {
        self.ssh
            .private_key_path
            .as_ref()
            .ok_or_else(|| TunnelError::ConfigInvalid("missing SSH private key path".to_string()))
    }

    /// Build the runtime configuration, taking the key bytes read from
    /// `private_key_path`
    pub fn to_tunnel_config(&self, private_key: Vec<u8>) -> Result<TunnelConfig, TunnelError> {
        let host = required(&self.ssh.host, "SSH host")?;
        let username = required(&self.ssh.username, "SSH username")?;

        let mut ssh = SshConfig::new(host, username, private_key);
        if let Some(port) = self.ssh.port {
            ssh = ssh.with_port(port);
        }
        if let Some(passphrase) = &self.ssh.passphrase {
            ssh = ssh.with_passphrase(passphrase.clone());
        }

        let known_hosts = match &self.ssh.known_hosts_path {
            Some(path) => KnownHostsSource::File(path.clone()),
            None => KnownHostsSource::user_default(),
        };
        ssh = ssh.with_host_key_policy(match self.ssh.host_key_policy {
            Some(HostKeyPolicyKind::TrustOnUse) => HostKeyPolicy::TrustOnUse,
            Some(HostKeyPolicyKind::KnownHosts) | None => HostKeyPolicy::KnownHosts(known_hosts),
        });

        if let Some(secs) = self.ssh.connect_timeout_secs {
            ssh.connect_timeout = Duration::from_secs(secs);
        }
        match self.ssh.keepalive_interval_secs {
            Some(0) => ssh.keepalive_interval = None,
            Some(secs) => ssh.keepalive_interval = Some(Duration::from_secs(secs)),
            None => {}
        }
        if let Some(max) = self.ssh.keepalive_max {
            ssh.keepalive_max = max;
        }

        let mut socks = match &self.socks.bind {
            Some(bind) => DynamicForward::new(bind.clone()),
            None => DynamicForward::default(),
        };
        if let Some(secs) = self.socks.handshake_timeout_secs {
            socks = socks.with_handshake_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.socks.open_timeout_secs {
            socks = socks.with_open_timeout(Duration::from_secs(secs));
        }

        let mut config = TunnelConfig::new(ssh, socks);
        if let Some(secs) = self.shutdown_grace_secs {
            config = config.with_shutdown_grace(Duration::from_secs(secs));
        }
        config.validate()?;
        Ok(config)
    }
}

fn required(value: &Option<String>, what: &str) -> Result<String, TunnelError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(TunnelError::ConfigInvalid(format!("missing {}", what))),
    }
}
