//! SSH Configuration

use std::path::PathBuf;
use std::time::Duration;

/// Where known-hosts entries come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownHostsSource {
    /// An OpenSSH `known_hosts` file
    File(PathBuf),
    /// Entries supplied directly, one per line in `known_hosts` format
    Inline(String),
}

impl KnownHostsSource {
    /// `~/.ssh/known_hosts` of the current user
    pub fn user_default() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"));
        KnownHostsSource::File(path)
    }
}

/// How the server's host key is checked during key exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Reject any key that does not match an entry from the source.
    /// Unknown hosts are rejected too.
    KnownHosts(KnownHostsSource),
    /// Accept whatever key the server presents.
    /// Only for ephemeral hosts the caller controls.
    TrustOnUse,
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::KnownHosts(KnownHostsSource::user_default())
    }
}

/// SSH connection configuration
#[derive(Clone)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// PEM / OpenSSH encoded private key
    pub private_key: Vec<u8>,

    /// Optional passphrase for encrypted keys
    pub passphrase: Option<String>,

    /// Host key verification policy
    pub host_key_policy: HostKeyPolicy,

    /// Bound on TCP connect + SSH handshake + authentication
    pub connect_timeout: Duration,

    /// Interval between SSH keepalive probes
    pub keepalive_interval: Option<Duration>,

    /// Missed keepalives before the session is considered dead
    pub keepalive_max: usize,
}

impl SshConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        private_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            private_key: private_key.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// `host:port` of the SSH server
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// Key material stays out of logs.
impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key", &format_args!("<{} bytes>", self.private_key.len()))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("host_key_policy", &self.host_key_policy)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_max", &self.keepalive_max)
            .finish()
    }
}

pub const DEFAULT_SSH_PORT: u16 = 22;

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            username: String::new(),
            private_key: Vec::new(),
            passphrase: None,
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
        }
    }
}
