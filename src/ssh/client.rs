//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::config::{HostKeyPolicy, SshConfig};
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::session::SshSession;
use crate::error::TunnelError;

/// Establishes the one authenticated SSH session the tunnel runs over
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect to the SSH server and return an authenticated session
    ///
    /// Fails with `AuthFailure` for an unusable key or a refused login,
    /// `NetworkUnreachable` when the TCP endpoint cannot be reached and
    /// `HostKeyRejected` when the host-key policy refuses the server.
    pub async fn connect(self) -> Result<SshSession, TunnelError> {
        let config = self.config;
        let endpoint = config.endpoint();

        // Parse the key first so a bad key never touches the network
        let key = decode_private_key(&config.private_key, config.passphrase.as_deref())?;
        let handler = ClientHandler::from_policy(&config)?;

        info!("Connecting to SSH server at {}", endpoint);

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| TunnelError::NetworkUnreachable(format!("{}: connect timed out", endpoint)))?
        .map_err(|e| TunnelError::NetworkUnreachable(format!("{}: {}", endpoint, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on SSH socket: {}", e);
        }

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: config.keepalive_interval,
            keepalive_max: config.keepalive_max,
            ..Default::default()
        };

        let mut handle = with_timeout(
            config.connect_timeout,
            "SSH handshake",
            client::connect_stream(Arc::new(ssh_config), stream, handler),
        )
        .await??;

        debug!("SSH handshake completed with {}", endpoint);

        let rsa_hash = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        let auth = with_timeout(
            config.connect_timeout,
            "SSH authentication",
            handle.authenticate_publickey(
                config.username.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
            ),
        )
        .await?
        .map_err(|e| TunnelError::AuthFailure(e.to_string()))?;

        if !auth.success() {
            return Err(TunnelError::AuthFailure(format!(
                "public key for {} rejected by {}",
                config.username, endpoint
            )));
        }

        info!("SSH authentication successful as {}@{}", config.username, endpoint);

        Ok(SshSession::new(handle, endpoint))
    }
}

async fn with_timeout<F: std::future::Future>(
    limit: Duration,
    what: &str,
    fut: F,
) -> Result<F::Output, TunnelError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TunnelError::Timeout(format!("{} timed out after {:?}", what, limit)))
}

/// Decode PEM / OpenSSH private key bytes
pub fn decode_private_key(bytes: &[u8], passphrase: Option<&str>) -> Result<PrivateKey, TunnelError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| TunnelError::AuthFailure("private key is not PEM text".to_string()))?;
    if text.trim().is_empty() {
        return Err(TunnelError::AuthFailure("private key is empty".to_string()));
    }
    russh::keys::decode_secret_key(text, passphrase)
        .map_err(|e| TunnelError::AuthFailure(format!("unusable private key: {}", e)))
}

/// Client handler for russh callbacks
///
/// Enforces the configured host-key policy during key exchange.
pub struct ClientHandler {
    /// Target host for key verification
    host: String,
    /// Target port
    port: u16,
    /// `None` trusts any key
    known_hosts: Option<KnownHostsStore>,
}

impl ClientHandler {
    pub fn from_policy(config: &SshConfig) -> Result<Self, TunnelError> {
        let known_hosts = match &config.host_key_policy {
            HostKeyPolicy::KnownHosts(source) => Some(KnownHostsStore::load(source)?),
            HostKeyPolicy::TrustOnUse => None,
        };
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            known_hosts,
        })
    }

    pub fn trust_on_use(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            known_hosts: None,
        }
    }

    pub fn with_known_hosts(host: impl Into<String>, port: u16, store: KnownHostsStore) -> Self {
        Self {
            host: host.into(),
            port,
            known_hosts: Some(store),
        }
    }

    fn check_key(&self, server_public_key: &PublicKey) -> Result<bool, TunnelError> {
        let Some(known_hosts) = &self.known_hosts else {
            warn!(
                "Trust-on-use: accepting host key for {}:{} without verification (fingerprint: {})",
                self.host,
                self.port,
                KnownHostsStore::fingerprint(server_public_key)
            );
            return Ok(true);
        };

        match known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                warn!(
                    "Unknown host key for {}:{} (fingerprint: {}), rejecting",
                    self.host, self.port, fingerprint
                );
                Err(TunnelError::HostKeyRejected(format!(
                    "no known_hosts entry for {}:{} (fingerprint {})",
                    self.host, self.port, fingerprint
                )))
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(TunnelError::HostKeyRejected(format!(
                    "key for {}:{} does not match known_hosts: expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.check_key(server_public_key)
    }
}
