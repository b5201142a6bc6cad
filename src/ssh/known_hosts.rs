//! Known hosts lookup for SSH host key verification
//!
//! Reads OpenSSH `known_hosts` entries (plain or `[host]:port` patterns,
//! comma separated) and compares them with the key a server presents.
//! The store is read-only: nothing is ever written back.

use std::collections::HashMap;
use std::fs;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::KnownHostsSource;
use crate::error::TunnelError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// No entry for this host and key type
    Unknown { fingerprint: String },
    /// An entry of the same key type holds a different key (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory view of a known_hosts source
#[derive(Debug, Default)]
pub struct KnownHostsStore {
    /// Lookup key (`host` or `[host]:port`) -> keys, several key types per host
    hosts: HashMap<String, Vec<HostKeyEntry>>,
}

impl KnownHostsStore {
    /// Load entries from the given source
    pub fn load(source: &KnownHostsSource) -> Result<Self, TunnelError> {
        match source {
            KnownHostsSource::File(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    TunnelError::ConfigInvalid(format!(
                        "cannot read known_hosts {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let store = Self::parse(&content);
                info!(
                    "Loaded {} known hosts from {}",
                    store.hosts.len(),
                    path.display()
                );
                Ok(store)
            }
            KnownHostsSource::Inline(content) => Ok(Self::parse(content)),
        }
    }

    /// Parse `known_hosts` text
    pub fn parse(content: &str) -> Self {
        let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // @cert-authority / @revoked need CA support we do not have
            if line.starts_with('@') {
                debug!("Skipping marker line in known_hosts");
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for pattern in parts[0].split(',') {
                // Hashed hostnames (|1|salt|hash)
                if pattern.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_pattern(pattern))
                    .or_default()
                    .push(entry.clone());
            }
        }

        Self { hosts }
    }

    /// Number of distinct host patterns
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// `[HOST]:22` and `HOST` name the same entry
    fn normalize_pattern(pattern: &str) -> String {
        if let Some(rest) = pattern.strip_prefix('[') {
            if let Some((host, port)) = rest.split_once("]:") {
                if let Ok(port) = port.parse::<u16>() {
                    return Self::make_key(host, port);
                }
            }
        }
        pattern.to_lowercase()
    }

    /// Create lookup key for host:port
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let algorithm = key.algorithm();
        let actual_key_type = algorithm.as_str();
        self.verify_encoded(host, port, actual_key_type, &actual_key_b64)
    }

    fn verify_encoded(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_b64: &str,
    ) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let fingerprint = BASE64
            .decode(key_b64)
            .map(|bytes| Self::fingerprint_bytes(&bytes))
            .unwrap_or_else(|_| "unknown".to_string());

        let Some(entries) = self.hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        let mut same_type = entries.iter().filter(|e| e.key_type == key_type).peekable();
        if same_type.peek().is_none() {
            debug!("Host {} known but no {} key stored", lookup_key, key_type);
            return HostKeyVerification::Unknown { fingerprint };
        }

        let mut expected = None;
        for entry in same_type {
            if entry.key_data == key_b64 {
                debug!("Host key verified for {} (type: {})", lookup_key, key_type);
                return HostKeyVerification::Verified;
            }
            expected.get_or_insert_with(|| Self::compute_fingerprint_from_b64(&entry.key_data));
        }

        let expected_fingerprint = expected.unwrap_or_else(|| "unknown".to_string());
        warn!(
            "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
            lookup_key, key_type, expected_fingerprint, fingerprint
        );
        HostKeyVerification::Changed {
            expected_fingerprint,
            actual_fingerprint: fingerprint,
        }
    }

    /// Compute fingerprint from stored base64 key
    fn compute_fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => Self::fingerprint_bytes(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }
}
