//! Target address handling for direct-tcpip channel opens

use std::net::IpAddr;

use crate::error::{RefusalReason, TunnelError};

/// Address family requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn parse(network: &str) -> Option<Self> {
        match network {
            "tcp" => Some(Network::Tcp),
            "tcp4" => Some(Network::Tcp4),
            "tcp6" => Some(Network::Tcp6),
            _ => None,
        }
    }

    /// Literal addresses must match the family; names are resolved remotely
    fn admits(self, host: &str) -> bool {
        match (self, host.parse::<IpAddr>()) {
            (Network::Tcp, _) | (_, Err(_)) => true,
            (Network::Tcp4, Ok(ip)) => ip.is_ipv4(),
            (Network::Tcp6, Ok(ip)) => ip.is_ipv6(),
        }
    }
}

/// A validated `host:port` to hand to the SSH server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Validate `network` and split `address` into host and port.
    ///
    /// The host is never resolved locally: names travel verbatim so the
    /// SSH server resolves them in its own network.
    pub fn parse(network: &str, address: &str) -> Result<Self, TunnelError> {
        let network = Network::parse(network)
            .ok_or_else(|| TunnelError::refused(address, RefusalReason::UnsupportedNetwork))?;
        let invalid = || TunnelError::refused(address, RefusalReason::InvalidAddress);

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            if host.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(invalid());
            }
            (host, port)
        } else {
            let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
            // Unbracketed IPv6 is ambiguous
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if !network.admits(host) {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(err: TunnelError) -> RefusalReason {
        match err {
            TunnelError::StreamOpenRefused { reason, .. } => reason,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            Target::parse("tcp", "127.0.0.1:80").unwrap(),
            Target { host: "127.0.0.1".into(), port: 80 }
        );
        assert_eq!(
            Target::parse("tcp", "[2001:db8::1]:443").unwrap(),
            Target { host: "2001:db8::1".into(), port: 443 }
        );
        assert_eq!(
            Target::parse("tcp", "intranet.corp:8080").unwrap(),
            Target { host: "intranet.corp".into(), port: 8080 }
        );
    }

    #[test]
    fn test_unsupported_network() {
        for network in ["udp", "unix", "", "TCP"] {
            let err = Target::parse(network, "127.0.0.1:80").unwrap_err();
            assert_eq!(reason(err), RefusalReason::UnsupportedNetwork, "{network}");
        }
    }

    #[test]
    fn test_invalid_addresses() {
        for address in ["127.0.0.1", ":80", "host:", "host:70000", "::1:80", "[nothex]:80", "[::1]"] {
            let err = Target::parse("tcp", address).unwrap_err();
            assert_eq!(reason(err), RefusalReason::InvalidAddress, "{address}");
        }
    }

    #[test]
    fn test_family_restrictions() {
        assert!(Target::parse("tcp4", "10.1.2.3:22").is_ok());
        assert!(Target::parse("tcp4", "[::1]:22").is_err());
        assert!(Target::parse("tcp6", "[::1]:22").is_ok());
        assert!(Target::parse("tcp6", "10.1.2.3:22").is_err());
        // names are left to the remote resolver
        assert!(Target::parse("tcp6", "example.com:22").is_ok());
    }

    #[test]
    fn test_display_round_trips() {
        for address in ["10.0.0.1:22", "[fe80::1]:8080", "db.internal:5432"] {
            assert_eq!(Target::parse("tcp", address).unwrap().to_string(), address);
        }
    }
}
