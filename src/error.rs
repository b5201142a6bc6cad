//! Error types shared by the SSH transport, the SOCKS5 frontend and the lifecycle controller

use std::fmt;

use thiserror::Error;

use crate::forwarding::socks5;

/// Why a tunneled stream could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    /// `network` was not one of tcp, tcp4, tcp6
    UnsupportedNetwork,
    /// `address` was not a usable `host:port`
    InvalidAddress,
    /// The SSH server could not connect to the target (refused, reset, ...)
    ConnectFailed,
    /// The SSH server forbids direct-tcpip to this target
    Prohibited,
    /// The SSH server reported the target as unreachable or out of resources
    Unreachable,
    /// The channel open did not complete in time
    TimedOut,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RefusalReason::UnsupportedNetwork => "unsupported network",
            RefusalReason::InvalidAddress => "invalid address",
            RefusalReason::ConnectFailed => "connect failed",
            RefusalReason::Prohibited => "administratively prohibited",
            RefusalReason::Unreachable => "unreachable",
            RefusalReason::TimedOut => "timed out",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Bind failed: {0}")]
    BindFailure(String),

    #[error("SSH session closed")]
    SessionClosed,

    #[error("Stream open to {target} refused: {reason}")]
    StreamOpenRefused {
        target: String,
        reason: RefusalReason,
    },

    #[error("SOCKS5 protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Protocol(String),
}

impl TunnelError {
    pub(crate) fn refused(target: impl Into<String>, reason: RefusalReason) -> Self {
        TunnelError::StreamOpenRefused {
            target: target.into(),
            reason,
        }
    }

    /// SOCKS5 `REP` code reported to the client when opening its stream failed
    pub fn socks_reply(&self) -> u8 {
        match self {
            TunnelError::StreamOpenRefused { reason, .. } => match reason {
                RefusalReason::ConnectFailed => socks5::REP_CONN_REFUSED,
                RefusalReason::Unreachable => socks5::REP_HOST_UNREACHABLE,
                RefusalReason::TimedOut => socks5::REP_TTL_EXPIRED,
                RefusalReason::Prohibited => socks5::REP_CONN_NOT_ALLOWED,
                RefusalReason::UnsupportedNetwork | RefusalReason::InvalidAddress => {
                    socks5::REP_GENERAL_FAILURE
                }
            },
            TunnelError::Timeout(_) => socks5::REP_TTL_EXPIRED,
            _ => socks5::REP_GENERAL_FAILURE,
        }
    }

    /// Process exit status for an error that ends the program
    pub fn exit_code(&self) -> i32 {
        match self {
            TunnelError::ConfigInvalid(_) => 2,
            TunnelError::AuthFailure(_) => 3,
            TunnelError::NetworkUnreachable(_) => 4,
            TunnelError::HostKeyRejected(_) => 5,
            TunnelError::BindFailure(_) => 6,
            TunnelError::SessionClosed => 7,
            _ => 1,
        }
    }
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => TunnelError::SessionClosed,
            other => TunnelError::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for TunnelError {
    fn from(err: russh::keys::Error) -> Self {
        TunnelError::AuthFailure(format!("unusable private key: {}", err))
    }
}
