//! SOCKS5 wire protocol (RFC 1928), server side, CONNECT only

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;

pub const VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONN_NOT_ALLOWED: u8 = 0x02;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Destination named in a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

/// `host:port` as handed to the SSH transport: dotted quad, bracketed IPv6 or the raw name
impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            TargetAddr::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// Why a handshake ended without a usable CONNECT request
#[derive(Debug)]
pub enum HandshakeError {
    /// Client read/write failed or the client went away
    Io(std::io::Error),
    /// Greeting with a version other than 5
    BadGreetingVersion(u8),
    /// Client did not offer "no authentication"
    NoAcceptableMethod,
    /// Request with a version other than 5
    BadRequestVersion(u8),
    UnsupportedCommand(u8),
    UnsupportedAddressType(u8),
    /// Empty or non-UTF-8 domain name
    BadDomain,
}

impl HandshakeError {
    /// Reply code owed to the client, if the handshake got as far as a request
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            HandshakeError::Io(_)
            | HandshakeError::BadGreetingVersion(_)
            | HandshakeError::NoAcceptableMethod => None,
            HandshakeError::BadRequestVersion(_) | HandshakeError::BadDomain => {
                Some(REP_GENERAL_FAILURE)
            }
            HandshakeError::UnsupportedCommand(_) => Some(REP_CMD_NOT_SUPPORTED),
            HandshakeError::UnsupportedAddressType(_) => Some(REP_ADDR_NOT_SUPPORTED),
        }
    }
}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        HandshakeError::Io(err)
    }
}

impl From<HandshakeError> for TunnelError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Io(e) => TunnelError::Io(e),
            HandshakeError::BadGreetingVersion(v) => {
                TunnelError::ProtocolViolation(format!("unsupported SOCKS version {}", v))
            }
            HandshakeError::NoAcceptableMethod => {
                TunnelError::ProtocolViolation("client does not offer NO AUTH".to_string())
            }
            HandshakeError::BadRequestVersion(v) => {
                TunnelError::ProtocolViolation(format!("request with SOCKS version {}", v))
            }
            HandshakeError::UnsupportedCommand(cmd) => {
                TunnelError::ProtocolViolation(format!("unsupported command {:#04x}", cmd))
            }
            HandshakeError::UnsupportedAddressType(atyp) => {
                TunnelError::ProtocolViolation(format!("unsupported address type {:#04x}", atyp))
            }
            HandshakeError::BadDomain => {
                TunnelError::ProtocolViolation("empty or non UTF-8 domain name".to_string())
            }
        }
    }
}

/// Method negotiation: accept only "no authentication"
///
/// Answers `05 FF` for a wrong version or when 0x00 is not offered.
pub async fn negotiate_method<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION {
        stream.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await.ok();
        return Err(HandshakeError::BadGreetingVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await.ok();
        return Err(HandshakeError::NoAcceptableMethod);
    }

    stream.write_all(&[VERSION, AUTH_NONE]).await?;
    Ok(())
}

/// Read a request and return its CONNECT destination
///
/// The whole request, address included, is consumed before the command is
/// checked, so a rejected BIND or UDP ASSOCIATE leaves no unread bytes behind.
/// Does not answer; the caller owes the client a reply either way.
pub async fn read_connect_request<R>(stream: &mut R) -> Result<TargetAddr, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    // VER | CMD | RSV | ATYP
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != VERSION {
        return Err(HandshakeError::BadRequestVersion(head[0]));
    }

    let target = read_target(stream, head[3]).await?;

    if head[1] != CMD_CONNECT {
        return Err(HandshakeError::UnsupportedCommand(head[1]));
    }

    Ok(target)
}

/// DST.ADDR and DST.PORT for the given address type
async fn read_target<R>(stream: &mut R, atyp: u8) -> Result<TargetAddr, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ok(TargetAddr::Ipv4(Ipv4Addr::from(addr), read_port(stream).await?))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = read_port(stream).await?;
            let name = String::from_utf8(name).map_err(|_| HandshakeError::BadDomain)?;
            if name.is_empty() {
                return Err(HandshakeError::BadDomain);
            }
            Ok(TargetAddr::Domain(name, port))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ok(TargetAddr::Ipv6(Ipv6Addr::from(addr), read_port(stream).await?))
        }
        other => Err(HandshakeError::UnsupportedAddressType(other)),
    }
}

async fn read_port<R>(stream: &mut R) -> std::io::Result<u16>
where
    R: AsyncRead + Unpin,
{
    stream.read_u16().await
}

/// Send a SOCKS5 reply
///
/// BND.ADDR / BND.PORT are always 0.0.0.0:0.
pub async fn write_reply<W>(stream: &mut W, status: u8) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let reply = [VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn request(bytes: &[u8]) -> Result<TargetAddr, HandshakeError> {
        let (mut client, mut server) = duplex(512);
        client.write_all(bytes).await.unwrap();
        read_connect_request(&mut server).await
    }

    #[tokio::test]
    async fn test_negotiate_no_auth() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();
        negotiate_method(&mut server).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_other_methods() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let err = negotiate_method(&mut server).await.unwrap_err();
        assert!(matches!(err, HandshakeError::NoAcceptableMethod));
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_socks4() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x04, 0x01]).await.unwrap();
        let err = negotiate_method(&mut server).await.unwrap_err();
        assert!(matches!(err, HandshakeError::BadGreetingVersion(4)));
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_zero_methods_is_rejected() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x00]).await.unwrap();
        let err = negotiate_method(&mut server).await.unwrap_err();
        assert!(matches!(err, HandshakeError::NoAcceptableMethod));
    }

    #[tokio::test]
    async fn test_parse_address_types() {
        let target = request(&[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50])
            .await
            .unwrap();
        assert_eq!(target, TargetAddr::Ipv4(Ipv4Addr::LOCALHOST, 80));
        assert_eq!(target.to_string(), "127.0.0.1:80");

        let mut ipv6 = vec![0x05, 0x01, 0x00, 0x04];
        ipv6.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        ipv6.extend_from_slice(&[0x01, 0xBB]);
        let target = request(&ipv6).await.unwrap();
        assert_eq!(target.to_string(), "[::1]:443");

        let mut domain = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        domain.extend_from_slice(b"example.com");
        domain.extend_from_slice(&[0x08, 0xAE]);
        let target = request(&domain).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".into(), 2222));
    }

    #[tokio::test]
    async fn test_request_errors_carry_reply_codes() {
        let bind = request(&[0x05, CMD_BIND, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).await.unwrap_err();
        assert_eq!(bind.reply_code(), Some(REP_CMD_NOT_SUPPORTED));

        let udp = request(&[0x05, CMD_UDP_ASSOCIATE, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap_err();
        assert_eq!(udp.reply_code(), Some(REP_CMD_NOT_SUPPORTED));

        let atyp = request(&[0x05, 0x01, 0x00, 0x02, 1, 2, 3, 4, 0, 80]).await.unwrap_err();
        assert_eq!(atyp.reply_code(), Some(REP_ADDR_NOT_SUPPORTED));

        let version = request(&[0x04, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).await.unwrap_err();
        assert_eq!(version.reply_code(), Some(REP_GENERAL_FAILURE));

        let empty = request(&[0x05, 0x01, 0x00, 0x03, 0x00, 0x00, 0x50]).await.unwrap_err();
        assert_eq!(empty.reply_code(), Some(REP_GENERAL_FAILURE));

        let binary = request(&[0x05, 0x01, 0x00, 0x03, 0x02, 0xC3, 0x28, 0x00, 0x50])
            .await
            .unwrap_err();
        assert!(matches!(binary, HandshakeError::BadDomain));
    }

    #[tokio::test]
    async fn test_rejected_command_consumes_whole_request() {
        let (mut client, mut server) = duplex(512);
        let mut bind = vec![0x05, CMD_BIND, 0x00, ATYP_DOMAIN, 0x0B];
        bind.extend_from_slice(b"example.com");
        bind.extend_from_slice(&[0x00, 0x50]);
        client.write_all(&bind).await.unwrap();
        client.write_all(b"next").await.unwrap();

        let err = read_connect_request(&mut server).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedCommand(CMD_BIND)));

        let mut rest = [0u8; 4];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"next");
    }

    #[tokio::test]
    async fn test_truncated_request_is_io_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00, 0x01, 10]).await.unwrap();
        drop(client);
        let err = read_connect_request(&mut server).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Io(_)));
        assert_eq!(err.reply_code(), None);
    }

    #[tokio::test]
    async fn test_reply_layout() {
        let (mut client, mut server) = duplex(64);
        write_reply(&mut server, REP_CONN_REFUSED).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
