//! In-process SSH server for tests
//!
//! Presents `KEY_B` as its host key, accepts only `KEY_A` and serves
//! direct-tcpip by dialing the requested target from the test process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::client::decode_private_key;
use super::config::{HostKeyPolicy, KnownHostsSource, SshConfig};
use super::known_hosts::KnownHostsStore;
use super::test_keys::{KEY_A, KEY_B};

pub(crate) struct TestServer {
    pub addr: SocketAddr,
    /// known_hosts entry for this server's host key
    pub known_hosts_line: String,
    /// Every direct-tcpip target requested, as `host:port`
    pub opened: Arc<parking_lot::Mutex<Vec<String>>>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let host_key = decode_private_key(KEY_B.as_bytes(), None).unwrap();
        let authorized = decode_private_key(KEY_A.as_bytes(), None).unwrap();
        let authorized = KnownHostsStore::fingerprint(authorized.public_key());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let known_hosts_line = format!(
            "[127.0.0.1]:{} {}",
            addr.port(),
            host_key.public_key().to_openssh().unwrap()
        );

        let mut config = server::Config {
            auth_rejection_time: Duration::from_millis(50),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            ..Default::default()
        };
        config.keys.push(host_key);
        let config = Arc::new(config);

        let opened = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let accept_task = {
            let opened = opened.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let handler = TunnelHandler {
                        authorized: authorized.clone(),
                        opened: opened.clone(),
                    };
                    let config = config.clone();
                    tokio::spawn(async move {
                        if let Ok(session) = server::run_stream(config, socket, handler).await {
                            let _ = session.await;
                        }
                    });
                }
            })
        };

        Self {
            addr,
            known_hosts_line,
            opened,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Client settings that log in with `key` and pin this server's host key
    pub fn client_config(&self, key: &str) -> SshConfig {
        SshConfig::new("127.0.0.1", "ops", key.as_bytes().to_vec())
            .with_port(self.port())
            .with_host_key_policy(HostKeyPolicy::KnownHosts(KnownHostsSource::Inline(
                self.known_hosts_line.clone(),
            )))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct TunnelHandler {
    authorized: String,
    opened: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl server::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if KnownHostsStore::fingerprint(public_key) == self.authorized {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.opened
            .lock()
            .push(format!("{}:{}", host_to_connect, port_to_connect));

        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        let Ok(mut target) = TcpStream::connect((host_to_connect, port)).await else {
            return Ok(false);
        };
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut target).await;
        });
        Ok(true)
    }
}

/// Plain TCP echo service; each connection echoes until the peer half-closes
pub(crate) async fn echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });
    addr
}

/// A loopback port nothing listens on
pub(crate) fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
