//! sshsocks - SOCKS5 proxy whose connections leave from an SSH server
//!
//! Opens one SSH session and serves a local SOCKS5 endpoint over it until
//! SIGINT/SIGTERM.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use sshsocks::config::{self, ConfigFile, HostKeyPolicyKind};
use sshsocks::{logging, LifecycleController, TunnelError};

/// Tunnel SOCKS5 connections through an SSH server
#[derive(Parser, Debug)]
#[command(name = "sshsocks")]
#[command(about = "Local SOCKS5 proxy tunneled through an SSH session")]
#[command(version)]
struct Args {
    /// JSON config file; flags override its values
    #[arg(short, long, env = "SSHSOCKS_CONFIG")]
    config: Option<PathBuf>,

    /// SSH server host
    #[arg(long, env = "SSHSOCKS_HOST")]
    host: Option<String>,

    /// SSH server port
    #[arg(short, long, env = "SSHSOCKS_PORT")]
    port: Option<u16>,

    /// SSH username
    #[arg(short, long, env = "SSHSOCKS_USER")]
    user: Option<String>,

    /// Private key file (PEM or OpenSSH format)
    #[arg(short, long, env = "SSHSOCKS_IDENTITY")]
    identity: Option<PathBuf>,

    /// Passphrase for an encrypted private key
    #[arg(long, env = "SSHSOCKS_KEY_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// known_hosts file used to verify the server (default: ~/.ssh/known_hosts)
    #[arg(long, env = "SSHSOCKS_KNOWN_HOSTS")]
    known_hosts: Option<PathBuf>,

    /// Accept any host key (insecure, only for hosts you just created)
    #[arg(long)]
    insecure_trust_on_use: bool,

    /// SOCKS5 listen address
    #[arg(short, long, env = "SSHSOCKS_BIND")]
    bind: Option<String>,

    /// Seconds in-flight connections get to finish at shutdown
    #[arg(long, env = "SSHSOCKS_SHUTDOWN_GRACE")]
    shutdown_grace: Option<u64>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info", env = "SSHSOCKS_LOG_LEVEL")]
    log_level: String,
}

impl Args {
    /// Overlay command-line values on the file configuration
    fn apply(&self, file: &mut ConfigFile) {
        if let Some(host) = &self.host {
            file.ssh.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            file.ssh.port = Some(port);
        }
        if let Some(user) = &self.user {
            file.ssh.username = Some(user.clone());
        }
        if let Some(identity) = &self.identity {
            file.ssh.private_key_path = Some(identity.clone());
        }
        if let Some(passphrase) = &self.passphrase {
            file.ssh.passphrase = Some(passphrase.clone());
        }
        if let Some(known_hosts) = &self.known_hosts {
            file.ssh.known_hosts_path = Some(known_hosts.clone());
        }
        if self.insecure_trust_on_use {
            file.ssh.host_key_policy = Some(HostKeyPolicyKind::TrustOnUse);
        }
        if let Some(bind) = &self.bind {
            file.socks.bind = Some(bind.clone());
        }
        if let Some(grace) = self.shutdown_grace {
            file.shutdown_grace_secs = Some(grace);
        }
    }
}

async fn load_config(args: &Args) -> Result<config::TunnelConfig> {
    let mut file = match &args.config {
        Some(path) => config::load_config_file(path)
            .await
            .map_err(TunnelError::from)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => ConfigFile::default(),
    };
    args.apply(&mut file);

    let key_path = file.private_key_path()?.clone();
    let key = config::read_private_key(&key_path)
        .await
        .map_err(TunnelError::from)
        .with_context(|| format!("Failed to read private key {}", key_path.display()))?;

    Ok(file.to_tunnel_config(key)?)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args).await?;
    info!(
        "Tunneling SOCKS5 on {} through {}@{}",
        config.socks.local_addr,
        config.ssh.username,
        config.ssh.endpoint()
    );
    LifecycleController::new(config).run().await?;
    Ok(())
}

/// Nonzero status for a fatal error, by kind when it is a `TunnelError`
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<TunnelError>()
        .map(TunnelError::exit_code)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    if let Err(err) = run(args).await {
        error!("{:#}", err);
        std::process::exit(exit_code(&err));
    }
    info!("sshsocks exited cleanly");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let args = Args::parse_from([
            "sshsocks",
            "--host",
            "10.1.2.3",
            "-u",
            "ec2-user",
            "-i",
            "/keys/id",
            "--bind",
            "127.0.0.1:9050",
            "--insecure-trust-on-use",
        ]);
        let mut file = ConfigFile::default();
        file.ssh.host = Some("old-host".into());
        file.ssh.port = Some(2200);
        args.apply(&mut file);

        assert_eq!(file.ssh.host.as_deref(), Some("10.1.2.3"));
        assert_eq!(file.ssh.port, Some(2200));
        assert_eq!(file.ssh.username.as_deref(), Some("ec2-user"));
        assert_eq!(file.ssh.host_key_policy, Some(HostKeyPolicyKind::TrustOnUse));
        assert_eq!(file.socks.bind.as_deref(), Some("127.0.0.1:9050"));
    }

    #[tokio::test]
    async fn test_missing_key_path_is_config_error() {
        let args = Args::parse_from(["sshsocks", "--host", "h", "--user", "u"]);
        let err = load_config(&args).await.unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[tokio::test]
    async fn test_unreadable_key_is_config_error() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("id_missing");
        let args = Args::parse_from([
            "sshsocks",
            "--host",
            "h",
            "--user",
            "u",
            "--identity",
            missing.to_str().unwrap(),
        ]);
        let err = load_config(&args).await.unwrap_err();
        assert_eq!(exit_code(&err), 2);
        assert!(format!("{:#}", err).contains("id_missing"));
    }

    #[test]
    fn test_other_errors_exit_one() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code(&err), 1);
    }
}
