//! # iperf3-core
//!
//! Orchestrates iperf3 + ping measurements, manages a remote iperf3 peer
//! over SSH, and persists historical results.

// Copyright (c) 2025 Jak Bracegirdle
//
// This file is part of the iperf3-core crate.
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! One SSH connection to a remote measurement peer (§4.6): agent/key/
//! password auth in a fixed order, known_hosts verification with an
//! insecure fallback, `~/.ssh/config` ProxyCommand support, and a
//! one-session-per-call `run()`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh_keys::key::{self, PublicKey};
use tracing::warn;

use crate::error::{ErrorKind, MeasurementError, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEY_NAMES: &[&str] = &["id_ed25519", "id_rsa", "id_ecdsa"];

/// Connection parameters for one remote peer.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: String::new(),
            key_path: None,
            password: None,
        }
    }
}

/// An established SSH connection. One `Handle` per connection; `run()`
/// opens and closes a fresh channel/session per call (§4.6).
pub struct SshClient {
    handle: Handle<ClientHandler>,
}

struct ClientHandler {
    known_hosts_path: Option<PathBuf>,
    host: String,
    port: u16,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    /// Verifies against `~/.ssh/known_hosts` when present; falls back to
    /// insecure-accept-any with a logged warning otherwise (§4.6 — a
    /// deliberate trade-off documented as such, not silent).
    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        match &self.known_hosts_path {
            Some(path) if path.exists() => {
                match russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path) {
                    Ok(known) => Ok(known),
                    Err(_) => {
                        warn!("host key not found in known_hosts; accepting (insecure fallback)");
                        Ok(true)
                    }
                }
            }
            _ => {
                warn!("no known_hosts file found; accepting server key without verification");
                Ok(true)
            }
        }
    }
}

impl SshClient {
    /// Dials the peer, honoring a matching `ProxyCommand` from
    /// `~/.ssh/config` if one exists, with a 10 s dial timeout.
    pub async fn connect(config: &SshConfig) -> Result<Self> {
        let client_config = Arc::new(client::Config::default());
        let known_hosts_path = dirs_home().map(|h| h.join(".ssh").join("known_hosts"));
        let handler = ClientHandler {
            known_hosts_path,
            host: config.host.clone(),
            port: config.port,
        };

        let connect_fut = match find_proxy_command(&config.host, config.port) {
            Some(command) => connect_via_proxy(client_config, handler, &command),
            None => {
                let addr = (config.host.as_str(), config.port);
                Box::pin(async move { client::connect(client_config, addr, handler).await })
                    as std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<Handle<ClientHandler>, russh::Error>> + Send>>
            }
        };

        let handle = tokio::time::timeout(DIAL_TIMEOUT, connect_fut)
            .await
            .map_err(|_| {
                MeasurementError::new(
                    ErrorKind::SshDial,
                    "ssh.connect",
                    format!("dial to {}:{} timed out after {:?}", config.host, config.port, DIAL_TIMEOUT),
                )
            })?
            .map_err(|e| {
                MeasurementError::with_source(
                    ErrorKind::SshDial,
                    "ssh.connect",
                    format!("failed to dial {}:{}", config.host, config.port),
                    e,
                )
            })?;

        let mut client = Self { handle };
        client.authenticate(config).await?;
        Ok(client)
    }

    /// Auth order (§4.6): agent signers, explicit key, default
    /// `~/.ssh/{id_ed25519,id_rsa,id_ecdsa}`, then password. Returns
    /// `ssh-auth` if nothing authenticates.
    async fn authenticate(&mut self, config: &SshConfig) -> Result<()> {
        if std::env::var_os("SSH_AUTH_SOCK").is_some() {
            if let Ok(mut agent) = russh_keys::agent::client::AgentClient::connect_env().await {
                if let Ok(identities) = agent.request_identities().await {
                    for key in identities {
                        if let Ok(true) = self
                            .handle
                            .authenticate_future(config.user.clone(), key, agent.clone())
                            .await
                            .map(|(_, ok)| ok)
                        {
                            return Ok(());
                        }
                    }
                }
            }
        }

        let mut candidate_keys: Vec<PathBuf> = Vec::new();
        if let Some(path) = &config.key_path {
            candidate_keys.push(path.clone());
        } else if let Some(home) = dirs_home() {
            for name in DEFAULT_KEY_NAMES {
                let path = home.join(".ssh").join(name);
                if path.exists() {
                    candidate_keys.push(path);
                }
            }
        }

        for path in candidate_keys {
            if let Ok(key_pair) = russh_keys::load_secret_key(&path, None) {
                if self
                    .handle
                    .authenticate_publickey(config.user.clone(), Arc::new(key_pair))
                    .await
                    .unwrap_or(false)
                {
                    return Ok(());
                }
            }
        }

        if let Some(password) = &config.password {
            if self
                .handle
                .authenticate_password(config.user.clone(), password)
                .await
                .unwrap_or(false)
            {
                return Ok(());
            }
        }

        Err(MeasurementError::new(
            ErrorKind::SshAuth,
            "ssh.authenticate",
            "no authentication method succeeded (agent, key, or password)",
        ))
    }

    /// Runs one command in a fresh channel, closed on every exit path.
    /// Returns the combined stdout+stderr; a nonzero exit is a
    /// `ssh-command` error carrying that output (§4.6 — callers commonly
    /// need it, e.g. package-manager presence checks).
    pub async fn run(&self, cmd: &str) -> Result<String> {
        let mut channel = self.handle.channel_open_session().await.map_err(|e| {
            MeasurementError::with_source(ErrorKind::SshCommand, "ssh.run", "failed to open channel", e)
        })?;
        channel.exec(true, cmd).await.map_err(|e| {
            MeasurementError::with_source(ErrorKind::SshCommand, "ssh.run", format!("failed to exec '{cmd}'"), e)
        })?;

        let mut output = Vec::new();
        let mut exit_status: Option<u32> = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                russh::ChannelMsg::Data { data } => output.extend_from_slice(&data),
                russh::ChannelMsg::ExtendedData { data, .. } => output.extend_from_slice(&data),
                russh::ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
                _ => {}
            }
        }

        let combined = String::from_utf8_lossy(&output).to_string();
        match exit_status {
            Some(0) | None => Ok(combined),
            Some(status) => Err(MeasurementError::new(
                ErrorKind::SshCommand,
                "ssh.run",
                format!("'{cmd}' exited with status {status}"),
            )
            .with_output(combined)),
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Looks for a `ProxyCommand` in `~/.ssh/config` matching `host` (simple
/// `*` / `*.suffix` globs), substituting `%h`/`%p` (§4.6).
fn find_proxy_command(host: &str, port: u16) -> Option<String> {
    let home = dirs_home()?;
    let config_path = home.join(".ssh").join("config");
    let contents = std::fs::read_to_string(config_path).ok()?;

    let mut current_matches = false;
    for line in contents.lines() {
        let line = line.trim();
        if let Some(pattern) = line.strip_prefix("Host ").or_else(|| line.strip_prefix("host ")) {
            current_matches = pattern.split_whitespace().any(|p| host_matches_glob(host, p));
            continue;
        }
        if !current_matches {
            continue;
        }
        if let Some(cmd) = line.strip_prefix("ProxyCommand ").or_else(|| line.strip_prefix("proxycommand ")) {
            return Some(cmd.replace("%h", host).replace("%p", &port.to_string()));
        }
    }
    None
}

fn host_matches_glob(host: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.ends_with(suffix);
    }
    host == pattern
}

fn connect_via_proxy(
    config: Arc<client::Config>,
    handler: ClientHandler,
    command: &str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<Handle<ClientHandler>, russh::Error>> + Send>>
{
    let command = command.to_string();
    Box::pin(async move {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .map_err(|_| russh::Error::IO(std::io::Error::new(std::io::ErrorKind::Other, "failed to spawn ProxyCommand")))?;
        let stream = ProxyStream::new(child);
        client::connect_stream(config, stream, handler).await
    })
}

/// Adapts a spawned `ProxyCommand` child's stdin/stdout into a single
/// duplex stream for the SSH transport.
struct ProxyStream {
    child: tokio::process::Child,
}

impl ProxyStream {
    fn new(child: tokio::process::Child) -> Self {
        Self { child }
    }
}

impl tokio::io::AsyncRead for ProxyStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let stdout = this.child.stdout.as_mut().expect("proxy stdout piped");
        std::pin::Pin::new(stdout).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for ProxyStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let stdin = this.child.stdin.as_mut().expect("proxy stdin piped");
        std::pin::Pin::new(stdin).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let stdin = this.child.stdin.as_mut().expect("proxy stdin piped");
        std::pin::Pin::new(stdin).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let stdin = this.child.stdin.as_mut().expect("proxy stdin piped");
        std::pin::Pin::new(stdin).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_glob_matches_exact_and_wildcard() {
        assert!(host_matches_glob("jump.example.com", "*"));
        assert!(host_matches_glob("db.internal.example.com", "*.example.com"));
        assert!(!host_matches_glob("db.internal.other.com", "*.example.com"));
        assert!(host_matches_glob("jump.example.com", "jump.example.com"));
    }

    #[test]
    fn proxy_command_substitutes_host_and_port() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".ssh")).unwrap();
        std::fs::write(
            dir.path().join(".ssh").join("config"),
            "Host *.internal\n  ProxyCommand ssh -W %h:%p jump.example.com\n",
        )
        .unwrap();
        std::env::set_var("HOME", dir.path());
        let cmd = find_proxy_command("db.internal", 5201);
        assert_eq!(cmd.as_deref(), Some("ssh -W db.internal:5201 jump.example.com"));
    }
}
