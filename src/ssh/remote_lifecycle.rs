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

//! Remote peer lifecycle (§4.7): OS detection, `iperf3` presence/install
//! across package managers, and daemon start/stop/restart/status, all
//! driven over one [`SshClient`].

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{ErrorKind, MeasurementError, Result};
use crate::orchestrator::RemoteControl;
use crate::ssh::client::SshClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOs {
    Linux,
    MacOs,
    Windows,
    Unknown,
}

struct DaemonState {
    running: bool,
    port: u32,
}

/// Owns one SSH connection to a remote measurement peer and the locally
/// cached daemon state (`running`, `port`), guarded by a mutex never
/// held across an SSH call (§5).
pub struct RemoteLifecycle {
    client: SshClient,
    host: String,
    state: Mutex<DaemonState>,
}

impl RemoteLifecycle {
    pub fn new(client: SshClient, host: String) -> Self {
        Self {
            client,
            host,
            state: Mutex::new(DaemonState { running: false, port: 0 }),
        }
    }

    /// `uname -s` → linux/darwin; else a Windows-only echo probe; else
    /// Unknown (§4.7).
    pub async fn detect_os(&self) -> RemoteOs {
        if let Ok(out) = self.client.run("uname -s").await {
            let out = out.trim().to_lowercase();
            if out.contains("linux") {
                return RemoteOs::Linux;
            }
            if out.contains("darwin") {
                return RemoteOs::MacOs;
            }
        }
        if self.client.run("cmd /c echo test").await.is_ok() {
            return RemoteOs::Windows;
        }
        RemoteOs::Unknown
    }

    /// `which iperf3` (POSIX) / `cmd /c where iperf3` (Windows).
    pub async fn is_installed(&self, os: RemoteOs) -> bool {
        let probe = match os {
            RemoteOs::Windows => "cmd /c where iperf3",
            _ => "which iperf3",
        };
        self.client.run(probe).await.is_ok()
    }

    /// Probes `sudo -n true` to check for passwordless elevation before
    /// attempting an install.
    async fn has_elevation(&self) -> bool {
        self.client.run("sudo -n true").await.is_ok()
    }

    /// Installs `iperf3` via the first available package manager for
    /// `os` (§4.7 table), then re-probes presence; mismatch is an
    /// `install` error.
    pub async fn install(&self, os: RemoteOs) -> Result<()> {
        if os != RemoteOs::MacOs && !self.has_elevation().await {
            return Err(MeasurementError::new(
                ErrorKind::Install,
                "remote.install",
                "no passwordless sudo/admin elevation available",
            ));
        }

        let install_cmd = match os {
            RemoteOs::Linux => self.linux_install_command().await?,
            RemoteOs::MacOs => {
                if self.client.run("which brew").await.is_ok() {
                    "brew install iperf3".to_string()
                } else {
                    return Err(MeasurementError::new(
                        ErrorKind::Install,
                        "remote.install",
                        "no Homebrew found; install iperf3 manually",
                    ));
                }
            }
            RemoteOs::Windows => self.windows_install_command().await?,
            RemoteOs::Unknown => {
                return Err(MeasurementError::new(ErrorKind::Install, "remote.install", "unknown remote OS"));
            }
        };

        self.client.run(&install_cmd).await?;
        if !self.is_installed(os).await {
            return Err(MeasurementError::new(
                ErrorKind::Install,
                "remote.install",
                "post-install presence check failed",
            ));
        }
        Ok(())
    }

    async fn linux_install_command(&self) -> Result<String> {
        const CANDIDATES: &[(&str, &str)] = &[
            ("which apt-get", "sudo apt-get update && sudo apt-get install -y iperf3"),
            ("which yum", "sudo yum install -y iperf3"),
            ("which dnf", "sudo dnf install -y iperf3"),
            ("which apk", "sudo apk add iperf3"),
            ("which pacman", "sudo pacman -S --noconfirm iperf3"),
        ];
        for (probe, install) in CANDIDATES {
            if self.client.run(probe).await.is_ok() {
                return Ok(install.to_string());
            }
        }
        Err(MeasurementError::new(
            ErrorKind::Install,
            "remote.install",
            "no supported package manager found (apt-get, yum, dnf, apk, pacman)",
        ))
    }

    async fn windows_install_command(&self) -> Result<String> {
        if self.client.run("choco --version").await.is_ok() {
            return Ok("choco install -y iperf3".to_string());
        }
        if self.client.run("winget --version").await.is_ok() {
            return Ok("winget install iperf3".to_string());
        }
        Err(MeasurementError::new(
            ErrorKind::Install,
            "remote.install",
            "neither choco nor winget found",
        ))
    }

    /// `iperf3 -s -p <port> -D` (daemon mode).
    pub async fn start(&self, port: u32) -> Result<()> {
        self.client.run(&format!("iperf3 -s -p {port} -D")).await?;
        let mut state = self.state.lock().unwrap();
        state.running = true;
        state.port = port;
        Ok(())
    }

    /// `pkill -f 'iperf3 -s'`, falling back to `killall iperf3`.
    pub async fn stop(&self) -> Result<()> {
        if self.client.run("pkill -f 'iperf3 -s'").await.is_err() {
            self.client.run("killall iperf3").await?;
        }
        let mut state = self.state.lock().unwrap();
        state.running = false;
        Ok(())
    }

    /// `pgrep -f 'iperf3 -s'`; empty output means not running. `pgrep`'s
    /// exit-1 "not found" case must not be treated as an error (§4.7).
    pub async fn status(&self) -> bool {
        match self.client.run("pgrep -f 'iperf3 -s'").await {
            Ok(out) => !out.trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Force-kills (`pkill -9 iperf3`) then starts.
    pub async fn restart(&self, port: u32) -> Result<()> {
        let _ = self.client.run("pkill -9 iperf3").await;
        self.start(port).await
    }
}

#[async_trait]
impl RemoteControl for RemoteLifecycle {
    async fn connected(&self) -> bool {
        self.client.run("true").await.is_ok()
    }

    async fn restart_server(&self, port: u32) -> Result<()> {
        info!(port, "restarting remote iperf3 server after server-busy");
        self.restart(port).await
    }

    fn peer_host(&self) -> String {
        self.host.clone()
    }
}

impl Drop for RemoteLifecycle {
    fn drop(&mut self) {
        if let Ok(state) = self.state.lock() {
            if state.running {
                warn!("RemoteLifecycle dropped while server still marked running; it was not stopped");
            }
        }
    }
}
