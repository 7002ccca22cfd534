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

//! Error taxonomy shared by every component.
//!
//! Each variant corresponds to one of the error *kinds* in the
//! specification: a stable, matchable discriminant plus free-form
//! context a human (or a log line) can read. Components that recover
//! locally (baseline ping failure, `server-busy`, tool-reported errors)
//! never propagate these; they stay internal to the orchestrator.

use std::fmt;

/// The crate-wide result alias. Prefer this over `anyhow::Result` since
/// callers need to match on [`MeasurementError::kind`], not just log and
/// bail.
pub type Result<T> = std::result::Result<T, MeasurementError>;

/// A matchable error kind, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Measurement configuration failed validation before any subprocess
    /// was spawned.
    Config,
    /// The external tool (`iperf3` or `ping`) could not be launched.
    Spawn,
    /// JSON or stream-event output was malformed and no partial result
    /// could be recovered.
    Parse,
    /// The external tool reported an `error` field; captured into the
    /// result rather than raised, but still representable as an error
    /// for callers that want to short-circuit.
    ToolReported,
    /// Distinguishable sentinel used to trigger the one-shot SSH restart
    /// retry.
    ServerBusy,
    /// No acceptable SSH authentication method was available.
    SshAuth,
    /// Network failure while dialing the SSH peer.
    SshDial,
    /// A remote command returned a nonzero exit status.
    SshCommand,
    /// OS unsupported, no package manager, no privilege, or the
    /// post-install presence check failed.
    Install,
    /// Filesystem error while writing a persistence artifact.
    Persistence,
    /// User-initiated stop; not itself a failure, but distinguishable
    /// from natural completion.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::Spawn => "spawn",
            ErrorKind::Parse => "parse",
            ErrorKind::ToolReported => "tool-reported",
            ErrorKind::ServerBusy => "server-busy",
            ErrorKind::SshAuth => "ssh-auth",
            ErrorKind::SshDial => "ssh-dial",
            ErrorKind::SshCommand => "ssh-command",
            ErrorKind::Install => "install",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type. Carries a [`ErrorKind`], the operation that
/// failed, a human-readable detail, and, for `ssh-command`, the remote
/// command's combined stdout+stderr (callers commonly need the output
/// even on failure, e.g. package-manager presence checks).
#[derive(Debug, thiserror::Error)]
#[error("{operation}: {detail}")]
pub struct MeasurementError {
    pub kind: ErrorKind,
    pub operation: String,
    pub detail: String,
    pub command_output: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl MeasurementError {
    pub fn new(kind: ErrorKind, operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            detail: detail.into(),
            command_output: None,
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        operation: impl Into<String>,
        detail: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            detail: detail.into(),
            command_output: None,
            source: Some(Box::new(source)),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.command_output = Some(output.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn config(field: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, format!("validate.{field}"), detail)
    }
}
