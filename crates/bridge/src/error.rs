// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared error taxonomy for the bridge.
//!
//! [`BridgeError`] classifies every recoverable failure into one of the
//! kinds the daemon knows how to react to: abort startup, trigger a
//! reconnect, or publish a record to `{prefix}/errors` and carry on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a bridge error, used to decide recovery behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing configuration. Fatal at startup, never recoverable.
    Config,
    /// Gateway login/authentication failed.
    Auth,
    /// Gateway socket loss or keepalive failure.
    Transport,
    /// Unknown node, refused command, or device-reported error status.
    Command,
    /// Bus publish or subscribe failure.
    Bus,
    /// Incoming payload could not be parsed.
    Parse,
    /// Registry snapshot could not be written.
    Persistence,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "CONFIG",
            Self::Auth => "AUTH",
            Self::Transport => "TRANSPORT",
            Self::Command => "COMMAND",
            Self::Bus => "BUS",
            Self::Parse => "PARSE",
            Self::Persistence => "PERSISTENCE",
        }
    }

    /// Whether this kind should abort the daemon before any connection opens.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::Config)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified bridge error with a human-readable message.
#[derive(Debug, Clone)]
pub struct BridgeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BridgeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Command, message)
    }

    pub fn bus(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Bus, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }

    /// Build the JSON record published to `{prefix}/errors`.
    pub fn to_error_record(&self, component: &str) -> ErrorRecord {
        ErrorRecord {
            timestamp: crate::util::iso8601_now(),
            severity: if matches!(self.kind, ErrorKind::Config | ErrorKind::Auth) {
                "error".to_owned()
            } else {
                "warning".to_owned()
            },
            component: component.to_owned(),
            message: self.message.clone(),
            details: Some(serde_json::json!({ "kind": self.kind.as_str() })),
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BridgeError {}

/// Wire record published to `{prefix}/errors`, per the bus topic map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub severity: String,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
