// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Error types for SSH Gateway

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad access token or denied source address. Terminates the client channel.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// SSH handshake or authentication failure against the target host.
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Failure while building the jump chain; `index` is 1-based.
    #[error("Jump host #{index} ({host}) failed: {message}")]
    JumpHop {
        index: usize,
        host: String,
        message: String,
    },

    /// A single SFTP operation failed; the channel stays open.
    #[error("{0}")]
    Protocol(String),

    /// Remote command exited non-zero; carries captured stderr.
    #[error("{0}")]
    RemoteExec(String),

    #[error("Command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    #[error("{0}")]
    Validation(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("{what} exceeds the {limit} byte limit")]
    ResourceLimit { what: String, limit: u64 },

    /// A primary channel is already open on the session.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        GatewayError::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
