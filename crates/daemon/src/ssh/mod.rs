// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - SSH Module
// Jump chains, authenticated sessions and their lifecycle events

pub mod authenticate;
pub mod handler;
pub mod jump;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use russh::client::Config;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use ssh_gateway_common::SecretResolver;

use crate::known_hosts::HostKeyVerifier;

pub use session::{Session, SessionGateway};

/// Duplex byte stream an SSH connection can ride on
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Transport for a chained connection: a forwarded channel of the previous hop
pub type Transport = Box<dyn AsyncStream>;

/// Progress of a session being established
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting { host: String, port: u16 },
    /// Jump host `index` (1-based) is authenticated and forwarding
    HopConnected { index: usize, host: String },
    Authenticating { host: String },
    Ready,
    Error(String),
    Closed,
}

pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

pub(crate) fn emit(events: &EventSink, event: SessionEvent) {
    // The receiver may have gone away with its client channel
    let _ = events.send(event);
}

/// Read-only services shared by every SSH connection
pub struct SshContext {
    pub host_keys: Arc<HostKeyVerifier>,
    pub secrets: Arc<dyn SecretResolver>,
    pub connect_timeout: Duration,
    pub config: Arc<Config>,
}

impl SshContext {
    pub fn new(
        host_keys: Arc<HostKeyVerifier>,
        secrets: Arc<dyn SecretResolver>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            host_keys,
            secrets,
            connect_timeout,
            config: client_config(),
        }
    }
}

/// russh client configuration shared by hops and targets
pub fn client_config() -> Arc<Config> {
    let mut cfg = Config::default();

    // disable nagle for interactive latency
    cfg.nodelay = true;

    // keepalives so dead hops are noticed
    cfg.keepalive_interval = Some(Duration::from_secs(30));
    cfg.keepalive_max = 3;

    Arc::new(cfg)
}
