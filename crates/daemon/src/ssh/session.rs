// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Session gateway: an authenticated connection to the final target holding
// at most one primary channel (shell or SFTP)

use std::sync::Arc;

use russh::client::{Handle, Msg};
use russh::Channel;
use russh_sftp::client::SftpSession;
use tracing::{debug, info, warn};

use ssh_gateway_common::{format_host_port, ConnectionProfile, GatewayError, Result, WindowSize};

use super::handler::ClientHandler;
use super::jump::{connect_through, disconnect, JumpChain, SshConnector, SshLink};
use super::{emit, EventSink, SessionEvent, SshContext};

/// Terminal type requested for interactive shells
pub const TERM_TYPE: &str = "xterm-color";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticated,
    ChannelOpen,
    Closed,
    Errored,
}

impl SessionState {
    /// Move to `ChannelOpen`; only one primary channel per session
    fn claim_primary(&mut self) -> Result<()> {
        match *self {
            SessionState::Authenticated => {
                *self = SessionState::ChannelOpen;
                Ok(())
            }
            SessionState::ChannelOpen => Err(GatewayError::Conflict(
                "session already has an open shell or SFTP channel".to_string(),
            )),
            other => Err(GatewayError::Connection(format!(
                "cannot open a channel on a session in state {:?}",
                other
            ))),
        }
    }
}

/// Creates sessions from resolved profiles
#[derive(Clone)]
pub struct SessionGateway {
    connector: SshConnector,
}

impl SessionGateway {
    pub fn new(ctx: Arc<SshContext>) -> Self {
        Self {
            connector: SshConnector::new(ctx),
        }
    }

    /// Build the jump chain (if any) and authenticate to the target
    pub async fn connect(&self, profile: &ConnectionProfile, events: &EventSink) -> Result<Session> {
        emit(
            events,
            SessionEvent::Connecting {
                host: profile.host.clone(),
                port: profile.port,
            },
        );

        let (link, chain) =
            connect_through(&self.connector, &profile.jump_hosts, &profile.endpoint(), events)
                .await?;

        info!(
            "Session established: {}@{}",
            profile.username,
            format_host_port(&profile.host, profile.port)
        );
        emit(events, SessionEvent::Ready);

        Ok(Session {
            profile: profile.clone(),
            handle: Arc::new(link.into_handle()),
            chain,
            state: SessionState::Authenticated,
            events: events.clone(),
        })
    }
}

/// One authenticated connection, owned by a single client channel
pub struct Session {
    profile: ConnectionProfile,
    handle: Arc<Handle<ClientHandler>>,
    chain: Option<JumpChain<SshLink>>,
    state: SessionState,
    events: EventSink,
}

impl Session {
    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// Shared handle for auxiliary exec channels
    pub fn handle(&self) -> Arc<Handle<ClientHandler>> {
        self.handle.clone()
    }

    pub fn is_open(&self) -> bool {
        !self.handle.is_closed()
            && matches!(
                self.state,
                SessionState::Authenticated | SessionState::ChannelOpen
            )
    }

    /// Open the interactive shell with a pty of the given size
    pub async fn open_shell(&mut self, size: WindowSize) -> Result<Channel<Msg>> {
        self.state.claim_primary()?;

        let result = async {
            let channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(GatewayError::connection)?;
            channel
                .request_pty(true, TERM_TYPE, size.cols, size.rows, 0, 0, &[])
                .await
                .map_err(GatewayError::connection)?;
            channel
                .request_shell(true)
                .await
                .map_err(GatewayError::connection)?;
            Ok::<_, GatewayError>(channel)
        }
        .await;

        if result.is_err() {
            self.state = SessionState::Errored;
        }
        result
    }

    /// Open the SFTP subsystem
    pub async fn open_sftp(&mut self) -> Result<SftpSession> {
        self.state.claim_primary()?;

        let result = async {
            let channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(GatewayError::connection)?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(GatewayError::connection)?;
            SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| GatewayError::Connection(format!("SFTP init failed: {}", e)))
        }
        .await;

        if result.is_err() {
            self.state = SessionState::Errored;
        }
        result
    }

    /// Disconnect from the target, then tear down the jump chain
    pub async fn close(mut self) {
        debug!("Closing session to {}", self.profile.host);
        disconnect(&self.handle).await;
        if let Some(chain) = self.chain.take() {
            chain.teardown().await;
        }
        if self.state == SessionState::Errored {
            warn!("Session to {} closed after an error", self.profile.host);
        }
        self.state = SessionState::Closed;
        emit(&self.events, SessionEvent::Closed);
    }
}
