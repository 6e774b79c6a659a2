// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Jump chains: nested SSH connections, each forwarding a TCP stream to the next hop

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use tracing::{debug, info, warn};

use ssh_gateway_common::{format_host_port, GatewayError, HostEndpoint, Result};

use super::authenticate::authenticate;
use super::handler::ClientHandler;
use super::{emit, EventSink, SessionEvent, SshContext, Transport};

/// One live, authenticated connection in a chain
#[async_trait]
pub trait HopLink: Send + Sync {
    /// Open a direct-tcpip stream from this hop to `host:port`
    async fn forward(&self, host: &str, port: u16) -> Result<Transport>;

    async fn close(&self);
}

/// Opens an authenticated connection to one endpoint, over TCP when
/// `transport` is `None`, else over the given stream
#[async_trait]
pub trait HopConnector: Send + Sync {
    type Link: HopLink;

    async fn connect(&self, endpoint: &HostEndpoint, transport: Option<Transport>)
        -> Result<Self::Link>;
}

/// Intermediate connections of one session, first hop first
pub struct JumpChain<L: HopLink> {
    links: Vec<L>,
}

impl<L: HopLink> JumpChain<L> {
    /// Close every link, last hop first
    pub async fn teardown(self) {
        for (i, link) in self.links.iter().enumerate().rev() {
            debug!("Closing jump host #{}", i + 1);
            link.close().await;
        }
    }
}

/// Build a chain through `hops` ending in a stream to `dest_host:dest_port`.
///
/// Returns `None` when there are no hops. On failure every link opened so
/// far is closed (reverse order) before the error is returned.
pub async fn build_chain<C: HopConnector>(
    connector: &C,
    hops: &[HostEndpoint],
    dest_host: &str,
    dest_port: u16,
    events: &EventSink,
) -> Result<Option<(Transport, JumpChain<C::Link>)>> {
    if hops.is_empty() {
        return Ok(None);
    }

    let mut chain = JumpChain {
        links: Vec::with_capacity(hops.len()),
    };
    let mut transport: Option<Transport> = None;

    for (i, hop) in hops.iter().enumerate() {
        let index = i + 1;
        let (next_host, next_port) = match hops.get(index) {
            Some(next) => (next.host.as_str(), next.port),
            None => (dest_host, dest_port),
        };

        info!(
            "Jump host #{}: {} -> {}",
            index,
            format_host_port(&hop.host, hop.port),
            format_host_port(next_host, next_port)
        );

        let step = match connector.connect(hop, transport.take()).await {
            Ok(link) => match link.forward(next_host, next_port).await {
                Ok(stream) => Ok((link, stream)),
                Err(e) => {
                    link.close().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match step {
            Ok((link, stream)) => {
                chain.links.push(link);
                transport = Some(stream);
                emit(
                    events,
                    SessionEvent::HopConnected {
                        index,
                        host: hop.host.clone(),
                    },
                );
            }
            Err(e) => {
                warn!("Jump host #{} ({}) failed: {}", index, hop.host, e);
                chain.teardown().await;
                return Err(GatewayError::JumpHop {
                    index,
                    host: hop.host.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    match transport {
        Some(stream) => Ok(Some((stream, chain))),
        None => {
            chain.teardown().await;
            Err(GatewayError::Connection("Jump chain produced no stream".into()))
        }
    }
}

/// Connect to `target` through `hops`, reporting progress on `events`.
///
/// If the target cannot be reached or rejects authentication, the chain
/// built so far is torn down before the error is returned.
pub async fn connect_through<C: HopConnector>(
    connector: &C,
    hops: &[HostEndpoint],
    target: &HostEndpoint,
    events: &EventSink,
) -> Result<(C::Link, Option<JumpChain<C::Link>>)> {
    let (transport, chain) =
        match build_chain(connector, hops, &target.host, target.port, events).await {
            Ok(Some((transport, chain))) => (Some(transport), Some(chain)),
            Ok(None) => (None, None),
            Err(e) => {
                emit(events, SessionEvent::Error(e.to_string()));
                return Err(e);
            }
        };

    emit(
        events,
        SessionEvent::Authenticating {
            host: target.host.clone(),
        },
    );

    match connector.connect(target, transport).await {
        Ok(link) => Ok((link, chain)),
        Err(e) => {
            if let Some(chain) = chain {
                chain.teardown().await;
            }
            emit(events, SessionEvent::Error(e.to_string()));
            Err(e)
        }
    }
}

/// russh-backed connector used for hops and for the final target
#[derive(Clone)]
pub struct SshConnector {
    ctx: Arc<SshContext>,
}

impl SshConnector {
    pub fn new(ctx: Arc<SshContext>) -> Self {
        Self { ctx }
    }

    /// Connect and authenticate, returning the raw handle
    pub async fn open(
        &self,
        endpoint: &HostEndpoint,
        transport: Option<Transport>,
    ) -> Result<Handle<ClientHandler>> {
        let addr = format_host_port(&endpoint.host, endpoint.port);
        let creds = self.ctx.secrets.resolve(&endpoint.id).await?;
        let handler = ClientHandler::new(&endpoint.host, endpoint.port, self.ctx.host_keys.clone());
        let config = self.ctx.config.clone();
        let timeout = self.ctx.connect_timeout;

        let connecting = async {
            match transport {
                Some(stream) => client::connect_stream(config, stream, handler).await,
                None => client::connect(config, addr.as_str(), handler).await,
            }
        };

        let mut handle = match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(GatewayError::Connection(format!(
                    "Failed to connect to {}: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(GatewayError::Connection(format!(
                    "Connection to {} timed out after {:?}",
                    addr, timeout
                )))
            }
        };

        if let Err(e) = authenticate(&mut handle, endpoint, &creds).await {
            disconnect(&handle).await;
            return Err(e);
        }

        debug!("Authenticated to {}", addr);
        Ok(handle)
    }
}

pub(crate) async fn disconnect(handle: &Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("Disconnect failed (connection already gone?): {}", e);
    }
}

pub struct SshLink {
    handle: Handle<ClientHandler>,
    host: String,
}

impl SshLink {
    pub fn into_handle(self) -> Handle<ClientHandler> {
        self.handle
    }
}

#[async_trait]
impl HopLink for SshLink {
    async fn forward(&self, host: &str, port: u16) -> Result<Transport> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                GatewayError::Connection(format!(
                    "{} refused forwarding to {}: {}",
                    self.host,
                    format_host_port(host, port),
                    e
                ))
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        disconnect(&self.handle).await;
    }
}

#[async_trait]
impl HopConnector for SshConnector {
    type Link = SshLink;

    async fn connect(
        &self,
        endpoint: &HostEndpoint,
        transport: Option<Transport>,
    ) -> Result<SshLink> {
        let handle = self.open(endpoint, transport).await?;
        Ok(SshLink {
            handle,
            host: endpoint.host.clone(),
        })
    }
}
