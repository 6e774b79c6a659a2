// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - Client Channel Module
// One browser WebSocket: a single writer task fed by cloneable sinks, and
// typed reads of `{"event", "data"}` requests

use std::net::IpAddr;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ssh_gateway_common::ServerEvent;

/// A frame queued for the client
#[derive(Debug)]
pub enum Outbound {
    Event(ServerEvent),
    /// Raw terminal output
    Binary(Vec<u8>),
    /// Close the socket after flushing queued frames
    Close,
}

/// Cloneable handle for queueing frames to one client
#[derive(Debug, Clone)]
pub struct ClientSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientSink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn event(&self, event: ServerEvent) {
        debug!("-> {}", event.name());
        if self.tx.send(Outbound::Event(event)).is_err() {
            debug!("Client channel already closed, dropping event");
        }
    }

    pub fn binary(&self, data: Vec<u8>) {
        let _ = self.tx.send(Outbound::Binary(data));
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Drain queued frames into the socket until closed
pub async fn run_writer(
    mut socket: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            Outbound::Event(event) => match serde_json::to_string(&event) {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    warn!("Failed to serialize {}: {}", event.name(), e);
                    continue;
                }
            },
            Outbound::Binary(data) => Message::Binary(data),
            Outbound::Close => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        };

        if let Err(e) = socket.send(message).await {
            debug!("WebSocket send failed: {}", e);
            break;
        }
    }
    let _ = socket.close().await;
}

/// Parse one text frame as a request
pub fn parse_request<T: DeserializeOwned>(text: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(text)
}

/// An accepted WebSocket with its writer task running
pub struct ClientChannel {
    pub ip: IpAddr,
    sink: ClientSink,
    incoming: SplitStream<WebSocket>,
    writer: JoinHandle<()>,
    shutdown: broadcast::Receiver<()>,
}

impl ClientChannel {
    pub fn open(socket: WebSocket, ip: IpAddr, shutdown: broadcast::Receiver<()>) -> Self {
        let (outgoing, incoming) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(outgoing, rx));
        Self {
            ip,
            sink: ClientSink::new(tx),
            incoming,
            writer,
            shutdown,
        }
    }

    pub fn sink(&self) -> &ClientSink {
        &self.sink
    }

    /// Next request from the client; `None` once the socket is closed or
    /// the gateway is shutting down. Malformed frames are logged and skipped.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.recv() => {
                    debug!("Gateway shutting down, closing channel for {}", self.ip);
                    return None;
                }
                frame = self.incoming.next() => frame?,
            };
            match frame {
                Ok(Message::Text(text)) => match parse_request(&text) {
                    Ok(request) => return Some(request),
                    Err(e) => warn!("Ignoring malformed request from {}: {}", self.ip, e),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket receive failed for {}: {}", self.ip, e);
                    return None;
                }
            }
        }
    }

    /// Flush queued frames, close the socket and wait for the writer
    pub async fn finish(self) {
        self.sink.close();
        drop(self.sink);
        if let Err(e) = self.writer.await {
            warn!("WebSocket writer task failed: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use ssh_gateway_common::{FileRequest, TerminalRequest};

    #[test]
    fn test_sink_preserves_frame_order() {
        let (sink, mut rx) = sink();
        sink.event(ServerEvent::ConnectShellSuccess);
        sink.binary(b"$ ".to_vec());
        sink.close();

        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Event(ServerEvent::ConnectShellSuccess))
        ));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Binary(b)) if b == b"$ "));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn test_events_after_client_left_are_dropped() {
        let (sink, rx) = sink();
        drop(rx);
        sink.event(ServerEvent::ConnectClose);
        sink.binary(b"late".to_vec());
        sink.close();
    }

    #[test]
    fn test_parse_request() {
        let req: TerminalRequest =
            parse_request(r#"{"event":"input","data":"ls -la\r"}"#).unwrap();
        assert!(matches!(req, TerminalRequest::Input(s) if s == "ls -la\r"));

        let req: FileRequest = parse_request(
            r#"{"event":"ws_sftp","data":{"hostId":"web-1","token":"t"}}"#,
        )
        .unwrap();
        assert!(matches!(req, FileRequest::WsSftp(open) if open.host_id == "web-1"));

        assert!(parse_request::<FileRequest>(r#"{"event":"format_disk"}"#).is_err());
    }
}
