// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - HTTP API Module
// Routes, shared state and client admission for both WebSocket endpoints

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use ssh_gateway_common::{client_ip, ConnectionProfile, HostStore, Result, ServerEvent};

use crate::auth::{IpAllowList, LoginEvent, LoginNotifier, TokenVerifier};
use crate::client::ClientChannel;
use crate::config::GatewayConfig;
use crate::files::transfer::finished_file;
use crate::ssh::{EventSink, Session, SessionGateway};

/// Shared application state
pub struct AppState {
    pub config: GatewayConfig,
    pub hosts: Arc<dyn HostStore>,
    pub tokens: Arc<dyn TokenVerifier>,
    pub allow_list: Arc<dyn IpAllowList>,
    pub notifier: Arc<dyn LoginNotifier>,
    pub sessions: SessionGateway,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl AppState {
    /// Reject the channel with `ip_forbidden` if its source is not allowed
    pub(crate) fn admit_ip(&self, channel: &ClientChannel) -> bool {
        if self.allow_list.is_allowed(channel.ip) {
            return true;
        }
        warn!("Rejected connection from disallowed address {}", channel.ip);
        channel
            .sink()
            .event(ServerEvent::IpForbidden(format!("{} is not allowed", channel.ip)));
        false
    }

    /// Reject the channel with `token_verify_fail` on a bad token
    pub(crate) async fn admit_token(&self, channel: &ClientChannel, token: &str) -> bool {
        if self.tokens.verify(token, channel.ip).await {
            return true;
        }
        warn!("Token verification failed for {}", channel.ip);
        channel.sink().event(ServerEvent::TokenVerifyFail);
        false
    }

    /// Connect to the profile's target and report the login outcome
    pub(crate) async fn open_session(
        &self,
        profile: &ConnectionProfile,
        ip: IpAddr,
        events: &EventSink,
    ) -> Result<Session> {
        let result = self.sessions.connect(profile, events).await;
        self.notifier
            .notify(LoginEvent {
                host_id: profile.id.clone(),
                host: profile.host.clone(),
                username: profile.username.clone(),
                client_ip: ip,
                success: result.is_ok(),
                message: result.as_ref().err().map(|e| e.to_string()),
            })
            .await;
        result
    }
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/ws/terminal", get(terminal_socket))
        .route("/ws/sftp", get(sftp_socket))
        .route("/api/downloads/:client/:task/:file", get(fetch_download))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

fn source_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    client_ip(forwarded, peer)
}

async fn terminal_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = source_ip(&headers, peer);
    debug!("Terminal socket requested from {}", ip);
    ws.on_upgrade(move |socket| crate::terminal::serve(socket, state, ip))
}

async fn sftp_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = source_ip(&headers, peer);
    debug!("File socket requested from {}", ip);
    ws.on_upgrade(move |socket| crate::files::channel::serve(socket, state, ip))
}

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    token: String,
}

/// RFC 6266 header with an ASCII fallback and a UTF-8 `filename*`
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(file_name.len() * 3);
    for byte in file_name.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}

/// Serve a finished download from the client's cache
async fn fetch_download(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((client, task, file)): Path<(String, String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let ip = source_ip(&headers, peer);
    if !state.allow_list.is_allowed(ip) {
        warn!("Download request from disallowed address {}", ip);
        return error_response(StatusCode::FORBIDDEN, "Address not allowed");
    }
    if !state.tokens.verify(&query.token, ip).await {
        warn!("Download request with invalid token from {}", ip);
        return error_response(StatusCode::UNAUTHORIZED, "Invalid token");
    }

    let Some(path) = finished_file(&state.config.cache_dir, &client, &task, &file) else {
        return error_response(StatusCode::NOT_FOUND, "Download not found");
    };

    let file_handle = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!("Failed to open {}: {}", path.display(), e);
            return error_response(StatusCode::NOT_FOUND, "Download not found");
        }
    };
    let length = match file_handle.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            error!("Failed to stat {}: {}", path.display(), e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read download");
        }
    };

    info!("Serving download {}/{} ({} bytes) to {}", task, file, length, ip);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&file)),
        ],
        Body::from_stream(ReaderStream::new(file_handle)),
    )
        .into_response()
}
