// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - Daemon
// Browser-facing gateway for SSH terminals and remote file management

mod api;
mod auth;
mod client;
mod config;
mod files;
mod known_hosts;
mod permissions;
mod ssh;
mod terminal;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssh_gateway_common::{FileHostStore, KeychainSecrets, SecretResolver, SecretsFile};

use api::{create_router, AppState};
use auth::{ConfiguredAllowList, StaticTokenVerifier, TracingNotifier};
use config::{GatewayConfig, SecretBackend};
use known_hosts::HostKeyVerifier;
use ssh::{SessionGateway, SshContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssh_gateway_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("SSH Gateway starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load()?;
    info!("Authentication required: {}", config.require_auth);

    let token = if config.require_auth {
        let (token, was_new) = auth::load_or_generate_token(&config.auth_token_path)?;
        if was_new {
            info!(
                "Generated access token {} (stored in {})",
                auth::obfuscate_token(&token),
                config.auth_token_path.display()
            );
        }
        Some(token)
    } else {
        warn!("Authentication disabled - any allowed address can open sessions");
        None
    };

    let host_keys = HostKeyVerifier::open(&config.known_hosts_path, config.accept_new_host_keys)
        .context("Failed to open known_hosts")?;

    let secrets: Arc<dyn SecretResolver> = match config.secret_backend {
        SecretBackend::Keychain => Arc::new(KeychainSecrets::default()),
        SecretBackend::File => {
            info!("Reading host secrets from {}", config.secrets_file.display());
            Arc::new(SecretsFile::new(&config.secrets_file))
        }
    };

    permissions::ensure_private_directory(&config.cache_dir)
        .context("Failed to prepare download cache")?;

    let ctx = Arc::new(SshContext::new(
        Arc::new(host_keys),
        secrets,
        config.connect_timeout(),
    ));

    // Closes open WebSocket loops on shutdown
    let (shutdown_tx, _) = broadcast::channel(1);

    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState {
        hosts: Arc::new(FileHostStore::new(&config.hosts_dir)),
        tokens: Arc::new(StaticTokenVerifier::new(token)),
        allow_list: Arc::new(ConfiguredAllowList::new(&config.allowed_ips)),
        notifier: Arc::new(TracingNotifier),
        sessions: SessionGateway::new(ctx),
        shutdown_tx: shutdown_tx.clone(),
        config,
    });

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;
    info!("Gateway listening on {}", bind_address);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("Gateway server error")?;

    info!("Gateway shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then tell every client channel to close
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received Ctrl+C, shutting down");
    }

    let _ = shutdown_tx.send(());
}
