// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - Config Module
// Gateway configuration (listener, auth, storage locations, timeouts)

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use ssh_gateway_common::is_loopback_address;

/// Where host credentials are read from
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SecretBackend {
    /// System keychain via the `keyring` crate
    #[default]
    Keychain,
    /// TOML secrets file (see `secrets_file`)
    File,
}

/// Gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Bind address (e.g. "127.0.0.1:8022")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Directory holding one `<host id>.toml` per host
    #[serde(default = "default_hosts_dir")]
    pub hosts_dir: PathBuf,

    #[serde(default)]
    pub secret_backend: SecretBackend,

    /// Secrets file for the `file` backend
    #[serde(default = "default_secrets_file")]
    pub secrets_file: PathBuf,

    /// Path to the access token file
    #[serde(default = "default_auth_token_path")]
    pub auth_token_path: PathBuf,

    /// Require the access token on every channel and download
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,

    /// Source addresses allowed to open channels; `*` allows everyone
    #[serde(default = "default_allowed_ips")]
    pub allowed_ips: Vec<String>,

    /// Path to SSH known_hosts file
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,

    /// Record and accept host keys seen for the first time
    #[serde(default = "default_accept_new_host_keys")]
    pub accept_new_host_keys: bool,

    /// Local cache root for downloads, partitioned per client and per task
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Remote directory for temporary download archives
    #[serde(default = "default_remote_tmp_dir")]
    pub remote_tmp_dir: String,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Settling delay between tearing down and re-creating a terminal session
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

fn gateway_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ssh-gateway")
}

fn default_bind_address() -> String {
    "127.0.0.1:8022".to_string()
}

fn default_hosts_dir() -> PathBuf {
    gateway_dir().join("hosts")
}

fn default_secrets_file() -> PathBuf {
    gateway_dir().join("secrets.toml")
}

fn default_auth_token_path() -> PathBuf {
    gateway_dir().join("gateway.token")
}

fn default_require_auth() -> bool {
    true
}

fn default_allowed_ips() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_known_hosts_path() -> PathBuf {
    gateway_dir().join("known_hosts")
}

fn default_accept_new_host_keys() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ssh-gateway")
        .join("downloads")
}

fn default_remote_tmp_dir() -> String {
    "/tmp".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_reconnect_delay_secs() -> u64 {
    3
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            hosts_dir: default_hosts_dir(),
            secret_backend: SecretBackend::default(),
            secrets_file: default_secrets_file(),
            auth_token_path: default_auth_token_path(),
            require_auth: default_require_auth(),
            allowed_ips: default_allowed_ips(),
            known_hosts_path: default_known_hosts_path(),
            accept_new_host_keys: default_accept_new_host_keys(),
            cache_dir: default_cache_dir(),
            remote_tmp_dir: default_remote_tmp_dir(),
            command_timeout_secs: default_command_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Validate the gateway configuration
    pub fn validate(&self) -> Result<()> {
        let host = bind_host(&self.bind_address);
        if !is_loopback_address(host) && !self.require_auth {
            anyhow::bail!(
                "Security violation: Non-loopback bind address ({}) requires require_auth = true.\n\
                 \n\
                 To fix this:\n\
                 1. Set require_auth = true in gateway.toml, OR\n\
                 2. Use a loopback address (127.0.0.1 or localhost) for bind_address",
                self.bind_address
            );
        }

        if self.command_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            anyhow::bail!("Timeouts must be greater than 0 seconds");
        }

        if !self.remote_tmp_dir.starts_with('/') {
            anyhow::bail!(
                "remote_tmp_dir must be an absolute path (got {:?})",
                self.remote_tmp_dir
            );
        }

        if self.allowed_ips.is_empty() {
            anyhow::bail!("allowed_ips is empty; no client could connect (use \"*\" to allow all)");
        }

        Ok(())
    }

    /// Load gateway configuration from file, writing defaults when absent
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No gateway configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read gateway configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse gateway configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded gateway configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save gateway configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            crate::permissions::ensure_private_directory(parent)?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize gateway configuration")?;

        fs::write(&config_path, contents).context("Failed to write gateway configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved gateway configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the gateway configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("ssh-gateway").join("gateway.toml"))
    }
}

/// Host part of a `host:port` bind address
fn bind_host(bind_address: &str) -> &str {
    if let Some(rest) = bind_address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match bind_address.rsplit_once(':') {
        Some((host, _)) => host,
        None => bind_address,
    }
}
