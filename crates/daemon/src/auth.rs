// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - Authentication Module
// Access tokens, source address allow-listing and login notifications

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use ssh_gateway_common::network::normalize_ip;

/// Obfuscate a token for logging (show only last 4 characters)
/// Example: "abc123def456" -> "********f456"
pub fn obfuscate_token(token: &str) -> String {
    if token.len() < 4 {
        "*".repeat(token.len())
    } else {
        let mask_len = token.len() - 4;
        format!("{}{}", "*".repeat(mask_len), &token[mask_len..])
    }
}

/// Generate a new access token
pub fn generate_token() -> Zeroizing<String> {
    Zeroizing::new(Uuid::new_v4().to_string())
}

/// Load or generate the access token file.
/// Returns (token, was_newly_generated)
pub fn load_or_generate_token(token_path: &Path) -> Result<(Zeroizing<String>, bool)> {
    if token_path.exists() {
        let contents = Zeroizing::new(
            fs::read_to_string(token_path).context("Failed to read access token file")?,
        );
        let token = Zeroizing::new(contents.trim().to_string());

        if token.is_empty() {
            warn!("Token file exists but is empty, regenerating");
        } else {
            info!("Loaded access token from: {}", token_path.display());
            return Ok((token, false));
        }
    }

    let token = generate_token();
    save_token(token_path, &token)?;

    info!("Generated new access token");
    info!(
        "Token: {} (full token in {})",
        obfuscate_token(&token),
        token_path.display()
    );

    Ok((token, true))
}

fn save_token(token_path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = token_path.parent() {
        crate::permissions::ensure_private_directory(parent)?;
    }

    fs::write(token_path, token).context("Failed to write token file")?;
    crate::permissions::set_file_permissions_private(token_path)?;

    Ok(())
}

/// Verifies the access token carried by a channel's first message,
/// in the context of the caller's source address
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str, ip: IpAddr) -> bool;
}

/// Compares against the token file loaded at start-up.
/// With no token (auth disabled) every request is accepted.
///
/// The token is not bound to an address: any caller that passes the
/// `IpAllowList` may present it. The address is only logged on failure.
pub struct StaticTokenVerifier {
    token: Option<Zeroizing<String>>,
}

impl StaticTokenVerifier {
    pub fn new(token: Option<Zeroizing<String>>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str, ip: IpAddr) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        let expected = expected.as_bytes();
        let provided = token.as_bytes();
        let matches = expected.len() == provided.len()
            && expected
                .iter()
                .zip(provided)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
        if !matches {
            debug!("Access token mismatch from {}", ip);
        }
        matches
    }
}

/// Source address policy
pub trait IpAllowList: Send + Sync {
    fn is_allowed(&self, ip: IpAddr) -> bool;
}

/// Allow-list from `allowed_ips`: exact addresses, or `*` for everyone
#[derive(Debug, Clone, Default)]
pub struct ConfiguredAllowList {
    allow_all: bool,
    addresses: Vec<IpAddr>,
}

impl ConfiguredAllowList {
    pub fn new(entries: &[String]) -> Self {
        let mut list = Self::default();
        for entry in entries {
            let entry = entry.trim();
            if entry == "*" {
                list.allow_all = true;
                continue;
            }
            match entry.parse::<IpAddr>() {
                Ok(ip) => list.addresses.push(normalize_ip(ip)),
                Err(_) => warn!("Ignoring invalid allowed_ips entry: {:?}", entry),
            }
        }
        list
    }
}

impl IpAllowList for ConfiguredAllowList {
    fn is_allowed(&self, ip: IpAddr) -> bool {
        self.allow_all || self.addresses.contains(&normalize_ip(ip))
    }
}

/// One login attempt against a target host
#[derive(Debug, Clone)]
pub struct LoginEvent {
    pub host_id: String,
    pub host: String,
    pub username: String,
    pub client_ip: IpAddr,
    pub success: bool,
    pub message: Option<String>,
}

/// Sink for login notifications
#[async_trait]
pub trait LoginNotifier: Send + Sync {
    async fn notify(&self, event: LoginEvent);
}

/// Writes login events to the log
pub struct TracingNotifier;

#[async_trait]
impl LoginNotifier for TracingNotifier {
    async fn notify(&self, event: LoginEvent) {
        if event.success {
            info!(
                host_id = %event.host_id,
                client_ip = %event.client_ip,
                "Login succeeded: {}@{}",
                event.username,
                event.host
            );
        } else {
            warn!(
                host_id = %event.host_id,
                client_ip = %event.client_ip,
                "Login failed: {}@{}: {}",
                event.username,
                event.host,
                event.message.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_obfuscate_token() {
        let token = "abc123de-f456-7890-1234-567890abcdef";
        let obfuscated = obfuscate_token(token);
        assert_eq!(obfuscated, "********************************cdef");
        assert_eq!(obfuscate_token("1234"), "1234");
        assert_eq!(obfuscate_token("abc"), "***");
    }

    #[test]
    fn test_save_and_load_token() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("gateway.token");

        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(Uuid::parse_str(&token).is_ok());
        assert!(was_new);

        let (loaded, was_new2) = load_or_generate_token(&token_path).unwrap();
        assert_eq!(*token, *loaded);
        assert!(!was_new2);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&token_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_empty_token_file_regenerates() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("gateway.token");
        fs::write(&token_path, "  \n").unwrap();

        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(was_new);
        assert!(!token.is_empty());
    }

    #[tokio::test]
    async fn test_static_verifier() {
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let remote: IpAddr = "203.0.113.9".parse().unwrap();

        let verifier = StaticTokenVerifier::new(Some(Zeroizing::new("s3cret".to_string())));
        assert!(verifier.verify("s3cret", local).await);
        assert!(verifier.verify("s3cret", remote).await);
        assert!(!verifier.verify("s3cre", local).await);
        assert!(!verifier.verify("S3cret", local).await);

        let open = StaticTokenVerifier::new(None);
        assert!(open.verify("anything", remote).await);
    }

    #[test]
    fn test_allow_list() {
        let list = ConfiguredAllowList::new(&[
            "10.0.0.5".to_string(),
            "not-an-ip".to_string(),
        ]);
        assert!(list.is_allowed("10.0.0.5".parse().unwrap()));
        assert!(list.is_allowed("::ffff:10.0.0.5".parse().unwrap()));
        assert!(!list.is_allowed("10.0.0.6".parse().unwrap()));

        let all = ConfiguredAllowList::new(&["*".to_string()]);
        assert!(all.is_allowed("203.0.113.1".parse().unwrap()));
    }
}
