// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - Secrets Module
// Credential lookup by host id, backed by the system keychain or a 0600 TOML file

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keyring::Entry;
use serde::Deserialize;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{GatewayError, Result};

/// Keychain service name
pub const KEYCHAIN_SERVICE: &str = "ssh-gateway";

/// Stored credentials for one host. All fields are zeroed on drop.
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<Zeroizing<String>>,
    pub private_key: Option<Zeroizing<String>>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |v: &Option<Zeroizing<String>>| if v.is_some() { "<set>" } else { "<none>" };
        f.debug_struct("Credentials")
            .field("password", &mark(&self.password))
            .field("private_key", &mark(&self.private_key))
            .field("passphrase", &mark(&self.passphrase))
            .finish()
    }
}

impl Credentials {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(Zeroizing::new(password.into())),
            ..Default::default()
        }
    }

    /// Password, or an error naming the host
    pub fn require_password(&self, host_id: &str) -> Result<&str> {
        self.password
            .as_deref()
            .map(String::as_str)
            .ok_or_else(|| GatewayError::Authentication(format!("No password stored for {}", host_id)))
    }

    /// Private key PEM, or an error naming the host
    pub fn require_private_key(&self, host_id: &str) -> Result<&str> {
        self.private_key
            .as_deref()
            .map(String::as_str)
            .ok_or_else(|| {
                GatewayError::Authentication(format!("No private key stored for {}", host_id))
            })
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref().map(String::as_str)
    }
}

/// Resolves credentials for a host id
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, host_id: &str) -> Result<Credentials>;
}

/// System keychain backend. Entries are `<host id>/password`,
/// `<host id>/private_key` and `<host id>/passphrase` under the service name.
#[derive(Debug, Clone)]
pub struct KeychainSecrets {
    service: String,
}

impl Default for KeychainSecrets {
    fn default() -> Self {
        Self::new(KEYCHAIN_SERVICE)
    }
}

impl KeychainSecrets {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn get(&self, host_id: &str, field: &str) -> Result<Option<Zeroizing<String>>> {
        let user = format!("{}/{}", host_id, field);
        let entry = Entry::new(&self.service, &user)
            .map_err(|e| GatewayError::Keychain(format!("Failed to access keychain entry: {}", e)))?;

        match entry.get_password() {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(GatewayError::Keychain(format!(
                "Failed to retrieve {} from keychain: {}",
                user, e
            ))),
        }
    }

    /// Store one credential field
    pub fn store(&self, host_id: &str, field: &str, secret: &str) -> Result<()> {
        let user = format!("{}/{}", host_id, field);
        let entry = Entry::new(&self.service, &user)
            .map_err(|e| GatewayError::Keychain(format!("Failed to create keychain entry: {}", e)))?;
        entry
            .set_password(secret)
            .map_err(|e| GatewayError::Keychain(format!("Failed to store {} in keychain: {}", user, e)))
    }
}

#[async_trait]
impl SecretResolver for KeychainSecrets {
    async fn resolve(&self, host_id: &str) -> Result<Credentials> {
        Ok(Credentials {
            password: self.get(host_id, "password")?,
            private_key: self.get(host_id, "private_key")?,
            passphrase: self.get(host_id, "passphrase")?,
        })
    }
}

#[derive(Deserialize, Default)]
struct SecretsDocument {
    #[serde(default)]
    hosts: HashMap<String, HostSecrets>,
}

#[derive(Deserialize, Default)]
struct HostSecrets {
    password: Option<String>,
    private_key: Option<String>,
    passphrase: Option<String>,
}

/// TOML secrets file:
///
/// ```toml
/// [hosts.db]
/// password = "..."
/// ```
///
/// Re-read on every lookup so edits apply to the next connection.
#[derive(Debug, Clone)]
pub struct SecretsFile {
    path: PathBuf,
}

impl SecretsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn lookup(&self, host_id: &str) -> Result<Credentials> {
        if !self.path.exists() {
            return Err(GatewayError::NotFound(format!(
                "secrets file {}",
                self.path.display()
            )));
        }
        warn_if_shared(&self.path);

        let contents = Zeroizing::new(fs::read_to_string(&self.path)?);
        let mut doc: SecretsDocument = toml::from_str(&contents)?;
        let entry = doc.hosts.remove(host_id).unwrap_or_default();

        Ok(Credentials {
            password: entry.password.map(Zeroizing::new),
            private_key: entry.private_key.map(Zeroizing::new),
            passphrase: entry.passphrase.map(Zeroizing::new),
        })
    }
}

#[async_trait]
impl SecretResolver for SecretsFile {
    async fn resolve(&self, host_id: &str) -> Result<Credentials> {
        self.lookup(host_id)
    }
}

#[cfg(unix)]
fn warn_if_shared(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                "Secrets file {} has permissions {:o}; expected 0600",
                path.display(),
                mode
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_shared(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_secrets_file_lookup() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("secrets.toml");
        fs::write(
            &path,
            "[hosts.db]\npassword = \"hunter2\"\n\n[hosts.edge]\nprivate_key = \"-----BEGIN\"\npassphrase = \"pp\"\n",
        )
        .unwrap();

        let secrets = SecretsFile::new(&path);
        let db = secrets.resolve("db").await.unwrap();
        assert_eq!(db.require_password("db").unwrap(), "hunter2");
        assert!(db.require_private_key("db").is_err());

        let edge = secrets.resolve("edge").await.unwrap();
        assert_eq!(edge.require_private_key("edge").unwrap(), "-----BEGIN");
        assert_eq!(edge.passphrase(), Some("pp"));

        let unknown = secrets.resolve("nope").await.unwrap();
        assert!(unknown.password.is_none());
    }

    #[tokio::test]
    async fn test_missing_secrets_file() {
        let secrets = SecretsFile::new("/nonexistent/secrets.toml");
        assert!(matches!(
            secrets.resolve("db").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let creds = Credentials::with_password("topsecret");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("topsecret"));
        assert!(printed.contains("<set>"));
    }
}
