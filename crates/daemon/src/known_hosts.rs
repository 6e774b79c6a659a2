// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - Known Hosts Module
// Host key verification for target and jump hosts (trust on first use)

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResult {
    Trusted,
    /// No entry for this host yet
    Unknown,
    /// Entry exists with a different key
    Mismatch { line_number: usize },
}

#[derive(Debug, Clone)]
struct KnownHostEntry {
    /// `host` or `[host]:port`
    host_pattern: String,
    key_type: String,
    key_data: String,
    line_number: usize,
}

impl KnownHostEntry {
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host_pattern), Some(key_type), Some(key_data)) => Some(KnownHostEntry {
                host_pattern: host_pattern.to_string(),
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
                line_number,
            }),
            _ => {
                warn!(
                    "Invalid known_hosts entry at line {}: too few fields",
                    line_number
                );
                None
            }
        }
    }

    /// Patterns may be comma separated (`host,10.0.0.1`)
    fn matches(&self, host: &str, port: u16) -> bool {
        let pattern = format_host_pattern(host, port);
        self.host_pattern
            .split(',')
            .any(|p| p == pattern || (port == 22 && p == format!("[{}]:22", host)))
    }
}

/// The known_hosts file held in memory
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    /// Load from a path; a missing file is an empty set
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut entries = Vec::new();

        if path.exists() {
            let contents = fs::read_to_string(path)
                .context(format!("Failed to read known_hosts file: {}", path.display()))?;
            entries.extend(
                contents
                    .lines()
                    .enumerate()
                    .filter_map(|(idx, line)| KnownHostEntry::parse(line, idx + 1)),
            );
            debug!(
                "Loaded {} entries from known_hosts: {}",
                entries.len(),
                path.display()
            );
        } else {
            info!("Known_hosts file does not exist yet: {}", path.display());
        }

        Ok(KnownHosts {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> VerifyResult {
        self.verify_raw(host, port, key.algorithm().as_str(), &key.public_key_base64())
    }

    fn verify_raw(&self, host: &str, port: u16, key_type: &str, key_data: &str) -> VerifyResult {
        let mut first_match = None;
        for entry in self.entries.iter().filter(|e| e.matches(host, port)) {
            if entry.key_type == key_type && entry.key_data == key_data {
                return VerifyResult::Trusted;
            }
            first_match.get_or_insert(entry.line_number);
        }

        match first_match {
            Some(line_number) => VerifyResult::Mismatch { line_number },
            None => VerifyResult::Unknown,
        }
    }

    pub fn add(&mut self, host: &str, port: u16, key: &PublicKey) {
        self.add_raw(host, port, key.algorithm().as_str(), &key.public_key_base64());
    }

    fn add_raw(&mut self, host: &str, port: u16, key_type: &str, key_data: &str) {
        self.entries.push(KnownHostEntry {
            host_pattern: format_host_pattern(host, port),
            key_type: key_type.to_string(),
            key_data: key_data.to_string(),
            line_number: self.entries.len() + 1,
        });
    }

    /// Append the newest entry to disk (0600)
    fn append_last(&self) -> Result<()> {
        let Some(entry) = self.entries.last() else {
            return Ok(());
        };

        if let Some(parent) = self.path.parent() {
            crate::permissions::ensure_private_directory(parent)?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context(format!(
                "Failed to open known_hosts file: {}",
                self.path.display()
            ))?;
        writeln!(
            file,
            "{} {} {}",
            entry.host_pattern, entry.key_type, entry.key_data
        )?;
        crate::permissions::set_file_permissions_private(&self.path)?;
        Ok(())
    }
}

/// Shared host key policy used by every SSH connection the gateway opens
pub struct HostKeyVerifier {
    known_hosts: Mutex<KnownHosts>,
    accept_new: bool,
}

impl HostKeyVerifier {
    pub fn open(path: &Path, accept_new: bool) -> Result<Self> {
        Ok(Self {
            known_hosts: Mutex::new(KnownHosts::load_from(path)?),
            accept_new,
        })
    }

    /// Decide whether to continue the handshake with this server key
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let fingerprint = calculate_fingerprint(key);
        let mut known_hosts = match self.known_hosts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match known_hosts.verify(host, port, key) {
            VerifyResult::Trusted => {
                debug!("Host key verified for {}:{}", host, port);
                true
            }
            VerifyResult::Unknown if self.accept_new => {
                info!(
                    "New host key for {}:{} ({}), recording in known_hosts",
                    host, port, fingerprint
                );
                known_hosts.add(host, port, key);
                if let Err(e) = known_hosts.append_last() {
                    warn!("Failed to save known_hosts: {:#}", e);
                }
                true
            }
            VerifyResult::Unknown => {
                warn!(
                    "Rejecting unknown host key for {}:{} ({}); accept_new_host_keys is disabled",
                    host, port, fingerprint
                );
                false
            }
            VerifyResult::Mismatch { line_number } => {
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @");
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!(
                    "Host key for {}:{} does not match line {} of {}",
                    host,
                    port,
                    line_number,
                    known_hosts.path.display()
                );
                error!("Offered key: {}", fingerprint);
                false
            }
        }
    }
}

/// Format host pattern for known_hosts (`host` or `[host]:port`)
fn format_host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// SHA256 fingerprint of a public key, `SHA256:<base64>`
pub fn calculate_fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let result = hasher.finalize();

    use base64::engine::general_purpose::STANDARD_NO_PAD;
    format!("SHA256:{}", STANDARD_NO_PAD.encode(result))
}
