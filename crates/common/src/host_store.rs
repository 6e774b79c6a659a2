// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - Host Store Module
// Resolves host ids into connection profiles

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::config::{ConnectionProfile, HostRecord};
use crate::error::{GatewayError, Result};

/// Source of connection profiles
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Resolve a host id into a validated profile with its jump hosts expanded
    async fn resolve(&self, host_id: &str) -> Result<ConnectionProfile>;
}

/// Host records stored as one TOML file per host (`<id>.toml`)
#[derive(Debug, Clone)]
pub struct FileHostStore {
    dir: PathBuf,
}

/// Host ids double as file stems, so they are restricted to a safe alphabet
fn check_host_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(GatewayError::Validation(format!("Invalid host id: {:?}", id)))
    }
}

impl FileHostStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", id))
    }

    /// Load one host record by id
    pub fn load_record(&self, id: &str) -> Result<HostRecord> {
        check_host_id(id)?;
        let path = self.record_path(id);
        if !path.exists() {
            return Err(GatewayError::NotFound(format!("host {}", id)));
        }
        let record = load_record_file(&path)?;
        if record.id != id {
            return Err(GatewayError::Config(format!(
                "{} declares id {:?}",
                path.display(),
                record.id
            )));
        }
        Ok(record)
    }

    fn resolve_blocking(&self, host_id: &str) -> Result<ConnectionProfile> {
        let record = self.load_record(host_id)?;

        let mut jumps = Vec::with_capacity(record.jump_hosts.len());
        for jump_id in &record.jump_hosts {
            let jump = self.load_record(jump_id).map_err(|e| match e {
                GatewayError::NotFound(_) => GatewayError::NotFound(format!(
                    "jump host {} referenced by {}",
                    jump_id, host_id
                )),
                other => other,
            })?;
            jumps.push(jump.endpoint());
        }

        let profile = ConnectionProfile::from_record(&record, jumps);
        profile.validate()?;
        debug!(
            "Resolved host {} ({} jump host(s))",
            host_id,
            profile.jump_hosts.len()
        );
        Ok(profile)
    }
}

fn load_record_file(path: &Path) -> Result<HostRecord> {
    let contents = fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

#[async_trait]
impl HostStore for FileHostStore {
    async fn resolve(&self, host_id: &str) -> Result<ConnectionProfile> {
        self.resolve_blocking(host_id)
    }
}
