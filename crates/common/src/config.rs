// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Connection profile structures for SSH Gateway

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::types::AuthType;

/// Host record as stored on disk. Jump hosts are referenced by host id and
/// expanded into full endpoints by the host store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    /// Unique host identifier (also the file stem)
    pub id: String,
    /// Human-readable name shown in notices
    #[serde(default)]
    pub name: String,
    /// SSH server hostname or IP
    pub host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Authentication type
    pub auth_type: AuthType,
    /// Ordered jump host ids, first hop first
    #[serde(default)]
    pub jump_hosts: Vec<String>,
}

/// One SSH endpoint: a jump hop or the final target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostEndpoint {
    /// Host id used to look up credentials
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
}

/// Fully resolved profile for one session. Immutable for the session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    /// Intermediate hops, first hop first
    #[serde(default)]
    pub jump_hosts: Vec<HostEndpoint>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostRecord {
    pub fn endpoint(&self) -> HostEndpoint {
        HostEndpoint {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth_type: self.auth_type.clone(),
        }
    }

    /// Display name, falling back to the address
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            self.host.clone()
        } else {
            self.name.clone()
        }
    }
}

impl ConnectionProfile {
    /// Build a profile from a host record and its already-resolved jump hops
    pub fn from_record(record: &HostRecord, jump_hosts: Vec<HostEndpoint>) -> Self {
        Self {
            id: record.id.clone(),
            name: record.display_name(),
            host: record.host.clone(),
            port: record.port,
            username: record.username.clone(),
            auth_type: record.auth_type.clone(),
            jump_hosts,
        }
    }

    /// The final target as an endpoint
    pub fn endpoint(&self) -> HostEndpoint {
        HostEndpoint {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth_type: self.auth_type.clone(),
        }
    }

    /// Validate the profile configuration
    pub fn validate(&self) -> Result<()> {
        validate_endpoint(&self.endpoint())?;

        for hop in &self.jump_hosts {
            validate_endpoint(hop)?;
            if hop.id == self.id {
                return Err(GatewayError::Config(format!(
                    "Host {} lists itself as a jump host",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

fn validate_endpoint(endpoint: &HostEndpoint) -> Result<()> {
    if endpoint.host.is_empty() {
        return Err(GatewayError::Config("Host cannot be empty".to_string()));
    }
    if endpoint.username.is_empty() {
        return Err(GatewayError::Config("Username cannot be empty".to_string()));
    }
    if endpoint.port == 0 {
        return Err(GatewayError::Config(
            "Port must be greater than 0".to_string(),
        ));
    }
    Ok(())
}
