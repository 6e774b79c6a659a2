// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - Common Library
// Shared types, wire protocol, host store and credential lookup

pub mod config;
pub mod error;
pub mod host_store;
pub mod network;
pub mod secrets;
pub mod types;

pub use config::{ConnectionProfile, HostEndpoint, HostRecord};
pub use error::{GatewayError, Result};
pub use host_store::{FileHostStore, HostStore};
pub use network::{client_ip, format_host_port, is_loopback_address};
pub use secrets::{Credentials, KeychainSecrets, SecretResolver, SecretsFile};
pub use types::{
    AuthType, CreateKind, DecompressMode, DirEntry, DownloadProgress, EntryKind, FileRequest,
    OpenRequest, PingResult, ServerEvent, Target, TerminalRequest, WindowSize,
};
