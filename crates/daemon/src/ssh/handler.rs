// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// russh client handler: server key verification against known_hosts

use std::sync::Arc;

use russh::client;
use russh::keys::PublicKey;

use crate::known_hosts::HostKeyVerifier;

pub struct ClientHandler {
    host: String,
    port: u16,
    host_keys: Arc<HostKeyVerifier>,
}

impl ClientHandler {
    pub fn new(host: &str, port: u16, host_keys: Arc<HostKeyVerifier>) -> Self {
        Self {
            host: host.to_string(),
            port,
            host_keys,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .host_keys
            .check(&self.host, self.port, server_public_key))
    }
}
