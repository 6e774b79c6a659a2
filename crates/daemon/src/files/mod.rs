// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - File Operations Module
// SFTP-backed file management, guarded remote commands and download tasks

pub mod channel;
pub mod exec;
#[cfg(test)]
pub(crate) mod mock;
pub mod ops;
pub mod remote;
pub mod transfer;

use ssh_gateway_common::{GatewayError, Result};

/// Join a POSIX directory and a child name
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Validate a client-supplied file name, returning it trimmed
pub fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::Validation("File name cannot be empty".into()));
    }
    if trimmed.contains('/') || trimmed.contains('\0') {
        return Err(GatewayError::Validation(format!(
            "File name contains invalid characters: {:?}",
            trimmed
        )));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(GatewayError::Validation(format!(
            "Invalid file name: {}",
            trimmed
        )));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "etc"), "/etc");
        assert_eq!(join_path("/data", "a.txt"), "/data/a.txt");
        assert_eq!(join_path("/data/", "a.txt"), "/data/a.txt");
        assert_eq!(join_path("", "a.txt"), "a.txt");
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  report.pdf ").unwrap(), "report.pdf");
        assert!(validate_name("   ").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("bad\0name").is_err());
        assert!(validate_name("..").is_err());
    }
}
