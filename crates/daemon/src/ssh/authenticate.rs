// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Authentication against a hop or target using stored credentials

use std::sync::Arc;

use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::MethodSet;
use tracing::{debug, error, info};

use ssh_gateway_common::{AuthType, Credentials, GatewayError, HostEndpoint, Result};

use super::handler::ClientHandler;

/// Upper bound on keyboard-interactive info request rounds
const MAX_KBD_INTERACTIVE_ROUNDS: usize = 5;

/// Authenticate with the endpoint's declared auth type
pub async fn authenticate(
    session: &mut Handle<ClientHandler>,
    endpoint: &HostEndpoint,
    creds: &Credentials,
) -> Result<()> {
    let user = endpoint.username.as_str();
    debug!(
        "Authenticating {}@{} with {}",
        user, endpoint.host, endpoint.auth_type
    );

    match endpoint.auth_type {
        AuthType::Password => {
            let password = creds.require_password(&endpoint.id)?;
            authenticate_with_password(session, user, password).await
        }
        AuthType::PrivateKey => {
            let pem = creds.require_private_key(&endpoint.id)?;
            authenticate_with_key(session, user, pem, creds.passphrase()).await
        }
        AuthType::KeyboardInteractive => {
            let secret = creds.require_password(&endpoint.id)?;
            authenticate_keyboard_interactive(session, user, secret).await
        }
    }
}

fn method_names(remaining_methods: &MethodSet) -> Vec<String> {
    remaining_methods
        .iter()
        .map(|m| {
            let s: &str = m.into();
            s.to_string()
        })
        .collect()
}

fn rejected(kind: &str, remaining_methods: &MethodSet, partial_success: bool) -> GatewayError {
    rejection(kind, &method_names(remaining_methods), partial_success)
}

fn rejection(kind: &str, methods: &[String], partial_success: bool) -> GatewayError {
    let methods_str = if methods.is_empty() {
        "No authentication methods available".to_string()
    } else {
        format!("Server requires: {}", methods.join(", "))
    };
    let message = if partial_success {
        format!(
            "{} authentication partially successful. {} to complete authentication",
            kind, methods_str
        )
    } else {
        format!("{} authentication rejected. {}", kind, methods_str)
    };
    error!("{}", message);
    GatewayError::Authentication(message)
}

async fn authenticate_with_password(
    session: &mut Handle<ClientHandler>,
    user: &str,
    password: &str,
) -> Result<()> {
    let auth_result = session
        .authenticate_password(user, password)
        .await
        .map_err(GatewayError::connection)?;

    match auth_result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => Err(rejected("Password", &remaining_methods, partial_success)),
    }
}

async fn authenticate_with_key(
    session: &mut Handle<ClientHandler>,
    user: &str,
    pem: &str,
    passphrase: Option<&str>,
) -> Result<()> {
    let key = decode_secret_key(pem, passphrase).map_err(|e| {
        GatewayError::Authentication(format!("Failed to decode private key: {}", e))
    })?;

    // RSA keys need a signature hash the server accepts; other key types ignore it
    let hash_alg = session
        .best_supported_rsa_hash()
        .await
        .map_err(GatewayError::connection)?
        .flatten();
    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

    let auth_result = session
        .authenticate_publickey(user, key_with_alg)
        .await
        .map_err(GatewayError::connection)?;

    match auth_result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => Err(rejected("Public key", &remaining_methods, partial_success)),
    }
}

/// Answers for one info request: the stored secret for every prompt.
/// A request with no prompts gets an empty response.
fn kbd_answers(prompts: usize, secret: &str) -> Vec<String> {
    vec![secret.to_string(); prompts]
}

async fn authenticate_keyboard_interactive(
    session: &mut Handle<ClientHandler>,
    user: &str,
    secret: &str,
) -> Result<()> {
    let mut response = session
        .authenticate_keyboard_interactive_start(user, None)
        .await
        .map_err(GatewayError::connection)?;

    for round in 1..=MAX_KBD_INTERACTIVE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => {
                info!("Keyboard-interactive authentication successful");
                return Ok(());
            }
            KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => {
                return Err(rejected(
                    "Keyboard-interactive",
                    &remaining_methods,
                    partial_success,
                ));
            }
            KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => {
                debug!(
                    "Keyboard-interactive round {}: name={:?}, instructions={:?}, {} prompt(s)",
                    round,
                    name,
                    instructions,
                    prompts.len()
                );
                response = session
                    .authenticate_keyboard_interactive_respond(kbd_answers(prompts.len(), secret))
                    .await
                    .map_err(GatewayError::connection)?;
            }
        }
    }

    match response {
        KeyboardInteractiveAuthResponse::Success => Ok(()),
        _ => Err(GatewayError::Authentication(format!(
            "Keyboard-interactive authentication did not complete within {} rounds",
            MAX_KBD_INTERACTIVE_ROUNDS
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_message_lists_methods() {
        let err = rejection("Password", &[], false);
        assert!(matches!(err, GatewayError::Authentication(_)));
        assert_eq!(
            err.to_string(),
            "Authentication failed: Password authentication rejected. No authentication methods available"
        );
    }

    #[test]
    fn test_kbd_answers_one_per_prompt() {
        assert!(kbd_answers(0, "s3cret").is_empty());
        assert_eq!(kbd_answers(1, "s3cret"), vec!["s3cret"]);
        // e.g. password then OTP prompt on the same round
        assert_eq!(kbd_answers(2, "s3cret"), vec!["s3cret", "s3cret"]);
    }

    #[test]
    fn test_partial_success_message() {
        let err = rejection("Public key", &["keyboard-interactive".to_string()], true);
        assert!(err.to_string().contains("partially successful"));
        assert!(err.to_string().contains("Server requires: keyboard-interactive"));
    }
}
