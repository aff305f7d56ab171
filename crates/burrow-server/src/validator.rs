//! Token validators wired into the handshake

use crate::config::TokenSpec;
use async_trait::async_trait;
use burrow_handshake::{HandshakeError, TokenValidator};
use std::collections::HashMap;

/// Accepts any non-empty token and uses it as the agent id
///
/// Development fallback when no token table is configured; the binary logs
/// a warning when this is active.
pub struct AnyTokenValidator;

#[async_trait]
impl TokenValidator for AnyTokenValidator {
    async fn validate(&self, token: &str) -> Result<String, HandshakeError> {
        if token.is_empty() {
            return Err(HandshakeError::InvalidToken("empty token".to_string()));
        }
        Ok(token.to_string())
    }
}

/// Fixed token table from configuration
pub struct TokenTableValidator {
    tokens: HashMap<String, String>,
}

impl TokenTableValidator {
    pub fn new(specs: &[TokenSpec]) -> Self {
        Self {
            tokens: specs
                .iter()
                .map(|spec| (spec.token.clone(), spec.agent_id.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl TokenValidator for TokenTableValidator {
    async fn validate(&self, token: &str) -> Result<String, HandshakeError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| HandshakeError::InvalidToken("unknown token".to_string()))
    }
}
