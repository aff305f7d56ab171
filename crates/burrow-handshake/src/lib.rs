//! Agent authentication handshake
//!
//! The first frame on a fresh agent socket must be an `Auth` control frame.
//! This crate parses it, runs the pluggable token validator, and builds the
//! acknowledgement frame sent back on the control stream.

use async_trait::async_trait;
use burrow_proto::{AuthRequest, AuthResponse, Frame, FrameFlags, FrameType};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid frame type for auth")]
    InvalidFrameType,

    #[error("auth frame must be control frame")]
    AuthMustBeControlFrame,

    #[error("invalid auth payload: {0}")]
    InvalidAuthPayload(String),

    #[error("no token validator configured")]
    NoTokenValidator,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

/// Pluggable token validation seam
///
/// Implementations map an opaque token to the authoritative agent id (JWT,
/// API-key lookup, database, ...). The id returned here wins over anything
/// the agent claimed about itself.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<String, HandshakeError>;
}

/// Validates the opening auth frame and builds the acknowledgement
pub struct Authenticator {
    validator: Option<Arc<dyn TokenValidator>>,
    auth_timeout: Duration,
}

impl Authenticator {
    pub fn new(validator: Arc<dyn TokenValidator>, auth_timeout: Duration) -> Self {
        Self {
            validator: Some(validator),
            auth_timeout,
        }
    }

    /// An authenticator with no validator rejects every agent
    pub fn without_validator(auth_timeout: Duration) -> Self {
        Self {
            validator: None,
            auth_timeout,
        }
    }

    /// How long the acceptor waits for the opening frame
    pub fn auth_timeout(&self) -> Duration {
        self.auth_timeout
    }

    /// Handle the opening auth frame
    ///
    /// Returns the validated agent id plus the merged metadata: the agent's
    /// self-reported id and version land under `client_agent_id` /
    /// `client_version`, capabilities are carried as a JSON list, and any
    /// extra payload metadata is merged last (later keys win).
    pub async fn handle_auth(
        &self,
        frame: &Frame,
    ) -> Result<(String, HashMap<String, String>), HandshakeError> {
        if frame.frame_type != FrameType::Auth {
            return Err(HandshakeError::InvalidFrameType);
        }

        if !frame.is_control() {
            return Err(HandshakeError::AuthMustBeControlFrame);
        }

        let request: AuthRequest = serde_json::from_slice(&frame.payload)
            .map_err(|e| HandshakeError::InvalidAuthPayload(e.to_string()))?;

        let validator = self
            .validator
            .as_ref()
            .ok_or(HandshakeError::NoTokenValidator)?;

        let agent_id = validator.validate(&request.token).await.map_err(|e| {
            warn!(client_agent_id = %request.agent_id, "token validation failed: {}", e);
            e
        })?;

        let mut metadata = HashMap::new();
        if !request.agent_id.is_empty() {
            metadata.insert("client_agent_id".to_string(), request.agent_id);
        }
        if !request.version.is_empty() {
            metadata.insert("client_version".to_string(), request.version);
        }
        if !request.capabilities.is_empty() {
            let capabilities = serde_json::to_string(&request.capabilities)
                .map_err(|e| HandshakeError::InvalidAuthPayload(e.to_string()))?;
            metadata.insert("capabilities".to_string(), capabilities);
        }
        for (key, value) in request.metadata {
            metadata.insert(key, value);
        }

        debug!(agent_id, "agent authenticated");
        Ok((agent_id, metadata))
    }

    /// Build the acknowledgement frame for a successful handshake
    pub fn success_response(
        &self,
        agent_id: &str,
        config: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Frame, HandshakeError> {
        self.auth_response(true, agent_id, config, "")
    }

    /// Build the acknowledgement frame for a failed handshake
    pub fn error_response(&self, error: &str) -> Result<Frame, HandshakeError> {
        self.auth_response(false, "", None, error)
    }

    fn auth_response(
        &self,
        success: bool,
        agent_id: &str,
        config: Option<HashMap<String, serde_json::Value>>,
        error: &str,
    ) -> Result<Frame, HandshakeError> {
        let response = AuthResponse {
            success,
            agent_id: agent_id.to_string(),
            server_time: Utc::now().timestamp(),
            config,
            error: error.to_string(),
        };

        let payload = serde_json::to_vec(&response)
            .map_err(|e| HandshakeError::InvalidAuthPayload(e.to_string()))?;

        Ok(Frame::control(FrameType::Auth, Bytes::from(payload))
            .with_flags(FrameFlags::new().with_ack()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PrefixValidator;

    #[async_trait]
    impl TokenValidator for PrefixValidator {
        async fn validate(&self, token: &str) -> Result<String, HandshakeError> {
            match token.strip_prefix("token-") {
                Some(agent_id) if !agent_id.is_empty() => Ok(agent_id.to_string()),
                _ => Err(HandshakeError::InvalidToken("unknown token".to_string())),
            }
        }
    }

    fn authenticator() -> Authenticator {
        Authenticator::new(Arc::new(PrefixValidator), Duration::from_secs(10))
    }

    fn auth_frame(request: &AuthRequest) -> Frame {
        Frame::control(
            FrameType::Auth,
            Bytes::from(serde_json::to_vec(request).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_successful_auth() {
        let auth = authenticator();
        let mut request = AuthRequest::new("token-agent-1");
        request.agent_id = "claimed-id".to_string();
        request.version = "0.3.0".to_string();
        request.capabilities = vec!["http".to_string(), "tcp".to_string()];
        request
            .metadata
            .insert("region".to_string(), "eu-west".to_string());

        let (agent_id, metadata) = auth.handle_auth(&auth_frame(&request)).await.unwrap();

        // the validator's id wins; the claimed one is preserved as metadata
        assert_eq!(agent_id, "agent-1");
        assert_eq!(metadata.get("client_agent_id"), Some(&"claimed-id".to_string()));
        assert_eq!(metadata.get("client_version"), Some(&"0.3.0".to_string()));
        assert_eq!(metadata.get("capabilities"), Some(&r#"["http","tcp"]"#.to_string()));
        assert_eq!(metadata.get("region"), Some(&"eu-west".to_string()));
    }

    #[tokio::test]
    async fn test_payload_metadata_wins_on_collision() {
        let auth = authenticator();
        let mut request = AuthRequest::new("token-agent-1");
        request.agent_id = "claimed-id".to_string();
        request
            .metadata
            .insert("client_agent_id".to_string(), "override".to_string());

        let (_, metadata) = auth.handle_auth(&auth_frame(&request)).await.unwrap();
        assert_eq!(metadata.get("client_agent_id"), Some(&"override".to_string()));
    }

    #[tokio::test]
    async fn test_rejects_wrong_frame_type() {
        let auth = authenticator();
        let frame = Frame::heartbeat();

        let err = auth.handle_auth(&frame).await.unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidFrameType));
    }

    #[tokio::test]
    async fn test_rejects_non_control_stream() {
        let auth = authenticator();
        let request = AuthRequest::new("token-agent-1");
        let frame = Frame::new(
            FrameType::Auth,
            3,
            Bytes::from(serde_json::to_vec(&request).unwrap()),
        );

        let err = auth.handle_auth(&frame).await.unwrap_err();
        assert!(matches!(err, HandshakeError::AuthMustBeControlFrame));
    }

    #[tokio::test]
    async fn test_rejects_garbage_payload() {
        let auth = authenticator();
        let frame = Frame::control(FrameType::Auth, Bytes::from_static(b"not json"));

        let err = auth.handle_auth(&frame).await.unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidAuthPayload(_)));
    }

    #[tokio::test]
    async fn test_rejects_bad_token() {
        let auth = authenticator();
        let frame = auth_frame(&AuthRequest::new("bogus"));

        let err = auth.handle_auth(&frame).await.unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_no_validator_rejects() {
        let auth = Authenticator::without_validator(Duration::from_secs(10));
        let frame = auth_frame(&AuthRequest::new("token-agent-1"));

        let err = auth.handle_auth(&frame).await.unwrap_err();
        assert!(matches!(err, HandshakeError::NoTokenValidator));
    }

    #[test]
    fn test_success_response_shape() {
        let auth = authenticator();
        let frame = auth.success_response("agent-1", None).unwrap();

        assert!(frame.is_control());
        assert_eq!(frame.frame_type, FrameType::Auth);
        assert!(frame.flags.has_ack());

        let response: AuthResponse = serde_json::from_slice(&frame.payload).unwrap();
        assert!(response.success);
        assert_eq!(response.agent_id, "agent-1");
        assert!(response.server_time > 0);
        assert!(response.error.is_empty());
    }

    #[test]
    fn test_error_response_shape() {
        let auth = authenticator();
        let frame = auth.error_response("invalid token").unwrap();

        assert!(frame.flags.has_ack());
        let response: AuthResponse = serde_json::from_slice(&frame.payload).unwrap();
        assert!(!response.success);
        assert_eq!(response.error, "invalid token");
    }
}
