//! Handshake payload records
//!
//! The auth exchange rides as JSON inside control frames; these records are
//! the parsed forms consumed by the handshake layer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Payload of the first `Auth` frame sent by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRequest {
    pub token: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl AuthRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            agent_id: String::new(),
            version: String::new(),
            capabilities: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Payload of the server's `Auth` acknowledgement frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,

    /// Server wall clock, unix seconds
    #[serde(default)]
    pub server_time: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<HashMap<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}
