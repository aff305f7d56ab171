//! Server configuration surface

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Public listener socket timeouts
pub const PUBLIC_READ_TIMEOUT: Duration = Duration::from_secs(15);
pub const PUBLIC_WRITE_TIMEOUT: Duration = Duration::from_secs(15);
pub const PUBLIC_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// One per-agent or per-domain limit: `key=max_streams:rate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitSpec {
    pub key: String,
    pub max_streams: u32,
    pub rate: u32,
}

impl FromStr for LimitSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("invalid limit spec {s:?}, expected key=streams:rate"))?;
        let (streams, rate) = rest
            .split_once(':')
            .ok_or_else(|| format!("invalid limit spec {s:?}, expected key=streams:rate"))?;

        if key.is_empty() {
            return Err(format!("invalid limit spec {s:?}, empty key"));
        }

        Ok(LimitSpec {
            key: key.to_string(),
            max_streams: streams
                .parse()
                .map_err(|_| format!("invalid stream count in {s:?}"))?,
            rate: rate.parse().map_err(|_| format!("invalid rate in {s:?}"))?,
        })
    }
}

/// One static auth token: `token=agent_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSpec {
    pub token: String,
    pub agent_id: String,
}

impl FromStr for TokenSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, agent_id) = s
            .split_once('=')
            .ok_or_else(|| "invalid token spec, expected token=agent_id".to_string())?;
        if token.is_empty() || agent_id.is_empty() {
            return Err("invalid token spec, empty token or agent id".to_string());
        }
        Ok(TokenSpec {
            token: token.to_string(),
            agent_id: agent_id.to_string(),
        })
    }
}

/// Everything the server consumes from the host process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Agent listener
    pub agent_addr: SocketAddr,
    pub agent_tls: bool,
    pub agent_cert: Option<PathBuf>,
    pub agent_key: Option<PathBuf>,

    /// Public listener
    pub public_addr: SocketAddr,
    pub public_tls: bool,
    pub public_cert: Option<PathBuf>,
    pub public_key: Option<PathBuf>,

    /// Base domain for tunnel full domains
    pub base_domain: String,

    pub max_connections: usize,
    pub max_streams: usize,
    pub heartbeat_timeout: Duration,
    pub auth_timeout: Duration,
    pub request_timeout: Duration,

    pub agent_limits: Vec<LimitSpec>,
    pub domain_limits: Vec<LimitSpec>,

    /// Static token table; empty means any non-empty token is accepted
    pub auth_tokens: Vec<TokenSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agent_addr: "0.0.0.0:8443".parse().unwrap(),
            agent_tls: false,
            agent_cert: None,
            agent_key: None,
            public_addr: "0.0.0.0:8080".parse().unwrap(),
            public_tls: false,
            public_cert: None,
            public_key: None,
            base_domain: "localhost".to_string(),
            max_connections: 1000,
            max_streams: 10_000,
            heartbeat_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            agent_limits: Vec::new(),
            domain_limits: Vec::new(),
            auth_tokens: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_spec_parses() {
        let spec: LimitSpec = "agent-1=100:50".parse().unwrap();
        assert_eq!(
            spec,
            LimitSpec {
                key: "agent-1".to_string(),
                max_streams: 100,
                rate: 50,
            }
        );
    }

    #[test]
    fn test_limit_spec_with_domain_key() {
        let spec: LimitSpec = "api.example.com=20:10".parse().unwrap();
        assert_eq!(spec.key, "api.example.com");
    }

    #[test]
    fn test_limit_spec_rejects_garbage() {
        assert!("".parse::<LimitSpec>().is_err());
        assert!("agent-1".parse::<LimitSpec>().is_err());
        assert!("agent-1=100".parse::<LimitSpec>().is_err());
        assert!("agent-1=abc:10".parse::<LimitSpec>().is_err());
        assert!("=100:10".parse::<LimitSpec>().is_err());
    }

    #[test]
    fn test_token_spec_parses() {
        let spec: TokenSpec = "s3cret=agent-1".parse().unwrap();
        assert_eq!(spec.token, "s3cret");
        assert_eq!(spec.agent_id, "agent-1");
    }

    #[test]
    fn test_token_spec_rejects_garbage() {
        assert!("".parse::<TokenSpec>().is_err());
        assert!("tokenonly".parse::<TokenSpec>().is_err());
        assert!("=agent".parse::<TokenSpec>().is_err());
    }
}
