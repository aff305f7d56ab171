//! Host-based HTTP routing onto agent streams
//!
//! Every public request becomes one stream on the agent connection that owns
//! the requested domain: the router writes the request head and body as
//! frames, then accumulates the agent's reply bytes until the stream closes
//! or the per-request deadline expires. The reply is forwarded verbatim;
//! the agent is treated as opaque.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use burrow_connection::{ConnectionError, ConnectionManager};
use burrow_proto::{Frame, FrameFlags, MAX_FRAME_SIZE};
use burrow_quota::{QuotaError, QuotaLimiter};
use burrow_registry::Registry;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Router errors, each mapped to the HTTP status the caller sees
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("missing Host header")]
    MissingHost,

    #[error("tunnel not found for domain: {0}")]
    TunnelNotFound(String),

    #[error("rate limit exceeded: {0}")]
    QuotaDenied(#[from] QuotaError),

    #[error("no connection for tunnel")]
    ConnectionNotFound,

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("stream error: {0}")]
    Stream(#[from] ConnectionError),

    #[error("gateway timeout")]
    DeadlineExceeded,
}

impl RouterError {
    fn status(&self) -> StatusCode {
        match self {
            RouterError::MissingHost => StatusCode::BAD_REQUEST,
            RouterError::TunnelNotFound(_) => StatusCode::NOT_FOUND,
            RouterError::QuotaDenied(_) => StatusCode::TOO_MANY_REQUESTS,
            RouterError::ConnectionNotFound => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::BodyRead(_) | RouterError::Stream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Releases the quota slot taken for one in-flight request
struct StreamQuotaGuard {
    limiter: Arc<QuotaLimiter>,
    agent_id: String,
    domain: String,
}

impl Drop for StreamQuotaGuard {
    fn drop(&mut self) {
        self.limiter.release_stream(&self.agent_id, &self.domain);
    }
}

/// Routes public HTTP requests to agent streams
pub struct TunnelRouter {
    registry: Arc<Registry>,
    connections: Arc<ConnectionManager>,
    limiter: Option<Arc<QuotaLimiter>>,
    request_timeout: Duration,
}

impl TunnelRouter {
    pub fn new(
        registry: Arc<Registry>,
        connections: Arc<ConnectionManager>,
        limiter: Option<Arc<QuotaLimiter>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            connections,
            limiter,
            request_timeout,
        }
    }

    pub async fn handle_request(&self, request: Request<Body>) -> Response {
        match self.proxy(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("request rejected: {}", e);
                e.into_response()
            }
        }
    }

    async fn proxy(&self, request: Request<Body>) -> Result<Response, RouterError> {
        let host = extract_host(&request).ok_or(RouterError::MissingHost)?;

        let tunnel = self
            .registry
            .get_tunnel(&host)
            .ok_or_else(|| RouterError::TunnelNotFound(host.clone()))?;

        if let Some(limiter) = &self.limiter {
            limiter.check_request(&tunnel.agent_id, &host)?;
        }

        let conn = self
            .connections
            .get_connection(&tunnel.connection_id)
            .ok_or(RouterError::ConnectionNotFound)?;

        // quota slot first, stream second: the guard drops last, so release
        // is LIFO with respect to stream teardown
        let _quota = match &self.limiter {
            Some(limiter) => {
                limiter.acquire_stream(&tunnel.agent_id, &host)?;
                Some(StreamQuotaGuard {
                    limiter: limiter.clone(),
                    agent_id: tunnel.agent_id.clone(),
                    domain: host.clone(),
                })
            }
            None => None,
        };

        let stream = conn.open_stream()?;
        let stream_id = stream.id();
        debug!(host, stream_id, connection_id = %tunnel.connection_id, "proxying request");

        let (parts, body) = request.into_parts();
        let head = request_head(&parts);

        conn.send_frame(&Frame::open_stream(stream_id, head)).await?;

        let body = axum::body::to_bytes(body, MAX_FRAME_SIZE as usize)
            .await
            .map_err(|e| RouterError::BodyRead(e.to_string()))?;
        if !body.is_empty() {
            conn.send_frame(&Frame::data(stream_id, body)).await?;
        }

        conn.send_frame(
            &Frame::data(stream_id, Bytes::new()).with_flags(FrameFlags::new().with_end_stream()),
        )
        .await?;

        let mut rx = stream
            .take_reader()
            .ok_or(ConnectionError::StreamClosed(stream_id))?;
        let close_signal = stream.close_signal();

        let mut collected: Vec<u8> = Vec::new();
        let wait = tokio::time::timeout(self.request_timeout, async {
            loop {
                tokio::select! {
                    // drain delivered payloads before honoring the close signal
                    biased;
                    chunk = rx.recv() => match chunk {
                        Some(bytes) => collected.extend_from_slice(&bytes),
                        None => break,
                    },
                    _ = close_signal.cancelled() => {
                        while let Ok(bytes) = rx.try_recv() {
                            collected.extend_from_slice(&bytes);
                        }
                        break;
                    }
                }
            }
        })
        .await;

        if wait.is_err() {
            warn!(host, stream_id, "request deadline expired");
            return Err(RouterError::DeadlineExceeded);
        }

        // the agent's bytes are forwarded as-is; response parsing is out of
        // scope for the routing plane
        let response = if collected.is_empty() {
            StatusCode::NO_CONTENT.into_response()
        } else {
            (StatusCode::OK, collected).into_response()
        };
        Ok(response)
    }
}

/// Axum application exposing the router as the catch-all handler
pub fn app(router: Arc<TunnelRouter>) -> axum::Router {
    axum::Router::new().fallback(handle).with_state(router)
}

async fn handle(State(router): State<Arc<TunnelRouter>>, request: Request<Body>) -> Response {
    router.handle_request(request).await
}

/// Host header without any port suffix
fn extract_host(request: &Request<Body>) -> Option<String> {
    let host = request.headers().get(header::HOST)?.to_str().ok()?;
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

/// Synthetic request head: request line plus headers, HTTP/1.1 style
fn request_head(parts: &http::request::Parts) -> Bytes {
    let mut head = String::new();

    let path = match parts.uri.path_and_query() {
        Some(path_and_query) => path_and_query.as_str(),
        None => "/",
    };
    head.push_str(&format!("{} {} {:?}\r\n", parts.method, path, parts.version));

    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    head.push_str("\r\n");

    Bytes::from(head)
}
