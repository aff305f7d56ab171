//! Burrow reverse-tunnel server
//!
//! Wires the long-lived pieces together: the agent acceptor feeding the
//! connection manager, the public listener feeding the router, the shared
//! registry and quota limiter, and one root cancellation token driving
//! graceful shutdown.

pub mod acceptor;
pub mod config;
pub mod listener;
pub mod tls;
pub mod validator;

pub use acceptor::AgentAcceptor;
pub use config::{LimitSpec, ServerConfig, TokenSpec};
pub use listener::PublicListener;

use anyhow::Context;
use burrow_connection::ConnectionManager;
use burrow_handshake::{Authenticator, TokenValidator};
use burrow_quota::QuotaLimiter;
use burrow_registry::Registry;
use burrow_router::TunnelRouter;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use validator::{AnyTokenValidator, TokenTableValidator};

/// The assembled server
pub struct Server {
    config: ServerConfig,
    registry: Arc<Registry>,
    manager: Arc<ConnectionManager>,
    limiter: Arc<QuotaLimiter>,
    authenticator: Arc<Authenticator>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new(config.base_domain.clone()));
        let manager = Arc::new(ConnectionManager::new(
            config.max_connections,
            config.heartbeat_timeout,
        ));

        let limiter = Arc::new(QuotaLimiter::new(config.max_connections, config.max_streams));
        for spec in &config.agent_limits {
            limiter.set_agent_limit(&spec.key, spec.max_streams, 0, spec.rate);
        }
        for spec in &config.domain_limits {
            limiter.set_domain_limit(&spec.key, spec.max_streams, spec.rate);
        }

        let validator: Arc<dyn TokenValidator> = if config.auth_tokens.is_empty() {
            warn!("no auth tokens configured, accepting any non-empty token");
            Arc::new(AnyTokenValidator)
        } else {
            Arc::new(TokenTableValidator::new(&config.auth_tokens))
        };
        let authenticator = Arc::new(Authenticator::new(validator, config.auth_timeout));

        // a dying connection takes all of its tunnels with it
        let cleanup_registry = registry.clone();
        manager.set_on_connection_closed(Arc::new(move |connection_id| {
            cleanup_registry.unregister_connection_tunnels(connection_id);
        }));

        Self {
            config,
            registry,
            manager,
            limiter,
            authenticator,
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn limiter(&self) -> &Arc<QuotaLimiter> {
        &self.limiter
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the root context; `run` returns once the drain completes
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Bind both listeners and serve until shut down
    pub async fn run(&self) -> anyhow::Result<()> {
        let agent_listener = TcpListener::bind(self.config.agent_addr)
            .await
            .with_context(|| format!("binding agent listener on {}", self.config.agent_addr))?;
        let public_listener = TcpListener::bind(self.config.public_addr)
            .await
            .with_context(|| format!("binding public listener on {}", self.config.public_addr))?;

        self.serve(agent_listener, public_listener).await
    }

    /// Serve on pre-bound listeners until shut down
    pub async fn serve(
        &self,
        agent_listener: TcpListener,
        public_listener: TcpListener,
    ) -> anyhow::Result<()> {
        let agent_tls = self.agent_tls()?;
        let public_tls = self.public_tls()?;

        info!(
            addr = %agent_listener.local_addr()?,
            tls = agent_tls.is_some(),
            "agent listener started"
        );
        info!(
            addr = %public_listener.local_addr()?,
            tls = public_tls.is_some(),
            base_domain = %self.config.base_domain,
            "public listener started"
        );

        let acceptor = AgentAcceptor::new(
            self.manager.clone(),
            self.registry.clone(),
            Some(self.limiter.clone()),
            self.authenticator.clone(),
            self.cancel.child_token(),
        );
        let acceptor_task = tokio::spawn(acceptor.run(agent_listener, agent_tls));

        let router = Arc::new(TunnelRouter::new(
            self.registry.clone(),
            self.manager.clone(),
            Some(self.limiter.clone()),
            self.config.request_timeout,
        ));
        let public = PublicListener::new(
            burrow_router::app(router),
            public_tls,
            self.cancel.child_token(),
        );
        let public_task = tokio::spawn(public.run(public_listener));

        self.cancel.cancelled().await;

        info!("draining connections");
        self.manager.drain().await;
        let _ = acceptor_task.await;
        let _ = public_task.await;
        info!("shutdown complete");

        Ok(())
    }

    fn agent_tls(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.config.agent_tls {
            return Ok(None);
        }
        let cert = self
            .config
            .agent_cert
            .as_ref()
            .context("agent TLS enabled but no certificate configured")?;
        let key = self
            .config
            .agent_key
            .as_ref()
            .context("agent TLS enabled but no key configured")?;
        Ok(Some(tls::tls_acceptor(cert, key)?))
    }

    fn public_tls(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.config.public_tls {
            return Ok(None);
        }
        let cert = self
            .config
            .public_cert
            .as_ref()
            .context("public TLS enabled but no certificate configured")?;
        let key = self
            .config
            .public_key
            .as_ref()
            .context("public TLS enabled but no key configured")?;
        Ok(Some(tls::tls_acceptor(cert, key)?))
    }
}
