//! Agent accept loop: handshake then hand the socket to the connection layer

use burrow_connection::ConnectionManager;
use burrow_handshake::Authenticator;
use burrow_proto::{read_frame, write_frame};
use burrow_quota::QuotaLimiter;
use burrow_registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Accepts agent sockets, runs the auth handshake, registers survivors
#[derive(Clone)]
pub struct AgentAcceptor {
    manager: Arc<ConnectionManager>,
    registry: Arc<Registry>,
    limiter: Option<Arc<QuotaLimiter>>,
    authenticator: Arc<Authenticator>,
    cancel: CancellationToken,
}

impl AgentAcceptor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        registry: Arc<Registry>,
        limiter: Option<Arc<QuotaLimiter>>,
        authenticator: Arc<Authenticator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            registry,
            limiter,
            authenticator,
            cancel,
        }
    }

    /// Run the accept loop until cancelled
    pub async fn run(self, listener: TcpListener, tls: Option<TlsAcceptor>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("agent acceptor stopping");
                    return;
                }

                accepted = listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("failed to accept agent connection: {}", e);
                            continue;
                        }
                    };

                    let acceptor = self.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        if let Err(e) = acceptor.handle_socket(socket, peer_addr, tls).await {
                            warn!(%peer_addr, "agent connection rejected: {:#}", e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_socket(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        tls: Option<TlsAcceptor>,
    ) -> anyhow::Result<()> {
        match tls {
            Some(acceptor) => {
                let stream = acceptor.accept(socket).await?;
                self.handshake(stream, peer_addr).await
            }
            None => self.handshake(socket, peer_addr).await,
        }
    }

    /// Single-frame auth exchange, then registration with the manager
    async fn handshake<S>(&self, mut socket: S, peer_addr: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if let Some(limiter) = &self.limiter {
            limiter.check_connection(self.manager.connection_count())?;
        }

        let frame = timeout(self.authenticator.auth_timeout(), read_frame(&mut socket))
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for auth frame"))??;

        let (agent_id, metadata) = match self.authenticator.handle_auth(&frame).await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                // tell the agent why before dropping the socket
                if let Ok(error_frame) = self.authenticator.error_response(&e.to_string()) {
                    let _ = write_frame(&mut socket, &error_frame).await;
                }
                return Err(e.into());
            }
        };

        let ack = self.authenticator.success_response(&agent_id, None)?;
        write_frame(&mut socket, &ack).await?;

        let connection_id = format!("{}-{}", agent_id, Uuid::new_v4());
        self.manager
            .register_connection(&connection_id, &agent_id, metadata.clone(), socket)?;

        info!(agent_id, connection_id, %peer_addr, "agent connected");

        // an agent may request its tunnel at connect time
        if let Some(subdomain) = metadata.get("subdomain") {
            match self
                .registry
                .register_tunnel("", subdomain, &connection_id, &agent_id, metadata.clone())
            {
                Ok(tunnel) => {
                    info!(full_domain = %tunnel.full_domain, agent_id, "tunnel registered");
                }
                Err(e) => {
                    warn!(subdomain, agent_id, "tunnel registration failed: {}", e);
                }
            }
        }

        Ok(())
    }
}
