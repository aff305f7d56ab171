//! Public HTTP(S) listener

use crate::config::{PUBLIC_IDLE_TIMEOUT, PUBLIC_READ_TIMEOUT, PUBLIC_WRITE_TIMEOUT};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::time::Sleep;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Serves the router over plain HTTP or TLS-terminated HTTPS
pub struct PublicListener {
    app: axum::Router,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
}

impl PublicListener {
    pub fn new(app: axum::Router, tls: Option<TlsAcceptor>, cancel: CancellationToken) -> Self {
        Self { app, tls, cancel }
    }

    /// Run the accept loop until cancelled
    pub async fn run(self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("public listener stopping");
                    return;
                }

                accepted = listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("failed to accept public connection: {}", e);
                            continue;
                        }
                    };

                    let app = self.app.clone();
                    let tls = self.tls.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(socket).await {
                                Ok(stream) => {
                                    let stream = WriteTimeout::new(stream, PUBLIC_WRITE_TIMEOUT);
                                    serve_connection(stream, app, cancel).await
                                }
                                Err(e) => {
                                    debug!(%peer_addr, "TLS handshake failed: {}", e);
                                    return;
                                }
                            },
                            None => {
                                let socket = WriteTimeout::new(socket, PUBLIC_WRITE_TIMEOUT);
                                serve_connection(socket, app, cancel).await
                            }
                        };

                        if let Err(e) = result {
                            debug!(%peer_addr, "public connection ended: {}", e);
                        }
                    });
                }
            }
        }
    }
}

async fn serve_connection<S>(
    socket: S,
    app: axum::Router,
    cancel: CancellationToken,
) -> Result<(), hyper::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // the header read timeout also bounds keep-alive idle between requests
    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(PUBLIC_READ_TIMEOUT.min(PUBLIC_IDLE_TIMEOUT))
        .serve_connection(TokioIo::new(socket), TowerToHyperService::new(app));

    tokio::select! {
        result = connection => result,
        _ = cancel.cancelled() => Ok(()),
    }
}

/// Applies a deadline to every stalled write on the wrapped socket
///
/// A client that stops reading while a response is being written would
/// otherwise hold the connection open for as long as the agent keeps
/// streaming; each write that stays pending past the timeout fails the
/// connection instead. Reads pass straight through.
struct WriteTimeout<S> {
    inner: S,
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> WriteTimeout<S> {
    fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: None,
        }
    }

    fn poll_deadline<T>(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<T>> {
        let deadline = self
            .deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(self.timeout)));
        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline expired",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for WriteTimeout<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WriteTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_deadline(cx),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_deadline(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
