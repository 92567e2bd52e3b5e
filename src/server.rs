use crate::dispatch::Dispatcher;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How long the pre-bind probe waits for something to answer on the port
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// True when something already accepts connections on `127.0.0.1:port`
pub async fn port_in_use(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// An HTTP or HTTPS listener feeding the dispatcher
pub struct GatewayServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    /// Terminate TLS on this listener
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    fn protocol(&self) -> &'static str {
        if self.tls_enabled() {
            "HTTPS"
        } else {
            "HTTP"
        }
    }

    /// Probe the port, then bind it.
    ///
    /// A port that already answers is reported as an error without binding.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let port = self.bind_addr.port();
        if port != 0 && port_in_use(port).await {
            anyhow::bail!("{} port {} is already in use", self.protocol(), port);
        }
        Ok(TcpListener::bind(self.bind_addr).await?)
    }

    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = self.protocol();
        info!(addr = %local_addr, protocol, "Listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, dispatcher, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, dispatcher, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %local_addr, protocol, "Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        let span = info_span!(
            "request",
            id = %Uuid::new_v4(),
            method = %req.method(),
            uri = %req.uri(),
            client = %addr,
        );
        async move {
            let response = dispatcher.dispatch(req, addr, is_tls).await;
            Ok::<_, Infallible>(response)
        }
        .instrument(span)
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Bind and run `server` in the background.
///
/// Returns None when the port is taken or cannot be bound; the caller keeps
/// running without this listener.
pub async fn spawn_listener(
    server: GatewayServer,
) -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let protocol = server.protocol();
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(protocol, addr = %server.bind_addr, error = %e, "Listener not started");
            return None;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(protocol, error = %e, "Listener has no local address");
            return None;
        }
    };

    let handle = tokio::spawn(async move {
        if let Err(e) = server.run(listener).await {
            error!(protocol, error = %e, "Listener error");
        }
    });
    Some((local_addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port).await);

        drop(listener);
        assert!(!port_in_use(port).await);
    }
}
