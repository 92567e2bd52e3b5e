//! Owns every subsystem of a running gateway.
//!
//! Lifecycle calls (start/stop per listener and for the FastCGI pool) and the
//! certificate reload all go through [`ServiceContext`], so there is no global
//! mutable state.

use crate::certs::CertificateStore;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::server::{spawn_listener, GatewayServer};
use crate::workers::WorkerPool;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Upper bound for a listener task to finish after shutdown is signalled
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningListener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningListener {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(LISTENER_STOP_TIMEOUT, self.task).await.is_err() {
            warn!(addr = %self.local_addr, "Listener did not stop in time");
        }
    }
}

pub struct ServiceContext {
    config: Arc<Config>,
    certs: Arc<CertificateStore>,
    workers: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
    http: Mutex<Option<RunningListener>>,
    https: Mutex<Option<RunningListener>>,
}

impl ServiceContext {
    /// Load certificates and wire up the dispatcher; nothing is started yet
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let certs = CertificateStore::load(config.server.cert_root.clone());
        let workers = WorkerPool::new(config.fastcgi.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&certs),
            Arc::clone(&workers),
        )?);

        Ok(Self {
            config,
            certs,
            workers,
            dispatcher,
            http: Mutex::new(None),
            https: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn certificates(&self) -> &Arc<CertificateStore> {
        &self.certs
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Start every subsystem enabled in the configuration
    pub async fn start(&self) {
        if self.config.fastcgi.enabled {
            self.start_fastcgi().await;
        }
        if self.config.server.http_port > 0 {
            self.start_http().await;
        }
        if self.config.server.https_port > 0 {
            self.start_https().await;
        }
    }

    /// Stop listeners first, then the worker pool
    pub async fn stop(&self) {
        self.stop_http().await;
        self.stop_https().await;
        self.stop_fastcgi().await;
    }

    fn bind_addr(&self, port: u16) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.config.server.bind, port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.config.server.bind, port, e))
    }

    async fn start_listener(&self, port: u16, tls: Option<TlsAcceptor>) -> Option<RunningListener> {
        let addr = match self.bind_addr(port) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "Listener not started");
                return None;
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut server = GatewayServer::new(addr, Arc::clone(&self.dispatcher), shutdown_rx);
        if let Some(acceptor) = tls {
            server = server.with_tls(acceptor);
        }

        let (local_addr, task) = spawn_listener(server).await?;
        Some(RunningListener {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    /// Start the plain HTTP listener; returns whether it is running afterwards
    pub async fn start_http(&self) -> bool {
        if self.is_http_running() {
            return true;
        }
        let listener = self.start_listener(self.config.server.http_port, None).await;
        let started = listener.is_some();
        *self.http.lock() = listener;
        started
    }

    pub async fn stop_http(&self) {
        let listener = self.http.lock().take();
        if let Some(listener) = listener {
            listener.stop().await;
            info!("HTTP listener stopped");
        }
    }

    /// Start the TLS listener; certificates are picked per connection by SNI
    pub async fn start_https(&self) -> bool {
        if self.is_https_running() {
            return true;
        }
        let Some(tls_config) = tls_server_config(Arc::clone(&self.certs)) else {
            return false;
        };
        let acceptor = TlsAcceptor::from(tls_config);
        let listener = self
            .start_listener(self.config.server.https_port, Some(acceptor))
            .await;
        let started = listener.is_some();
        *self.https.lock() = listener;
        started
    }

    pub async fn stop_https(&self) {
        let listener = self.https.lock().take();
        if let Some(listener) = listener {
            listener.stop().await;
            info!("HTTPS listener stopped");
        }
    }

    pub async fn start_fastcgi(&self) {
        self.workers.start().await;
    }

    pub async fn stop_fastcgi(&self) {
        self.workers.stop().await;
    }

    pub fn is_http_running(&self) -> bool {
        is_listener_running(&self.http)
    }

    pub fn is_https_running(&self) -> bool {
        is_listener_running(&self.https)
    }

    pub fn is_fastcgi_running(&self) -> bool {
        self.workers.is_running()
    }

    /// Bound address of the HTTP listener (useful when configured with port 0)
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.lock().as_ref().map(|l| l.local_addr)
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.lock().as_ref().map(|l| l.local_addr)
    }

    /// Re-read the certificate directory; new handshakes see the new set
    pub fn reload_certificates(&self) -> usize {
        self.certs.reload()
    }
}

fn is_listener_running(slot: &Mutex<Option<RunningListener>>) -> bool {
    slot.lock().as_ref().is_some_and(|l| !l.task.is_finished())
}

/// rustls config resolving certificates through `certs` on every handshake
fn tls_server_config(certs: Arc<CertificateStore>) -> Option<Arc<rustls::ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = match rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
    {
        Ok(builder) => builder,
        Err(e) => {
            warn!(error = %e, "TLS configuration error, HTTPS not started");
            return None;
        }
    };

    let mut config = builder.with_no_client_auth().with_cert_resolver(certs);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Some(Arc::new(config))
}
