//! Proxy server lifecycle.
//!
//! [`ProxyServer::start`] binds the listener and serves connections in the
//! background; the returned [`ProxyHandle`] stops it gracefully.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use http::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use sift_core::Filter;

use crate::cert_gen::{CertGenerator, DEFAULT_CACHE_CAPACITY, DEFAULT_SWEEP_INTERVAL};
use crate::cert_store::RootCertificateSource;
use crate::error::{ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::transparent::TransparentHosts;

/// Timeouts applied by the proxy.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Time allowed for a client to send request headers.
    pub header_read: Duration,
    /// Time allowed to open a TCP connection upstream.
    pub connect: Duration,
    /// Time allowed for a TLS handshake, with the client or upstream.
    pub tls_handshake: Duration,
    /// Time allowed for an upstream request to produce response headers.
    pub client: Duration,
    /// Time [`ProxyHandle::stop`] waits for open connections.
    pub shutdown: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            header_read: Duration::from_secs(10),
            connect: Duration::from_secs(60),
            tls_handshake: Duration::from_secs(20),
            client: Duration::from_secs(60),
            shutdown: Duration::from_secs(10),
        }
    }
}

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to. Port 0 lets the OS pick one.
    pub addr: SocketAddr,
    /// Rules applied to every request and response.
    pub filter: Arc<Filter>,
    /// Root CA that signs leaf certificates.
    pub root: Arc<dyn RootCertificateSource>,
    /// Hosts that are always tunneled, with their subdomains.
    pub ignored_hosts: Vec<String>,
    /// Trust roots accepted upstream in addition to the bundled web PKI roots.
    pub upstream_roots: Vec<CertificateDer<'static>>,
    /// Timeouts.
    pub timeouts: Timeouts,
    /// Maximum number of cached leaf certificates.
    pub cert_cache_capacity: NonZeroUsize,
    /// Interval between sweeps of expired certificates.
    pub cert_sweep_interval: Duration,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("filter", &self.filter)
            .field("root", &"RootCertificateSource")
            .field("ignored_hosts", &self.ignored_hosts)
            .field("upstream_roots", &self.upstream_roots.len())
            .field("timeouts", &self.timeouts)
            .field("cert_cache_capacity", &self.cert_cache_capacity)
            .field("cert_sweep_interval", &self.cert_sweep_interval)
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a configuration listening on `127.0.0.1` with an OS-assigned port.
    pub fn new(filter: Arc<Filter>, root: Arc<dyn RootCertificateSource>) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            filter,
            root,
            ignored_hosts: Vec::new(),
            upstream_roots: Vec::new(),
            timeouts: Timeouts::default(),
            cert_cache_capacity: NonZeroUsize::new(DEFAULT_CACHE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            cert_sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the hosts that are never intercepted.
    pub fn with_ignored_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a trust root for upstream TLS.
    pub fn with_upstream_root(mut self, cert: CertificateDer<'static>) -> Self {
        self.upstream_roots.push(cert);
        self
    }

    /// Sets the timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the leaf certificate cache capacity.
    pub fn with_cert_cache_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.cert_cache_capacity = capacity;
        self
    }
}

/// Filtering MITM proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    handler: ProxyHandler,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Creates a proxy server, building the upstream TLS client.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for cert in &config.upstream_roots {
            roots.add(cert.clone())?;
        }

        let tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let mut websocket_tls = tls.clone();
        websocket_tls.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.timeouts.connect));
        http.set_keepalive(Some(Duration::from_secs(30)));

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_timer(TokioTimer::new())
            .build(https);

        let handler = ProxyHandler {
            filter: config.filter.clone(),
            client,
            websocket_tls: Arc::new(websocket_tls),
            certs: Arc::new(CertGenerator::new(
                config.root.clone(),
                config.cert_cache_capacity,
            )),
            transparent: Arc::new(TransparentHosts::new(&config.ignored_hosts)),
            timeouts: config.timeouts,
        };

        Ok(Self { config, handler })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Binds the listener and starts serving in the background.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.config.addr,
                source,
            })?;
        let addr = listener.local_addr()?;
        tracing::info!("Starting MITM proxy on {}", addr);

        let sweeper = self
            .handler
            .certs
            .cache()
            .spawn_sweeper(self.config.cert_sweep_interval);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = mpsc::channel::<()>(1);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.handler,
            shutdown_rx,
            drain_tx,
        ));

        Ok(ProxyHandle {
            addr,
            shutdown_tx,
            drain_rx,
            accept_task,
            sweeper,
            shutdown_timeout: self.config.timeouts.shutdown,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: ProxyHandler,
    mut shutdown: watch::Receiver<bool>,
    drain: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!("Accepted connection from {}", peer);
                    let handler = handler.clone();
                    let shutdown = shutdown.clone();
                    let drain = drain.clone();
                    tokio::spawn(async move {
                        serve_connection(stream, handler, shutdown).await;
                        drop(drain);
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("Proxy listener closed");
}

/// Serves one client connection until it ends or shutdown is requested.
async fn serve_connection(
    stream: TcpStream,
    handler: ProxyHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let header_read_timeout = handler.timeouts.header_read;
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout)
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                tracing::debug!("Connection closed with error: {}", e);
            }
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                tracing::debug!("Connection closed with error during shutdown: {}", e);
            }
        }
    }
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    drain_rx: mpsc::Receiver<()>,
    accept_task: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stops accepting connections and waits for open ones to finish.
    ///
    /// Tunneled and upgraded connections are not waited for.
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.sweeper.abort();
        let _ = self.accept_task.await;

        match tokio::time::timeout(self.shutdown_timeout, self.drain_rx.recv()).await {
            Ok(_) => {
                tracing::info!("Proxy server stopped");
                Ok(())
            }
            Err(_) => Err(ProxyError::Shutdown(format!(
                "connections still open after {:?}",
                self.shutdown_timeout
            ))),
        }
    }
}
