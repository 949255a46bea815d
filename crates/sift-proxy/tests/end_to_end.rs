//! End-to-end tests against a local TLS origin.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use sift_core::{Filter, FilterEvent};
use sift_proxy::{CertStore, ProxyConfig, ProxyHandle, ProxyServer};

// ==================== Helpers ====================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

struct Origin {
    addr: SocketAddr,
    ca_der: CertificateDer<'static>,
}

fn is_websocket(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"websocket"))
}

/// Answers with the request target, or echoes raw bytes after a WebSocket
/// upgrade.
async fn origin_service(mut req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if is_websocket(&req) {
        let upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            if let Ok(upgraded) = upgrade.await {
                let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            }
        });
        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(Full::new(Bytes::new()))
            .unwrap();
        return Ok(response);
    }

    let body = format!(
        "origin saw {}",
        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );
    Ok(Response::new(Full::new(Bytes::from(body))))
}

/// HTTPS origin for `localhost` with its own CA.
async fn spawn_tls_origin() -> Origin {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Test Origin CA");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let issuer = Issuer::from_ca_cert_pem(&ca_cert.pem(), ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let leaf = CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .signed_by(&leaf_key, &issuer)
        .unwrap();

    let server_config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![leaf.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service_fn(origin_service))
                        .with_upgrades()
                        .await;
                }
            });
        }
    });

    Origin {
        addr,
        ca_der: ca_cert.der().clone(),
    }
}

/// Plain HTTP origin.
async fn spawn_http_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(origin_service))
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

struct TestProxy {
    handle: ProxyHandle,
    ca_der: CertificateDer<'static>,
    _dir: TempDir,
}

async fn start_proxy(filter: Filter, origin: &Origin, ignored: &[&str]) -> TestProxy {
    let dir = TempDir::new().unwrap();
    let store = CertStore::new(dir.path().join("ca"));
    let root = store.init().unwrap();

    let config = ProxyConfig::new(Arc::new(filter), Arc::new(store))
        .with_port(0)
        .with_ignored_hosts(ignored.iter().copied())
        .with_upstream_root(origin.ca_der.clone());
    let handle = ProxyServer::new(config).unwrap().start().await.unwrap();

    TestProxy {
        handle,
        ca_der: root.cert_der().clone(),
        _dir: dir,
    }
}

fn client_tls(trusted: &CertificateDer<'static>) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(trusted.clone()).unwrap();
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Opens a CONNECT tunnel to `localhost:port` through the proxy.
async fn connect_through(proxy: &ProxyHandle, port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let request = format!(
        "CONNECT localhost:{port} HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT reply: {head}");
    stream
}

async fn send<I>(io: I, req: Request<Empty<Bytes>>) -> (Response<()>, Bytes)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(conn);
    let response = sender.send_request(req).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (Response::from_parts(parts, ()), body)
}

fn get(uri: &str, host: &str) -> Request<Empty<Bytes>> {
    Request::get(uri)
        .header(header::HOST, host)
        .body(Empty::new())
        .unwrap()
}

fn websocket_request(uri: &str, host: &str) -> Request<Empty<Bytes>> {
    Request::get(uri)
        .header(header::HOST, host)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Empty::new())
        .unwrap()
}

/// Sends a WebSocket handshake and returns the upgraded connection.
async fn open_websocket<I>(io: I, req: Request<Empty<Bytes>>) -> TokioIo<Upgraded>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(conn.with_upgrades());
    let response = sender.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    TokioIo::new(hyper::upgrade::on(response).await.unwrap())
}

async fn assert_echoes(socket: &mut TokioIo<Upgraded>, frame: &[u8]) {
    socket.write_all(frame).await.unwrap();
    let mut echoed = vec![0u8; frame.len()];
    tokio::time::timeout(Duration::from_secs(5), socket.read_exact(&mut echoed))
        .await
        .expect("echo should arrive")
        .unwrap();
    assert_eq!(echoed, frame);
}

// ==================== Interception Tests ====================

#[tokio::test]
async fn intercepts_and_forwards_https() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let proxy = start_proxy(Filter::new(), &origin, &[]).await;
    let port = origin.addr.port();

    let stream = connect_through(&proxy.handle, port).await;
    let tls = client_tls(&proxy.ca_der)
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .expect("client should trust the proxy CA");

    let (response, body) = send(tls, get("/hello?x=1", &format!("localhost:{port}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body, "origin saw /hello?x=1");

    proxy.handle.stop().await.unwrap();
}

#[tokio::test]
async fn blocks_matching_request_with_empty_403() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let blocked: Arc<Mutex<Vec<FilterEvent>>> = Arc::default();
    let sink = blocked.clone();
    let filter = Filter::new().on_block(move |event| sink.lock().push(event.clone()));
    filter.add_rules("||localhost^\n".as_bytes(), "Test list");

    let proxy = start_proxy(filter, &origin, &[]).await;
    let port = origin.addr.port();

    let stream = connect_through(&proxy.handle, port).await;
    let tls = client_tls(&proxy.ca_der)
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap();

    let (response, body) = send(tls, get("/ad.js", &format!("localhost:{port}"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body.is_empty());

    let events = blocked.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rules[0].raw_rule, "||localhost^");
    assert_eq!(events[0].rules[0].filter_name, "Test list");

    drop(events);
    proxy.handle.stop().await.unwrap();
}

#[tokio::test]
async fn removeparam_answers_with_temporary_redirect() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let filter = Filter::new();
    filter.add_rules("||localhost^$removeparam=utm_source\n".as_bytes(), "Test list");

    let proxy = start_proxy(filter, &origin, &[]).await;
    let port = origin.addr.port();

    let stream = connect_through(&proxy.handle, port).await;
    let tls = client_tls(&proxy.ca_der)
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap();

    let (response, _) = send(
        tls,
        get("/page?utm_source=feed&id=7", &format!("localhost:{port}")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("https://localhost:{port}/page?id=7").as_str()
    );

    proxy.handle.stop().await.unwrap();
}

// ==================== Tunnel Tests ====================

#[tokio::test]
async fn ignored_host_is_tunneled() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let proxy = start_proxy(Filter::new(), &origin, &["localhost"]).await;
    let port = origin.addr.port();

    // The origin's own certificate is presented through the tunnel.
    let stream = connect_through(&proxy.handle, port).await;
    let tls = client_tls(&origin.ca_der)
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .expect("tunnel should reach the origin");

    let (response, body) = send(tls, get("/direct", &format!("localhost:{port}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body, "origin saw /direct");

    proxy.handle.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_interception_makes_host_transparent() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let proxy = start_proxy(Filter::new(), &origin, &[]).await;
    let port = origin.addr.port();
    let pinned = client_tls(&origin.ca_der);

    // A client that only trusts the origin CA rejects the proxy's certificate.
    let stream = connect_through(&proxy.handle, port).await;
    assert!(pinned
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .is_err());

    let mut tunneled = false;
    for _ in 0..50 {
        let stream = connect_through(&proxy.handle, port).await;
        if pinned
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
            .is_ok()
        {
            tunneled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(tunneled, "host should be tunneled after the client rejected interception");

    proxy.handle.stop().await.unwrap();
}

#[tokio::test]
async fn plaintext_over_connect_makes_host_transparent() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let proxy = start_proxy(Filter::new(), &origin, &[]).await;
    let port = origin.addr.port();
    let pinned = client_tls(&origin.ca_der);

    // A client that speaks HTTP inside the tunnel never completes a handshake.
    let mut plaintext = connect_through(&proxy.handle, port).await;
    plaintext
        .write_all(format!("GET / HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut reply = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), plaintext.read_to_end(&mut reply)).await;

    let mut tunneled = false;
    for _ in 0..50 {
        let stream = connect_through(&proxy.handle, port).await;
        if pinned
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
            .is_ok()
        {
            tunneled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(tunneled, "host should be tunneled after a failed client handshake");

    proxy.handle.stop().await.unwrap();
}

// ==================== WebSocket Tests ====================

#[tokio::test]
async fn relays_websocket_over_plain_http() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let http_origin = spawn_http_origin().await;
    let proxy = start_proxy(Filter::new(), &origin, &[]).await;

    let stream = TcpStream::connect(proxy.handle.addr()).await.unwrap();
    let uri = format!("http://{http_origin}/socket");
    let mut socket = open_websocket(stream, websocket_request(&uri, &http_origin.to_string())).await;

    assert_echoes(&mut socket, b"\x81\x05hello").await;
    assert_echoes(&mut socket, b"\x81\x05again").await;

    drop(socket);
    proxy.handle.stop().await.unwrap();
}

#[tokio::test]
async fn relays_websocket_over_intercepted_connect() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let proxy = start_proxy(Filter::new(), &origin, &[]).await;
    let port = origin.addr.port();

    let stream = connect_through(&proxy.handle, port).await;
    let tls = client_tls(&proxy.ca_der)
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .expect("client should trust the proxy CA");

    let host = format!("localhost:{port}");
    let mut socket = open_websocket(tls, websocket_request("/socket", &host)).await;

    assert_echoes(&mut socket, b"\x81\x04ping").await;

    drop(socket);
    proxy.handle.stop().await.unwrap();
}

// ==================== Plain HTTP Tests ====================

#[tokio::test]
async fn forwards_absolute_form_http() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let http_origin = spawn_http_origin().await;
    let proxy = start_proxy(Filter::new(), &origin, &[]).await;

    let stream = TcpStream::connect(proxy.handle.addr()).await.unwrap();
    let uri = format!("http://{http_origin}/plain");
    let (response, body) = send(stream, get(&uri, &http_origin.to_string())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body, "origin saw /plain");

    proxy.handle.stop().await.unwrap();
}

#[tokio::test]
async fn origin_form_request_is_rejected() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let proxy = start_proxy(Filter::new(), &origin, &[]).await;

    let stream = TcpStream::connect(proxy.handle.addr()).await.unwrap();
    let (response, _) = send(stream, get("/not-a-proxy-request", "localhost")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    proxy.handle.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_origin_answers_bad_gateway() {
    init_tracing();
    let origin = spawn_tls_origin().await;
    let proxy = start_proxy(Filter::new(), &origin, &[]).await;

    // Nothing listens on a port whose listener has been dropped.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let stream = TcpStream::connect(proxy.handle.addr()).await.unwrap();
    let uri = format!("http://{addr}/missing");
    let (response, body) = send(stream, get(&uri, &addr.to_string())).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(!body.is_empty());

    proxy.handle.stop().await.unwrap();
}
