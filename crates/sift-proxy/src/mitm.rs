//! CONNECT handling and TLS interception.

use std::convert::Infallible;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use http::uri::{Authority, Uri};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio_rustls::TlsAcceptor;

use crate::cert_gen::LeafCertificate;
use crate::handler::{empty_body, error_response, error_text, ProxyBody, ProxyHandler};
use crate::tunnel;

const DEFAULT_HTTPS_PORT: u16 = 443;

/// Returns true if an error message describes a TLS failure, such as an
/// untrusted certificate or a fatal alert. Used for upstream client errors,
/// whose source chain is only available as text.
pub fn is_tls_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["tls", "certificate", "handshake", "alert"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Returns true if a client TLS accept failed inside the TLS protocol,
/// for example on a bad record, a fatal alert or plaintext on the socket.
/// Plain I/O failures such as an early EOF carry no rustls error.
pub(crate) fn is_tls_layer_error(error: &io::Error) -> bool {
    error
        .get_ref()
        .is_some_and(|inner| inner.is::<rustls::Error>())
}

/// Host of a CONNECT authority without IPv6 brackets.
fn bare_host(authority: &Authority) -> &str {
    authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
}

/// Handles a CONNECT request.
///
/// IP literals and transparent hosts are tunneled. Anything else is
/// intercepted: the client gets a `200` and the upgraded connection is
/// served over TLS with a certificate issued for the host.
pub(crate) async fn handle_connect(
    handler: ProxyHandler,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return error_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
    };
    let host = bare_host(&authority).to_ascii_lowercase();

    if host.parse::<IpAddr>().is_ok() || handler.transparent.contains(&host) {
        return tunnel::tunnel_connect(&handler, req, &authority).await;
    }

    let leaf = match handler.certs.get_certificate(&host) {
        Ok(leaf) => leaf,
        Err(e) => {
            tracing::warn!(
                "Failed to issue certificate for {}, tunneling instead: {}",
                crate::redacted(&host),
                e
            );
            return tunnel::tunnel_connect(&handler, req, &authority).await;
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => intercept(handler, upgraded, leaf, authority, host).await,
            Err(e) => tracing::debug!("CONNECT upgrade failed: {}", e),
        }
    });

    Response::new(empty_body())
}

/// Terminates the client's TLS session and serves HTTP/1.1 on it.
async fn intercept(
    handler: ProxyHandler,
    upgraded: Upgraded,
    leaf: Arc<LeafCertificate>,
    authority: Authority,
    host: String,
) {
    let acceptor = TlsAcceptor::from(leaf.server_config());
    let accepted = tokio::time::timeout(
        handler.timeouts.tls_handshake,
        acceptor.accept(TokioIo::new(upgraded)),
    )
    .await;

    let stream = match accepted {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            // A client that drops the connection mid-handshake has not
            // rejected the certificate.
            if is_tls_layer_error(&e) {
                handler.transparent.add(&host);
            }
            tracing::debug!(
                "TLS handshake with client failed for {}: {}",
                crate::redacted(&host),
                error_text(&e)
            );
            return;
        }
        Err(_) => {
            tracing::debug!("TLS handshake with client timed out for {}", crate::redacted(&host));
            return;
        }
    };

    let header_read_timeout = handler.timeouts.header_read;
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let authority = authority.clone();
        let host = host.clone();
        async move { Ok::<_, Infallible>(handle_intercepted(&handler, req, &authority, &host).await) }
    });

    if let Err(e) = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout)
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        tracing::debug!("Intercepted connection closed with error: {}", e);
    }
}

/// Restores the absolute `https` URI of a request read from an
/// intercepted connection and forwards it.
async fn handle_intercepted(
    handler: &ProxyHandler,
    req: Request<Incoming>,
    authority: &Authority,
    host: &str,
) -> Response<ProxyBody> {
    let (mut parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri = match authority.port_u16() {
        Some(port) if port != DEFAULT_HTTPS_PORT => {
            format!("https://{}:{}{}", authority.host(), port, path_and_query)
        }
        _ => format!("https://{}{}", authority.host(), path_and_query),
    };
    match uri.parse::<Uri>() {
        Ok(uri) => parts.uri = uri,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }

    handler
        .forward(Request::from_parts(parts, body), Some(host))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== TLS Error Tests ====================

    #[test]
    fn recognizes_tls_failures() {
        assert!(is_tls_error("invalid peer certificate: UnknownIssuer"));
        assert!(is_tls_error("received fatal alert: BadCertificate"));
        assert!(is_tls_error("TLS handshake eof"));
        assert!(is_tls_error("tls: unknown certificate authority"));
    }

    #[test]
    fn ignores_other_failures() {
        assert!(!is_tls_error("connection refused"));
        assert!(!is_tls_error("dns error: failed to lookup address information"));
        assert!(!is_tls_error(""));
    }

    // ==================== Handshake Classification Tests ====================

    fn acceptor() -> (tempfile::TempDir, TlsAcceptor) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(crate::cert_store::CertStore::new(temp_dir.path()));
        store.init().unwrap();
        let generator = crate::cert_gen::CertGenerator::new(
            store,
            std::num::NonZeroUsize::new(4).unwrap(),
        );
        let leaf = generator.get_certificate("example.com").unwrap();
        (temp_dir, TlsAcceptor::from(leaf.server_config()))
    }

    #[tokio::test]
    async fn plaintext_request_is_a_tls_layer_failure() {
        use tokio::io::AsyncWriteExt;

        let (_dir, acceptor) = acceptor();
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let err = acceptor.accept(server).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(is_tls_layer_error(&err));
    }

    #[tokio::test]
    async fn dropped_client_is_not_a_tls_layer_failure() {
        let (_dir, acceptor) = acceptor();
        let (client, server) = tokio::io::duplex(4096);
        drop(client);

        let err = acceptor.accept(server).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(!is_tls_layer_error(&err));
    }

    #[test]
    fn plain_io_errors_are_not_tls_layer_failures() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        assert!(!is_tls_layer_error(&err));

        let err = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::DecryptError);
        assert!(is_tls_layer_error(&err));
    }

    // ==================== Authority Tests ====================

    #[test]
    fn bare_host_strips_ipv6_brackets() {
        let authority: Authority = "[::1]:443".parse().unwrap();
        assert_eq!(bare_host(&authority), "::1");
        assert!(bare_host(&authority).parse::<IpAddr>().is_ok());

        let authority: Authority = "example.com:8443".parse().unwrap();
        assert_eq!(bare_host(&authority), "example.com");
    }
}
