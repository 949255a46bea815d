//! WebSocket upgrade relay.
//!
//! The handshake is sent to the origin on a dedicated HTTP/1.1 connection.
//! When the origin switches protocols, both upgraded connections are
//! joined and the frames are copied without inspection.

use http::uri::{PathAndQuery, Uri};
use http::{header, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::rt::{Read, Write};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::handler::{error_response, error_text, ProxyBody, ProxyHandler};
use crate::tunnel::tunnel;

/// Relays a WebSocket handshake to the origin and, on `101`, the
/// connection that follows.
pub(crate) async fn relay(handler: &ProxyHandler, mut req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(target) = UpstreamTarget::from_uri(req.uri()) else {
        return error_response(StatusCode::BAD_REQUEST, "WebSocket request without a host");
    };

    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::from(path);
    req.headers_mut().remove("proxy-connection");
    req.headers_mut().remove(header::PROXY_AUTHORIZATION);

    let stream = match tokio::time::timeout(handler.timeouts.connect, TcpStream::connect(&target.addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("WebSocket connect to {} failed: {}", crate::redacted(&target.addr), e);
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
        Err(_) => return error_response(StatusCode::BAD_GATEWAY, "connect timed out"),
    };

    let result = if target.secure {
        let server_name = match ServerName::try_from(target.host.clone()) {
            Ok(name) => name,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        };
        let connector = TlsConnector::from(handler.websocket_tls.clone());
        let tls = match tokio::time::timeout(
            handler.timeouts.tls_handshake,
            connector.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                let text = error_text(&e);
                tracing::warn!("WebSocket TLS handshake with {} failed: {}", crate::redacted(&target.addr), text);
                return error_response(StatusCode::BAD_GATEWAY, text);
            }
            Err(_) => return error_response(StatusCode::BAD_GATEWAY, "TLS handshake timed out"),
        };
        send_handshake(TokioIo::new(tls), req).await
    } else {
        send_handshake(TokioIo::new(stream), req).await
    };

    match result {
        Ok(response) => response.map(|body| body.boxed_unsync()),
        Err(e) => {
            let text = error_text(&e);
            tracing::warn!("WebSocket handshake with {} failed: {}", crate::redacted(&target.addr), text);
            error_response(StatusCode::BAD_GATEWAY, text)
        }
    }
}

/// Dial address and TLS server name of a WebSocket origin.
#[derive(Debug, PartialEq)]
struct UpstreamTarget {
    addr: String,
    host: String,
    secure: bool,
}

impl UpstreamTarget {
    fn from_uri(uri: &Uri) -> Option<Self> {
        let authority = uri.authority()?;
        let secure = matches!(uri.scheme_str(), Some("https") | Some("wss"));
        let port = authority
            .port_u16()
            .unwrap_or(if secure { 443 } else { 80 });
        Some(Self {
            addr: format!("{}:{}", authority.host(), port),
            host: authority
                .host()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            secure,
        })
    }
}

async fn send_handshake<I>(io: I, mut req: Request<Incoming>) -> Result<Response<Incoming>, hyper::Error>
where
    I: Read + Write + Unpin + Send + 'static,
{
    let client_upgrade = hyper::upgrade::on(&mut req);

    let (mut sender, conn) = http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!("WebSocket upstream connection error: {}", e);
        }
    });

    let mut response = sender.send_request(req).await?;
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let upstream_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client, upstream)) => tunnel(TokioIo::new(client), TokioIo::new(upstream)).await,
                Err(e) => tracing::debug!("WebSocket upgrade failed: {}", e),
            }
        });
    }

    Ok(response)
}
