//! Opaque TCP tunnels for hosts that are not intercepted.

use std::io;

use http::uri::Authority;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::handler::{empty_body, error_response, ProxyBody, ProxyHandler};

/// Copies bytes in both directions until either side closes.
pub async fn tunnel<A, B>(mut client: A, mut upstream: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            tracing::trace!("Tunnel closed: {} bytes sent, {} bytes received", sent, received);
        }
        Err(e) if is_closed_error(&e) => tracing::trace!("Tunnel closed: {}", e),
        Err(e) => tracing::debug!("Tunnel error: {}", e),
    }
}

/// Errors that only mean the peer went away.
pub(crate) fn is_closed_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Dials `authority` and answers the CONNECT with `200`, then relays the
/// upgraded connection. Dial failures are answered with `502`.
pub(crate) async fn tunnel_connect(
    handler: &ProxyHandler,
    req: Request<Incoming>,
    authority: &Authority,
) -> Response<ProxyBody> {
    let target = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(443));

    let upstream = match tokio::time::timeout(handler.timeouts.connect, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("Failed to connect to {}: {}", crate::redacted(&target), e);
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
        Err(_) => {
            tracing::warn!("Connecting to {} timed out", crate::redacted(&target));
            return error_response(StatusCode::BAD_GATEWAY, "connect timed out");
        }
    };

    tracing::debug!("Tunneling to {}", crate::redacted(&target));
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => tunnel(TokioIo::new(upgraded), upstream).await,
            Err(e) => tracing::debug!("CONNECT upgrade failed: {}", e),
        }
    });

    Response::new(empty_body())
}
