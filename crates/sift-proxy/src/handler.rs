//! Request pipeline shared by plaintext and intercepted traffic.
//!
//! Requests pass through the filter before they are forwarded. Responses
//! pass through it again on the way back.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use http::{header, request, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;

use sift_core::Filter;

use crate::cert_gen::CertGenerator;
use crate::headers::{is_websocket_upgrade, remove_hop_headers};
use crate::mitm;
use crate::proxy::Timeouts;
use crate::transparent::TransparentHosts;
use crate::websocket;

/// Body type for every response the proxy produces.
pub(crate) type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Pooled client for upstream requests.
pub(crate) type HttpClient = Client<HttpsConnector<HttpConnector>, Incoming>;

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn bytes_to_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

/// Plain-text error response.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(bytes_to_body(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Renders an error and its sources as one line.
pub(crate) fn error_text(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(err) = source {
        let message = err.to_string();
        if !text.contains(&message) {
            text.push_str(": ");
            text.push_str(&message);
        }
        source = err.source();
    }
    text
}

/// Copy of a request head, kept for response-phase matching after the
/// request itself has been sent.
fn request_head(parts: &request::Parts) -> request::Parts {
    let (mut head, ()) = Request::new(()).into_parts();
    head.method = parts.method.clone();
    head.uri = parts.uri.clone();
    head.version = parts.version;
    head.headers = parts.headers.clone();
    head
}

/// Shared state for handling proxied requests.
#[derive(Clone)]
pub(crate) struct ProxyHandler {
    pub(crate) filter: Arc<Filter>,
    pub(crate) client: HttpClient,
    /// Client TLS config for WebSocket upstreams, advertising HTTP/1.1.
    pub(crate) websocket_tls: Arc<rustls::ClientConfig>,
    pub(crate) certs: Arc<CertGenerator>,
    pub(crate) transparent: Arc<TransparentHosts>,
    pub(crate) timeouts: Timeouts,
}

impl ProxyHandler {
    /// Entry point for requests on the proxy listener.
    pub(crate) async fn handle(self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return mitm::handle_connect(self, req).await;
        }
        if req.uri().authority().is_none() {
            return error_response(StatusCode::BAD_REQUEST, "proxy requests must use absolute URIs");
        }
        self.forward(req, None).await
    }

    /// Filters and forwards one request.
    ///
    /// `intercepted_host` is set for requests read from a MITM'd TLS
    /// connection; upstream TLS failures then mark the host transparent.
    pub(crate) async fn forward(
        &self,
        req: Request<Incoming>,
        intercepted_host: Option<&str>,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        if let Some(response) = self.filter.handle_request(&mut parts) {
            return response.map(|()| empty_body());
        }

        if is_websocket_upgrade(&parts.headers) {
            return websocket::relay(self, Request::from_parts(parts, body)).await;
        }

        remove_hop_headers(&mut parts.headers);
        let head = request_head(&parts);
        tracing::trace!("Forwarding {} {}", head.method, crate::redacted(&head.uri));

        let upstream = tokio::time::timeout(
            self.timeouts.client,
            self.client.request(Request::from_parts(parts, body)),
        )
        .await;

        let response = match upstream {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let text = error_text(&e);
                if let Some(host) = intercepted_host {
                    if mitm::is_tls_error(&text) {
                        self.transparent.add(host);
                    }
                }
                tracing::warn!("Upstream request to {} failed: {}", crate::redacted(&head.uri), text);
                return error_response(StatusCode::BAD_GATEWAY, text);
            }
            Err(_) => {
                tracing::warn!("Upstream request to {} timed out", crate::redacted(&head.uri));
                return error_response(StatusCode::BAD_GATEWAY, "upstream request timed out");
            }
        };

        let (mut res_parts, res_body) = response.into_parts();
        remove_hop_headers(&mut res_parts.headers);
        self.filter.handle_response(&head, &mut res_parts);
        Response::from_parts(res_parts, res_body.boxed_unsync())
    }
}
