//! Sift Proxy - filtering MITM proxy.
//!
//! This crate runs a local forward proxy that applies [`sift_core::Filter`]
//! rules to HTTP and HTTPS traffic.
//!
//! ## Features
//!
//! - Plaintext HTTP forwarding for absolute-form requests
//! - TLS interception of CONNECT tunnels with per-host leaf certificates
//! - Opaque tunneling for ignored hosts and hosts that reject interception
//! - WebSocket relay on plaintext and intercepted connections
//! - Graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//! Client → Proxy ─┬─ absolute-form request ──────────────→ Filter → Origin
//!                 │
//!                 └─ CONNECT host:port ─┬─ transparent / IP ──→ Tunnel
//!                                       │
//!                                       └─ intercept ─→ TLS (leaf cert)
//!                                                         │
//!                                                         ▼
//!                                                  Filter → Origin
//! ```

mod cert_cache;
mod cert_gen;
mod cert_store;
mod error;
mod handler;
mod headers;
mod mitm;
mod proxy;
mod transparent;
mod tunnel;
mod websocket;

use std::fmt;

pub use cert_cache::CertCache;
pub use cert_gen::{CertGenerator, LeafCertificate, CERT_TTL, DEFAULT_CACHE_CAPACITY, DEFAULT_SWEEP_INTERVAL};
pub use cert_store::{CertStore, RootCertificate, RootCertificateSource};
pub use error::{CertError, ProxyError, Result};
pub use headers::{header_contains_token, is_websocket_upgrade, remove_hop_headers};
pub use mitm::is_tls_error;
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer, Timeouts};
pub use transparent::TransparentHosts;
pub use tunnel::tunnel;

/// Log wrapper that prints hostnames and URLs only in debug builds.
pub(crate) struct Redacted<T>(T);

impl<T: fmt::Display> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if cfg!(debug_assertions) {
            self.0.fmt(f)
        } else {
            f.write_str("[redacted]")
        }
    }
}

pub(crate) fn redacted<T: fmt::Display>(value: T) -> Redacted<T> {
    Redacted(value)
}
