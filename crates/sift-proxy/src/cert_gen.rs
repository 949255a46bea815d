//! Per-host leaf certificate issuance.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::OffsetDateTime;

use crate::cert_cache::CertCache;
use crate::cert_store::RootCertificateSource;
use crate::error::CertError;

/// Validity of issued leaf certificates.
pub const CERT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cached certificates are dropped this long before they stop being valid.
const EXPIRY_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Default number of cached leaf certificates.
pub const DEFAULT_CACHE_CAPACITY: usize = 5800;

/// Default interval between sweeps of expired certificates.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const LEAF_ORGANIZATION: &str = "Sift";

/// A leaf certificate and the TLS server config that presents it.
#[derive(Debug)]
pub struct LeafCertificate {
    cert_der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Server config for terminating TLS as this host, advertising HTTP/1.1.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }
}

/// Issues and caches leaf certificates signed by the root CA.
pub struct CertGenerator {
    root: Arc<dyn RootCertificateSource>,
    cache: Arc<CertCache<Arc<LeafCertificate>>>,
    provider: Arc<CryptoProvider>,
}

impl CertGenerator {
    pub fn new(root: Arc<dyn RootCertificateSource>, cache_capacity: NonZeroUsize) -> Self {
        Self {
            root,
            cache: Arc::new(CertCache::new(cache_capacity)),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Returns a certificate for `host`, issuing one on a cache miss.
    pub fn get_certificate(&self, host: &str) -> Result<Arc<LeafCertificate>, CertError> {
        if let Some(cert) = self.cache.get(host) {
            return Ok(cert);
        }

        let cert = Arc::new(self.issue(host)?);
        self.cache
            .put(host, cert.clone(), Instant::now() + CERT_TTL - EXPIRY_BUFFER);
        tracing::debug!("Issued certificate for {}", crate::redacted(host));
        Ok(cert)
    }

    /// The cache backing this generator.
    pub fn cache(&self) -> &Arc<CertCache<Arc<LeafCertificate>>> {
        &self.cache
    }

    fn issue(&self, host: &str) -> Result<LeafCertificate, CertError> {
        let root = self.root.root_certificate()?;
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, LEAF_ORGANIZATION);

        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = distinguished_name;
        params.serial_number = Some(random_serial());
        params.not_before = now - time::Duration::minutes(1);
        params.not_after = now + CERT_TTL;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;

        let cert = params.signed_by(&key_pair, root.issuer())?;
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut server_config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone(), root.cert_der().clone()], key_der)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(LeafCertificate {
            cert_der,
            server_config: Arc::new(server_config),
        })
    }
}

/// 128-bit random positive serial number.
fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 16] = rand::thread_rng().gen();
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_store::CertStore;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use x509_parser::prelude::*;

    fn generator() -> (TempDir, Arc<CertStore>, CertGenerator) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(CertStore::new(temp_dir.path()));
        store.init().unwrap();
        let generator = CertGenerator::new(store.clone(), NonZeroUsize::new(16).unwrap());
        (temp_dir, store, generator)
    }

    #[test]
    fn cached_certificate_is_reused() {
        let (_dir, _store, generator) = generator();
        let first = generator.get_certificate("example.com").unwrap();
        let second = generator.get_certificate("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = generator.get_certificate("other.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn leaf_names_only_the_requested_host() {
        let (_dir, _store, generator) = generator();
        let cert = generator.get_certificate("ads.example.com").unwrap();

        let (_, parsed) = X509Certificate::from_der(cert.cert_der()).unwrap();
        let san = parsed.subject_alternative_name().unwrap().unwrap();
        let names: Vec<_> = san
            .value
            .general_names
            .iter()
            .map(|name| match name {
                GeneralName::DNSName(dns) => dns.to_string(),
                other => panic!("unexpected SAN {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["ads.example.com"]);
    }

    #[test]
    fn leaf_validity_is_one_day() {
        let (_dir, _store, generator) = generator();
        let cert = generator.get_certificate("example.com").unwrap();
        let (_, parsed) = X509Certificate::from_der(cert.cert_der()).unwrap();

        let validity = parsed.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(lifetime, CERT_TTL.as_secs() as i64 + 60);
    }

    #[test]
    fn missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(CertStore::new(temp_dir.path()));
        let generator = CertGenerator::new(store, NonZeroUsize::new(4).unwrap());
        assert!(matches!(
            generator.get_certificate("example.com"),
            Err(CertError::NotInitialized)
        ));
    }

    #[test]
    fn purge_forces_reissue() {
        let (_dir, _store, generator) = generator();
        let first = generator.get_certificate("example.com").unwrap();
        generator.cache().purge();
        let second = generator.get_certificate("example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn leaf_chains_to_root_in_handshake() {
        let (_dir, store, generator) = generator();
        let leaf = generator.get_certificate("example.com").unwrap();
        let root = store.init().unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(root.cert_der().clone()).unwrap();
        let client_config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let acceptor = TlsAcceptor::from(leaf.server_config());
        let server = tokio::spawn(async move {
            let mut tls = acceptor.accept(server_io).await.unwrap();
            tls.write_all(b"ok").await.unwrap();
            tls.shutdown().await.unwrap();
        });

        let connector = TlsConnector::from(Arc::new(client_config));
        let name = ServerName::try_from("example.com").unwrap();
        let mut tls = connector.connect(name, client_io).await.unwrap();
        let mut buf = Vec::new();
        tls.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ok");
        server.await.unwrap();
    }
}
