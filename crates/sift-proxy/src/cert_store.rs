//! Root CA storage.
//!
//! Generates, persists and loads the root CA that signs per-host leaf
//! certificates.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};

use crate::error::CertError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "sift-ca.crt";
const CA_KEY_FILENAME: &str = "sift-ca.key";

const CA_COMMON_NAME: &str = "Sift Root CA";
const CA_ORGANIZATION: &str = "Sift";
const CA_VALIDITY_DAYS: i64 = 365 * 32;

/// A loaded root CA: the signing issuer plus its certificate.
pub struct RootCertificate {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
}

impl RootCertificate {
    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// DER encoding of the CA certificate.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// PEM encoding of the CA certificate, for trust-store installation.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

impl fmt::Debug for RootCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCertificate")
            .field("cert_der_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

/// Source of the root CA used to sign leaf certificates.
pub trait RootCertificateSource: Send + Sync {
    /// Returns the loaded root CA, or an error if none is available.
    fn root_certificate(&self) -> Result<Arc<RootCertificate>, CertError>;
}

/// Manages the root CA files in a directory.
#[derive(Debug)]
pub struct CertStore {
    /// Path to the CA directory.
    ca_dir: PathBuf,
    loaded: RwLock<Option<Arc<RootCertificate>>>,
}

impl CertStore {
    /// Creates a new store for the given directory. Nothing is read until [`init`](Self::init).
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
            loaded: RwLock::new(None),
        }
    }

    /// Creates a store using the default Sift data directory.
    pub fn with_default_dir() -> Result<Self, CertError> {
        let project_dirs = directories::ProjectDirs::from("com", "sift", "Sift")
            .ok_or_else(|| CertError::Write("Failed to get project dirs".into()))?;

        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if both CA files exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Loads the CA from disk, generating it first if it does not exist.
    pub fn init(&self) -> Result<Arc<RootCertificate>, CertError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        let root = Arc::new(self.load()?);
        *self.loaded.write() = Some(root.clone());
        Ok(root)
    }

    /// Generates a new root CA and writes it to disk, replacing any existing one.
    pub fn generate_ca(&self) -> Result<(), CertError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair = KeyPair::generate()?;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
        distinguished_name.push(DnType::OrganizationName, CA_ORGANIZATION);

        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key_pair)?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CertError::Write(e.to_string()))?;
        write_private(&self.key_path(), key_pair.serialize_pem().as_bytes())
            .map_err(|e| CertError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    /// Reads and parses the CA files.
    pub fn load(&self) -> Result<RootCertificate, CertError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CertError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CertError::Parse(e.to_string()))?;
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertError::Parse("no certificate in PEM file".into()))??;

        Ok(RootCertificate {
            issuer,
            cert_der,
            cert_pem,
        })
    }

    /// Deletes the CA files and forgets the loaded CA.
    pub fn remove(&self) -> Result<(), CertError> {
        *self.loaded.write() = None;
        for path in [self.cert_path(), self.key_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CertError::Write(e.to_string())),
            }
        }
        tracing::info!("Removed CA certificate from {:?}", self.ca_dir);
        Ok(())
    }
}

impl RootCertificateSource for CertStore {
    fn root_certificate(&self) -> Result<Arc<RootCertificate>, CertError> {
        self.loaded.read().clone().ok_or(CertError::NotInitialized)
    }
}

/// Writes a file readable only by the owner.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(contents)
}
