//! Certificate provisioning for the local TLS listener
//! Generates a self-signed RSA certificate per host and reuses it on later runs

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

const RSA_KEY_BITS: usize = 2048;
const SERIAL_NUMBER_BYTES: usize = 16;
const VALIDITY_DAYS: i64 = 365;
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const ORGANIZATION: &str = "localhttps";

/// Errors raised while provisioning a certificate bundle
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("host identifier must not be empty")]
    EmptyHost,

    #[error("failed to generate private key")]
    KeyGeneration(#[source] rsa::Error),

    #[error("failed to generate serial number")]
    SerialNumber(#[source] rand::Error),

    #[error("failed to encode private key: {0}")]
    KeyEncoding(String),

    #[error("failed to create certificate")]
    Certificate(#[from] rcgen::Error),

    #[error("failed to create certificate directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Filesystem locations of a host's certificate and private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// PEM-encoded output of a fresh certificate generation
pub struct GeneratedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Certificate manager keyed by host identifier
#[derive(Debug, Clone)]
pub struct CertificateManager {
    certs_dir: PathBuf,
}

impl CertificateManager {
    /// Create a manager rooted at `certs_dir`. Nothing is created until a
    /// bundle is first generated.
    pub fn new<P: AsRef<Path>>(certs_dir: P) -> Self {
        Self {
            certs_dir: certs_dir.as_ref().to_path_buf(),
        }
    }

    /// Shared root used when no directory is configured
    pub fn default_certs_dir() -> PathBuf {
        std::env::temp_dir().join("https-certs")
    }

    /// Expected bundle location for `host`
    pub fn bundle_paths(&self, host: &str) -> CertificateBundle {
        let dir = self.certs_dir.join(Self::sanitize_host(host));
        CertificateBundle {
            cert_path: dir.join(CERT_FILE),
            key_path: dir.join(KEY_FILE),
        }
    }

    /// Return the bundle for `host`, generating it on first use.
    ///
    /// Existing files are trusted as-is: expiry, key match and host binding
    /// are never re-checked. Delete the host directory to force a new bundle.
    pub fn ensure(&self, host: &str) -> Result<CertificateBundle, CertificateError> {
        if host.is_empty() {
            return Err(CertificateError::EmptyHost);
        }

        let bundle = self.bundle_paths(host);
        if bundle.cert_path.exists() && bundle.key_path.exists() {
            debug!("Reusing certificate at {}", bundle.cert_path.display());
            return Ok(bundle);
        }

        info!("Generating new certificate for {}", host);
        let generated = Self::generate_self_signed(host)?;

        if let Some(dir) = bundle.cert_path.parent() {
            create_private_dir(dir).map_err(|source| CertificateError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        fs::write(&bundle.cert_path, generated.cert_pem.as_bytes()).map_err(|source| {
            CertificateError::Write {
                path: bundle.cert_path.clone(),
                source,
            }
        })?;
        write_private_file(&bundle.key_path, generated.key_pem.as_bytes()).map_err(|source| {
            CertificateError::Write {
                path: bundle.key_path.clone(),
                source,
            }
        })?;

        info!("Wrote certificate to {}", bundle.cert_path.display());
        Ok(bundle)
    }

    /// Generate a self-signed CA certificate for `host` with a fresh
    /// 2048-bit RSA key, valid for 365 days from now
    pub fn generate_self_signed(host: &str) -> Result<GeneratedCertificate, CertificateError> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).map_err(CertificateError::KeyGeneration)?;

        let mut serial = [0u8; SERIAL_NUMBER_BYTES];
        OsRng
            .try_fill_bytes(&mut serial)
            .map_err(CertificateError::SerialNumber)?;

        let pkcs8_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CertificateError::KeyEncoding(e.to_string()))?;
        let key_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CertificateError::KeyEncoding(e.to_string()))?;
        let key_pair = KeyPair::from_pem_and_sign_algo(&pkcs8_pem, &PKCS_RSA_SHA256)?;

        let not_before = OffsetDateTime::now_utc();

        let mut params = CertificateParams::default();
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(VALIDITY_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, ORGANIZATION);
        distinguished_name.push(DnType::CommonName, host);
        params.distinguished_name = distinguished_name;

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into()?),
        };
        params.subject_alt_names = vec![san];

        let cert = params.self_signed(&key_pair)?;

        Ok(GeneratedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pem.to_string(),
        })
    }

    /// Keep the host inside a single directory under the root
    fn sanitize_host(host: &str) -> String {
        match host {
            "." | ".." => host.replace('.', "_"),
            _ => host.replace(['/', '\\'], "_"),
        }
    }
}

/// Create `dir` and any missing parents, readable by the owner only
fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// Write `contents` to a file that only the owner may read or write
fn write_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.flush()
}
