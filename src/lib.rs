//! localhttps - Serve a local HTTP service over HTTPS
//!
//! Provides:
//! - Per-host self-signed certificate provisioning, reused across runs
//! - TLS termination on a local listener
//! - Plaintext forwarding to a single upstream with `X-Forwarded-Proto: https`

pub mod certificate;
pub mod config;
pub mod proxy;
pub mod tls;

pub use certificate::{CertificateBundle, CertificateError, CertificateManager};
pub use config::{Cli, Config, ListenAddr};
pub use proxy::ProxyServer;
pub use tls::build_tls_acceptor;
