//! Command-line surface and the startup configuration built from it

use crate::certificate::CertificateManager;
use clap::Parser;
use std::ffi::OsString;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Upstream used when no positional argument is given
pub const DEFAULT_UPSTREAM: &str = "8000";

/// Long flags that may also be spelled with a single dash (`-host=foo.dev`)
const LONG_FLAGS: &[&str] = &["host", "listen", "certs-dir", "log-level"];

const EXAMPLES: &str = "\
Examples:
    localhttps 8000                 # create proxy to localhost:8000
    localhttps -host=foo.dev 9000   # generate a cert for foo.dev:9000
    localhttps -listen=:8888        # listen on port 8888";

/// localhttps - serve a local HTTP service over HTTPS
#[derive(Parser, Debug)]
#[command(name = "localhttps")]
#[command(author = "localhttps Contributors")]
#[command(version)]
#[command(about = "Terminate TLS with a self-signed certificate and forward to a local HTTP service")]
#[command(after_help = EXAMPLES)]
pub struct Cli {
    /// Upstream to forward to: a bare port on 127.0.0.1, or host:port
    #[arg(value_name = "UPSTREAM")]
    pub upstream: Option<String>,

    /// Host name or IP the certificate is generated for
    #[arg(long, env = "LOCALHTTPS_HOST", default_value = "localhost")]
    pub host: String,

    /// Address the TLS listener binds to
    #[arg(long, env = "LOCALHTTPS_LISTEN", default_value = "127.0.0.1:8443")]
    pub listen: ListenAddr,

    /// Root directory for generated certificates, one subdirectory per host
    #[arg(long, env = "LOCALHTTPS_CERTS_DIR", default_value_os_t = CertificateManager::default_certs_dir())]
    pub certs_dir: PathBuf,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse process arguments, accepting single-dash long flags
    pub fn parse_args() -> Self {
        Self::parse_from(normalize_args(std::env::args_os()))
    }

    /// Build the immutable startup configuration
    pub fn into_config(self) -> Config {
        let upstream = resolve_upstream(self.upstream.as_deref());
        Config {
            host: self.host,
            listen: self.listen,
            upstream,
            certs_dir: self.certs_dir,
        }
    }
}

/// Rewrite `-flag[=value]` to `--flag[=value]` for the known long flags.
/// Everything after a bare `--` is left alone.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut passthrough = false;
    args.into_iter()
        .map(|arg| {
            let arg: OsString = arg.into();
            if passthrough {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text == "--" {
                passthrough = true;
                return arg;
            }
            match text.strip_prefix('-') {
                Some(rest) if !rest.starts_with('-') => {
                    let name = rest.split('=').next().unwrap_or(rest);
                    if LONG_FLAGS.contains(&name) {
                        OsString::from(format!("-{}", text))
                    } else {
                        arg
                    }
                }
                _ => arg,
            }
        })
        .collect()
}

/// Expand the positional upstream argument into a host:port string
pub fn resolve_upstream(arg: Option<&str>) -> String {
    let upstream = arg.unwrap_or(DEFAULT_UPSTREAM);
    if upstream.contains(':') {
        upstream.to_string()
    } else {
        format!("127.0.0.1:{}", upstream)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("failed to parse listen address '{0}'")]
pub struct InvalidListenAddr(String);

/// Listen address as typed by the user, plus its resolved socket address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    raw: String,
    addr: SocketAddr,
}

impl ListenAddr {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl FromStr for ListenAddr {
    type Err = InvalidListenAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidListenAddr(s.to_string());

        // ":8443" means every interface
        let target = if s.starts_with(':') {
            format!("0.0.0.0{}", s)
        } else {
            s.to_string()
        };

        let addrs: Vec<SocketAddr> = target
            .to_socket_addrs()
            .map_err(|_| invalid())?
            .collect();
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(invalid)?;

        Ok(Self {
            raw: s.to_string(),
            addr,
        })
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Startup configuration, built once and passed to each component
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub listen: ListenAddr,
    pub upstream: String,
    pub certs_dir: PathBuf,
}

impl Config {
    /// URL a browser should open, without the port when it is 443
    pub fn proxy_url(&self) -> String {
        let host = match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]", self.host),
            _ => self.host.clone(),
        };
        match self.listen.port() {
            443 => format!("https://{}/", host),
            port => format!("https://{}:{}/", host, port),
        }
    }
}
