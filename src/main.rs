//! localhttps - Main entry point
//!
//! Provisions a certificate for the configured host, then serves HTTPS on the
//! listen address and forwards everything to the upstream.

use anyhow::{Context, Result};
use localhttps::{build_tls_acceptor, CertificateManager, Cli, Config, ProxyServer};
use std::sync::Arc;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

const BANNER: &str = r" _     _   _
| |   | | | |
| |__ | |_| |_ _ __  ___
| '_ \| __| __| '_ \/ __|
| | | | |_| |_| |_) \__ \
|_| |_|\__|\__| .__/|___/
              | |
              |_|
";

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    init_logging(&cli.log_level);

    if let Err(e) = run(cli.into_config()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize logging on stderr so stdout only carries the banner
fn init_logging(log_level: &str) {
    let log_level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run(config: Config) -> Result<()> {
    let cert_manager = CertificateManager::new(&config.certs_dir);
    let host = config.host.clone();
    let bundle = tokio::task::spawn_blocking(move || cert_manager.ensure(&host))
        .await
        .context("Certificate task panicked")??;

    let acceptor = build_tls_acceptor(&bundle.cert_path, &bundle.key_path)?;
    let server = Arc::new(ProxyServer::new(&config.upstream, acceptor)?);

    print_banner(&config);

    server.run(config.listen.socket_addr()).await
}

fn print_banner(config: &Config) {
    println!("{}", BANNER);
    println!("upstream: {}", config.upstream);
    println!("listen:   {}", config.listen);
    println!("proxy:    {}", config.proxy_url());
    println!();
    println!("==> let's go!");
}
