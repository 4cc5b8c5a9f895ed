//! interpose: intercepting HTTP/HTTPS proxy
//!
//! This is the main entry point for the interpose binary. It handles CLI
//! argument parsing, configuration loading, logging initialization, CA
//! setup, and runs the proxy until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use interpose::{
    certs::{CachingProvider, CertificateAuthority},
    cli::Cli,
    config::{Config, ConfigLoader},
    proxy::{Forwarder, Proxy},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, config.log.level.as_deref())?;

    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    let authority = Arc::new(load_authority(&config)?);
    if let Some(path) = authority.cert_path() {
        info!("Ephemeral CA certificate: {}", path.display());
    }
    let provider = Arc::new(CachingProvider::new(authority.clone(), config.ssl.ttl()));

    let mut forwarder = Forwarder::new()
        .with_ports(config.forwarder.http_port(), config.forwarder.https_port());
    for (host, ip) in &config.forwarder.resolve {
        forwarder = forwarder.with_resolve(host.clone(), *ip);
    }

    let proxy = Proxy::builder()
        .provider(provider)
        .forwarder(forwarder)
        .build()
        .context("Failed to build proxy")?;

    let host = config.proxy.listen_host();
    let explicit = SocketAddr::new(host, config.proxy.port());
    let transparent = config
        .proxy
        .transparent_port
        .map(|port| SocketAddr::new(host, port));

    let listening = proxy
        .bind(explicit, transparent)
        .await
        .with_context(|| format!("Failed to bind proxy on {}", explicit))?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    listening.shutdown();
    listening.wait().await;

    Ok(())
}

/// Load the configured CA, or generate an ephemeral one.
fn load_authority(config: &Config) -> Result<CertificateAuthority> {
    let subject = config.ssl.subject();
    let validity_days = config.ssl.validity_days();

    match (&config.ssl.ca_cert, &config.ssl.ca_key) {
        (Some(cert), Some(key)) => {
            CertificateAuthority::from_pem_files(cert, key, subject, validity_days)
                .context("Failed to load CA certificate")
        }
        _ => CertificateAuthority::generate(subject, validity_days)
            .context("Failed to generate ephemeral CA"),
    }
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, then `[log] level`, then warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, configured: Option<&str>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(configured.unwrap_or("warn")))
            .context("Invalid [log] level")?,
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
