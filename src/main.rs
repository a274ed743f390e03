use clap::Parser;
use cloudanchor::acme::{AcmeDirectory, LETS_ENCRYPT_STAGING};
use cloudanchor::configurator::{Configurator, ProxyConfig};
use cloudanchor::store::CertStore;
use cloudanchor::templates::ServerType;
use cloudanchor::watcher::{Watcher, WatcherConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Sync web server configuration with running Docker containers.
#[derive(Debug, Parser)]
#[command(name = "cloudanchor", version)]
struct Args {
    /// Address to listen on for ACME HTTP-01 challenges
    #[arg(long, env = "ACME_ADDR", default_value = "127.0.0.1:8080")]
    acme_addr: String,

    /// Directory for storing TLS keys and certificates
    #[arg(long, env = "ACME_DIR", default_value = "/etc/cloudanchor")]
    acme_dir: PathBuf,

    /// ACME directory URL
    #[arg(long, env = "ACME_DIRECTORY", default_value = LETS_ENCRYPT_STAGING)]
    acme_directory: String,

    /// Web server type to manage
    #[arg(long, env = "SERVER_TYPE", value_enum, default_value_t = ServerType::Nginx)]
    server_type: ServerType,

    /// File for storing the web server configuration
    #[arg(long, env = "SERVER_FILE")]
    server_file: Option<PathBuf>,

    /// Absolute path to the web server's pidfile
    #[arg(long, env = "SERVER_PIDFILE")]
    server_pidfile: Option<PathBuf>,

    /// Docker engine URI
    #[arg(long, env = "DOCKER_HOST", default_value = "unix:///var/run/docker.sock")]
    docker_host: String,

    /// Enable debug output
    #[arg(long, env = "DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let directive = if args.debug {
        "cloudanchor=debug"
    } else {
        "cloudanchor=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting cloudanchor");

    let challenge_addr: SocketAddr = args.acme_addr.parse().map_err(|err| {
        error!(addr = %args.acme_addr, error = %err, "invalid --acme-addr");
        anyhow::anyhow!("invalid --acme-addr '{}': {}", args.acme_addr, err)
    })?;

    let store = Arc::new(CertStore::new(&args.acme_dir)?);
    let provider = AcmeDirectory::new(&args.acme_directory);

    let proxy = ProxyConfig {
        server: args.server_type,
        file: args
            .server_file
            .unwrap_or_else(|| args.server_type.default_file()),
        pidfile: args
            .server_pidfile
            .unwrap_or_else(|| args.server_type.default_pidfile()),
        auth_addr: args.acme_addr.clone(),
    };
    info!(
        server = %proxy.server,
        file = %proxy.file.display(),
        pidfile = %proxy.pidfile.display(),
        acme_dir = %args.acme_dir.display(),
        directory = %args.acme_directory,
        "configuration loaded"
    );

    let configurator = Arc::new(Configurator::new(
        proxy,
        Box::new(provider),
        store,
        challenge_addr,
    ));
    let watcher = Watcher::new(
        WatcherConfig {
            host: args.docker_host,
        },
        Arc::clone(&configurator),
    );

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    watcher.close().await;
    configurator.close().await;

    info!("Shutdown complete");
    Ok(())
}
