//! Command-line launcher for the authenticating proxy.
//!
//! Credentials come from the `TASKCLUSTER_*` environment; flags override
//! the network-facing settings. Runs until interrupted.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tcproxy", version, about = "Local authenticating proxy for Taskcluster APIs")]
struct Cli {
    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind; keep this on loopback unless the network is
    /// trusted, the local surface is unauthenticated
    #[arg(long)]
    bind: Option<String>,

    /// Backend root URL, overriding TASKCLUSTER_ROOT_URL
    #[arg(long)]
    root_url: Option<String>,

    /// Restrict calls to these scopes (repeatable)
    #[arg(long = "authorized-scope")]
    authorized_scopes: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match tcproxy::ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    if let Some(root_url) = cli.root_url {
        config.root_url = root_url;
    }
    if !cli.authorized_scopes.is_empty() {
        config.authorized_scopes = Some(cli.authorized_scopes);
    }

    let handle = match tcproxy::start(config).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start proxy: {}", e);
            std::process::exit(1);
        }
    };
    info!("Proxy ready on port {}", handle.port());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for interrupt: {}", e);
    }
    info!("Interrupt received, shutting down");
    handle.shutdown();
}
