// Crate-level lint configuration
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::similar_names)]

//! Kubernetes DNS reverse proxy - entry point
//!
//! Parses the CLI flags, loads the routes table, and runs two servers:
//! the proxy itself and a trivial status endpoint for health checks.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kubedns_proxy::accesslog::AccessLog;
use kubedns_proxy::config::{self, Config};
use kubedns_proxy::director::Director;
use kubedns_proxy::metrics::Metrics;
use kubedns_proxy::router::{self, AppState};
use kubedns_proxy::transport::ThrottledTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logging(config.verbose);

    info!("starting kubedns-proxy v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    info!(suffixes = ?config.domain_suffixes(), "domain suffixes");
    info!(suffix = %config.kubernetes_suffix(), "kubernetes service domain suffix");

    let mut director = Director::new();
    if config.validate_routes || !config.routes_filename.is_empty() {
        let routes = config::load_routes(&config.routes_filename)?;
        director = Director::from_routes(&routes);
        info!(hosts = director.len(), "routes are valid");
    }
    if config.validate_routes {
        return Ok(());
    }

    let proxy_addr = config.listen_addr()?;
    let status_addr = config.status_listen_addr()?;

    let transport = ThrottledTransport::new(
        config.concurrency,
        config.compression_level,
        config.timeout,
    );
    let state = AppState {
        config: Arc::new(config),
        director: Arc::new(director),
        transport: Arc::new(transport),
        metrics: Arc::new(Metrics::new()),
    };
    let app = router::app(state, AccessLog::stdout());

    let proxy_server = tokio::spawn(async move {
        info!(%proxy_addr, "starting proxy server");
        let listener = TcpListener::bind(proxy_addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok::<(), anyhow::Error>(())
    });

    let status_server = tokio::spawn(async move {
        info!(%status_addr, "starting status server");
        let listener = TcpListener::bind(status_addr).await?;
        axum::serve(listener, router::status_app().into_make_service()).await?;
        Ok::<(), anyhow::Error>(())
    });

    // Either server failing is fatal.
    tokio::select! {
        result = proxy_server => result.context("proxy server task panicked")??,
        result = status_server => result.context("status server task panicked")??,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}
