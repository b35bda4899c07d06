mod config;
mod error;
mod extractor;
mod rate_limit;
mod relay;
mod routes;
mod validator;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    extractor::YtDlpResolver,
    rate_limit::RateLimiter,
    relay::Relay,
    routes::{AppState, build_cors_layer, router},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tiktok_relay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env();
    debug!("Loaded configuration: {config:?}");

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: the socket address is used as the rate-limit key.");
    }

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max_requests,
        config.rate_limit_window,
    ));
    let shutdown = CancellationToken::new();
    let sweeper = rate_limiter.spawn_sweeper(shutdown.clone());

    let relay = Relay::new(config.relay_idle_timeout)
        .context("Could not build the HTTP client")?
        .with_shutdown(shutdown.clone());
    let resolver = YtDlpResolver::new(config.yt_dlp_path.clone(), config.extractor_timeout);

    let state = AppState {
        rate_limiter,
        resolver: Arc::new(resolver),
        relay,
        trust_proxy_headers: config.trust_proxy_headers,
    };
    let app = router(state).layer(build_cors_layer(&config.allowed_origins)?);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Could not bind {}", config.bind_addr))?;

    info!("TikTok relay listening on http://{}", config.bind_addr);
    info!("Health check: http://{}/health", config.bind_addr);
    info!(
        "Download endpoint: http://{}/download?url=<tiktok_url>",
        config.bind_addr
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await
    .context("HTTP server error");

    shutdown.cancel();
    let _ = sweeper.await;
    served
}

/// Resolves on Ctrl-C and cancels `shutdown`, which also ends open relays.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for the shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, closing open transfers");
    shutdown.cancel();
}
