use std::net::SocketAddr;
use std::sync::Arc;
use image_proxy::{config::ProxyConfig, router, AppState};

/// Image proxy server entry point.
///
/// Configuration comes from the environment (see `ProxyConfig::from_env`):
/// - `IMAGE_PROXY_ALLOWED_HOSTS`: comma-separated origin allowlist
/// - `IMAGE_PROXY_ADMIN_TOKEN`: enables the `/admin/cache` endpoints
/// - `PORT`: HTTP listen port (default: 8080)
/// - `RUST_LOG`: logging verbosity (default: "image_proxy=debug,tower_http=info")
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "image_proxy=debug,tower_http=info".into())
        )
        .init();

    tracing::info!("Starting image proxy");

    let cfg = ProxyConfig::from_env()?;
    tracing::info!(
        "Allowed origins: {}; cache ttl={}s, max entries={}, max bytes={}",
        cfg.allowed_hosts.join(", "),
        cfg.cache_ttl.as_secs(),
        cfg.max_cache_entries,
        cfg.max_cache_bytes
    );

    let state = Arc::new(AppState::new(cfg)?);
    let app = router(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);

    // 0.0.0.0 so the container's published port reaches us
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    // Per-IP rate limiting keys on the peer address.
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
