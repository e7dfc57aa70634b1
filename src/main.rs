use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use chrome_relay_proxy::config::Config;
use chrome_relay_proxy::metrics::Metrics;
use chrome_relay_proxy::{browser, http, logging, profile, queue};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    logging::init(&config.logger);

    tracing::info!(
        port = config.server.port,
        max_instances = config.chrome_pool.max_browser_instances,
        min_instances = config.chrome_pool.min_browser_instances,
        "starting chrome relay proxy"
    );

    let profiles = profile::load_profiles(config.chrome.enable_custom_chrome_profiles)?;

    let pool = browser::BrowserPool::new(config.chrome_pool.clone(), config.chrome.clone());
    pool.warm().await?;

    let metrics = Arc::new(Metrics::new());
    metrics.set_chrome_instances(pool.len().await);

    let queue = queue::ProxyQueue::new(
        pool.clone(),
        metrics.clone(),
        config.proxy_queue.clone(),
        config.chrome.default_options.clone(),
    );

    let shutdown = CancellationToken::new();
    let state = http::AppState::new(&config, pool.clone(), queue.clone(), metrics, profiles, shutdown.clone());
    let app = http::router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone(), queue.clone()));

    if tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), serve)
        .await
        .is_err()
    {
        tracing::warn!("grace window elapsed with connections still draining, forcing shutdown");
    }

    pool.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Waits for SIGINT/SIGTERM, cancels in-flight relays immediately, stops
/// admitting new queue elements, then grants a grace window for existing
/// connections to drain before the HTTP server itself stops.
async fn shutdown_signal(shutdown: CancellationToken, queue: Arc<queue::ProxyQueue>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, entering grace window");
    queue.stop().await;
    shutdown.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
}
