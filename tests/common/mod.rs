//! Shared fixtures for the integration suite: a fake-launcher-backed pool
//! and a full in-process HTTP server bound to an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrome_relay_proxy::browser::testing::FakeLauncher;
use chrome_relay_proxy::browser::BrowserPool;
use chrome_relay_proxy::config::{
    ChromeConfig, ChromeOptions, ChromePoolConfig, Config, LoggerConfig, MetricsSinkConfig,
    ProxyQueueConfig, ServerConfig,
};
use chrome_relay_proxy::http::AppState;
use chrome_relay_proxy::metrics::Metrics;
use chrome_relay_proxy::queue::ProxyQueue;
use tokio_util::sync::CancellationToken;

pub fn pool_config(max: usize, min: usize) -> ChromePoolConfig {
    ChromePoolConfig {
        max_browser_instances: max,
        min_browser_instances: min,
        enable_auto_assign_debug_port: true,
        debug_ports: Vec::new(),
    }
}

pub fn chrome_config(reuse: bool) -> ChromeConfig {
    ChromeConfig {
        enable_browser_reuse: reuse,
        headless: true,
        enable_custom_chrome_profiles: false,
        enable_browser_auto_shutdown: true,
        browser_auto_shutdown_timeout: Duration::from_secs(30),
        browser_auto_idle_timeout: Duration::from_secs(30),
        default_options: ChromeOptions::new(""),
    }
}

pub fn test_config(pool: ChromePoolConfig, chrome: ChromeConfig, access_token: Option<&str>) -> Config {
    Config {
        chrome_pool: pool,
        chrome,
        logger: LoggerConfig {
            log_level: "warn".to_string(),
            log_output: None,
        },
        server: ServerConfig {
            port: 0,
            access_token: access_token.unwrap_or_default().to_string(),
            access_token_validation_enabled: access_token.is_some(),
        },
        proxy_queue: ProxyQueueConfig {
            throughput_scale_up_threshold: 0.6,
        },
        metrics_sinks: MetricsSinkConfig::default(),
    }
}

/// Builds a pool (fake launcher), warms it, wires the full HTTP app, and
/// serves it on an ephemeral localhost port. Returns the bound address plus
/// handles callers can inspect/mutate; the server task is aborted on drop.
pub struct TestApp {
    pub addr: SocketAddr,
    pub pool: Arc<BrowserPool>,
    pub metrics: Arc<Metrics>,
    server_task: tokio::task::JoinHandle<()>,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

pub async fn spawn_app(config: Config) -> TestApp {
    spawn_app_with_launcher(config, Arc::new(FakeLauncher::new())).await
}

pub async fn spawn_app_with_launcher(
    config: Config,
    launcher: Arc<dyn chrome_relay_proxy::browser::BrowserLauncher>,
) -> TestApp {
    let pool =
        BrowserPool::new_with_launcher(config.chrome_pool.clone(), config.chrome.clone(), launcher);
    pool.warm().await.expect("warm should succeed with the fake launcher");

    let metrics = Arc::new(Metrics::new());
    metrics.set_chrome_instances(pool.len().await);

    let queue = ProxyQueue::new(
        pool.clone(),
        metrics.clone(),
        config.proxy_queue.clone(),
        config.chrome.default_options.clone(),
    );

    let profiles = chrome_relay_proxy::profile::load_profiles(false).unwrap();
    let shutdown = CancellationToken::new();
    let state = AppState::new(&config, pool.clone(), queue, metrics.clone(), profiles, shutdown);
    let app = chrome_relay_proxy::http::router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        addr,
        pool,
        metrics,
        server_task,
    }
}

/// Polls `predicate` until it returns true or `timeout` elapses, sleeping
/// briefly between attempts. Used for reconciler-driven state that settles
/// asynchronously in a background task.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
