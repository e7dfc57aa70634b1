pub mod auth;
pub mod connect;
pub mod health;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::browser::BrowserPool;
use crate::config::{Config, ServerConfig};
use crate::metrics::Metrics;
use crate::profile::ProfileRegistry;
use crate::queue::ProxyQueue;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<BrowserPool>,
    pub queue: Arc<ProxyQueue>,
    pub metrics: Arc<Metrics>,
    pub profiles: Arc<ProfileRegistry>,
    pub server: Arc<ServerConfig>,
    pub enable_custom_profiles: bool,
    /// Cancelled when the server begins its graceful shutdown grace window,
    /// so in-flight relays end as `SessionTimedOut` instead of hanging.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: &Config,
        pool: Arc<BrowserPool>,
        queue: Arc<ProxyQueue>,
        metrics: Arc<Metrics>,
        profiles: ProfileRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            queue,
            metrics,
            profiles: Arc::new(profiles),
            server: Arc::new(config.server.clone()),
            enable_custom_profiles: config.chrome.enable_custom_chrome_profiles,
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    // The token gate guards only `/connect` — `/healthcheck` must stay open
    // for liveness probes regardless of access-token configuration.
    let connect_route = Router::new()
        .route("/connect", get(connect::connect))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::access_token_middleware,
        ));

    Router::new()
        .route("/healthcheck", get(health::healthcheck))
        .merge(connect_route)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
