pub mod browser;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod port_pool;
pub mod profile;
pub mod queue;
pub mod relay;
