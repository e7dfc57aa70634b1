//! Environment-driven configuration, parsed once at startup and validated fail-fast.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::error::ConfigError;

/// Per-session Chrome launch options. `hash` is a stable-within-process content
/// hash of `profile`, used to match idle instances to incoming requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChromeOptions {
    pub profile: String,
    pub hash: String,
}

impl ChromeOptions {
    pub fn new(profile: impl Into<String>) -> Self {
        let profile = profile.into();
        let mut hasher = DefaultHasher::new();
        profile.hash(&mut hasher);
        Self {
            profile,
            hash: hasher.finish().to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChromePoolConfig {
    pub max_browser_instances: usize,
    pub min_browser_instances: usize,
    pub enable_auto_assign_debug_port: bool,
    pub debug_ports: Vec<u16>,
}

#[derive(Clone, Debug)]
pub struct ChromeConfig {
    pub enable_browser_reuse: bool,
    pub headless: bool,
    pub enable_custom_chrome_profiles: bool,
    pub enable_browser_auto_shutdown: bool,
    pub browser_auto_shutdown_timeout: Duration,
    pub browser_auto_idle_timeout: Duration,
    pub default_options: ChromeOptions,
}

#[derive(Clone, Debug)]
pub struct ProxyQueueConfig {
    pub throughput_scale_up_threshold: f64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub access_token: String,
    pub access_token_validation_enabled: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LoggerConfig {
    pub log_level: String,
    pub log_output: Option<String>,
}

/// Sink addresses carried for parity with the source's remote-metrics design;
/// this service only ever drives the in-memory facade (see `crate::metrics`).
#[derive(Clone, Debug, Default)]
pub struct MetricsSinkConfig {
    pub statsite_sink: Option<String>,
    pub statsd_sink: Option<String>,
    pub datadog_host: Option<String>,
    pub datadog_address: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub chrome_pool: ChromePoolConfig,
    pub chrome: ChromeConfig,
    pub logger: LoggerConfig,
    pub server: ServerConfig,
    pub proxy_queue: ProxyQueueConfig,
    pub metrics_sinks: MetricsSinkConfig,
}

impl Config {
    /// Parse and validate configuration from the process environment. Called
    /// exactly once, before any subsystem is constructed, so a bad deploy
    /// fails before a single browser is spawned.
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_browser_instances = int_env("MAX_BROWSER_INSTANCES", 10)?;
        let min_browser_instances = int_env("MIN_BROWSER_INSTANCES", 0)?;
        let enable_auto_assign_debug_port = bool_env("ENABLE_AUTO_ASSIGN_DEBUG_PORT", true)?;
        let debug_ports = int_list_env("CHROME_DEBUG_PORTS")?;

        let chrome_pool = ChromePoolConfig {
            max_browser_instances,
            min_browser_instances,
            enable_auto_assign_debug_port,
            debug_ports,
        };

        let default_profile = string_env("DEFAULT_CHROME_PROFILE", "");
        let chrome = ChromeConfig {
            enable_browser_reuse: bool_env("ENABLE_BROWSER_REUSE", false)?,
            headless: bool_env("CHROME_HEADLESS", true)?,
            enable_custom_chrome_profiles: bool_env("CHROME_ENABLE_CUSTOM_PROFILES", false)?,
            enable_browser_auto_shutdown: bool_env("CHROME_ENABLE_BROWSER_AUTO_SHUTDOWN", true)?,
            browser_auto_shutdown_timeout: Duration::from_secs(int_env(
                "CHROME_BROWSER_AUTO_SHUTDOWN_TIMEOUT_IN_SECS",
                30,
            )? as u64),
            browser_auto_idle_timeout: Duration::from_secs(int_env(
                "CHROME_BROWSER_AUTO_IDLE_TIMEOUT_IN_SECS",
                30,
            )? as u64),
            default_options: ChromeOptions::new(default_profile),
        };

        let proxy_queue = ProxyQueueConfig {
            throughput_scale_up_threshold: float_env("THROUGHPUT_SCALE_UP_THRESHOLD", 0.6)?,
        };

        let server = ServerConfig {
            port: int_env("SERVER_PORT", 3000)? as u16,
            access_token: string_env("SERVER_ACCESS_TOKEN", ""),
            access_token_validation_enabled: bool_env(
                "SERVER_ACCESS_TOKEN_VALIDATION_ENABLED",
                false,
            )?,
        };

        let logger = LoggerConfig {
            log_level: string_env("LOG_LEVEL", "info"),
            log_output: std::env::var("LOG_OUTPUT").ok().filter(|s| !s.is_empty()),
        };

        let metrics_sinks = MetricsSinkConfig {
            statsite_sink: std::env::var("STATSITE_SINK").ok().filter(|s| !s.is_empty()),
            statsd_sink: std::env::var("STATSD_SINK").ok().filter(|s| !s.is_empty()),
            datadog_host: std::env::var("DATADOG_HOST").ok().filter(|s| !s.is_empty()),
            datadog_address: std::env::var("DATADOG_ADDRESS").ok().filter(|s| !s.is_empty()),
        };

        let config = Self {
            chrome_pool,
            chrome,
            logger,
            server,
            proxy_queue,
            metrics_sinks,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut errs = Vec::new();

        if !self.chrome_pool.enable_auto_assign_debug_port {
            if self.chrome_pool.debug_ports.is_empty() {
                errs.push(
                    "CHROME_DEBUG_PORTS is required when ENABLE_AUTO_ASSIGN_DEBUG_PORT is disabled"
                        .to_string(),
                );
            } else if self.chrome_pool.debug_ports.len() < self.chrome_pool.max_browser_instances {
                errs.push(format!(
                    "CHROME_DEBUG_PORTS must contain at least MAX_BROWSER_INSTANCES ({}) ports when ENABLE_AUTO_ASSIGN_DEBUG_PORT is disabled",
                    self.chrome_pool.max_browser_instances
                ));
            }
        }

        if self.chrome_pool.max_browser_instances == 0 {
            errs.push("MAX_BROWSER_INSTANCES must be greater than or equal to 1".to_string());
        }

        if self.server.access_token_validation_enabled && self.server.access_token.is_empty() {
            errs.push(
                "SERVER_ACCESS_TOKEN is required when SERVER_ACCESS_TOKEN_VALIDATION_ENABLED is enabled"
                    .to_string(),
            );
        }

        if !(self.proxy_queue.throughput_scale_up_threshold > 0.0
            && self.proxy_queue.throughput_scale_up_threshold <= 1.0)
        {
            errs.push("THROUGHPUT_SCALE_UP_THRESHOLD must be in (0.0, 1.0]".to_string());
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errs.join("; ")))
        }
    }
}

fn string_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<bool>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v)),
        Err(_) => Ok(default),
    }
}

fn int_env(key: &str, default: i64) -> Result<usize, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<usize>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v)),
        Err(_) => Ok(default as usize),
    }
}

fn float_env(key: &str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<f64>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v)),
        Err(_) => Ok(default),
    }
}

fn int_list_env(key: &str) -> Result<Vec<u16>, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .map(|s| {
                s.trim()
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string(), v.clone()))
            })
            .collect(),
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "MAX_BROWSER_INSTANCES",
            "MIN_BROWSER_INSTANCES",
            "ENABLE_AUTO_ASSIGN_DEBUG_PORT",
            "CHROME_DEBUG_PORTS",
            "SERVER_ACCESS_TOKEN",
            "SERVER_ACCESS_TOKEN_VALIDATION_ENABLED",
            "THROUGHPUT_SCALE_UP_THRESHOLD",
            "ENABLE_BROWSER_REUSE",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_validate_successfully() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let config = Config::from_env().expect("default config should validate");
        assert_eq!(config.chrome_pool.max_browser_instances, 10);
        assert_eq!(config.chrome_pool.min_browser_instances, 0);
        assert!(config.chrome_pool.enable_auto_assign_debug_port);
    }

    #[test]
    fn rejects_manual_ports_with_too_few_entries() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("ENABLE_AUTO_ASSIGN_DEBUG_PORT", "false");
        std::env::set_var("MAX_BROWSER_INSTANCES", "3");
        std::env::set_var("CHROME_DEBUG_PORTS", "9001,9002");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        clear_all();
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("THROUGHPUT_SCALE_UP_THRESHOLD", "1.5");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        clear_all();
    }

    #[test]
    fn rejects_non_numeric_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("MAX_BROWSER_INSTANCES", "not-a-number");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_, _)));
        clear_all();
    }

    #[test]
    fn rejects_non_boolean_flag_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("ENABLE_BROWSER_REUSE", "maybe");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_, _)));
        clear_all();
    }

    #[test]
    fn options_hash_is_stable_and_profile_sensitive() {
        let a = ChromeOptions::new("work");
        let b = ChromeOptions::new("work");
        let c = ChromeOptions::new("personal");
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }
}
