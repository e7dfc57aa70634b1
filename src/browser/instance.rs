//! One managed browser subprocess: state machine, idle/shutdown ticker, and
//! the CDP event listener that feeds the pool's reconciler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::target::EventTargetDestroyed;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::config::{ChromeConfig, ChromeOptions};
use crate::error::InstanceError;

use super::pool::PoolEvent;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("static uuid pattern is valid")
});

const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// What a successful launch hands back to `BrowserInstance::start`: a debug
/// URL and id, and optionally a real `Browser` handle (absent in tests that
/// inject a fake launcher with no process behind it).
pub struct LaunchedBrowser {
    pub debug_url: String,
    pub browser_id: Uuid,
    pub browser: Option<Browser>,
    pub handler_task: Option<tokio::task::JoinHandle<()>>,
}

/// Spawns (or stands in for) one browser subprocess. The production impl is
/// [`ChromiumoxideLauncher`]; tests substitute [`super::testing::FakeLauncher`]
/// so pool/queue lifecycle scenarios don't need a real Chrome binary.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(
        &self,
        port: u16,
        chrome_config: &ChromeConfig,
        options: &ChromeOptions,
        profile_dir: Option<String>,
    ) -> Result<LaunchedBrowser, InstanceError>;
}

/// Launches a real headless Chrome subprocess via `chromiumoxide` and probes
/// its `/json/version` endpoint for the debugger URL and browser id.
pub struct ChromiumoxideLauncher;

#[async_trait]
impl BrowserLauncher for ChromiumoxideLauncher {
    async fn launch(
        &self,
        port: u16,
        chrome_config: &ChromeConfig,
        options: &ChromeOptions,
        profile_dir: Option<String>,
    ) -> Result<LaunchedBrowser, InstanceError> {
        let mut builder = BrowserConfig::builder()
            .arg(format!("--remote-debugging-port={port}"))
            .arg("--disable-extensions");

        if !chrome_config.headless {
            builder = builder.arg("--headless=false");
        }

        if chrome_config.enable_custom_chrome_profiles && !options.profile.is_empty() {
            if let Some(profile_directory) = profile_dir {
                builder = builder
                    .arg(format!("--user-data-dir={}", crate::profile::PROFILES_DIR))
                    .arg(format!("--profile-directory={profile_directory}"));
            }
        }

        let browser_config = builder
            .build()
            .map_err(|e| InstanceError::Spawn(e.to_string()))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| InstanceError::Spawn(e.to_string()))?;

        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let (debug_url, browser_id) = fetch_meta(port).await?;

        Ok(LaunchedBrowser {
            debug_url,
            browser_id,
            browser: Some(browser),
            handler_task: Some(handler_task),
        })
    }
}

/// Mutable fields that the ticker task and the owning pool both touch.
/// Guarded by a single mutex scoped to this instance only — the pool's own
/// read/write lock protects collection membership, not per-instance state.
struct MutableState {
    session_id: Option<Uuid>,
    is_idle: bool,
    is_new: bool,
    last_event_ts: Instant,
    paused: bool,
}

pub struct BrowserInstance {
    pub browser_id: Uuid,
    pub debug_url: String,
    pub port: u16,
    pub options: ChromeOptions,
    state: Arc<Mutex<MutableState>>,
    idle_message_logged: Arc<AtomicBool>,
    event_sender: mpsc::UnboundedSender<PoolEvent>,
    chrome_config: ChromeConfig,
    browser: Mutex<Option<Browser>>,
    handler_task: Option<tokio::task::JoinHandle<()>>,
    listener_task: Option<tokio::task::JoinHandle<()>>,
    ticker_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for BrowserInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserInstance")
            .field("browser_id", &self.browser_id)
            .field("port", &self.port)
            .field("options", &self.options)
            .finish()
    }
}

impl BrowserInstance {
    /// Launch the browser (via `launcher`), register its event listener when
    /// a real browser handle is present, and start the idle ticker.
    pub async fn start(
        port: u16,
        session_id: Option<Uuid>,
        options: ChromeOptions,
        chrome_config: ChromeConfig,
        profile_dir: Option<String>,
        event_sender: mpsc::UnboundedSender<PoolEvent>,
        launcher: &dyn BrowserLauncher,
    ) -> Result<Self, InstanceError> {
        let launched = launcher
            .launch(port, &chrome_config, &options, profile_dir)
            .await?;

        let state = Arc::new(Mutex::new(MutableState {
            session_id,
            is_idle: true,
            is_new: true,
            last_event_ts: Instant::now(),
            paused: true,
        }));

        let listener_task = match launched.browser.as_ref() {
            Some(browser) => {
                let pages = browser
                    .pages()
                    .await
                    .map_err(|_| InstanceError::NoTargets)?;
                let first_page_target_id = pages
                    .last()
                    .map(|p| p.target_id().clone())
                    .ok_or(InstanceError::NoTargets)?;

                let mut target_destroyed = browser
                    .event_listener::<EventTargetDestroyed>()
                    .await
                    .map_err(|e| InstanceError::VersionProbe(e.to_string()))?;
                let listener_sender = event_sender.clone();
                let listener_state = state.clone();
                let watched_target = first_page_target_id;
                let listener_browser_id = launched.browser_id;
                Some(tokio::spawn(async move {
                    while let Some(event) = target_destroyed.next().await {
                        if event.target_id == watched_target {
                            let _ = listener_sender.send(PoolEvent::BrowserDestroyed {
                                browser_id: listener_browser_id,
                            });
                            break;
                        } else {
                            listener_state.lock().await.last_event_ts = Instant::now();
                        }
                    }
                }))
            }
            None => None,
        };

        let instance = Self {
            browser_id: launched.browser_id,
            debug_url: launched.debug_url,
            port,
            options,
            state,
            idle_message_logged: Arc::new(AtomicBool::new(false)),
            event_sender,
            chrome_config,
            browser: Mutex::new(launched.browser),
            handler_task: launched.handler_task,
            listener_task,
            ticker_stop: Mutex::new(None),
        };

        instance.start_ticker().await;
        tracing::debug!(browser_id = %instance.browser_id, "started chrome instance");
        Ok(instance)
    }

    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.is_idle
    }

    pub async fn is_new(&self) -> bool {
        self.state.lock().await.is_new
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        self.state.lock().await.session_id
    }

    /// Idle -> Busy. Latches `is_new = false` forever on the first call.
    pub async fn set_not_idle(&self, session_id: Uuid) {
        let mut state = self.state.lock().await;
        state.is_idle = false;
        state.session_id = Some(session_id);
        state.is_new = false;
    }

    /// Returns the instance to Idle (reuse enabled) or clears its session and
    /// emits `BrowserDestroyed` (reuse disabled).
    pub async fn set_idle_or_stop(&self) {
        let mut state = self.state.lock().await;
        if self.chrome_config.enable_browser_reuse {
            state.is_idle = true;
            state.session_id = None;
            tracing::info!(browser_id = %self.browser_id, "set chrome instance to idle for reuse");
        } else if state.session_id.is_some() {
            state.session_id = None;
            let _ = self.event_sender.send(PoolEvent::BrowserDestroyed {
                browser_id: self.browser_id,
            });
        }
    }

    pub async fn start_ticker(&self) {
        let mut stop_guard = self.ticker_stop.lock().await;
        let mut state = self.state.lock().await;
        if !state.paused {
            return;
        }
        state.paused = false;
        state.last_event_ts = Instant::now();
        drop(state);

        let (stop_tx, mut stop_rx) = oneshot::channel();
        *stop_guard = Some(stop_tx);

        let state = self.state.clone();
        let event_sender = self.event_sender.clone();
        let browser_id = self.browser_id;
        let chrome_config = self.chrome_config.clone();
        let idle_message_logged = self.idle_message_logged.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tick(&state, &event_sender, browser_id, &chrome_config, &idle_message_logged).await;
                    }
                    _ = &mut stop_rx => {
                        break;
                    }
                }
            }
        });
    }

    pub async fn pause_ticker(&self) {
        let mut stop_guard = self.ticker_stop.lock().await;
        let mut state = self.state.lock().await;
        if state.paused {
            return;
        }
        state.paused = true;
        if let Some(stop) = stop_guard.take() {
            let _ = stop.send(());
        }
    }

    /// Idempotent: pauses the ticker and closes the browser, tolerating a
    /// second call once the browser handle has already been taken.
    pub async fn stop(&self) {
        self.pause_ticker().await;
        if let Some(handle) = self.handler_task.as_ref() {
            handle.abort();
        }
        if let Some(handle) = self.listener_task.as_ref() {
            handle.abort();
        }
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            if let Err(e) = browser.close().await {
                tracing::warn!(browser_id = %self.browser_id, error = %e, "error closing browser during stop");
            }
        }
    }
}

async fn tick(
    state: &Arc<Mutex<MutableState>>,
    event_sender: &mpsc::UnboundedSender<PoolEvent>,
    browser_id: Uuid,
    chrome_config: &ChromeConfig,
    idle_message_logged: &AtomicBool,
) {
    let now = Instant::now();
    let (is_busy, idle_elapsed, shutdown_elapsed) = {
        let state = state.lock().await;
        (
            !state.is_idle,
            now.duration_since(state.last_event_ts) >= chrome_config.browser_auto_idle_timeout,
            now.duration_since(state.last_event_ts) >= chrome_config.browser_auto_shutdown_timeout,
        )
    };

    if idle_elapsed && is_busy {
        tracing::debug!(browser_id = %browser_id, "browser idle timeout reached, setting idle");
        let mut state = state.lock().await;
        if chrome_config.enable_browser_reuse {
            state.is_idle = true;
            state.session_id = None;
        } else if state.session_id.is_some() {
            state.session_id = None;
            drop(state);
            let _ = event_sender.send(PoolEvent::BrowserDestroyed { browser_id });
        }
        return;
    }

    if shutdown_elapsed {
        if chrome_config.enable_browser_auto_shutdown {
            tracing::debug!(browser_id = %browser_id, "browser idle past shutdown timeout");
            let _ = event_sender.send(PoolEvent::BrowserIdle { browser_id });
        } else if !idle_message_logged.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                browser_id = %browser_id,
                "browser idle past shutdown timeout; consider enabling auto-shutdown"
            );
        }
    }
}

async fn fetch_meta(port: u16) -> Result<(String, Uuid), InstanceError> {
    let url = format!("http://localhost:{port}/json/version");
    let resp: serde_json::Value = reqwest::get(&url)
        .await
        .map_err(|e| InstanceError::VersionProbe(e.to_string()))?
        .json()
        .await
        .map_err(|e| InstanceError::VersionProbe(e.to_string()))?;

    let debug_url = resp
        .get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .ok_or(InstanceError::MissingBrowserId)?
        .to_string();

    let browser_id = UUID_RE
        .find(&debug_url)
        .and_then(|m| Uuid::parse_str(m.as_str()).ok())
        .ok_or(InstanceError::MissingBrowserId)?;

    Ok((debug_url, browser_id))
}
