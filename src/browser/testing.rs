//! In-process browser launcher stand-ins, swapped in via
//! [`super::BrowserPool::new_with_launcher`] so pool and queue lifecycle
//! tests don't need a real Chrome binary.

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{ChromeConfig, ChromeOptions};
use crate::error::InstanceError;

use super::instance::{BrowserLauncher, LaunchedBrowser};

/// Launches instantly with a synthetic debug URL and no backing process.
pub struct FakeLauncher {
    debug_url: Option<String>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self { debug_url: None }
    }

    /// Every launched instance reports this exact debug URL — e.g. a local
    /// websocket echo server standing in for a browser's debugger endpoint.
    pub fn with_fixed_debug_url(url: impl Into<String>) -> Self {
        Self {
            debug_url: Some(url.into()),
        }
    }
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(
        &self,
        _port: u16,
        _chrome_config: &ChromeConfig,
        _options: &ChromeOptions,
        _profile_dir: Option<String>,
    ) -> Result<LaunchedBrowser, InstanceError> {
        let browser_id = Uuid::new_v4();
        let debug_url = self
            .debug_url
            .clone()
            .unwrap_or_else(|| format!("ws://fake-browser.test/devtools/browser/{browser_id}"));
        Ok(LaunchedBrowser {
            debug_url,
            browser_id,
            browser: None,
            handler_task: None,
        })
    }
}
