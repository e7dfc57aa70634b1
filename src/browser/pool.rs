//! The managed set of browser instances: admission (serialized under the
//! same write lock as the spawn itself), reuse-by-options-hash, and the
//! event reconciler that tears down or warms instances per policy.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock, RwLockWriteGuard};
use uuid::Uuid;

use crate::config::{ChromeConfig, ChromeOptions, ChromePoolConfig};
use crate::error::PoolError;
use crate::port_pool::PortPool;

use super::instance::{BrowserInstance, BrowserLauncher, ChromiumoxideLauncher};

#[derive(Debug, Clone, Copy)]
pub enum PoolEvent {
    /// The instance's session ended with reuse disabled, or its first page
    /// target was destroyed out from under it.
    BrowserDestroyed { browser_id: Uuid },
    /// The instance sat idle past the auto-shutdown timeout with auto-shutdown
    /// enabled.
    BrowserIdle { browser_id: Uuid },
}

struct Instances {
    entries: Vec<Arc<BrowserInstance>>,
}

pub struct BrowserPool {
    instances: Arc<RwLock<Instances>>,
    ports: Arc<tokio::sync::Mutex<PortPool>>,
    pool_config: ChromePoolConfig,
    chrome_config: ChromeConfig,
    event_tx: mpsc::UnboundedSender<PoolEvent>,
    reconciler: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    launcher: Arc<dyn BrowserLauncher>,
}

impl BrowserPool {
    /// Construct the pool (using the real `chromiumoxide`-backed launcher)
    /// and start its event reconciler. Callers should follow with
    /// [`BrowserPool::warm`] before accepting traffic.
    pub fn new(pool_config: ChromePoolConfig, chrome_config: ChromeConfig) -> Arc<Self> {
        Self::new_with_launcher(pool_config, chrome_config, Arc::new(ChromiumoxideLauncher))
    }

    /// Construct the pool with an injected launcher — the seam pool/queue
    /// lifecycle tests use to avoid spawning a real Chrome subprocess.
    pub fn new_with_launcher(
        pool_config: ChromePoolConfig,
        chrome_config: ChromeConfig,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Arc<Self> {
        let ports = PortPool::new(
            pool_config.enable_auto_assign_debug_port,
            pool_config.debug_ports.clone(),
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            instances: Arc::new(RwLock::new(Instances { entries: Vec::new() })),
            ports: Arc::new(tokio::sync::Mutex::new(ports)),
            pool_config,
            chrome_config,
            event_tx,
            reconciler: std::sync::Mutex::new(None),
            launcher,
        });

        let handle = pool.clone().spawn_event_loop(event_rx);
        *pool.reconciler.lock().unwrap() = Some(handle);
        pool
    }

    fn spawn_event_loop(
        self: Arc<Self>,
        mut event_rx: mpsc::UnboundedReceiver<PoolEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                self.handle_event(event).await;
            }
        })
    }

    async fn handle_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::BrowserDestroyed { browser_id } => {
                self.teardown(browser_id).await;
                self.replace_if_below_min().await;
            }
            PoolEvent::BrowserIdle { browser_id } => {
                let keep_warm = self.should_keep_warm(browser_id).await;
                if keep_warm {
                    if let Some(instance) = self.find_by_id(browser_id).await {
                        instance.pause_ticker().await;
                        tracing::debug!(browser_id = %browser_id, "kept idle instance warm at floor");
                    }
                } else {
                    self.teardown(browser_id).await;
                    self.replace_if_below_min().await;
                }
            }
        }
    }

    async fn should_keep_warm(&self, browser_id: Uuid) -> bool {
        let instances = self.instances.read().await;
        let Some(instance) = instances.entries.iter().find(|i| i.browser_id == browser_id) else {
            return false;
        };
        let at_floor = instances.entries.len() == self.pool_config.min_browser_instances;
        let matches_default = instance.options.hash == self.chrome_config.default_options.hash;
        drop(instances);
        at_floor && matches_default && instance.is_new().await
    }

    async fn find_by_id(&self, browser_id: Uuid) -> Option<Arc<BrowserInstance>> {
        self.instances
            .read()
            .await
            .entries
            .iter()
            .find(|i| i.browser_id == browser_id)
            .cloned()
    }

    async fn replace_if_below_min(&self) {
        if self.len().await < self.pool_config.min_browser_instances {
            if let Err(e) = self
                .create_new_instance(self.chrome_config.default_options.clone())
                .await
            {
                tracing::error!(error = %e, "failed to create replacement instance below floor");
            }
        }
    }

    /// Pre-spawn the configured floor of idle instances using the default profile.
    pub async fn warm(&self) -> Result<(), PoolError> {
        for _ in 0..self.pool_config.min_browser_instances {
            self.create_new_instance(self.chrome_config.default_options.clone())
                .await?;
        }
        Ok(())
    }

    /// Create and start one instance with the given options. Fails if the
    /// pool is at capacity or no port is available.
    pub async fn create_new_instance(
        &self,
        options: ChromeOptions,
    ) -> Result<Arc<BrowserInstance>, PoolError> {
        let mut instances = self.instances.write().await;
        if instances.entries.len() >= self.pool_config.max_browser_instances {
            return Err(PoolError::AtCapacity);
        }
        self.spawn_instance_locked(&mut instances, options, None).await
    }

    async fn spawn_instance_locked(
        &self,
        instances: &mut RwLockWriteGuard<'_, Instances>,
        options: ChromeOptions,
        profile_dir: Option<String>,
    ) -> Result<Arc<BrowserInstance>, PoolError> {
        let port = self.ports.lock().await.acquire().await?;
        let instance = BrowserInstance::start(
            port,
            None,
            options,
            self.chrome_config.clone(),
            profile_dir,
            self.event_tx.clone(),
            self.launcher.as_ref(),
        )
        .await
        .map_err(PoolError::Instance)?;
        let instance = Arc::new(instance);
        instances.entries.push(instance.clone());
        Ok(instance)
    }

    /// Admission, held under the write lock for its entire duration —
    /// including a possible subprocess spawn — so capacity and port
    /// accounting can never race against a concurrent admission.
    ///
    /// (a) empty pool → create; (b) an idle instance with a matching hash →
    /// bind it; (c) a non-default hash with room → create one for it;
    /// (d) otherwise → `NoneAvailable`.
    pub async fn get_available_chrome(
        &self,
        session_id: Uuid,
        options: ChromeOptions,
        profile_dir: Option<String>,
    ) -> Result<Arc<BrowserInstance>, PoolError> {
        let mut instances = self.instances.write().await;

        if instances.entries.is_empty() {
            let instance = self
                .spawn_instance_locked(&mut instances, options, profile_dir)
                .await?;
            instance.set_not_idle(session_id).await;
            return Ok(instance);
        }

        for instance in instances.entries.clone() {
            if instance.options.hash == options.hash && instance.is_idle().await {
                instance.set_not_idle(session_id).await;
                return Ok(instance);
            }
        }

        if options.hash != self.chrome_config.default_options.hash {
            if instances.entries.len() >= self.pool_config.max_browser_instances {
                return Err(PoolError::AtCapacity);
            }
            let instance = self
                .spawn_instance_locked(&mut instances, options, profile_dir)
                .await?;
            instance.set_not_idle(session_id).await;
            return Ok(instance);
        }

        Err(PoolError::NoneAvailable)
    }

    pub async fn has_idle_chrome_instance(&self) -> bool {
        let instances = self.instances.read().await;
        for instance in &instances.entries {
            if instance.is_idle().await {
                return true;
            }
        }
        false
    }

    pub async fn is_at_capacity(&self) -> bool {
        self.instances.read().await.entries.len() >= self.pool_config.max_browser_instances
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.entries.len()
    }

    async fn teardown(&self, browser_id: Uuid) {
        let removed = {
            let mut instances = self.instances.write().await;
            instances
                .entries
                .iter()
                .position(|i| i.browser_id == browser_id)
                .map(|pos| instances.entries.remove(pos))
        };

        if let Some(instance) = removed {
            instance.stop().await;
            self.ports.lock().await.release(instance.port);
            tracing::info!(browser_id = %browser_id, "tore down chrome instance");
        }
    }

    /// Tears down every instance, then stops the event reconciler.
    pub async fn shutdown(&self) {
        let drained = std::mem::take(&mut self.instances.write().await.entries);
        for instance in drained {
            instance.stop().await;
        }
        if let Some(handle) = self.reconciler.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::testing::FakeLauncher;

    fn test_pool(max: usize, min: usize, reuse: bool) -> Arc<BrowserPool> {
        BrowserPool::new_with_launcher(
            test_pool_config(max, min),
            test_chrome_config(reuse),
            Arc::new(FakeLauncher::new()),
        )
    }

    fn test_pool_config(max: usize, min: usize) -> ChromePoolConfig {
        ChromePoolConfig {
            max_browser_instances: max,
            min_browser_instances: min,
            enable_auto_assign_debug_port: true,
            debug_ports: Vec::new(),
        }
    }

    fn test_chrome_config(reuse: bool) -> ChromeConfig {
        ChromeConfig {
            enable_browser_reuse: reuse,
            headless: true,
            enable_custom_chrome_profiles: false,
            enable_browser_auto_shutdown: true,
            browser_auto_shutdown_timeout: std::time::Duration::from_secs(30),
            browser_auto_idle_timeout: std::time::Duration::from_secs(30),
            default_options: ChromeOptions::new(""),
        }
    }

    #[tokio::test]
    async fn empty_pool_reports_zero_len_and_not_at_capacity() {
        let pool = test_pool(2, 0, true);
        assert_eq!(pool.len().await, 0);
        assert!(!pool.is_at_capacity().await);
        assert!(!pool.has_idle_chrome_instance().await);
    }

    #[tokio::test]
    async fn shutdown_on_empty_pool_stops_reconciler() {
        let pool = test_pool(1, 0, true);
        pool.shutdown().await;
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn warm_prespawns_min_instances() {
        let pool = test_pool(2, 1, true);
        pool.warm().await.unwrap();
        assert_eq!(pool.len().await, 1);
        assert!(pool.has_idle_chrome_instance().await);
    }

    #[tokio::test]
    async fn get_available_chrome_binds_idle_instance_by_matching_hash() {
        let pool = test_pool(2, 1, true);
        pool.warm().await.unwrap();
        let options = ChromeOptions::new("");
        let instance = pool
            .get_available_chrome(Uuid::new_v4(), options, None)
            .await
            .unwrap();
        assert!(!instance.is_idle().await);
        // still only the one warmed instance, now bound
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn get_available_chrome_returns_none_available_at_floor_capacity() {
        let pool = test_pool(1, 1, true);
        pool.warm().await.unwrap();
        let default_options = ChromeOptions::new("");
        pool.get_available_chrome(Uuid::new_v4(), default_options.clone(), None)
            .await
            .unwrap();
        let err = pool
            .get_available_chrome(Uuid::new_v4(), default_options, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NoneAvailable));
    }

    #[tokio::test]
    async fn distinct_profile_hash_creates_a_second_instance_under_capacity() {
        let pool = test_pool(2, 1, true);
        pool.warm().await.unwrap();
        let distinct = ChromeOptions::new("work");
        let instance = pool
            .get_available_chrome(Uuid::new_v4(), distinct.clone(), None)
            .await
            .unwrap();
        assert_eq!(instance.options.hash, distinct.hash);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn teardown_releases_port_and_replaces_below_floor() {
        let pool = test_pool(1, 1, true);
        pool.warm().await.unwrap();
        let browser_id = {
            let instances = pool.instances.read().await;
            instances.entries[0].browser_id
        };
        pool.teardown(browser_id).await;
        pool.replace_if_below_min().await;
        assert_eq!(pool.len().await, 1);
    }
}
