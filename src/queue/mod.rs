//! FIFO admission queue: a dispatch ticker that grants pool instances to
//! waiting sessions, and a throughput ticker that scales the pool up when
//! demand outpaces it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::browser::{BrowserInstance, BrowserPool};
use crate::config::{ChromeOptions, ProxyQueueConfig};
use crate::error::{PoolError, QueueError};
use crate::metrics::Metrics;

const DISPATCH_INTERVAL: Duration = Duration::from_millis(250);
const THROUGHPUT_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_MEAN_PROXY_SECS: f64 = 25.0;

/// Outcome signalled on a queue element's result channel. `UnableToGetChrome`
/// is never signalled — it triggers the near-head retry instead (see
/// [`ProxyQueue`]'s dispatch tick).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyResult {
    Succeeded,
    ConnectionError,
    SessionTimedOut,
    Failed,
}

pub struct QueueElement {
    pub handle: Uuid,
    pub session_id: Uuid,
    pub options: ChromeOptions,
    pub profile_dir: Option<String>,
    /// Reserved for priority-weighted dispatch; never read by the dispatcher.
    #[allow(dead_code)]
    pub priority_modifier: Option<i32>,
    grant_tx: oneshot::Sender<Arc<BrowserInstance>>,
}

impl QueueElement {
    pub fn new(
        session_id: Uuid,
        options: ChromeOptions,
        profile_dir: Option<String>,
    ) -> (Self, oneshot::Receiver<Arc<BrowserInstance>>) {
        let (grant_tx, grant_rx) = oneshot::channel();
        let element = Self {
            handle: Uuid::new_v4(),
            session_id,
            options,
            profile_dir,
            priority_modifier: None,
            grant_tx,
        };
        (element, grant_rx)
    }
}

pub struct ProxyQueue {
    list: Mutex<VecDeque<QueueElement>>,
    pool: Arc<BrowserPool>,
    metrics: Arc<Metrics>,
    config: ProxyQueueConfig,
    default_options: ChromeOptions,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    stopped: AtomicBool,
}

impl ProxyQueue {
    pub fn new(
        pool: Arc<BrowserPool>,
        metrics: Arc<Metrics>,
        config: ProxyQueueConfig,
        default_options: ChromeOptions,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            list: Mutex::new(VecDeque::new()),
            pool,
            metrics,
            config,
            default_options,
            stop_tx: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        queue.clone().spawn_tickers();
        queue
    }

    fn spawn_tickers(self: Arc<Self>) {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.stop_tx.try_lock().expect("uncontended at startup") = Some(stop_tx);

        tokio::spawn(async move {
            let mut dispatch = tokio::time::interval(DISPATCH_INTERVAL);
            let mut throughput = tokio::time::interval(THROUGHPUT_INTERVAL);
            loop {
                tokio::select! {
                    _ = dispatch.tick() => self.clone().dispatch_tick(),
                    _ = throughput.tick() => self.clone().throughput_tick(),
                    _ = &mut stop_rx => break,
                }
            }
        });
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }

    /// Admit a session into the queue. Fails if the queue has already been
    /// stopped — otherwise the element would sit forever since no dispatch
    /// tick will ever run to pop it.
    pub async fn enqueue(
        &self,
        session_id: Uuid,
        options: ChromeOptions,
        profile_dir: Option<String>,
    ) -> Result<(Uuid, oneshot::Receiver<Arc<BrowserInstance>>), QueueError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        let (element, grant_rx) = QueueElement::new(session_id, options, profile_dir);
        let handle = element.handle;
        self.list.lock().await.push_back(element);
        self.metrics.incr_queue();
        Ok((handle, grant_rx))
    }

    /// Remove a still-queued element by handle, e.g. on client disconnect
    /// before dispatch. A no-op if it was already popped for dispatch.
    pub async fn dequeue(&self, handle: Uuid) {
        let mut list = self.list.lock().await;
        if let Some(pos) = list.iter().position(|e| e.handle == handle) {
            list.remove(pos);
            drop(list);
            self.metrics.decr_queue();
        }
    }

    fn dispatch_tick(self: Arc<Self>) {
        tokio::spawn(async move {
            let should_attempt = {
                let list = self.list.lock().await;
                !list.is_empty() && self.pool.has_idle_chrome_instance().await
            };
            if !should_attempt {
                return;
            }

            let popped = self.list.lock().await.pop_front();
            let Some(element) = popped else { return };

            if element.grant_tx.is_closed() {
                // client already disconnected before we got to it
                self.metrics.decr_queue();
                return;
            }

            match self
                .pool
                .get_available_chrome(
                    element.session_id,
                    element.options.clone(),
                    element.profile_dir.clone(),
                )
                .await
            {
                Ok(instance) => {
                    self.metrics.decr_queue();
                    if let Err(instance) = element.grant_tx.send(instance) {
                        // receiver gone: return the instance instead of leaking it
                        instance.set_idle_or_stop().await;
                    }
                }
                Err(PoolError::AtCapacity) | Err(PoolError::NoneAvailable) => {
                    self.reinsert_near_head(element).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "admission failed with a non-retryable error");
                    self.metrics.decr_queue();
                }
            }
        });
    }

    async fn reinsert_near_head(&self, element: QueueElement) {
        let mut list = self.list.lock().await;
        if list.is_empty() {
            list.push_front(element);
        } else {
            list.insert(1.min(list.len()), element);
        }
    }

    fn throughput_tick(self: Arc<Self>) {
        tokio::spawn(async move {
            if self.pool.is_at_capacity().await {
                return;
            }
            let queue_len = self.list.lock().await.len();
            if queue_len == 0 {
                return;
            }

            let pool_len = self.pool.len().await as f64;
            if pool_len == 0.0 {
                return;
            }

            let apt = self
                .metrics
                .mean_proxy_time_secs()
                .unwrap_or(DEFAULT_MEAN_PROXY_SECS);
            let qp = queue_len as f64 / pool_len;
            let tp = qp / apt;

            if tp <= self.config.throughput_scale_up_threshold {
                return;
            }

            tracing::info!(throughput = tp, "scaling up chrome pool");
            if let Err(e) = self
                .pool
                .create_new_instance(self.default_options.clone())
                .await
            {
                tracing::error!(error = %e, "error scaling up pool");
            }
        });
    }
}
