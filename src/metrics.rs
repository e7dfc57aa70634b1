//! In-memory counter/gauge/sample facade. Deliberately not Prometheus — this
//! service tracks exactly three signals and a tiny running-mean accumulator
//! is all the throughput autoscaler needs.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Running count plus mean of the last period's samples, enough to answer
/// "what was the last aggregate" the way the throughput ticker needs.
#[derive(Default)]
struct SampleWindow {
    samples: Vec<f64>,
}

impl SampleWindow {
    fn push(&mut self, value: f64) {
        self.samples.push(value);
    }

    fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }
}

pub struct Metrics {
    proxy_queue: AtomicI64,
    chrome_instances: AtomicU64,
    proxy_time_secs: Mutex<SampleWindow>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            proxy_queue: AtomicI64::new(0),
            chrome_instances: AtomicU64::new(0),
            proxy_time_secs: Mutex::new(SampleWindow::default()),
        }
    }

    pub fn incr_queue(&self) {
        self.proxy_queue.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_queue(&self) {
        self.proxy_queue.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn queue_count(&self) -> i64 {
        self.proxy_queue.load(Ordering::SeqCst)
    }

    pub fn set_chrome_instances(&self, count: usize) {
        self.chrome_instances.store(count as u64, Ordering::SeqCst);
    }

    pub fn chrome_instances(&self) -> u64 {
        self.chrome_instances.load(Ordering::SeqCst)
    }

    pub fn record_proxy_time_secs(&self, secs: f64) {
        self.proxy_time_secs.lock().unwrap().push(secs);
    }

    /// Mean proxy session duration across all samples recorded so far, or
    /// `None` if no session has completed yet (the throughput ticker falls
    /// back to a 25-second default in that case).
    pub fn mean_proxy_time_secs(&self) -> Option<f64> {
        self.proxy_time_secs.lock().unwrap().mean()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
