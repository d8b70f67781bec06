//! Mock backend that simulates inference with scriptable failures

use async_trait::async_trait;
use mesh_core::{
    BackendKind, BackendPlugin, BatchInput, BatchOutput, Error, HealthStatus, ItemOutput,
    ModelDescriptor, Result,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Mock backend behavior
#[derive(Debug, Clone)]
pub struct MockBackendConfig {
    /// Simulated latency of every predict call (milliseconds)
    pub latency_ms: u64,

    /// Simulated latency of load (milliseconds)
    pub load_latency_ms: u64,

    /// Probability of a random per-item failure (0.0 to 1.0)
    pub failure_rate: f64,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            load_latency_ms: 0,
            failure_rate: 0.0,
        }
    }
}

/// Echoes its input after a configurable delay. Cloning shares the script,
/// so a test can keep a handle to the instance the engine is using.
#[derive(Debug, Clone)]
pub struct MockBackend {
    inner: Arc<MockBackendInner>,
}

#[derive(Debug)]
struct MockBackendInner {
    config: Mutex<MockBackendConfig>,
    loaded: AtomicBool,
    healthy: AtomicBool,
    fail_load: Mutex<Option<String>>,
    /// Item indexes that fail on every call
    failing_items: Mutex<HashSet<usize>>,
    /// Number of upcoming calls that fail as a whole
    failing_calls: AtomicU32,
    calls: AtomicU64,
    batch_sizes: Mutex<Vec<usize>>,
    inputs: Mutex<Vec<BatchInput>>,
}

impl MockBackend {
    /// Create a new mock backend
    pub fn new(config: MockBackendConfig) -> Self {
        let inner = MockBackendInner {
            config: Mutex::new(config),
            loaded: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            fail_load: Mutex::new(None),
            failing_items: Mutex::new(HashSet::new()),
            failing_calls: AtomicU32::new(0),
            calls: AtomicU64::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(MockBackendConfig::default())
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner.config.lock().latency_ms = latency.as_millis() as u64;
    }

    /// Fail the item at `index` (0-based) on every call
    pub fn fail_item(&self, index: usize) {
        self.inner.failing_items.lock().insert(index);
    }

    pub fn clear_item_failures(&self) {
        self.inner.failing_items.lock().clear();
    }

    /// Fail the next `count` predict calls as a whole
    pub fn fail_next_calls(&self, count: u32) {
        self.inner.failing_calls.store(count, Ordering::SeqCst);
    }

    pub fn fail_load(&self, reason: impl Into<String>) {
        *self.inner.fail_load.lock() = Some(reason.into());
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::SeqCst)
    }

    /// Number of predict calls received, including failed ones
    pub fn call_count(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Sizes of the batches received, in call order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.batch_sizes.lock().clone()
    }

    /// Inputs received, in call order
    pub fn inputs(&self) -> Vec<BatchInput> {
        self.inner.inputs.lock().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new_default()
    }
}

#[async_trait]
impl BackendPlugin for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<()> {
        let delay = self.inner.config.lock().load_latency_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(reason) = self.inner.fail_load.lock().clone() {
            warn!("Mock load failure for {}: {}", descriptor.name, reason);
            return Err(Error::internal(reason));
        }
        self.inner.loaded.store(true, Ordering::SeqCst);
        debug!("Mock backend loaded {}", descriptor.name);
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        self.inner.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn predict(&self, input: BatchInput) -> Result<BatchOutput> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.batch_sizes.lock().push(input.len());
        self.inner.inputs.lock().push(input.clone());

        let (latency_ms, failure_rate) = {
            let config = self.inner.config.lock();
            (config.latency_ms, config.failure_rate)
        };
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }

        let remaining = self.inner.failing_calls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.failing_calls.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::plugin_call_failed("mock backend call failure"));
        }

        let failing = self.inner.failing_items.lock().clone();
        let mut rng = rand::thread_rng();
        let items: Vec<ItemOutput> = input
            .items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                if failing.contains(&index) {
                    Err(format!("mock failure for item {}", index))
                } else if failure_rate > 0.0 && rng.gen_bool(failure_rate.min(1.0)) {
                    Err(format!("random mock failure for item {}", index))
                } else {
                    Ok(item)
                }
            })
            .collect();

        Ok(BatchOutput { items })
    }

    async fn health_check(&self) -> HealthStatus {
        if !self.inner.healthy.load(Ordering::SeqCst) {
            HealthStatus::Unhealthy("mock backend marked unhealthy".to_string())
        } else if self.is_loaded() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Starting
        }
    }
}
