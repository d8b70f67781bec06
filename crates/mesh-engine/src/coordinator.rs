//! Execution coordinator
//!
//! Dispatches formed batches to the model's backend, retries whole-call
//! failures with exponential backoff and distributes per-item results back to
//! the originating requests. Each model gets its own executor task, so a slow
//! backend only delays its own batches.

use crate::registry::{HealthReport, ModelRegistry};
use crate::resources::ResourcePool;
use crate::scheduler::{padding, Scheduler};
use mesh_core::{
    Batch, BackendPlugin, BatchInput, BatchOutput, Error, ExecutionConfig, ModelId,
    RequestStatus, Result,
};
use mesh_metrics::EngineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, warn};

/// How a batch left the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Backend call succeeded; items may still have failed individually
    Completed,
    /// Backend call failed after all retries
    Failed,
    /// Device was not live; some or all requests went back to the queue
    Requeued,
}

/// Summary of one `execute` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub outcome: BatchOutcome,
    pub size: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub requeued: usize,
    pub attempts: u32,
}

impl ExecutionReport {
    fn new(outcome: BatchOutcome, size: usize) -> Self {
        Self {
            outcome,
            size,
            succeeded: 0,
            failed: 0,
            requeued: 0,
            attempts: 0,
        }
    }
}

/// Runs batches against backends
#[derive(Debug)]
pub struct ExecutionCoordinator {
    registry: Arc<ModelRegistry>,
    pool: Arc<ResourcePool>,
    scheduler: Arc<Scheduler>,
    config: ExecutionConfig,
    metrics: Arc<EngineMetrics>,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        pool: Arc<ResourcePool>,
        scheduler: Arc<Scheduler>,
        config: ExecutionConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            registry,
            pool,
            scheduler,
            config,
            metrics,
        }
    }

    /// Execute one batch and deliver every request's result
    pub async fn execute(
        &self,
        model_id: &ModelId,
        backend: &Arc<dyn BackendPlugin>,
        mut batch: Batch,
    ) -> ExecutionReport {
        let size = batch.len();
        let model = batch.model.clone();

        if let Err(e) = self.check_device(model_id) {
            return self.requeue_or_fail(batch, e);
        }

        for request in &batch.requests {
            // Cancelled requests stay in the batch; their results are discarded
            request
                .status
                .advance(RequestStatus::Batched, RequestStatus::Executing);
        }

        let _ = self.registry.begin_execution(model_id, size);
        let started = Instant::now();
        let input = BatchInput {
            model: model.clone(),
            items: batch.requests.iter().map(|r| r.payload.clone()).collect(),
            padded_len: batch.padding.as_ref().map(|p| p.padded_len),
        };

        let (result, attempts) = self.call_with_retry(backend, input, size).await;
        let elapsed = started.elapsed();
        self.metrics.observe_execution(&model, elapsed.as_secs_f64());

        let mut report = match result {
            Ok(output) => {
                let mut report = ExecutionReport::new(BatchOutcome::Completed, size);
                for (index, (request, item)) in
                    batch.requests.iter_mut().zip(output.items).enumerate()
                {
                    match item {
                        Ok(mut payload) => {
                            if let Some(padding) = &batch.padding {
                                padding::unpad_output(&mut payload, index, padding);
                            }
                            report.succeeded += 1;
                            if request.succeed(payload) {
                                self.metrics.record_request(&model, "success");
                            }
                        }
                        Err(message) => {
                            report.failed += 1;
                            self.metrics.record_error(&model, "plugin_execution");
                            if request.fail(Error::plugin_execution(message)) {
                                self.metrics.record_request(&model, "error");
                            }
                        }
                    }
                }
                self.report_health(model_id, HealthReport::execution(true));
                report
            }
            Err(e) => {
                error!(model = %model, size, attempts, error = %e, "Batch failed after retries");
                let item_error =
                    Error::plugin_execution(format!("batch failed after {} attempts: {}", attempts, e));
                for request in &mut batch.requests {
                    if request.fail(item_error.clone()) {
                        self.metrics.record_request(&model, "error");
                    }
                }
                self.metrics.record_error(&model, "plugin_execution");
                self.report_health(
                    model_id,
                    HealthReport::execution(false).with_detail(e.to_string()),
                );
                let mut report = ExecutionReport::new(BatchOutcome::Failed, size);
                report.failed = size;
                report
            }
        };
        report.attempts = attempts;

        let _ = self.registry.end_execution(model_id, size);
        if let Ok(entry) = self.registry.entry(model_id) {
            entry
                .stats()
                .record_batch(report.succeeded, report.failed, elapsed);
        }
        debug!(
            model = %model,
            size,
            succeeded = report.succeeded,
            failed = report.failed,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch executed"
        );
        report
    }

    /// The model must hold an allocation on a live device
    fn check_device(&self, model_id: &ModelId) -> Result<()> {
        let entry = self.registry.entry(model_id)?;
        match entry.allocation() {
            Some(handle) if self.pool.is_live(&handle.device_id) => Ok(()),
            Some(handle) => Err(Error::resource_unavailable(format!(
                "device {} backing {} is not live",
                handle.device_id,
                entry.name()
            ))),
            None => Err(Error::resource_unavailable(format!(
                "{} holds no device allocation",
                entry.name()
            ))),
        }
    }

    /// Requests get one requeue on an unavailable device, then fail
    fn requeue_or_fail(&self, mut batch: Batch, err: Error) -> ExecutionReport {
        let model = batch.model.clone();
        warn!(model = %model, size = batch.len(), error = %err, "Device unavailable for batch");
        self.metrics.record_error(&model, err.category());

        if let Some(padding) = batch.padding.take() {
            padding::unpad_requests(&mut batch.requests, &padding);
        }
        let (retry, mut exhausted): (Vec<_>, Vec<_>) =
            batch.requests.drain(..).partition(|r| r.requeues == 0);
        let size = retry.len() + exhausted.len();
        batch.requests = retry;
        let requeued = batch.len();
        let rejected = self.scheduler.requeue(batch);
        let requeued = requeued - rejected.len();
        exhausted.extend(rejected);

        let mut report = ExecutionReport::new(BatchOutcome::Requeued, size);
        report.requeued = requeued;
        for mut request in exhausted {
            report.failed += 1;
            if request.fail(err.clone()) {
                self.metrics.record_request(&model, "error");
            }
        }
        if let Ok(entry) = self.registry.entry_by_name(&model) {
            entry.stats().record_failures(report.failed);
        }
        report
    }

    /// Call the backend, retrying whole-call failures with backoff
    async fn call_with_retry(
        &self,
        backend: &Arc<dyn BackendPlugin>,
        input: BatchInput,
        size: usize,
    ) -> (Result<BatchOutput>, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match timeout(self.config.predict_timeout(), backend.predict(input.clone())).await {
                Ok(Ok(output)) if output.len() == size => return (Ok(output), attempt),
                Ok(Ok(output)) => Error::plugin_call_failed(format!(
                    "backend returned {} results for a batch of {}",
                    output.len(),
                    size
                )),
                Ok(Err(Error::PluginCallFailed(message))) => Error::PluginCallFailed(message),
                Ok(Err(e)) => Error::plugin_call_failed(e.to_string()),
                Err(_) => Error::plugin_call_failed(format!(
                    "predict timed out after {}ms",
                    self.config.predict_timeout_ms
                )),
            };

            self.metrics.record_error(&input.model, err.category());
            if attempt > self.config.max_retries {
                return (Err(err), attempt);
            }
            let delay = self.config.backoff(attempt);
            warn!(
                model = %input.model,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Backend call failed, retrying"
            );
            sleep(delay).await;
        }
    }

    fn report_health(&self, model_id: &ModelId, report: HealthReport) {
        match self.registry.report_health(model_id, report) {
            Ok(Some(state)) => {
                if let Ok(entry) = self.registry.entry(model_id) {
                    self.metrics.set_model_state(&entry.name(), state.code());
                }
            }
            Ok(None) => {}
            Err(e) => debug!(model = %model_id, error = %e, "Health report dropped"),
        }
    }

    /// Spawn the executor task for one model. It exits once the batch
    /// channel closes and every buffered batch has been executed.
    pub fn spawn_executor(
        self: &Arc<Self>,
        model_id: ModelId,
        backend: Arc<dyn BackendPlugin>,
        mut batches: mpsc::Receiver<Batch>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                coordinator.execute(&model_id, &backend, batch).await;
            }
            debug!(model = %model_id, "Executor stopped");
        })
    }

    pub fn predict_timeout(&self) -> Duration {
        self.config.predict_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_backend::MockBackend;
    use mesh_core::{
        BackendKind, BatchingConfig, DeviceConfig, DeviceKind, ModelDescriptor, ModelState,
        Payload, Priority, Request,
    };

    struct Fixture {
        coordinator: ExecutionCoordinator,
        registry: Arc<ModelRegistry>,
        pool: Arc<ResourcePool>,
        scheduler: Arc<Scheduler>,
        id: ModelId,
        mock: MockBackend,
        backend: Arc<dyn BackendPlugin>,
    }

    async fn fixture(config: ExecutionConfig) -> Fixture {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let registry = Arc::new(ModelRegistry::default());
        let pool = Arc::new(ResourcePool::new(
            &[DeviceConfig::new("gpu0", DeviceKind::Gpu)],
            false,
        ));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&metrics)));

        let descriptor = ModelDescriptor::new("m1", BackendKind::Mock, "none")
            .with_resources(DeviceKind::Gpu, 0.5);
        let id = registry.register(descriptor.clone()).unwrap();
        registry.request_load(&id).unwrap();
        let handle = pool.allocate(DeviceKind::Gpu, 0.5, "m1").unwrap();
        registry.set_allocation(&id, Some(handle)).unwrap();
        registry.confirm_ready(&id).unwrap();
        scheduler.open_queue("m1", BatchingConfig::default());

        let mock = MockBackend::new_default();
        mock.load(&descriptor).await.unwrap();
        let backend: Arc<dyn BackendPlugin> = Arc::new(mock.clone());

        Fixture {
            coordinator: ExecutionCoordinator::new(
                Arc::clone(&registry),
                Arc::clone(&pool),
                Arc::clone(&scheduler),
                config,
                metrics,
            ),
            registry,
            pool,
            scheduler,
            id,
            mock,
            backend,
        }
    }

    fn batch(
        payloads: Vec<Payload>,
    ) -> (Batch, Vec<tokio::sync::oneshot::Receiver<mesh_core::ExecutionResult>>) {
        let mut requests = Vec::new();
        let mut receivers = Vec::new();
        for payload in payloads {
            let (request, rx) = Request::new("m1", payload, Priority::Normal, None);
            request
                .status
                .advance(RequestStatus::Queued, RequestStatus::Batched);
            requests.push(request);
            receivers.push(rx);
        }
        let now = Instant::now();
        let batch = Batch {
            model: "m1".to_string(),
            requests,
            formation_started: now,
            formed_at: now,
            padding: None,
        };
        (batch, receivers)
    }

    fn texts(n: usize) -> Vec<Payload> {
        (0..n).map(|i| Payload::Text(format!("item-{}", i))).collect()
    }

    #[tokio::test]
    async fn test_results_preserve_identity() {
        let f = fixture(ExecutionConfig::default()).await;
        let (batch, receivers) = batch(texts(4));
        let ids: Vec<_> = batch.requests.iter().map(|r| r.id.clone()).collect();

        let report = f.coordinator.execute(&f.id, &f.backend, batch).await;
        assert_eq!(report.outcome, BatchOutcome::Completed);
        assert_eq!(report.succeeded, 4);
        assert_eq!(ids.len(), 4);

        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap().unwrap(), Payload::Text(format!("item-{}", i)));
        }
        let entry = f.registry.entry(&f.id).unwrap();
        assert_eq!(entry.in_flight(), 0);
        assert_eq!(entry.stats().snapshot().successful_requests, 4);
    }

    #[tokio::test]
    async fn test_partial_failure_is_item_scoped() {
        let f = fixture(ExecutionConfig::default()).await;
        f.mock.fail_item(2);
        let (batch, receivers) = batch(texts(5));
        let failing_id = batch.requests[2].id.clone();

        let report = f.coordinator.execute(&f.id, &f.backend, batch).await;
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.attempts, 1);
        assert_eq!(f.mock.call_count(), 1);

        for (i, rx) in receivers.into_iter().enumerate() {
            let result = rx.await.unwrap();
            if i == 2 {
                let err = result.unwrap_err();
                assert_eq!(err.request_id, failing_id);
                assert!(matches!(err.error, Error::PluginExecution(_)));
            } else {
                assert!(result.is_ok());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_retries_then_fails_all() {
        let config = ExecutionConfig {
            max_retries: 2,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            ..ExecutionConfig::default()
        };
        let f = fixture(config).await;
        f.mock.fail_next_calls(10);
        let (batch, receivers) = batch(texts(3));

        let started = Instant::now();
        let report = f.coordinator.execute(&f.id, &f.backend, batch).await;
        assert_eq!(report.outcome, BatchOutcome::Failed);
        assert_eq!(report.attempts, 3);
        assert_eq!(f.mock.call_count(), 3);
        // 10ms + 20ms of backoff
        assert!(Instant::now() - started >= Duration::from_millis(30));

        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err.error, Error::PluginExecution(_)));
        }
        // One failed batch is below the degrade threshold
        assert_eq!(f.registry.get_status(&f.id).unwrap().state, ModelState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_transient_failure() {
        let config = ExecutionConfig {
            backoff_base_ms: 1,
            ..ExecutionConfig::default()
        };
        let f = fixture(config).await;
        f.mock.fail_next_calls(1);
        let (batch, receivers) = batch(texts(2));

        let report = f.coordinator.execute(&f.id, &f.backend, batch).await;
        assert_eq!(report.outcome, BatchOutcome::Completed);
        assert_eq!(report.attempts, 2);
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_total_failures_degrade_model() {
        let config = ExecutionConfig {
            max_retries: 0,
            ..ExecutionConfig::default()
        };
        let f = fixture(config).await;
        f.mock.fail_next_calls(3);

        for _ in 0..3 {
            let (batch, _receivers) = batch(texts(1));
            f.coordinator.execute(&f.id, &f.backend, batch).await;
        }
        assert_eq!(
            f.registry.get_status(&f.id).unwrap().state,
            ModelState::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_predict_timeout_counts_as_call_failure() {
        let config = ExecutionConfig {
            predict_timeout_ms: 100,
            max_retries: 0,
            ..ExecutionConfig::default()
        };
        let f = fixture(config).await;
        f.mock.set_latency(Duration::from_secs(5));
        let (batch, receivers) = batch(texts(1));

        let report = f.coordinator.execute(&f.id, &f.backend, batch).await;
        assert_eq!(report.outcome, BatchOutcome::Failed);
        let err = receivers.into_iter().next().unwrap().await.unwrap().unwrap_err();
        assert!(err.error.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_dead_device_requeues_once_then_fails() {
        let f = fixture(ExecutionConfig::default()).await;
        f.pool.set_device_live("gpu0", false).unwrap();
        let (batch, mut receivers) = batch(texts(2));

        let report = f.coordinator.execute(&f.id, &f.backend, batch).await;
        assert_eq!(report.outcome, BatchOutcome::Requeued);
        assert_eq!(report.requeued, 2);
        assert_eq!(f.scheduler.depth("m1"), 2);
        assert_eq!(f.mock.call_count(), 0);

        let queue = f.scheduler.queue("m1").unwrap();
        let again = queue.take_batch(Instant::now()).0.unwrap();
        let report = f.coordinator.execute(&f.id, &f.backend, again).await;
        assert_eq!(report.failed, 2);
        for rx in receivers.iter_mut() {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err.error, Error::ResourceUnavailable(_)));
        }
    }

    #[tokio::test]
    async fn test_cancelled_after_formation_discards_result() {
        let f = fixture(ExecutionConfig::default()).await;
        let (batch, mut receivers) = batch(texts(2));
        assert!(batch.requests[0].status.cancel());

        let report = f.coordinator.execute(&f.id, &f.backend, batch).await;
        assert_eq!(f.mock.batch_sizes(), vec![2]);
        assert_eq!(report.outcome, BatchOutcome::Completed);
        assert!(receivers.remove(0).await.is_err());
        assert!(receivers.remove(0).await.unwrap().is_ok());
    }
}
