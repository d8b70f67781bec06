//! Admission router
//!
//! Validates requests and enqueues them. Every admission error is returned
//! synchronously and leaves no queue entry behind.

use crate::registry::ModelRegistry;
use crate::scheduler::Scheduler;
use mesh_core::{
    AdmissionConfig, Error, ExecutionResult, Payload, Priority, Request, RequestError, RequestId,
    RequestStatus, Result, StatusCell,
};
use mesh_metrics::EngineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

/// Caller-side handle of an admitted request
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    model: String,
    status: Arc<StatusCell>,
    receiver: oneshot::Receiver<ExecutionResult>,
    scheduler: Arc<Scheduler>,
    wait_timeout: Duration,
}

impl RequestHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn status(&self) -> RequestStatus {
        self.status.get()
    }

    /// Wait for the result, up to the configured request timeout
    pub async fn wait(mut self) -> ExecutionResult {
        match timeout(self.wait_timeout, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.dropped()),
            Err(_) => {
                self.cancel();
                Err(RequestError::new(
                    self.id.clone(),
                    Error::batch_timeout(format!(
                        "no result within {}ms",
                        self.wait_timeout.as_millis()
                    )),
                ))
            }
        }
    }

    /// Poll for the result without waiting
    pub fn try_result(&mut self) -> Option<ExecutionResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(self.dropped())),
        }
    }

    /// Cancel the request. Before batching it is removed from its queue;
    /// after batching its result is discarded. Returns false once executing.
    pub fn cancel(&self) -> bool {
        if !self.status.cancel() {
            return false;
        }
        if self.scheduler.remove(&self.model, &self.id).is_some() {
            trace!(request = %self.id, model = %self.model, "Removed cancelled request from queue");
        }
        true
    }

    fn dropped(&self) -> RequestError {
        let error = if self.status.get() == RequestStatus::Cancelled {
            Error::cancelled(format!("request {} was cancelled", self.id))
        } else {
            Error::internal(format!("request {} was dropped without a result", self.id))
        };
        RequestError::new(self.id.clone(), error)
    }
}

/// Admits requests into per-model queues
#[derive(Debug)]
pub struct AdmissionRouter {
    registry: Arc<ModelRegistry>,
    scheduler: Arc<Scheduler>,
    config: AdmissionConfig,
    metrics: Arc<EngineMetrics>,
}

impl AdmissionRouter {
    pub fn new(
        registry: Arc<ModelRegistry>,
        scheduler: Arc<Scheduler>,
        config: AdmissionConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            config,
            metrics,
        }
    }

    /// Validate and enqueue a request
    pub fn submit(
        &self,
        model: &str,
        payload: Payload,
        priority: Option<Priority>,
        deadline: Option<Instant>,
    ) -> Result<RequestHandle> {
        match self.admit(model, payload, priority, deadline) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                debug!(model, error = %e, "Request rejected at admission");
                self.metrics.record_error(model, e.category());
                self.metrics.record_request(model, "rejected");
                Err(e)
            }
        }
    }

    /// Validate and enqueue several inputs for one model. Every input is
    /// checked before any is queued, and either all are admitted or none.
    pub fn submit_many(
        &self,
        model: &str,
        payloads: Vec<Payload>,
        priority: Option<Priority>,
        deadline: Option<Instant>,
    ) -> Result<Vec<RequestHandle>> {
        let count = payloads.len();
        match self.admit_many(model, payloads, priority, deadline) {
            Ok(handles) => Ok(handles),
            Err(e) => {
                debug!(model, count, error = %e, "Batch submission rejected at admission");
                self.metrics.record_error(model, e.category());
                self.metrics.record_request(model, "rejected");
                Err(e)
            }
        }
    }

    fn admit(
        &self,
        model: &str,
        payload: Payload,
        priority: Option<Priority>,
        deadline: Option<Instant>,
    ) -> Result<RequestHandle> {
        self.check_ready(model)?;
        payload.validate()?;
        check_deadline(deadline)?;

        let priority = priority.unwrap_or(self.config.default_priority);
        let (request, receiver) = Request::new(model, payload, priority, deadline);
        let handle = self.handle(&request, receiver);
        self.scheduler.enqueue(request)?;
        trace!(request = %handle.id, model, %priority, "Request admitted");
        Ok(handle)
    }

    fn admit_many(
        &self,
        model: &str,
        payloads: Vec<Payload>,
        priority: Option<Priority>,
        deadline: Option<Instant>,
    ) -> Result<Vec<RequestHandle>> {
        if payloads.is_empty() {
            return Err(Error::validation("no inputs given"));
        }
        self.check_ready(model)?;
        for payload in &payloads {
            payload.validate()?;
        }
        check_deadline(deadline)?;

        let priority = priority.unwrap_or(self.config.default_priority);
        let (requests, handles): (Vec<Request>, Vec<RequestHandle>) = payloads
            .into_iter()
            .map(|payload| {
                let (request, receiver) = Request::new(model, payload, priority, deadline);
                let handle = self.handle(&request, receiver);
                (request, handle)
            })
            .unzip();
        self.scheduler.enqueue_all(model, requests)?;
        trace!(model, count = handles.len(), %priority, "Requests admitted");
        Ok(handles)
    }

    fn check_ready(&self, model: &str) -> Result<()> {
        let state = self.registry.entry_by_name(model)?.state();
        if !state.is_ready() {
            return Err(Error::model_not_ready(model, state));
        }
        Ok(())
    }

    fn handle(
        &self,
        request: &Request,
        receiver: oneshot::Receiver<ExecutionResult>,
    ) -> RequestHandle {
        RequestHandle {
            id: request.id.clone(),
            model: request.model.clone(),
            status: Arc::clone(&request.status),
            receiver,
            scheduler: Arc::clone(&self.scheduler),
            wait_timeout: self.config.request_timeout(),
        }
    }
}

fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(deadline) if deadline <= Instant::now() => {
            Err(Error::validation("deadline has already elapsed"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{BackendKind, BatchingConfig, DeviceKind, ModelDescriptor};

    struct Fixture {
        router: AdmissionRouter,
        registry: Arc<ModelRegistry>,
        scheduler: Arc<Scheduler>,
    }

    fn fixture(backlog_limit: usize) -> Fixture {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let registry = Arc::new(ModelRegistry::default());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&metrics)));
        let id = registry
            .register(
                ModelDescriptor::new("m1", BackendKind::Echo, "none")
                    .with_resources(DeviceKind::Cpu, 0.5),
            )
            .unwrap();
        registry.request_load(&id).unwrap();
        registry.confirm_ready(&id).unwrap();
        scheduler.open_queue(
            "m1",
            BatchingConfig {
                backlog_limit,
                ..BatchingConfig::default()
            },
        );
        let router = AdmissionRouter::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            AdmissionConfig {
                request_timeout_ms: 100,
                ..AdmissionConfig::default()
            },
            metrics,
        );
        Fixture {
            router,
            registry,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected() {
        let f = fixture(8);
        let err = f
            .router
            .submit("ghost", Payload::from("x"), None, None)
            .unwrap_err();
        assert_eq!(err, Error::ModelNotFound("ghost".to_string()));
        assert_eq!(f.scheduler.depth("ghost"), 0);
    }

    #[tokio::test]
    async fn test_not_ready_model_is_rejected() {
        let f = fixture(8);
        let id = f.registry.lookup("m1").unwrap();
        for _ in 0..3 {
            f.registry
                .report_health(&id, crate::registry::HealthReport::probe(false))
                .unwrap();
        }
        let err = f
            .router
            .submit("m1", Payload::from("x"), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotReady { .. }));
        assert_eq!(f.scheduler.depth("m1"), 0);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let f = fixture(8);
        let err = f
            .router
            .submit("m1", Payload::Text(String::new()), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = f
            .router
            .submit("m1", Payload::from("x"), None, Some(Instant::now()))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.scheduler.depth("m1"), 0);
    }

    #[tokio::test]
    async fn test_backpressure() {
        let f = fixture(1);
        let _first = f.router.submit("m1", Payload::from("x"), None, None).unwrap();
        let err = f
            .router
            .submit("m1", Payload::from("y"), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Backpressure { .. }));
        assert_eq!(f.scheduler.depth("m1"), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_batching() {
        let f = fixture(8);
        let handle = f
            .router
            .submit("m1", Payload::from("x"), Some(Priority::High), None)
            .unwrap();
        assert_eq!(handle.status(), RequestStatus::Queued);
        assert_eq!(f.scheduler.depth("m1"), 1);

        assert!(handle.cancel());
        assert_eq!(f.scheduler.depth("m1"), 0);
        assert!(!handle.cancel());

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err.error, Error::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let f = fixture(8);
        let handle = f.router.submit("m1", Payload::from("x"), None, None).unwrap();
        let id = handle.id().clone();

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.request_id, id);
        assert!(matches!(err.error, Error::BatchTimeout(_)));
        assert_eq!(f.scheduler.depth("m1"), 0);
    }

    #[tokio::test]
    async fn test_try_result_delivers_once_completed() {
        let f = fixture(8);
        let mut handle = f.router.submit("m1", Payload::from("x"), None, None).unwrap();
        assert!(handle.try_result().is_none());

        let queue = f.scheduler.queue("m1").unwrap();
        let mut batch = queue.take_batch(Instant::now()).0.unwrap();
        batch.requests[0].succeed(Payload::from("done"));
        assert_eq!(handle.try_result(), Some(Ok(Payload::from("done"))));
    }

    #[tokio::test]
    async fn test_submit_many_admits_all() {
        let f = fixture(8);
        let payloads = vec![Payload::from("a"), Payload::from("b"), Payload::from("c")];
        let handles = f.router.submit_many("m1", payloads, None, None).unwrap();
        assert_eq!(handles.len(), 3);
        assert_eq!(f.scheduler.depth("m1"), 3);

        let queue = f.scheduler.queue("m1").unwrap();
        let batch = queue.take_batch(Instant::now()).0.unwrap();
        let ids: Vec<_> = batch.requests.iter().map(|r| r.id.clone()).collect();
        let expected: Vec<_> = handles.iter().map(|h| h.id().clone()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_submit_many_rejects_before_queueing() {
        let f = fixture(8);
        let payloads = vec![Payload::from("a"), Payload::Text(String::new())];
        let err = f.router.submit_many("m1", payloads, None, None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.scheduler.depth("m1"), 0);

        let err = f.router.submit_many("m1", Vec::new(), None, None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = f
            .router
            .submit_many("ghost", vec![Payload::from("a")], None, None)
            .unwrap_err();
        assert_eq!(err, Error::ModelNotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_submit_many_backpressure_admits_none() {
        let f = fixture(2);
        let _first = f.router.submit("m1", Payload::from("x"), None, None).unwrap();
        let payloads = vec![Payload::from("a"), Payload::from("b")];
        let err = f.router.submit_many("m1", payloads, None, None).unwrap_err();
        assert!(matches!(err, Error::Backpressure { depth: 1, limit: 2, .. }));
        assert_eq!(f.scheduler.depth("m1"), 1);
    }
}
