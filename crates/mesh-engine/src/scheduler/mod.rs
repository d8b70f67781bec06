//! Batch scheduler
//!
//! One [`ModelQueue`] per loaded model holds pending requests ordered by
//! priority then arrival. A [`former`] task per model watches its queue and
//! flushes batches when the queue is full, the oldest request has waited
//! `max_wait`, or a deadline is about to elapse.

pub mod former;
pub mod padding;
pub mod queue;

use dashmap::DashMap;
use mesh_core::{
    Batch, BatchingConfig, Error, PaddingInfo, Request, RequestId, RequestStatus, Result,
};
use mesh_metrics::EngineMetrics;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

pub use former::BatchFormer;
pub use queue::RequestQueue;

/// Why a batch was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Full,
    MaxWait,
    Deadline,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Full => "full",
            FlushReason::MaxWait => "max_wait",
            FlushReason::Deadline => "deadline",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the former should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Flush(FlushReason),
    WaitUntil(Instant),
    Idle,
}

/// Pending requests and batching settings for one model
pub struct ModelQueue {
    model: String,
    config: BatchingConfig,
    inner: Mutex<RequestQueue>,
    notify: Notify,
    closed: AtomicBool,
    metrics: Arc<EngineMetrics>,
}

impl ModelQueue {
    fn new(model: String, config: BatchingConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            model,
            config,
            inner: Mutex::new(RequestQueue::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Admit a request unless the backlog limit is reached
    pub fn push(&self, request: Request) -> Result<()> {
        self.push_all(vec![request])
    }

    /// Admit every request or none of them
    pub fn push_all(&self, requests: Vec<Request>) -> Result<()> {
        let count = requests.len();
        let depth = {
            let mut inner = self.inner.lock();
            if self.is_closed() {
                return Err(Error::model_not_ready(&self.model, "unloading"));
            }
            let depth = inner.len();
            if depth + count > self.config.backlog_limit {
                return Err(Error::Backpressure {
                    model: self.model.clone(),
                    depth,
                    limit: self.config.backlog_limit,
                });
            }
            for request in requests {
                inner.push(request);
            }
            depth + count
        };
        self.metrics.set_queue_depth(&self.model, depth);
        self.notify.notify_one();
        Ok(())
    }

    /// Put requests from an undispatched batch back in their original place.
    /// Returns the requests that could not be requeued.
    pub fn requeue(&self, requests: Vec<Request>) -> Vec<Request> {
        let mut rejected = Vec::new();
        let depth = {
            let mut inner = self.inner.lock();
            for mut request in requests {
                if self.is_closed()
                    || !request
                        .status
                        .advance(RequestStatus::Batched, RequestStatus::Queued)
                {
                    rejected.push(request);
                    continue;
                }
                request.requeues += 1;
                inner.push_existing(request);
            }
            inner.len()
        };
        self.metrics.set_queue_depth(&self.model, depth);
        self.notify.notify_one();
        rejected
    }

    pub fn remove(&self, id: &RequestId) -> Option<Request> {
        let mut inner = self.inner.lock();
        let removed = inner.remove(id);
        if removed.is_some() {
            self.metrics.set_queue_depth(&self.model, inner.len());
        }
        removed
    }

    /// Decide whether to flush now or how long to wait
    pub fn decide(&self, now: Instant) -> Decision {
        let inner = self.inner.lock();
        let Some(oldest) = inner.oldest_arrival() else {
            return Decision::Idle;
        };
        if inner.len() >= self.config.max_batch_size {
            return Decision::Flush(FlushReason::Full);
        }

        // Anything due within one tick flushes now instead of arming a timer
        let horizon = now + self.config.tick();
        let wait_expires = oldest + self.config.max_wait();
        if horizon >= wait_expires {
            return Decision::Flush(FlushReason::MaxWait);
        }

        match inner.earliest_deadline() {
            Some(deadline) => {
                let flush_at = deadline
                    .checked_sub(self.config.deadline_slack())
                    .unwrap_or(deadline);
                if horizon >= flush_at {
                    Decision::Flush(FlushReason::Deadline)
                } else {
                    Decision::WaitUntil(wait_expires.min(flush_at))
                }
            }
            None => Decision::WaitUntil(wait_expires),
        }
    }

    /// Atomically remove up to `max_batch_size` requests as one batch.
    ///
    /// Requests cancelled while queued are dropped here. Requests whose
    /// deadline has passed are not batched; they are returned alongside the
    /// batch so the caller can fail them.
    pub fn take_batch(&self, now: Instant) -> (Option<Batch>, Vec<Request>) {
        let (popped, depth) = {
            let mut inner = self.inner.lock();
            let popped = inner.pop_batch(self.config.max_batch_size);
            (popped, inner.len())
        };
        self.metrics.set_queue_depth(&self.model, depth);

        let (expired, live): (Vec<Request>, Vec<Request>) =
            popped.into_iter().partition(|r| r.is_expired(now));
        let mut requests: Vec<Request> = live
            .into_iter()
            .filter(|r| {
                r.status
                    .advance(RequestStatus::Queued, RequestStatus::Batched)
            })
            .collect();
        if requests.is_empty() {
            return (None, expired);
        }

        let formation_started = requests
            .iter()
            .map(|r| r.arrival)
            .min()
            .unwrap_or(now);
        let padding = self.pad(&mut requests);

        let batch = Batch {
            model: self.model.clone(),
            requests,
            formation_started,
            formed_at: now,
            padding,
        };
        (Some(batch), expired)
    }

    /// Pull expired requests out of a formed batch that is still waiting for
    /// the executor, re-padding whatever is left.
    pub fn expire_formed(&self, batch: &mut Batch, now: Instant) -> Vec<Request> {
        if !batch.requests.iter().any(|r| r.is_expired(now)) {
            return Vec::new();
        }
        if let Some(padding) = batch.padding.take() {
            padding::unpad_requests(&mut batch.requests, &padding);
        }
        let (expired, live): (Vec<Request>, Vec<Request>) =
            batch.requests.drain(..).partition(|r| r.is_expired(now));
        batch.requests = live;
        batch.padding = self.pad(&mut batch.requests);
        expired
    }

    fn pad(&self, requests: &mut [Request]) -> Option<PaddingInfo> {
        if self.config.dynamic_padding {
            padding::pad_requests(requests, self.config.pad_token_id, self.config.pad_byte)
        } else {
            None
        }
    }

    /// Remove requests whose deadline has passed
    pub fn expire(&self, now: Instant) -> Vec<Request> {
        let mut inner = self.inner.lock();
        let expired = inner.drain_expired(now);
        if !expired.is_empty() {
            self.metrics.set_queue_depth(&self.model, inner.len());
        }
        expired
    }

    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.inner.lock().earliest_deadline()
    }

    /// Wait until a request is pushed
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    fn close(&self) -> Vec<Request> {
        let mut inner = self.inner.lock();
        self.closed.store(true, Ordering::Release);
        self.metrics.set_queue_depth(&self.model, 0);
        inner.drain_all()
    }
}

impl fmt::Debug for ModelQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelQueue")
            .field("model", &self.model)
            .field("depth", &self.depth())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Per-model request queues
#[derive(Debug)]
pub struct Scheduler {
    queues: DashMap<String, Arc<ModelQueue>>,
    metrics: Arc<EngineMetrics>,
}

impl Scheduler {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self {
            queues: DashMap::new(),
            metrics,
        }
    }

    /// Create the queue for a model that is about to become ready
    pub fn open_queue(&self, model: &str, config: BatchingConfig) -> Arc<ModelQueue> {
        let queue = Arc::new(ModelQueue::new(
            model.to_string(),
            config,
            Arc::clone(&self.metrics),
        ));
        info!(
            model,
            max_batch_size = queue.config.max_batch_size,
            max_wait_ms = queue.config.max_wait_ms,
            backlog_limit = queue.config.backlog_limit,
            "Opened request queue"
        );
        self.queues.insert(model.to_string(), Arc::clone(&queue));
        queue
    }

    /// Close a model's queue and hand back everything still pending
    pub fn close_queue(&self, model: &str) -> Vec<Request> {
        match self.queues.remove(model) {
            Some((_, queue)) => {
                let pending = queue.close();
                debug!(model, pending = pending.len(), "Closed request queue");
                pending
            }
            None => Vec::new(),
        }
    }

    pub fn queue(&self, model: &str) -> Option<Arc<ModelQueue>> {
        self.queues.get(model).map(|q| Arc::clone(q.value()))
    }

    /// Admit a request into its model's queue
    pub fn enqueue(&self, request: Request) -> Result<()> {
        let queue = self
            .queue(&request.model)
            .ok_or_else(|| Error::model_not_ready(&request.model, "not serving"))?;
        queue.push(request)
    }

    /// Admit several requests for one model as a unit
    pub fn enqueue_all(&self, model: &str, requests: Vec<Request>) -> Result<()> {
        let queue = self
            .queue(model)
            .ok_or_else(|| Error::model_not_ready(model, "not serving"))?;
        queue.push_all(requests)
    }

    /// Take a still-queued request out of its queue
    pub fn remove(&self, model: &str, id: &RequestId) -> Option<Request> {
        self.queue(model)?.remove(id)
    }

    /// Requeue an undispatched batch; returns the requests that were not requeued
    pub fn requeue(&self, mut batch: Batch) -> Vec<Request> {
        if let Some(padding) = batch.padding.take() {
            padding::unpad_requests(&mut batch.requests, &padding);
        }
        match self.queue(&batch.model) {
            Some(queue) => queue.requeue(batch.requests),
            None => batch.requests,
        }
    }

    pub fn depth(&self, model: &str) -> usize {
        self.queue(model).map(|q| q.depth()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{Payload, Priority};
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(EngineMetrics::new().unwrap()))
    }

    fn config(max_batch_size: usize, max_wait_ms: u64, backlog_limit: usize) -> BatchingConfig {
        BatchingConfig {
            max_batch_size,
            max_wait_ms,
            backlog_limit,
            ..BatchingConfig::default()
        }
    }

    fn request(deadline: Option<Instant>) -> Request {
        Request::new("m1", Payload::from("x"), Priority::Normal, deadline).0
    }

    #[tokio::test]
    async fn test_backpressure_at_backlog_limit() {
        let scheduler = scheduler();
        scheduler.open_queue("m1", config(4, 50, 2));
        scheduler.enqueue(request(None)).unwrap();
        scheduler.enqueue(request(None)).unwrap();

        let err = scheduler.enqueue(request(None)).unwrap_err();
        assert_eq!(
            err,
            Error::Backpressure {
                model: "m1".to_string(),
                depth: 2,
                limit: 2
            }
        );
        assert_eq!(scheduler.depth("m1"), 2);
    }

    #[tokio::test]
    async fn test_enqueue_all_is_all_or_nothing() {
        let scheduler = scheduler();
        scheduler.open_queue("m1", config(4, 50, 3));
        scheduler.enqueue(request(None)).unwrap();

        let err = scheduler
            .enqueue_all("m1", vec![request(None), request(None), request(None)])
            .unwrap_err();
        assert!(matches!(err, Error::Backpressure { depth: 1, limit: 3, .. }));
        assert_eq!(scheduler.depth("m1"), 1);

        scheduler
            .enqueue_all("m1", vec![request(None), request(None)])
            .unwrap();
        assert_eq!(scheduler.depth("m1"), 3);
    }

    #[tokio::test]
    async fn test_enqueue_without_queue() {
        let scheduler = scheduler();
        let err = scheduler.enqueue(request(None)).unwrap_err();
        assert!(matches!(err, Error::ModelNotReady { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decide_flush_reasons() {
        let scheduler = scheduler();
        let queue = scheduler.open_queue("m1", config(3, 50, 16));
        let start = Instant::now();
        assert_eq!(queue.decide(start), Decision::Idle);

        queue.push(request(None)).unwrap();
        assert_eq!(
            queue.decide(start),
            Decision::WaitUntil(start + Duration::from_millis(50))
        );
        assert_eq!(
            queue.decide(start + Duration::from_millis(50)),
            Decision::Flush(FlushReason::MaxWait)
        );

        queue.push(request(None)).unwrap();
        queue.push(request(None)).unwrap();
        assert_eq!(queue.decide(start), Decision::Flush(FlushReason::Full));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decide_deadline() {
        let scheduler = scheduler();
        let queue = scheduler.open_queue("m1", config(8, 50, 16));
        let start = Instant::now();
        queue
            .push(request(Some(start + Duration::from_millis(20))))
            .unwrap();

        // deadline_slack defaults to 5ms
        assert_eq!(
            queue.decide(start),
            Decision::WaitUntil(start + Duration::from_millis(15))
        );
        assert_eq!(
            queue.decide(start + Duration::from_millis(15)),
            Decision::Flush(FlushReason::Deadline)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_decide_within_tick_flushes() {
        let scheduler = scheduler();
        let queue = scheduler.open_queue("m1", config(8, 50, 16));
        let start = Instant::now();
        queue.push(request(None)).unwrap();

        // tick_ms defaults to 1ms
        assert_eq!(
            queue.decide(start + Duration::from_millis(48)),
            Decision::WaitUntil(start + Duration::from_millis(50))
        );
        assert_eq!(
            queue.decide(start + Duration::from_millis(49)),
            Decision::Flush(FlushReason::MaxWait)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_batch_leaves_out_expired() {
        let scheduler = scheduler();
        let queue = scheduler.open_queue("m1", config(8, 50, 16));
        let start = Instant::now();
        let late = request(Some(start + Duration::from_millis(10)));
        let late_id = late.id.clone();
        queue.push(late).unwrap();
        queue.push(request(None)).unwrap();

        let (batch, expired) = queue.take_batch(start + Duration::from_millis(10));
        assert_eq!(batch.unwrap().len(), 1);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, late_id);
        assert_eq!(expired[0].status.get(), RequestStatus::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_formed_repads_remaining() {
        let scheduler = scheduler();
        let queue = scheduler.open_queue("m1", config(8, 50, 16));
        let start = Instant::now();
        let inputs = [
            (vec![1, 2, 3, 4], Some(start + Duration::from_millis(10))),
            (vec![5, 6], None),
            (vec![7], None),
        ];
        for (tokens, deadline) in inputs {
            let (request, _rx) =
                Request::new("m1", Payload::Tokens(tokens), Priority::Normal, deadline);
            queue.push(request).unwrap();
        }

        let mut batch = queue.take_batch(start).0.unwrap();
        assert_eq!(batch.padding.as_ref().unwrap().padded_len, 4);
        assert!(queue.expire_formed(&mut batch, start).is_empty());

        let expired = queue.expire_formed(&mut batch, start + Duration::from_millis(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].payload, Payload::Tokens(vec![1, 2, 3, 4]));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.padding.as_ref().unwrap().padded_len, 2);
        assert_eq!(batch.requests[0].payload, Payload::Tokens(vec![5, 6]));
        assert_eq!(batch.requests[1].payload, Payload::Tokens(vec![7, 0]));
    }

    #[tokio::test]
    async fn test_take_batch_skips_cancelled() {
        let scheduler = scheduler();
        let queue = scheduler.open_queue("m1", config(8, 50, 16));
        let cancelled = request(None);
        cancelled.status.cancel();
        queue.push(cancelled).unwrap();
        queue.push(request(None)).unwrap();

        let batch = queue.take_batch(Instant::now()).0.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.requests[0].status.get(), RequestStatus::Batched);
        assert_eq!(queue.depth(), 0);
        assert!(queue.take_batch(Instant::now()).0.is_none());
    }

    #[tokio::test]
    async fn test_take_batch_pads_tokens() {
        let scheduler = scheduler();
        let queue = scheduler.open_queue("m1", config(8, 50, 16));
        for tokens in [vec![1, 2, 3], vec![4]] {
            let (request, _rx) = Request::new("m1", Payload::Tokens(tokens), Priority::Normal, None);
            queue.push(request).unwrap();
        }

        let batch = queue.take_batch(Instant::now()).0.unwrap();
        let padding = batch.padding.as_ref().unwrap();
        assert_eq!(padding.padded_len, 3);
        assert_eq!(batch.requests[1].payload, Payload::Tokens(vec![4, 0, 0]));
    }

    #[tokio::test]
    async fn test_requeue_restores_inputs_and_order() {
        let scheduler = scheduler();
        let queue = scheduler.open_queue("m1", config(8, 50, 16));
        let (request, _rx) = Request::new("m1", Payload::Tokens(vec![1]), Priority::Normal, None);
        let first_id = request.id.clone();
        queue.push(request).unwrap();
        let (request, _rx2) =
            Request::new("m1", Payload::Tokens(vec![1, 2]), Priority::Normal, None);
        queue.push(request).unwrap();

        let batch = queue.take_batch(Instant::now()).0.unwrap();
        assert!(scheduler.requeue(batch).is_empty());
        assert_eq!(queue.depth(), 2);

        let batch = queue.take_batch(Instant::now()).0.unwrap();
        assert_eq!(batch.requests[0].id, first_id);
        assert_eq!(batch.requests[0].requeues, 1);
        assert_eq!(batch.requests[0].payload, Payload::Tokens(vec![1, 0]));
    }

    #[tokio::test]
    async fn test_close_queue_returns_pending() {
        let scheduler = scheduler();
        let queue = scheduler.open_queue("m1", config(8, 50, 16));
        queue.push(request(None)).unwrap();
        queue.push(request(None)).unwrap();

        assert_eq!(scheduler.close_queue("m1").len(), 2);
        assert!(queue.is_closed());
        assert!(queue.push(request(None)).is_err());
        assert!(scheduler.queue("m1").is_none());
    }
}
