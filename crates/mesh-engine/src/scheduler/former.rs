//! Per-model batch formation task

use super::{Decision, FlushReason, ModelQueue};
use crate::stats::ModelStats;
use mesh_core::{Batch, Error, ModelState, Request};
use mesh_metrics::EngineMetrics;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Forms batches for one model and hands them to its executor.
///
/// Batches are only formed while the model is `Ready`. Deadlines are
/// enforced in every state and while a formed batch waits for the executor,
/// so requests never outlive their deadline in the queue of a degraded or
/// busy model.
pub struct BatchFormer {
    queue: Arc<ModelQueue>,
    state_rx: watch::Receiver<ModelState>,
    batches: mpsc::Sender<Batch>,
    stop_rx: watch::Receiver<bool>,
    metrics: Arc<EngineMetrics>,
    stats: Arc<ModelStats>,
}

impl BatchFormer {
    pub fn new(
        queue: Arc<ModelQueue>,
        state_rx: watch::Receiver<ModelState>,
        batches: mpsc::Sender<Batch>,
        stop_rx: watch::Receiver<bool>,
        metrics: Arc<EngineMetrics>,
        stats: Arc<ModelStats>,
    ) -> Self {
        Self {
            queue,
            state_rx,
            batches,
            stop_rx,
            metrics,
            stats,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let model = self.queue.model().to_string();
        debug!(model = %model, "Batch former started");
        let mut formed: Option<Batch> = None;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            let now = Instant::now();
            let expired = self.queue.expire(now);
            self.fail_expired(expired);
            if let Some(batch) = formed.as_mut() {
                let expired = self.queue.expire_formed(batch, now);
                self.fail_expired(expired);
                if batch.is_empty() {
                    formed = None;
                }
            }

            // A formed batch waits here for executor capacity. Formation
            // itself never waits on the executor.
            if let Some(batch) = formed.take() {
                let wake_at = earliest(
                    batch.requests.iter().filter_map(|r| r.deadline).min(),
                    self.queue.earliest_deadline(),
                );
                tokio::select! {
                    permit = self.batches.reserve() => match permit {
                        Ok(permit) => permit.send(batch),
                        Err(_) => {
                            formed = Some(batch);
                            break;
                        }
                    },
                    _ = sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {
                        formed = Some(batch);
                    }
                    _ = self.queue.notified() => formed = Some(batch),
                    changed = self.stop_rx.changed() => {
                        formed = Some(batch);
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            let mut wake_at = None;
            if self.state_rx.borrow().is_ready() {
                match self.queue.decide(now) {
                    Decision::Flush(reason) => {
                        formed = self.form(reason, now);
                        continue;
                    }
                    Decision::WaitUntil(at) => wake_at = Some(at),
                    Decision::Idle => {}
                }
            }
            let wake_at = earliest(wake_at, self.queue.earliest_deadline());

            tokio::select! {
                _ = self.queue.notified() => {}
                _ = sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {}
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = self.stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(mut batch) = formed {
            let failed = batch.fail_all(&Error::model_not_ready(&model, "unloading"));
            debug!(model = %model, failed, "Failed undispatched batch on stop");
            for _ in 0..failed {
                self.metrics.record_request(&model, "error");
            }
        }
        debug!(model = %model, "Batch former stopped");
    }

    /// Take a batch off the queue and record how long it took to form
    fn form(&self, reason: FlushReason, now: Instant) -> Option<Batch> {
        let (batch, expired) = self.queue.take_batch(now);
        self.fail_expired(expired);
        let batch = batch?;

        let model = self.queue.model();
        let wait = batch.formation_wait();
        trace!(
            model,
            size = batch.len(),
            reason = %reason,
            wait_ms = wait.as_millis() as u64,
            "Formed batch"
        );
        self.stats.record_formation(wait);
        self.metrics
            .observe_batch(model, batch.len(), wait.as_secs_f64(), reason.as_str());
        Some(batch)
    }

    fn fail_expired(&self, expired: Vec<Request>) {
        if expired.is_empty() {
            return;
        }
        let model = self.queue.model();
        debug!(model, count = expired.len(), "Requests expired before dispatch");
        self.stats.record_failures(expired.len());
        for mut request in expired {
            if request.fail(Error::batch_timeout(format!(
                "deadline elapsed while queued for {}",
                model
            ))) {
                self.metrics.record_error(model, "batch_timeout");
                self.metrics.record_request(model, "timeout");
            }
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use mesh_core::{BatchingConfig, Payload, Priority, Request};
    use std::time::Duration;

    struct Harness {
        queue: Arc<ModelQueue>,
        state_tx: watch::Sender<ModelState>,
        stop_tx: watch::Sender<bool>,
        batches: mpsc::Receiver<Batch>,
        stats: Arc<ModelStats>,
        handle: JoinHandle<()>,
    }

    fn start(config: BatchingConfig, state: ModelState) -> Harness {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let scheduler = Scheduler::new(Arc::clone(&metrics));
        let queue = scheduler.open_queue("m1", config.clone());
        let (state_tx, state_rx) = watch::channel(state);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, batches) = mpsc::channel(config.max_inflight_batches);
        let stats = Arc::new(ModelStats::new());
        let handle = BatchFormer::new(
            Arc::clone(&queue),
            state_rx,
            tx,
            stop_rx,
            metrics,
            Arc::clone(&stats),
        )
        .spawn();
        Harness {
            queue,
            state_tx,
            stop_tx,
            batches,
            stats,
            handle,
        }
    }

    fn config(max_batch_size: usize, max_wait_ms: u64) -> BatchingConfig {
        BatchingConfig {
            max_batch_size,
            max_wait_ms,
            ..BatchingConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_max_wait() {
        let mut h = start(config(4, 50), ModelState::Ready);
        let start = Instant::now();
        let (r1, _rx1) = Request::new("m1", Payload::from("a"), Priority::Normal, None);
        h.queue.push(r1).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (r2, _rx2) = Request::new("m1", Payload::from("b"), Priority::Normal, None);
        h.queue.push(r2).unwrap();

        let batch = h.batches.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_millis(50));
        assert!(waited <= Duration::from_millis(51));
        assert!(batch.formation_wait() <= Duration::from_millis(51));

        h.stop_tx.send_replace(true);
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_when_full() {
        let mut h = start(config(3, 1_000), ModelState::Ready);
        let mut receivers = Vec::new();
        for _ in 0..7 {
            let (request, rx) = Request::new("m1", Payload::from("a"), Priority::Normal, None);
            receivers.push(rx);
            h.queue.push(request).unwrap();
        }

        assert_eq!(h.batches.recv().await.unwrap().len(), 3);
        assert_eq!(h.batches.recv().await.unwrap().len(), 3);
        // The remainder waits for max_wait
        let start = Instant::now();
        assert_eq!(h.batches.recv().await.unwrap().len(), 1);
        assert!(Instant::now() - start >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_batches_while_degraded() {
        let mut h = start(config(2, 10), ModelState::Degraded);
        let (r1, _rx1) = Request::new("m1", Payload::from("a"), Priority::Normal, None);
        h.queue.push(r1).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(100), h.batches.recv()).await;
        assert!(waited.is_err());
        assert_eq!(h.queue.depth(), 1);

        h.state_tx.send_replace(ModelState::Ready);
        assert_eq!(h.batches.recv().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_requests_fail_with_batch_timeout() {
        let h = start(config(4, 1_000), ModelState::Degraded);
        let deadline = Instant::now() + Duration::from_millis(20);
        let (request, rx) = Request::new("m1", Payload::from("a"), Priority::Normal, Some(deadline));
        h.queue.push(request).unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err.error, Error::BatchTimeout(_)));
        assert!(Instant::now() >= deadline);
        assert_eq!(h.queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let h = start(config(4, 50), ModelState::Ready);
        h.stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), h.handle)
            .await
            .unwrap()
            .unwrap();
    }

    fn busy_config(max_batch_size: usize, max_wait_ms: u64) -> BatchingConfig {
        BatchingConfig {
            max_inflight_batches: 1,
            ..config(max_batch_size, max_wait_ms)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_enforced_while_executor_busy() {
        let mut h = start(busy_config(1, 10), ModelState::Ready);
        let start = Instant::now();
        let (r1, _rx1) = Request::new("m1", Payload::from("a"), Priority::Normal, None);
        let (r2, _rx2) = Request::new("m1", Payload::from("b"), Priority::Normal, None);
        let deadline = start + Duration::from_millis(50);
        let (r3, rx3) = Request::new("m1", Payload::from("c"), Priority::Normal, Some(deadline));
        h.queue.push(r1).unwrap();
        h.queue.push(r2).unwrap();
        h.queue.push(r3).unwrap();

        // Nobody drains the channel: r1 fills it and r2 waits as a formed batch
        let err = rx3.await.unwrap().unwrap_err();
        assert!(matches!(err.error, Error::BatchTimeout(_)));
        assert!(Instant::now() - start <= Duration::from_millis(51));
        assert_eq!(h.queue.depth(), 0);

        assert_eq!(h.batches.recv().await.unwrap().requests[0].payload, Payload::from("a"));
        assert_eq!(h.batches.recv().await.unwrap().requests[0].payload, Payload::from("b"));
        let next = tokio::time::timeout(Duration::from_millis(100), h.batches.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_formed_batch_drops_expired_items() {
        let mut h = start(busy_config(2, 10), ModelState::Ready);
        let start = Instant::now();
        let (r1, _rx1) = Request::new("m1", Payload::from("a"), Priority::Normal, None);
        h.queue.push(r1).unwrap();
        // Let the first batch fill the channel
        tokio::time::sleep(Duration::from_millis(20)).await;

        let deadline = start + Duration::from_millis(100);
        let (r2, rx2) = Request::new("m1", Payload::from("b"), Priority::Normal, Some(deadline));
        let (r3, _rx3) = Request::new("m1", Payload::from("c"), Priority::Normal, None);
        h.queue.push(r2).unwrap();
        h.queue.push(r3).unwrap();

        let err = rx2.await.unwrap().unwrap_err();
        assert!(matches!(err.error, Error::BatchTimeout(_)));

        h.batches.recv().await.unwrap();
        let held = h.batches.recv().await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held.requests[0].payload, Payload::from("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_formation_wait_bounded_while_executor_busy() {
        let cfg = busy_config(4, 10);
        let bound = cfg.max_wait() + cfg.tick();
        let mut h = start(cfg, ModelState::Ready);
        for payload in ["a", "b"] {
            let (request, _rx) = Request::new("m1", Payload::from(payload), Priority::Normal, None);
            h.queue.push(request).unwrap();
            // The second push lands after the first batch took the only slot
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        h.batches.recv().await.unwrap();
        let second = h.batches.recv().await.unwrap();
        assert!(second.formation_wait() <= bound);
        assert!(h.stats.snapshot().avg_formation_wait_ms <= bound.as_secs_f64() * 1_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_fails_undispatched_batch() {
        let h = start(busy_config(1, 10), ModelState::Ready);
        let (r1, _rx1) = Request::new("m1", Payload::from("a"), Priority::Normal, None);
        let (r2, rx2) = Request::new("m1", Payload::from("b"), Priority::Normal, None);
        h.queue.push(r1).unwrap();
        h.queue.push(r2).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.stop_tx.send_replace(true);
        h.handle.await.unwrap();
        let err = rx2.await.unwrap().unwrap_err();
        assert!(matches!(err.error, Error::ModelNotReady { .. }));
    }
}
