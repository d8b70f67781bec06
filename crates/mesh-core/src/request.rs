//! Requests, batches and per-request results

use crate::{Error, Payload, Priority, RequestError, RequestId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Outcome delivered to the caller of a single request
pub type ExecutionResult = std::result::Result<Payload, RequestError>;

/// Lifecycle of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued = 0,
    Batched = 1,
    Executing = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

impl RequestStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestStatus::Queued,
            1 => RequestStatus::Batched,
            2 => RequestStatus::Executing,
            3 => RequestStatus::Completed,
            4 => RequestStatus::Failed,
            _ => RequestStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Batched => "batched",
            RequestStatus::Executing => "executing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Lock-free request status shared between the caller handle and the engine
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(RequestStatus::Queued as u8))
    }

    pub fn get(&self) -> RequestStatus {
        RequestStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; fails if another party changed the status first
    pub fn advance(&self, from: RequestStatus, to: RequestStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancel if still `Queued` or `Batched`
    pub fn cancel(&self) -> bool {
        self.advance(RequestStatus::Queued, RequestStatus::Cancelled)
            || self.advance(RequestStatus::Batched, RequestStatus::Cancelled)
    }

    /// Record a terminal outcome unless the request was already finished
    pub fn finish(&self, to: RequestStatus) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if RequestStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.0.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A prediction request owned by whichever queue or batch currently holds it
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub model: String,
    pub payload: Payload,
    pub priority: Priority,
    pub arrival: Instant,
    pub deadline: Option<Instant>,
    pub status: Arc<StatusCell>,
    /// Arrival order within the model queue, kept across requeues
    pub sequence: u64,
    /// Times this request was put back in its queue
    pub requeues: u32,
    responder: Option<oneshot::Sender<ExecutionResult>>,
}

impl Request {
    /// Create a request and the receiver its result will be delivered on
    pub fn new(
        model: impl Into<String>,
        payload: Payload,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> (Self, oneshot::Receiver<ExecutionResult>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id: RequestId::generate(),
            model: model.into(),
            payload,
            priority,
            arrival: Instant::now(),
            deadline,
            status: Arc::new(StatusCell::new()),
            sequence: 0,
            requeues: 0,
            responder: Some(tx),
        };
        (request, rx)
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.get() == RequestStatus::Cancelled
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }

    /// Deliver a successful output
    pub fn succeed(&mut self, output: Payload) -> bool {
        if !self.status.finish(RequestStatus::Completed) {
            return false;
        }
        self.send(Ok(output))
    }

    /// Deliver an error tagged with this request's id
    pub fn fail(&mut self, error: Error) -> bool {
        if !self.status.finish(RequestStatus::Failed) {
            return false;
        }
        let err = RequestError::new(self.id.clone(), error);
        self.send(Err(err))
    }

    fn send(&mut self, result: ExecutionResult) -> bool {
        match self.responder.take() {
            // The caller may have dropped its handle.
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

/// Lengths recorded before variable-length inputs were padded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingInfo {
    pub padded_len: usize,
    /// `None` for items that were not padded
    pub original_lens: Vec<Option<usize>>,
}

/// An ordered group of requests dispatched to one backend call
#[derive(Debug)]
pub struct Batch {
    pub model: String,
    pub requests: Vec<Request>,
    /// Arrival of the oldest request, when formation started waiting
    pub formation_started: Instant,
    pub formed_at: Instant,
    pub padding: Option<PaddingInfo>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// How long the oldest request waited before the flush
    pub fn formation_wait(&self) -> std::time::Duration {
        self.formed_at.duration_since(self.formation_started)
    }

    /// Fail every request that has not already finished. Returns how many
    /// results were delivered.
    pub fn fail_all(&mut self, error: &Error) -> usize {
        self.requests
            .iter_mut()
            .map(|r| r.fail(error.clone()))
            .filter(|delivered| *delivered)
            .count()
    }
}
