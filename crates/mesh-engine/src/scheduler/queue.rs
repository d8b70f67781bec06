//! Priority queue of pending requests for one model

use mesh_core::{Priority, Request, RequestId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::time::Instant;

/// Orders by priority (highest first), then arrival sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    sequence: u64,
}

/// Pending requests indexed by position, id, arrival and deadline
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: BTreeMap<QueueKey, Request>,
    by_id: HashMap<RequestId, QueueKey>,
    /// sequence -> (arrival, key); the first entry is the oldest request
    by_sequence: BTreeMap<u64, (Instant, QueueKey)>,
    deadlines: BTreeSet<(Instant, u64)>,
    next_sequence: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a new request behind everything of equal priority
    pub fn push(&mut self, mut request: Request) {
        request.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.insert(request);
    }

    /// Put back a request that was already queued once, keeping its place
    pub fn push_existing(&mut self, request: Request) {
        self.next_sequence = self.next_sequence.max(request.sequence + 1);
        self.insert(request);
    }

    fn insert(&mut self, request: Request) {
        let key = QueueKey {
            priority: Reverse(request.priority),
            sequence: request.sequence,
        };
        self.by_id.insert(request.id.clone(), key);
        self.by_sequence
            .insert(request.sequence, (request.arrival, key));
        if let Some(deadline) = request.deadline {
            self.deadlines.insert((deadline, request.sequence));
        }
        self.entries.insert(key, request);
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<Request> {
        let key = self.by_id.get(id).copied()?;
        self.remove_key(key)
    }

    fn remove_key(&mut self, key: QueueKey) -> Option<Request> {
        let request = self.entries.remove(&key)?;
        self.by_id.remove(&request.id);
        self.by_sequence.remove(&request.sequence);
        if let Some(deadline) = request.deadline {
            self.deadlines.remove(&(deadline, request.sequence));
        }
        Some(request)
    }

    /// Remove up to `max` requests in priority then arrival order
    pub fn pop_batch(&mut self, max: usize) -> Vec<Request> {
        let keys: Vec<QueueKey> = self.entries.keys().take(max).copied().collect();
        keys.into_iter()
            .filter_map(|key| self.remove_key(key))
            .collect()
    }

    /// Remove every request whose deadline is at or before `now`
    pub fn drain_expired(&mut self, now: Instant) -> Vec<Request> {
        let mut expired = Vec::new();
        while let Some(&(deadline, sequence)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.remove(&(deadline, sequence));
            let key = self.by_sequence.get(&sequence).map(|(_, key)| *key);
            if let Some(request) = key.and_then(|key| self.remove_key(key)) {
                expired.push(request);
            }
        }
        expired
    }

    pub fn drain_all(&mut self) -> Vec<Request> {
        self.by_id.clear();
        self.by_sequence.clear();
        self.deadlines.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn oldest_arrival(&self) -> Option<Instant> {
        self.by_sequence.values().next().map(|(arrival, _)| *arrival)
    }

    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }
}
