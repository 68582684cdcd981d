//! Time-boxed replay protection for inbound requests.
//!
//! Every accepted `(session_id, request_id)` pair is recorded here for a fixed
//! window from insertion. Any later inbound message with the same key is
//! dropped without re-executing the backend, whether the original request is
//! still active or already reached a terminal status.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use crate::protocol::RequestKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Active,
    Done,
    Error,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Active => "active",
            RequestStatus::Done => "done",
            RequestStatus::Error => "error",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Active)
    }
}

#[derive(Debug)]
pub struct ReplayTracker {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<RequestKey, RequestStatus>,
    order: VecDeque<(RequestKey, Instant)>,
}

impl ReplayTracker {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a freshly accepted request as active. Returns `false` without
    /// touching the entry if the key is already present (a replay).
    pub fn record_active(&mut self, key: &RequestKey, now: Instant) -> bool {
        self.sweep(now);
        if self.entries.contains_key(key) {
            return false;
        }

        self.entries.insert(key.clone(), RequestStatus::Active);
        self.order.push_back((key.clone(), now));

        while self.entries.len() > self.max_entries {
            if let Some((old_key, _)) = self.order.pop_front() {
                self.entries.remove(&old_key);
            }
        }

        debug_assert_eq!(
            self.entries.len(),
            self.order.len(),
            "ReplayTracker: HashMap and VecDeque out of sync"
        );
        true
    }

    pub fn status_of(&self, key: &RequestKey) -> Option<RequestStatus> {
        self.entries.get(key).copied()
    }

    /// Move an entry to a terminal status. Returns `false` if the key is
    /// unknown or already terminal; the original terminal status wins.
    pub fn mark_terminal(&mut self, key: &RequestKey, status: RequestStatus) -> bool {
        debug_assert!(status.is_terminal());
        match self.entries.get_mut(key) {
            Some(current) if *current == RequestStatus::Active => {
                *current = status;
                true
            }
            _ => false,
        }
    }

    /// Drop entries whose TTL (fixed window from insertion) has elapsed. Runs
    /// on every inbound message and on the periodic background tick, so memory
    /// stays bounded without a dedicated reaper thread.
    pub fn sweep(&mut self, now: Instant) {
        while let Some((key, inserted)) = self.order.front().cloned() {
            if now.duration_since(inserted) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
