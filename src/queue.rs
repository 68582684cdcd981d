//! Bounded admission control for backend executions.
//!
//! The queue grants at most `max_active` concurrent [`Lease`]s. Requests over
//! that ceiling wait FIFO up to `wait_timeout`, with a hard cap on how many may
//! wait at once. A waiting request can be withdrawn cooperatively, either by
//! firing the cancel signal passed into [`AdmissionQueue::acquire`] or by
//! calling [`AdmissionQueue::cancel_queued`].

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::protocol::RequestKey;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Hard concurrency ceiling. Zero means the agent accepts no work at all.
    pub max_active: usize,
    /// Longest a request may wait for a slot before being rejected.
    pub wait_timeout: Duration,
    /// Hard cap on requests waiting for a slot.
    pub max_queued: usize,
}

/// The admission tuple identifying one request to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionInput {
    pub agent_id: String,
    pub session_id: String,
    pub request_id: String,
    pub process_id: String,
}

impl AdmissionInput {
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.session_id.clone(), self.request_id.clone())
    }
}

/// Each failure kind gets distinct handling by the orchestrator: full and
/// timeout surface as `agent_busy`, cancelled must never surface as a backend
/// error when the caller withdrew the request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("admission queue is full ({waiting} waiting)")]
    QueueFull { waiting: usize },
    #[error("timed out after {waited_ms}ms waiting for an execution slot")]
    QueueTimeout { waited_ms: u64 },
    #[error("admission wait cancelled by caller")]
    QueueCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Done,
    Error,
    Cancel,
    Shutdown,
}

impl ReleaseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseReason::Done => "done",
            ReleaseReason::Error => "error",
            ReleaseReason::Cancel => "cancel",
            ReleaseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub active: usize,
    pub queued: usize,
    pub config: QueueConfig,
}

struct Waiter {
    id: u64,
    key: RequestKey,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueState {
    active: usize,
    waiters: VecDeque<Waiter>,
    heartbeats: HashMap<Uuid, Instant>,
}

struct Inner {
    config: QueueConfig,
    next_waiter: AtomicU64,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<Inner>,
}

impl AdmissionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                next_waiter: AtomicU64::new(0),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Wait for an execution slot. Suspends until a slot frees, the wait
    /// timeout elapses, or `cancel` fires; the cancel signal always resolves
    /// the wait as [`AdmissionError::QueueCancelled`], never as a lease.
    pub async fn acquire(
        &self,
        input: AdmissionInput,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Lease, AdmissionError> {
        let config = &self.inner.config;
        if config.max_active == 0 {
            return Err(AdmissionError::QueueFull { waiting: 0 });
        }
        if *cancel.borrow() {
            return Err(AdmissionError::QueueCancelled);
        }

        let (waiter_id, mut rx) = {
            let mut state = self.inner.state.lock();
            if state.active < config.max_active {
                state.active += 1;
                drop(state);
                return Ok(self.grant(input));
            }
            if state.waiters.len() >= config.max_queued {
                return Err(AdmissionError::QueueFull {
                    waiting: state.waiters.len(),
                });
            }
            let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                key: input.key(),
                tx,
            });
            (id, rx)
        };

        let started = tokio::time::Instant::now();
        tokio::select! {
            granted = &mut rx => match granted {
                Ok(()) => Ok(self.grant(input)),
                // Sender dropped: the waiter was withdrawn via cancel_queued.
                Err(_) => Err(AdmissionError::QueueCancelled),
            },
            _ = tokio::time::sleep(config.wait_timeout) => {
                self.abandon_wait(waiter_id, &mut rx);
                Err(AdmissionError::QueueTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
            _ = cancel.changed() => {
                self.abandon_wait(waiter_id, &mut rx);
                Err(AdmissionError::QueueCancelled)
            }
        }
    }

    /// Withdraw a request still waiting for a slot. Returns `true` if a
    /// waiter with this key was found and removed.
    pub fn cancel_queued(&self, key: &RequestKey) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| &w.key != key);
        state.waiters.len() != before
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock();
        QueueSnapshot {
            active: state.active,
            queued: state.waiters.len(),
            config: self.inner.config.clone(),
        }
    }

    fn grant(&self, input: AdmissionInput) -> Lease {
        let lease = Lease {
            id: Uuid::new_v4(),
            key: input.key(),
            queue: self.clone(),
            heartbeat: None,
            released: false,
        };
        tracing::debug!(
            target = "agent_bridge::queue",
            lease = %lease.id,
            key = %lease.key,
            "lease granted"
        );
        lease
    }

    fn abandon_wait(&self, waiter_id: u64, rx: &mut oneshot::Receiver<()>) {
        {
            let mut state = self.inner.state.lock();
            state.waiters.retain(|w| w.id != waiter_id);
        }
        // A grant may have slipped in while we were exiting the wait; if so
        // the slot is counted against us and must go back.
        if rx.try_recv().is_ok() {
            self.release_slot();
        }
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    // A dead receiver means that waiter already timed out or
                    // was cancelled; hand the slot to the next one.
                    if waiter.tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.active = state.active.saturating_sub(1);
                    return;
                }
            }
        }
    }

    fn record_heartbeat(&self, lease_id: Uuid) {
        self.inner
            .state
            .lock()
            .heartbeats
            .insert(lease_id, Instant::now());
    }

    fn clear_heartbeat(&self, lease_id: Uuid) {
        self.inner.state.lock().heartbeats.remove(&lease_id);
    }
}

/// A grant of one execution slot. Must be released exactly once; dropping an
/// unreleased lease returns the slot and logs a warning, so the active count
/// never leaks even on a missed code path.
pub struct Lease {
    id: Uuid,
    key: RequestKey,
    queue: AdmissionQueue,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
    released: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl Lease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Start the liveness heartbeat for this lease. Idempotent; the heartbeat
    /// stops exactly once, at release.
    pub fn start_heartbeat(&mut self, period: Duration) {
        if self.heartbeat.is_some() {
            return;
        }
        let queue = self.queue.clone();
        let lease_id = self.id;
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                queue.record_heartbeat(lease_id);
                tracing::trace!(
                    target = "agent_bridge::queue",
                    lease = %lease_id,
                    "lease heartbeat"
                );
            }
        }));
    }

    pub fn release(&mut self, reason: ReleaseReason) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.queue.clear_heartbeat(self.id);
        self.queue.release_slot();
        tracing::debug!(
            target = "agent_bridge::queue",
            lease = %self.id,
            key = %self.key,
            reason = reason.as_str(),
            "lease released"
        );
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                target = "agent_bridge::queue",
                lease = %self.id,
                key = %self.key,
                "lease dropped without explicit release"
            );
            if let Some(heartbeat) = self.heartbeat.take() {
                heartbeat.abort();
            }
            self.queue.clear_heartbeat(self.id);
            self.queue.release_slot();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::watch;

    use super::{AdmissionError, AdmissionInput, AdmissionQueue, QueueConfig, ReleaseReason};

    fn input(session: &str, request: &str) -> AdmissionInput {
        AdmissionInput {
            agent_id: "agent".into(),
            session_id: session.into(),
            request_id: request.into(),
            process_id: "pid-1".into(),
        }
    }

    fn queue(max_active: usize, max_queued: usize, timeout_ms: u64) -> AdmissionQueue {
        AdmissionQueue::new(QueueConfig {
            max_active,
            wait_timeout: Duration::from_millis(timeout_ms),
            max_queued,
        })
    }

    fn cancel_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn grants_up_to_ceiling() {
        let queue = queue(2, 4, 1_000);
        let (_tx, rx) = cancel_signal();
        let _a = queue.acquire(input("s1", "r1"), rx.clone()).await.unwrap();
        let _b = queue.acquire(input("s2", "r1"), rx).await.unwrap();
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.active, 2);
        assert_eq!(snapshot.queued, 0);
    }

    #[tokio::test]
    async fn zero_ceiling_rejects_immediately() {
        let queue = queue(0, 4, 60_000);
        let (_tx, rx) = cancel_signal();
        let err = queue.acquire(input("s1", "r1"), rx).await.unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull { waiting: 0 });
    }

    #[tokio::test]
    async fn full_wait_queue_rejects_immediately() {
        let queue = queue(1, 1, 60_000);
        let (_tx, rx) = cancel_signal();
        let _held = queue.acquire(input("s1", "r1"), rx.clone()).await.unwrap();

        let q2 = queue.clone();
        let rx2 = rx.clone();
        let waiting = tokio::spawn(async move { q2.acquire(input("s2", "r1"), rx2).await });
        tokio::task::yield_now().await;

        let err = queue.acquire(input("s3", "r1"), rx).await.unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull { waiting: 1 });
        waiting.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_granted_fifo() {
        let queue = queue(1, 4, 60_000);
        let (_tx, rx) = cancel_signal();
        let mut held = queue.acquire(input("s1", "r1"), rx.clone()).await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        for name in ["first", "second"] {
            let q = queue.clone();
            let rx = rx.clone();
            let order = order_tx.clone();
            tokio::spawn(async move {
                let mut lease = q.acquire(input(name, "r1"), rx).await.unwrap();
                order.send(name).unwrap();
                lease.release(ReleaseReason::Done);
            });
            // Ensure deterministic enqueue order.
            tokio::task::yield_now().await;
        }

        held.release(ReleaseReason::Done);
        assert_eq!(order_rx.recv().await, Some("first"));
        assert_eq!(order_rx.recv().await, Some("second"));
        assert_eq!(queue.snapshot().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let queue = queue(1, 4, 5_000);
        let (_tx, rx) = cancel_signal();
        let _held = queue.acquire(input("s1", "r1"), rx.clone()).await.unwrap();

        let err = queue.acquire(input("s2", "r1"), rx).await.unwrap_err();
        match err {
            AdmissionError::QueueTimeout { waited_ms } => assert!(waited_ms >= 5_000),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(queue.snapshot().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_signal_aborts_wait() {
        let queue = queue(1, 4, 60_000);
        let (_hold_tx, hold_rx) = cancel_signal();
        let mut held = queue.acquire(input("s1", "r1"), hold_rx).await.unwrap();

        let (cancel_tx, cancel_rx) = cancel_signal();
        let q = queue.clone();
        let waiting = tokio::spawn(async move { q.acquire(input("s2", "r1"), cancel_rx).await });
        tokio::task::yield_now().await;

        cancel_tx.send(true).unwrap();
        assert_eq!(
            waiting.await.unwrap().unwrap_err(),
            AdmissionError::QueueCancelled
        );

        // The withdrawn waiter must not consume the slot when it frees.
        held.release(ReleaseReason::Done);
        assert_eq!(queue.snapshot().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_queued_removes_waiter() {
        let queue = queue(1, 4, 60_000);
        let (_tx, rx) = cancel_signal();
        let _held = queue.acquire(input("s1", "r1"), rx.clone()).await.unwrap();

        let q = queue.clone();
        let waiting = tokio::spawn(async move { q.acquire(input("s2", "r2"), rx).await });
        tokio::task::yield_now().await;

        assert!(queue.cancel_queued(&input("s2", "r2").key()));
        assert_eq!(
            waiting.await.unwrap().unwrap_err(),
            AdmissionError::QueueCancelled
        );
        assert!(!queue.cancel_queued(&input("s2", "r2").key()));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let queue = queue(1, 4, 1_000);
        let (_tx, rx) = cancel_signal();
        let mut lease = queue.acquire(input("s1", "r1"), rx).await.unwrap();
        lease.release(ReleaseReason::Done);
        lease.release(ReleaseReason::Error);
        assert_eq!(queue.snapshot().active, 0);
    }

    #[tokio::test]
    async fn randomized_release_order_conserves_slots() {
        use rand::{seq::SliceRandom, Rng};

        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let queue = queue(4, 8, 60_000);
            let (_tx, rx) = cancel_signal();
            let mut leases = Vec::new();
            for i in 0..4 {
                leases.push(
                    queue
                        .acquire(input("s", &format!("r{i}")), rx.clone())
                        .await
                        .unwrap(),
                );
            }
            assert_eq!(queue.snapshot().active, 4);

            leases.shuffle(&mut rng);
            for mut lease in leases {
                match rng.gen_range(0..5) {
                    0 => lease.release(ReleaseReason::Done),
                    1 => lease.release(ReleaseReason::Error),
                    2 => lease.release(ReleaseReason::Cancel),
                    3 => {
                        lease.release(ReleaseReason::Shutdown);
                        // A second release must not free the slot twice.
                        lease.release(ReleaseReason::Done);
                    }
                    // Dropped without a release; the Drop impl returns the
                    // slot.
                    _ => {}
                }
            }
            assert_eq!(queue.snapshot().active, 0);
            assert_eq!(queue.snapshot().queued, 0);
        }
    }

    #[tokio::test]
    async fn dropped_lease_returns_slot() {
        let queue = queue(1, 4, 1_000);
        let (_tx, rx) = cancel_signal();
        let lease = queue.acquire(input("s1", "r1"), rx.clone()).await.unwrap();
        drop(lease);
        // Slot must be reusable without any explicit release.
        let mut again = queue.acquire(input("s1", "r2"), rx).await.unwrap();
        again.release(ReleaseReason::Done);
        assert_eq!(queue.snapshot().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn released_lease_wakes_waiter_once() {
        let queue = queue(1, 4, 60_000);
        let (_tx, rx) = cancel_signal();
        let mut held = queue.acquire(input("s1", "r1"), rx.clone()).await.unwrap();
        held.start_heartbeat(Duration::from_secs(15));

        let q = queue.clone();
        let waiting = tokio::spawn(async move { q.acquire(input("s2", "r1"), rx).await });
        tokio::task::yield_now().await;

        held.release(ReleaseReason::Done);
        let mut lease = waiting.await.unwrap().unwrap();
        assert_eq!(queue.snapshot().active, 1);
        lease.release(ReleaseReason::Done);
        assert_eq!(queue.snapshot().active, 0);
    }
}
