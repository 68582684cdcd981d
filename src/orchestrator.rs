//! The single-writer event loop at the heart of the bridge.
//!
//! Every piece of mutable request/session state (replay tracker, dispatch
//! table, session pool, executing-order queues) is owned by one task running
//! [`Orchestrator::run`]. Relay frames, admission outcomes, and backend
//! session events all arrive on channels and are applied sequentially, so no
//! handler ever observes a half-applied transition. Slow work (waiting for an
//! admission slot, running a backend turn) happens in spawned tasks that
//! report back through the same channels.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    adapter::{
        AdapterError, AgentAdapter, DonePayload, OutgoingTurn, SessionEnvelope, SessionEvent,
        SessionEventSender, SessionHandle,
    },
    dispatch::{DispatchTable, RequestDispatch},
    protocol::{Attachment, ErrorCode, RelayInbound, RelayOutbound, RequestKey, TransferOffer},
    queue::{
        AdmissionError, AdmissionInput, AdmissionQueue, Lease, QueueConfig, ReleaseReason,
    },
    replay::{ReplayTracker, RequestStatus},
    session::SessionPool,
    transfer::{SenderFactory, TransferCache, TransferConfig, TransferSignal},
};

/// Idle TTLs below this are clamped up; a session must survive at least one
/// heartbeat-scale gap between turns.
const SESSION_IDLE_FLOOR: Duration = Duration::from_secs(30);

/// Signal type reserved for announcing an inbound (caller-to-agent) upload
/// ahead of the chat message that references it.
const PREPARE_UPLOAD: &str = "prepare-upload";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub agent_id: String,
    pub queue: QueueConfig,
    pub replay_ttl: Duration,
    pub replay_max_entries: usize,
    pub session_idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_period: Duration,
    pub transfer: TransferConfig,
}

/// Everything the orchestrator task reacts to.
#[derive(Debug)]
pub enum OrchestratorEvent {
    Relay(RelayInbound),
    LeaseOutcome {
        key: RequestKey,
        outcome: Result<Lease, AdmissionError>,
    },
    Shutdown,
}

pub struct Orchestrator<A: AgentAdapter, F: SenderFactory> {
    config: OrchestratorConfig,
    adapter: A,
    process_id: String,
    outbound: mpsc::Sender<RelayOutbound>,
    events_tx: mpsc::Sender<OrchestratorEvent>,
    events_rx: mpsc::Receiver<OrchestratorEvent>,
    session_tx: mpsc::UnboundedSender<SessionEnvelope>,
    session_rx: mpsc::UnboundedReceiver<SessionEnvelope>,
    sessions: SessionPool<A::Handle>,
    /// Per-session FIFO of requests whose turn was sent but not yet answered.
    /// The backend answers sends in order, so the front entry is the one any
    /// chunk or terminal event belongs to.
    executing: HashMap<String, VecDeque<RequestKey>>,
    /// Per-session FIFO of requests that have not finished admission yet.
    /// Only the front entry of each session has a live admission wait, so two
    /// requests of one session can never reach the backend out of arrival
    /// order when free slots race.
    pending_admission: HashMap<String, VecDeque<RequestKey>>,
    replay: ReplayTracker,
    queue: AdmissionQueue,
    dispatches: DispatchTable,
    transfers: TransferCache<F>,
}

impl<A: AgentAdapter, F: SenderFactory> Orchestrator<A, F> {
    pub fn new(
        mut config: OrchestratorConfig,
        adapter: A,
        factory: F,
        outbound: mpsc::Sender<RelayOutbound>,
    ) -> (Self, mpsc::Sender<OrchestratorEvent>) {
        if config.session_idle_ttl < SESSION_IDLE_FLOOR {
            tracing::warn!(
                target = "agent_bridge::orchestrator",
                requested_secs = config.session_idle_ttl.as_secs(),
                floor_secs = SESSION_IDLE_FLOOR.as_secs(),
                "session idle ttl below floor; clamping"
            );
            config.session_idle_ttl = SESSION_IDLE_FLOOR;
        }

        let (events_tx, events_rx) = mpsc::channel(256);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let transfers = TransferCache::new(config.transfer.clone(), factory, outbound.clone());
        let queue = AdmissionQueue::new(config.queue.clone());
        let replay = ReplayTracker::new(config.replay_ttl, config.replay_max_entries);

        let orchestrator = Self {
            config,
            adapter,
            process_id: std::process::id().to_string(),
            outbound,
            events_tx: events_tx.clone(),
            events_rx,
            session_tx,
            session_rx,
            sessions: SessionPool::new(),
            executing: HashMap::new(),
            pending_admission: HashMap::new(),
            replay,
            queue,
            dispatches: DispatchTable::new(),
            transfers,
        };
        (orchestrator, events_tx)
    }

    /// Run until a `Shutdown` event arrives or every event sender is gone,
    /// then tear everything down.
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        sweep.tick().await;

        tracing::info!(
            target = "agent_bridge::orchestrator",
            agent = %self.config.agent_id,
            max_active = self.config.queue.max_active,
            "orchestrator running"
        );

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(OrchestratorEvent::Relay(frame)) => self.handle_relay(frame).await,
                    Some(OrchestratorEvent::LeaseOutcome { key, outcome }) => {
                        self.handle_lease_outcome(key, outcome).await;
                    }
                    Some(OrchestratorEvent::Shutdown) | None => break,
                },
                envelope = self.session_rx.recv() => {
                    // The orchestrator keeps its own session_tx clone, so this
                    // channel never closes while we run.
                    if let Some(envelope) = envelope {
                        self.handle_session_event(envelope).await;
                    }
                }
                _ = sweep.tick() => self.handle_sweep().await,
            }
        }

        self.shutdown().await;
    }

    async fn handle_relay(&mut self, frame: RelayInbound) {
        match frame {
            RelayInbound::Message {
                session_id,
                request_id,
                content,
                attachments,
                client_id,
                with_files,
            } => {
                self.handle_message(
                    session_id,
                    request_id,
                    OutgoingTurn {
                        content,
                        attachments,
                        client_id,
                        with_files,
                    },
                )
                .await;
            }
            RelayInbound::Cancel {
                session_id,
                request_id,
            } => self.handle_cancel(&session_id, &request_id).await,
            RelayInbound::RtcSignalRelay {
                transfer_id,
                from_agent_id,
                signal_type,
                payload,
            } => {
                self.handle_signal(transfer_id, from_agent_id, signal_type, payload)
                    .await;
            }
        }
    }

    async fn handle_message(&mut self, session_id: String, request_id: String, turn: OutgoingTurn) {
        let now = tokio::time::Instant::now().into_std();
        self.replay.sweep(now);

        if session_id.is_empty() || request_id.is_empty() {
            self.emit_error(
                &RequestKey::new(session_id, request_id),
                ErrorCode::InvalidMessage,
                "message is missing a session or request id",
            )
            .await;
            return;
        }

        let key = RequestKey::new(session_id.clone(), request_id.clone());
        if !self.replay.record_active(&key, now) {
            let status = self.replay.status_of(&key);
            tracing::debug!(
                target = "agent_bridge::orchestrator",
                key = %key,
                status = status.map(RequestStatus::as_str).unwrap_or("unknown"),
                "replayed request dropped"
            );
            return;
        }

        let input = AdmissionInput {
            agent_id: self.config.agent_id.clone(),
            session_id,
            request_id,
            process_id: self.process_id.clone(),
        };
        self.dispatches.insert(RequestDispatch::new(input, turn));

        let session_id = key.session_id.clone();
        let is_front = {
            let pending = self.pending_admission.entry(session_id.clone()).or_default();
            pending.push_back(key);
            pending.len() == 1
        };
        if is_front {
            self.pump_admission(&session_id);
        }
    }

    /// Start the admission wait for the front pending request of
    /// `session_id`, skipping entries whose dispatch was already torn down.
    fn pump_admission(&mut self, session_id: &str) {
        loop {
            let Some(front) = self
                .pending_admission
                .get(session_id)
                .and_then(|queue| queue.front())
                .cloned()
            else {
                self.pending_admission.remove(session_id);
                return;
            };
            let Some(dispatch) = self.dispatches.get_mut(&front) else {
                if let Some(queue) = self.pending_admission.get_mut(session_id) {
                    queue.pop_front();
                }
                continue;
            };

            let input = dispatch.input.clone();
            let cancel_rx = dispatch.subscribe();
            let queue = self.queue.clone();
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                let key = input.key();
                let outcome = queue.acquire(input, cancel_rx).await;
                // If the loop is already gone the event (and any lease in it)
                // is dropped; the lease Drop impl returns the slot.
                let _ = events
                    .send(OrchestratorEvent::LeaseOutcome { key, outcome })
                    .await;
            });
            return;
        }
    }

    /// Drop `key` from its session's pending-admission queue once its
    /// admission wait has resolved.
    fn pop_pending(&mut self, key: &RequestKey) {
        let Some(queue) = self.pending_admission.get_mut(&key.session_id) else {
            return;
        };
        if queue.front() == Some(key) {
            queue.pop_front();
        } else {
            queue.retain(|k| k != key);
        }
        if queue.is_empty() {
            self.pending_admission.remove(&key.session_id);
        }
    }

    async fn handle_lease_outcome(&mut self, key: RequestKey, outcome: Result<Lease, AdmissionError>) {
        self.pop_pending(&key);
        // The next same-session request starts its wait now; its outcome
        // lands behind this one in the event queue, preserving send order.
        self.pump_admission(&key.session_id);

        let Some(mut dispatch) = self.dispatches.remove(&key) else {
            // The dispatch was torn down (session teardown, shutdown) while
            // the admission task was reporting back.
            if let Ok(mut lease) = outcome {
                tracing::warn!(
                    target = "agent_bridge::orchestrator",
                    key = %key,
                    "lease granted to a vanished dispatch; returning slot"
                );
                lease.release(ReleaseReason::Shutdown);
            }
            return;
        };

        let lease = match outcome {
            Ok(lease) => lease,
            Err(AdmissionError::QueueCancelled) => {
                dispatch.cleanup(ReleaseReason::Cancel);
                self.replay.mark_terminal(&key, RequestStatus::Cancelled);
                if dispatch.is_cancelled() {
                    self.emit_error(
                        &key,
                        ErrorCode::SessionNotFound,
                        "request cancelled before execution",
                    )
                    .await;
                } else {
                    self.emit_error(&key, ErrorCode::InternalError, "admission wait aborted")
                        .await;
                }
                return;
            }
            Err(error) => {
                dispatch.cleanup(ReleaseReason::Error);
                self.replay.mark_terminal(&key, RequestStatus::Error);
                self.emit_error(&key, ErrorCode::AgentBusy, error.to_string())
                    .await;
                return;
            }
        };

        if dispatch.is_cancelled() {
            // Cancel raced the grant: the slot was never used.
            dispatch.attach_lease(lease);
            dispatch.cleanup(ReleaseReason::Cancel);
            self.replay.mark_terminal(&key, RequestStatus::Cancelled);
            self.emit_error(
                &key,
                ErrorCode::SessionNotFound,
                "request cancelled before execution",
            )
            .await;
            return;
        }

        dispatch.attach_lease(lease);
        if let Some(lease) = dispatch.lease_mut() {
            lease.start_heartbeat(self.config.heartbeat_period);
        }

        if let Err(error) = self.ensure_session(&key.session_id).await {
            dispatch.cleanup(ReleaseReason::Error);
            self.replay.mark_terminal(&key, RequestStatus::Error);
            self.emit_error(&key, ErrorCode::AdapterCrash, error.to_string())
                .await;
            return;
        }

        let turn = dispatch.turn.clone();
        let send_result = match self.sessions.get_mut(&key.session_id) {
            Some(session) => session.handle.send(turn).await,
            None => Err(AdapterError::SendFailed(
                "session missing after creation".into(),
            )),
        };

        match send_result {
            Ok(()) => {
                self.sessions
                    .touch(&key.session_id, tokio::time::Instant::now());
                self.executing
                    .entry(key.session_id.clone())
                    .or_default()
                    .push_back(key.clone());
                self.dispatches.insert(dispatch);
                tracing::debug!(
                    target = "agent_bridge::orchestrator",
                    key = %key,
                    "turn dispatched to backend"
                );
            }
            Err(error) => {
                dispatch.cleanup(ReleaseReason::Error);
                self.replay.mark_terminal(&key, RequestStatus::Error);
                self.teardown_session(&key.session_id).await;
                self.emit_error(&key, ErrorCode::AdapterCrash, error.to_string())
                    .await;
            }
        }
    }

    /// Create the session for `session_id` if it is not pooled, tearing down
    /// any sibling sessions of the same logical conversation first.
    async fn ensure_session(&mut self, session_id: &str) -> Result<(), AdapterError> {
        if self.sessions.contains(session_id) {
            return Ok(());
        }

        for sibling in self.sessions.logical_siblings(session_id) {
            tracing::info!(
                target = "agent_bridge::orchestrator",
                session = %sibling,
                replacement = %session_id,
                "tearing down superseded logical session"
            );
            self.teardown_session(&sibling).await;
        }

        let events = SessionEventSender::new(session_id, self.session_tx.clone());
        let handle = self.adapter.create_session(session_id, events).await?;
        self.sessions
            .insert(session_id, handle, tokio::time::Instant::now());
        tracing::info!(
            target = "agent_bridge::orchestrator",
            session = %session_id,
            pooled = self.sessions.len(),
            "session created"
        );
        Ok(())
    }

    async fn handle_session_event(&mut self, envelope: SessionEnvelope) {
        let SessionEnvelope { session_id, event } = envelope;
        match event {
            SessionEvent::Chunk { delta } => {
                self.emit_chunk(&session_id, delta, None, None, None).await;
            }
            SessionEvent::ToolEvent {
                tool_name,
                tool_call_id,
                delta,
            } => {
                self.emit_chunk(
                    &session_id,
                    delta,
                    Some("tool".into()),
                    Some(tool_name),
                    Some(tool_call_id),
                )
                .await;
            }
            SessionEvent::Done { payload } => {
                self.finish_request(&session_id, Ok(payload.unwrap_or_default()))
                    .await;
            }
            SessionEvent::Error { message } => {
                self.finish_request(&session_id, Err(message)).await;
            }
        }
    }

    async fn emit_chunk(
        &mut self,
        session_id: &str,
        delta: String,
        kind: Option<String>,
        tool_name: Option<String>,
        tool_call_id: Option<String>,
    ) {
        let Some(key) = self
            .executing
            .get(session_id)
            .and_then(|queue| queue.front())
            .cloned()
        else {
            tracing::warn!(
                target = "agent_bridge::orchestrator",
                session = %session_id,
                "chunk with no executing request dropped"
            );
            return;
        };
        self.sessions.touch(session_id, tokio::time::Instant::now());
        self.send_outbound(RelayOutbound::Chunk {
            session_id: key.session_id,
            request_id: key.request_id,
            delta,
            kind,
            tool_name,
            tool_call_id,
        })
        .await;
    }

    /// Close out the oldest unanswered request of `session_id` with a terminal
    /// frame. `outcome` carries the done payload or the backend error text.
    async fn finish_request(&mut self, session_id: &str, outcome: Result<DonePayload, String>) {
        let key = match self.executing.get_mut(session_id) {
            Some(queue) => {
                let key = queue.pop_front();
                if queue.is_empty() {
                    self.executing.remove(session_id);
                }
                key
            }
            None => None,
        };
        let Some(key) = key else {
            tracing::warn!(
                target = "agent_bridge::orchestrator",
                session = %session_id,
                "terminal event with no executing request dropped"
            );
            return;
        };
        let Some(mut dispatch) = self.dispatches.remove(&key) else {
            tracing::warn!(
                target = "agent_bridge::orchestrator",
                key = %key,
                "terminal event for an untracked request dropped"
            );
            return;
        };

        self.sessions.touch(session_id, tokio::time::Instant::now());

        match outcome {
            Ok(payload) => {
                dispatch.cleanup(ReleaseReason::Done);
                self.replay.mark_terminal(&key, RequestStatus::Done);

                let offer = match payload.file_bytes {
                    Some(bytes) if !bytes.is_empty() => {
                        self.register_offer(&dispatch, bytes, payload.file_count)
                            .await
                    }
                    _ => None,
                };

                let attachments: Option<Vec<Attachment>> = if payload.attachments.is_empty() {
                    None
                } else {
                    Some(payload.attachments)
                };
                self.send_outbound(RelayOutbound::Done {
                    session_id: key.session_id.clone(),
                    request_id: key.request_id.clone(),
                    attachments,
                    file_transfer_offer: offer,
                    result: payload.result,
                })
                .await;
                tracing::debug!(
                    target = "agent_bridge::orchestrator",
                    key = %key,
                    "request done"
                );
            }
            Err(message) => {
                dispatch.cleanup(ReleaseReason::Error);
                self.replay.mark_terminal(&key, RequestStatus::Error);
                self.emit_error(&key, ErrorCode::AdapterCrash, message).await;
            }
        }
    }

    /// Put completed-turn file bytes into the transfer cache and build the
    /// offer advertised in the done frame. A cache failure downgrades the
    /// response to a plain done; the turn itself still succeeded.
    async fn register_offer(
        &mut self,
        dispatch: &RequestDispatch,
        bytes: Vec<u8>,
        file_count: u32,
    ) -> Option<TransferOffer> {
        let offer = TransferOffer {
            transfer_id: Uuid::new_v4().to_string(),
            size: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(&bytes)),
            file_count: file_count.max(1),
        };
        let target = dispatch
            .turn
            .client_id
            .clone()
            .unwrap_or_else(|| "caller".to_string());
        match self.transfers.register(offer.clone(), bytes, &target).await {
            Ok(()) => Some(offer),
            Err(error) => {
                tracing::warn!(
                    target = "agent_bridge::orchestrator",
                    transfer = %offer.transfer_id,
                    error = %error,
                    "failed to register transfer offer; done frame sent without it"
                );
                None
            }
        }
    }

    async fn handle_cancel(&mut self, session_id: &str, request_id: &str) {
        let key = RequestKey::new(session_id, request_id);
        match self.replay.status_of(&key) {
            Some(RequestStatus::Active) => {}
            status => {
                tracing::debug!(
                    target = "agent_bridge::orchestrator",
                    key = %key,
                    status = status.map(RequestStatus::as_str).unwrap_or("unknown"),
                    "cancel for a non-active request ignored"
                );
                return;
            }
        }

        let leased = match self.dispatches.get_mut(&key) {
            Some(dispatch) => {
                if !dispatch.has_lease() {
                    // Still waiting for admission: fire the cooperative signal
                    // and pull the waiter out of the queue. The terminal frame
                    // is emitted when the admission task reports back.
                    dispatch.fire_cancel();
                    self.queue.cancel_queued(&key);
                    tracing::debug!(
                        target = "agent_bridge::orchestrator",
                        key = %key,
                        "queued request cancelled"
                    );
                    return;
                }
                true
            }
            None => false,
        };
        if !leased {
            tracing::debug!(
                target = "agent_bridge::orchestrator",
                key = %key,
                "cancel for an untracked request ignored"
            );
            return;
        }

        // Executing: the backend gives us no mid-turn interrupt, so the whole
        // session is torn down and later events for it are dropped.
        let Some(mut dispatch) = self.dispatches.remove(&key) else {
            return;
        };
        dispatch.cleanup(ReleaseReason::Cancel);
        self.replay.mark_terminal(&key, RequestStatus::Cancelled);
        if let Some(queue) = self.executing.get_mut(session_id) {
            queue.retain(|k| k != &key);
            if queue.is_empty() {
                self.executing.remove(session_id);
            }
        }
        tracing::info!(
            target = "agent_bridge::orchestrator",
            key = %key,
            "executing request cancelled; tearing down its session"
        );
        self.teardown_session(session_id).await;
    }

    async fn handle_signal(
        &mut self,
        transfer_id: String,
        from_agent_id: String,
        signal_type: String,
        payload: serde_json::Value,
    ) {
        if signal_type == PREPARE_UPLOAD {
            if let Err(error) = self
                .transfers
                .register_inbound(&transfer_id, &from_agent_id)
                .await
            {
                tracing::warn!(
                    target = "agent_bridge::orchestrator",
                    transfer = %transfer_id,
                    error = %error,
                    "failed to register inbound transfer"
                );
            }
            return;
        }
        self.transfers.route_signal(
            &transfer_id,
            TransferSignal {
                signal_type,
                payload,
                from_agent_id,
            },
        );
    }

    async fn handle_sweep(&mut self) {
        self.replay.sweep(tokio::time::Instant::now().into_std());

        let now = tokio::time::Instant::now();
        for session_id in self.sessions.idle_ids(now, self.config.session_idle_ttl) {
            // A session with unanswered sends is busy no matter how old its
            // last event is.
            if self.executing.contains_key(&session_id) {
                continue;
            }
            tracing::info!(
                target = "agent_bridge::orchestrator",
                session = %session_id,
                idle_secs = self.config.session_idle_ttl.as_secs(),
                "pruning idle session"
            );
            self.teardown_session(&session_id).await;
        }
    }

    /// Kill and remove one pooled session. Requests still executing on it are
    /// closed out as cancelled so their leases return and the caller learns
    /// the session is gone.
    async fn teardown_session(&mut self, session_id: &str) {
        if let Some(mut handle) = self.sessions.remove(session_id) {
            handle.kill().await;
        }
        self.adapter.destroy_session(session_id).await;

        let Some(keys) = self.executing.remove(session_id) else {
            return;
        };
        for key in keys {
            if let Some(mut dispatch) = self.dispatches.remove(&key) {
                dispatch.cleanup(ReleaseReason::Cancel);
            }
            self.replay.mark_terminal(&key, RequestStatus::Cancelled);
            self.emit_error(
                &key,
                ErrorCode::SessionNotFound,
                "session torn down before completion",
            )
            .await;
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!(
            target = "agent_bridge::orchestrator",
            dispatches = self.dispatches.len(),
            sessions = self.sessions.len(),
            "orchestrator shutting down"
        );
        for mut dispatch in self.dispatches.drain() {
            dispatch.cleanup(ReleaseReason::Shutdown);
        }
        for (session_id, mut handle) in self.sessions.drain() {
            handle.kill().await;
            self.adapter.destroy_session(&session_id).await;
        }
        self.executing.clear();
        self.pending_admission.clear();
        self.transfers.cleanup_all().await;
    }

    async fn emit_error(&self, key: &RequestKey, code: ErrorCode, message: impl Into<String>) {
        self.send_outbound(RelayOutbound::Error {
            session_id: key.session_id.clone(),
            request_id: key.request_id.clone(),
            code,
            message: message.into(),
        })
        .await;
    }

    async fn send_outbound(&self, frame: RelayOutbound) {
        if self.outbound.send(frame).await.is_err() {
            tracing::debug!(
                target = "agent_bridge::orchestrator",
                "relay connection gone; dropping outbound frame"
            );
        }
    }
}
