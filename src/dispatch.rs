//! Per-request admission/execution state, owned exclusively by the
//! orchestrator.
//!
//! A dispatch exists from the moment a message is accepted until its terminal
//! transition: `Queued -> Leased/Executing -> Released`, or
//! `Queued -> Cancelled -> Released`, or `Queued -> Rejected -> Released`.
//! Teardown is guarded so the lease release and heartbeat stop happen exactly
//! once even when two terminal paths race (e.g. done arriving just as
//! shutdown sweeps all dispatches).

use std::collections::HashMap;

use tokio::sync::watch;

use crate::{
    adapter::OutgoingTurn,
    protocol::RequestKey,
    queue::{AdmissionInput, Lease, ReleaseReason},
};

#[derive(Debug)]
pub struct RequestDispatch {
    pub input: AdmissionInput,
    /// The inbound turn, held until a lease is granted and the session send
    /// happens.
    pub turn: OutgoingTurn,
    cancel_tx: watch::Sender<bool>,
    lease: Option<Lease>,
    cancelled: bool,
    cleaned: bool,
}

impl RequestDispatch {
    pub fn new(input: AdmissionInput, turn: OutgoingTurn) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            input,
            turn,
            cancel_tx,
            lease: None,
            cancelled: false,
            cleaned: false,
        }
    }

    pub fn key(&self) -> RequestKey {
        self.input.key()
    }

    /// A fresh receiver for the cancel signal. A receiver subscribed after
    /// [`fire_cancel`](Self::fire_cancel) still observes `true` immediately.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Signal cooperative cancellation to whatever is waiting on admission.
    /// `send_replace` updates the value even while no receiver is subscribed
    /// yet, so a later [`subscribe`](Self::subscribe) still observes it.
    pub fn fire_cancel(&mut self) {
        self.cancelled = true;
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn attach_lease(&mut self, lease: Lease) {
        debug_assert!(self.lease.is_none(), "dispatch already holds a lease");
        self.lease = Some(lease);
    }

    pub fn lease_mut(&mut self) -> Option<&mut Lease> {
        self.lease.as_mut()
    }

    pub fn has_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// Idempotent teardown. The first call releases the held lease (which
    /// stops its heartbeat) and returns `true`; every later call is a no-op.
    pub fn cleanup(&mut self, reason: ReleaseReason) -> bool {
        if self.cleaned {
            return false;
        }
        self.cleaned = true;
        if let Some(mut lease) = self.lease.take() {
            lease.release(reason);
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct DispatchTable {
    map: HashMap<RequestKey, RequestDispatch>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dispatch: RequestDispatch) {
        self.map.insert(dispatch.key(), dispatch);
    }

    pub fn get_mut(&mut self, key: &RequestKey) -> Option<&mut RequestDispatch> {
        self.map.get_mut(key)
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &RequestKey) -> Option<RequestDispatch> {
        self.map.remove(key)
    }

    pub fn drain(&mut self) -> Vec<RequestDispatch> {
        self.map.drain().map(|(_, dispatch)| dispatch).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
