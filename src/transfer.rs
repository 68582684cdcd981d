//! Three-tier cache for file-transfer offers.
//!
//! A registered offer starts **Active** (live sender in memory) while its
//! bytes are persisted to disk best-effort. After the active TTL the sender is
//! discarded and the disk copy becomes authoritative (**Dormant**). A signal
//! for a dormant transfer revives it: the disk copy is read back, a fresh
//! sender is constructed, and queued signals are replayed in arrival order. A
//! transfer is revived at most once; when a revived transfer's active TTL
//! elapses it is deleted outright. A sender reporting a finished pickup
//! short-circuits all of that: the entry and its disk copy are deleted on the
//! spot. Tier transitions are driven entirely by cancellable timer tasks, so
//! tests can simulate time.
//!
//! Inbound receivers (registered by a `prepare-upload` signal before the chat
//! message referencing them arrives) live in the Active tier only: they are
//! never persisted and are deleted when their active TTL elapses.

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol::{RelayOutbound, TransferOffer};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer cache i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("sender construction failed: {0}")]
    CreateFailed(String),
}

/// One peer-to-peer signal routed through the relay for a transfer.
#[derive(Debug, Clone)]
pub struct TransferSignal {
    pub signal_type: String,
    pub payload: Value,
    pub from_agent_id: String,
}

/// Outbound signal path for one sender, pre-addressed to the transfer's
/// counterparty. Wired at sender construction.
#[derive(Clone)]
pub struct SignalOut {
    transfer_id: String,
    target_agent_id: String,
    tx: mpsc::Sender<RelayOutbound>,
}

impl SignalOut {
    pub async fn emit(&self, signal_type: impl Into<String>, payload: Value) {
        let frame = RelayOutbound::RtcSignal {
            transfer_id: self.transfer_id.clone(),
            target_agent_id: self.target_agent_id.clone(),
            signal_type: signal_type.into(),
            payload,
        };
        if self.tx.send(frame).await.is_err() {
            tracing::debug!(
                target = "agent_bridge::transfer",
                transfer = %self.transfer_id,
                "relay connection gone; dropping outbound signal"
            );
        }
    }
}

/// What a sender wants done with its transfer after handling a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// Keep the transfer alive; more signals may follow.
    Continue,
    /// The counterparty finished the pickup; delete the transfer now.
    Complete,
}

/// The peer-to-peer sender/receiver object. The cache only needs signal
/// delivery, a completion report, and teardown; ICE/SDP mechanics live behind
/// this trait.
pub trait TransferSender: Send + 'static {
    fn handle_signal(
        &mut self,
        signal: TransferSignal,
    ) -> impl Future<Output = Result<SignalDisposition, TransferError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub trait SenderFactory: Send + Sync + 'static {
    type Sender: TransferSender;

    /// Construct an outbound sender holding `bytes` for pickup.
    fn create_sender(
        &self,
        offer: &TransferOffer,
        bytes: Vec<u8>,
        signals: SignalOut,
    ) -> impl Future<Output = Result<Self::Sender, TransferError>> + Send;

    /// Construct an inbound (caller-to-agent) receiver.
    fn create_receiver(
        &self,
        transfer_id: &str,
        signals: SignalOut,
    ) -> impl Future<Output = Result<Self::Sender, TransferError>> + Send;
}

/// Stand-in factory used until a real peer-to-peer transport is plugged in:
/// senders log every signal and emit none, so offers still age through the
/// tiers normally.
#[derive(Debug, Clone, Default)]
pub struct NullSenderFactory;

pub struct NullSender {
    transfer_id: String,
}

impl TransferSender for NullSender {
    async fn handle_signal(
        &mut self,
        signal: TransferSignal,
    ) -> Result<SignalDisposition, TransferError> {
        tracing::debug!(
            target = "agent_bridge::transfer",
            transfer = %self.transfer_id,
            signal_type = %signal.signal_type,
            from = %signal.from_agent_id,
            "null sender discarding signal"
        );
        Ok(SignalDisposition::Continue)
    }

    async fn close(&mut self) {}
}

impl SenderFactory for NullSenderFactory {
    type Sender = NullSender;

    async fn create_sender(
        &self,
        offer: &TransferOffer,
        _bytes: Vec<u8>,
        _signals: SignalOut,
    ) -> Result<NullSender, TransferError> {
        Ok(NullSender {
            transfer_id: offer.transfer_id.clone(),
        })
    }

    async fn create_receiver(
        &self,
        transfer_id: &str,
        _signals: SignalOut,
    ) -> Result<NullSender, TransferError> {
        Ok(NullSender {
            transfer_id: transfer_id.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub active_ttl: Duration,
    pub dormant_ttl: Duration,
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferTier {
    Active,
    Dormant,
    Reviving,
}

enum SenderCmd {
    Signal(TransferSignal),
    Close,
}

struct ActiveEntry {
    cmds: mpsc::UnboundedSender<SenderCmd>,
    timer: JoinHandle<()>,
    offer: Option<TransferOffer>,
    target_agent_id: String,
    disk_path: Option<PathBuf>,
    revived: bool,
    inbound: bool,
}

struct DormantEntry {
    offer: TransferOffer,
    target_agent_id: String,
    disk_path: PathBuf,
    timer: JoinHandle<()>,
}

struct RevivingEntry {
    queued: Vec<TransferSignal>,
}

enum Tier {
    Active(ActiveEntry),
    Dormant(DormantEntry),
    Reviving(RevivingEntry),
}

struct CacheInner<F> {
    config: TransferConfig,
    factory: F,
    outbound: mpsc::Sender<RelayOutbound>,
    entries: Mutex<HashMap<String, Tier>>,
}

pub struct TransferCache<F: SenderFactory> {
    inner: Arc<CacheInner<F>>,
}

impl<F: SenderFactory> Clone for TransferCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: SenderFactory> TransferCache<F> {
    pub fn new(config: TransferConfig, factory: F, outbound: mpsc::Sender<RelayOutbound>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                factory,
                outbound,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register an outbound offer. Constructs the live sender and kicks off a
    /// best-effort background persist of the bytes; a failed disk write is
    /// logged, not fatal, and the in-memory copy stays authoritative until its
    /// active TTL expires.
    pub async fn register(
        &self,
        offer: TransferOffer,
        bytes: Vec<u8>,
        target_agent_id: &str,
    ) -> Result<(), TransferError> {
        let transfer_id = offer.transfer_id.clone();
        let disk_bytes = bytes.clone();
        let signals = self.signal_out(&transfer_id, target_agent_id);
        let sender = self
            .inner
            .factory
            .create_sender(&offer, bytes, signals)
            .await?;
        let cmds = self.spawn_sender_task(&transfer_id, sender);

        {
            let mut entries = self.inner.entries.lock();
            entries.insert(
                transfer_id.clone(),
                Tier::Active(ActiveEntry {
                    cmds,
                    timer: self.spawn_active_timer(&transfer_id),
                    offer: Some(offer),
                    target_agent_id: target_agent_id.to_string(),
                    disk_path: None,
                    revived: false,
                    inbound: false,
                }),
            );
        }

        let cache = self.clone();
        let path = self.cache_path(&transfer_id);
        let dir = self.inner.config.cache_dir.clone();
        tokio::spawn(async move {
            let write = async {
                tokio::fs::create_dir_all(&dir).await?;
                tokio::fs::write(&path, &disk_bytes).await
            };
            match write.await {
                Ok(()) => cache.mark_persisted(&transfer_id, path),
                Err(error) => {
                    tracing::warn!(
                        target = "agent_bridge::transfer",
                        transfer = %transfer_id,
                        error = %error,
                        "failed to persist transfer bytes; memory copy stays authoritative"
                    );
                }
            }
        });

        Ok(())
    }

    /// Register an inbound receiver ahead of the chat message that references
    /// it (the reserved `prepare-upload` signal). Active tier only.
    pub async fn register_inbound(
        &self,
        transfer_id: &str,
        from_agent_id: &str,
    ) -> Result<(), TransferError> {
        if self.inner.entries.lock().contains_key(transfer_id) {
            tracing::debug!(
                target = "agent_bridge::transfer",
                transfer = %transfer_id,
                "prepare-upload for already-known transfer ignored"
            );
            return Ok(());
        }

        let signals = self.signal_out(transfer_id, from_agent_id);
        let receiver = self.inner.factory.create_receiver(transfer_id, signals).await?;
        let cmds = self.spawn_sender_task(transfer_id, receiver);

        let mut entries = self.inner.entries.lock();
        entries.insert(
            transfer_id.to_string(),
            Tier::Active(ActiveEntry {
                cmds,
                timer: self.spawn_active_timer(transfer_id),
                offer: None,
                target_agent_id: from_agent_id.to_string(),
                disk_path: None,
                revived: false,
                inbound: true,
            }),
        );
        Ok(())
    }

    /// Route an incoming peer-to-peer signal to the right tier. Signals for
    /// unknown (already-deleted) transfers are dropped with a debug log;
    /// signals arriving mid-revival are queued and replayed in arrival order
    /// against the freshly revived sender.
    pub fn route_signal(&self, transfer_id: &str, signal: TransferSignal) {
        let mut entries = self.inner.entries.lock();

        if matches!(entries.get(transfer_id), Some(Tier::Dormant(_))) {
            let Some(Tier::Dormant(dormant)) = entries.remove(transfer_id) else {
                unreachable!("entry matched Dormant above");
            };
            dormant.timer.abort();
            entries.insert(
                transfer_id.to_string(),
                Tier::Reviving(RevivingEntry {
                    queued: vec![signal],
                }),
            );
            drop(entries);

            tracing::debug!(
                target = "agent_bridge::transfer",
                transfer = %transfer_id,
                "reviving dormant transfer"
            );
            let cache = self.clone();
            let transfer_id = transfer_id.to_string();
            tokio::spawn(async move {
                cache
                    .finish_revival(
                        &transfer_id,
                        dormant.offer,
                        dormant.target_agent_id,
                        dormant.disk_path,
                    )
                    .await;
            });
            return;
        }

        match entries.get_mut(transfer_id) {
            Some(Tier::Active(entry)) => {
                if entry.cmds.send(SenderCmd::Signal(signal)).is_err() {
                    tracing::warn!(
                        target = "agent_bridge::transfer",
                        transfer = %transfer_id,
                        "sender task gone; dropping signal"
                    );
                }
            }
            Some(Tier::Reviving(entry)) => {
                entry.queued.push(signal);
            }
            Some(Tier::Dormant(_)) => unreachable!("handled above"),
            None => {
                tracing::debug!(
                    target = "agent_bridge::transfer",
                    transfer = %transfer_id,
                    signal_type = %signal.signal_type,
                    "signal for unknown transfer dropped"
                );
            }
        }
    }

    /// Close every sender, delete every disk copy, abandon any in-flight
    /// revival. Nothing survives into the next process.
    pub async fn cleanup_all(&self) {
        let drained: Vec<(String, Tier)> = self.inner.entries.lock().drain().collect();
        let mut paths = Vec::new();
        for (transfer_id, tier) in drained {
            match tier {
                Tier::Active(entry) => {
                    entry.timer.abort();
                    let _ = entry.cmds.send(SenderCmd::Close);
                    if let Some(path) = entry.disk_path {
                        paths.push(path);
                    }
                }
                Tier::Dormant(entry) => {
                    entry.timer.abort();
                    paths.push(entry.disk_path);
                }
                // The revival task finds its entry gone and closes the fresh
                // sender itself; queued signals are dropped. The disk copy is
                // removed here as well in case that task never gets that far.
                Tier::Reviving(_) => {
                    paths.push(self.cache_path(&transfer_id));
                }
            }
        }
        for path in paths {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    pub fn tier_of(&self, transfer_id: &str) -> Option<TransferTier> {
        self.inner
            .entries
            .lock()
            .get(transfer_id)
            .map(|tier| match tier {
                Tier::Active(_) => TransferTier::Active,
                Tier::Dormant(_) => TransferTier::Dormant,
                Tier::Reviving(_) => TransferTier::Reviving,
            })
    }

    pub fn cache_path(&self, transfer_id: &str) -> PathBuf {
        self.inner.config.cache_dir.join(sanitize_id(transfer_id))
    }

    fn signal_out(&self, transfer_id: &str, target_agent_id: &str) -> SignalOut {
        SignalOut {
            transfer_id: transfer_id.to_string(),
            target_agent_id: target_agent_id.to_string(),
            tx: self.inner.outbound.clone(),
        }
    }

    fn spawn_active_timer(&self, transfer_id: &str) -> JoinHandle<()> {
        let cache = self.clone();
        let transfer_id = transfer_id.to_string();
        let ttl = self.inner.config.active_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            cache.on_active_expired(&transfer_id);
        })
    }

    fn spawn_dormant_timer(&self, transfer_id: &str) -> JoinHandle<()> {
        let cache = self.clone();
        let transfer_id = transfer_id.to_string();
        let ttl = self.inner.config.dormant_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            cache.on_dormant_expired(&transfer_id);
        })
    }

    fn on_active_expired(&self, transfer_id: &str) {
        let mut entries = self.inner.entries.lock();
        let Some(Tier::Active(entry)) = entries.remove(transfer_id) else {
            return;
        };
        let _ = entry.cmds.send(SenderCmd::Close);

        if entry.inbound || entry.revived {
            // Inbound receivers are never dormanted; a revived transfer gets
            // exactly one second life.
            drop(entries);
            if let Some(path) = entry.disk_path {
                tokio::spawn(async move {
                    let _ = tokio::fs::remove_file(&path).await;
                });
            }
            tracing::debug!(
                target = "agent_bridge::transfer",
                transfer = %transfer_id,
                "active ttl elapsed; transfer deleted"
            );
            return;
        }

        match (entry.offer, entry.disk_path) {
            (Some(offer), Some(disk_path)) => {
                entries.insert(
                    transfer_id.to_string(),
                    Tier::Dormant(DormantEntry {
                        offer,
                        target_agent_id: entry.target_agent_id,
                        disk_path,
                        timer: self.spawn_dormant_timer(transfer_id),
                    }),
                );
                tracing::debug!(
                    target = "agent_bridge::transfer",
                    transfer = %transfer_id,
                    "active ttl elapsed; transfer dormant"
                );
            }
            _ => {
                tracing::warn!(
                    target = "agent_bridge::transfer",
                    transfer = %transfer_id,
                    "active ttl elapsed with no disk copy; transfer deleted"
                );
            }
        }
    }

    fn on_dormant_expired(&self, transfer_id: &str) {
        let mut entries = self.inner.entries.lock();
        let Some(Tier::Dormant(entry)) = entries.remove(transfer_id) else {
            return;
        };
        drop(entries);
        tokio::spawn(async move {
            let _ = tokio::fs::remove_file(&entry.disk_path).await;
        });
        tracing::debug!(
            target = "agent_bridge::transfer",
            transfer = %transfer_id,
            "dormant ttl elapsed; transfer deleted"
        );
    }

    fn mark_persisted(&self, transfer_id: &str, path: PathBuf) {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(transfer_id) {
            Some(Tier::Active(entry)) if !entry.inbound => {
                entry.disk_path = Some(path);
            }
            // The transfer finished or expired before the write landed; the
            // file is an orphan now.
            _ => {
                tokio::spawn(async move {
                    let _ = tokio::fs::remove_file(&path).await;
                });
            }
        }
    }

    async fn finish_revival(
        &self,
        transfer_id: &str,
        offer: TransferOffer,
        target_agent_id: String,
        disk_path: PathBuf,
    ) {
        let revived = async {
            let bytes = tokio::fs::read(&disk_path).await?;
            let signals = self.signal_out(transfer_id, &target_agent_id);
            self.inner.factory.create_sender(&offer, bytes, signals).await
        }
        .await;

        let sender = match revived {
            Ok(sender) => sender,
            Err(error) => {
                tracing::warn!(
                    target = "agent_bridge::transfer",
                    transfer = %transfer_id,
                    error = %error,
                    "revival failed; transfer deleted"
                );
                self.inner.entries.lock().remove(transfer_id);
                let _ = tokio::fs::remove_file(&disk_path).await;
                return;
            }
        };

        let orphaned = {
            let mut entries = self.inner.entries.lock();
            match entries.remove(transfer_id) {
                Some(Tier::Reviving(entry)) => {
                    let cmds = self.spawn_sender_task(transfer_id, sender);
                    for signal in entry.queued {
                        let _ = cmds.send(SenderCmd::Signal(signal));
                    }
                    entries.insert(
                        transfer_id.to_string(),
                        Tier::Active(ActiveEntry {
                            cmds,
                            timer: self.spawn_active_timer(transfer_id),
                            offer: Some(offer),
                            target_agent_id,
                            disk_path: Some(disk_path),
                            revived: true,
                            inbound: false,
                        }),
                    );
                    tracing::debug!(
                        target = "agent_bridge::transfer",
                        transfer = %transfer_id,
                        "transfer revived"
                    );
                    None
                }
                // cleanup_all ran while we were reading the disk copy; the
                // fresh sender and the disk bytes both die here.
                other => {
                    debug_assert!(other.is_none());
                    Some((sender, disk_path))
                }
            }
        };

        if let Some((mut sender, path)) = orphaned {
            sender.close().await;
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    fn spawn_sender_task(&self, transfer_id: &str, mut sender: F::Sender) -> mpsc::UnboundedSender<SenderCmd> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cache = self.clone();
        let transfer_id = transfer_id.to_string();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    SenderCmd::Signal(signal) => match sender.handle_signal(signal).await {
                        Ok(SignalDisposition::Continue) => {}
                        Ok(SignalDisposition::Complete) => {
                            cache.on_pickup_complete(&transfer_id);
                            break;
                        }
                        Err(error) => {
                            tracing::warn!(
                                target = "agent_bridge::transfer",
                                transfer = %transfer_id,
                                error = %error,
                                "sender rejected signal"
                            );
                        }
                    },
                    SenderCmd::Close => break,
                }
            }
            sender.close().await;
        });
        tx
    }

    /// The counterparty confirmed a finished pickup. The entry and any disk
    /// copy go away now instead of aging out through the tiers.
    fn on_pickup_complete(&self, transfer_id: &str) {
        let disk_path = match self.inner.entries.lock().remove(transfer_id) {
            Some(Tier::Active(entry)) => {
                entry.timer.abort();
                entry.disk_path
            }
            // A queued completion can land after the active timer already
            // moved the entry dormant.
            Some(Tier::Dormant(entry)) => {
                entry.timer.abort();
                Some(entry.disk_path)
            }
            Some(Tier::Reviving(_)) | None => None,
        };
        if let Some(path) = disk_path {
            tokio::spawn(async move {
                let _ = tokio::fs::remove_file(&path).await;
            });
        }
        tracing::debug!(
            target = "agent_bridge::transfer",
            transfer = %transfer_id,
            "pickup complete; transfer deleted"
        );
    }
}

/// Opportunistic removal of cache files left by a previous process that
/// terminated uncleanly. Nothing in the cache assumes these files exist or
/// are consistent.
pub async fn sweep_disk(dir: &Path) {
    let mut removed = 0usize;
    let Ok(mut read_dir) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false)
            && tokio::fs::remove_file(entry.path()).await.is_ok()
        {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(
            target = "agent_bridge::transfer",
            dir = %dir.display(),
            removed,
            "swept orphaned transfer cache files"
        );
    }
}

fn sanitize_id(transfer_id: &str) -> String {
    transfer_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
