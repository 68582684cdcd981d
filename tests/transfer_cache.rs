//! Tier lifecycle tests for the transfer cache, driven on a paused clock.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Notify};

use agent_bridge::{
    protocol::TransferOffer,
    transfer::{
        SenderFactory, SignalDisposition, SignalOut, TransferCache, TransferConfig, TransferError,
        TransferSender, TransferSignal, TransferTier,
    },
};

/// Factory whose senders record every signal they handle. The first
/// construction (registration) completes immediately; later ones (revivals)
/// block until the test opens the gate, so signals can be queued mid-revival.
/// A sender built by `completing` reports a finished pickup when it sees the
/// named signal type.
#[derive(Clone)]
struct RecordingFactory {
    signals: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    revival_gate: Arc<Notify>,
    complete_on: Option<String>,
}

impl RecordingFactory {
    fn new() -> Self {
        Self {
            signals: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
            revival_gate: Arc::new(Notify::new()),
            complete_on: None,
        }
    }

    fn completing(signal_type: &str) -> Self {
        Self {
            complete_on: Some(signal_type.to_string()),
            ..Self::new()
        }
    }

    fn sender(&self) -> RecordingSender {
        RecordingSender {
            signals: self.signals.clone(),
            closed: self.closed.clone(),
            complete_on: self.complete_on.clone(),
        }
    }
}

struct RecordingSender {
    signals: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
    complete_on: Option<String>,
}

impl TransferSender for RecordingSender {
    async fn handle_signal(
        &mut self,
        signal: TransferSignal,
    ) -> Result<SignalDisposition, TransferError> {
        let done = self.complete_on.as_deref() == Some(signal.signal_type.as_str());
        self.signals.lock().push(signal.signal_type);
        if done {
            Ok(SignalDisposition::Complete)
        } else {
            Ok(SignalDisposition::Continue)
        }
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl SenderFactory for RecordingFactory {
    type Sender = RecordingSender;

    async fn create_sender(
        &self,
        _offer: &TransferOffer,
        _bytes: Vec<u8>,
        _signals: SignalOut,
    ) -> Result<RecordingSender, TransferError> {
        if self.created.fetch_add(1, Ordering::SeqCst) > 0 {
            self.revival_gate.notified().await;
        }
        Ok(self.sender())
    }

    async fn create_receiver(
        &self,
        _transfer_id: &str,
        _signals: SignalOut,
    ) -> Result<RecordingSender, TransferError> {
        Ok(self.sender())
    }
}

fn offer(id: &str) -> TransferOffer {
    TransferOffer {
        transfer_id: id.into(),
        size: 5,
        sha256: "feed".into(),
        file_count: 1,
    }
}

fn signal(kind: &str) -> TransferSignal {
    TransferSignal {
        signal_type: kind.into(),
        payload: json!({}),
        from_agent_id: "caller".into(),
    }
}

fn cache(dir: &std::path::Path, factory: RecordingFactory) -> TransferCache<RecordingFactory> {
    let (outbound, _rx) = mpsc::channel(16);
    TransferCache::new(
        TransferConfig {
            active_ttl: Duration::from_secs(300),
            dormant_ttl: Duration::from_secs(3600),
            cache_dir: dir.to_path_buf(),
        },
        factory,
        outbound,
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn active_transfer_goes_dormant_then_expires() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::new();
    let cache = cache(dir.path(), factory);
    let disk_path = cache.cache_path("t1");

    cache.register(offer("t1"), b"bytes".to_vec(), "caller").await.unwrap();
    assert_eq!(cache.tier_of("t1"), Some(TransferTier::Active));
    wait_until(|| disk_path.exists()).await;

    tokio::time::sleep(Duration::from_secs(301)).await;
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("t1") == Some(TransferTier::Dormant)).await;
    assert!(disk_path.exists());

    tokio::time::sleep(Duration::from_secs(3601)).await;
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("t1").is_none()).await;
    wait_until(|| !disk_path.exists()).await;
}

#[tokio::test(start_paused = true)]
async fn revival_replays_queued_signals_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::new();
    let cache = cache(dir.path(), factory.clone());
    let disk_path = cache.cache_path("t1");

    cache.register(offer("t1"), b"bytes".to_vec(), "caller").await.unwrap();
    wait_until(|| disk_path.exists()).await;
    tokio::time::sleep(Duration::from_secs(301)).await;
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("t1") == Some(TransferTier::Dormant)).await;

    // First signal starts the revival; the factory gate holds it open while
    // two more signals arrive and queue up.
    cache.route_signal("t1", signal("offer"));
    assert_eq!(cache.tier_of("t1"), Some(TransferTier::Reviving));
    cache.route_signal("t1", signal("ice-1"));
    cache.route_signal("t1", signal("ice-2"));
    assert!(factory.signals.lock().is_empty());

    factory.revival_gate.notify_one();
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("t1") == Some(TransferTier::Active)).await;

    let recorded = factory.signals.clone();
    wait_until(move || recorded.lock().len() == 3).await;
    assert_eq!(
        *factory.signals.lock(),
        vec!["offer".to_string(), "ice-1".into(), "ice-2".into()]
    );
}

#[tokio::test(start_paused = true)]
async fn revived_transfer_is_deleted_after_second_active_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::new();
    let cache = cache(dir.path(), factory.clone());
    let disk_path = cache.cache_path("t1");

    cache.register(offer("t1"), b"bytes".to_vec(), "caller").await.unwrap();
    wait_until(|| disk_path.exists()).await;
    tokio::time::sleep(Duration::from_secs(301)).await;
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("t1") == Some(TransferTier::Dormant)).await;

    cache.route_signal("t1", signal("offer"));
    factory.revival_gate.notify_one();
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("t1") == Some(TransferTier::Active)).await;

    // A revived transfer gets no second dormancy: the next active ttl
    // deletes it outright.
    tokio::time::sleep(Duration::from_secs(301)).await;
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("t1").is_none()).await;
    wait_until(|| !disk_path.exists()).await;

    // A signal for the deleted transfer is dropped, not revived.
    cache.route_signal("t1", signal("ice-late"));
    assert_eq!(cache.tier_of("t1"), None);
}

#[tokio::test(start_paused = true)]
async fn inbound_receiver_never_goes_dormant() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::new();
    let cache = cache(dir.path(), factory.clone());

    cache.register_inbound("up1", "caller").await.unwrap();
    assert_eq!(cache.tier_of("up1"), Some(TransferTier::Active));
    cache.route_signal("up1", signal("offer"));
    let recorded = factory.signals.clone();
    wait_until(move || recorded.lock().len() == 1).await;

    tokio::time::sleep(Duration::from_secs(301)).await;
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("up1").is_none()).await;
    assert!(!cache.cache_path("up1").exists());
}

#[tokio::test(start_paused = true)]
async fn cleanup_all_closes_senders_and_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::new();
    let cache = cache(dir.path(), factory.clone());
    let disk_path = cache.cache_path("t1");

    cache.register(offer("t1"), b"bytes".to_vec(), "caller").await.unwrap();
    wait_until(|| disk_path.exists()).await;

    cache.cleanup_all().await;
    assert_eq!(cache.tier_of("t1"), None);
    assert!(!disk_path.exists());
    let closed = factory.closed.clone();
    wait_until(move || closed.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn cleanup_during_revival_leaves_no_disk_file() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::new();
    let cache = cache(dir.path(), factory.clone());
    let disk_path = cache.cache_path("t1");

    cache.register(offer("t1"), b"bytes".to_vec(), "caller").await.unwrap();
    wait_until(|| disk_path.exists()).await;
    tokio::time::sleep(Duration::from_secs(301)).await;
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("t1") == Some(TransferTier::Dormant)).await;

    // Start a revival and hold it open at the factory gate, then tear the
    // cache down underneath it.
    cache.route_signal("t1", signal("offer"));
    let created = factory.created.clone();
    wait_until(move || created.load(Ordering::SeqCst) == 2).await;
    cache.cleanup_all().await;
    assert_eq!(cache.tier_of("t1"), None);

    // The late sender finds its entry gone; it must be closed and the disk
    // copy must not survive the race.
    factory.revival_gate.notify_one();
    let closed = factory.closed.clone();
    wait_until(move || closed.load(Ordering::SeqCst) == 2).await;
    wait_until(|| !disk_path.exists()).await;
}

#[tokio::test(start_paused = true)]
async fn completed_pickup_deletes_transfer_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let factory = RecordingFactory::completing("bye");
    let cache = cache(dir.path(), factory.clone());
    let disk_path = cache.cache_path("t1");

    cache.register(offer("t1"), b"bytes".to_vec(), "caller").await.unwrap();
    wait_until(|| disk_path.exists()).await;

    cache.route_signal("t1", signal("ice-1"));
    cache.route_signal("t1", signal("bye"));
    let tier_cache = cache.clone();
    wait_until(move || tier_cache.tier_of("t1").is_none()).await;
    wait_until(|| !disk_path.exists()).await;
    let closed = factory.closed.clone();
    wait_until(move || closed.load(Ordering::SeqCst) == 1).await;

    // A signal after the pickup completed hits a deleted transfer.
    cache.route_signal("t1", signal("ice-late"));
    assert_eq!(cache.tier_of("t1"), None);
}
