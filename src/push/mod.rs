//! Push subscriber -- keeps the entity store in step with server-pushed
//! threat level changes.
//!
//! The subscriber owns one background task per connection generation:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected (error) -> ...
//! ```
//!
//! A failed open or a broken stream schedules a reconnect after the policy's
//! delay, up to `max_attempts` consecutive failures; a successful open resets
//! the counter. [`PushSubscriber::disconnect`] (also run on drop) cancels the
//! task and fences off any callback still running from the old generation.

pub mod frame;
pub mod sse;

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::model::{parse_push_message, AnomalyPatch, PushFrame, PushParseError, ThreatLevelChangeEvent};
use crate::store::EntityStore;

pub use self::sse::SseTransport;

/// Stream of raw message payloads from one open channel. An `Err` item, or
/// the end of the stream, is the channel's error signal.
pub type PushStream = BoxStream<'static, Result<String, ClientError>>;

/// Invoked with every accepted threat level change, after the store merge.
pub type ThreatChangeCallback = Arc<dyn Fn(&ThreatLevelChangeEvent) + Send + Sync>;

/// Opens the one-directional push channel.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self) -> Result<PushStream, ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(3000),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observable subscriber status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Reconnects are exhausted; the subscriber stays disconnected until
    /// [`PushSubscriber::connect`] is called again.
    pub exhausted: bool,
}

impl PushStatus {
    fn idle() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            exhausted: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Dropped and still trying, i.e. the "Reconnecting..." indicator.
    pub fn is_reconnecting(&self) -> bool {
        !self.exhausted && self.reconnect_attempts > 0 && !self.is_connected()
    }
}

struct ActiveSubscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Long-lived push subscription bound to one store.
pub struct PushSubscriber {
    transport: Arc<dyn PushTransport>,
    store: EntityStore,
    policy: ReconnectPolicy,
    callback: Arc<RwLock<Option<ThreatChangeCallback>>>,
    status: Arc<watch::Sender<PushStatus>>,
    /// Generation of the subscription allowed to act. Held while merging so
    /// that no write from a replaced generation lands after `disconnect`.
    current: Arc<Mutex<u64>>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl PushSubscriber {
    pub fn new(transport: Arc<dyn PushTransport>, store: EntityStore, policy: ReconnectPolicy) -> Self {
        let (status, _rx) = watch::channel(PushStatus::idle());
        Self {
            transport,
            store,
            policy,
            callback: Arc::new(RwLock::new(None)),
            status: Arc::new(status),
            current: Arc::new(Mutex::new(0)),
            active: Mutex::new(None),
        }
    }

    pub fn status(&self) -> PushStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn watch_status(&self) -> watch::Receiver<PushStatus> {
        self.status.subscribe()
    }

    /// Swap the threat change callback. Takes effect for the next event,
    /// including on an already open channel.
    ///
    /// The callback runs under the subscription fence: once `disconnect`
    /// returns it is never invoked again. It must not call `connect` or
    /// `disconnect` itself.
    pub fn set_callback(&self, callback: Option<ThreatChangeCallback>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Start (or restart) the subscription. Any previous generation is torn
    /// down first. Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let generation = self.retire_current();
        let cancel = CancellationToken::new();

        let worker = Worker {
            generation,
            transport: Arc::clone(&self.transport),
            store: self.store.clone(),
            policy: self.policy,
            callback: Arc::clone(&self.callback),
            status: Arc::clone(&self.status),
            current: Arc::clone(&self.current),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        *self.active.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(ActiveSubscription { cancel, task });
        debug!(generation, "push subscription started");
    }

    /// Cancel any pending reconnect, close the open channel and reset the
    /// attempt counter. Idempotent.
    pub fn disconnect(&self) {
        self.retire_current();
        debug!("push subscription stopped");
    }

    /// Fence off the running generation and stop its task. Returns the
    /// generation number now allowed to act.
    fn retire_current(&self) -> u64 {
        let generation = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            *current += 1;
            *current
        };

        if let Some(active) = self.active.lock().unwrap_or_else(PoisonError::into_inner).take() {
            active.cancel.cancel();
            active.task.abort();
        }

        self.status.send_replace(PushStatus::idle());
        generation
    }
}

impl Drop for PushSubscriber {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

enum StreamEnd {
    Cancelled,
    Failed(ClientError),
}

struct Worker {
    generation: u64,
    transport: Arc<dyn PushTransport>,
    store: EntityStore,
    policy: ReconnectPolicy,
    callback: Arc<RwLock<Option<ThreatChangeCallback>>>,
    status: Arc<watch::Sender<PushStatus>>,
    current: Arc<Mutex<u64>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let mut attempts: u32 = 0;

        loop {
            self.publish(ConnectionState::Connecting, attempts, false);

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                opened = self.transport.open() => opened,
            };

            let error = match opened {
                Ok(stream) => {
                    attempts = 0;
                    self.publish(ConnectionState::Connected, attempts, false);
                    info!(generation = self.generation, "push channel connected");
                    match self.pump(stream).await {
                        StreamEnd::Cancelled => return,
                        StreamEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            if self.cancel.is_cancelled() {
                return;
            }

            if attempts >= self.policy.max_attempts {
                warn!(
                    error = %error,
                    attempts,
                    "push channel lost, reconnect attempts exhausted"
                );
                self.publish(ConnectionState::Disconnected, attempts, true);
                return;
            }

            attempts += 1;
            warn!(
                error = %error,
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                delay_ms = self.policy.delay.as_millis() as u64,
                "push channel lost, scheduling reconnect"
            );
            self.publish(ConnectionState::Disconnected, attempts, false);

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
        }
    }

    async fn pump(&self, mut stream: PushStream) -> StreamEnd {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(data)) => self.handle_message(&data),
                Some(Err(e)) => return StreamEnd::Failed(e),
                None => return StreamEnd::Failed(ClientError::transport("event stream closed by server")),
            }
        }
    }

    fn handle_message(&self, data: &str) {
        let event = match parse_push_message(data) {
            Ok(PushFrame::ThreatLevelChange(event)) => event,
            Ok(PushFrame::Connected { message }) => {
                debug!(%message, "push channel acknowledged");
                return;
            }
            Ok(PushFrame::Info { message }) => {
                debug!(%message, "push info frame");
                return;
            }
            Err(e @ PushParseError::InvalidJson(_)) => {
                warn!(error = %e, "failed to parse push message");
                return;
            }
            Err(e) => {
                debug!(error = %e, "ignoring push message");
                return;
            }
        };

        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // Merge and callback both run under the generation fence.
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != self.generation {
            return;
        }
        self.store
            .update_one(&event.anomaly_id, &AnomalyPatch::threat_level(event.new_threat_level));
        debug!(
            anomaly_id = %event.anomaly_id,
            threat_level = %event.new_threat_level,
            "merged threat level change"
        );
        if let Some(callback) = callback {
            callback(&event);
        }
    }

    /// Publish status, unless this generation has been replaced.
    fn publish(&self, state: ConnectionState, reconnect_attempts: u32, exhausted: bool) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != self.generation {
            return;
        }
        self.status.send_replace(PushStatus {
            state,
            reconnect_attempts,
            exhausted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Anomaly, AnomalyStatus, ThreatLevel};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn anomaly(id: &str, level: ThreatLevel) -> Anomaly {
        Anomaly {
            id: id.into(),
            name: format!("Anomaly {}", id),
            threat_level: level,
            location: "Asakusa".into(),
            status: AnomalyStatus::Active,
        }
    }

    /// Every open fails.
    #[derive(Default)]
    struct RefusingTransport {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl PushTransport for RefusingTransport {
        async fn open(&self) -> Result<PushStream, ClientError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::transport("connection refused"))
        }
    }

    /// Each open hands out a stream fed by a sender the test receives.
    struct ScriptedTransport {
        opens: AtomicUsize,
        senders: mpsc::UnboundedSender<mpsc::UnboundedSender<Result<String, ClientError>>>,
    }

    impl ScriptedTransport {
        fn new() -> (
            Self,
            mpsc::UnboundedReceiver<mpsc::UnboundedSender<Result<String, ClientError>>>,
        ) {
            let (senders, rx) = mpsc::unbounded_channel();
            (
                Self {
                    opens: AtomicUsize::new(0),
                    senders,
                },
                rx,
            )
        }
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn open(&self) -> Result<PushStream, ClientError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = self.senders.send(tx);
            Ok(Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)))
        }
    }

    fn policy(delay_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(delay_ms),
            max_attempts,
        }
    }

    async fn wait_connected(sub: &PushSubscriber) {
        let mut rx = sub.watch_status();
        rx.wait_for(|s| s.is_connected()).await.unwrap();
    }

    /// Wait until the store reaches `version`.
    async fn wait_version(store: &EntityStore, version: u64) {
        let mut rx = store.subscribe();
        rx.wait_for(|snap| snap.version >= version).await.unwrap();
    }

    #[tokio::test]
    async fn test_threat_change_merged_and_callback_invoked() {
        let store = EntityStore::with_anomalies(vec![anomaly("1", ThreatLevel::Low)]);
        let (transport, mut channels) = ScriptedTransport::new();
        let sub = PushSubscriber::new(Arc::new(transport), store.clone(), ReconnectPolicy::default());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        sub.set_callback(Some(Arc::new(move |ev: &ThreatLevelChangeEvent| {
            let _ = seen_tx.send(ev.clone());
        })));

        sub.connect();
        let tx = channels.recv().await.unwrap();
        wait_connected(&sub).await;

        let version = store.version();
        tx.send(Ok(r#"{"type":"threat_level_change","anomalyId":"1","newThreatLevel":"critical"}"#.into()))
            .unwrap();
        wait_version(&store, version + 1).await;

        let one = store.find("1").unwrap();
        assert_eq!(one.threat_level, ThreatLevel::Critical);
        assert_eq!(one.status, AnomalyStatus::Active);

        let ev = seen_rx.recv().await.unwrap();
        assert_eq!(ev.anomaly_id, "1");
        assert_eq!(ev.new_threat_level, ThreatLevel::Critical);
    }

    #[tokio::test]
    async fn test_malformed_messages_leave_store_untouched() {
        let store = EntityStore::with_anomalies(vec![anomaly("1", ThreatLevel::Low)]);
        let before = store.snapshot();
        let (transport, mut channels) = ScriptedTransport::new();
        let sub = PushSubscriber::new(Arc::new(transport), store.clone(), ReconnectPolicy::default());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        sub.set_callback(Some(Arc::new(move |ev: &ThreatLevelChangeEvent| {
            let _ = seen_tx.send(ev.clone());
        })));

        sub.connect();
        let tx = channels.recv().await.unwrap();
        wait_connected(&sub).await;

        for junk in [
            "{not json",
            r#"{"type":"threat_level_change","anomalyId":"1","newThreatLevel":"apocalyptic"}"#,
            r#"{"type":"threat_level_change","newThreatLevel":"high"}"#,
            r#"{"type":"heartbeat"}"#,
            r#"{"type":"connected","message":"Connected to anomaly stream"}"#,
            r#"{"type":"info","message":"No active anomalies"}"#,
        ] {
            tx.send(Ok(junk.to_string())).unwrap();
        }
        // A valid event for an unknown id is accepted but changes nothing.
        tx.send(Ok(r#"{"type":"threat_level_change","anomalyId":"404","newThreatLevel":"high"}"#.into()))
            .unwrap();

        // The callback fires after everything before it was processed.
        let ev = seen_rx.recv().await.unwrap();
        assert_eq!(ev.anomaly_id, "404");

        assert_eq!(store.snapshot(), before);
        assert!(sub.is_connected());
    }

    #[tokio::test]
    async fn test_callback_can_be_swapped() {
        let store = EntityStore::with_anomalies(vec![anomaly("1", ThreatLevel::Low)]);
        let (transport, mut channels) = ScriptedTransport::new();
        let sub = PushSubscriber::new(Arc::new(transport), store.clone(), ReconnectPolicy::default());

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        {
            let first = first.clone();
            let done_tx = done_tx.clone();
            sub.set_callback(Some(Arc::new(move |_: &ThreatLevelChangeEvent| {
                first.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            })));
        }
        sub.connect();
        let tx = channels.recv().await.unwrap();
        wait_connected(&sub).await;

        let msg = r#"{"type":"threat_level_change","anomalyId":"1","newThreatLevel":"medium"}"#;
        tx.send(Ok(msg.into())).unwrap();
        done_rx.recv().await.unwrap();

        {
            let second = second.clone();
            sub.set_callback(Some(Arc::new(move |_: &ThreatLevelChangeEvent| {
                second.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            })));
        }
        tx.send(Ok(msg.into())).unwrap();
        done_rx.recv().await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_bound_stops_scheduling() {
        let store = EntityStore::new();
        let transport = Arc::new(RefusingTransport::default());
        let sub = PushSubscriber::new(transport.clone(), store, policy(100, 2));

        let mut status = sub.watch_status();
        sub.connect();
        status.wait_for(|s| s.exhausted).await.unwrap();

        // Initial open plus two reconnects.
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);

        let s = sub.status();
        assert_eq!(s.state, ConnectionState::Disconnected);
        assert_eq!(s.reconnect_attempts, 2);
        assert!(!s.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_attempts() {
        let store = EntityStore::new();
        let (transport, mut channels) = ScriptedTransport::new();
        let transport = Arc::new(transport);
        let sub = PushSubscriber::new(transport.clone(), store, policy(100, 1));
        let mut status = sub.watch_status();

        sub.connect();
        for round in 1..=3 {
            let tx = channels.recv().await.unwrap();
            status.wait_for(|s| s.is_connected()).await.unwrap();
            assert_eq!(sub.status().reconnect_attempts, 0);

            // Break the channel; with max_attempts = 1 this only recovers
            // because the previous open reset the counter.
            tx.send(Err(ClientError::transport("reset by peer"))).unwrap();
            status.wait_for(|s| !s.is_connected()).await.unwrap();
            assert_eq!(sub.status().reconnect_attempts, 1, "round {}", round);
            assert!(sub.status().is_reconnecting());
        }
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let store = EntityStore::new();
        let transport = Arc::new(RefusingTransport::default());
        let sub = PushSubscriber::new(transport.clone(), store, policy(1_000, 10));
        let mut status = sub.watch_status();

        sub.connect();
        status.wait_for(|s| s.reconnect_attempts == 1).await.unwrap();
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);

        sub.disconnect();
        sub.disconnect();
        assert_eq!(sub.status(), PushStatus::idle());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_store_writes_after_disconnect() {
        let store = EntityStore::with_anomalies(vec![anomaly("1", ThreatLevel::Low)]);
        let (transport, mut channels) = ScriptedTransport::new();
        let sub = PushSubscriber::new(Arc::new(transport), store.clone(), ReconnectPolicy::default());

        sub.connect();
        let tx = channels.recv().await.unwrap();
        wait_connected(&sub).await;

        sub.disconnect();
        let before = store.snapshot();

        // The old channel may still be alive; whatever it delivers is fenced off.
        let _ = tx.send(Ok(r#"{"type":"threat_level_change","anomalyId":"1","newThreatLevel":"critical"}"#.into()));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.snapshot(), before);
        assert!(!sub.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_generation() {
        let store = EntityStore::with_anomalies(vec![anomaly("1", ThreatLevel::Low)]);
        let (transport, mut channels) = ScriptedTransport::new();
        let sub = PushSubscriber::new(Arc::new(transport), store.clone(), ReconnectPolicy::default());

        sub.connect();
        let stale = channels.recv().await.unwrap();
        wait_connected(&sub).await;

        sub.connect();
        let fresh = channels.recv().await.unwrap();
        wait_connected(&sub).await;

        let _ = stale.send(Ok(r#"{"type":"threat_level_change","anomalyId":"1","newThreatLevel":"critical"}"#.into()));
        let version = store.version();
        fresh
            .send(Ok(r#"{"type":"threat_level_change","anomalyId":"1","newThreatLevel":"medium"}"#.into()))
            .unwrap();
        wait_version(&store, version + 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.find("1").unwrap().threat_level, ThreatLevel::Medium);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_waits_for_running_callback() {
        let store = EntityStore::with_anomalies(vec![anomaly("1", ThreatLevel::Low)]);
        let (transport, mut channels) = ScriptedTransport::new();
        let sub = PushSubscriber::new(Arc::new(transport), store.clone(), ReconnectPolicy::default());

        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        {
            let calls = Arc::clone(&calls);
            let finished = Arc::clone(&finished);
            sub.set_callback(Some(Arc::new(move |_ev: &ThreatLevelChangeEvent| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = entered_tx.send(());
                std::thread::sleep(Duration::from_millis(100));
                finished.store(true, Ordering::SeqCst);
            })));
        }

        sub.connect();
        let tx = channels.recv().await.unwrap();
        wait_connected(&sub).await;

        tx.send(Ok(r#"{"type":"threat_level_change","anomalyId":"1","newThreatLevel":"high"}"#.into()))
            .unwrap();
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // The callback is mid-flight; disconnect cannot slip in before it ends.
        sub.disconnect();
        assert!(finished.load(Ordering::SeqCst));

        let _ = tx.send(Ok(r#"{"type":"threat_level_change","anomalyId":"1","newThreatLevel":"critical"}"#.into()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.find("1").unwrap().threat_level, ThreatLevel::High);
    }
}
