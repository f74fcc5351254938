//! Client wiring -- one store shared by the fetch gateway, the capture
//! coordinator and the push subscriber.
//!
//! Collaborators are passed in explicitly; nothing is resolved from ambient
//! context.

use std::sync::Arc;

use tracing::info;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::gateway::{AnomalyApi, HttpGateway};
use crate::model::ThreatLevelChangeEvent;
use crate::mutation::{CaptureCoordinator, CaptureOutcome};
use crate::notify::{NotificationKind, NotificationSink};
use crate::push::{ConnectionState, PushStatus, PushSubscriber, PushTransport, ReconnectPolicy, SseTransport};
use crate::store::EntityStore;

pub struct Dashboard {
    store: EntityStore,
    api: Arc<dyn AnomalyApi>,
    coordinator: CaptureCoordinator,
    subscriber: PushSubscriber,
}

impl Dashboard {
    /// Build an HTTP-backed dashboard from client configuration.
    pub fn new(config: &ClientConfig, sink: Arc<dyn NotificationSink>) -> Result<Self, ClientError> {
        let api = Arc::new(HttpGateway::new(&config.base_url, config.request_timeout())?);
        let transport = Arc::new(SseTransport::new(&config.base_url, config.request_timeout())?);
        Ok(Self::with_parts(api, transport, sink, config.reconnect_policy()))
    }

    pub fn with_parts(
        api: Arc<dyn AnomalyApi>,
        transport: Arc<dyn PushTransport>,
        sink: Arc<dyn NotificationSink>,
        policy: ReconnectPolicy,
    ) -> Self {
        let store = EntityStore::new();
        let coordinator = CaptureCoordinator::new(store.clone(), Arc::clone(&api), Arc::clone(&sink));
        let subscriber = PushSubscriber::new(transport, store.clone(), policy);

        subscriber.set_callback(Some(Arc::new(move |event: &ThreatLevelChangeEvent| {
            let kind = if event.new_threat_level.is_elevated() {
                NotificationKind::Warning
            } else {
                NotificationKind::Info
            };
            sink.notify(kind, &threat_change_message(event));
        })));

        Self {
            store,
            api,
            coordinator,
            subscriber,
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn coordinator(&self) -> &CaptureCoordinator {
        &self.coordinator
    }

    pub fn subscriber(&self) -> &PushSubscriber {
        &self.subscriber
    }

    /// Open the push channel and populate the store with an initial fetch.
    /// The channel stays up even if the fetch fails.
    pub async fn mount(&self) -> Result<(), ClientError> {
        self.subscriber.connect();
        self.refresh().await
    }

    /// Replace the store with a fresh fetch.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let anomalies = self.api.fetch_all().await?;
        info!(count = anomalies.len(), "anomalies loaded");
        self.store.set(anomalies);
        Ok(())
    }

    pub async fn capture(&self, anomaly_id: &str) -> CaptureOutcome {
        self.coordinator.capture(anomaly_id).await
    }

    /// Tear down the push subscription.
    pub fn unmount(&self) {
        self.subscriber.disconnect();
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.unmount();
    }
}

pub fn threat_change_message(event: &ThreatLevelChangeEvent) -> String {
    let who = event.anomaly_name.as_deref().unwrap_or(&event.anomaly_id);
    match event.previous_threat_level {
        Some(prev) => format!(
            "{} threat level changed from {} to {}",
            who,
            prev.as_str().to_uppercase(),
            event.new_threat_level.as_str().to_uppercase()
        ),
        None => format!(
            "{} threat level is now {}",
            who,
            event.new_threat_level.as_str().to_uppercase()
        ),
    }
}

/// Text of the connection indicator.
pub fn connection_label(status: &PushStatus) -> &'static str {
    match status.state {
        ConnectionState::Connected => "Live",
        _ if status.exhausted => "Disconnected",
        _ if status.reconnect_attempts > 0 => "Reconnecting...",
        ConnectionState::Connecting => "Connecting...",
        ConnectionState::Disconnected => "Disconnected",
    }
}
