use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::config::ServerConfig;
use crate::model::{Anomaly, AnomalyStatus, PushFrame, ThreatLevel, ThreatLevelChangeEvent};

/// Frames buffered per push subscriber before it starts lagging.
const PUSH_BUFFER: usize = 64;

/// Why the server refused a capture. Each maps to an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureDenied {
    #[error("Anomaly not found")]
    NotFound,
    #[error("Anomaly already captured")]
    AlreadyCaptured,
    #[error("Capture attempt failed. The anomaly escaped!")]
    Escaped,
}

/// Shared server state: the in-memory anomaly registry and the push fan-out.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RwLock<Vec<Anomaly>>>,
    pub events: broadcast::Sender<PushFrame>,
    /// Probability in `[0, 1]` that a capture of an active anomaly fails.
    pub capture_failure_rate: f64,
    /// Artificial latency added to every capture.
    pub capture_latency: Duration,
}

impl AppState {
    pub fn new(anomalies: Vec<Anomaly>, capture_failure_rate: f64, capture_latency: Duration) -> Self {
        let (events, _rx) = broadcast::channel(PUSH_BUFFER);
        let capture_failure_rate = if capture_failure_rate.is_finite() {
            capture_failure_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            registry: Arc::new(RwLock::new(anomalies)),
            events,
            capture_failure_rate,
            capture_latency,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            super::seed::seed_anomalies(),
            config.capture_failure_rate,
            Duration::from_millis(config.capture_latency_ms),
        )
    }

    pub async fn list(&self) -> Vec<Anomaly> {
        self.registry.read().await.clone()
    }

    /// Roll the simulated failure dice.
    pub fn roll_escape(&self) -> bool {
        rand::thread_rng().gen_bool(self.capture_failure_rate)
    }

    /// Capture `id`. `escaped` decides the simulated operational failure,
    /// which only applies to anomalies that exist and are still active.
    pub async fn capture(&self, id: &str, escaped: bool) -> Result<Anomaly, CaptureDenied> {
        let mut registry = self.registry.write().await;
        let anomaly = registry
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(CaptureDenied::NotFound)?;

        if anomaly.status == AnomalyStatus::Captured {
            return Err(CaptureDenied::AlreadyCaptured);
        }
        if escaped {
            return Err(CaptureDenied::Escaped);
        }

        anomaly.status = AnomalyStatus::Captured;
        Ok(anomaly.clone())
    }

    /// Move a random active anomaly to a different threat level.
    ///
    /// Returns the frame to broadcast: a `threat_level_change`, or an `info`
    /// frame when no anomaly is left active.
    pub async fn shift_random_threat<R: Rng + Send>(&self, rng: &mut R) -> PushFrame {
        let mut registry = self.registry.write().await;
        let active: Vec<usize> = registry
            .iter()
            .enumerate()
            .filter(|(_, a)| a.status == AnomalyStatus::Active)
            .map(|(idx, _)| idx)
            .collect();

        let Some(&idx) = active.choose(rng) else {
            return PushFrame::Info {
                message: "No active anomalies to update".to_string(),
            };
        };

        let anomaly = &mut registry[idx];
        let candidates: Vec<ThreatLevel> = ThreatLevel::ALL
            .into_iter()
            .filter(|level| *level != anomaly.threat_level)
            .collect();
        let new_level = candidates.choose(rng).copied().unwrap_or(anomaly.threat_level);

        let previous = anomaly.threat_level;
        anomaly.threat_level = new_level;

        PushFrame::ThreatLevelChange(ThreatLevelChangeEvent {
            anomaly_id: anomaly.id.clone(),
            new_threat_level: new_level,
            anomaly_name: Some(anomaly.name.clone()),
            previous_threat_level: Some(previous),
        })
    }

    /// Fan a frame out to every connected push subscriber.
    pub fn broadcast(&self, frame: PushFrame) -> usize {
        // No receivers just means nobody is watching right now.
        self.events.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushFrame> {
        self.events.subscribe()
    }
}
