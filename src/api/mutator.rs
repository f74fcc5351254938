//! Background task that simulates threat level drift and feeds the push channel.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use super::state::AppState;
use crate::model::PushFrame;

/// Every `interval`, shift one active anomaly's threat level and broadcast
/// the change. Runs until the task is dropped.
pub async fn run_threat_mutator(state: AppState, interval: Duration) {
    info!(interval_ms = interval.as_millis() as u64, "threat mutator started");

    let mut rng = StdRng::from_entropy();
    // `interval` panics on a zero period.
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let frame = state.shift_random_threat(&mut rng).await;
        if let PushFrame::ThreatLevelChange(ev) = &frame {
            info!(
                anomaly_id = %ev.anomaly_id,
                from = ?ev.previous_threat_level,
                to = %ev.new_threat_level,
                "threat level shifted"
            );
        }
        let delivered = state.broadcast(frame);
        debug!(delivered, "push frame broadcast");
    }
}
