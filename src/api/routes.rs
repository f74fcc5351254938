//! API route definitions.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use super::state::{AppState, CaptureDenied};
use crate::model::{Envelope, PushFrame};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/anomalies", get(list_anomalies))
        .route("/anomalies/stream", get(anomaly_stream))
        .route("/anomalies/{id}/capture", post(capture_anomaly))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn list_anomalies(State(state): State<AppState>) -> Json<Envelope> {
    Json(Envelope::list(&state.list().await))
}

async fn capture_anomaly(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Envelope>) {
    if !state.capture_latency.is_zero() {
        tokio::time::sleep(state.capture_latency).await;
    }

    let escaped = state.roll_escape();
    match state.capture(&id, escaped).await {
        Ok(anomaly) => {
            info!(anomaly_id = %id, "anomaly captured");
            (StatusCode::OK, Json(Envelope::captured(&anomaly)))
        }
        Err(denied) => {
            let status = match denied {
                CaptureDenied::NotFound => StatusCode::NOT_FOUND,
                CaptureDenied::AlreadyCaptured => StatusCode::BAD_REQUEST,
                CaptureDenied::Escaped => StatusCode::INTERNAL_SERVER_ERROR,
            };
            info!(anomaly_id = %id, reason = %denied, "capture refused");
            (status, Json(Envelope::failure(denied.to_string())))
        }
    }
}

async fn anomaly_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before building the stream so nothing is missed after the ack.
    let rx = state.subscribe();
    info!(subscribers = state.events.receiver_count(), "push client connected");

    let hello = PushFrame::Connected {
        message: "Connected to anomaly stream".to_string(),
    };
    let frames = tokio_stream::once(hello).chain(
        BroadcastStream::new(rx).filter_map(|frame| match frame {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "push client lagging, frames skipped");
                None
            }
        }),
    );

    let events = frames.filter_map(|frame| match Event::default().json_data(&frame) {
        Ok(event) => Some(Ok(event)),
        Err(e) => {
            warn!(error = %e, "failed to encode push frame");
            None
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
