//! Push-channel frames carried over `GET /api/anomalies/stream`.
//!
//! Every frame is a JSON object with a `type` discriminant. The client only
//! acts on `threat_level_change`; `connected` and `info` are acknowledged and
//! dropped, and unknown types are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::ThreatLevel;

/// A server-originated threat level change for one anomaly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatLevelChangeEvent {
    pub anomaly_id: String,
    pub new_threat_level: ThreatLevel,
    /// Display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_name: Option<String>,
    /// Display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_threat_level: Option<ThreatLevel>,
}

/// Frames the server emits. Serialized as `{ "type": "<variant>", ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    Connected {
        #[serde(default)]
        message: String,
    },
    ThreatLevelChange(ThreatLevelChangeEvent),
    Info {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushParseError {
    /// The frame was not JSON at all.
    #[error("push frame is not valid JSON: {0}")]
    InvalidJson(String),

    /// The `type` is known but the body does not match its schema.
    #[error("push frame of type `{kind}` failed validation: {reason}")]
    Schema { kind: String, reason: String },

    /// Valid JSON with a missing or unrecognized `type`.
    #[error("unrecognized push frame type {0:?}")]
    UnknownType(Option<String>),
}

/// Parse and validate one push frame payload.
pub fn parse_push_message(data: &str) -> Result<PushFrame, PushParseError> {
    let value: Value =
        serde_json::from_str(data).map_err(|e| PushParseError::InvalidJson(e.to_string()))?;

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind @ ("connected" | "threat_level_change" | "info")) => kind.to_string(),
        Some(other) => return Err(PushParseError::UnknownType(Some(other.to_string()))),
        None => return Err(PushParseError::UnknownType(None)),
    };

    serde_json::from_value(value).map_err(|e| PushParseError::Schema {
        kind,
        reason: e.to_string(),
    })
}
