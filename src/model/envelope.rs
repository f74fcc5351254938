//! `{ success, data | anomaly | error }` response envelope used by the REST routes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{validate_anomaly, validate_anomaly_list, Anomaly};
use crate::error::ValidationError;

/// Response body of every REST route.
///
/// The discriminant is a JSON boolean, which serde cannot tag on, so the
/// envelope is kept loose here and narrowed by the `into_*` accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of `POST /api/anomalies/{id}/capture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureResult {
    Captured(Anomaly),
    Failed(String),
}

impl Envelope {
    pub fn list(anomalies: &[Anomaly]) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(anomalies).ok(),
            anomaly: None,
            error: None,
        }
    }

    pub fn captured(anomaly: &Anomaly) -> Self {
        Self {
            success: true,
            data: None,
            anomaly: serde_json::to_value(anomaly).ok(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            anomaly: None,
            error: Some(message.into()),
        }
    }

    /// Parse a raw body into an envelope.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::new("response envelope", e.to_string()))
    }

    /// The server-provided error message of a failed envelope.
    pub fn error_message(&self) -> Option<&str> {
        if self.success {
            return None;
        }
        Some(self.error.as_deref().unwrap_or("Unknown error"))
    }

    /// Narrow a list response. Only meaningful when `success` is true.
    pub fn into_anomalies(self) -> Result<Vec<Anomaly>, ValidationError> {
        let data = self
            .data
            .ok_or_else(|| ValidationError::new("anomaly list", "missing field `data`"))?;
        validate_anomaly_list(&data)
    }

    /// Narrow a capture response.
    pub fn into_capture_result(self) -> Result<CaptureResult, ValidationError> {
        if !self.success {
            let message = self.error.unwrap_or_else(|| "Unknown error".to_string());
            return Ok(CaptureResult::Failed(message));
        }
        let anomaly = self
            .anomaly
            .ok_or_else(|| ValidationError::new("capture result", "missing field `anomaly`"))?;
        Ok(CaptureResult::Captured(validate_anomaly(&anomaly)?))
    }
}
