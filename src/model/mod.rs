//! Domain model -- anomalies, threat levels, and wire payloads.

pub mod envelope;
pub mod push;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

pub use self::envelope::{CaptureResult, Envelope};
pub use self::push::{parse_push_message, PushFrame, PushParseError, ThreatLevelChangeEvent};

/// Threat classification of an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub const ALL: [ThreatLevel; 4] = [
        ThreatLevel::Low,
        ThreatLevel::Medium,
        ThreatLevel::High,
        ThreatLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }

    /// High and critical changes are worth a warning rather than an info toast.
    pub fn is_elevated(&self) -> bool {
        matches!(self, ThreatLevel::High | ThreatLevel::Critical)
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Containment status. Only ever moves from `Active` to `Captured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyStatus {
    Active,
    Captured,
}

impl std::fmt::Display for AnomalyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyStatus::Active => f.write_str("active"),
            AnomalyStatus::Captured => f.write_str("captured"),
        }
    }
}

/// A monitored anomaly, as served by `GET /api/anomalies`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub id: String,
    pub name: String,
    pub threat_level: ThreatLevel,
    pub location: String,
    pub status: AnomalyStatus,
}

/// Field-level patch applied by [`crate::store::EntityStore::update_one`].
///
/// Only the fields that change after creation are patchable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnomalyPatch {
    pub threat_level: Option<ThreatLevel>,
    pub status: Option<AnomalyStatus>,
}

impl AnomalyPatch {
    pub fn status(status: AnomalyStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn threat_level(level: ThreatLevel) -> Self {
        Self {
            threat_level: Some(level),
            ..Self::default()
        }
    }

    /// Produce a patched copy of `anomaly`. The input is left untouched.
    pub fn apply(&self, anomaly: &Anomaly) -> Anomaly {
        let mut next = anomaly.clone();
        if let Some(level) = self.threat_level {
            next.threat_level = level;
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        next
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a raw JSON value against the anomaly wire shape.
///
/// All five fields are required with exactly the documented types; unknown
/// extra fields are tolerated.
pub fn validate_anomaly(value: &Value) -> Result<Anomaly, ValidationError> {
    Anomaly::deserialize(value).map_err(|e| ValidationError::new("anomaly", e.to_string()))
}

/// Validate a JSON array of anomalies. Fails on the first invalid element.
pub fn validate_anomaly_list(value: &Value) -> Result<Vec<Anomaly>, ValidationError> {
    let items = value
        .as_array()
        .ok_or_else(|| ValidationError::new("anomaly list", "expected a JSON array"))?;

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            validate_anomaly(item).map_err(|e| {
                ValidationError::new("anomaly list", format!("element {}: {}", idx, e.reason))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "id": "1",
            "name": "Kuchisake-onna",
            "threatLevel": "high",
            "location": "Shibuya Crossing",
            "status": "active"
        })
    }

    #[test]
    fn test_valid_anomaly_passes_unchanged() {
        let value = sample();
        let anomaly = validate_anomaly(&value).unwrap();
        assert_eq!(anomaly.id, "1");
        assert_eq!(anomaly.threat_level, ThreatLevel::High);
        assert_eq!(anomaly.status, AnomalyStatus::Active);
        // Serializing back yields the same document.
        assert_eq!(serde_json::to_value(&anomaly).unwrap(), value);
    }

    #[test]
    fn test_extra_fields_tolerated() {
        let mut value = sample();
        value["lastSeen"] = json!("2024-01-01T00:00:00Z");
        assert!(validate_anomaly(&value).is_ok());
    }

    #[test]
    fn test_missing_field_rejected() {
        for field in ["id", "name", "threatLevel", "location", "status"] {
            let mut value = sample();
            value.as_object_mut().unwrap().remove(field);
            let err = validate_anomaly(&value).unwrap_err();
            assert_eq!(err.what, "anomaly");
            assert!(err.reason.contains(field), "reason should name {}: {}", field, err.reason);
        }
    }

    #[test]
    fn test_enum_violation_rejected() {
        let mut value = sample();
        value["threatLevel"] = json!("apocalyptic");
        assert!(validate_anomaly(&value).is_err());

        let mut value = sample();
        value["status"] = json!("released");
        assert!(validate_anomaly(&value).is_err());

        // Enum values are case sensitive on the wire.
        let mut value = sample();
        value["status"] = json!("ACTIVE");
        assert!(validate_anomaly(&value).is_err());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut value = sample();
        value["id"] = json!(1);
        assert!(validate_anomaly(&value).is_err());

        let mut value = sample();
        value["location"] = Value::Null;
        assert!(validate_anomaly(&value).is_err());
    }

    #[test]
    fn test_list_reports_bad_element() {
        let mut bad = sample();
        bad["status"] = json!(42);
        let err = validate_anomaly_list(&json!([sample(), bad])).unwrap_err();
        assert!(err.reason.starts_with("element 1:"));

        assert!(validate_anomaly_list(&json!({"id": "1"})).is_err());
        assert_eq!(validate_anomaly_list(&json!([])).unwrap(), vec![]);
    }

    #[test]
    fn test_patch_does_not_touch_original() {
        let original = validate_anomaly(&sample()).unwrap();
        let patched = AnomalyPatch::status(AnomalyStatus::Captured).apply(&original);
        assert_eq!(original.status, AnomalyStatus::Active);
        assert_eq!(patched.status, AnomalyStatus::Captured);
        assert_eq!(patched.threat_level, original.threat_level);
        assert_eq!(patched.location, original.location);
        assert_eq!(AnomalyPatch::default().apply(&original), original);
    }
}
