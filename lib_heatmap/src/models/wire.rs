//! # Snapshot Wire Format
//!
//! Frames pushed to subscribers are JSON text with a versioned envelope.
//! Fields are only ever added, never renamed or removed, and readers are
//! expected to ignore fields they do not know. Bump [`WIRE_VERSION`] only for
//! changes that break that rule.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::state::{DeviceState, MarkerStatus};

/// Envelope version stamped on every frame.
pub const WIRE_VERSION: u32 = 1;

/// Whether a frame carries the whole table or only changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Snapshot,
    Delta,
}

/// Flat per-device view as rendered by the map client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub identifier: Uuid,
    pub name: String,
    pub is_active: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub sensor_active: bool,
    pub supply_temperature: Option<f64>,
    pub return_temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub correct_supply_temperature: bool,
    pub correct_pressure: bool,
    pub observed_at: DateTime<Utc>,
    pub revision: u64,
    #[serde(default)]
    pub stale: bool,
    pub temperature_marker: MarkerStatus,
    pub pressure_marker: MarkerStatus,
}

impl DeviceView {
    /// Projects a committed state. `stale_after` marks devices whose last
    /// observation is older than the given age relative to `now`.
    pub fn from_state(state: &DeviceState, now: DateTime<Utc>, stale_after: Option<Duration>) -> Self {
        let reading = state.reading();
        let flags = state.flags();
        let stale = stale_after
            .and_then(|max_age| chrono::Duration::from_std(max_age).ok())
            .map(|max_age| now - reading.observed_at > max_age)
            .unwrap_or(false);

        Self {
            identifier: reading.identifier,
            name: reading.name.clone(),
            is_active: reading.is_active,
            latitude: reading.latitude,
            longitude: reading.longitude,
            sensor_active: reading.sensor.is_active,
            supply_temperature: reading.sensor.supply_temperature,
            return_temperature: reading.sensor.return_temperature,
            pressure: reading.sensor.pressure,
            correct_supply_temperature: flags.correct_supply_temperature,
            correct_pressure: flags.correct_pressure,
            observed_at: reading.observed_at,
            revision: state.revision(),
            stale,
            temperature_marker: state.temperature_marker(),
            pressure_marker: state.pressure_marker(),
        }
    }
}

/// One push to one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFrame {
    pub version: u32,
    pub kind: FrameKind,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_revision: Option<u64>,
    pub generated_at: DateTime<Utc>,
    pub devices: Vec<DeviceView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<Vec<Uuid>>,
}

impl SnapshotFrame {
    pub fn full(revision: u64, generated_at: DateTime<Utc>, devices: Vec<DeviceView>) -> Self {
        Self {
            version: WIRE_VERSION,
            kind: FrameKind::Snapshot,
            revision,
            since_revision: None,
            generated_at,
            devices,
            removed: None,
        }
    }

    pub fn delta(
        revision: u64,
        since_revision: u64,
        generated_at: DateTime<Utc>,
        devices: Vec<DeviceView>,
        removed: Vec<Uuid>,
    ) -> Self {
        Self {
            version: WIRE_VERSION,
            kind: FrameKind::Delta,
            revision,
            since_revision: Some(since_revision),
            generated_at,
            devices,
            removed: Some(removed),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::contract::{Bounds, Contract};
    use crate::models::reading::{DeviceReading, SensorPayload};
    use serde_json::Value;

    fn state(observed_at: DateTime<Utc>) -> DeviceState {
        let reading = DeviceReading {
            identifier: Uuid::new_v4(),
            name: "Substation 12".to_string(),
            is_active: true,
            latitude: 58.01,
            longitude: 56.25,
            sensor: SensorPayload {
                is_active: true,
                supply_temperature: Some(70.0),
                return_temperature: None,
                pressure: Some(6.1),
            },
            observed_at,
        };
        let contract = Contract {
            supply_temperature: Some(Bounds::new(65.0, 75.0)),
            pressure: None,
        };
        DeviceState::derive(reading, Some(&contract), 7)
    }

    #[test]
    fn test_full_frame_field_names() {
        let now = Utc::now();
        let view = DeviceView::from_state(&state(now), now, None);
        let frame = SnapshotFrame::full(7, now, vec![view]);
        let json: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(json["version"], 1);
        assert_eq!(json["kind"], "snapshot");
        assert!(json.get("removed").is_none());
        assert!(json.get("since_revision").is_none());

        let device = &json["devices"][0];
        for field in [
            "identifier", "name", "is_active", "latitude", "longitude",
            "supply_temperature", "return_temperature", "pressure",
            "correct_supply_temperature", "correct_pressure",
        ] {
            assert!(device.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(device["return_temperature"], Value::Null);
        assert_eq!(device["correct_supply_temperature"], true);
        assert_eq!(device["correct_pressure"], false);
        assert_eq!(device["temperature_marker"], "green");
        assert_eq!(device["pressure_marker"], "blue");
    }

    #[test]
    fn test_stale_after_max_age() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(600);
        let s = state(old);
        assert!(DeviceView::from_state(&s, now, Some(Duration::from_secs(300))).stale);
        assert!(!DeviceView::from_state(&s, now, Some(Duration::from_secs(900))).stale);
        assert!(!DeviceView::from_state(&s, now, None).stale);
    }

    #[test]
    fn test_reader_ignores_unknown_fields() {
        let now = Utc::now();
        let frame = SnapshotFrame::delta(9, 7, now, vec![], vec![Uuid::nil()]);
        let mut json: Value = serde_json::to_value(&frame).unwrap();
        json["future_field"] = Value::from("ignored");
        let back: SnapshotFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }
}
