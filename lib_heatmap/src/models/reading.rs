//! Device readings and the upstream message schema they are parsed from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sensor values attached to a reading. Any value may be absent when the
/// corresponding probe is inactive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPayload {
    pub is_active: bool,
    pub supply_temperature: Option<f64>,
    pub return_temperature: Option<f64>,
    pub pressure: Option<f64>,
}

/// One observation of one device. Immutable once built; a newer observation
/// is always a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub identifier: Uuid,
    pub name: String,
    pub is_active: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub sensor: SensorPayload,
    pub observed_at: DateTime<Utc>,
}

impl DeviceReading {
    /// Basic validation applied by the state table before any upsert.
    pub fn validate(&self) -> Result<(), String> {
        if self.identifier.is_nil() {
            return Err("missing identifier".to_string());
        }
        if !self.latitude.is_finite() || !self.longitude.is_finite() {
            return Err(format!(
                "non-finite coordinates ({}, {})",
                self.latitude, self.longitude
            ));
        }
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(format!(
                "coordinates out of range ({}, {})",
                self.latitude, self.longitude
            ));
        }
        Ok(())
    }
}

/// A single parsed upstream record.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedRecord {
    Reading(DeviceReading),
    Remove {
        identifier: Uuid,
        observed_at: DateTime<Utc>,
    },
}

impl FeedRecord {
    pub fn identifier(&self) -> Uuid {
        match self {
            FeedRecord::Reading(r) => r.identifier,
            FeedRecord::Remove { identifier, .. } => *identifier,
        }
    }
}

// Wire shape of a sensor block. Everything optional so that a missing field
// surfaces as a precise schema error instead of a generic serde message.
#[derive(Debug, Deserialize)]
struct RawSensor {
    is_active: Option<bool>,
    supply_temperature: Option<f64>,
    return_temperature: Option<f64>,
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(alias = "uuid")]
    identifier: Option<String>,
    name: Option<String>,
    is_active: Option<bool>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    sensor: Option<RawSensor>,
    observed_at: Option<DateTime<Utc>>,
}

/// Parses a feed payload. A payload is either one message object or an array
/// of them; each element yields its own result so one bad element never
/// poisons its neighbours.
pub fn parse_payload(text: &str) -> Vec<Result<FeedRecord, String>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items.into_iter().map(parse_value).collect(),
        Ok(value @ Value::Object(_)) => vec![parse_value(value)],
        Ok(other) => vec![Err(format!("expected object or array, got {}", type_name(&other)))],
        Err(e) => vec![Err(format!("invalid JSON: {}", e))],
    }
}

/// Parses one JSON value into a record.
pub fn parse_value(value: Value) -> Result<FeedRecord, String> {
    let raw: RawMessage = serde_json::from_value(value).map_err(|e| e.to_string())?;

    let identifier = match raw.identifier.as_deref().map(str::trim) {
        None | Some("") => return Err("missing identifier".to_string()),
        Some(id) => Uuid::parse_str(id).map_err(|e| format!("invalid identifier '{}': {}", id, e))?,
    };
    let observed_at = raw.observed_at.ok_or("missing observed_at")?;

    match raw.kind.as_deref() {
        Some("remove") => return Ok(FeedRecord::Remove { identifier, observed_at }),
        None | Some("reading") => {}
        Some(other) => return Err(format!("unknown message type '{}'", other)),
    }

    let sensor = raw.sensor.ok_or("missing sensor")?;
    let reading = DeviceReading {
        identifier,
        name: raw.name.ok_or("missing name")?,
        is_active: raw.is_active.ok_or("missing is_active")?,
        latitude: raw.latitude.ok_or("missing latitude")?,
        longitude: raw.longitude.ok_or("missing longitude")?,
        sensor: SensorPayload {
            is_active: sensor.is_active.ok_or("missing sensor.is_active")?,
            supply_temperature: sensor.supply_temperature,
            return_temperature: sensor.return_temperature,
            pressure: sensor.pressure,
        },
        observed_at,
    };
    Ok(FeedRecord::Reading(reading))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
