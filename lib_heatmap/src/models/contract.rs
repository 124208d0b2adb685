//! Per-device contract bounds and the read-only book that holds them.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{HeatmapError, Result};

/// Inclusive numeric range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Boundary values are inside. NaN is never inside.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn validate(&self, what: &str) -> std::result::Result<(), String> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(format!("{} bounds must be finite", what));
        }
        if self.min > self.max {
            return Err(format!("{} bounds inverted: {} > {}", what, self.min, self.max));
        }
        Ok(())
    }
}

/// Pressure may be contracted either as a range or as a setpoint with a
/// symmetric tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PressureBounds {
    Range { min: f64, max: f64 },
    Setpoint { setpoint: f64, tolerance: f64 },
}

impl PressureBounds {
    /// Normalised inclusive range.
    pub fn as_bounds(&self) -> Bounds {
        match *self {
            PressureBounds::Range { min, max } => Bounds::new(min, max),
            PressureBounds::Setpoint { setpoint, tolerance } => {
                Bounds::new(setpoint - tolerance, setpoint + tolerance)
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if let PressureBounds::Setpoint { tolerance, .. } = *self {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(format!("pressure tolerance must be a non-negative number, got {}", tolerance));
            }
        }
        self.as_bounds().validate("pressure")
    }
}

/// Bounds agreed for one device. Either side may be missing, in which case the
/// matching flag is never reported as correct.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Contract {
    #[serde(default)]
    pub supply_temperature: Option<Bounds>,
    #[serde(default)]
    pub pressure: Option<PressureBounds>,
}

impl Contract {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(b) = &self.supply_temperature {
            b.validate("supply_temperature")?;
        }
        if let Some(p) = &self.pressure {
            p.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ContractFile {
    #[serde(default)]
    default: Option<Contract>,
    #[serde(default)]
    devices: HashMap<Uuid, Contract>,
}

/// Read-only contract reference data. Built once at startup and shared behind
/// an `Arc`; ingestion never mutates it.
#[derive(Debug, Clone, Default)]
pub struct ContractBook {
    default: Option<Contract>,
    devices: HashMap<Uuid, Contract>,
}

impl ContractBook {
    pub fn new(devices: HashMap<Uuid, Contract>, default: Option<Contract>) -> Self {
        Self { default, devices }
    }

    /// Loads a book from a JSON file of the shape
    /// `{ "default": Contract?, "devices": { "<uuid>": Contract } }`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let load_err = |reason: String| HeatmapError::ContractLoad {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        Self::from_json(&text).map_err(load_err)
    }

    /// Parses and validates a book from JSON text.
    pub fn from_json(text: &str) -> std::result::Result<Self, String> {
        let file: ContractFile = serde_json::from_str(text).map_err(|e| e.to_string())?;
        if let Some(default) = &file.default {
            default.validate().map_err(|e| format!("default: {}", e))?;
        }
        for (id, contract) in &file.devices {
            contract.validate().map_err(|e| format!("{}: {}", id, e))?;
        }
        Ok(Self::new(file.devices, file.default))
    }

    /// The contract for a device, falling back to the book default.
    pub fn get(&self, identifier: &Uuid) -> Option<&Contract> {
        self.devices.get(identifier).or(self.default.as_ref())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.default.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ID: &str = "0b7c9a54-58a4-4a3c-9d1c-2f8f3e1d5a10";

    #[test]
    fn test_setpoint_normalises_to_range() {
        let p = PressureBounds::Setpoint { setpoint: 6.0, tolerance: 0.5 };
        assert_eq!(p.as_bounds(), Bounds::new(5.5, 6.5));
    }

    #[test]
    fn test_book_from_file_with_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "default": {{ "supply_temperature": {{ "min": 60, "max": 80 }} }},
                "devices": {{
                    "{}": {{
                        "supply_temperature": {{ "min": 65, "max": 75 }},
                        "pressure": {{ "setpoint": 6.0, "tolerance": 0.4 }}
                    }}
                }}
            }}"#,
            ID
        )
        .unwrap();

        let book = ContractBook::from_file(file.path()).unwrap();
        let id = Uuid::parse_str(ID).unwrap();
        assert_eq!(book.len(), 1);
        assert_eq!(book.get(&id).unwrap().supply_temperature, Some(Bounds::new(65.0, 75.0)));

        let other = Uuid::new_v4();
        let fallback = book.get(&other).unwrap();
        assert_eq!(fallback.supply_temperature, Some(Bounds::new(60.0, 80.0)));
        assert_eq!(fallback.pressure, None);
    }

    #[test]
    fn test_rejects_negative_tolerance_and_inverted_bounds() {
        let negative = format!(r#"{{"devices":{{"{}":{{"pressure":{{"setpoint":6,"tolerance":-1}}}}}}}}"#, ID);
        assert!(ContractBook::from_json(&negative).unwrap_err().contains("tolerance"));

        let inverted = r#"{"default":{"supply_temperature":{"min":80,"max":60}}}"#;
        assert!(ContractBook::from_json(inverted).unwrap_err().contains("inverted"));
    }

    #[test]
    fn test_missing_file_is_contract_load_error() {
        let err = ContractBook::from_file(Path::new("/nonexistent/contracts.json")).unwrap_err();
        assert!(matches!(err, HeatmapError::ContractLoad { .. }));
    }
}
