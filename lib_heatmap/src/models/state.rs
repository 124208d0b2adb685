use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::evaluator;
use crate::models::contract::Contract;
use crate::models::reading::DeviceReading;

/// Correctness flags derived from a reading and its contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DerivedFlags {
    pub correct_supply_temperature: bool,
    pub correct_pressure: bool,
}

/// Map marker colour for one layer of the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    /// Sensor active and value within contract.
    Green,
    /// Exactly one of (sensor active, value correct) holds.
    Blue,
    /// Sensor inactive and value not within contract.
    Red,
}

impl MarkerStatus {
    pub fn classify(sensor_active: bool, correct: bool) -> Self {
        match (sensor_active, correct) {
            (true, true) => MarkerStatus::Green,
            (false, false) => MarkerStatus::Red,
            _ => MarkerStatus::Blue,
        }
    }
}

/// A reading paired with the flags computed from it, stamped with the table
/// revision that committed it. Built only through [`DeviceState::derive`], so
/// the flags can never belong to a different reading.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    reading: DeviceReading,
    flags: DerivedFlags,
    revision: u64,
}

impl DeviceState {
    pub(crate) fn derive(reading: DeviceReading, contract: Option<&Contract>, revision: u64) -> Self {
        let flags = evaluator::evaluate(&reading, contract);
        Self { reading, flags, revision }
    }

    pub fn identifier(&self) -> Uuid {
        self.reading.identifier
    }

    pub fn reading(&self) -> &DeviceReading {
        &self.reading
    }

    pub fn flags(&self) -> DerivedFlags {
        self.flags
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn temperature_marker(&self) -> MarkerStatus {
        MarkerStatus::classify(self.reading.sensor.is_active, self.flags.correct_supply_temperature)
    }

    pub fn pressure_marker(&self) -> MarkerStatus {
        MarkerStatus::classify(self.reading.sensor.is_active, self.flags.correct_pressure)
    }
}
