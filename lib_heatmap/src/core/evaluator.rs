//! # Contract Evaluator
//!
//! Pure functions turning a reading and its contract into correctness flags.
//! No shared state and no side effects, so the result never depends on the
//! order in which readings are evaluated.
//!
//! The rules are conservative: a flag is only `true` when there is both a
//! contracted range and a measured value, and the value lies inside the range
//! (bounds inclusive).

use crate::models::contract::{Bounds, Contract};
use crate::models::reading::DeviceReading;
use crate::models::state::DerivedFlags;

/// Computes the derived flags for `reading` under `contract`.
pub fn evaluate(reading: &DeviceReading, contract: Option<&Contract>) -> DerivedFlags {
    let Some(contract) = contract else {
        return DerivedFlags::default();
    };

    DerivedFlags {
        correct_supply_temperature: within(
            reading.sensor.supply_temperature,
            contract.supply_temperature,
        ),
        correct_pressure: within(
            reading.sensor.pressure,
            contract.pressure.map(|p| p.as_bounds()),
        ),
    }
}

fn within(value: Option<f64>, bounds: Option<Bounds>) -> bool {
    match (value, bounds) {
        (Some(v), Some(b)) => b.contains(v),
        _ => false,
    }
}
