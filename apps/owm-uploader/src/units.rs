//! Conversion of records into the canonical metric system.
//!
//! Canonical units: °C, km/h, mbar, cm of rain, cm/h of rain rate, W/m²,
//! percent and compass degrees. Conversion is pure; observations whose group has
//! no unit (direction, humidity, radiation, UV) pass through untouched.

use crate::record::{Observation, Record, UnitGroup, UnitSystem};

/// Record-to-record unit transform applied before field mapping.
pub type UnitConverter = fn(&Record) -> Record;

const MPH_TO_KPH: f64 = 1.609344;
const MPS_TO_KPH: f64 = 3.6;
const INHG_TO_MBAR: f64 = 33.8638866667;
const INCH_TO_CM: f64 = 2.54;
const MM_TO_CM: f64 = 0.1;

pub fn to_canonical_metric(record: &Record) -> Record {
    let source = record.units();
    if source == UnitSystem::Metric {
        return record.clone();
    }

    let mut converted = Record::new(record.date_time(), UnitSystem::Metric);
    for (obs, value) in record.observations() {
        converted.set(obs, Some(convert_value(obs, value, source)));
    }
    converted
}

/// Converts one value from `source` into the canonical system.
pub fn convert_value(obs: Observation, value: f64, source: UnitSystem) -> f64 {
    match (obs.group(), source) {
        (_, UnitSystem::Metric) => value,
        (UnitGroup::Temperature, UnitSystem::Us) => (value - 32.0) * 5.0 / 9.0,
        (UnitGroup::Speed, UnitSystem::Us) => value * MPH_TO_KPH,
        (UnitGroup::Speed, UnitSystem::MetricWx) => value * MPS_TO_KPH,
        (UnitGroup::Pressure, UnitSystem::Us) => value * INHG_TO_MBAR,
        (UnitGroup::Rain | UnitGroup::RainRate, UnitSystem::Us) => value * INCH_TO_CM,
        (UnitGroup::Rain | UnitGroup::RainRate, UnitSystem::MetricWx) => value * MM_TO_CM,
        _ => value,
    }
}
