//! Field mapping from canonical records to flat wire payloads.

use crate::record::{Observation, Record};
use serde_json::{Map, Number, Value as JsonValue};

/// One row of a mapping table: `target = record[source] * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldMapping {
    pub target: &'static str,
    pub source: Observation,
    pub scale: f64,
    pub offset: f64,
}

impl FieldMapping {
    pub const fn new(target: &'static str, source: Observation, scale: f64, offset: f64) -> Self {
        Self {
            target,
            source,
            scale,
            offset,
        }
    }

    pub fn apply(&self, record: &Record) -> Option<f64> {
        record
            .get(self.source)
            .map(|value| value * self.scale + self.offset)
    }
}

/// OpenWeatherMap measurement fields, from METRIC-system records.
pub const OWM_FIELD_MAP: &[FieldMapping] = &[
    FieldMapping::new("dt", Observation::DateTime, 1.0, 0.0),
    FieldMapping::new("wind_deg", Observation::WindDir, 1.0, 0.0),
    // km/h -> m/s
    FieldMapping::new("wind_speed", Observation::WindSpeed, 0.2777777777, 0.0),
    FieldMapping::new("wind_gust", Observation::WindGust, 0.2777777777, 0.0),
    FieldMapping::new("temperature", Observation::OutTemp, 1.0, 0.0),
    FieldMapping::new("humidity", Observation::OutHumidity, 1.0, 0.0),
    FieldMapping::new("pressure", Observation::Barometer, 1.0, 0.0),
    // cm -> mm
    FieldMapping::new("rain_1h", Observation::HourRain, 10.0, 0.0),
    FieldMapping::new("rain_24h", Observation::Rain24, 10.0, 0.0),
];

/// Evaluates `table` against `record`. Unobserved sources are omitted, never
/// defaulted.
pub fn map_fields(table: &[FieldMapping], record: &Record) -> Map<String, JsonValue> {
    let mut values = Map::new();
    for mapping in table {
        let Some(value) = mapping.apply(record) else {
            continue;
        };
        let number = if mapping.source.is_integral() {
            Some(Number::from(value.round() as i64))
        } else {
            Number::from_f64(value)
        };
        match number {
            Some(number) => {
                values.insert(mapping.target.to_string(), JsonValue::Number(number));
            }
            None => {
                tracing::debug!(field = mapping.target, value, "skipping non-finite value");
            }
        }
    }
    values
}

/// True when no two rows share a target name.
pub fn has_unique_targets(table: &[FieldMapping]) -> bool {
    table
        .iter()
        .enumerate()
        .all(|(idx, mapping)| table[..idx].iter().all(|prev| prev.target != mapping.target))
}
