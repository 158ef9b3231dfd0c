//! Archive records as produced by the station engine.
//!
//! A record is a flat set of observations keyed by a closed vocabulary
//! ([`Observation`]) plus the `dateTime` stamp and the `usUnits` tag naming the
//! unit system its values are expressed in. Absent and `null` observations are
//! the same thing: the key is simply not stored.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Observation {
    DateTime,
    OutTemp,
    InTemp,
    Dewpoint,
    Windchill,
    Heatindex,
    OutHumidity,
    InHumidity,
    WindSpeed,
    WindGust,
    WindDir,
    WindGustDir,
    Barometer,
    Pressure,
    Altimeter,
    Rain,
    RainRate,
    HourRain,
    Rain24,
    DayRain,
    Radiation,
    Uv,
}

/// Physical quantity an observation measures; drives unit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitGroup {
    Time,
    Temperature,
    Percent,
    Speed,
    Direction,
    Pressure,
    Rain,
    RainRate,
    Radiation,
    Index,
}

impl Observation {
    pub const ALL: [Observation; 22] = [
        Observation::DateTime,
        Observation::OutTemp,
        Observation::InTemp,
        Observation::Dewpoint,
        Observation::Windchill,
        Observation::Heatindex,
        Observation::OutHumidity,
        Observation::InHumidity,
        Observation::WindSpeed,
        Observation::WindGust,
        Observation::WindDir,
        Observation::WindGustDir,
        Observation::Barometer,
        Observation::Pressure,
        Observation::Altimeter,
        Observation::Rain,
        Observation::RainRate,
        Observation::HourRain,
        Observation::Rain24,
        Observation::DayRain,
        Observation::Radiation,
        Observation::Uv,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Observation::DateTime => "dateTime",
            Observation::OutTemp => "outTemp",
            Observation::InTemp => "inTemp",
            Observation::Dewpoint => "dewpoint",
            Observation::Windchill => "windchill",
            Observation::Heatindex => "heatindex",
            Observation::OutHumidity => "outHumidity",
            Observation::InHumidity => "inHumidity",
            Observation::WindSpeed => "windSpeed",
            Observation::WindGust => "windGust",
            Observation::WindDir => "windDir",
            Observation::WindGustDir => "windGustDir",
            Observation::Barometer => "barometer",
            Observation::Pressure => "pressure",
            Observation::Altimeter => "altimeter",
            Observation::Rain => "rain",
            Observation::RainRate => "rainRate",
            Observation::HourRain => "hourRain",
            Observation::Rain24 => "rain24",
            Observation::DayRain => "dayRain",
            Observation::Radiation => "radiation",
            Observation::Uv => "UV",
        }
    }

    pub fn group(self) -> UnitGroup {
        match self {
            Observation::DateTime => UnitGroup::Time,
            Observation::OutTemp
            | Observation::InTemp
            | Observation::Dewpoint
            | Observation::Windchill
            | Observation::Heatindex => UnitGroup::Temperature,
            Observation::OutHumidity | Observation::InHumidity => UnitGroup::Percent,
            Observation::WindSpeed | Observation::WindGust => UnitGroup::Speed,
            Observation::WindDir | Observation::WindGustDir => UnitGroup::Direction,
            Observation::Barometer | Observation::Pressure | Observation::Altimeter => {
                UnitGroup::Pressure
            }
            Observation::Rain | Observation::HourRain | Observation::Rain24 | Observation::DayRain => {
                UnitGroup::Rain
            }
            Observation::RainRate => UnitGroup::RainRate,
            Observation::Radiation => UnitGroup::Radiation,
            Observation::Uv => UnitGroup::Index,
        }
    }

    /// Observations whose wire value must stay an integer (epoch seconds).
    pub fn is_integral(self) -> bool {
        matches!(self, Observation::DateTime)
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Observation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Observation::ALL
            .iter()
            .copied()
            .find(|obs| obs.key() == s)
            .ok_or_else(|| format!("unknown observation {s}"))
    }
}

/// The `usUnits` tag of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSystem {
    /// °F, mph, inHg, inches.
    Us,
    /// °C, km/h, mbar, cm.
    Metric,
    /// °C, m/s, mbar, mm.
    MetricWx,
}

impl UnitSystem {
    pub fn code(self) -> u8 {
        match self {
            UnitSystem::Us => 1,
            UnitSystem::Metric => 16,
            UnitSystem::MetricWx => 17,
        }
    }
}

impl TryFrom<u8> for UnitSystem {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        [UnitSystem::Us, UnitSystem::Metric, UnitSystem::MetricWx]
            .into_iter()
            .find(|units| units.code() == code)
            .ok_or_else(|| format!("unsupported usUnits {code}"))
    }
}

/// Latest accepted `dateTime`, 9999-12-31T23:59:59Z.
pub const MAX_DATE_TIME: i64 = 253_402_300_799;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawRecord")]
pub struct Record {
    date_time: i64,
    units: UnitSystem,
    values: BTreeMap<Observation, f64>,
}

impl Record {
    pub fn new(date_time: i64, units: UnitSystem) -> Self {
        Self {
            date_time,
            units,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, obs: Observation, value: f64) -> Self {
        self.set(obs, Some(value));
        self
    }

    pub fn set(&mut self, obs: Observation, value: Option<f64>) {
        if obs == Observation::DateTime {
            if let Some(value) = value {
                self.date_time = value as i64;
            }
            return;
        }
        match value {
            Some(value) => {
                self.values.insert(obs, value);
            }
            None => {
                self.values.remove(&obs);
            }
        }
    }

    pub fn get(&self, obs: Observation) -> Option<f64> {
        if obs == Observation::DateTime {
            return Some(self.date_time as f64);
        }
        self.values.get(&obs).copied()
    }

    pub fn contains(&self, obs: Observation) -> bool {
        obs == Observation::DateTime || self.values.contains_key(&obs)
    }

    pub fn date_time(&self) -> i64 {
        self.date_time
    }

    pub fn units(&self) -> UnitSystem {
        self.units
    }

    /// Observed values, excluding `dateTime`.
    pub fn observations(&self) -> impl Iterator<Item = (Observation, f64)> + '_ {
        self.values.iter().map(|(obs, value)| (*obs, *value))
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "dateTime")]
    date_time: i64,
    #[serde(rename = "usUnits", default)]
    us_units: Option<u8>,
    #[serde(flatten)]
    fields: HashMap<String, JsonValue>,
}

impl TryFrom<RawRecord> for Record {
    type Error = String;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        if !(0..=MAX_DATE_TIME).contains(&raw.date_time) {
            return Err(format!("dateTime {} is out of range", raw.date_time));
        }
        // Records without a tag are taken to be in the canonical system already.
        let units = match raw.us_units {
            Some(code) => UnitSystem::try_from(code)?,
            None => UnitSystem::Metric,
        };
        let mut record = Record::new(raw.date_time, units);
        let mut ignored = Vec::new();

        for (key, value) in raw.fields {
            let Ok(obs) = key.parse::<Observation>() else {
                ignored.push(key);
                continue;
            };
            match value {
                JsonValue::Null => {}
                JsonValue::Number(number) => {
                    let value = number
                        .as_f64()
                        .ok_or_else(|| format!("observation {obs} is out of range"))?;
                    record.set(obs, Some(value));
                }
                _ => return Err(format!("observation {obs} is not numeric")),
            }
        }

        if !ignored.is_empty() {
            ignored.sort();
            tracing::debug!(
                date_time = record.date_time,
                ignored = ?ignored,
                "ignored unknown record fields"
            );
        }

        Ok(record)
    }
}
