//! Rolling rain totals for records that arrive without `hourRain` / `rain24`.
//!
//! Every drained record contributes its `rain` (the amount fallen during its
//! archive interval), including records that are never posted, so a slow
//! uplink folds skipped intervals into the totals instead of losing them.

use crate::record::{Observation, Record};
use crate::units::convert_value;
use chrono::Utc;
use std::collections::BTreeMap;

pub const HOUR_SECONDS: i64 = 3600;
pub const DAY_SECONDS: i64 = 86_400;
/// Samples dated further than this past the wall clock are not kept.
pub const MAX_CLOCK_AHEAD_SECONDS: i64 = DAY_SECONDS;

#[derive(Debug, Default)]
pub struct RainHistory {
    /// dateTime -> rain in canonical units (cm).
    samples: BTreeMap<i64, f64>,
}

impl RainHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, record: &Record) {
        self.observe_at(record, Utc::now().timestamp());
    }

    /// `observe` against an explicit wall clock, `now` in epoch seconds.
    pub fn observe_at(&mut self, record: &Record, now: i64) {
        let Some(rain) = record.get(Observation::Rain) else {
            return;
        };
        let date_time = record.date_time();
        if date_time > now.saturating_add(MAX_CLOCK_AHEAD_SECONDS) {
            tracing::debug!(date_time, now, "ignoring rain sample dated in the future");
            return;
        }
        let canonical = convert_value(Observation::Rain, rain, record.units());
        self.samples.insert(date_time, canonical);
        self.prune(date_time);
    }

    /// Sum of rain over `(end - span, end]`, canonical units. `None` when no
    /// sample falls in the window.
    pub fn total(&self, end: i64, span: i64) -> Option<f64> {
        if span <= 0 {
            return None;
        }
        let start = end.saturating_sub(span - 1);
        let mut window = self.samples.range(start..=end).peekable();
        window.peek()?;
        Some(window.map(|(_, rain)| rain).sum())
    }

    /// Fills `hourRain` and `rain24` when the record lacks them. Values already
    /// on the record are kept.
    pub fn fill_totals(&self, record: &mut Record) {
        let end = record.date_time();
        // Linear with no offset, so one unit of canonical rain scales back.
        let per_unit = convert_value(Observation::Rain, 1.0, record.units());
        for (obs, span) in [
            (Observation::HourRain, HOUR_SECONDS),
            (Observation::Rain24, DAY_SECONDS),
        ] {
            if record.contains(obs) {
                continue;
            }
            if let Some(total) = self.total(end, span) {
                record.set(obs, Some(total / per_unit));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drops samples a day or more older than `anchor`, the sample just stored.
    fn prune(&mut self, anchor: i64) {
        let keep_from = anchor.saturating_sub(DAY_SECONDS - 1);
        self.samples = self.samples.split_off(&keep_from);
    }
}
