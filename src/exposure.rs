//! In-memory aggregate of active positions per symbol/direction over the
//! concurrency window. Mutated only on admit (C7) and on close (C8);
//! rebuilt from `list_active` on restart.

use crate::clock::SharedClock;
use crate::domain::{Direction, Recommendation};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct DirectionAggregate {
    count: u32,
    exposure_sum: f64,
    last_created_ts: Option<DateTime<Utc>>,
    hourly_created_ts: Vec<DateTime<Utc>>,
    /// per-entry creation time, kept so "count with age < window" can be
    /// recomputed at read time instead of needing a background sweep.
    entries: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct SymbolAggregate {
    long: DirectionAggregate,
    short: DirectionAggregate,
    last_opposite_ts: HashMap<Direction, DateTime<Utc>>,
}

impl SymbolAggregate {
    fn dir(&self, d: Direction) -> &DirectionAggregate {
        match d {
            Direction::Long => &self.long,
            Direction::Short => &self.short,
        }
    }

    fn dir_mut(&mut self, d: Direction) -> &mut DirectionAggregate {
        match d {
            Direction::Long => &mut self.long,
            Direction::Short => &mut self.short,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ExposureSnapshot {
    pub count_same_direction: u32,
    pub sum_total: f64,
    pub sum_same_direction: f64,
    pub last_same_direction_ts: Option<DateTime<Utc>>,
    pub last_opposite_ts: Option<DateTime<Utc>>,
    pub hourly_count_same_direction: u32,
    pub hourly_count_total: u32,
}

pub struct ExposureIndex {
    clock: SharedClock,
    inner: RwLock<HashMap<String, SymbolAggregate>>,
}

impl ExposureIndex {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds the whole index from the persisted ACTIVE rows, called once
    /// at startup.
    pub fn rebuild(&self, active_rows: &[Recommendation]) {
        let mut map: HashMap<String, SymbolAggregate> = HashMap::new();
        for rec in active_rows {
            let agg = map.entry(rec.symbol.clone()).or_default();
            let d = agg.dir_mut(rec.direction);
            d.count += 1;
            d.exposure_sum += rec.position_size * rec.leverage;
            d.entries.push(rec.created_at);
            d.last_created_ts = Some(match d.last_created_ts {
                Some(prev) if prev >= rec.created_at => prev,
                _ => rec.created_at,
            });
        }
        *self.inner.write() = map;
    }

    pub fn record_admit(&self, rec: &Recommendation) {
        let now = self.clock.now();
        let mut map = self.inner.write();
        let agg = map.entry(rec.symbol.clone()).or_default();
        {
            let d = agg.dir_mut(rec.direction);
            d.count += 1;
            d.exposure_sum += rec.position_size * rec.leverage;
            d.entries.push(rec.created_at);
            d.last_created_ts = Some(rec.created_at);
            d.hourly_created_ts.push(now);
            d.hourly_created_ts
                .retain(|ts| (now - *ts) < chrono::Duration::hours(1));
        }
        agg.last_opposite_ts.insert(rec.direction.opposite(), now);
    }

    pub fn record_close(&self, rec: &Recommendation) {
        let mut map = self.inner.write();
        if let Some(agg) = map.get_mut(&rec.symbol) {
            let d = agg.dir_mut(rec.direction);
            d.count = d.count.saturating_sub(1);
            d.exposure_sum = (d.exposure_sum - rec.position_size * rec.leverage).max(0.0);
            if let Some(pos) = d.entries.iter().position(|t| *t == rec.created_at) {
                d.entries.remove(pos);
            }
        }
    }

    /// Snapshot consumed by the Gate Pipeline under a short critical
    /// section. `age_window_hours` implements `concurrency_count_age_hours`
    /// — only entries younger than the window count toward the same
    /// direction's active count.
    pub fn snapshot(
        &self,
        symbol: &str,
        direction: Direction,
        age_window_hours: f64,
    ) -> ExposureSnapshot {
        let now = self.clock.now();
        let map = self.inner.read();
        let Some(agg) = map.get(symbol) else {
            return ExposureSnapshot {
                count_same_direction: 0,
                sum_total: 0.0,
                sum_same_direction: 0.0,
                last_same_direction_ts: None,
                last_opposite_ts: None,
                hourly_count_same_direction: 0,
                hourly_count_total: 0,
            };
        };
        let same = agg.dir(direction);
        let opposite = agg.dir(direction.opposite());
        let window = chrono::Duration::milliseconds((age_window_hours * 3_600_000.0) as i64);
        let count_same_direction = same
            .entries
            .iter()
            .filter(|t| (now - **t) < window)
            .count() as u32;

        ExposureSnapshot {
            count_same_direction,
            sum_total: same.exposure_sum + opposite.exposure_sum,
            sum_same_direction: same.exposure_sum,
            last_same_direction_ts: same.last_created_ts,
            last_opposite_ts: agg.last_opposite_ts.get(&direction).copied(),
            hourly_count_same_direction: same.hourly_created_ts.len() as u32,
            hourly_count_total: (same.hourly_created_ts.len() + opposite.hourly_created_ts.len())
                as u32,
        }
    }

    pub fn has_active_opposite(&self, symbol: &str, direction: Direction) -> bool {
        let map = self.inner.read();
        map.get(symbol)
            .map(|agg| agg.dir(direction.opposite()).count > 0)
            .unwrap_or(false)
    }
}
