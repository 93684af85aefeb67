//! Per-symbol latest price with a test-time override, TTL'd. The real feed
//! is external (an exchange/market-data connector pushes ticks in); this
//! module is only the in-memory map and override mechanism.

use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct PriceEntry {
    price: f64,
    ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Override {
    price: f64,
    installed_at: DateTime<Utc>,
    ttl_ms: i64,
}

impl Override {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        (now - self.installed_at).num_milliseconds() < self.ttl_ms
    }
}

/// Same TTL'd-override mechanism as `PriceFeed`'s override map, generalized
/// so the FGI and funding-rate testing hooks (§6) can reuse it instead of
/// growing their own copy. FGI has no symbol of its own, so callers key it
/// under a constant (`"global"`); funding rate is keyed by symbol like price.
pub struct TestSignalOverrides {
    clock: SharedClock,
    entries: RwLock<HashMap<String, Override>>,
    allow: std::sync::atomic::AtomicBool,
}

pub const FGI_GLOBAL_KEY: &str = "global";

impl TestSignalOverrides {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
            allow: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_allow(&self, allowed: bool) {
        self.allow.store(allowed, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn set(&self, key: &str, value: f64, ttl_ms: i64) -> EngineResult<()> {
        if !self.allow.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(EngineError::Validation(
                "this testing override is disabled by runtime config".to_string(),
            ));
        }
        let now = self.clock.now();
        self.entries.write().insert(
            key.to_string(),
            Override {
                price: value,
                installed_at: now,
                ttl_ms,
            },
        );
        Ok(())
    }

    pub fn clear(&self, key: Option<&str>) {
        match key {
            Some(k) => {
                self.entries.write().remove(k);
            }
            None => {
                self.entries.write().clear();
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        let now = self.clock.now();
        self.entries
            .read()
            .get(key)
            .filter(|ov| ov.is_live(now))
            .map(|ov| ov.price)
    }
}

/// Boundary trait an external market-data connector implements to push
/// ticks in. No concrete exchange connector ships with this crate — that is
/// explicitly out of scope.
pub trait PriceSource: Send + Sync {
    fn push(&self, symbol: &str, price: f64);
}

pub struct PriceFeed {
    clock: SharedClock,
    live: RwLock<HashMap<String, PriceEntry>>,
    overrides: RwLock<HashMap<String, Override>>,
    allow_override: std::sync::atomic::AtomicBool,
}

impl PriceFeed {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            live: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            allow_override: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_allow_override(&self, allowed: bool) {
        self.allow_override
            .store(allowed, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn push(&self, symbol: &str, price: f64) {
        let now = self.clock.now();
        self.live
            .write()
            .insert(symbol.to_string(), PriceEntry { price, ts: now });
    }

    /// Installs a test-time value that expires after `ttl_ms`. Only
    /// accepted when `testing.allow_price_override = true`; the caller
    /// (admission/config layer) is responsible for gating this on the
    /// RuntimeConfig snapshot before calling.
    pub fn set_override(&self, symbol: &str, price: f64, ttl_ms: i64) -> EngineResult<()> {
        if !self.allow_override.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(EngineError::Validation(
                "price overrides are disabled by runtime config".to_string(),
            ));
        }
        let now = self.clock.now();
        self.overrides.write().insert(
            symbol.to_string(),
            Override {
                price,
                installed_at: now,
                ttl_ms,
            },
        );
        Ok(())
    }

    pub fn clear_override(&self, symbol: Option<&str>) {
        match symbol {
            Some(sym) => {
                self.overrides.write().remove(sym);
            }
            None => {
                self.overrides.write().clear();
            }
        }
    }

    /// Returns the override if live, else the latest real tick, else
    /// `NoPrice`.
    pub fn get(&self, symbol: &str) -> EngineResult<f64> {
        let now = self.clock.now();
        if let Some(ov) = self.overrides.read().get(symbol) {
            if ov.is_live(now) {
                return Ok(ov.price);
            }
        }
        self.live
            .read()
            .get(symbol)
            .map(|e| e.price)
            .ok_or_else(|| EngineError::NoPrice(symbol.to_string()))
    }
}

impl PriceSource for PriceFeed {
    fn push(&self, symbol: &str, price: f64) {
        PriceFeed::push(self, symbol, price);
    }
}

pub type SharedPriceFeed = Arc<PriceFeed>;
