//! Runtime configuration: an immutable snapshot swapped atomically by a
//! single writer. Replaces the "mutable module state" pattern the source
//! used for thresholds/caps/cooldowns/flags (§9 redesign note).

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetExposureCaps {
    pub total: f64,
    pub per_direction_long: f64,
    pub per_direction_short: f64,
}

impl Default for NetExposureCaps {
    fn default() -> Self {
        Self {
            total: f64::INFINITY,
            per_direction_long: f64::INFINITY,
            per_direction_short: f64::INFINITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyOrderCaps {
    pub total: Option<u32>,
    pub per_direction: Option<u32>,
}

impl Default for HourlyOrderCaps {
    fn default() -> Self {
        Self {
            total: None,
            per_direction: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryFilters {
    pub require_mtf_agreement: bool,
    pub min_mtf_agreement: f64,
}

impl Default for EntryFilters {
    fn default() -> Self {
        Self {
            require_mtf_agreement: false,
            min_mtf_agreement: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingSettings {
    pub enabled: bool,
    pub activate_on_breakeven: bool,
    pub activate_profit_pct: f64,
    pub percent: f64,
    pub min_step: f64,
}

impl Default for TrailingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            activate_on_breakeven: true,
            activate_profit_pct: 2.0,
            percent: 1.0,
            min_step: 0.0,
        }
    }
}

/// Partial take-profit ladder. The spec's data model carries `tp1_hit`
/// `tp2_hit` `tp3_hit` booleans but leaves the levels that trigger them
/// unspecified; levels here are fractions of the entry-to-take-profit
/// distance (e.g. `tp1_ratio=0.5` fires TP1 halfway to `take_profit_price`),
/// and each level reduces the position by `reduction_per_level` and raises
/// `effective_stop_price` to entry once `move_stop_to_breakeven_on_tp1` is
/// set. Disabled by default: a recommendation without partial levels
/// configured closes wholesale on the final take-profit level, same as
/// today's `tp3_hit` check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialTakeProfit {
    pub enabled: bool,
    pub tp1_ratio: f64,
    pub tp2_ratio: f64,
    pub tp3_ratio: f64,
    pub reduction_per_level: f64,
    pub move_stop_to_breakeven_on_tp1: bool,
}

impl Default for PartialTakeProfit {
    fn default() -> Self {
        Self {
            enabled: false,
            tp1_ratio: 0.5,
            tp2_ratio: 0.75,
            tp3_ratio: 1.0,
            reduction_per_level: 0.33,
            move_stop_to_breakeven_on_tp1: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestingSettings {
    pub allow_price_override: bool,
    pub allow_fgi_override: bool,
    pub allow_funding_rate_override: bool,
}

impl Default for TestingSettings {
    fn default() -> Self {
        Self {
            allow_price_override: false,
            allow_fgi_override: false,
            allow_funding_rate_override: false,
        }
    }
}

/// Whether EV_GATE hard-rejects or merely records `ev_ok` on the row. The
/// spec leaves the default advisory (§9 open question #1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvGateMode {
    Advisory,
    HardReject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub cooldown_same_direction_ms: i64,
    pub cooldown_opposite_ms: i64,
    pub global_min_interval_ms: i64,
    pub max_same_direction_actives: u32,
    pub concurrency_count_age_hours: f64,
    pub net_exposure_caps: NetExposureCaps,
    pub hourly_order_caps: HourlyOrderCaps,
    pub min_holding_minutes: f64,
    pub max_holding_hours: f64,
    pub duplicate_bps_threshold: f64,
    pub entry_filters: EntryFilters,
    pub allow_opposite_while_open: bool,
    pub opposite_min_confidence: f64,
    pub trailing: TrailingSettings,
    pub partial_take_profit: PartialTakeProfit,
    pub testing: TestingSettings,
    pub ev_threshold_default: f64,
    pub ev_gate_mode: EvGateMode,
    pub tick_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cooldown_same_direction_ms: 60_000,
            cooldown_opposite_ms: 0,
            global_min_interval_ms: 0,
            max_same_direction_actives: 3,
            concurrency_count_age_hours: 24.0,
            net_exposure_caps: NetExposureCaps::default(),
            hourly_order_caps: HourlyOrderCaps::default(),
            min_holding_minutes: 0.0,
            max_holding_hours: 0.0,
            duplicate_bps_threshold: 20.0,
            entry_filters: EntryFilters::default(),
            allow_opposite_while_open: true,
            opposite_min_confidence: 0.6,
            trailing: TrailingSettings::default(),
            partial_take_profit: PartialTakeProfit::default(),
            testing: TestingSettings::default(),
            ev_threshold_default: 0.0,
            ev_gate_mode: EvGateMode::Advisory,
            tick_interval_ms: 2_000,
        }
    }
}

impl RuntimeConfig {
    /// Loads an initial snapshot from the environment. Dotenv-first, then
    /// `env::var(...).ok().and_then(parse).filter(valid).unwrap_or(default)`
    /// chains — same shape as `VaultEngineConfig::from_env` in the teacher.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let env_i64 = |key: &str, default: i64| {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v >= 0)
                .unwrap_or(default)
        };
        let env_f64 = |key: &str, default: f64| {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(default)
        };
        let env_u32 = |key: &str, default: u32| {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(default)
        };
        let env_bool = |key: &str, default: bool| {
            env::var(key)
                .ok()
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
                .unwrap_or(default)
        };

        Self {
            cooldown_same_direction_ms: env_i64(
                "RECO_COOLDOWN_SAME_DIRECTION_MS",
                defaults.cooldown_same_direction_ms,
            ),
            cooldown_opposite_ms: env_i64(
                "RECO_COOLDOWN_OPPOSITE_MS",
                defaults.cooldown_opposite_ms,
            ),
            global_min_interval_ms: env_i64(
                "RECO_GLOBAL_MIN_INTERVAL_MS",
                defaults.global_min_interval_ms,
            ),
            max_same_direction_actives: env_u32(
                "RECO_MAX_SAME_DIRECTION_ACTIVES",
                defaults.max_same_direction_actives,
            ),
            concurrency_count_age_hours: env_f64(
                "RECO_CONCURRENCY_COUNT_AGE_HOURS",
                defaults.concurrency_count_age_hours,
            ),
            net_exposure_caps: NetExposureCaps {
                total: env_f64("RECO_NET_EXPOSURE_CAP_TOTAL", defaults.net_exposure_caps.total),
                per_direction_long: env_f64(
                    "RECO_NET_EXPOSURE_CAP_LONG",
                    defaults.net_exposure_caps.per_direction_long,
                ),
                per_direction_short: env_f64(
                    "RECO_NET_EXPOSURE_CAP_SHORT",
                    defaults.net_exposure_caps.per_direction_short,
                ),
            },
            hourly_order_caps: HourlyOrderCaps {
                total: env::var("RECO_HOURLY_ORDER_CAP_TOTAL")
                    .ok()
                    .and_then(|v| v.parse::<u32>().ok()),
                per_direction: env::var("RECO_HOURLY_ORDER_CAP_PER_DIRECTION")
                    .ok()
                    .and_then(|v| v.parse::<u32>().ok()),
            },
            min_holding_minutes: env_f64("RECO_MIN_HOLDING_MINUTES", defaults.min_holding_minutes),
            max_holding_hours: env_f64("RECO_MAX_HOLDING_HOURS", defaults.max_holding_hours),
            duplicate_bps_threshold: env_f64(
                "RECO_DUPLICATE_BPS_THRESHOLD",
                defaults.duplicate_bps_threshold,
            ),
            entry_filters: EntryFilters {
                require_mtf_agreement: env_bool(
                    "RECO_REQUIRE_MTF_AGREEMENT",
                    defaults.entry_filters.require_mtf_agreement,
                ),
                min_mtf_agreement: env_f64(
                    "RECO_MIN_MTF_AGREEMENT",
                    defaults.entry_filters.min_mtf_agreement,
                ),
            },
            allow_opposite_while_open: env_bool(
                "RECO_ALLOW_OPPOSITE_WHILE_OPEN",
                defaults.allow_opposite_while_open,
            ),
            opposite_min_confidence: env_f64(
                "RECO_OPPOSITE_MIN_CONFIDENCE",
                defaults.opposite_min_confidence,
            ),
            trailing: TrailingSettings {
                enabled: env_bool("RECO_TRAILING_ENABLED", defaults.trailing.enabled),
                activate_on_breakeven: env_bool(
                    "RECO_TRAILING_ACTIVATE_ON_BREAKEVEN",
                    defaults.trailing.activate_on_breakeven,
                ),
                activate_profit_pct: env_f64(
                    "RECO_TRAILING_ACTIVATE_PROFIT_PCT",
                    defaults.trailing.activate_profit_pct,
                ),
                percent: env_f64("RECO_TRAILING_PERCENT", defaults.trailing.percent),
                min_step: env_f64("RECO_TRAILING_MIN_STEP", defaults.trailing.min_step),
            },
            partial_take_profit: PartialTakeProfit {
                enabled: env_bool("RECO_PARTIAL_TP_ENABLED", defaults.partial_take_profit.enabled),
                tp1_ratio: env_f64("RECO_PARTIAL_TP1_RATIO", defaults.partial_take_profit.tp1_ratio),
                tp2_ratio: env_f64("RECO_PARTIAL_TP2_RATIO", defaults.partial_take_profit.tp2_ratio),
                tp3_ratio: env_f64("RECO_PARTIAL_TP3_RATIO", defaults.partial_take_profit.tp3_ratio),
                reduction_per_level: env_f64(
                    "RECO_PARTIAL_TP_REDUCTION_PER_LEVEL",
                    defaults.partial_take_profit.reduction_per_level,
                ),
                move_stop_to_breakeven_on_tp1: env_bool(
                    "RECO_PARTIAL_TP_MOVE_STOP_ON_TP1",
                    defaults.partial_take_profit.move_stop_to_breakeven_on_tp1,
                ),
            },
            testing: TestingSettings {
                allow_price_override: env_bool(
                    "RECO_ALLOW_PRICE_OVERRIDE",
                    defaults.testing.allow_price_override,
                ),
                allow_fgi_override: env_bool(
                    "RECO_ALLOW_FGI_OVERRIDE",
                    defaults.testing.allow_fgi_override,
                ),
                allow_funding_rate_override: env_bool(
                    "RECO_ALLOW_FUNDING_RATE_OVERRIDE",
                    defaults.testing.allow_funding_rate_override,
                ),
            },
            ev_threshold_default: env_f64("RECO_EV_THRESHOLD_DEFAULT", defaults.ev_threshold_default),
            ev_gate_mode: if env_bool("RECO_EV_GATE_HARD_REJECT", false) {
                EvGateMode::HardReject
            } else {
                EvGateMode::Advisory
            },
            tick_interval_ms: env::var("RECO_TICK_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.tick_interval_ms),
        }
    }
}

/// Recursively overlays `patch` onto `base`, field by field, so a
/// `POST /config` body only needs to carry the keys it wants to change.
/// Unknown keys in `patch` are copied through harmlessly; they are dropped
/// a moment later when the merged value fails to deserialize into
/// `RuntimeConfig` and the caller falls back to the unmerged base.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(base_map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

/// Maps a documented camelCase wire key to the `RuntimeConfig` field it
/// patches. Keys already in snake_case (or unrecognized) pass through
/// untouched so plain `RuntimeConfig`-shaped patches keep working.
fn aliased_top_level_key(key: &str) -> Option<&'static str> {
    match key {
        "signalCooldownMs" => Some("cooldown_same_direction_ms"),
        "oppositeCooldownMs" => Some("cooldown_opposite_ms"),
        "globalMinIntervalMs" => Some("global_min_interval_ms"),
        "maxSameDirectionActives" => Some("max_same_direction_actives"),
        "concurrencyCountAgeHours" => Some("concurrency_count_age_hours"),
        "netExposureCaps" => Some("net_exposure_caps"),
        "hourlyOrderCaps" => Some("hourly_order_caps"),
        "minHoldingMinutes" => Some("min_holding_minutes"),
        "maxHoldingHours" => Some("max_holding_hours"),
        "duplicateBpsThreshold" => Some("duplicate_bps_threshold"),
        "entryFilters" => Some("entry_filters"),
        "allowOppositeWhileOpen" => Some("allow_opposite_while_open"),
        "oppositeMinConfidence" => Some("opposite_min_confidence"),
        "partialTakeProfit" => Some("partial_take_profit"),
        "evThresholdDefault" => Some("ev_threshold_default"),
        "evGateMode" => Some("ev_gate_mode"),
        "tickIntervalMs" => Some("tick_interval_ms"),
        _ => None,
    }
}

fn normalize_net_exposure_caps(value: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(map) = value else {
        return value;
    };
    let mut out = serde_json::Map::new();
    for (k, v) in map {
        match k.as_str() {
            "perDirectionLong" => {
                out.insert("per_direction_long".to_string(), v);
            }
            "perDirectionShort" => {
                out.insert("per_direction_short".to_string(), v);
            }
            "perDirection" => {
                if let serde_json::Value::Object(dir) = v {
                    if let Some(long) = dir.get("LONG") {
                        out.insert("per_direction_long".to_string(), long.clone());
                    }
                    if let Some(short) = dir.get("SHORT") {
                        out.insert("per_direction_short".to_string(), short.clone());
                    }
                }
            }
            other => {
                out.insert(other.to_string(), v);
            }
        }
    }
    serde_json::Value::Object(out)
}

fn insert_aliased(out: &mut serde_json::Map<String, serde_json::Value>, key: &str, value: serde_json::Value) {
    match key {
        "requireMTFAgreement" => merge_into_nested(out, "entry_filters", "require_mtf_agreement", value),
        "minMTFAgreement" => merge_into_nested(out, "entry_filters", "min_mtf_agreement", value),
        _ => {
            let mapped = aliased_top_level_key(key).unwrap_or(key).to_string();
            let value = if mapped == "net_exposure_caps" {
                normalize_net_exposure_caps(value)
            } else {
                value
            };
            out.insert(mapped, value);
        }
    }
}

fn merge_into_nested(
    out: &mut serde_json::Map<String, serde_json::Value>,
    parent: &str,
    child: &str,
    value: serde_json::Value,
) {
    let entry = out
        .entry(parent.to_string())
        .or_insert_with(|| serde_json::Value::Object(Default::default()));
    if let serde_json::Value::Object(m) = entry {
        m.insert(child.to_string(), value);
    }
}

/// Rewrites the documented camelCase/`risk.*` wire shape (`signalCooldownMs`,
/// `maxHoldingHours`, `risk.maxSameDirectionActives`, ...) onto the
/// snake_case field names `RuntimeConfig` actually serializes as, so
/// `POST /config` bodies written against the §6 contract patch the right
/// fields instead of silently merging in as unknown keys. Patches already
/// shaped like `RuntimeConfig` pass through unchanged.
fn normalize_config_patch(patch: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(map) = patch else {
        return patch;
    };
    let mut out = serde_json::Map::new();
    for (k, v) in map {
        if k == "risk" {
            if let serde_json::Value::Object(inner) = v {
                for (rk, rv) in inner {
                    insert_aliased(&mut out, &rk, rv);
                }
            }
            continue;
        }
        insert_aliased(&mut out, &k, v);
    }
    serde_json::Value::Object(out)
}

/// Merges `patch` onto the current `RuntimeConfig` and returns the result.
/// Unknown top-level fields are ignored (they merge in but `RuntimeConfig`
/// doesn't deny_unknown_fields, so they simply don't round-trip); fields
/// that fail to parse leave the existing value in place by virtue of the
/// merge happening against a full snapshot rather than a bare default.
pub fn merge_runtime_config(
    base: &RuntimeConfig,
    patch: serde_json::Value,
) -> Result<RuntimeConfig, serde_json::Error> {
    let mut merged = serde_json::to_value(base)?;
    let patch = normalize_config_patch(patch);
    merge_json(&mut merged, &patch);
    serde_json::from_value(merged)
}

/// Single-writer, atomically-swapped handle. Readers call `.load()` and get
/// a consistent `Arc<RuntimeConfig>` snapshot; a config update builds a new
/// `RuntimeConfig` and calls `.store(...)` once.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<RuntimeConfig>>,
}

impl ConfigHandle {
    pub fn new(initial: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        self.inner.load_full()
    }

    pub fn swap(&self, new: RuntimeConfig) {
        self.inner.store(Arc::new(new));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_loose_caps() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.net_exposure_caps.total.is_infinite());
        assert_eq!(cfg.ev_gate_mode, EvGateMode::Advisory);
    }

    #[test]
    fn merge_runtime_config_only_touches_named_fields() {
        let base = RuntimeConfig::default();
        let patch = serde_json::json!({ "max_same_direction_actives": 7, "unknown_field": "ignored" });
        let merged = merge_runtime_config(&base, patch).unwrap();
        assert_eq!(merged.max_same_direction_actives, 7);
        assert_eq!(merged.cooldown_same_direction_ms, base.cooldown_same_direction_ms);
    }

    #[test]
    fn merge_runtime_config_rejects_invalid_shape() {
        let base = RuntimeConfig::default();
        let patch = serde_json::json!({ "trailing": "not-an-object" });
        assert!(merge_runtime_config(&base, patch).is_err());
    }

    #[test]
    fn merge_runtime_config_accepts_documented_camel_case_keys() {
        let base = RuntimeConfig::default();
        let patch = serde_json::json!({
            "signalCooldownMs": 2000,
            "oppositeCooldownMs": 0,
            "maxHoldingHours": 24.0,
            "minHoldingMinutes": 0.0,
            "netExposureCaps": { "total": 1.5, "perDirectionLong": 1.0 },
            "requireMTFAgreement": true,
            "minMTFAgreement": 0.7,
            "risk": { "maxSameDirectionActives": 3 },
        });
        let merged = merge_runtime_config(&base, patch).unwrap();
        assert_eq!(merged.cooldown_same_direction_ms, 2000);
        assert_eq!(merged.cooldown_opposite_ms, 0);
        assert_eq!(merged.max_holding_hours, 24.0);
        assert_eq!(merged.min_holding_minutes, 0.0);
        assert_eq!(merged.net_exposure_caps.total, 1.5);
        assert_eq!(merged.net_exposure_caps.per_direction_long, 1.0);
        assert!(merged.entry_filters.require_mtf_agreement);
        assert_eq!(merged.entry_filters.min_mtf_agreement, 0.7);
        assert_eq!(merged.max_same_direction_actives, 3);
    }

    #[test]
    fn handle_swap_is_visible_to_existing_snapshot_holders_only_after_reload() {
        let handle = ConfigHandle::new(RuntimeConfig::default());
        let snap1 = handle.snapshot();
        let mut updated = RuntimeConfig::default();
        updated.max_same_direction_actives = 99;
        handle.swap(updated);
        let snap2 = handle.snapshot();
        assert_eq!(snap1.max_same_direction_actives, 3);
        assert_eq!(snap2.max_same_direction_actives, 99);
    }
}
