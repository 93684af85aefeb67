//! Wire-level request/response shapes for the HTTP surface. Kept distinct
//! from the domain structs in `domain.rs` so the external contract can
//! evolve (new optional fields, renamed query params) without touching the
//! engine's internal types.

use crate::domain::{
    Direction, MultiTfConsistency, Recommendation, RecommendationMetadata, RecommendationSource,
};
use crate::gates::AdmissionRequest;
use crate::query::BinMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct CreateRecommendationBody {
    pub symbol: String,
    pub direction: Direction,
    #[serde(rename = "entryPrice")]
    pub entry_price: f64,
    #[serde(rename = "currentPrice", default)]
    pub current_price: Option<f64>,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(rename = "positionSize", default)]
    pub position_size: f64,
    #[serde(rename = "strategyType", default)]
    pub strategy_type: Option<String>,
    #[serde(rename = "takeProfitPrice", default)]
    pub take_profit_price: Option<f64>,
    #[serde(rename = "stopLossPrice", default)]
    pub stop_loss_price: Option<f64>,
    #[serde(rename = "bypassCooldown", default)]
    pub bypass_cooldown: Option<Value>,
    #[serde(default)]
    pub ev: Option<f64>,
    #[serde(rename = "evThreshold", default)]
    pub ev_threshold: Option<f64>,
    #[serde(rename = "abGroup", default)]
    pub ab_group: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(rename = "multiTFConsistency", default)]
    pub multi_tf_consistency: Option<MultiTfConsistency>,
    #[serde(rename = "atrValue", default)]
    pub atr_value: f64,
    #[serde(rename = "atrPeriod", default = "default_atr_period")]
    pub atr_period: u32,
    #[serde(rename = "atrSlMultiplier", default = "default_atr_sl_multiplier")]
    pub atr_sl_multiplier: f64,
    #[serde(rename = "atrTpMultiplier", default = "default_atr_tp_multiplier")]
    pub atr_tp_multiplier: f64,
    #[serde(default = "default_source")]
    pub source: RecommendationSource,
}

fn default_leverage() -> f64 {
    1.0
}

fn default_atr_period() -> u32 {
    14
}
fn default_atr_sl_multiplier() -> f64 {
    2.0
}
fn default_atr_tp_multiplier() -> f64 {
    3.0
}
fn default_source() -> RecommendationSource {
    RecommendationSource::Manual
}

impl CreateRecommendationBody {
    pub fn into_admission_request(self) -> AdmissionRequest {
        AdmissionRequest {
            symbol: self.symbol,
            direction: self.direction,
            entry_price: self.entry_price,
            current_price: self.current_price,
            leverage: self.leverage,
            position_size: self.position_size,
            strategy_type: self.strategy_type,
            take_profit_price: self.take_profit_price,
            stop_loss_price: self.stop_loss_price,
            bypass_cooldown: self.bypass_cooldown,
            ev: self.ev,
            ev_threshold: self.ev_threshold,
            ab_group: self.ab_group,
            confidence: self.confidence,
            metadata: RecommendationMetadata {
                multi_tf_consistency: self.multi_tf_consistency,
                confidence: self.confidence,
            },
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ActiveQuery {
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub symbol: Option<String>,
    pub status: Option<crate::domain::RecommendationStatus>,
    #[serde(rename = "abGroup")]
    pub ab_group: Option<String>,
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    #[serde(rename = "exitPrice", default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExpireRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PriceOverrideRequest {
    pub symbol: String,
    pub price: f64,
    #[serde(rename = "ttlMs", default = "default_override_ttl_ms")]
    pub ttl_ms: i64,
}

fn default_override_ttl_ms() -> i64 {
    60_000
}

#[derive(Debug, Deserialize, Default)]
pub struct PriceOverrideClearRequest {
    pub symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FgiOverrideRequest {
    pub value: f64,
    #[serde(rename = "ttlMs", default = "default_override_ttl_ms")]
    pub ttl_ms: i64,
}

#[derive(Debug, Deserialize)]
pub struct FundingRateOverrideRequest {
    pub symbol: String,
    pub rate: f64,
    #[serde(rename = "ttlMs", default = "default_override_ttl_ms")]
    pub ttl_ms: i64,
}

#[derive(Debug, Deserialize, Default)]
pub struct FundingRateOverrideClearRequest {
    pub symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdateBody(pub Value);

#[derive(Debug, Deserialize, Default)]
pub struct StatsQuery {
    #[serde(default = "default_bin_count")]
    pub bins: usize,
    #[serde(rename = "binMode", default)]
    pub bin_mode: Option<String>,
    #[serde(default)]
    pub start: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub end: Option<chrono::DateTime<chrono::Utc>>,
    /// Comma-separated list of `ab_group` values. Populates
    /// `by_ab_group` in the response once two or more are named (§6).
    #[serde(rename = "ab_group", default)]
    pub ab_group: Option<String>,
    #[serde(rename = "group_by", default)]
    pub group_by: Option<String>,
}

fn default_bin_count() -> usize {
    10
}

pub fn parse_bin_mode(s: Option<&str>) -> BinMode {
    match s {
        Some("quantile") => BinMode::Quantile,
        _ => BinMode::Even,
    }
}

pub fn parse_ab_groups(s: Option<&str>) -> Vec<String> {
    s.map(|v| v.split(',').map(|g| g.trim().to_string()).filter(|g| !g.is_empty()).collect())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize, Default)]
pub struct ChainListQuery {
    pub symbol: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize, Default)]
pub struct BatchReplayBody {
    #[serde(rename = "chainIds")]
    pub chain_ids: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(rename = "maxConcurrency", default)]
    pub max_concurrency: usize,
    #[serde(rename = "includeAnalysis", default = "default_true")]
    pub include_analysis: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(rename = "trackerRunning")]
    pub tracker_running: bool,
    #[serde(rename = "activeCount")]
    pub active_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ActiveListResponse {
    pub count: usize,
    pub recommendations: Vec<Recommendation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_body_defaults_leverage_position_size_and_atr_value() {
        let body: CreateRecommendationBody = serde_json::from_value(serde_json::json!({
            "symbol": "ETH",
            "direction": "LONG",
            "entryPrice": 1000.0,
        }))
        .unwrap();
        assert_eq!(body.leverage, 1.0);
        assert_eq!(body.position_size, 0.0);
        assert_eq!(body.atr_value, 0.0);
        assert_eq!(body.current_price, None);
        assert_eq!(body.atr_period, 14);
    }

    #[test]
    fn create_body_honours_explicit_current_price() {
        let body: CreateRecommendationBody = serde_json::from_value(serde_json::json!({
            "symbol": "ETH",
            "direction": "LONG",
            "entryPrice": 1000.0,
            "currentPrice": 1005.0,
            "leverage": 3.0,
        }))
        .unwrap();
        assert_eq!(body.current_price, Some(1005.0));
        assert_eq!(body.leverage, 3.0);
        assert_eq!(body.into_admission_request().current_price, Some(1005.0));
    }

    #[test]
    fn batch_replay_body_defaults_include_analysis_true() {
        let body: BatchReplayBody = serde_json::from_value(serde_json::json!({
            "chainIds": ["a", "b"],
        }))
        .unwrap();
        assert!(body.include_analysis);
        assert_eq!(body.max_concurrency, 0);
        assert!(!body.parallel);
    }
}
