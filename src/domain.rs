//! Core data model: recommendations, decision chains, executions, monitoring
//! samples. Plain serde structs in the teacher's style — wire vocabulary
//! matches the HTTP contract exactly (SCREAMING_SNAKE_CASE enum values).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            other => Err(crate::error::EngineError::Validation(format!(
                "unknown direction '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationStatus {
    Active,
    Closed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Breakeven,
    Timeout,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationSource {
    Manual,
    AutoGeneration,
    Unittest,
}

/// Multi-timeframe agreement payload carried on admission metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiTfConsistency {
    pub agreement: f64,
    #[serde(rename = "dominantDirection")]
    pub dominant_direction: Direction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendationMetadata {
    #[serde(rename = "multiTFConsistency", skip_serializing_if = "Option::is_none")]
    pub multi_tf_consistency: Option<MultiTfConsistency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub current_price: f64,
    pub leverage: f64,
    pub position_size: f64,

    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_override: Option<TrailingConfig>,

    pub atr_value: f64,
    pub atr_period: u32,
    pub atr_sl_multiplier: f64,
    pub atr_tp_multiplier: f64,

    pub tp1_hit: bool,
    pub tp2_hit: bool,
    pub tp3_hit: bool,
    pub reduction_count: u32,
    pub reduction_ratio: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_return: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ev: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ev_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ev_ok: Option<bool>,

    pub status: RecommendationStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_amount: Option<f64>,

    /// Stop after trailing/breakeven adjustment; distinct from the
    /// originally computed `stop_loss_price` so the tracker never loses the
    /// entry-derived floor.
    pub effective_stop_price: f64,
    pub best_favourable_price: f64,
    pub close_pending: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<RecommendationSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub metadata: RecommendationMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfig {
    pub enabled: bool,
    pub activate_on_breakeven: bool,
    pub activate_profit_pct: f64,
    pub percent: f64,
    pub min_step: f64,
}

/// pnl_percent = ((exit-entry)/entry) * leverage for LONG, negated for SHORT.
pub fn pnl_percent(direction: Direction, entry_price: f64, exit_price: f64, leverage: f64) -> f64 {
    let raw = (exit_price - entry_price) / entry_price * leverage * 100.0;
    match direction {
        Direction::Long => raw,
        Direction::Short => -raw,
    }
}

pub fn pnl_amount(pnl_percent: f64, position_size: f64) -> f64 {
    pnl_percent / 100.0 * position_size
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainDecision {
    Approved,
    Rejected,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionStep {
    pub stage: String,
    pub decision: ChainDecision,
    pub reason: String,
    #[serde(default)]
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionChain {
    pub chain_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub source: RecommendationSource,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    pub final_decision: ChainDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub steps: Vec<DecisionStep>,
    /// Captured admission inputs (candidate, config snapshot, exposure
    /// snapshot, price snapshot) so `replay` can reconstruct a GateContext
    /// without a schema migration every time a new gate is added.
    #[serde(default)]
    pub captured_inputs: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEventType {
    Open,
    Close,
    Reduce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub event_type: ExecutionEventType,
    pub recommendation_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub intended_price: f64,
    pub intended_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage_bps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_bps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_percent: Option<f64>,
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSample {
    pub id: String,
    pub recommendation_id: String,
    pub check_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub extra: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pnl_formula_long() {
        let p = pnl_percent(Direction::Long, 1000.0, 1100.0, 2.0);
        assert!((p - 20.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_formula_short_is_negated() {
        let p = pnl_percent(Direction::Short, 1000.0, 1100.0, 2.0);
        assert!((p + 20.0).abs() < 1e-9);
    }

    #[test]
    fn direction_opposite_roundtrips() {
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Short.opposite().opposite(), Direction::Short);
    }
}
