//! Ordered admission checks. Modeled as a list of gate objects, each
//! exposing `evaluate(ctx) -> Pass | Reject`; the pipeline is a fold over
//! this list that stops at the first rejection (§9 redesign note — this
//! replaces a conditional-branch gate chain with something unit-testable in
//! isolation and replayable).

use crate::config::{EvGateMode, RuntimeConfig};
use crate::domain::{Direction, RecommendationMetadata};
use crate::error::EngineError;
use crate::exposure::ExposureSnapshot;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Proposal submitted to the Admission Controller, prior to gate
/// evaluation. Fields mirror the `POST /recommendations` body in the
/// external contract.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdmissionRequest {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub current_price: Option<f64>,
    pub leverage: f64,
    pub position_size: f64,
    pub strategy_type: Option<String>,
    pub take_profit_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    /// Strict-boolean bypass flag. Carried as a raw JSON value so the
    /// pipeline can distinguish `true` from the strings `"true"`/`"false"`
    /// instead of a deserializer silently coercing one into the other.
    pub bypass_cooldown: Option<serde_json::Value>,
    pub ev: Option<f64>,
    pub ev_threshold: Option<f64>,
    pub ab_group: Option<String>,
    pub confidence: Option<f64>,
    pub metadata: RecommendationMetadata,
}

/// True only for the JSON boolean literal `true`. A string "true"/"false"
/// never bypasses cooldown — this is the regression the spec calls out by
/// name (§9).
pub fn is_strict_bypass(value: &Option<serde_json::Value>) -> bool {
    matches!(value, Some(serde_json::Value::Bool(true)))
}

/// A same symbol+direction ACTIVE row close enough in price to be treated
/// as a duplicate candidate, or close enough in time to matter for
/// cooldown/opposite checks.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActiveNeighbor {
    pub id: String,
    pub entry_price: f64,
    pub created_at: DateTime<Utc>,
}

pub struct GateContext<'a> {
    pub candidate: &'a AdmissionRequest,
    pub config: Arc<RuntimeConfig>,
    pub exposure: ExposureSnapshot,
    /// ACTIVE rows with the same symbol+direction, for duplicate-bps and
    /// cooldown checks.
    pub same_direction_neighbors: Vec<ActiveNeighbor>,
    pub has_active_opposite: bool,
    pub current_price: Option<f64>,
    pub now: DateTime<Utc>,
}

#[derive(Debug)]
pub enum GateOutcome {
    Pass { details: serde_json::Value },
    Reject(EngineError),
}

pub trait Gate: Send + Sync {
    fn stage(&self) -> &'static str;
    fn evaluate(&self, ctx: &GateContext) -> GateOutcome;
}

fn pass() -> GateOutcome {
    GateOutcome::Pass {
        details: serde_json::Value::Null,
    }
}

// 1. BASIC_VALIDATION -------------------------------------------------------

pub struct BasicValidationGate;

impl Gate for BasicValidationGate {
    fn stage(&self) -> &'static str {
        "BASIC_VALIDATION"
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        let c = ctx.candidate;
        if c.symbol.trim().is_empty() {
            return GateOutcome::Reject(EngineError::Validation("symbol must not be empty".into()));
        }
        if !(c.entry_price > 0.0) {
            return GateOutcome::Reject(EngineError::Validation(
                "entry_price must be > 0".into(),
            ));
        }
        if !(c.leverage > 0.0) {
            return GateOutcome::Reject(EngineError::Validation("leverage must be > 0".into()));
        }
        pass()
    }
}

// 2. PRICE_AVAILABILITY ------------------------------------------------------

pub struct PriceAvailabilityGate;

impl Gate for PriceAvailabilityGate {
    fn stage(&self) -> &'static str {
        "PRICE_AVAILABILITY"
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        match ctx.current_price {
            Some(_) => pass(),
            None => GateOutcome::Reject(EngineError::NoPrice(ctx.candidate.symbol.clone())),
        }
    }
}

// 3. DUPLICATE_CHECK ---------------------------------------------------------

pub struct DuplicateCheckGate;

impl Gate for DuplicateCheckGate {
    fn stage(&self) -> &'static str {
        "DUPLICATE_CHECK"
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        let threshold_bps = ctx.config.duplicate_bps_threshold;
        let candidate_price = ctx.candidate.entry_price;
        let matched: Vec<String> = ctx
            .same_direction_neighbors
            .iter()
            .filter(|n| bps_distance(n.entry_price, candidate_price) <= threshold_bps)
            .map(|n| n.id.clone())
            .collect();
        if matched.is_empty() {
            pass()
        } else {
            GateOutcome::Reject(EngineError::Duplicate { matched_ids: matched })
        }
    }
}

fn bps_distance(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        return f64::INFINITY;
    }
    ((a - b).abs() / a) * 10_000.0
}

// 4. COOLDOWN -----------------------------------------------------------------

pub struct CooldownGate;

impl Gate for CooldownGate {
    fn stage(&self) -> &'static str {
        "COOLDOWN"
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        if is_strict_bypass(&ctx.candidate.bypass_cooldown) {
            return pass();
        }
        let cfg = &ctx.config;
        let now = ctx.now;

        if let Some(last_same) = ctx.exposure.last_same_direction_ts {
            let remaining = cfg.cooldown_same_direction_ms - (now - last_same).num_milliseconds();
            if remaining > 0 {
                return reject_cooldown(remaining, last_same, cfg.cooldown_same_direction_ms, None);
            }
        }
        if let Some(last_opposite) = ctx.exposure.last_opposite_ts {
            let remaining = cfg.cooldown_opposite_ms - (now - last_opposite).num_milliseconds();
            if remaining > 0 {
                return reject_cooldown(remaining, last_opposite, cfg.cooldown_opposite_ms, None);
            }
        }
        let last_any = match (ctx.exposure.last_same_direction_ts, ctx.exposure.last_opposite_ts) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        if let Some(last_any) = last_any {
            let remaining = cfg.global_min_interval_ms - (now - last_any).num_milliseconds();
            if cfg.global_min_interval_ms > 0 && remaining > 0 {
                return reject_cooldown(remaining, last_any, cfg.global_min_interval_ms, None);
            }
        }
        if let Some(total_cap) = cfg.hourly_order_caps.total {
            if ctx.exposure.hourly_count_total >= total_cap {
                return reject_cooldown(
                    0,
                    now,
                    0,
                    Some("hourly total order cap reached".to_string()),
                );
            }
        }
        if let Some(dir_cap) = cfg.hourly_order_caps.per_direction {
            if ctx.exposure.hourly_count_same_direction >= dir_cap {
                return reject_cooldown(
                    0,
                    now,
                    0,
                    Some("hourly per-direction order cap reached".to_string()),
                );
            }
        }
        pass()
    }
}

fn reject_cooldown(
    remaining_ms: i64,
    last_created_at: DateTime<Utc>,
    window_ms: i64,
    reason: Option<String>,
) -> GateOutcome {
    let remaining_ms = remaining_ms.max(0);
    let next_available_at = last_created_at + chrono::Duration::milliseconds(window_ms);
    GateOutcome::Reject(EngineError::Cooldown {
        remaining_ms,
        next_available_at,
        last_created_at,
        reason,
    })
}

// 5. EXPOSURE_LIMIT (count) ---------------------------------------------------

pub struct ExposureLimitGate;

impl Gate for ExposureLimitGate {
    fn stage(&self) -> &'static str {
        "EXPOSURE_LIMIT"
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        let max = ctx.config.max_same_direction_actives;
        if ctx.exposure.count_same_direction >= max {
            return GateOutcome::Reject(EngineError::ExposureLimit {
                max_same_direction: max,
                current_count: ctx.exposure.count_same_direction,
                window_hours: ctx.config.concurrency_count_age_hours,
                symbol: ctx.candidate.symbol.clone(),
                direction: ctx.candidate.direction.as_str().to_string(),
            });
        }
        pass()
    }
}

// 6. EXPOSURE_CAP (sum) --------------------------------------------------------

pub struct ExposureCapGate;

impl Gate for ExposureCapGate {
    fn stage(&self) -> &'static str {
        "EXPOSURE_CAP"
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        let adding = ctx.candidate.position_size * ctx.candidate.leverage;
        let total_cap = ctx.config.net_exposure_caps.total;
        let dir_cap = match ctx.candidate.direction {
            Direction::Long => ctx.config.net_exposure_caps.per_direction_long,
            Direction::Short => ctx.config.net_exposure_caps.per_direction_short,
        };
        let current_total = ctx.exposure.sum_total;
        let current_direction = ctx.exposure.sum_same_direction;

        if current_total + adding > total_cap || current_direction + adding > dir_cap {
            return GateOutcome::Reject(EngineError::ExposureCap {
                total_cap,
                current_total,
                dir_cap,
                current_direction,
                adding,
            });
        }
        pass()
    }
}

// 7. OPPOSITE_CONSTRAINT --------------------------------------------------------

pub struct OppositeConstraintGate;

impl Gate for OppositeConstraintGate {
    fn stage(&self) -> &'static str {
        "OPPOSITE_CONSTRAINT"
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        if !ctx.has_active_opposite {
            return pass();
        }
        if !ctx.config.allow_opposite_while_open {
            return GateOutcome::Reject(EngineError::OppositeConstraint);
        }
        let confidence = ctx.candidate.confidence.unwrap_or(0.0);
        if confidence < ctx.config.opposite_min_confidence {
            return GateOutcome::Reject(EngineError::OppositeConstraint);
        }
        pass()
    }
}

// 8. MTF_CONSISTENCY --------------------------------------------------------------

pub struct MtfConsistencyGate;

impl Gate for MtfConsistencyGate {
    fn stage(&self) -> &'static str {
        "MTF_CONSISTENCY"
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        if !ctx.config.entry_filters.require_mtf_agreement {
            return pass();
        }
        let Some(mtf) = &ctx.candidate.metadata.multi_tf_consistency else {
            return GateOutcome::Reject(EngineError::MtfConsistency {
                require_mtf_agreement: true,
                min_mtf_agreement: ctx.config.entry_filters.min_mtf_agreement,
                agreement: 0.0,
                dominant_direction: "UNKNOWN".to_string(),
            });
        };
        let min_agreement = ctx.config.entry_filters.min_mtf_agreement;
        if mtf.agreement < min_agreement || mtf.dominant_direction != ctx.candidate.direction {
            return GateOutcome::Reject(EngineError::MtfConsistency {
                require_mtf_agreement: true,
                min_mtf_agreement: min_agreement,
                agreement: mtf.agreement,
                dominant_direction: mtf.dominant_direction.as_str().to_string(),
            });
        }
        pass()
    }
}

// 9. EV_GATE -------------------------------------------------------------------

pub struct EvGate;

impl Gate for EvGate {
    fn stage(&self) -> &'static str {
        "EV_GATE"
    }

    fn evaluate(&self, ctx: &GateContext) -> GateOutcome {
        let (Some(ev), ev_threshold) = (
            ctx.candidate.ev,
            ctx.candidate
                .ev_threshold
                .unwrap_or(ctx.config.ev_threshold_default),
        ) else {
            return pass();
        };
        let ev_ok = ev >= ev_threshold;
        if !ev_ok && ctx.config.ev_gate_mode == EvGateMode::HardReject {
            return GateOutcome::Reject(EngineError::Validation(format!(
                "ev {ev} below threshold {ev_threshold}"
            )));
        }
        GateOutcome::Pass {
            details: serde_json::json!({ "ev_ok": ev_ok, "ev": ev, "ev_threshold": ev_threshold }),
        }
    }
}

// 10. PERSIST -------------------------------------------------------------------

pub struct PersistGate;

impl Gate for PersistGate {
    fn stage(&self) -> &'static str {
        "PERSIST"
    }

    fn evaluate(&self, _ctx: &GateContext) -> GateOutcome {
        pass()
    }
}

/// Builds the fixed gate order. `run_pipeline` in `admission.rs` folds over
/// this once per submission.
pub fn default_pipeline() -> Vec<Box<dyn Gate>> {
    vec![
        Box::new(BasicValidationGate),
        Box::new(PriceAvailabilityGate),
        Box::new(DuplicateCheckGate),
        Box::new(CooldownGate),
        Box::new(ExposureLimitGate),
        Box::new(ExposureCapGate),
        Box::new(OppositeConstraintGate),
        Box::new(MtfConsistencyGate),
        Box::new(EvGate),
        Box::new(PersistGate),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::domain::RecommendationMetadata;

    fn base_request() -> AdmissionRequest {
        AdmissionRequest {
            symbol: "S1".into(),
            direction: Direction::Long,
            entry_price: 1000.0,
            current_price: Some(1000.0),
            leverage: 2.0,
            position_size: 1.0,
            strategy_type: None,
            take_profit_price: None,
            stop_loss_price: None,
            bypass_cooldown: None,
            ev: None,
            ev_threshold: None,
            ab_group: None,
            confidence: None,
            metadata: RecommendationMetadata::default(),
        }
    }

    fn base_ctx(candidate: &AdmissionRequest, config: RuntimeConfig) -> GateContext<'_> {
        GateContext {
            candidate,
            config: Arc::new(config),
            exposure: ExposureSnapshot {
                count_same_direction: 0,
                sum_total: 0.0,
                sum_same_direction: 0.0,
                last_same_direction_ts: None,
                last_opposite_ts: None,
                hourly_count_same_direction: 0,
                hourly_count_total: 0,
            },
            same_direction_neighbors: vec![],
            has_active_opposite: false,
            current_price: Some(1000.0),
            now: Utc::now(),
        }
    }

    #[test]
    fn basic_validation_rejects_non_positive_entry_price() {
        let mut req = base_request();
        req.entry_price = 0.0;
        let ctx = base_ctx(&req, RuntimeConfig::default());
        assert!(matches!(
            BasicValidationGate.evaluate(&ctx),
            GateOutcome::Reject(EngineError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_check_flags_within_threshold() {
        let req = base_request();
        let mut ctx = base_ctx(&req, RuntimeConfig::default());
        ctx.same_direction_neighbors = vec![ActiveNeighbor {
            id: "old".into(),
            entry_price: 1000.5, // 5 bps away
            created_at: Utc::now(),
        }];
        match DuplicateCheckGate.evaluate(&ctx) {
            GateOutcome::Reject(EngineError::Duplicate { matched_ids }) => {
                assert_eq!(matched_ids, vec!["old".to_string()]);
            }
            other => panic!("expected duplicate rejection, got {other:?}"),
        }
    }

    #[test]
    fn strict_bypass_only_accepts_json_true() {
        assert!(is_strict_bypass(&Some(serde_json::Value::Bool(true))));
        assert!(!is_strict_bypass(&Some(serde_json::Value::String(
            "true".into()
        ))));
        assert!(!is_strict_bypass(&Some(serde_json::Value::Bool(false))));
        assert!(!is_strict_bypass(&None));
    }

    #[test]
    fn exposure_cap_rejects_when_strictly_over() {
        let mut req = base_request();
        req.position_size = 0.8;
        req.leverage = 1.0;
        let mut cfg = RuntimeConfig::default();
        cfg.net_exposure_caps.total = 1.5;
        let mut ctx = base_ctx(&req, cfg);
        ctx.exposure.sum_total = 0.8;
        ctx.exposure.sum_same_direction = 0.8;
        match ExposureCapGate.evaluate(&ctx) {
            GateOutcome::Reject(EngineError::ExposureCap {
                total_cap,
                current_total,
                adding,
                ..
            }) => {
                assert_eq!(total_cap, 1.5);
                assert!((current_total - 0.8).abs() < 1e-9);
                assert!((adding - 0.8).abs() < 1e-9);
            }
            other => panic!("expected exposure cap rejection, got {other:?}"),
        }
    }

    #[test]
    fn ev_gate_is_advisory_by_default() {
        let mut req = base_request();
        req.ev = Some(0.1);
        req.ev_threshold = Some(0.5);
        let ctx = base_ctx(&req, RuntimeConfig::default());
        match EvGate.evaluate(&ctx) {
            GateOutcome::Pass { details } => {
                assert_eq!(details["ev_ok"], false);
            }
            other => panic!("expected advisory pass, got {other:?}"),
        }
    }
}
