//! Typed error taxonomy for the admission/lifecycle engine.
//!
//! Every gate rejection carries a stable machine code and a structured
//! details payload that is echoed verbatim in the HTTP envelope and in the
//! decision step recorded for the attempt.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate recommendation")]
    Duplicate { matched_ids: Vec<String> },

    #[error("cooldown active")]
    Cooldown {
        remaining_ms: i64,
        next_available_at: DateTime<Utc>,
        last_created_at: DateTime<Utc>,
        reason: Option<String>,
    },

    #[error("exposure limit reached")]
    ExposureLimit {
        max_same_direction: u32,
        current_count: u32,
        window_hours: f64,
        symbol: String,
        direction: String,
    },

    #[error("exposure cap reached")]
    ExposureCap {
        total_cap: f64,
        current_total: f64,
        dir_cap: f64,
        current_direction: f64,
        adding: f64,
    },

    #[error("opposite-direction constraint")]
    OppositeConstraint,

    #[error("multi-timeframe consistency check failed")]
    MtfConsistency {
        require_mtf_agreement: bool,
        min_mtf_agreement: f64,
        agreement: f64,
        dominant_direction: String,
    },

    #[error("no price available for symbol")]
    NoPrice(String),

    #[error("recommendation is not active")]
    NotActive,

    #[error("store failure: {0}")]
    StoreFailure(#[from] anyhow::Error),

    #[error("config read failure: {0}")]
    ConfigFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("recommendation not found")]
    NotFound,
}

impl EngineError {
    /// Stable machine-readable code, echoed as the `error` field of the
    /// HTTP envelope and as the DecisionStep reason when applicable.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Duplicate { .. } => "DUPLICATE_RECOMMENDATION",
            EngineError::Cooldown { .. } => "COOLDOWN_ACTIVE",
            EngineError::ExposureLimit { .. } => "EXPOSURE_LIMIT",
            EngineError::ExposureCap { .. } => "EXPOSURE_CAP",
            EngineError::OppositeConstraint => "OPPOSITE_CONSTRAINT",
            EngineError::MtfConsistency { .. } => "MTF_CONSISTENCY",
            EngineError::NoPrice(_) => "NO_PRICE",
            EngineError::NotActive => "NOT_ACTIVE",
            EngineError::StoreFailure(_) => "STORE_FAILURE",
            EngineError::ConfigFailure(_) => "CONFIG_FAILURE",
            EngineError::Cancelled => "CANCELLED",
            EngineError::NotFound => "NOT_FOUND",
        }
    }

    /// HTTP status this error maps to at the boundary (§6).
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::Duplicate { .. }
            | EngineError::ExposureLimit { .. }
            | EngineError::ExposureCap { .. }
            | EngineError::OppositeConstraint
            | EngineError::MtfConsistency { .. } => 409,
            EngineError::Cooldown { .. } => 429,
            EngineError::NoPrice(_) => 409,
            EngineError::NotActive => 409,
            EngineError::NotFound => 404,
            EngineError::StoreFailure(_) | EngineError::ConfigFailure(_) => 500,
            EngineError::Cancelled => 499,
        }
    }

    /// Structured details payload echoed in the HTTP body and the decision
    /// step, distinct from the human-readable `reason` string.
    pub fn details(&self) -> Value {
        match self {
            EngineError::Duplicate { matched_ids } => serde_json::json!({
                "matchedIds": matched_ids,
            }),
            EngineError::Cooldown {
                remaining_ms,
                next_available_at,
                last_created_at,
                reason,
            } => serde_json::json!({
                "remainingMs": remaining_ms,
                "nextAvailableAt": next_available_at,
                "lastCreatedAt": last_created_at,
                "reason": reason,
            }),
            EngineError::ExposureLimit {
                max_same_direction,
                current_count,
                window_hours,
                symbol,
                direction,
            } => serde_json::json!({
                "maxSameDirection": max_same_direction,
                "currentCount": current_count,
                "windowHours": window_hours,
                "symbol": symbol,
                "direction": direction,
            }),
            EngineError::ExposureCap {
                total_cap,
                current_total,
                dir_cap,
                current_direction,
                adding,
            } => serde_json::json!({
                "totalCap": total_cap,
                "currentTotal": current_total,
                "dirCap": dir_cap,
                "currentDirection": current_direction,
                "adding": adding,
            }),
            EngineError::MtfConsistency {
                require_mtf_agreement,
                min_mtf_agreement,
                agreement,
                dominant_direction,
            } => serde_json::json!({
                "requireMTFAgreement": require_mtf_agreement,
                "minMTFAgreement": min_mtf_agreement,
                "agreement": agreement,
                "dominantDirection": dominant_direction,
            }),
            _ => Value::Null,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
