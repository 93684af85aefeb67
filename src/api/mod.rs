//! HTTP surface: one axum router over the admission/lifecycle/query engine.
//! Every response is wrapped in the same `{success, data, error}` envelope,
//! matching the `{"success": true, ...}` shape teacher handlers already
//! build ad hoc, generalized into a single `IntoResponse` impl instead of
//! constructing it by hand per handler.

pub mod dto;
mod handlers;

use crate::admission::AdmissionController;
use crate::config::ConfigHandle;
use crate::error::EngineError;
use crate::events::EventBus;
use crate::exposure::ExposureIndex;
use crate::lifecycle::TrackerHandle;
use crate::price_feed::{SharedPriceFeed, TestSignalOverrides};
use crate::store::Store;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub price_feed: SharedPriceFeed,
    pub exposure: Arc<ExposureIndex>,
    pub config: ConfigHandle,
    pub events: EventBus,
    pub admission: Arc<AdmissionController>,
    pub tracker: TrackerHandle,
    pub fgi_overrides: Arc<TestSignalOverrides>,
    pub funding_rate_overrides: Arc<TestSignalOverrides>,
}

#[derive(Debug, Serialize)]
pub struct ApiEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiEnvelope<T>> {
    Json(ApiEnvelope {
        success: true,
        data: Some(data),
        error: None,
    })
}

/// Thin wrapper so handlers can return `Result<_, ApiError>` and rely on
/// `?` from `EngineError`/`anyhow::Error`, with the HTTP status and error
/// envelope derived once, here, instead of at every call site.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(EngineError::StoreFailure(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ApiEnvelope<()> = ApiEnvelope {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: self.0.code(),
                message: self.0.to_string(),
                details: self.0.details(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

async fn health_check() -> &'static str {
    "OK"
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/recommendations",
            post(handlers::create_recommendation).get(handlers::list_recommendations),
        )
        .route("/recommendations/:id", get(handlers::get_recommendation))
        .route("/recommendations/:id/close", put(handlers::close_recommendation))
        .route("/recommendations/:id/expire", post(handlers::expire_recommendation))
        .route("/active-recommendations", get(handlers::list_active))
        .route("/tracker/start", post(handlers::tracker_start))
        .route("/tracker/stop", post(handlers::tracker_stop))
        .route("/status", get(handlers::status))
        .route(
            "/config",
            get(handlers::get_config).post(handlers::update_config),
        )
        .route("/testing/price-override", post(handlers::set_price_override))
        .route("/testing/price-override/clear", post(handlers::clear_price_override))
        .route("/testing/fgi-override", post(handlers::set_fgi_override))
        .route("/testing/fgi-override/clear", post(handlers::clear_fgi_override))
        .route(
            "/testing/funding-rate-override",
            post(handlers::set_funding_rate_override),
        )
        .route(
            "/testing/funding-rate-override/clear",
            post(handlers::clear_funding_rate_override),
        )
        .route("/stats", get(handlers::stats))
        .route("/monitoring/ev-metrics", get(handlers::ev_metrics))
        .route("/decision-chains", get(handlers::list_decision_chains))
        .route("/decision-chains/:id", get(handlers::get_decision_chain))
        .route("/decision-chains/:id/replay", post(handlers::replay_decision_chain))
        .route("/decision-chains/batch-replay", post(handlers::batch_replay))
        .with_state(state)
}
