use super::dto::*;
use super::{ok, ApiError, AppState};
use crate::chain::batch_replay as batch_replay_chains;
use crate::chain::replay as replay_chain_inputs;
use crate::domain::ExitReason;
use crate::error::EngineError;
use crate::gates::default_pipeline;
use crate::query;
use crate::store::{ActiveFilter, QueryFilter, RecommendationPatch};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

pub async fn create_recommendation(
    State(state): State<AppState>,
    Json(body): Json<CreateRecommendationBody>,
) -> Result<(StatusCode, Json<super::ApiEnvelope<crate::domain::Recommendation>>), ApiError> {
    let atr_value = body.atr_value;
    let atr_period = body.atr_period;
    let atr_sl = body.atr_sl_multiplier;
    let atr_tp = body.atr_tp_multiplier;
    let source = body.source;
    let request = body.into_admission_request();
    let rec = state
        .admission
        .submit(request, atr_value, atr_period, atr_sl, atr_tp, source)
        .await?;
    Ok((StatusCode::CREATED, ok(rec)))
}

pub async fn get_recommendation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<super::ApiEnvelope<crate::domain::Recommendation>>, ApiError> {
    let rec = state.store.get(&id).await?.ok_or(EngineError::NotFound)?;
    Ok(ok(rec))
}

pub async fn list_active(
    State(state): State<AppState>,
    Query(q): Query<ActiveQuery>,
) -> Result<Json<super::ApiEnvelope<ActiveListResponse>>, ApiError> {
    let rows = state
        .store
        .list_active(ActiveFilter {
            symbol: q.symbol,
            direction: q.direction,
        })
        .await?;
    Ok(ok(ActiveListResponse {
        count: rows.len(),
        recommendations: rows,
    }))
}

pub async fn list_recommendations(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<super::ApiEnvelope<Vec<crate::domain::Recommendation>>>, ApiError> {
    let rows = state
        .store
        .query(
            QueryFilter {
                symbol: q.symbol,
                status: q.status,
                ab_group: q.ab_group,
            },
            q.page,
            q.limit,
        )
        .await?;
    Ok(ok(rows))
}

/// Idempotent per §4.7/§6: a second close on an already-terminal row is a
/// no-op that returns the persisted outcome, not an error. Only the first
/// call to reach `store.close_recommendation` actually mutates the row,
/// exposure index, and event bus; a `NotActive` from the store means some
/// other call already closed it, so this re-fetches and returns that
/// persisted row instead of propagating the error.
pub async fn close_recommendation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CloseRequest>,
) -> Result<Json<super::ApiEnvelope<crate::domain::Recommendation>>, ApiError> {
    let rec = state.store.get(&id).await?.ok_or(EngineError::NotFound)?;
    if rec.status != crate::domain::RecommendationStatus::Active {
        return Ok(ok(rec));
    }
    let exit_price = match body.exit_price {
        Some(p) => p,
        None => state.price_feed.get(&rec.symbol)?,
    };
    let now = chrono::Utc::now();
    let pct = crate::domain::pnl_percent(rec.direction, rec.entry_price, exit_price, rec.leverage);
    let amount = crate::domain::pnl_amount(pct, rec.position_size);
    let label = body.label.or_else(|| Some("MANUAL_TEST".to_string()));
    let closed = match state
        .store
        .close_recommendation(&id, exit_price, now, ExitReason::Manual, label, pct, amount)
        .await
    {
        Ok(closed) => closed,
        Err(EngineError::NotActive) => {
            return Ok(ok(state.store.get(&id).await?.ok_or(EngineError::NotFound)?));
        }
        Err(e) => return Err(e.into()),
    };
    state.exposure.record_close(&closed);
    state.events.publish(crate::events::EngineEvent::Closed {
        recommendation_id: closed.id.clone(),
        symbol: closed.symbol.clone(),
        exit_reason: ExitReason::Manual,
        pnl_percent: pct,
    });
    Ok(ok(closed))
}

pub async fn expire_recommendation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExpireRequest>,
) -> Result<Json<super::ApiEnvelope<crate::domain::Recommendation>>, ApiError> {
    let expired = state.store.expire_recommendation(&id, body.reason).await?;
    state.exposure.record_close(&expired);
    Ok(ok(expired))
}

pub async fn tracker_start(
    State(state): State<AppState>,
) -> Json<super::ApiEnvelope<StatusResponse>> {
    state.tracker.start();
    ok(StatusResponse {
        tracker_running: state.tracker.is_running(),
        active_count: 0,
    })
}

pub async fn tracker_stop(
    State(state): State<AppState>,
) -> Json<super::ApiEnvelope<StatusResponse>> {
    state.tracker.stop();
    ok(StatusResponse {
        tracker_running: state.tracker.is_running(),
        active_count: 0,
    })
}

pub async fn status(
    State(state): State<AppState>,
) -> Result<Json<super::ApiEnvelope<StatusResponse>>, ApiError> {
    let active = state.store.list_active(ActiveFilter::default()).await?;
    Ok(ok(StatusResponse {
        tracker_running: state.tracker.is_running(),
        active_count: active.len(),
    }))
}

pub async fn get_config(
    State(state): State<AppState>,
) -> Json<super::ApiEnvelope<crate::config::RuntimeConfig>> {
    ok((*state.config.snapshot()).clone())
}

pub async fn update_config(
    State(state): State<AppState>,
    Json(body): Json<ConfigUpdateBody>,
) -> Result<Json<super::ApiEnvelope<crate::config::RuntimeConfig>>, ApiError> {
    let current = state.config.snapshot();
    let updated = crate::config::merge_runtime_config(&current, body.0)
        .map_err(|e| EngineError::Validation(format!("invalid config body: {e}")))?;
    state.config.swap(updated.clone());
    Ok(ok(updated))
}

pub async fn set_price_override(
    State(state): State<AppState>,
    Json(body): Json<PriceOverrideRequest>,
) -> Result<Json<super::ApiEnvelope<()>>, ApiError> {
    if !state.config.snapshot().testing.allow_price_override {
        return Err(EngineError::Validation(
            "price overrides are disabled by runtime config".to_string(),
        )
        .into());
    }
    state.price_feed.set_allow_override(true);
    state
        .price_feed
        .set_override(&body.symbol, body.price, body.ttl_ms)?;
    state.events.publish(crate::events::EngineEvent::PriceOverrideSet {
        symbol: body.symbol,
        price: body.price,
        ttl_ms: body.ttl_ms,
    });
    Ok(ok(()))
}

pub async fn clear_price_override(
    State(state): State<AppState>,
    Json(body): Json<PriceOverrideClearRequest>,
) -> Json<super::ApiEnvelope<()>> {
    state.price_feed.clear_override(body.symbol.as_deref());
    state
        .events
        .publish(crate::events::EngineEvent::PriceOverrideCleared { symbol: body.symbol });
    ok(())
}

pub async fn set_fgi_override(
    State(state): State<AppState>,
    Json(body): Json<FgiOverrideRequest>,
) -> Result<Json<super::ApiEnvelope<()>>, ApiError> {
    if !state.config.snapshot().testing.allow_fgi_override {
        return Err(EngineError::Validation(
            "fgi overrides are disabled by runtime config".to_string(),
        )
        .into());
    }
    state.fgi_overrides.set_allow(true);
    state
        .fgi_overrides
        .set(crate::price_feed::FGI_GLOBAL_KEY, body.value, body.ttl_ms)?;
    state.events.publish(crate::events::EngineEvent::FgiOverrideSet {
        value: body.value,
        ttl_ms: body.ttl_ms,
    });
    Ok(ok(()))
}

pub async fn clear_fgi_override(State(state): State<AppState>) -> Json<super::ApiEnvelope<()>> {
    state.fgi_overrides.clear(Some(crate::price_feed::FGI_GLOBAL_KEY));
    state.events.publish(crate::events::EngineEvent::FgiOverrideCleared);
    ok(())
}

pub async fn set_funding_rate_override(
    State(state): State<AppState>,
    Json(body): Json<FundingRateOverrideRequest>,
) -> Result<Json<super::ApiEnvelope<()>>, ApiError> {
    if !state.config.snapshot().testing.allow_funding_rate_override {
        return Err(EngineError::Validation(
            "funding-rate overrides are disabled by runtime config".to_string(),
        )
        .into());
    }
    state.funding_rate_overrides.set_allow(true);
    state
        .funding_rate_overrides
        .set(&body.symbol, body.rate, body.ttl_ms)?;
    state.events.publish(crate::events::EngineEvent::FundingRateOverrideSet {
        symbol: body.symbol,
        rate: body.rate,
        ttl_ms: body.ttl_ms,
    });
    Ok(ok(()))
}

pub async fn clear_funding_rate_override(
    State(state): State<AppState>,
    Json(body): Json<FundingRateOverrideClearRequest>,
) -> Json<super::ApiEnvelope<()>> {
    state.funding_rate_overrides.clear(body.symbol.as_deref());
    state
        .events
        .publish(crate::events::EngineEvent::FundingRateOverrideCleared { symbol: body.symbol });
    ok(())
}

pub async fn stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<super::ApiEnvelope<query::StatsSummary>>, ApiError> {
    let rows = state
        .store
        .query(QueryFilter::default(), 0, usize::MAX)
        .await?;
    let rows = filter_by_time_range(rows, q.start, q.end);
    let mode = parse_bin_mode(q.bin_mode.as_deref());
    let ab_groups = parse_ab_groups(q.ab_group.as_deref());
    Ok(ok(query::summarize(&rows, q.bins, mode, &ab_groups)))
}

fn filter_by_time_range(
    rows: Vec<crate::domain::Recommendation>,
    start: Option<chrono::DateTime<chrono::Utc>>,
    end: Option<chrono::DateTime<chrono::Utc>>,
) -> Vec<crate::domain::Recommendation> {
    rows.into_iter()
        .filter(|r| {
            let after_start = start.map(|s| r.created_at >= s).unwrap_or(true);
            let before_end = end.map(|e| r.created_at <= e).unwrap_or(true);
            after_start && before_end
        })
        .collect()
}

#[derive(serde::Serialize)]
pub struct EvMetricsResponse {
    pub bins: Vec<query::EvBin>,
    pub subgroups: Vec<query::EvOkSubgroup>,
}

pub async fn ev_metrics(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<super::ApiEnvelope<EvMetricsResponse>>, ApiError> {
    let rows = state
        .store
        .query(QueryFilter::default(), 0, usize::MAX)
        .await?;
    let mode = parse_bin_mode(q.bin_mode.as_deref());
    Ok(ok(EvMetricsResponse {
        bins: query::ev_bins(&rows, q.bins, mode),
        subgroups: query::ev_ok_subgroups(&rows),
    }))
}

pub async fn list_decision_chains(
    State(state): State<AppState>,
    Query(q): Query<ChainListQuery>,
) -> Result<Json<super::ApiEnvelope<Vec<crate::domain::DecisionChain>>>, ApiError> {
    let chains = state
        .store
        .query_decision_chains(q.symbol.as_deref(), q.status.as_deref(), q.limit, q.offset)
        .await?;
    Ok(ok(chains))
}

pub async fn get_decision_chain(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<super::ApiEnvelope<crate::domain::DecisionChain>>, ApiError> {
    let chain = state
        .store
        .get_decision_chain(&id)
        .await?
        .ok_or(EngineError::NotFound)?;
    Ok(ok(chain))
}

pub async fn replay_decision_chain(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<super::ApiEnvelope<crate::chain::ReplayResult>>, ApiError> {
    let chain = state
        .store
        .get_decision_chain(&id)
        .await?
        .ok_or(EngineError::NotFound)?;
    let pipeline = default_pipeline();
    let result = replay_chain_inputs(&chain, &pipeline).ok_or_else(|| {
        EngineError::Validation("chain has no captured inputs to replay".to_string())
    })?;
    Ok(ok(result))
}

pub async fn batch_replay(
    State(state): State<AppState>,
    Json(body): Json<BatchReplayBody>,
) -> Result<Json<super::ApiEnvelope<crate::chain::BatchReplayOutcome>>, ApiError> {
    let mut chains = Vec::with_capacity(body.chain_ids.len());
    for id in &body.chain_ids {
        if let Some(chain) = state.store.get_decision_chain(id).await? {
            chains.push(chain);
        }
    }
    Ok(ok(batch_replay_chains(
        &chains,
        body.parallel,
        body.max_concurrency,
        body.include_analysis,
    )))
}
