//! Admission Controller: the single entry point a recommendation enters
//! through. Opens a decision chain, builds a `GateContext` from the live
//! config/exposure/price state, folds the gate pipeline over it, and on
//! approval derives ATR-based stops, persists the row, updates the
//! exposure index, and publishes an event.

use crate::chain::{CapturedInputs, ChainMonitor};
use crate::clock::SharedClock;
use crate::config::ConfigHandle;
use crate::domain::{
    ChainDecision, Recommendation, RecommendationMetadata, RecommendationSource,
    RecommendationStatus,
};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::exposure::ExposureIndex;
use crate::gates::{default_pipeline, AdmissionRequest, Gate, GateContext, GateOutcome};
use crate::price_feed::SharedPriceFeed;
use crate::store::{ActiveFilter, Store};
use std::sync::Arc;
use uuid::Uuid;

pub struct AdmissionController {
    store: Store,
    price_feed: SharedPriceFeed,
    exposure: Arc<ExposureIndex>,
    config: ConfigHandle,
    events: EventBus,
    chain_monitor: ChainMonitor,
    clock: SharedClock,
    pipeline: Vec<Box<dyn Gate>>,
}

/// Stop-loss/take-profit derivation from ATR, distinct from any
/// `stop_loss_price`/`take_profit_price` the caller explicitly supplied —
/// explicit values always win.
fn derive_atr_stops(
    direction: crate::domain::Direction,
    entry_price: f64,
    atr_value: f64,
    sl_multiplier: f64,
    tp_multiplier: f64,
) -> (f64, f64) {
    let sl_distance = atr_value * sl_multiplier;
    let tp_distance = atr_value * tp_multiplier;
    match direction {
        crate::domain::Direction::Long => (entry_price - sl_distance, entry_price + tp_distance),
        crate::domain::Direction::Short => (entry_price + sl_distance, entry_price - tp_distance),
    }
}

impl AdmissionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        price_feed: SharedPriceFeed,
        exposure: Arc<ExposureIndex>,
        config: ConfigHandle,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            price_feed,
            exposure,
            config,
            events,
            chain_monitor: ChainMonitor::new(clock.clone()),
            clock,
            pipeline: default_pipeline(),
        }
    }

    /// Runs one submission through the Admission Controller. Always opens
    /// and finalizes a decision chain, even on rejection, so every attempt
    /// is auditable.
    pub async fn submit(
        &self,
        request: AdmissionRequest,
        atr_value: f64,
        atr_period: u32,
        atr_sl_multiplier: f64,
        atr_tp_multiplier: f64,
        source: RecommendationSource,
    ) -> EngineResult<Recommendation> {
        let config = self.config.snapshot();
        let current_price = self.price_feed.get(&request.symbol).ok().or(request.current_price);
        let exposure_snapshot = self.exposure.snapshot(
            &request.symbol,
            request.direction,
            config.concurrency_count_age_hours,
        );
        let has_active_opposite = self
            .exposure
            .has_active_opposite(&request.symbol, request.direction);
        let neighbors = self.load_same_direction_neighbors(&request).await?;

        let now = self.clock.now();
        let captured = CapturedInputs {
            candidate: request.clone(),
            config: (*config).clone(),
            exposure: exposure_snapshot,
            same_direction_neighbors: neighbors.clone(),
            has_active_opposite,
            current_price,
            now,
        };
        let mut chain = self.chain_monitor.start_chain(
            &request.symbol,
            request.direction,
            source,
            &captured,
        );

        let ctx = GateContext {
            candidate: &request,
            config: config.clone(),
            exposure: exposure_snapshot,
            same_direction_neighbors: neighbors,
            has_active_opposite,
            current_price,
            now,
        };

        for gate in &self.pipeline {
            match gate.evaluate(&ctx) {
                GateOutcome::Pass { details } => {
                    self.chain_monitor.add_step(
                        &mut chain,
                        gate.stage(),
                        ChainDecision::Approved,
                        "ok",
                        details,
                    );
                }
                GateOutcome::Reject(err) => {
                    self.chain_monitor.add_step(
                        &mut chain,
                        gate.stage(),
                        ChainDecision::Rejected,
                        &err.to_string(),
                        err.details(),
                    );
                    self.chain_monitor.finalize(
                        &mut chain,
                        ChainDecision::Rejected,
                        Some(err.to_string()),
                    );
                    let _ = self.store.save_decision_chain(&chain).await;
                    self.events.publish(EngineEvent::Gated {
                        symbol: request.symbol.clone(),
                        direction: request.direction,
                        error_code: err.code(),
                        details: err.details(),
                    });
                    return Err(err);
                }
            }
        }

        let (derived_sl, derived_tp) = derive_atr_stops(
            request.direction,
            request.entry_price,
            atr_value,
            atr_sl_multiplier,
            atr_tp_multiplier,
        );
        let stop_loss_price = request.stop_loss_price.unwrap_or(derived_sl);
        let take_profit_price = request.take_profit_price.unwrap_or(derived_tp);

        let rec = Recommendation {
            id: Uuid::new_v4().to_string(),
            symbol: request.symbol.clone(),
            direction: request.direction,
            entry_price: request.entry_price,
            current_price: current_price.unwrap_or(request.entry_price),
            leverage: request.leverage,
            position_size: request.position_size,
            stop_loss_price,
            take_profit_price,
            trailing_override: None,
            atr_value,
            atr_period,
            atr_sl_multiplier,
            atr_tp_multiplier,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: false,
            reduction_count: 0,
            reduction_ratio: 0.0,
            expected_return: None,
            ev: request.ev,
            ev_threshold: request.ev_threshold,
            ev_ok: request
                .ev
                .map(|ev| ev >= request.ev_threshold.unwrap_or(config.ev_threshold_default)),
            status: RecommendationStatus::Active,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            exit_label: None,
            pnl_percent: None,
            pnl_amount: None,
            effective_stop_price: stop_loss_price,
            best_favourable_price: request.entry_price,
            close_pending: false,
            created_at: now,
            updated_at: now,
            source: Some(source),
            strategy_type: request.strategy_type.clone(),
            ab_group: request.ab_group.clone(),
            experiment_id: None,
            dedupe_key: None,
            metadata: RecommendationMetadata {
                multi_tf_consistency: request.metadata.multi_tf_consistency.clone(),
                confidence: request.confidence,
            },
        };

        self.store.insert_recommendation(&rec).await?;
        self.exposure.record_admit(&rec);

        self.chain_monitor.link_recommendation(&mut chain, rec.id.clone());
        self.chain_monitor.finalize(&mut chain, ChainDecision::Approved, None);
        self.store.save_decision_chain(&chain).await?;

        self.events.publish(EngineEvent::Created {
            recommendation_id: rec.id.clone(),
            symbol: rec.symbol.clone(),
            direction: rec.direction,
        });

        Ok(rec)
    }

    async fn load_same_direction_neighbors(
        &self,
        request: &AdmissionRequest,
    ) -> EngineResult<Vec<crate::gates::ActiveNeighbor>> {
        let active = self
            .store
            .list_active(ActiveFilter {
                symbol: Some(request.symbol.clone()),
                direction: Some(request.direction),
            })
            .await?;
        Ok(active
            .into_iter()
            .map(|r| crate::gates::ActiveNeighbor {
                id: r.id,
                entry_price: r.entry_price,
                created_at: r.created_at,
            })
            .collect())
    }
}
