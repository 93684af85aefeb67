//! Lifecycle Tracker: polls the price feed for every ACTIVE recommendation
//! on a fixed interval and closes rows that hit stop-loss, take-profit,
//! breakeven, or timeout. Same `tokio::time::interval` +
//! `MissedTickBehavior::Skip` shape the vault engine uses for its poll
//! loops, generalized from a single strategy's tick to the whole ACTIVE
//! book.

use crate::clock::SharedClock;
use crate::config::{ConfigHandle, RuntimeConfig};
use crate::domain::{pnl_amount, pnl_percent, Direction, ExitReason, Recommendation};
use crate::events::{EngineEvent, EventBus};
use crate::exposure::ExposureIndex;
use crate::price_feed::SharedPriceFeed;
use crate::store::{ActiveFilter, RecommendationPatch, Store};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Exit decided for one ACTIVE row on a given tick, or `None` if it stays
/// open. Priority: MANUAL (not evaluated here, only via the HTTP close
/// endpoint) > STOP_LOSS/BREAKEVEN (both read `effective_stop_price`; which
/// label applies depends on whether the stop has been raised exactly to
/// entry) > TAKE_PROFIT (partial levels first) > TIMEOUT, the last gated by
/// `min_holding_minutes`.
#[derive(Debug, Clone, Copy)]
struct ExitDecision {
    reason: ExitReason,
    exit_price: f64,
}

/// Tolerance for treating `effective_stop_price` as "exactly entry" when
/// classifying a stop-out as BREAKEVEN vs STOP_LOSS. Both values flow
/// through the same `f64` arithmetic path (`max`/`min` against `entry_price`
/// with no intervening rounding), so an exact comparison would do, but a
/// small epsilon keeps the classification robust to accumulated float drift
/// across many ticks.
const BREAKEVEN_EPSILON: f64 = 1e-6;

fn evaluate_exit(
    rec: &Recommendation,
    current_price: f64,
    now: DateTime<Utc>,
    config: &RuntimeConfig,
) -> Option<ExitDecision> {
    let hit_stop = match rec.direction {
        Direction::Long => current_price <= rec.effective_stop_price,
        Direction::Short => current_price >= rec.effective_stop_price,
    };
    if hit_stop {
        let at_breakeven = (rec.effective_stop_price - rec.entry_price).abs() <= BREAKEVEN_EPSILON;
        return Some(ExitDecision {
            reason: if at_breakeven { ExitReason::Breakeven } else { ExitReason::StopLoss },
            exit_price: rec.effective_stop_price,
        });
    }

    let hit_take_profit = match rec.direction {
        Direction::Long => current_price >= rec.take_profit_price,
        Direction::Short => current_price <= rec.take_profit_price,
    };
    if hit_take_profit && (!config.partial_take_profit.enabled || rec.tp3_hit) {
        return Some(ExitDecision {
            reason: ExitReason::TakeProfit,
            exit_price: rec.take_profit_price,
        });
    }

    let holding_minutes = (now - rec.created_at).num_seconds() as f64 / 60.0;
    if config.max_holding_hours > 0.0
        && holding_minutes >= config.max_holding_hours * 60.0
        && holding_minutes >= config.min_holding_minutes
    {
        return Some(ExitDecision {
            reason: ExitReason::Timeout,
            exit_price: current_price,
        });
    }

    None
}

/// Result of crossing one or more partial take-profit levels on a tick
/// where the position does not fully close. `reduction_count` and
/// `reduction_ratio` only ever grow; `effective_stop_price` is only ever
/// moved to breakeven, never relaxed.
struct PartialTpUpdate {
    tp1_hit: bool,
    tp2_hit: bool,
    tp3_hit: bool,
    reduction_count: u32,
    reduction_ratio: f64,
    effective_stop_price: f64,
}

/// Levels are fractions of the entry-to-take-profit distance (§9 open
/// question: the spec names TP1/TP2/TP3 but not their prices). TP1 moves
/// the stop to breakeven when `move_stop_to_breakeven_on_tp1` is set; TP3
/// is the final level and is left to `evaluate_exit` to close.
fn evaluate_partial_tp(
    rec: &Recommendation,
    current_price: f64,
    config: &RuntimeConfig,
) -> Option<PartialTpUpdate> {
    let cfg = &config.partial_take_profit;
    if !cfg.enabled || rec.tp3_hit {
        return None;
    }
    let distance = rec.take_profit_price - rec.entry_price;
    let level_price = |ratio: f64| rec.entry_price + distance * ratio;
    let reached = |price: f64| match rec.direction {
        Direction::Long => current_price >= price,
        Direction::Short => current_price <= price,
    };

    let mut tp1_hit = rec.tp1_hit;
    let mut tp2_hit = rec.tp2_hit;
    let mut tp3_hit = rec.tp3_hit;
    let mut newly_hit = 0u32;

    if !tp1_hit && reached(level_price(cfg.tp1_ratio)) {
        tp1_hit = true;
        newly_hit += 1;
    }
    if tp1_hit && !tp2_hit && reached(level_price(cfg.tp2_ratio)) {
        tp2_hit = true;
        newly_hit += 1;
    }
    if tp2_hit && !tp3_hit && reached(level_price(cfg.tp3_ratio)) {
        tp3_hit = true;
        newly_hit += 1;
    }
    if newly_hit == 0 {
        return None;
    }

    let reduction_count = rec.reduction_count + newly_hit;
    let reduction_ratio = (cfg.reduction_per_level * reduction_count as f64).min(1.0);
    let effective_stop_price = if tp1_hit && cfg.move_stop_to_breakeven_on_tp1 {
        match rec.direction {
            Direction::Long => rec.effective_stop_price.max(rec.entry_price),
            Direction::Short => rec.effective_stop_price.min(rec.entry_price),
        }
    } else {
        rec.effective_stop_price
    };

    Some(PartialTpUpdate {
        tp1_hit,
        tp2_hit,
        tp3_hit,
        reduction_count,
        reduction_ratio,
        effective_stop_price,
    })
}

/// Trailing parameters in effect for one row: the recommendation's own
/// `trailing_override` if it carries one, else the runtime config's global
/// `trailing` block.
struct EffectiveTrailing {
    enabled: bool,
    activate_on_breakeven: bool,
    activate_profit_pct: f64,
    percent: f64,
    min_step: f64,
}

fn effective_trailing(rec: &Recommendation, config: &RuntimeConfig) -> EffectiveTrailing {
    match &rec.trailing_override {
        Some(t) => EffectiveTrailing {
            enabled: t.enabled,
            activate_on_breakeven: t.activate_on_breakeven,
            activate_profit_pct: t.activate_profit_pct,
            percent: t.percent,
            min_step: t.min_step,
        },
        None => EffectiveTrailing {
            enabled: config.trailing.enabled,
            activate_on_breakeven: config.trailing.activate_on_breakeven,
            activate_profit_pct: config.trailing.activate_profit_pct,
            percent: config.trailing.percent,
            min_step: config.trailing.min_step,
        },
    }
}

/// New trailing stop and best-favourable-price for a row that stays open,
/// computed independently of whether it closes this tick.
///
/// Two independent activations layer on top of each other: once the
/// position is favourable at all, `activate_on_breakeven` raises the floor
/// to entry (a position can never trail back into a loss once it has been
/// profitable); once unrealized profit against `best_favourable_price`
/// crosses `activate_profit_pct`, the percent-based trail engages on top of
/// that floor. The stop only ever moves favourably, and only by at least
/// `min_step`.
fn advance_trailing(rec: &Recommendation, current_price: f64, config: &RuntimeConfig) -> (f64, f64) {
    let best = match rec.direction {
        Direction::Long => rec.best_favourable_price.max(current_price),
        Direction::Short => rec.best_favourable_price.min(current_price),
    };
    let trailing = effective_trailing(rec, config);
    if !trailing.enabled {
        return (rec.effective_stop_price, best);
    }

    let unrealized_profit_pct = match rec.direction {
        Direction::Long => (best - rec.entry_price) / rec.entry_price * 100.0,
        Direction::Short => (rec.entry_price - best) / rec.entry_price * 100.0,
    };

    let mut candidate_stop = rec.effective_stop_price;

    if trailing.activate_on_breakeven && unrealized_profit_pct > 0.0 {
        candidate_stop = match rec.direction {
            Direction::Long => candidate_stop.max(rec.entry_price),
            Direction::Short => candidate_stop.min(rec.entry_price),
        };
    }

    if unrealized_profit_pct >= trailing.activate_profit_pct {
        let trail_distance = best * (trailing.percent / 100.0);
        let trailed_stop = match rec.direction {
            Direction::Long => best - trail_distance,
            Direction::Short => best + trail_distance,
        };
        candidate_stop = match rec.direction {
            Direction::Long => candidate_stop.max(trailed_stop),
            Direction::Short => candidate_stop.min(trailed_stop),
        };
    }

    let improved = match rec.direction {
        Direction::Long => candidate_stop > rec.effective_stop_price + trailing.min_step,
        Direction::Short => candidate_stop < rec.effective_stop_price - trailing.min_step,
    };
    if improved {
        (candidate_stop, best)
    } else {
        (rec.effective_stop_price, best)
    }
}

pub struct LifecycleTracker {
    store: Store,
    price_feed: SharedPriceFeed,
    exposure: Arc<ExposureIndex>,
    config: ConfigHandle,
    events: EventBus,
    clock: SharedClock,
    running: Arc<AtomicBool>,
}

impl LifecycleTracker {
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
            clock,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the poll loop as a background task and returns a handle the
    /// caller can `stop()`. Starting an already-running tracker is a no-op
    /// that returns `false`.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.events.publish(EngineEvent::TrackerStarted);
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
        true
    }

    pub fn stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if was_running {
            self.events.publish(EngineEvent::TrackerStopped);
        }
        was_running
    }

    async fn run(self: Arc<Self>) {
        let tick_ms = self.config.snapshot().tick_interval_ms;
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if let Err(e) = self.tick_once().await {
                warn!(error = %e, "lifecycle tracker tick failed");
            }
        }
    }

    /// One evaluation pass over every ACTIVE row. Exposed separately from
    /// `run` so callers (and tests) can drive a tick deterministically
    /// without waiting on the interval. Rows are evaluated concurrently via
    /// `join_all` over one snapshot `Vec<Recommendation>` fetched once at
    /// the top of the tick — every row is touched exactly once, so two
    /// tasks can never race on the same row within a tick even though they
    /// run concurrently across rows.
    pub async fn tick_once(&self) -> anyhow::Result<()> {
        let config = self.config.snapshot();
        let active = self.store.list_active(ActiveFilter::default()).await?;
        let now = self.clock.now();

        let tasks = active.into_iter().map(|rec| {
            let config = config.clone();
            async move { self.evaluate_one(rec, now, &config).await }
        });
        futures_util::future::join_all(tasks).await;
        Ok(())
    }

    async fn evaluate_one(&self, rec: Recommendation, now: DateTime<Utc>, config: &RuntimeConfig) {
        let price = match self.price_feed.get(&rec.symbol) {
            Ok(p) => p,
            Err(_) => {
                // Transient: no tick yet for this symbol this cycle.
                // Retried next tick, the row is left untouched.
                debug!(symbol = %rec.symbol, "no price available this tick");
                return;
            }
        };

        if let Some(exit) = evaluate_exit(&rec, price, now, config) {
            self.close_one(&rec, exit, now).await;
            return;
        }

        let mut patch = RecommendationPatch::default();
        let mut stop_basis = rec.clone();
        if let Some(ptp) = evaluate_partial_tp(&rec, price, config) {
            stop_basis.effective_stop_price = ptp.effective_stop_price;
            patch.tp1_hit = Some(ptp.tp1_hit);
            patch.tp2_hit = Some(ptp.tp2_hit);
            patch.tp3_hit = Some(ptp.tp3_hit);
            patch.reduction_count = Some(ptp.reduction_count);
            patch.reduction_ratio = Some(ptp.reduction_ratio);
        }

        let (new_stop, new_best) = advance_trailing(&stop_basis, price, config);
        patch.current_price = Some(price);
        patch.effective_stop_price = Some(new_stop);
        patch.best_favourable_price = Some(new_best);
        if let Err(e) = self.store.update_recommendation(&rec.id, patch).await {
            warn!(id = %rec.id, error = %e, "failed to persist tick update");
        }

        let sample = crate::domain::MonitoringSample {
            id: uuid::Uuid::new_v4().to_string(),
            recommendation_id: rec.id.clone(),
            check_time: now,
            current_price: Some(price),
            extra: serde_json::Value::Null,
        };
        if let Err(e) = self.store.save_monitoring_sample(&sample).await {
            warn!(id = %rec.id, error = %e, "failed to persist monitoring sample");
        }
    }

    /// Close attempts bounded by 3 tries with exponential backoff (50ms,
    /// 100ms, 200ms) before giving up and flagging `close_pending` for a
    /// later tick or operator to finish. A close is never dropped silently.
    const CLOSE_RETRY_ATTEMPTS: u32 = 3;
    const CLOSE_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

    async fn close_one(&self, rec: &Recommendation, exit: ExitDecision, now: DateTime<Utc>) {
        let pct = pnl_percent(rec.direction, rec.entry_price, exit.exit_price, rec.leverage);
        let amount = pnl_amount(pct, rec.position_size);

        let mut last_err = None;
        for attempt in 0..Self::CLOSE_RETRY_ATTEMPTS {
            match self
                .store
                .close_recommendation(&rec.id, exit.exit_price, now, exit.reason, None, pct, amount)
                .await
            {
                Ok(closed) => {
                    self.exposure.record_close(&closed);
                    self.events.publish(EngineEvent::Closed {
                        recommendation_id: closed.id.clone(),
                        symbol: closed.symbol.clone(),
                        exit_reason: exit.reason,
                        pnl_percent: pct,
                    });
                    return;
                }
                Err(e) => {
                    warn!(id = %rec.id, attempt, error = %e, "close attempt failed");
                    last_err = Some(e);
                    if attempt + 1 < Self::CLOSE_RETRY_ATTEMPTS {
                        tokio::time::sleep(Self::CLOSE_RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        // Retries exhausted: flag the row so a future tick or an operator
        // can finish the close instead of silently leaving it ACTIVE.
        warn!(id = %rec.id, error = ?last_err, "close failed after retries, marking close_pending");
        let patch = RecommendationPatch {
            close_pending: Some(true),
            ..Default::default()
        };
        let _ = self.store.update_recommendation(&rec.id, patch).await;
    }
}

pub type TrackerHandle = Arc<LifecycleTracker>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::RuntimeConfig;
    use crate::domain::{RecommendationMetadata, RecommendationStatus};
    use crate::price_feed::PriceFeed;

    fn rec(direction: Direction, entry: f64, sl: f64, tp: f64, created_at: DateTime<Utc>) -> Recommendation {
        Recommendation {
            id: "r1".into(),
            symbol: "ETH".into(),
            direction,
            entry_price: entry,
            current_price: entry,
            leverage: 1.0,
            position_size: 1.0,
            stop_loss_price: sl,
            take_profit_price: tp,
            trailing_override: None,
            atr_value: 1.0,
            atr_period: 14,
            atr_sl_multiplier: 2.0,
            atr_tp_multiplier: 3.0,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: true,
            reduction_count: 0,
            reduction_ratio: 0.0,
            expected_return: None,
            ev: None,
            ev_threshold: None,
            ev_ok: None,
            status: RecommendationStatus::Active,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            exit_label: None,
            pnl_percent: None,
            pnl_amount: None,
            effective_stop_price: sl,
            best_favourable_price: entry,
            close_pending: false,
            created_at,
            updated_at: created_at,
            source: None,
            strategy_type: None,
            ab_group: None,
            experiment_id: None,
            dedupe_key: None,
            metadata: RecommendationMetadata::default(),
        }
    }

    #[test]
    fn stop_loss_triggers_before_take_profit_on_long() {
        let now = Utc::now();
        let r = rec(Direction::Long, 100.0, 90.0, 110.0, now);
        let decision = evaluate_exit(&r, 90.0, now, &RuntimeConfig::default()).unwrap();
        assert_eq!(decision.reason, ExitReason::StopLoss);
    }

    #[test]
    fn take_profit_triggers_on_long_when_final_level_reached() {
        let now = Utc::now();
        let r = rec(Direction::Long, 100.0, 90.0, 110.0, now);
        let decision = evaluate_exit(&r, 111.0, now, &RuntimeConfig::default()).unwrap();
        assert_eq!(decision.reason, ExitReason::TakeProfit);
    }

    #[test]
    fn timeout_respects_min_holding_floor() {
        let mut config = RuntimeConfig::default();
        config.max_holding_hours = 1.0;
        config.min_holding_minutes = 90.0;
        let now = Utc::now();
        let created_at = now - chrono::Duration::minutes(65);
        let r = rec(Direction::Long, 100.0, 90.0, 110.0, created_at);
        // 65 minutes held: past max_holding_hours (60m) but short of the
        // 90-minute floor, so no timeout yet.
        assert!(evaluate_exit(&r, 100.0, now, &config).is_none());
    }

    #[test]
    fn timeout_fires_once_min_holding_floor_is_cleared() {
        let mut config = RuntimeConfig::default();
        config.max_holding_hours = 1.0;
        config.min_holding_minutes = 30.0;
        let now = Utc::now();
        let created_at = now - chrono::Duration::minutes(65);
        let r = rec(Direction::Long, 100.0, 90.0, 110.0, created_at);
        let decision = evaluate_exit(&r, 100.0, now, &config).unwrap();
        assert_eq!(decision.reason, ExitReason::Timeout);
    }

    #[test]
    fn partial_tp1_moves_stop_to_breakeven_without_closing() {
        let now = Utc::now();
        let mut r = rec(Direction::Long, 100.0, 90.0, 130.0, now);
        r.tp3_hit = false;
        let mut config = RuntimeConfig::default();
        config.partial_take_profit.enabled = true;

        // tp1_ratio=0.5 -> level at 115.0
        assert!(evaluate_exit(&r, 115.0, now, &config).is_none());
        let update = evaluate_partial_tp(&r, 115.0, &config).unwrap();
        assert!(update.tp1_hit);
        assert!(!update.tp2_hit);
        assert_eq!(update.reduction_count, 1);
        assert!((update.effective_stop_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn partial_tp_reduction_count_never_decreases_across_ticks() {
        let now = Utc::now();
        let mut r = rec(Direction::Long, 100.0, 90.0, 130.0, now);
        r.tp3_hit = false;
        let mut config = RuntimeConfig::default();
        config.partial_take_profit.enabled = true;

        let after_tp1 = evaluate_partial_tp(&r, 115.0, &config).unwrap();
        r.tp1_hit = after_tp1.tp1_hit;
        r.reduction_count = after_tp1.reduction_count;

        // tp2_ratio=0.75 -> level at 122.5
        let after_tp2 = evaluate_partial_tp(&r, 122.5, &config).unwrap();
        assert!(after_tp2.tp2_hit);
        assert!(after_tp2.reduction_count > after_tp1.reduction_count);
    }

    #[test]
    fn take_profit_closes_immediately_when_partial_levels_disabled() {
        let now = Utc::now();
        let mut r = rec(Direction::Long, 100.0, 90.0, 110.0, now);
        r.tp3_hit = false;
        let decision = evaluate_exit(&r, 110.0, now, &RuntimeConfig::default()).unwrap();
        assert_eq!(decision.reason, ExitReason::TakeProfit);
    }

    #[test]
    fn trailing_stop_raises_to_breakeven_then_trails_past_it() {
        let now = Utc::now();
        let mut config = RuntimeConfig::default();
        config.trailing.enabled = true;
        config.trailing.activate_on_breakeven = true;
        config.trailing.activate_profit_pct = 2.0;
        config.trailing.percent = 1.0;
        config.trailing.min_step = 0.0;

        let mut r = rec(Direction::Long, 2600.0, 2000.0, 1_000_000.0, now);
        r.effective_stop_price = 2000.0;
        r.best_favourable_price = 2600.0;

        // +1.9% favourable: below activate_profit_pct, so only the
        // breakeven floor engages, raising the stop to entry.
        let (stop1, best1) = advance_trailing(&r, 2650.0, &config);
        assert!((stop1 - 2600.0).abs() < 1e-9);
        assert!((best1 - 2650.0).abs() < 1e-9);
        r.effective_stop_price = stop1;
        r.best_favourable_price = best1;

        // +4%: clears activate_profit_pct, percent-trail takes over.
        let (stop2, best2) = advance_trailing(&r, 2704.0, &config);
        assert!((stop2 - 2676.96).abs() < 1e-6);
        assert!((best2 - 2704.0).abs() < 1e-9);
        r.effective_stop_price = stop2;
        r.best_favourable_price = best2;

        // Pullback below the trailed stop: best_favourable_price does not
        // retreat, so the stop holds at its high-water mark.
        let (stop3, best3) = advance_trailing(&r, 2650.0, &config);
        assert!((stop3 - stop2).abs() < 1e-9);
        assert!((best3 - 2704.0).abs() < 1e-9);
        r.effective_stop_price = stop3;

        let decision = evaluate_exit(&r, 2650.0, now, &config).unwrap();
        assert_eq!(decision.reason, ExitReason::StopLoss);
        assert!((decision.exit_price - 2676.96).abs() < 1e-6);
    }

    #[test]
    fn breakeven_exit_reason_when_stop_sits_exactly_at_entry() {
        let now = Utc::now();
        let mut r = rec(Direction::Long, 100.0, 90.0, 130.0, now);
        r.effective_stop_price = 100.0;
        let decision = evaluate_exit(&r, 99.0, now, &RuntimeConfig::default()).unwrap();
        assert_eq!(decision.reason, ExitReason::Breakeven);
    }

    #[tokio::test]
    async fn tick_once_closes_a_stopped_out_row() {
        let clock: SharedClock = Arc::new(TestClock::new(Utc::now()));
        let store = Store::open_in_memory().unwrap();
        let r = rec(Direction::Long, 100.0, 90.0, 110.0, clock.now());
        store.insert_recommendation(&r).await.unwrap();

        let price_feed = Arc::new(PriceFeed::new(clock.clone()));
        price_feed.push("ETH", 85.0);
        let exposure = Arc::new(ExposureIndex::new(clock.clone()));
        exposure.record_admit(&r);
        let config = ConfigHandle::new(RuntimeConfig::default());
        let events = EventBus::new(16);

        let tracker = LifecycleTracker::new(store.clone(), price_feed, exposure, config, events, clock);
        tracker.tick_once().await.unwrap();

        let closed = store.get("r1").await.unwrap().unwrap();
        assert_eq!(closed.status, RecommendationStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
    }
}
