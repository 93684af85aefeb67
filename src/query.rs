//! Read-side aggregations over closed recommendations: EV calibration bins,
//! hit rates, slippage summaries. Pure functions over `Vec<Recommendation>`
//! so they can be unit-tested without a store.

use crate::domain::{ExitReason, Recommendation, RecommendationStatus};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinMode {
    /// Fixed-width buckets over `[0, 1]` EV space.
    Even,
    /// Buckets with roughly equal row counts.
    Quantile,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub win_rate: f64,
    pub avg_pnl_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitReasonBreakdown {
    pub reason: String,
    pub count: usize,
    pub win_rate: f64,
    pub avg_pnl_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbGroupSummary {
    pub ab_group: String,
    pub total_closed: usize,
    pub win_rate: f64,
    pub avg_pnl_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_closed: usize,
    pub overall_win_rate: f64,
    pub avg_pnl_percent: f64,
    pub ev_bins: Vec<EvBin>,
    pub exit_reason_breakdown: Vec<ExitReasonBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_ab_group: Option<Vec<AbGroupSummary>>,
}

fn closed_only(rows: &[Recommendation]) -> Vec<&Recommendation> {
    rows.iter()
        .filter(|r| r.status == RecommendationStatus::Closed)
        .collect()
}

fn win_rate(rows: &[&Recommendation]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    let wins = rows
        .iter()
        .filter(|r| r.pnl_percent.unwrap_or(0.0) > 0.0)
        .count();
    wins as f64 / rows.len() as f64
}

fn avg_pnl(rows: &[&Recommendation]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter().map(|r| r.pnl_percent.unwrap_or(0.0)).sum::<f64>() / rows.len() as f64
}

/// Builds EV calibration bins over closed rows that carry an `ev` value.
/// Rows without an `ev` are excluded from binning (they were never scored)
/// but still count toward `StatsSummary::total_closed`.
pub fn ev_bins(rows: &[Recommendation], bin_count: usize, mode: BinMode) -> Vec<EvBin> {
    let bin_count = bin_count.max(1);
    let mut scored: Vec<&Recommendation> = closed_only(rows)
        .into_iter()
        .filter(|r| r.ev.is_some())
        .collect();
    if scored.is_empty() {
        return Vec::new();
    }

    match mode {
        BinMode::Even => {
            let width = 1.0 / bin_count as f64;
            (0..bin_count)
                .map(|i| {
                    let lower = i as f64 * width;
                    let upper = if i == bin_count - 1 { f64::INFINITY } else { (i + 1) as f64 * width };
                    let in_bin: Vec<&Recommendation> = scored
                        .iter()
                        .copied()
                        .filter(|r| {
                            let ev = r.ev.unwrap();
                            ev >= lower && ev < upper
                        })
                        .collect();
                    EvBin {
                        lower,
                        upper,
                        count: in_bin.len(),
                        win_rate: win_rate(&in_bin),
                        avg_pnl_percent: avg_pnl(&in_bin),
                    }
                })
                .collect()
        }
        BinMode::Quantile => {
            scored.sort_by(|a, b| a.ev.unwrap().partial_cmp(&b.ev.unwrap()).unwrap());
            let per_bin = (scored.len() as f64 / bin_count as f64).ceil() as usize;
            scored
                .chunks(per_bin.max(1))
                .map(|chunk| EvBin {
                    lower: chunk.first().map(|r| r.ev.unwrap()).unwrap_or(0.0),
                    upper: chunk.last().map(|r| r.ev.unwrap()).unwrap_or(0.0),
                    count: chunk.len(),
                    win_rate: win_rate(&chunk.iter().copied().collect::<Vec<_>>()),
                    avg_pnl_percent: avg_pnl(&chunk.iter().copied().collect::<Vec<_>>()),
                })
                .collect()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvOkSubgroup {
    pub ev_ok: bool,
    pub count: usize,
    pub win_rate: f64,
    pub avg_pnl_percent: f64,
}

/// Splits closed, EV-scored rows into the `ev_ok`/not-`ev_ok` subgroups
/// `GET /monitoring/ev-metrics?group_by=ev_threshold` reports (§6).
pub fn ev_ok_subgroups(rows: &[Recommendation]) -> Vec<EvOkSubgroup> {
    let scored: Vec<&Recommendation> = closed_only(rows)
        .into_iter()
        .filter(|r| r.ev_ok.is_some())
        .collect();
    [true, false]
        .iter()
        .filter_map(|&flag| {
            let matching: Vec<&Recommendation> =
                scored.iter().copied().filter(|r| r.ev_ok == Some(flag)).collect();
            if matching.is_empty() {
                return None;
            }
            Some(EvOkSubgroup {
                ev_ok: flag,
                count: matching.len(),
                win_rate: win_rate(&matching),
                avg_pnl_percent: avg_pnl(&matching),
            })
        })
        .collect()
}

fn exit_reason_str(reason: ExitReason) -> &'static str {
    match reason {
        ExitReason::StopLoss => "STOP_LOSS",
        ExitReason::TakeProfit => "TAKE_PROFIT",
        ExitReason::Breakeven => "BREAKEVEN",
        ExitReason::Timeout => "TIMEOUT",
        ExitReason::Manual => "MANUAL",
    }
}

pub fn exit_reason_breakdown(rows: &[Recommendation]) -> Vec<ExitReasonBreakdown> {
    let closed = closed_only(rows);
    let reasons = [
        ExitReason::StopLoss,
        ExitReason::TakeProfit,
        ExitReason::Breakeven,
        ExitReason::Timeout,
        ExitReason::Manual,
    ];
    reasons
        .iter()
        .filter_map(|&reason| {
            let matching: Vec<&Recommendation> = closed
                .iter()
                .copied()
                .filter(|r| r.exit_reason == Some(reason))
                .collect();
            if matching.is_empty() {
                return None;
            }
            Some(ExitReasonBreakdown {
                reason: exit_reason_str(reason).to_string(),
                count: matching.len(),
                win_rate: win_rate(&matching),
                avg_pnl_percent: avg_pnl(&matching),
            })
        })
        .collect()
}

/// Per-`ab_group` breakdown, included in the response only when the caller
/// names two or more groups (§6).
pub fn by_ab_group(rows: &[Recommendation], groups: &[String]) -> Vec<AbGroupSummary> {
    groups
        .iter()
        .map(|group| {
            let matching: Vec<&Recommendation> = closed_only(rows)
                .into_iter()
                .filter(|r| r.ab_group.as_deref() == Some(group.as_str()))
                .collect();
            AbGroupSummary {
                ab_group: group.clone(),
                total_closed: matching.len(),
                win_rate: win_rate(&matching),
                avg_pnl_percent: avg_pnl(&matching),
            }
        })
        .collect()
}

pub fn summarize(
    rows: &[Recommendation],
    bin_count: usize,
    mode: BinMode,
    ab_groups: &[String],
) -> StatsSummary {
    let closed = closed_only(rows);
    StatsSummary {
        total_closed: closed.len(),
        overall_win_rate: win_rate(&closed),
        avg_pnl_percent: avg_pnl(&closed),
        ev_bins: ev_bins(rows, bin_count, mode),
        exit_reason_breakdown: exit_reason_breakdown(rows),
        by_ab_group: if ab_groups.len() >= 2 {
            Some(by_ab_group(rows, ab_groups))
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, RecommendationMetadata};
    use chrono::Utc;

    fn closed_rec(ev: Option<f64>, pnl_percent: f64, reason: ExitReason) -> Recommendation {
        let now = Utc::now();
        Recommendation {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: "ETH".into(),
            direction: Direction::Long,
            entry_price: 100.0,
            current_price: 100.0,
            leverage: 1.0,
            position_size: 1.0,
            stop_loss_price: 90.0,
            take_profit_price: 110.0,
            trailing_override: None,
            atr_value: 1.0,
            atr_period: 14,
            atr_sl_multiplier: 2.0,
            atr_tp_multiplier: 3.0,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: false,
            reduction_count: 0,
            reduction_ratio: 0.0,
            expected_return: None,
            ev,
            ev_threshold: None,
            ev_ok: None,
            status: RecommendationStatus::Closed,
            exit_price: Some(100.0),
            exit_time: Some(now),
            exit_reason: Some(reason),
            exit_label: None,
            pnl_percent: Some(pnl_percent),
            pnl_amount: Some(pnl_percent / 100.0),
            effective_stop_price: 90.0,
            best_favourable_price: 100.0,
            close_pending: false,
            created_at: now,
            updated_at: now,
            source: None,
            strategy_type: None,
            ab_group: None,
            experiment_id: None,
            dedupe_key: None,
            metadata: RecommendationMetadata::default(),
        }
    }

    #[test]
    fn win_rate_counts_only_positive_pnl() {
        let rows = vec![
            closed_rec(Some(0.6), 5.0, ExitReason::TakeProfit),
            closed_rec(Some(0.6), -3.0, ExitReason::StopLoss),
        ];
        let summary = summarize(&rows, 5, BinMode::Even, &[]);
        assert_eq!(summary.total_closed, 2);
        assert!((summary.overall_win_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn ev_bins_exclude_unscored_rows() {
        let rows = vec![
            closed_rec(Some(0.2), 1.0, ExitReason::TakeProfit),
            closed_rec(None, 1.0, ExitReason::TakeProfit),
        ];
        let bins = ev_bins(&rows, 5, BinMode::Even);
        let total_binned: usize = bins.iter().map(|b| b.count).sum();
        assert_eq!(total_binned, 1);
    }

    #[test]
    fn by_ab_group_is_only_populated_with_two_or_more_groups() {
        let mut a = closed_rec(Some(0.2), 5.0, ExitReason::TakeProfit);
        a.ab_group = Some("A".into());
        let mut b = closed_rec(Some(0.2), -2.0, ExitReason::StopLoss);
        b.ab_group = Some("B".into());
        let rows = vec![a, b];

        let single = summarize(&rows, 5, BinMode::Even, &["A".to_string()]);
        assert!(single.by_ab_group.is_none());

        let both = summarize(&rows, 5, BinMode::Even, &["A".to_string(), "B".to_string()]);
        let groups = both.by_ab_group.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].total_closed, 1);
    }

    #[test]
    fn ev_ok_subgroups_split_by_flag() {
        let mut ok_row = closed_rec(Some(0.6), 4.0, ExitReason::TakeProfit);
        ok_row.ev_ok = Some(true);
        let mut not_ok_row = closed_rec(Some(0.1), -1.0, ExitReason::StopLoss);
        not_ok_row.ev_ok = Some(false);
        let rows = vec![ok_row, not_ok_row];

        let subgroups = ev_ok_subgroups(&rows);
        assert_eq!(subgroups.len(), 2);
        assert!(subgroups.iter().any(|s| s.ev_ok && s.count == 1));
        assert!(subgroups.iter().any(|s| !s.ev_ok && s.count == 1));
    }

    #[test]
    fn exit_reason_breakdown_skips_reasons_with_no_rows() {
        let rows = vec![closed_rec(Some(0.2), 1.0, ExitReason::TakeProfit)];
        let breakdown = exit_reason_breakdown(&rows);
        assert_eq!(breakdown.len(), 1);
        assert_eq!(breakdown[0].reason, "TAKE_PROFIT");
    }
}
