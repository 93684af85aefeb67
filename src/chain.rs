//! Decision-Chain Monitor: records every gate step taken for a submission,
//! links it to the resulting recommendation/execution, and supports
//! replaying a past chain's captured inputs against the current gate
//! pipeline to see whether today's configuration would decide differently.

use crate::clock::SharedClock;
use crate::config::RuntimeConfig;
use crate::domain::{ChainDecision, DecisionChain, DecisionStep, Direction, RecommendationSource};
use crate::gates::{default_pipeline, AdmissionRequest, Gate, GateContext, GateOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Everything a gate pipeline run needs, captured verbatim on the chain so a
/// later `replay` can reconstruct the exact `GateContext` without touching
/// the store or the live exposure index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedInputs {
    pub candidate: AdmissionRequest,
    pub config: RuntimeConfig,
    pub exposure: crate::exposure::ExposureSnapshot,
    pub same_direction_neighbors: Vec<crate::gates::ActiveNeighbor>,
    pub has_active_opposite: bool,
    pub current_price: Option<f64>,
    pub now: DateTime<Utc>,
}

pub struct ChainMonitor {
    clock: SharedClock,
}

impl ChainMonitor {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    pub fn start_chain(
        &self,
        symbol: &str,
        direction: Direction,
        source: RecommendationSource,
        captured_inputs: &CapturedInputs,
    ) -> DecisionChain {
        let created_at = self.clock.now();
        let nonce = Uuid::new_v4().simple().to_string();
        DecisionChain {
            chain_id: format!(
                "CHAIN|{symbol}|{}|{}|{nonce}",
                direction.as_str(),
                created_at.timestamp_millis()
            ),
            symbol: symbol.to_string(),
            direction,
            source,
            created_at,
            end_at: None,
            final_decision: ChainDecision::Pending,
            final_reason: None,
            recommendation_id: None,
            execution_id: None,
            steps: Vec::new(),
            captured_inputs: serde_json::to_value(captured_inputs)
                .unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn add_step(
        &self,
        chain: &mut DecisionChain,
        stage: &str,
        decision: ChainDecision,
        reason: &str,
        details: serde_json::Value,
    ) {
        chain.steps.push(DecisionStep {
            stage: stage.to_string(),
            decision,
            reason: reason.to_string(),
            details,
            timestamp: self.clock.now(),
        });
    }

    pub fn link_recommendation(&self, chain: &mut DecisionChain, recommendation_id: String) {
        chain.recommendation_id = Some(recommendation_id);
    }

    pub fn link_execution(&self, chain: &mut DecisionChain, execution_id: String) {
        chain.execution_id = Some(execution_id);
    }

    /// Sets the terminal decision once. A chain that already carries a
    /// non-pending `final_decision` is left untouched — finalize is
    /// idempotent so a retried close or a duplicate gate-rejection callback
    /// can never flip an already-decided chain.
    pub fn finalize(
        &self,
        chain: &mut DecisionChain,
        decision: ChainDecision,
        reason: Option<String>,
    ) -> bool {
        if chain.final_decision != ChainDecision::Pending {
            return false;
        }
        chain.final_decision = decision;
        chain.final_reason = reason;
        chain.end_at = Some(self.clock.now());
        true
    }
}

/// A single gate's replayed verdict, compared against what the chain
/// recorded the first time around.
#[derive(Debug, Clone, Serialize)]
pub struct StepDifference {
    pub stage: String,
    pub original_decision: ChainDecision,
    pub replay_decision: ChainDecision,
    pub original_reason: String,
    pub replay_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    pub chain_id: String,
    pub original_final_decision: ChainDecision,
    pub replay_final_decision: ChainDecision,
    pub differences: Vec<StepDifference>,
    pub analysis: String,
}

/// Re-runs the gate pipeline against a chain's captured inputs and compares
/// the outcome to what was recorded at submission time. Returns `Ok(None)`
/// when the chain carries no `captured_inputs` (chains created before this
/// field existed, or ones that never reached gate evaluation).
pub fn replay(chain: &DecisionChain, pipeline: &[Box<dyn Gate>]) -> Option<ReplayResult> {
    if chain.captured_inputs.is_null() {
        return None;
    }
    let captured: CapturedInputs = serde_json::from_value(chain.captured_inputs.clone()).ok()?;

    let ctx = GateContext {
        candidate: &captured.candidate,
        config: Arc::new(captured.config.clone()),
        exposure: captured.exposure,
        same_direction_neighbors: captured.same_direction_neighbors.clone(),
        has_active_opposite: captured.has_active_opposite,
        current_price: captured.current_price,
        now: captured.now,
    };

    let mut replay_decision = ChainDecision::Approved;
    let mut replay_steps: Vec<(String, ChainDecision, String)> = Vec::new();
    for gate in pipeline {
        match gate.evaluate(&ctx) {
            GateOutcome::Pass { .. } => {
                replay_steps.push((gate.stage().to_string(), ChainDecision::Approved, String::new()));
            }
            GateOutcome::Reject(err) => {
                replay_steps.push((gate.stage().to_string(), ChainDecision::Rejected, err.to_string()));
                replay_decision = ChainDecision::Rejected;
                break;
            }
        }
    }

    let mut differences = Vec::new();
    for original in &chain.steps {
        if let Some((_, replay_decision_for_stage, replay_reason)) =
            replay_steps.iter().find(|(stage, _, _)| *stage == original.stage)
        {
            if *replay_decision_for_stage != original.decision {
                differences.push(StepDifference {
                    stage: original.stage.clone(),
                    original_decision: original.decision,
                    replay_decision: *replay_decision_for_stage,
                    original_reason: original.reason.clone(),
                    replay_reason: replay_reason.clone(),
                });
            }
        }
    }

    let analysis = if differences.is_empty() && replay_decision == chain.final_decision {
        "replay agrees with the original decision".to_string()
    } else {
        format!(
            "replay diverges at {} stage(s); final decision {:?} vs original {:?}",
            differences.len(),
            replay_decision,
            chain.final_decision
        )
    };

    Some(ReplayResult {
        chain_id: chain.chain_id.clone(),
        original_final_decision: chain.final_decision,
        replay_final_decision: replay_decision,
        differences,
        analysis,
    })
}

/// Aggregate outcome of replaying many chains at once (§4.3
/// `batch_replay(ids, {parallel, max_concurrency, include_analysis})`).
#[derive(Debug, Clone, Serialize)]
pub struct BatchReplayOutcome {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ReplayResult>,
    pub summary: String,
}

/// Replays many chains at once. `parallel` switches between a sequential
/// fold and a `rayon` work-stealing split — both produce the same results,
/// the parallel path only matters for large batches. `max_concurrency`
/// bounds the worker pool used for the parallel path (0 = rayon's default,
/// auto-detected from available cores, matching the teacher's
/// `ParallelConfig::num_threads` convention). `include_analysis` strips the
/// free-text `analysis` field from each result when the caller only wants
/// the decisions, not the prose.
pub fn batch_replay(
    chains: &[DecisionChain],
    parallel: bool,
    max_concurrency: usize,
    include_analysis: bool,
) -> BatchReplayOutcome {
    let pipeline = default_pipeline();
    let mut results: Vec<ReplayResult> = if parallel {
        use rayon::prelude::*;
        let replay_all = || {
            chains
                .par_iter()
                .filter_map(|chain| replay(chain, &pipeline))
                .collect()
        };
        if max_concurrency > 0 {
            match rayon::ThreadPoolBuilder::new().num_threads(max_concurrency).build() {
                Ok(pool) => pool.install(replay_all),
                Err(_) => replay_all(),
            }
        } else {
            replay_all()
        }
    } else {
        chains.iter().filter_map(|chain| replay(chain, &pipeline)).collect()
    };

    if !include_analysis {
        for r in &mut results {
            r.analysis.clear();
        }
    }

    let total = chains.len();
    let successful = results
        .iter()
        .filter(|r| r.differences.is_empty() && r.replay_final_decision == r.original_final_decision)
        .count();
    let failed = results.len().saturating_sub(successful);
    let summary = format!(
        "{successful}/{total} chains replay identically, {failed} diverge, {} had no captured inputs",
        total.saturating_sub(results.len())
    );

    BatchReplayOutcome {
        total,
        successful,
        failed,
        results,
        summary,
    }
}
