use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use super::engine::{TrialPlan, TrialSummary, run_trial, simulate_trial};
use super::error::ConfigError;
use super::sampler::{BoxMuller, derive_seed};
use super::types::{
    AggregateResult, PercentileTrials, SimulationParameters, TerminalDistribution, TrialResult,
};

/// Shared abort flag, checked before each trial starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(AggregateResult),
    Cancelled { completed: u32 },
}

pub fn run_monte_carlo(
    params: &SimulationParameters,
    num_trials: u32,
) -> Result<AggregateResult, ConfigError> {
    match run_monte_carlo_with_cancel(params, num_trials, &CancelToken::new())? {
        RunOutcome::Completed(result) => Ok(result),
        // A fresh token is never set.
        RunOutcome::Cancelled { .. } => unreachable!("uncancelled run reported cancellation"),
    }
}

/// Success rate only, for callers that search over many configurations.
pub fn success_rate(params: &SimulationParameters, num_trials: u32) -> Result<f64, ConfigError> {
    let plan = plan_for(params, num_trials)?;
    let successes = (0..num_trials)
        .into_par_iter()
        .filter(|&trial_id| summarize(&plan, params.seed, trial_id).is_success)
        .count();
    Ok(successes as f64 / num_trials as f64 * 100.0)
}

pub fn run_monte_carlo_with_cancel(
    params: &SimulationParameters,
    num_trials: u32,
    cancel: &CancelToken,
) -> Result<RunOutcome, ConfigError> {
    let plan = plan_for(params, num_trials)?;
    tracing::debug!(trials = num_trials, seed = params.seed, "starting monte carlo run");

    let summaries: Vec<Option<TrialSummary>> = (0..num_trials)
        .into_par_iter()
        .map(|trial_id| {
            if cancel.is_cancelled() {
                None
            } else {
                Some(summarize(&plan, params.seed, trial_id))
            }
        })
        .collect();

    let completed = summaries.iter().filter(|s| s.is_some()).count() as u32;
    if completed < num_trials {
        tracing::warn!(completed, trials = num_trials, "monte carlo run cancelled");
        return Ok(RunOutcome::Cancelled { completed });
    }
    let mut summaries: Vec<TrialSummary> = summaries.into_iter().flatten().collect();

    let successes = summaries.iter().filter(|s| s.is_success).count();
    let success_rate = successes as f64 / num_trials as f64 * 100.0;

    let mut finals: Vec<f64> = summaries.iter().map(|s| s.final_amount).collect();
    let terminal_funds = TerminalDistribution {
        p10: percentile(&mut finals, 10.0),
        p25: percentile(&mut finals, 25.0),
        p50: percentile(&mut finals, 50.0),
        p75: percentile(&mut finals, 75.0),
        p90: percentile(&mut finals, 90.0),
    };

    // Stable: ties keep trial order, so selection is reproducible.
    summaries.sort_by(|a, b| a.final_amount.total_cmp(&b.final_amount));
    let replay = |idx: usize| replay_trial(&plan, params.seed, summaries[idx].trial_id);

    let n = summaries.len();
    let representative = replay(n / 2);
    let percentile_trials = PercentileTrials {
        p10: replay(percentile_index(n, 0.10)),
        p25: replay(percentile_index(n, 0.25)),
        p75: replay(percentile_index(n, 0.75)),
        p90: replay(percentile_index(n, 0.90)),
    };

    tracing::info!(
        success_rate,
        trials = num_trials,
        median_final = representative.final_amount,
        "monte carlo run complete"
    );

    Ok(RunOutcome::Completed(AggregateResult {
        success_rate,
        total_trials: num_trials,
        seed: params.seed,
        representative,
        percentile_trials,
        terminal_funds,
    }))
}

fn plan_for(params: &SimulationParameters, num_trials: u32) -> Result<TrialPlan, ConfigError> {
    if num_trials == 0 {
        return Err(ConfigError::ZeroTrials);
    }
    TrialPlan::from_parameters(params)
}

fn summarize(plan: &TrialPlan, base_seed: u64, trial_id: u32) -> TrialSummary {
    let mut normals = BoxMuller::seeded(derive_seed(base_seed, trial_id));
    simulate_trial(plan, trial_id, &mut normals, None)
}

// Histories are only kept for the handful of trials that get reported; the
// seeded stream replays them exactly.
fn replay_trial(plan: &TrialPlan, base_seed: u64, trial_id: u32) -> TrialResult {
    let mut normals = BoxMuller::seeded(derive_seed(base_seed, trial_id));
    run_trial(plan, trial_id, &mut normals)
}

fn percentile_index(n: usize, fraction: f64) -> usize {
    ((n as f64 * fraction).floor() as usize).min(n.saturating_sub(1))
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}
