mod engine;
mod error;
mod monte_carlo;
mod sampler;
mod solver;
mod tax;
mod types;

pub use engine::{
    BucketTriple, TrialPlan, TrialSummary, ZERO_FUNDS_EPSILON, grow_bucket, run_single_trial,
    run_trial, simulate_trial, step_month,
};
pub use error::ConfigError;
pub use monte_carlo::{
    CancelToken, RunOutcome, run_monte_carlo, run_monte_carlo_with_cancel, success_rate,
};
pub use sampler::{BoxMuller, NormalSource, derive_seed};
pub use solver::{
    AllocationPreset, OptimizeConfig, StrategyCandidate, THREE_BUCKET_PRESETS, TWO_BUCKET_PRESETS,
    VolatilityPoint, VolatilitySweepConfig, analyze_fixed_isr, find_optimal_strategy,
    presets_for, volatility_steps, volatility_sweep,
};
pub use tax::{AnnualTaxBill, annual_tax_bill, capital_gains_tax, progressive_tax};
pub use types::{
    AggregateResult, BucketConfig, BucketId, BucketOverride, BucketOverrides, DEFAULT_ALLOCATION,
    DEFAULT_INFLATION_RATE, DEFAULT_SEED, DEFAULT_TRIALS, DEFAULT_YEARS, FireMode, MAX_YEARS,
    MonthRecord, PercentileTrials, RuleEvent, SimulationParameters, StrategyType, TerminalDistribution,
    TrialResult, default_bucket_config, required_funds, resolve_bucket_config,
};
