use rayon::prelude::*;

use super::error::ConfigError;
use super::monte_carlo::success_rate;
use super::types::{
    BucketId, BucketOverride, SimulationParameters, StrategyType, required_funds,
    resolve_bucket_config,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocationPreset {
    pub name: &'static str,
    pub allocation: [f64; 3],
}

const fn preset(name: &'static str, allocation: [f64; 3]) -> AllocationPreset {
    AllocationPreset { name, allocation }
}

pub const THREE_BUCKET_PRESETS: [AllocationPreset; 6] = [
    preset("Conservative (60/30/10)", [0.60, 0.30, 0.10]),
    preset("Balanced (33/33/33)", [0.3333, 0.3333, 0.3334]),
    preset("Growth (10/30/60)", [0.10, 0.30, 0.60]),
    preset("Aggressive (0/20/80)", [0.0, 0.20, 0.80]),
    preset("Ultra Safe (80/20/0)", [0.80, 0.20, 0.0]),
    preset("Barbell (40/10/50)", [0.40, 0.10, 0.50]),
];

pub const TWO_BUCKET_PRESETS: [AllocationPreset; 6] = [
    preset("Safe (80/20)", [0.80, 0.20, 0.0]),
    preset("Conservative (60/40)", [0.60, 0.40, 0.0]),
    preset("Balanced (50/50)", [0.50, 0.50, 0.0]),
    preset("Growth (40/60)", [0.40, 0.60, 0.0]),
    preset("Aggressive (20/80)", [0.20, 0.80, 0.0]),
    preset("Equity Heavy (10/90)", [0.10, 0.90, 0.0]),
];

pub fn presets_for(strategy: StrategyType) -> &'static [AllocationPreset] {
    // Dynamic-aggressive sets its own starting split, so any preset list
    // gives the same rates; the three-bucket names describe it better.
    match strategy {
        StrategyType::TwoBucket => &TWO_BUCKET_PRESETS,
        StrategyType::ThreeBucket | StrategyType::DynamicAggressive => &THREE_BUCKET_PRESETS,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizeConfig {
    pub isr_min: u32,
    pub isr_max: u32,
    /// Percent, 0..=100.
    pub target_success_rate: f64,
    pub search_trials: u32,
    pub verify_trials: u32,
    /// Verified rate may fall this many points short of target and still pass.
    pub verify_tolerance: f64,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            isr_min: 15,
            isr_max: 60,
            target_success_rate: 85.0,
            search_trials: 500,
            verify_trials: 2_000,
            verify_tolerance: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyCandidate {
    pub allocation_name: &'static str,
    pub allocation: [f64; 3],
    pub isr: u32,
    pub success_rate: f64,
    pub total_funds_required: f64,
}

/// Lowest ISR per preset that reaches the target, cheapest first.
/// Presets whose search finds nothing, or whose verification run falls short,
/// are omitted.
pub fn find_optimal_strategy(
    base: &SimulationParameters,
    config: OptimizeConfig,
) -> Result<Vec<StrategyCandidate>, ConfigError> {
    validate_optimize_config(config)?;
    params_at_isr(base, config.isr_min).validate()?;

    let presets = presets_for(base.strategy_type);
    tracing::debug!(
        presets = presets.len(),
        isr_min = config.isr_min,
        isr_max = config.isr_max,
        target = config.target_success_rate,
        "searching optimal strategy"
    );

    let found: Vec<Option<StrategyCandidate>> = presets
        .par_iter()
        .map(|preset| optimize_preset(base, preset, config))
        .collect::<Result<Vec<_>, ConfigError>>()?;

    let mut results: Vec<StrategyCandidate> = found.into_iter().flatten().collect();
    results.sort_by(|a, b| {
        a.isr
            .cmp(&b.isr)
            .then(b.success_rate.total_cmp(&a.success_rate))
    });

    tracing::info!(
        accepted = results.len(),
        presets = presets.len(),
        "strategy search complete"
    );
    Ok(results)
}

fn optimize_preset(
    base: &SimulationParameters,
    preset: &AllocationPreset,
    config: OptimizeConfig,
) -> Result<Option<StrategyCandidate>, ConfigError> {
    let mut params = base.clone();
    params.bucket_allocations = preset.allocation;

    let isr = lowest_passing_isr(config.isr_min, config.isr_max, |isr| {
        let rate = success_rate(&params_at_isr(&params, isr), config.search_trials)?;
        Ok(rate >= config.target_success_rate)
    })?;
    let Some(isr) = isr else {
        tracing::debug!(preset = preset.name, "no ISR in range meets target");
        return Ok(None);
    };

    let verified = success_rate(&params_at_isr(&params, isr), config.verify_trials)?;
    if verified < config.target_success_rate - config.verify_tolerance {
        tracing::debug!(preset = preset.name, isr, verified, "verification fell short");
        return Ok(None);
    }

    Ok(Some(StrategyCandidate {
        allocation_name: preset.name,
        allocation: preset.allocation,
        isr,
        success_rate: verified,
        total_funds_required: required_funds(base.monthly_expense, isr as f64),
    }))
}

/// Every preset evaluated at one ISR, best success rate first.
pub fn analyze_fixed_isr(
    base: &SimulationParameters,
    isr: u32,
    trials: u32,
) -> Result<Vec<StrategyCandidate>, ConfigError> {
    if isr == 0 {
        return Err(ConfigError::InvalidSearch {
            field: "isr",
            requirement: "> 0",
        });
    }
    if trials == 0 {
        return Err(ConfigError::ZeroTrials);
    }
    let at_isr = params_at_isr(base, isr);
    at_isr.validate()?;

    let mut results: Vec<StrategyCandidate> = presets_for(base.strategy_type)
        .par_iter()
        .map(|preset| -> Result<StrategyCandidate, ConfigError> {
            let mut params = at_isr.clone();
            params.bucket_allocations = preset.allocation;
            Ok(StrategyCandidate {
                allocation_name: preset.name,
                allocation: preset.allocation,
                isr,
                success_rate: success_rate(&params, trials)?,
                total_funds_required: params.total_funds,
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    results.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
    Ok(results)
}

#[derive(Debug, Clone, Copy)]
pub struct VolatilitySweepConfig {
    pub target_success_rate: f64,
    pub trials: u32,
    pub isr_floor: u32,
    pub isr_ceiling: u32,
    /// Next step searches from `max(isr_floor, previous - backoff)`.
    pub backoff: u32,
}

impl Default for VolatilitySweepConfig {
    fn default() -> Self {
        Self {
            target_success_rate: 90.0,
            trials: 250,
            isr_floor: 15,
            isr_ceiling: 100,
            backoff: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolatilityPoint {
    /// Growth-bucket annual volatility, percent.
    pub volatility: f64,
    pub min_isr: u32,
}

/// Growth-bucket volatility grid in percent: 1% steps from 5 to 8, 0.5% steps
/// from 9 to 15, then 1% steps to 25.
pub fn volatility_steps() -> Vec<f64> {
    let coarse_low = (5..=8).map(f64::from);
    let fine = (18..=30).map(|half| half as f64 / 2.0);
    let coarse_high = (16..=25).map(f64::from);
    coarse_low.chain(fine).chain(coarse_high).collect()
}

/// Minimum ISR reaching the target at each growth-bucket volatility. The
/// growth return stays at its resolved value; an unreachable target reports
/// the ceiling.
pub fn volatility_sweep(
    base: &SimulationParameters,
    config: VolatilitySweepConfig,
) -> Result<Vec<VolatilityPoint>, ConfigError> {
    validate_sweep_config(config)?;
    params_at_isr(base, config.isr_floor).validate()?;

    let growth_return = resolve_bucket_config(BucketId::Growth, &base.bucket_overrides).return_rate;
    let steps = volatility_steps();
    tracing::debug!(steps = steps.len(), trials = config.trials, "starting volatility sweep");

    let mut points = Vec::with_capacity(steps.len());
    let mut lower = config.isr_floor;
    for volatility in steps {
        let mut params = base.clone();
        params.bucket_overrides.insert(
            BucketId::Growth,
            BucketOverride {
                return_rate: Some(growth_return),
                volatility: Some(volatility / 100.0),
            },
        );

        let found = lowest_passing_isr(lower, config.isr_ceiling, |isr| {
            let rate = success_rate(&params_at_isr(&params, isr), config.trials)?;
            Ok(rate >= config.target_success_rate)
        })?;
        let min_isr = found.unwrap_or(config.isr_ceiling);

        lower = min_isr
            .saturating_sub(config.backoff)
            .max(config.isr_floor);
        points.push(VolatilityPoint {
            volatility,
            min_isr,
        });
    }

    tracing::info!(points = points.len(), "volatility sweep complete");
    Ok(points)
}

fn params_at_isr(base: &SimulationParameters, isr: u32) -> SimulationParameters {
    let mut params = base.clone();
    params.total_funds = required_funds(base.monthly_expense, isr as f64);
    params
}

/// Binary search over `[low, high]` for the smallest ISR where `passes` holds,
/// assuming it is monotone in ISR.
fn lowest_passing_isr(
    mut low: u32,
    mut high: u32,
    mut passes: impl FnMut(u32) -> Result<bool, ConfigError>,
) -> Result<Option<u32>, ConfigError> {
    let mut best = None;
    while low <= high {
        let mid = low + (high - low) / 2;
        if passes(mid)? {
            best = Some(mid);
            if mid == 0 {
                break;
            }
            high = mid - 1;
        } else {
            low = mid + 1;
        }
    }
    Ok(best)
}

fn validate_target(target: f64) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&target) {
        return Err(ConfigError::InvalidSearch {
            field: "target success rate",
            requirement: "between 0 and 100",
        });
    }
    Ok(())
}

fn validate_optimize_config(config: OptimizeConfig) -> Result<(), ConfigError> {
    if config.isr_min == 0 {
        return Err(ConfigError::InvalidSearch {
            field: "isr_min",
            requirement: "> 0",
        });
    }
    if config.isr_max < config.isr_min {
        return Err(ConfigError::InvalidSearch {
            field: "isr_max",
            requirement: ">= isr_min",
        });
    }
    validate_target(config.target_success_rate)?;
    if config.search_trials == 0 {
        return Err(ConfigError::InvalidSearch {
            field: "search_trials",
            requirement: "> 0",
        });
    }
    if config.verify_trials == 0 {
        return Err(ConfigError::InvalidSearch {
            field: "verify_trials",
            requirement: "> 0",
        });
    }
    if !config.verify_tolerance.is_finite() || config.verify_tolerance < 0.0 {
        return Err(ConfigError::InvalidSearch {
            field: "verify_tolerance",
            requirement: "finite and >= 0",
        });
    }
    Ok(())
}

fn validate_sweep_config(config: VolatilitySweepConfig) -> Result<(), ConfigError> {
    if config.isr_floor == 0 {
        return Err(ConfigError::InvalidSearch {
            field: "isr_floor",
            requirement: "> 0",
        });
    }
    if config.isr_ceiling < config.isr_floor {
        return Err(ConfigError::InvalidSearch {
            field: "isr_ceiling",
            requirement: ">= isr_floor",
        });
    }
    validate_target(config.target_success_rate)?;
    if config.trials == 0 {
        return Err(ConfigError::InvalidSearch {
            field: "trials",
            requirement: "> 0",
        });
    }
    Ok(())
}
