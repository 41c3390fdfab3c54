use std::collections::BTreeMap;

use serde::Serialize;

use super::error::ConfigError;

pub const DEFAULT_ALLOCATION: [f64; 3] = [0.3333, 0.3333, 0.3334];
pub const DEFAULT_YEARS: u32 = 30;
pub const MAX_YEARS: u32 = 200;
pub const DEFAULT_INFLATION_RATE: f64 = 7.0;
pub const DEFAULT_TRIALS: u32 = 1_000;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum StrategyType {
    #[default]
    ThreeBucket,
    TwoBucket,
    DynamicAggressive,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BucketId {
    Stable,
    Moderate,
    Growth,
}

impl BucketId {
    pub const ALL: [BucketId; 3] = [BucketId::Stable, BucketId::Moderate, BucketId::Growth];

    pub fn number(self) -> u8 {
        match self {
            BucketId::Stable => 1,
            BucketId::Moderate => 2,
            BucketId::Growth => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BucketId::Stable => "Stable Income",
            BucketId::Moderate => "Low Volatility",
            BucketId::Growth => "Growth/Equity",
        }
    }

    pub(crate) fn index(self) -> usize {
        self.number() as usize - 1
    }
}

/// Annual mean return and annual standard deviation, both as fractions.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    pub return_rate: f64,
    pub volatility: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BucketOverride {
    pub return_rate: Option<f64>,
    pub volatility: Option<f64>,
}

pub type BucketOverrides = BTreeMap<BucketId, BucketOverride>;

pub fn default_bucket_config(id: BucketId) -> BucketConfig {
    match id {
        BucketId::Stable => BucketConfig {
            return_rate: 0.055,
            volatility: 0.01,
        },
        BucketId::Moderate => BucketConfig {
            return_rate: 0.09,
            volatility: 0.05,
        },
        BucketId::Growth => BucketConfig {
            return_rate: 0.13,
            volatility: 0.14,
        },
    }
}

/// Default table entry for `id` with any overridden field layered on top.
pub fn resolve_bucket_config(id: BucketId, overrides: &BucketOverrides) -> BucketConfig {
    let base = default_bucket_config(id);
    match overrides.get(&id) {
        Some(o) => BucketConfig {
            return_rate: o.return_rate.unwrap_or(base.return_rate),
            volatility: o.volatility.unwrap_or(base.volatility),
        },
        None => base,
    }
}

#[derive(Debug, Clone)]
pub struct SimulationParameters {
    pub total_funds: f64,
    pub monthly_expense: f64,
    pub years: u32,
    /// Annual percentage, e.g. 7.0 for 7%.
    pub inflation_rate: f64,
    /// Relative weights; normalized before use.
    pub bucket_allocations: [f64; 3],
    pub bucket_overrides: BucketOverrides,
    pub strategy_type: StrategyType,
    pub annual_rebalancing: bool,
    pub tax_enabled: bool,
    pub is_joint: bool,
    pub num_trials: u32,
    pub seed: u64,
    pub start_age: Option<u32>,
}

impl SimulationParameters {
    pub fn new(total_funds: f64, monthly_expense: f64) -> Self {
        Self {
            total_funds,
            monthly_expense,
            years: DEFAULT_YEARS,
            inflation_rate: DEFAULT_INFLATION_RATE,
            bucket_allocations: DEFAULT_ALLOCATION,
            bucket_overrides: BucketOverrides::new(),
            strategy_type: StrategyType::ThreeBucket,
            annual_rebalancing: false,
            tax_enabled: false,
            is_joint: false,
            num_trials: DEFAULT_TRIALS,
            seed: DEFAULT_SEED,
            start_age: None,
        }
    }

    pub fn months(&self) -> u32 {
        self.years.saturating_mul(12)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.total_funds.is_finite() || self.total_funds <= 0.0 {
            return Err(ConfigError::NonPositiveTotalFunds);
        }
        if !self.monthly_expense.is_finite() || self.monthly_expense <= 0.0 {
            return Err(ConfigError::NonPositiveMonthlyExpense);
        }
        if self.years == 0 {
            return Err(ConfigError::ZeroYears);
        }
        if self.years > MAX_YEARS {
            return Err(ConfigError::TooManyYears(MAX_YEARS));
        }
        if !self.inflation_rate.is_finite() || self.inflation_rate <= -100.0 {
            return Err(ConfigError::InflationOutOfRange);
        }

        for id in BucketId::ALL {
            let cfg = resolve_bucket_config(id, &self.bucket_overrides);
            if !cfg.return_rate.is_finite() {
                return Err(ConfigError::InvalidBucket {
                    bucket: id.number(),
                    field: "return rate",
                    requirement: "finite",
                });
            }
            if !cfg.volatility.is_finite() || cfg.volatility < 0.0 {
                return Err(ConfigError::InvalidBucket {
                    bucket: id.number(),
                    field: "volatility",
                    requirement: "finite and >= 0",
                });
            }
        }

        self.normalized_allocation().map(|_| ())
    }

    pub fn normalized_allocation(&self) -> Result<[f64; 3], ConfigError> {
        if self
            .bucket_allocations
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(ConfigError::NegativeAllocation);
        }
        let sum: f64 = self.bucket_allocations.iter().sum();
        if sum <= 0.0 {
            return Err(ConfigError::ZeroAllocation);
        }
        Ok(self.bucket_allocations.map(|w| w / sum))
    }
}

/// Income Stability Ratio presets: corpus as a multiple of annual expense.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FireMode {
    Lean,
    Chubby,
    Fat,
    Custom,
}

impl FireMode {
    pub fn isr(self) -> u32 {
        match self {
            FireMode::Lean => 20,
            FireMode::Chubby => 24,
            FireMode::Fat => 33,
            FireMode::Custom => 25,
        }
    }
}

pub fn required_funds(monthly_expense: f64, isr: f64) -> f64 {
    monthly_expense * 12.0 * isr
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RuleEvent {
    StableLow,
    ModerateLow,
    StableEmpty,
    ModerateEmpty,
    Bankruptcy,
    TaxPaid(f64),
    TaxBankruptcy,
    DynamicReset,
    Rebalanced,
    ZeroFunds,
}

/// End-of-month snapshot for one trial. Written once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthRecord {
    pub month: u32,
    pub bucket1: f64,
    pub bucket2: f64,
    pub bucket3: f64,
    pub total_funds: f64,
    pub expense: f64,
    pub withdrawal_b1: f64,
    pub withdrawal_b2: f64,
    pub withdrawal_b3: f64,
    pub pull_to_b1: f64,
    pub pull_to_b2: f64,
    pub push_to_b1: f64,
    pub push_to_b2: f64,
    /// Excess return skimmed off bucket 1 with no destination.
    pub skim_lost_b1: f64,
    pub tax_paid: f64,
    pub return_amount_b1: f64,
    pub return_amount_b2: f64,
    pub return_amount_b3: f64,
    pub events: Vec<RuleEvent>,
    pub is_failed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialResult {
    pub trial_id: u32,
    pub months_lasted: u32,
    pub is_success: bool,
    pub final_amount: f64,
    pub history: Vec<MonthRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalDistribution {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PercentileTrials {
    pub p10: TrialResult,
    pub p25: TrialResult,
    pub p75: TrialResult,
    pub p90: TrialResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    /// Percentage of trials that survived the full horizon.
    pub success_rate: f64,
    pub total_trials: u32,
    pub seed: u64,
    /// Median trial by final balance.
    pub representative: TrialResult,
    pub percentile_trials: PercentileTrials,
    pub terminal_funds: TerminalDistribution,
}
