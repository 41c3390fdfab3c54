use super::error::ConfigError;
use super::sampler::{BoxMuller, NormalSource, derive_seed};
use super::tax::annual_tax_bill;
use super::types::{
    BucketConfig, BucketId, MonthRecord, RuleEvent, SimulationParameters, StrategyType,
    TrialResult, resolve_bucket_config,
};

/// Totals below this count as depleted after the return step.
pub const ZERO_FUNDS_EPSILON: f64 = 0.01;
const REPLENISH_TRIGGER_YEARS: f64 = 3.0;
const DYNAMIC_STABLE_YEARS: f64 = 4.0;
const DYNAMIC_MODERATE_YEARS: f64 = 6.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketTriple {
    pub b1: f64,
    pub b2: f64,
    pub b3: f64,
}

impl BucketTriple {
    pub fn total(self) -> f64 {
        self.b1 + self.b2 + self.b3
    }

    pub fn from_allocation(total: f64, allocation: [f64; 3]) -> Self {
        Self {
            b1: total * allocation[0],
            b2: total * allocation[1],
            b3: total * allocation[2],
        }
    }

    /// Four years of expense in b1, six in b2, remainder in b3. Fills in that
    /// order when `total` cannot cover both buffers.
    pub fn dynamic_targets(total: f64, annual_expense: f64) -> Self {
        let target_b1 = DYNAMIC_STABLE_YEARS * annual_expense;
        let target_b2 = DYNAMIC_MODERATE_YEARS * annual_expense;

        if total >= target_b1 + target_b2 {
            Self {
                b1: target_b1,
                b2: target_b2,
                b3: total - target_b1 - target_b2,
            }
        } else if total >= target_b1 {
            Self {
                b1: target_b1,
                b2: total - target_b1,
                b3: 0.0,
            }
        } else {
            Self {
                b1: total,
                b2: 0.0,
                b3: 0.0,
            }
        }
    }
}

/// Per-run constants, resolved once and shared read-only by every trial.
#[derive(Debug, Clone)]
pub struct TrialPlan {
    pub months: u32,
    pub initial_buckets: BucketTriple,
    pub initial_monthly_expense: f64,
    pub inflation_rate: f64,
    pub allocation: [f64; 3],
    pub configs: [BucketConfig; 3],
    pub strategy_type: StrategyType,
    pub annual_rebalancing: bool,
    pub tax_enabled: bool,
    pub is_joint: bool,
}

impl TrialPlan {
    pub fn from_parameters(params: &SimulationParameters) -> Result<Self, ConfigError> {
        params.validate()?;
        let allocation = params.normalized_allocation()?;

        let initial_buckets = match params.strategy_type {
            StrategyType::DynamicAggressive => {
                BucketTriple::dynamic_targets(params.total_funds, params.monthly_expense * 12.0)
            }
            StrategyType::ThreeBucket | StrategyType::TwoBucket => {
                BucketTriple::from_allocation(params.total_funds, allocation)
            }
        };

        Ok(Self {
            months: params.months(),
            initial_buckets,
            initial_monthly_expense: params.monthly_expense,
            inflation_rate: params.inflation_rate,
            allocation,
            configs: BucketId::ALL.map(|id| resolve_bucket_config(id, &params.bucket_overrides)),
            strategy_type: params.strategy_type,
            annual_rebalancing: params.annual_rebalancing,
            tax_enabled: params.tax_enabled,
            is_joint: params.is_joint,
        })
    }

    fn config(&self, id: BucketId) -> BucketConfig {
        self.configs[id.index()]
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct YearToDate {
    withdrawal_b1: f64,
    withdrawal_b2: f64,
    withdrawal_b3: f64,
}

/// Mutable state owned by exactly one trial.
#[derive(Debug, Clone)]
pub struct TrialState {
    pub buckets: BucketTriple,
    pub monthly_expense: f64,
    ytd: YearToDate,
}

impl TrialState {
    pub fn new(plan: &TrialPlan) -> Self {
        Self {
            buckets: plan.initial_buckets,
            monthly_expense: plan.initial_monthly_expense,
            ytd: YearToDate::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pulls {
    pub to_b1: f64,
    pub to_b2: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Withdrawal {
    pub b1: f64,
    pub b2: f64,
    pub b3: f64,
    pub shortfall: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketGrowth {
    pub balance: f64,
    pub skim: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ReturnStep {
    push_to_b1: f64,
    push_to_b2: f64,
    skim_lost_b1: f64,
    profit: [f64; 3],
}

/// Advances one trial by one month. `month` is 1-based.
pub fn step_month<N: NormalSource>(
    plan: &TrialPlan,
    state: &mut TrialState,
    month: u32,
    normals: &mut N,
) -> MonthRecord {
    if month > 1 && (month - 1) % 12 == 0 {
        state.monthly_expense *= 1.0 + plan.inflation_rate / 100.0;
    }
    let monthly_expense = state.monthly_expense;
    let annual_expense = monthly_expense * 12.0;
    let mut events = Vec::new();

    let pulls = replenish(&mut state.buckets, annual_expense, &mut events);
    let withdrawal = withdraw(&mut state.buckets, monthly_expense, &mut events);
    let mut failed = withdrawal.shortfall;

    state.ytd.withdrawal_b1 += withdrawal.b1;
    state.ytd.withdrawal_b2 += withdrawal.b2;
    state.ytd.withdrawal_b3 += withdrawal.b3;

    let mut tax_paid = 0.0;
    if month % 12 == 0 {
        if plan.tax_enabled && !failed {
            let bill = annual_tax_bill(
                state.ytd.withdrawal_b1 + state.ytd.withdrawal_b2,
                state.ytd.withdrawal_b3,
                plan.is_joint,
            );
            tax_paid = bill.total();
            if tax_paid > 0.0 {
                events.push(RuleEvent::TaxPaid(tax_paid));
            }
            if !deduct_cascade(&mut state.buckets, tax_paid) {
                failed = true;
                events.push(RuleEvent::TaxBankruptcy);
            }
        }
        state.ytd = YearToDate::default();

        if !failed {
            rebalance(plan, &mut state.buckets, annual_expense, &mut events);
        }
    }

    if failed {
        state.buckets = BucketTriple::default();
        return MonthRecord {
            month,
            bucket1: 0.0,
            bucket2: 0.0,
            bucket3: 0.0,
            total_funds: 0.0,
            expense: monthly_expense,
            withdrawal_b1: withdrawal.b1,
            withdrawal_b2: withdrawal.b2,
            withdrawal_b3: withdrawal.b3,
            pull_to_b1: pulls.to_b1,
            pull_to_b2: pulls.to_b2,
            push_to_b1: 0.0,
            push_to_b2: 0.0,
            skim_lost_b1: 0.0,
            tax_paid,
            return_amount_b1: 0.0,
            return_amount_b2: 0.0,
            return_amount_b3: 0.0,
            events,
            is_failed: true,
        };
    }

    let returns = apply_returns(plan, &mut state.buckets, normals);
    let total_funds = state.buckets.total();
    let is_failed = total_funds < ZERO_FUNDS_EPSILON;
    if is_failed {
        events.push(RuleEvent::ZeroFunds);
    }

    MonthRecord {
        month,
        bucket1: state.buckets.b1,
        bucket2: state.buckets.b2,
        bucket3: state.buckets.b3,
        total_funds,
        expense: monthly_expense,
        withdrawal_b1: withdrawal.b1,
        withdrawal_b2: withdrawal.b2,
        withdrawal_b3: withdrawal.b3,
        pull_to_b1: pulls.to_b1,
        pull_to_b2: pulls.to_b2,
        push_to_b1: returns.push_to_b1,
        push_to_b2: returns.push_to_b2,
        skim_lost_b1: returns.skim_lost_b1,
        tax_paid,
        return_amount_b1: returns.profit[0],
        return_amount_b2: returns.profit[1],
        return_amount_b3: returns.profit[2],
        events,
        is_failed,
    }
}

/// Tops up b1 from b2, then b2 from b3, by one year of expense each whenever
/// the receiving bucket holds less than three years.
pub fn replenish(
    buckets: &mut BucketTriple,
    annual_expense: f64,
    events: &mut Vec<RuleEvent>,
) -> Pulls {
    let trigger = REPLENISH_TRIGGER_YEARS * annual_expense;
    let mut pulls = Pulls::default();

    if buckets.b1 < trigger {
        events.push(RuleEvent::StableLow);
        let amount = annual_expense.min(buckets.b2);
        if amount > 0.0 {
            buckets.b1 += amount;
            buckets.b2 -= amount;
            pulls.to_b1 = amount;
        }
    }

    if buckets.b2 < trigger {
        events.push(RuleEvent::ModerateLow);
        let amount = annual_expense.min(buckets.b3);
        if amount > 0.0 {
            buckets.b2 += amount;
            buckets.b3 -= amount;
            pulls.to_b2 = amount;
        }
    }

    pulls
}

/// Draws `expense` from b1, cascading any deficit to b2 then b3.
pub fn withdraw(
    buckets: &mut BucketTriple,
    expense: f64,
    events: &mut Vec<RuleEvent>,
) -> Withdrawal {
    if buckets.b1 >= expense {
        buckets.b1 -= expense;
        return Withdrawal {
            b1: expense,
            ..Withdrawal::default()
        };
    }

    events.push(RuleEvent::StableEmpty);
    let mut out = Withdrawal {
        b1: buckets.b1,
        ..Withdrawal::default()
    };
    let deficit = expense - buckets.b1;
    buckets.b1 = 0.0;

    if buckets.b2 >= deficit {
        buckets.b2 -= deficit;
        out.b2 = deficit;
        return out;
    }

    events.push(RuleEvent::ModerateEmpty);
    let deficit = deficit - buckets.b2;
    out.b2 = buckets.b2;
    buckets.b2 = 0.0;

    if buckets.b3 >= deficit {
        buckets.b3 -= deficit;
        out.b3 = deficit;
    } else {
        out.b3 = buckets.b3;
        buckets.b3 = 0.0;
        out.shortfall = true;
        events.push(RuleEvent::Bankruptcy);
    }
    out
}

/// Removes `amount` b1 -> b2 -> b3. Returns false when all three together
/// cannot cover it; the buckets are then left empty.
fn deduct_cascade(buckets: &mut BucketTriple, amount: f64) -> bool {
    if buckets.b1 >= amount {
        buckets.b1 -= amount;
        return true;
    }
    let rem = amount - buckets.b1;
    buckets.b1 = 0.0;

    if buckets.b2 >= rem {
        buckets.b2 -= rem;
        return true;
    }
    let rem = rem - buckets.b2;
    buckets.b2 = 0.0;

    if buckets.b3 >= rem {
        buckets.b3 -= rem;
        true
    } else {
        buckets.b3 = 0.0;
        false
    }
}

fn rebalance(
    plan: &TrialPlan,
    buckets: &mut BucketTriple,
    annual_expense: f64,
    events: &mut Vec<RuleEvent>,
) {
    let total = buckets.total();
    if total <= 0.0 {
        return;
    }

    if plan.strategy_type == StrategyType::DynamicAggressive {
        *buckets = BucketTriple::dynamic_targets(total, annual_expense);
        events.push(RuleEvent::DynamicReset);
    } else if plan.annual_rebalancing {
        *buckets = BucketTriple::from_allocation(total, plan.allocation);
        events.push(RuleEvent::Rebalanced);
    }
}

/// One month of return on `balance` for deviate `z`. Return above one sigma
/// over the monthly mean is split off as `skim`; equality does not skim.
pub fn grow_bucket(balance: f64, config: BucketConfig, z: f64) -> BucketGrowth {
    let monthly_mean = config.return_rate / 12.0;
    let monthly_vol = config.volatility / 12f64.sqrt();
    let actual = monthly_mean + z * monthly_vol;

    let profit = balance * actual;
    let grown = (balance + profit).max(0.0);

    let threshold = monthly_mean + monthly_vol;
    let skim = if actual > threshold {
        (balance * (actual - threshold)).clamp(0.0, grown)
    } else {
        0.0
    };

    BucketGrowth {
        balance: grown - skim,
        skim,
        profit,
    }
}

fn draw_and_grow<N: NormalSource>(
    balance: f64,
    config: BucketConfig,
    normals: &mut N,
) -> BucketGrowth {
    if balance <= 0.0 {
        return BucketGrowth::default();
    }
    grow_bucket(balance, config, normals.sample())
}

// b3 first: its skim lands in b2 before b2 earns, and b2's skim in b1.
fn apply_returns<N: NormalSource>(
    plan: &TrialPlan,
    buckets: &mut BucketTriple,
    normals: &mut N,
) -> ReturnStep {
    let growth_b3 = draw_and_grow(buckets.b3, plan.config(BucketId::Growth), normals);
    buckets.b3 = growth_b3.balance;
    buckets.b2 += growth_b3.skim;

    let growth_b2 = draw_and_grow(buckets.b2, plan.config(BucketId::Moderate), normals);
    buckets.b2 = growth_b2.balance;
    buckets.b1 += growth_b2.skim;

    let growth_b1 = draw_and_grow(buckets.b1, plan.config(BucketId::Stable), normals);
    buckets.b1 = growth_b1.balance;

    ReturnStep {
        push_to_b1: growth_b2.skim,
        push_to_b2: growth_b3.skim,
        skim_lost_b1: growth_b1.skim,
        profit: [growth_b1.profit, growth_b2.profit, growth_b3.profit],
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialSummary {
    pub trial_id: u32,
    pub months_lasted: u32,
    pub is_success: bool,
    pub final_amount: f64,
}

/// Runs one trial to the horizon or first failure. Pass `trace` to collect
/// the month-by-month history.
pub fn simulate_trial<N: NormalSource>(
    plan: &TrialPlan,
    trial_id: u32,
    normals: &mut N,
    mut trace: Option<&mut Vec<MonthRecord>>,
) -> TrialSummary {
    let mut state = TrialState::new(plan);
    let mut months_lasted = 0;
    let mut failed = false;
    let mut final_amount = state.buckets.total();

    for month in 1..=plan.months {
        let record = step_month(plan, &mut state, month, normals);
        months_lasted = month;
        failed = record.is_failed;
        final_amount = record.total_funds;
        if let Some(rows) = trace.as_deref_mut() {
            rows.push(record);
        }
        if failed {
            break;
        }
    }

    TrialSummary {
        trial_id,
        months_lasted,
        is_success: !failed,
        final_amount: if failed { 0.0 } else { final_amount },
    }
}

pub fn run_trial<N: NormalSource>(plan: &TrialPlan, trial_id: u32, normals: &mut N) -> TrialResult {
    let mut history = Vec::new();
    let summary = simulate_trial(plan, trial_id, normals, Some(&mut history));
    TrialResult {
        trial_id,
        months_lasted: summary.months_lasted,
        is_success: summary.is_success,
        final_amount: summary.final_amount,
        history,
    }
}

/// Trial `trial_id` of the run seeded by `params.seed`.
pub fn run_single_trial(
    params: &SimulationParameters,
    trial_id: u32,
) -> Result<TrialResult, ConfigError> {
    let plan = TrialPlan::from_parameters(params)?;
    let mut normals = BoxMuller::seeded(derive_seed(params.seed, trial_id));
    Ok(run_trial(&plan, trial_id, &mut normals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sampler::tests::ScriptedNormals;
    use crate::core::tax::progressive_tax;
    use crate::core::types::{BucketOverride, BucketOverrides};
    use proptest::prelude::{prop_assert, prop_assume, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn flat_override(return_rate: f64) -> BucketOverride {
        BucketOverride {
            return_rate: Some(return_rate),
            volatility: Some(0.0),
        }
    }

    /// No growth, no volatility, no inflation.
    fn still_params(total_funds: f64, monthly_expense: f64) -> SimulationParameters {
        let mut params = SimulationParameters::new(total_funds, monthly_expense);
        params.inflation_rate = 0.0;
        params.years = 1;
        params.num_trials = 1;
        for id in BucketId::ALL {
            params.bucket_overrides.insert(id, flat_override(0.0));
        }
        params
    }

    fn plan(params: &SimulationParameters) -> TrialPlan {
        TrialPlan::from_parameters(params).expect("valid params")
    }

    #[test]
    fn zero_volatility_return_is_exactly_monthly_mean_without_skim() {
        let mut params = still_params(1_000_000.0, 100.0);
        params.bucket_allocations = [1.0, 0.0, 0.0];
        params
            .bucket_overrides
            .insert(BucketId::Stable, flat_override(0.06));
        let plan = plan(&params);

        let mut normals = ScriptedNormals::constant(2.5);
        let trial = run_trial(&plan, 0, &mut normals);

        assert!(trial.is_success);
        assert_eq!(trial.months_lasted, 12);
        let mut start = 1_000_000.0;
        for row in &trial.history {
            let after_withdrawal = start - 100.0;
            assert_approx(row.return_amount_b1, after_withdrawal * 0.06 / 12.0);
            assert_eq!(row.skim_lost_b1, 0.0);
            assert_eq!(row.push_to_b1, 0.0);
            assert_approx(row.bucket1, after_withdrawal * (1.0 + 0.005));
            start = row.bucket1;
        }
    }

    #[test]
    fn grow_bucket_at_one_sigma_does_not_skim() {
        let cfg = BucketConfig {
            return_rate: 0.12,
            volatility: 0.12,
        };
        let g = grow_bucket(1_000.0, cfg, 1.0);
        assert_eq!(g.skim, 0.0);
        assert_approx(g.balance, 1_000.0 + g.profit);
    }

    #[test]
    fn grow_bucket_skims_excess_over_one_sigma() {
        let cfg = BucketConfig {
            return_rate: 0.12,
            volatility: 0.12,
        };
        let mean = 0.01;
        let vol = 0.12 / 12f64.sqrt();

        let g = grow_bucket(1_000.0, cfg, 2.0);
        assert_approx(g.profit, 1_000.0 * (mean + 2.0 * vol));
        assert_approx(g.skim, 1_000.0 * vol);
        assert_approx(g.balance, 1_000.0 * (1.0 + mean + vol));
    }

    #[test]
    fn grow_bucket_clamps_total_loss_to_zero() {
        let cfg = BucketConfig {
            return_rate: 0.0,
            volatility: 1.0,
        };
        let g = grow_bucket(500.0, cfg, -10.0);
        assert_eq!(g.balance, 0.0);
        assert_eq!(g.skim, 0.0);
        assert!(g.profit < -500.0);
    }

    #[test]
    fn growth_skim_feeds_moderate_bucket_before_its_return() {
        let mut params = still_params(1.0, 1.0);
        params.bucket_overrides.insert(
            BucketId::Growth,
            BucketOverride {
                return_rate: Some(0.12),
                volatility: Some(0.12),
            },
        );
        params
            .bucket_overrides
            .insert(BucketId::Moderate, flat_override(0.06));
        let plan = plan(&params);

        let mut buckets = BucketTriple {
            b1: 100.0,
            b2: 1_000.0,
            b3: 10_000.0,
        };
        let mut normals = ScriptedNormals::new(vec![2.0, 0.0, 0.0]);
        let step = apply_returns(&plan, &mut buckets, &mut normals);

        let vol = 0.12 / 12f64.sqrt();
        let skim3 = 10_000.0 * vol;
        assert_approx(step.push_to_b2, skim3);
        assert_approx(step.profit[1], (1_000.0 + skim3) * 0.005);
        assert_approx(buckets.b2, (1_000.0 + skim3) * 1.005);
        assert_approx(buckets.b3, 10_000.0 * (1.0 + 0.01 + vol));
        assert_eq!(step.push_to_b1, 0.0);
        assert_approx(buckets.b1, 100.0);
        assert_eq!(normals.drawn(), 3);
    }

    #[test]
    fn stable_bucket_skim_leaves_the_portfolio() {
        let mut params = still_params(1.0, 1.0);
        params.bucket_overrides.insert(
            BucketId::Stable,
            BucketOverride {
                return_rate: Some(0.06),
                volatility: Some(0.06),
            },
        );
        let plan = plan(&params);

        let mut buckets = BucketTriple {
            b1: 1_000.0,
            b2: 0.0,
            b3: 0.0,
        };
        let mut normals = ScriptedNormals::constant(3.0);
        let step = apply_returns(&plan, &mut buckets, &mut normals);

        let vol = 0.06 / 12f64.sqrt();
        assert_approx(step.skim_lost_b1, 1_000.0 * 2.0 * vol);
        assert_approx(buckets.b1, 1_000.0 * (1.0 + 0.005 + vol));
        assert_eq!(normals.drawn(), 1);
    }

    #[test]
    fn empty_buckets_draw_no_deviates() {
        let params = still_params(1.0, 1.0);
        let plan = plan(&params);
        let mut buckets = BucketTriple::default();
        let mut normals = ScriptedNormals::constant(0.0);
        let step = apply_returns(&plan, &mut buckets, &mut normals);
        assert_eq!(normals.drawn(), 0);
        assert_eq!(step, ReturnStep::default());
    }

    #[test]
    fn replenishment_pulls_one_year_not_three() {
        let mut params = still_params(1_200_000.0, 10_000.0);
        params.bucket_allocations = [0.0, 1.0, 0.0];
        let plan = plan(&params);

        let mut normals = ScriptedNormals::constant(0.0);
        let trial = run_trial(&plan, 0, &mut normals);
        let first = &trial.history[0];

        assert_approx(first.pull_to_b1, 120_000.0);
        assert_approx(first.bucket1, 110_000.0);
        assert!(first.events.contains(&RuleEvent::StableLow));
    }

    #[test]
    fn replenishment_is_capped_by_source_balance() {
        let mut buckets = BucketTriple {
            b1: 0.0,
            b2: 50_000.0,
            b3: 0.0,
        };
        let mut events = Vec::new();
        let pulls = replenish(&mut buckets, 120_000.0, &mut events);
        assert_approx(pulls.to_b1, 50_000.0);
        assert_eq!(pulls.to_b2, 0.0);
        assert_eq!(
            events,
            vec![RuleEvent::StableLow, RuleEvent::ModerateLow]
        );
    }

    #[test]
    fn replenishment_of_moderate_sees_already_drained_balance() {
        let mut buckets = BucketTriple {
            b1: 0.0,
            b2: 400_000.0,
            b3: 1_000_000.0,
        };
        let mut events = Vec::new();
        let pulls = replenish(&mut buckets, 100_000.0, &mut events);
        assert_approx(pulls.to_b1, 100_000.0);
        assert_approx(pulls.to_b2, 100_000.0);
        assert_approx(buckets.b2, 400_000.0);
        assert_approx(buckets.b3, 900_000.0);
    }

    #[test]
    fn withdrawal_cascade_marks_failure_when_all_buckets_short() {
        let mut params = still_params(5_000.0, 10_000.0);
        params.bucket_allocations = [1.0, 0.0, 0.0];
        let plan = plan(&params);

        let mut normals = ScriptedNormals::constant(0.0);
        let trial = run_trial(&plan, 0, &mut normals);

        assert!(!trial.is_success);
        assert_eq!(trial.months_lasted, 1);
        assert_eq!(trial.final_amount, 0.0);
        let row = &trial.history[0];
        assert!(row.is_failed);
        assert_eq!(row.bucket1, 0.0);
        assert_approx(row.withdrawal_b1, 5_000.0);
        assert_eq!(row.withdrawal_b2, 0.0);
        assert_eq!(row.withdrawal_b3, 0.0);
        assert!(row.events.contains(&RuleEvent::Bankruptcy));
    }

    #[test]
    fn withdrawal_cascade_draws_deficit_from_next_bucket() {
        let mut buckets = BucketTriple {
            b1: 5_000.0,
            b2: 20_000.0,
            b3: 0.0,
        };
        let mut events = Vec::new();
        let w = withdraw(&mut buckets, 10_000.0, &mut events);
        assert!(!w.shortfall);
        assert_approx(w.b1, 5_000.0);
        assert_approx(w.b2, 5_000.0);
        assert_eq!(w.b3, 0.0);
        assert_approx(buckets.b2, 15_000.0);
        assert_eq!(events, vec![RuleEvent::StableEmpty]);
    }

    #[test]
    fn withdrawal_cascade_reaches_growth_bucket() {
        let mut buckets = BucketTriple {
            b1: 1_000.0,
            b2: 2_000.0,
            b3: 50_000.0,
        };
        let mut events = Vec::new();
        let w = withdraw(&mut buckets, 10_000.0, &mut events);
        assert!(!w.shortfall);
        assert_approx(w.b3, 7_000.0);
        assert_approx(buckets.b3, 43_000.0);
        assert_eq!(buckets.b1, 0.0);
        assert_eq!(buckets.b2, 0.0);
        assert_eq!(
            events,
            vec![RuleEvent::StableEmpty, RuleEvent::ModerateEmpty]
        );
    }

    #[test]
    fn exhausting_funds_exactly_fails_on_zero_funds_check() {
        let mut params = still_params(10_000.0, 10_000.0);
        params.bucket_allocations = [1.0, 0.0, 0.0];
        let plan = plan(&params);

        let mut normals = ScriptedNormals::constant(0.0);
        let trial = run_trial(&plan, 0, &mut normals);

        assert!(!trial.is_success);
        assert_eq!(trial.months_lasted, 1);
        let row = &trial.history[0];
        assert!(row.is_failed);
        assert!(row.events.contains(&RuleEvent::ZeroFunds));
        assert!(!row.events.contains(&RuleEvent::Bankruptcy));
    }

    #[test]
    fn inflation_steps_expense_at_each_new_year() {
        let mut params = still_params(10_000_000.0, 1_000.0);
        params.years = 3;
        params.inflation_rate = 7.0;
        let plan = plan(&params);

        let mut normals = ScriptedNormals::constant(0.0);
        let trial = run_trial(&plan, 0, &mut normals);

        assert_approx(trial.history[0].expense, 1_000.0);
        assert_approx(trial.history[11].expense, 1_000.0);
        assert_approx(trial.history[12].expense, 1_070.0);
        assert_approx(trial.history[24].expense, 1_000.0 * 1.07 * 1.07);
    }

    #[test]
    fn annual_tax_is_settled_in_month_twelve() {
        let mut params = still_params(100_000_000.0, 100_000.0);
        params.bucket_allocations = [1.0, 0.0, 0.0];
        params.tax_enabled = true;
        let plan = plan(&params);

        let mut normals = ScriptedNormals::constant(0.0);
        let trial = run_trial(&plan, 0, &mut normals);

        let expected_tax = progressive_tax(1_200_000.0);
        assert_approx_tol(expected_tax, 83_200.0, 0.01);
        for row in &trial.history[..11] {
            assert_eq!(row.tax_paid, 0.0);
        }
        let december = &trial.history[11];
        assert_approx(december.tax_paid, expected_tax);
        assert!(december.events.contains(&RuleEvent::TaxPaid(expected_tax)));
        assert_approx(december.bucket1, 100_000_000.0 - 1_200_000.0 - expected_tax);
    }

    #[test]
    fn joint_assessment_lowers_tax_bill() {
        let mut params = still_params(100_000_000.0, 100_000.0);
        params.bucket_allocations = [1.0, 0.0, 0.0];
        params.tax_enabled = true;
        params.is_joint = true;
        let plan = plan(&params);

        let mut normals = ScriptedNormals::constant(0.0);
        let trial = run_trial(&plan, 0, &mut normals);
        assert_eq!(trial.history[11].tax_paid, 0.0);
    }

    #[test]
    fn growth_withdrawals_are_taxed_as_capital_gains() {
        let mut params = still_params(1.0, 50_000.0);
        params.tax_enabled = true;
        let plan = plan(&params);

        let mut state = TrialState::new(&plan);
        state.buckets = BucketTriple {
            b1: 0.0,
            b2: 0.0,
            b3: 10_000_000.0,
        };
        state.ytd.withdrawal_b3 = 550_000.0;
        let mut normals = ScriptedNormals::constant(0.0);
        let row = step_month(&plan, &mut state, 12, &mut normals);

        assert_approx(row.pull_to_b2, 600_000.0);
        assert_approx(row.withdrawal_b2, 50_000.0);
        let expected = (550_000.0 - 125_000.0) * 0.125;
        assert_approx(row.tax_paid, expected);
    }

    /// Month 12 with a pre-loaded ordinary-income year; one unit of expense
    /// keeps every bucket above the pull trigger.
    fn december_with_buckets(b1: f64, b2: f64, b3: f64) -> (MonthRecord, f64) {
        let mut params = still_params(1.0, 1.0);
        params.tax_enabled = true;
        let plan = plan(&params);

        let mut state = TrialState::new(&plan);
        state.buckets = BucketTriple { b1, b2, b3 };
        state.ytd.withdrawal_b1 = 1_200_000.0;
        let mut normals = ScriptedNormals::constant(0.0);
        let row = step_month(&plan, &mut state, 12, &mut normals);
        (row, progressive_tax(1_200_001.0))
    }

    #[test]
    fn tax_spills_from_stable_into_moderate() {
        let (row, tax) = december_with_buckets(100.0, 100_000.0, 50_000.0);
        assert!(tax > 99.0 && tax < 99.0 + 100_000.0);

        assert!(!row.is_failed);
        assert_approx(row.tax_paid, tax);
        assert_eq!(row.bucket1, 0.0);
        assert_approx(row.bucket2, 100_000.0 - (tax - 99.0));
        assert_approx(row.bucket3, 50_000.0);
        assert!(row.events.contains(&RuleEvent::TaxPaid(tax)));
    }

    #[test]
    fn tax_spills_through_to_growth() {
        let (row, tax) = december_with_buckets(100.0, 20_000.0, 100_000.0);
        assert!(tax > 99.0 + 20_000.0);

        assert!(!row.is_failed);
        assert_eq!(row.bucket1, 0.0);
        assert_eq!(row.bucket2, 0.0);
        assert_approx(row.bucket3, 100_000.0 - (tax - 99.0 - 20_000.0));
    }

    #[test]
    fn tax_shortfall_fails_the_trial() {
        let mut params = still_params(1.0, 100_000.0);
        params.tax_enabled = true;
        let plan = plan(&params);

        let mut state = TrialState::new(&plan);
        state.buckets = BucketTriple {
            b1: 150_000.0,
            b2: 0.0,
            b3: 0.0,
        };
        state.ytd.withdrawal_b1 = 1_100_000.0;
        let mut normals = ScriptedNormals::constant(0.0);
        let row = step_month(&plan, &mut state, 12, &mut normals);

        assert!(row.is_failed);
        assert_approx(row.tax_paid, progressive_tax(1_200_000.0));
        assert!(row.events.contains(&RuleEvent::TaxBankruptcy));
        assert_eq!(row.total_funds, 0.0);
        assert_eq!(state.buckets, BucketTriple::default());
        assert_eq!(normals.drawn(), 0);
    }

    #[test]
    fn withdrawal_accumulators_reset_even_without_tax() {
        let params = still_params(1.0, 100.0);
        let plan = plan(&params);
        let mut state = TrialState::new(&plan);
        state.buckets.b1 = 1_000_000.0;
        state.ytd.withdrawal_b1 = 5_000.0;

        let mut normals = ScriptedNormals::constant(0.0);
        let _ = step_month(&plan, &mut state, 12, &mut normals);
        assert_eq!(state.ytd.withdrawal_b1, 0.0);
    }

    #[test]
    fn annual_rebalancing_restores_initial_fractions() {
        let mut params = still_params(1_000_000.0, 100.0);
        params.bucket_allocations = [5.0, 3.0, 2.0];
        params.annual_rebalancing = true;
        params
            .bucket_overrides
            .insert(BucketId::Growth, flat_override(0.12));
        let plan = plan(&params);

        let mut normals = ScriptedNormals::constant(0.0);
        let trial = run_trial(&plan, 0, &mut normals);

        let november = &trial.history[10];
        let december = &trial.history[11];
        let pre_return_total = november.total_funds - 100.0;

        assert!(december.events.contains(&RuleEvent::Rebalanced));
        assert_approx(december.bucket1, pre_return_total * 0.5);
        assert_approx(december.bucket2, pre_return_total * 0.3);
        assert_approx(december.bucket3, pre_return_total * 0.2 * 1.01);
        assert!(!november.events.contains(&RuleEvent::Rebalanced));
    }

    #[test]
    fn dynamic_targets_fill_stable_then_moderate() {
        let full = BucketTriple::dynamic_targets(2_000_000.0, 100_000.0);
        assert_eq!(
            full,
            BucketTriple {
                b1: 400_000.0,
                b2: 600_000.0,
                b3: 1_000_000.0
            }
        );

        let partial = BucketTriple::dynamic_targets(700_000.0, 100_000.0);
        assert_approx(partial.b1, 400_000.0);
        assert_approx(partial.b2, 300_000.0);
        assert_eq!(partial.b3, 0.0);

        let short = BucketTriple::dynamic_targets(250_000.0, 100_000.0);
        assert_approx(short.b1, 250_000.0);
        assert_eq!(short.b2, 0.0);
    }

    #[test]
    fn dynamic_aggressive_ignores_allocation_at_start_and_resets_yearly() {
        let mut params = still_params(3_000_000.0, 10_000.0);
        params.strategy_type = StrategyType::DynamicAggressive;
        params.bucket_allocations = [1.0, 0.0, 0.0];
        params
            .bucket_overrides
            .insert(BucketId::Growth, flat_override(0.12));
        let plan = plan(&params);

        assert_eq!(
            plan.initial_buckets,
            BucketTriple {
                b1: 480_000.0,
                b2: 720_000.0,
                b3: 1_800_000.0
            }
        );

        let mut normals = ScriptedNormals::constant(0.0);
        let trial = run_trial(&plan, 0, &mut normals);
        let december = &trial.history[11];
        assert!(december.events.contains(&RuleEvent::DynamicReset));
        assert_approx(december.bucket1, 480_000.0);
        assert_approx(december.bucket2, 720_000.0);
    }

    #[test]
    fn run_single_trial_is_reproducible_for_seed() {
        let mut params = SimulationParameters::new(3_000_000.0, 10_000.0);
        params.years = 5;
        let a = run_single_trial(&params, 3).expect("valid");
        let b = run_single_trial(&params, 3).expect("valid");
        let c = run_single_trial(&params, 4).expect("valid");
        assert_eq!(a, b);
        assert_ne!(a.history, c.history);
    }

    #[test]
    fn run_single_trial_rejects_invalid_config() {
        let mut params = SimulationParameters::new(1_000.0, 10.0);
        params.bucket_allocations = [0.0, 0.0, 0.0];
        assert_eq!(
            run_single_trial(&params, 0).expect_err("zero allocation"),
            ConfigError::ZeroAllocation
        );
    }

    #[test]
    fn well_funded_zero_volatility_trial_survives_thirty_years() {
        let mut params = SimulationParameters::new(10_000.0 * 12.0 * 50.0, 10_000.0);
        params.bucket_allocations = [0.33, 0.33, 0.34];
        for id in BucketId::ALL {
            let base = resolve_bucket_config(id, &BucketOverrides::new());
            params.bucket_overrides.insert(id, flat_override(base.return_rate));
        }
        let trial = run_single_trial(&params, 0).expect("valid");
        assert!(trial.is_success);
        assert_eq!(trial.months_lasted, 360);
        assert_eq!(trial.history.len(), 360);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_initial_buckets_sum_to_total_funds(
            total in 1_000u32..50_000_000,
            w1 in 0u32..1_000,
            w2 in 0u32..1_000,
            w3 in 0u32..1_000,
            two_bucket in proptest::bool::ANY,
        ) {
            prop_assume!(w1 + w2 + w3 > 0);
            let mut params = SimulationParameters::new(total as f64, 1_000.0);
            params.bucket_allocations = [w1 as f64, w2 as f64, w3 as f64];
            if two_bucket {
                params.strategy_type = StrategyType::TwoBucket;
            }
            let plan = TrialPlan::from_parameters(&params).expect("valid");
            let sum = plan.initial_buckets.total();
            prop_assert!((sum - total as f64).abs() <= 1e-6 * total as f64);
        }

        #[test]
        fn prop_history_balances_are_finite_and_non_negative(
            seed in proptest::num::u64::ANY,
            isr in 1u32..60,
            w1 in 0u32..100,
            w2 in 0u32..100,
            w3 in 1u32..100,
            inflation_bp in 0u32..1_200,
            strategy in 0u8..3,
            rebalance in proptest::bool::ANY,
            tax in proptest::bool::ANY,
        ) {
            let monthly = 50_000.0;
            let mut params = SimulationParameters::new(monthly * 12.0 * isr as f64, monthly);
            params.seed = seed;
            params.years = 10;
            params.inflation_rate = inflation_bp as f64 / 100.0;
            params.bucket_allocations = [w1 as f64, w2 as f64, w3 as f64];
            params.strategy_type = match strategy {
                0 => StrategyType::ThreeBucket,
                1 => StrategyType::TwoBucket,
                _ => StrategyType::DynamicAggressive,
            };
            params.annual_rebalancing = rebalance;
            params.tax_enabled = tax;

            let trial = run_single_trial(&params, 0).expect("valid");
            prop_assert!(trial.months_lasted as usize == trial.history.len());
            prop_assert!(trial.months_lasted >= 1 && trial.months_lasted <= 120);
            for (idx, row) in trial.history.iter().enumerate() {
                for v in [row.bucket1, row.bucket2, row.bucket3, row.total_funds] {
                    prop_assert!(v.is_finite() && v >= 0.0);
                }
                prop_assert!(row.is_failed == (idx + 1 == trial.history.len() && !trial.is_success));
            }
        }
    }
}
