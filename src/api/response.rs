use serde::Serialize;

use super::ApiStrategyType;
use crate::core::{
    AggregateResult, BucketConfig, BucketId, MonthRecord, RuleEvent, SimulationParameters,
    StrategyCandidate, TerminalDistribution, TrialResult, VolatilityPoint,
    resolve_bucket_config,
};

pub fn rule_event_label(event: &RuleEvent) -> String {
    match event {
        RuleEvent::StableLow => "B1 Low (<3yr Exp)".to_string(),
        RuleEvent::ModerateLow => "B2 Low (<3yr Exp)".to_string(),
        RuleEvent::StableEmpty => "B1 Empty".to_string(),
        RuleEvent::ModerateEmpty => "B2 Empty".to_string(),
        RuleEvent::Bankruptcy => "Bankruptcy".to_string(),
        RuleEvent::TaxPaid(amount) => format!("Tax: {}k", (amount / 1000.0).round()),
        RuleEvent::TaxBankruptcy => "Bankruptcy (Tax)".to_string(),
        RuleEvent::DynamicReset => "DynAgg Reset".to_string(),
        RuleEvent::Rebalanced => "Rebalanced".to_string(),
        RuleEvent::ZeroFunds => "Bankruptcy (Zero Funds)".to_string(),
    }
}

pub fn rule_log(events: &[RuleEvent]) -> String {
    events
        .iter()
        .map(rule_event_label)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthRow {
    pub month: u32,
    pub year: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
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
    pub skim_lost_b1: f64,
    pub tax_paid: f64,
    pub return_amount_b1: f64,
    pub return_amount_b2: f64,
    pub return_amount_b3: f64,
    pub rule_log: String,
    pub is_failed: bool,
}

impl MonthRow {
    fn from_record(record: &MonthRecord, start_age: Option<u32>) -> Self {
        let year_index = (record.month - 1) / 12;
        Self {
            month: record.month,
            year: year_index + 1,
            age: start_age.map(|age| age + year_index),
            bucket1: record.bucket1,
            bucket2: record.bucket2,
            bucket3: record.bucket3,
            total_funds: record.total_funds,
            expense: record.expense,
            withdrawal_b1: record.withdrawal_b1,
            withdrawal_b2: record.withdrawal_b2,
            withdrawal_b3: record.withdrawal_b3,
            pull_to_b1: record.pull_to_b1,
            pull_to_b2: record.pull_to_b2,
            push_to_b1: record.push_to_b1,
            push_to_b2: record.push_to_b2,
            skim_lost_b1: record.skim_lost_b1,
            tax_paid: record.tax_paid,
            return_amount_b1: record.return_amount_b1,
            return_amount_b2: record.return_amount_b2,
            return_amount_b3: record.return_amount_b3,
            rule_log: rule_log(&record.events),
            is_failed: record.is_failed,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialSummaryResponse {
    pub trial_id: u32,
    pub months_lasted: u32,
    pub is_success: bool,
    pub final_amount: f64,
    pub history: Vec<MonthRow>,
}

impl TrialSummaryResponse {
    fn from_trial(trial: &TrialResult, start_age: Option<u32>) -> Self {
        Self {
            trial_id: trial.trial_id,
            months_lasted: trial.months_lasted,
            is_success: trial.is_success,
            final_amount: trial.final_amount,
            history: trial
                .history
                .iter()
                .map(|record| MonthRow::from_record(record, start_age))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileResponse {
    pub p10: TrialSummaryResponse,
    pub p25: TrialSummaryResponse,
    pub p75: TrialSummaryResponse,
    pub p90: TrialSummaryResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketRow {
    pub id: u8,
    pub name: &'static str,
    #[serde(flatten)]
    pub config: BucketConfig,
    pub initial_allocation: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse {
    pub strategy_type: ApiStrategyType,
    pub total_funds: f64,
    pub monthly_expense: f64,
    pub isr: f64,
    pub years: u32,
    pub inflation_rate: f64,
    pub seed: u64,
    pub success_rate: f64,
    pub total_trials: u32,
    pub months_lasted: u32,
    pub is_success: bool,
    pub final_amount: f64,
    pub terminal_funds: TerminalDistribution,
    pub buckets: Vec<BucketRow>,
    pub history: Vec<MonthRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<PercentileResponse>,
}

pub fn build_simulate_response(
    params: &SimulationParameters,
    result: &AggregateResult,
    include_percentiles: bool,
) -> SimulateResponse {
    let start_age = params.start_age;
    let representative = &result.representative;
    // Validated before the run, so the weights sum to a positive value.
    let weight_sum: f64 = params.bucket_allocations.iter().sum();

    SimulateResponse {
        strategy_type: params.strategy_type.into(),
        total_funds: params.total_funds,
        monthly_expense: params.monthly_expense,
        isr: params.total_funds / (params.monthly_expense * 12.0),
        years: params.years,
        inflation_rate: params.inflation_rate,
        seed: result.seed,
        success_rate: result.success_rate,
        total_trials: result.total_trials,
        months_lasted: representative.months_lasted,
        is_success: representative.is_success,
        final_amount: representative.final_amount,
        terminal_funds: result.terminal_funds,
        buckets: BucketId::ALL
            .iter()
            .map(|&id| BucketRow {
                id: id.number(),
                name: id.name(),
                config: resolve_bucket_config(id, &params.bucket_overrides),
                initial_allocation: params.bucket_allocations[id.number() as usize - 1]
                    / weight_sum,
            })
            .collect(),
        history: representative
            .history
            .iter()
            .map(|record| MonthRow::from_record(record, start_age))
            .collect(),
        percentiles: include_percentiles.then(|| {
            let trials = &result.percentile_trials;
            PercentileResponse {
                p10: TrialSummaryResponse::from_trial(&trials.p10, start_age),
                p25: TrialSummaryResponse::from_trial(&trials.p25, start_age),
                p75: TrialSummaryResponse::from_trial(&trials.p75, start_age),
                p90: TrialSummaryResponse::from_trial(&trials.p90, start_age),
            }
        }),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRow {
    pub allocation_name: &'static str,
    pub allocation: [f64; 3],
    pub isr: u32,
    pub success_rate: f64,
    pub total_funds_required: f64,
}

impl From<&StrategyCandidate> for CandidateRow {
    fn from(value: &StrategyCandidate) -> Self {
        Self {
            allocation_name: value.allocation_name,
            allocation: value.allocation,
            isr: value.isr,
            success_rate: value.success_rate,
            total_funds_required: value.total_funds_required,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeResponse {
    pub strategy_type: ApiStrategyType,
    pub target_success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_isr: Option<u32>,
    pub results: Vec<CandidateRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolatilityPointRow {
    pub volatility: f64,
    #[serde(rename = "minISR")]
    pub min_isr: u32,
}

impl From<&VolatilityPoint> for VolatilityPointRow {
    fn from(value: &VolatilityPoint) -> Self {
        Self {
            volatility: value.volatility,
            min_isr: value.min_isr,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolatilitySweepResponse {
    pub target_success_rate: f64,
    pub growth_return_rate: f64,
    pub points: Vec<VolatilityPointRow>,
}
