mod error;
mod response;

use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub use error::ApiError;
pub use response::{rule_event_label, rule_log};

use crate::core::{
    BucketId, BucketOverride, ConfigError, DEFAULT_ALLOCATION, DEFAULT_INFLATION_RATE, DEFAULT_SEED,
    DEFAULT_TRIALS, DEFAULT_YEARS, FireMode, OptimizeConfig, SimulationParameters, StrategyType,
    VolatilitySweepConfig, analyze_fixed_isr, find_optimal_strategy, required_funds,
    resolve_bucket_config, run_monte_carlo, volatility_sweep,
};
use response::{
    CandidateRow, OptimizeResponse, SimulateResponse, VolatilityPointRow,
    VolatilitySweepResponse, build_simulate_response,
};

const TWO_BUCKET_DEFAULT_ALLOCATION: [f64; 3] = [0.2, 0.8, 0.0];
const DEFAULT_FIXED_ISR: u32 = 45;
const DEFAULT_FIXED_ISR_TRIALS: u32 = 2_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliStrategyType {
    ThreeBucket,
    TwoBucket,
    DynamicAggressive,
}

impl From<CliStrategyType> for StrategyType {
    fn from(value: CliStrategyType) -> Self {
        match value {
            CliStrategyType::ThreeBucket => StrategyType::ThreeBucket,
            CliStrategyType::TwoBucket => StrategyType::TwoBucket,
            CliStrategyType::DynamicAggressive => StrategyType::DynamicAggressive,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliFireMode {
    Lean,
    Chubby,
    Fat,
    Custom,
}

impl From<CliFireMode> for FireMode {
    fn from(value: CliFireMode) -> Self {
        match value {
            CliFireMode::Lean => FireMode::Lean,
            CliFireMode::Chubby => FireMode::Chubby,
            CliFireMode::Fat => FireMode::Fat,
            CliFireMode::Custom => FireMode::Custom,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiStrategyType {
    #[serde(alias = "threeBucket", alias = "three_bucket")]
    ThreeBucket,
    #[serde(alias = "twoBucket", alias = "two_bucket")]
    TwoBucket,
    #[serde(alias = "dynamicAggressive", alias = "dynamic_aggressive")]
    DynamicAggressive,
}

impl From<ApiStrategyType> for CliStrategyType {
    fn from(value: ApiStrategyType) -> Self {
        match value {
            ApiStrategyType::ThreeBucket => CliStrategyType::ThreeBucket,
            ApiStrategyType::TwoBucket => CliStrategyType::TwoBucket,
            ApiStrategyType::DynamicAggressive => CliStrategyType::DynamicAggressive,
        }
    }
}

impl From<StrategyType> for ApiStrategyType {
    fn from(value: StrategyType) -> Self {
        match value {
            StrategyType::ThreeBucket => ApiStrategyType::ThreeBucket,
            StrategyType::TwoBucket => ApiStrategyType::TwoBucket,
            StrategyType::DynamicAggressive => ApiStrategyType::DynamicAggressive,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiFireMode {
    #[serde(alias = "Lean")]
    Lean,
    #[serde(alias = "Chubby")]
    Chubby,
    #[serde(alias = "Fat")]
    Fat,
    #[serde(alias = "Custom")]
    Custom,
}

impl From<ApiFireMode> for CliFireMode {
    fn from(value: ApiFireMode) -> Self {
        match value {
            ApiFireMode::Lean => CliFireMode::Lean,
            ApiFireMode::Chubby => CliFireMode::Chubby,
            ApiFireMode::Fat => CliFireMode::Fat,
            ApiFireMode::Custom => CliFireMode::Custom,
        }
    }
}

/// Per-bucket override on the wire, both fields in percent.
#[derive(Copy, Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ApiBucketOverride {
    return_rate: Option<f64>,
    volatility: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    monthly_expense: Option<f64>,
    total_funds: Option<f64>,
    #[serde(alias = "mode")]
    fire_mode: Option<ApiFireMode>,
    isr: Option<f64>,
    years: Option<u32>,
    #[serde(alias = "inflation")]
    inflation_rate: Option<f64>,
    bucket_allocations: Option<[f64; 3]>,
    #[serde(alias = "bucketOverrides")]
    bucket_config_override: Option<BTreeMap<String, ApiBucketOverride>>,
    strategy_type: Option<ApiStrategyType>,
    annual_rebalancing: Option<bool>,
    tax_enabled: Option<bool>,
    is_joint: Option<bool>,
    #[serde(alias = "numSimulations")]
    trials: Option<u32>,
    seed: Option<u64>,
    start_age: Option<u32>,
    include_percentiles: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct OptimizePayload {
    #[serde(flatten)]
    simulation: SimulatePayload,
    isr_min: Option<u32>,
    isr_max: Option<u32>,
    target_success_rate: Option<f64>,
    search_trials: Option<u32>,
    verify_trials: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AnalyzeIsrPayload {
    #[serde(flatten)]
    simulation: SimulatePayload,
    #[serde(alias = "targetIsr")]
    fixed_isr: Option<u32>,
    analysis_trials: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct VolatilitySweepPayload {
    #[serde(flatten)]
    simulation: SimulatePayload,
    target_success_rate: Option<f64>,
    sweep_trials: Option<u32>,
}

#[derive(Parser, Debug)]
#[command(
    name = "bucketfire",
    about = "Monte Carlo retirement drawdown across three risk-tiered buckets"
)]
pub struct AppCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one Monte Carlo aggregate and print it as JSON.
    Simulate(Cli),
    /// Search allocation presets for the cheapest ISR meeting a target.
    Optimize(OptimizeCli),
}

#[derive(Args, Debug, Clone)]
struct Cli {
    #[arg(long, help = "Monthly expense at the start of retirement")]
    monthly_expense: f64,
    #[arg(
        long,
        help = "Initial corpus; defaults to monthly-expense x 12 x ISR"
    )]
    total_funds: Option<f64>,
    #[arg(long, value_enum, default_value_t = CliFireMode::Chubby)]
    fire_mode: CliFireMode,
    #[arg(
        long,
        help = "Corpus as a multiple of annual expense, overrides --fire-mode"
    )]
    isr: Option<f64>,
    #[arg(long, default_value_t = DEFAULT_YEARS)]
    years: u32,
    #[arg(
        long,
        default_value_t = DEFAULT_INFLATION_RATE,
        help = "Annual inflation in percent, e.g. 7"
    )]
    inflation_rate: f64,
    #[arg(
        long,
        value_delimiter = ',',
        help = "Three bucket weights, e.g. 30,30,40; normalized before use"
    )]
    allocation: Option<Vec<f64>>,
    #[arg(long, value_enum, default_value_t = CliStrategyType::ThreeBucket)]
    strategy: CliStrategyType,
    #[arg(long)]
    annual_rebalancing: bool,
    #[arg(long, help = "Settle income and capital-gains tax each December")]
    tax: bool,
    #[arg(long, help = "Assess tax jointly across two people")]
    joint: bool,
    #[arg(long, help = "Bucket 1 annual return in percent")]
    b1_return: Option<f64>,
    #[arg(long, help = "Bucket 1 annual volatility in percent")]
    b1_volatility: Option<f64>,
    #[arg(long, help = "Bucket 2 annual return in percent")]
    b2_return: Option<f64>,
    #[arg(long, help = "Bucket 2 annual volatility in percent")]
    b2_volatility: Option<f64>,
    #[arg(long, help = "Bucket 3 annual return in percent")]
    b3_return: Option<f64>,
    #[arg(long, help = "Bucket 3 annual volatility in percent")]
    b3_volatility: Option<f64>,
    #[arg(long, default_value_t = DEFAULT_TRIALS)]
    trials: u32,
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,
    #[arg(long)]
    start_age: Option<u32>,
    #[arg(long, help = "Include p10/p25/p75/p90 trial histories")]
    include_percentiles: bool,
}

#[derive(Args, Debug, Clone)]
struct OptimizeCli {
    #[command(flatten)]
    simulation: Cli,
    #[arg(long, help = "Evaluate every preset at this ISR instead of searching")]
    fixed_isr: Option<u32>,
    #[arg(long, default_value_t = 15)]
    isr_min: u32,
    #[arg(long, default_value_t = 60)]
    isr_max: u32,
    #[arg(long, default_value_t = 85.0, help = "Target success rate in percent")]
    target_success_rate: f64,
    #[arg(long, default_value_t = 500)]
    search_trials: u32,
    #[arg(long, default_value_t = 2_000)]
    verify_trials: u32,
}

pub async fn run(cli: AppCli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Serve { port } => run_http_server(port).await?,
        Command::Simulate(args) => {
            let include_percentiles = args.include_percentiles;
            let params = build_params(args)?;
            let response = simulate(params, include_percentiles).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Optimize(args) => {
            let response = match args.fixed_isr {
                Some(isr) => {
                    let params = build_params(args.simulation)?;
                    analyze(params, isr, DEFAULT_FIXED_ISR_TRIALS).await?
                }
                None => {
                    let config = OptimizeConfig {
                        isr_min: args.isr_min,
                        isr_max: args.isr_max,
                        target_success_rate: args.target_success_rate,
                        search_trials: args.search_trials,
                        verify_trials: args.verify_trials,
                        ..OptimizeConfig::default()
                    };
                    optimize(build_params(args.simulation)?, config).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn build_params(cli: Cli) -> Result<SimulationParameters, ApiError> {
    let strategy_type: StrategyType = cli.strategy.into();

    let isr = match cli.isr {
        Some(isr) => {
            if !isr.is_finite() || isr <= 0.0 {
                return Err(ApiError::BadRequest("--isr must be finite and > 0".to_string()));
            }
            isr
        }
        None => FireMode::from(cli.fire_mode).isr() as f64,
    };
    let total_funds = cli
        .total_funds
        .unwrap_or_else(|| required_funds(cli.monthly_expense, isr));

    let bucket_allocations = match cli.allocation.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        Some(_) => {
            return Err(ApiError::BadRequest(
                "--allocation needs exactly 3 weights".to_string(),
            ));
        }
        None if strategy_type == StrategyType::TwoBucket => TWO_BUCKET_DEFAULT_ALLOCATION,
        None => DEFAULT_ALLOCATION,
    };

    let mut params = SimulationParameters::new(total_funds, cli.monthly_expense);
    params.years = cli.years;
    params.inflation_rate = cli.inflation_rate;
    params.bucket_allocations = bucket_allocations;
    params.strategy_type = strategy_type;
    params.annual_rebalancing = cli.annual_rebalancing;
    params.tax_enabled = cli.tax;
    params.is_joint = cli.joint;
    params.num_trials = cli.trials;
    params.seed = cli.seed;
    params.start_age = cli.start_age;

    for (id, return_pct, volatility_pct) in [
        (BucketId::Stable, cli.b1_return, cli.b1_volatility),
        (BucketId::Moderate, cli.b2_return, cli.b2_volatility),
        (BucketId::Growth, cli.b3_return, cli.b3_volatility),
    ] {
        if return_pct.is_none() && volatility_pct.is_none() {
            continue;
        }
        params.bucket_overrides.insert(
            id,
            BucketOverride {
                return_rate: return_pct.map(|v| v / 100.0),
                volatility: volatility_pct.map(|v| v / 100.0),
            },
        );
    }

    params.validate()?;
    Ok(params)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/optimize", post(optimize_handler))
        .route("/api/analyze-isr", post(analyze_isr_handler))
        .route("/api/volatility-sweep", post(volatility_sweep_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "bucketfire HTTP API listening");
    tracing::info!("local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    respond(simulate_request(payload).await)
}

async fn optimize_handler(Json(payload): Json<OptimizePayload>) -> Response {
    respond(optimize_request(payload).await)
}

async fn analyze_isr_handler(Json(payload): Json<AnalyzeIsrPayload>) -> Response {
    respond(analyze_isr_request(payload).await)
}

async fn volatility_sweep_handler(Json(payload): Json<VolatilitySweepPayload>) -> Response {
    respond(volatility_sweep_request(payload).await)
}

async fn simulate_request(payload: SimulatePayload) -> Result<SimulateResponse, ApiError> {
    let include_percentiles = payload.include_percentiles.unwrap_or(false);
    let params = params_from_payload(payload)?;
    tracing::debug!(
        trials = params.num_trials,
        seed = params.seed,
        "simulate request"
    );
    simulate(params, include_percentiles).await
}

async fn optimize_request(payload: OptimizePayload) -> Result<OptimizeResponse, ApiError> {
    let defaults = OptimizeConfig::default();
    let config = OptimizeConfig {
        isr_min: payload.isr_min.unwrap_or(defaults.isr_min),
        isr_max: payload.isr_max.unwrap_or(defaults.isr_max),
        target_success_rate: payload
            .target_success_rate
            .unwrap_or(defaults.target_success_rate),
        search_trials: payload.search_trials.unwrap_or(defaults.search_trials),
        verify_trials: payload.verify_trials.unwrap_or(defaults.verify_trials),
        ..defaults
    };
    let params = params_from_payload(payload.simulation)?;
    tracing::debug!(
        isr_min = config.isr_min,
        isr_max = config.isr_max,
        "optimize request"
    );
    optimize(params, config).await
}

async fn analyze_isr_request(payload: AnalyzeIsrPayload) -> Result<OptimizeResponse, ApiError> {
    let isr = payload.fixed_isr.unwrap_or(DEFAULT_FIXED_ISR);
    let trials = payload.analysis_trials.unwrap_or(DEFAULT_FIXED_ISR_TRIALS);
    let params = params_from_payload(payload.simulation)?;
    tracing::debug!(isr, trials, "fixed ISR request");
    analyze(params, isr, trials).await
}

async fn volatility_sweep_request(
    payload: VolatilitySweepPayload,
) -> Result<VolatilitySweepResponse, ApiError> {
    let defaults = VolatilitySweepConfig::default();
    let config = VolatilitySweepConfig {
        target_success_rate: payload
            .target_success_rate
            .unwrap_or(defaults.target_success_rate),
        trials: payload.sweep_trials.unwrap_or(defaults.trials),
        ..defaults
    };
    let params = params_from_payload(payload.simulation)?;
    tracing::debug!(trials = config.trials, "volatility sweep request");
    sweep(params, config).await
}

async fn simulate(
    params: SimulationParameters,
    include_percentiles: bool,
) -> Result<SimulateResponse, ApiError> {
    tokio::task::spawn_blocking(move || -> Result<SimulateResponse, ApiError> {
        let result = run_monte_carlo(&params, params.num_trials)?;
        Ok(build_simulate_response(&params, &result, include_percentiles))
    })
    .await?
}

async fn optimize(
    params: SimulationParameters,
    config: OptimizeConfig,
) -> Result<OptimizeResponse, ApiError> {
    tokio::task::spawn_blocking(move || -> Result<OptimizeResponse, ApiError> {
        let results = find_optimal_strategy(&params, config)?;
        Ok(OptimizeResponse {
            strategy_type: params.strategy_type.into(),
            target_success_rate: config.target_success_rate,
            fixed_isr: None,
            results: results.iter().map(CandidateRow::from).collect(),
        })
    })
    .await?
}

async fn analyze(
    params: SimulationParameters,
    isr: u32,
    trials: u32,
) -> Result<OptimizeResponse, ApiError> {
    tokio::task::spawn_blocking(move || -> Result<OptimizeResponse, ApiError> {
        let results = analyze_fixed_isr(&params, isr, trials)?;
        Ok(OptimizeResponse {
            strategy_type: params.strategy_type.into(),
            target_success_rate: OptimizeConfig::default().target_success_rate,
            fixed_isr: Some(isr),
            results: results.iter().map(CandidateRow::from).collect(),
        })
    })
    .await?
}

async fn sweep(
    params: SimulationParameters,
    config: VolatilitySweepConfig,
) -> Result<VolatilitySweepResponse, ApiError> {
    tokio::task::spawn_blocking(move || -> Result<VolatilitySweepResponse, ApiError> {
        let points = volatility_sweep(&params, config)?;
        Ok(VolatilitySweepResponse {
            target_success_rate: config.target_success_rate,
            growth_return_rate: resolve_bucket_config(BucketId::Growth, &params.bucket_overrides)
                .return_rate,
            points: points.iter().map(VolatilityPointRow::from).collect(),
        })
    })
    .await?
}

fn respond<T: Serialize>(result: Result<T, ApiError>) -> Response {
    match result {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => err.into_response(),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
fn params_from_json(json: &str) -> Result<SimulationParameters, ApiError> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| ApiError::BadRequest(format!("Invalid API JSON payload: {e}")))?;
    params_from_payload(payload)
}

fn params_from_payload(payload: SimulatePayload) -> Result<SimulationParameters, ApiError> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.monthly_expense {
        cli.monthly_expense = v;
    }
    if payload.total_funds.is_some() {
        cli.total_funds = payload.total_funds;
    }
    if let Some(v) = payload.fire_mode {
        cli.fire_mode = v.into();
    }
    if payload.isr.is_some() {
        cli.isr = payload.isr;
    }
    if let Some(v) = payload.years {
        cli.years = v;
    }
    if let Some(v) = payload.inflation_rate {
        cli.inflation_rate = v;
    }
    if let Some(v) = payload.bucket_allocations {
        cli.allocation = Some(v.to_vec());
    }
    if let Some(v) = payload.strategy_type {
        cli.strategy = v.into();
    }
    if let Some(v) = payload.annual_rebalancing {
        cli.annual_rebalancing = v;
    }
    if let Some(v) = payload.tax_enabled {
        cli.tax = v;
    }
    if let Some(v) = payload.is_joint {
        cli.joint = v;
    }
    if let Some(v) = payload.trials {
        cli.trials = v;
    }
    if let Some(v) = payload.seed {
        cli.seed = v;
    }
    if payload.start_age.is_some() {
        cli.start_age = payload.start_age;
    }
    if let Some(v) = payload.include_percentiles {
        cli.include_percentiles = v;
    }

    for (key, value) in payload.bucket_config_override.unwrap_or_default() {
        let number: u32 = key.trim().parse().map_err(|_| {
            ApiError::BadRequest(format!("bucket override key {key:?} is not a bucket number"))
        })?;
        let (return_slot, volatility_slot) = match number {
            1 => (&mut cli.b1_return, &mut cli.b1_volatility),
            2 => (&mut cli.b2_return, &mut cli.b2_volatility),
            3 => (&mut cli.b3_return, &mut cli.b3_volatility),
            other => return Err(ConfigError::UnknownBucket(other).into()),
        };
        if value.return_rate.is_some() {
            *return_slot = value.return_rate;
        }
        if value.volatility.is_some() {
            *volatility_slot = value.volatility;
        }
    }

    build_params(cli)
}

fn default_cli_for_api() -> Cli {
    Cli {
        monthly_expense: 50_000.0,
        total_funds: None,
        fire_mode: CliFireMode::Chubby,
        isr: None,
        years: DEFAULT_YEARS,
        inflation_rate: DEFAULT_INFLATION_RATE,
        allocation: None,
        strategy: CliStrategyType::ThreeBucket,
        annual_rebalancing: false,
        tax: false,
        joint: false,
        b1_return: None,
        b1_volatility: None,
        b2_return: None,
        b2_volatility: None,
        b3_return: None,
        b3_volatility: None,
        trials: DEFAULT_TRIALS,
        seed: DEFAULT_SEED,
        start_age: None,
        include_percentiles: false,
    }
}
