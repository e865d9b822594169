use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    BandSet, CalibrationContext, CyclicalConfig, EngineError, FittedTrend, HistoricalPoint, LoanParams, MODELS,
    ModelParameters, ScenarioComparison, ScenarioMode, SigmaEstimate, SimulationParams,
    SimulationResult, SpendSolution, StackSolution, Valuation, compare_scenarios, find_max_spend,
    find_minimum_stack, fit_power_law, run_simulation, simulation_mode, validate_params, valuation_label,
};

const MILESTONE_PRICES: [f64; 5] = [100_000.0, 250_000.0, 500_000.0, 1_000_000.0, 10_000_000.0];

#[derive(Parser, Debug)]
#[command(
    name = "stackrunway",
    about = "Bitcoin power-law projections and stack runway simulator (sell-only and loan-backed)"
)]
pub struct AppCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API over HTTP.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, help = "JSON file of {date, price} points used to calibrate sigma")]
        history: Option<PathBuf>,
    },
    /// Run one year-by-year simulation and print it as JSON.
    Simulate(RunArgs),
    /// Solve minimum stack and maximum safe spend.
    Solve(RunArgs),
    /// Compare sell-only and loan-backed minimum stacks across all scenarios.
    Compare(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    sim: SimArgs,
    #[arg(long, help = "JSON file of {date, price} points used to calibrate sigma")]
    history: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliScenario {
    FlatTrend,
    FlatBear,
    FlatDeepBear,
    Cyclical,
    CyclicalBear,
}

impl From<CliScenario> for ScenarioMode {
    fn from(value: CliScenario) -> Self {
        match value {
            CliScenario::FlatTrend => ScenarioMode::FlatTrend,
            CliScenario::FlatBear => ScenarioMode::FlatBear,
            CliScenario::FlatDeepBear => ScenarioMode::FlatDeepBear,
            CliScenario::Cyclical => ScenarioMode::Cyclical,
            CliScenario::CyclicalBear => ScenarioMode::CyclicalBear,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SimArgs {
    #[arg(long, default_value = "santostasi", help = "Power-law model key")]
    model: String,
    #[arg(long, default_value_t = 1.0, help = "Starting stack in BTC")]
    stack: f64,
    #[arg(long, default_value_t = 50_000.0, help = "First-year spend in fiat")]
    spend: f64,
    #[arg(long, default_value_t = 2026)]
    start_year: i32,
    #[arg(long, default_value_t = 30, help = "Years to simulate")]
    horizon: u32,
    #[arg(
        long,
        default_value_t = 3.0,
        help = "Annual growth of spend in percent"
    )]
    inflation: f64,
    #[arg(long, value_enum, default_value_t = CliScenario::Cyclical)]
    scenario: CliScenario,
    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Sigma-k of today's market; overrides --spot-price"
    )]
    initial_k: Option<f64>,
    #[arg(long, help = "Live spot price used to anchor the cyclical scenarios")]
    spot_price: Option<f64>,
    #[arg(long, default_value_t = false)]
    use_loans: bool,
    #[arg(
        long,
        default_value_t = 50.0,
        help = "Maximum loan-to-value in percent"
    )]
    ltv: f64,
    #[arg(long, default_value_t = 10.0, help = "Loan interest in percent")]
    interest_rate: f64,
    #[arg(
        long,
        default_value_t = 1.0,
        help = "Borrow instead of selling while price/trend is below this multiple"
    )]
    loan_threshold: f64,
    #[arg(
        long,
        default_value_t = 80.0,
        help = "Loan-to-value in percent at which collateral is liquidated"
    )]
    liquidation_ltv: f64,
    #[arg(
        long,
        default_value_t = 10.0,
        help = "Share of remaining stack value used for partial repayment, in percent"
    )]
    partial_repay: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiGoal {
    #[serde(alias = "minStack", alias = "min_stack")]
    MinStack,
    #[serde(alias = "maxSpend", alias = "max_spend")]
    MaxSpend,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    model: Option<String>,
    stack: Option<f64>,
    spend: Option<f64>,
    start_year: Option<i32>,
    horizon: Option<u32>,
    inflation: Option<f64>,
    scenario: Option<String>,
    initial_k: Option<f64>,
    spot_price: Option<f64>,
    use_loans: Option<bool>,
    ltv: Option<f64>,
    interest_rate: Option<f64>,
    loan_threshold: Option<f64>,
    liquidation_ltv: Option<f64>,
    partial_repay: Option<f64>,
    goal: Option<ApiGoal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ModelQuery {
    model: Option<String>,
    date: Option<NaiveDate>,
    price: Option<f64>,
    years: Option<u32>,
}

#[derive(Debug)]
struct ApiRequest {
    params: SimulationParams,
    use_loans: bool,
    goal: Option<ApiGoal>,
}

/// Calibrated contexts for every known model, built once per historical
/// series and shared by all requests.
#[derive(Debug, Clone)]
pub struct Calibrations {
    contexts: Vec<CalibrationContext>,
    day_fit: Option<FittedTrend>,
    year_fit: Option<FittedTrend>,
}

impl Calibrations {
    pub fn new(history: &[HistoricalPoint]) -> Self {
        Self {
            contexts: MODELS
                .iter()
                .map(|model| CalibrationContext::new(*model, history))
                .collect(),
            day_fit: fit_power_law(history, false).ok(),
            year_fit: fit_power_law(history, true).ok(),
        }
    }

    /// Trend refitted from the loaded history, in the given model's time unit.
    pub fn fitted(&self, model: &ModelParameters) -> Option<FittedTrend> {
        if model.use_years {
            self.year_fit
        } else {
            self.day_fit
        }
    }

    pub fn get(&self, key: &str) -> Result<&CalibrationContext, EngineError> {
        self.contexts
            .iter()
            .find(|c| c.model().key == key)
            .ok_or_else(|| EngineError::UnknownModel {
                key: key.to_string(),
            })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    model: &'static str,
    sigma: f64,
    scenario: ScenarioMode,
    initial_k: Option<f64>,
    result: SimulationResult,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolveResponse {
    model: &'static str,
    scenario: ScenarioMode,
    use_loans: bool,
    min_stack: Option<StackSolution>,
    max_spend: Option<SpendSolution>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompareResponse {
    model: &'static str,
    sigma: f64,
    initial_k: Option<f64>,
    rows: Vec<ScenarioComparison>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Milestone {
    price: f64,
    date: NaiveDate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelResponse {
    model: ModelParameters,
    estimate: SigmaEstimate,
    bands: BandSet,
    projection: Vec<BandSet>,
    price: Option<f64>,
    multiplier: Option<f64>,
    sigma_k: Option<f64>,
    valuation: Option<Valuation>,
    valuation_label: Option<&'static str>,
    milestones: Vec<Milestone>,
    fit: Option<FittedTrend>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn load_history(path: &Path) -> Result<Vec<HistoricalPoint>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read history {}: {e}", path.display()))?;
    let mut points = serde_json::from_str::<Vec<HistoricalPoint>>(&raw)
        .map_err(|e| format!("Invalid history JSON in {}: {e}", path.display()))?;
    points.sort_by_key(|p| p.date);
    info!(path = %path.display(), points = points.len(), "loaded history");
    Ok(points)
}

fn calibrations_from(history: Option<&Path>) -> Result<Calibrations, String> {
    let points = match history {
        Some(path) => load_history(path)?,
        None => Vec::new(),
    };
    Ok(Calibrations::new(&points))
}

pub async fn run(cli: AppCli) -> Result<(), String> {
    match cli.command {
        Command::Serve { port, history } => {
            let calibrations = calibrations_from(history.as_deref())?;
            run_http_server(port, calibrations)
                .await
                .map_err(|e| format!("Server error: {e}"))
        }
        Command::Simulate(args) => {
            let calibrations = calibrations_from(args.history.as_deref())?;
            let request = api_request_from_args(&args.sim, &calibrations, None)?;
            print_json(&simulate(&request)?)
        }
        Command::Solve(args) => {
            let calibrations = calibrations_from(args.history.as_deref())?;
            let request = api_request_from_args(&args.sim, &calibrations, None)?;
            print_json(&solve(&request)?)
        }
        Command::Compare(args) => {
            let calibrations = calibrations_from(args.history.as_deref())?;
            let request = api_request_from_args(&args.sim, &calibrations, None)?;
            print_json(&compare(&request)?)
        }
    }
}

fn print_json<T: Serialize>(body: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(body).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

fn build_params(args: &SimArgs, calibrations: &Calibrations) -> Result<SimulationParams, String> {
    if !args.stack.is_finite() || args.stack < 0.0 {
        return Err("--stack must be >= 0".to_string());
    }
    if !args.spend.is_finite() || args.spend < 0.0 {
        return Err("--spend must be >= 0".to_string());
    }
    if args.horizon == 0 || args.horizon > 200 {
        return Err("--horizon must be between 1 and 200".to_string());
    }
    if !args.inflation.is_finite() || args.inflation <= -100.0 {
        return Err("--inflation must be > -100".to_string());
    }
    if !(args.ltv > 0.0 && args.ltv <= 100.0) {
        return Err("--ltv must be > 0 and <= 100".to_string());
    }
    if !(args.liquidation_ltv > 0.0 && args.liquidation_ltv <= 100.0) {
        return Err("--liquidation-ltv must be > 0 and <= 100".to_string());
    }
    if args.liquidation_ltv < args.ltv {
        return Err("--liquidation-ltv must be >= --ltv".to_string());
    }
    if !args.interest_rate.is_finite() || args.interest_rate < 0.0 {
        return Err("--interest-rate must be >= 0".to_string());
    }
    if !args.loan_threshold.is_finite() || args.loan_threshold < 0.0 {
        return Err("--loan-threshold must be >= 0".to_string());
    }
    if !(0.0..=100.0).contains(&args.partial_repay) {
        return Err("--partial-repay must be between 0 and 100".to_string());
    }
    if let Some(k) = args.initial_k {
        if !k.is_finite() {
            return Err("--initial-k must be finite".to_string());
        }
    }

    let context = calibrations.get(&args.model).map_err(|e| e.to_string())?;
    let start_date = NaiveDate::from_ymd_opt(args.start_year, 1, 1)
        .ok_or_else(|| "--start-year is not a valid calendar year".to_string())?;
    let initial_k = args
        .initial_k
        .or_else(|| context.initial_k_for_spot(args.spot_price, start_date));

    let params = SimulationParams {
        initial_stack: args.stack,
        annual_spend: args.spend,
        start_year: args.start_year,
        horizon_years: args.horizon,
        spend_inflation: args.inflation / 100.0,
        model: *context.model(),
        sigma: context.sigma(),
        scenario: args.scenario.into(),
        initial_k,
        cyclical: CyclicalConfig::default(),
        loan: LoanParams {
            ltv: args.ltv / 100.0,
            interest_rate: args.interest_rate / 100.0,
            loan_threshold: args.loan_threshold,
            liquidation_ltv: args.liquidation_ltv / 100.0,
            partial_repay_fraction: args.partial_repay / 100.0,
        },
    };
    validate_params(&params).map_err(|e| e.to_string())?;
    Ok(params)
}

fn api_request_from_args(
    args: &SimArgs,
    calibrations: &Calibrations,
    goal: Option<ApiGoal>,
) -> Result<ApiRequest, String> {
    Ok(ApiRequest {
        params: build_params(args, calibrations)?,
        use_loans: args.use_loans,
        goal,
    })
}

fn scenario_from_name(name: &str) -> CliScenario {
    match ScenarioMode::from_name(name) {
        Some(ScenarioMode::FlatTrend) => CliScenario::FlatTrend,
        Some(ScenarioMode::FlatBear) => CliScenario::FlatBear,
        Some(ScenarioMode::FlatDeepBear) => CliScenario::FlatDeepBear,
        Some(ScenarioMode::Cyclical) => CliScenario::Cyclical,
        Some(ScenarioMode::CyclicalBear) => CliScenario::CyclicalBear,
        None => {
            warn!(scenario = name, "unknown scenario, using flat trend");
            CliScenario::FlatTrend
        }
    }
}

fn api_request_from_payload(
    payload: SimulatePayload,
    calibrations: &Calibrations,
) -> Result<ApiRequest, String> {
    let mut args = default_args_for_api();

    if let Some(v) = payload.model {
        args.model = v;
    }
    if let Some(v) = payload.stack {
        args.stack = v;
    }
    if let Some(v) = payload.spend {
        args.spend = v;
    }
    if let Some(v) = payload.start_year {
        args.start_year = v;
    }
    if let Some(v) = payload.horizon {
        args.horizon = v;
    }
    if let Some(v) = payload.inflation {
        args.inflation = v;
    }
    if let Some(v) = payload.scenario {
        args.scenario = scenario_from_name(&v);
    }
    if let Some(v) = payload.initial_k {
        args.initial_k = Some(v);
    }
    if let Some(v) = payload.spot_price {
        args.spot_price = Some(v);
    }
    if let Some(v) = payload.use_loans {
        args.use_loans = v;
    }
    if let Some(v) = payload.ltv {
        args.ltv = v;
    }
    if let Some(v) = payload.interest_rate {
        args.interest_rate = v;
    }
    if let Some(v) = payload.loan_threshold {
        args.loan_threshold = v;
    }
    if let Some(v) = payload.liquidation_ltv {
        args.liquidation_ltv = v;
    }
    if let Some(v) = payload.partial_repay {
        args.partial_repay = v;
    }

    api_request_from_args(&args, calibrations, payload.goal)
}

#[cfg(test)]
fn api_request_from_json(json: &str, calibrations: &Calibrations) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload, calibrations)
}

fn default_args_for_api() -> SimArgs {
    SimArgs {
        model: "santostasi".to_string(),
        stack: 1.0,
        spend: 50_000.0,
        start_year: 2026,
        horizon: 30,
        inflation: 3.0,
        scenario: CliScenario::Cyclical,
        initial_k: None,
        spot_price: None,
        use_loans: false,
        ltv: 50.0,
        interest_rate: 10.0,
        loan_threshold: 1.0,
        liquidation_ltv: 80.0,
        partial_repay: 10.0,
    }
}

fn simulate(request: &ApiRequest) -> Result<SimulateResponse, String> {
    let params = &request.params;
    let result =
        run_simulation(params, simulation_mode(request.use_loans)).map_err(|e| e.to_string())?;
    Ok(SimulateResponse {
        model: params.model.key,
        sigma: params.sigma,
        scenario: params.scenario,
        initial_k: params.initial_k,
        result,
    })
}

fn solve(request: &ApiRequest) -> Result<SolveResponse, String> {
    let params = &request.params;
    let want_stack = request.goal != Some(ApiGoal::MaxSpend);
    let want_spend = request.goal != Some(ApiGoal::MinStack);

    let min_stack = want_stack
        .then(|| find_minimum_stack(params, request.use_loans))
        .transpose()
        .map_err(|e| e.to_string())?;
    let max_spend = want_spend
        .then(|| find_max_spend(params, request.use_loans))
        .transpose()
        .map_err(|e| e.to_string())?;

    Ok(SolveResponse {
        model: params.model.key,
        scenario: params.scenario,
        use_loans: request.use_loans,
        min_stack,
        max_spend,
    })
}

fn compare(request: &ApiRequest) -> Result<CompareResponse, String> {
    let params = &request.params;
    let rows = compare_scenarios(params).map_err(|e| e.to_string())?;
    Ok(CompareResponse {
        model: params.model.key,
        sigma: params.sigma,
        initial_k: params.initial_k,
        rows,
    })
}

fn model_report(query: ModelQuery, calibrations: &Calibrations) -> Result<ModelResponse, String> {
    let key = query.model.as_deref().unwrap_or("santostasi");
    let context = calibrations.get(key).map_err(|e| e.to_string())?;
    let model = context.model();
    let sigma = context.sigma();
    let date = query.date.unwrap_or_else(|| Utc::now().date_naive());
    let price = query.price.filter(|p| p.is_finite() && *p > 0.0);

    let multiplier = price.map(|p| model.multiplier(p, date));
    let milestones = MILESTONE_PRICES
        .iter()
        .filter_map(|&target| {
            model
                .milestone_date_for_price(target)
                .ok()
                .map(|reached| Milestone {
                    price: target,
                    date: reached,
                })
        })
        .collect();

    Ok(ModelResponse {
        model: *model,
        estimate: context.estimate(),
        bands: model.band_set(sigma, date),
        projection: model.projection(sigma, date, query.years.unwrap_or(10).min(100)),
        price,
        multiplier,
        sigma_k: price.map(|p| model.sigma_k_for_price(p, sigma, date)),
        valuation: multiplier.map(valuation_label),
        valuation_label: multiplier.map(|m| valuation_label(m).label()),
        milestones,
        fit: calibrations.fitted(model),
    })
}

type AppState = Arc<Calibrations>;

pub async fn run_http_server(port: u16, calibrations: Calibrations) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/solve", get(solve_get_handler).post(solve_post_handler))
        .route(
            "/api/compare",
            get(compare_get_handler).post(compare_post_handler),
        )
        .route("/api/model", get(model_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(calibrations));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "stack runway API listening");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    respond(payload, &state, simulate)
}

async fn simulate_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    respond(payload, &state, simulate)
}

async fn solve_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    respond(payload, &state, solve)
}

async fn solve_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    respond(payload, &state, solve)
}

async fn compare_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    respond(payload, &state, compare)
}

async fn compare_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    respond(payload, &state, compare)
}

async fn model_handler(State(state): State<AppState>, Query(query): Query<ModelQuery>) -> Response {
    match model_report(query, &state) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

fn respond<T, F>(payload: SimulatePayload, calibrations: &Calibrations, run: F) -> Response
where
    T: Serialize,
    F: FnOnce(&ApiRequest) -> Result<T, String>,
{
    let request = match api_request_from_payload(payload, calibrations) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    match run(&request) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
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
