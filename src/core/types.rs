use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::scenario::CyclicalConfig;

/// Power-law trend parameters for one named model.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParameters {
    pub key: &'static str,
    pub beta: f64,
    pub log_a: f64,
    /// Canonical log-volatility, used when no historical series is available.
    pub sigma: f64,
    pub use_years: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub date: NaiveDate,
    pub price: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SigmaEstimate {
    pub sigma: f64,
    pub mean: f64,
    pub count: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioMode {
    #[serde(alias = "flatTrend")]
    FlatTrend,
    #[serde(alias = "flatBear")]
    FlatBear,
    #[serde(alias = "flatDeepBear")]
    FlatDeepBear,
    Cyclical,
    #[serde(alias = "cyclicalBear")]
    CyclicalBear,
}

impl ScenarioMode {
    pub const ALL: [ScenarioMode; 5] = [
        ScenarioMode::FlatTrend,
        ScenarioMode::FlatBear,
        ScenarioMode::FlatDeepBear,
        ScenarioMode::Cyclical,
        ScenarioMode::CyclicalBear,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "flat_trend" => Some(ScenarioMode::FlatTrend),
            "flat_bear" => Some(ScenarioMode::FlatBear),
            "flat_deep_bear" => Some(ScenarioMode::FlatDeepBear),
            "cyclical" => Some(ScenarioMode::Cyclical),
            "cyclical_bear" => Some(ScenarioMode::CyclicalBear),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScenarioMode::FlatTrend => "flat_trend",
            ScenarioMode::FlatBear => "flat_bear",
            ScenarioMode::FlatDeepBear => "flat_deep_bear",
            ScenarioMode::Cyclical => "cyclical",
            ScenarioMode::CyclicalBear => "cyclical_bear",
        }
    }

    /// Constant sigma-k for the flat modes, `None` for the cyclical ones.
    pub fn static_k(self) -> Option<f64> {
        match self {
            ScenarioMode::FlatTrend => Some(0.0),
            ScenarioMode::FlatBear => Some(-1.0),
            ScenarioMode::FlatDeepBear => Some(-2.0),
            ScenarioMode::Cyclical | ScenarioMode::CyclicalBear => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LoanParams {
    /// Maximum loan as a fraction of collateral value.
    pub ltv: f64,
    pub interest_rate: f64,
    /// Borrow instead of selling while price/trend is below this multiple.
    pub loan_threshold: f64,
    pub liquidation_ltv: f64,
    /// Share of post-sale stack value used to pay down the loan when a full
    /// repayment does not fit.
    pub partial_repay_fraction: f64,
}

impl Default for LoanParams {
    fn default() -> Self {
        Self {
            ltv: 0.5,
            interest_rate: 0.10,
            loan_threshold: 1.0,
            liquidation_ltv: 0.8,
            partial_repay_fraction: 0.10,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationParams {
    pub initial_stack: f64,
    pub annual_spend: f64,
    pub start_year: i32,
    pub horizon_years: u32,
    pub spend_inflation: f64,
    pub model: ModelParameters,
    pub sigma: f64,
    pub scenario: ScenarioMode,
    pub initial_k: Option<f64>,
    pub cyclical: CyclicalConfig,
    pub loan: LoanParams,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum YearStatus {
    Sell,
    Borrowing,
    PartialBorrow,
    ForcedSell,
    SellAndRepay,
    PartialRepay,
    Ruin,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulationMode {
    SellOnly,
    LoanBacked,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearRecord {
    pub year: i32,
    pub date: NaiveDate,
    pub price: f64,
    pub trend_price: f64,
    pub multiple: f64,
    pub sigma_k: f64,
    pub spend: f64,
    pub btc_sold: f64,
    pub btc_borrowed: f64,
    pub loan_balance: f64,
    pub interest_accrued: f64,
    pub stack: f64,
    pub portfolio_value: f64,
    /// Spend as a share of the portfolio value held at the start of the year.
    pub withdrawal_rate: f64,
    pub status: YearStatus,
    pub liquidation_price: Option<f64>,
    pub liquidation_risk: bool,
}

impl YearRecord {
    pub(crate) fn ruin_placeholder(year: i32, date: NaiveDate) -> Self {
        Self {
            year,
            date,
            price: 0.0,
            trend_price: 0.0,
            multiple: 0.0,
            sigma_k: 0.0,
            spend: 0.0,
            btc_sold: 0.0,
            btc_borrowed: 0.0,
            loan_balance: 0.0,
            interest_accrued: 0.0,
            stack: 0.0,
            portfolio_value: 0.0,
            withdrawal_rate: 0.0,
            status: YearStatus::Ruin,
            liquidation_price: None,
            liquidation_risk: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub mode: SimulationMode,
    pub years: Vec<YearRecord>,
    pub ruin_year: Option<i32>,
}

impl SimulationResult {
    pub fn survived(&self) -> bool {
        self.ruin_year.is_none()
    }

    pub fn total_interest(&self) -> f64 {
        self.years.iter().map(|y| y.interest_accrued).sum()
    }

    pub fn final_stack(&self) -> f64 {
        self.years.last().map(|y| y.stack).unwrap_or(0.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSolution {
    /// `f64::INFINITY` when no stack up to the search ceiling survives.
    pub min_stack: f64,
    pub iterations: u32,
}

impl StackSolution {
    pub fn is_feasible(&self) -> bool {
        self.min_stack.is_finite()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendSolution {
    pub max_spend: f64,
    pub iterations: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioComparison {
    pub scenario: ScenarioMode,
    pub min_stack_sell: f64,
    pub min_stack_loan: f64,
    pub btc_saved: f64,
    pub savings_pct: f64,
    pub total_interest: f64,
}
