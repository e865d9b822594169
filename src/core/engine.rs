use chrono::NaiveDate;
use tracing::debug;

use super::error::{EngineError, EngineResult};
use super::scenario::ScenarioEngine;
use super::types::{
    LoanParams, SimulationMode, SimulationParams, SimulationResult, YearRecord, YearStatus,
};

const MIN_START_YEAR: i32 = 2010;
const MAX_END_YEAR: i32 = 9999;
const LIQUIDATION_WARNING_MARGIN: f64 = 1.2;

/// Market conditions for one simulated year.
#[derive(Copy, Clone, Debug, PartialEq)]
struct MarketYear {
    year: i32,
    date: NaiveDate,
    trend_price: f64,
    sigma_k: f64,
    price: f64,
    multiple: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct LoanState {
    stack: f64,
    loan: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct LoanYearOutcome {
    status: YearStatus,
    btc_sold: f64,
    borrowed: f64,
    interest: f64,
}

pub fn run_simulation(
    params: &SimulationParams,
    mode: SimulationMode,
) -> EngineResult<SimulationResult> {
    match mode {
        SimulationMode::SellOnly => run_sell_simulation(params),
        SimulationMode::LoanBacked => run_loan_simulation(params),
    }
}

pub fn run_sell_simulation(params: &SimulationParams) -> EngineResult<SimulationResult> {
    validate_params(params)?;
    let scenario = scenario_engine(params)?;

    let mut years = Vec::with_capacity(params.horizon_years as usize);
    let mut ruin_year = None;
    let mut stack = params.initial_stack;
    let mut spend = params.annual_spend;

    for index in 0..params.horizon_years {
        let market = market_year(params, &scenario, index)?;
        let start_value = stack * market.price;
        let btc_needed = spend / market.price;

        if btc_needed >= stack {
            let record = YearRecord {
                btc_sold: stack,
                stack: 0.0,
                portfolio_value: 0.0,
                withdrawal_rate: withdrawal_rate(spend, start_value),
                status: YearStatus::Ruin,
                ..base_record(&market, spend)
            };
            ruin_year = Some(terminate_with_ruin(
                &mut years,
                record,
                params,
                index,
                SimulationMode::SellOnly,
            )?);
            break;
        }

        stack -= btc_needed;
        years.push(YearRecord {
            btc_sold: btc_needed,
            stack,
            portfolio_value: stack * market.price,
            withdrawal_rate: withdrawal_rate(spend, start_value),
            status: YearStatus::Sell,
            ..base_record(&market, spend)
        });
        spend *= 1.0 + params.spend_inflation;
    }

    Ok(SimulationResult {
        mode: SimulationMode::SellOnly,
        years,
        ruin_year,
    })
}

pub fn run_loan_simulation(params: &SimulationParams) -> EngineResult<SimulationResult> {
    validate_params(params)?;
    let scenario = scenario_engine(params)?;

    let mut years = Vec::with_capacity(params.horizon_years as usize);
    let mut ruin_year = None;
    let mut state = LoanState {
        stack: params.initial_stack,
        loan: 0.0,
    };
    let mut spend = params.annual_spend;

    for index in 0..params.horizon_years {
        let market = market_year(params, &scenario, index)?;
        let start_value = state.stack * market.price;
        let outcome = run_loan_year(&mut state, &market, spend, &params.loan);
        let (liquidation_price, liquidation_risk) =
            liquidation_exposure(&state, market.price, params.loan.liquidation_ltv);

        let record = YearRecord {
            btc_sold: outcome.btc_sold,
            btc_borrowed: outcome.borrowed / market.price,
            loan_balance: state.loan,
            interest_accrued: outcome.interest,
            stack: state.stack,
            portfolio_value: state.stack * market.price - state.loan,
            withdrawal_rate: withdrawal_rate(spend, start_value),
            status: outcome.status,
            liquidation_price,
            liquidation_risk,
            ..base_record(&market, spend)
        };

        if outcome.status == YearStatus::Ruin {
            ruin_year = Some(terminate_with_ruin(
                &mut years,
                record,
                params,
                index,
                SimulationMode::LoanBacked,
            )?);
            break;
        }

        years.push(record);
        spend *= 1.0 + params.spend_inflation;
    }

    Ok(SimulationResult {
        mode: SimulationMode::LoanBacked,
        years,
        ruin_year,
    })
}

/// One loan-backed year: accrue interest, then borrow below the threshold
/// multiple or sell and repay above it.
fn run_loan_year(
    state: &mut LoanState,
    market: &MarketYear,
    spend: f64,
    loan: &LoanParams,
) -> LoanYearOutcome {
    let interest = state.loan * loan.interest_rate;
    state.loan += interest;

    let price = market.price;
    let spend_btc = spend / price;
    let mut outcome = LoanYearOutcome {
        status: YearStatus::Ruin,
        btc_sold: 0.0,
        borrowed: 0.0,
        interest,
    };

    if market.multiple < loan.loan_threshold {
        let capacity = (state.stack * price * loan.ltv - state.loan).max(0.0);
        if capacity >= spend {
            state.loan += spend;
            outcome.borrowed = spend;
            outcome.status = YearStatus::Borrowing;
            return outcome;
        }

        let (borrowed, status) = if capacity > 0.0 {
            (capacity, YearStatus::PartialBorrow)
        } else {
            (0.0, YearStatus::ForcedSell)
        };
        let sell_btc = (spend - borrowed) / price;
        if sell_btc >= state.stack {
            return ruin_outcome(state, outcome);
        }
        state.loan += borrowed;
        outcome.borrowed = borrowed;
        state.stack -= sell_btc;
        outcome.btc_sold = sell_btc;
        outcome.status = status;
        return outcome;
    }

    let repay_btc = state.loan / price;
    if spend_btc + repay_btc < state.stack {
        state.stack -= spend_btc + repay_btc;
        outcome.btc_sold = spend_btc + repay_btc;
        outcome.status = if state.loan > 0.0 {
            YearStatus::SellAndRepay
        } else {
            YearStatus::Sell
        };
        state.loan = 0.0;
        return outcome;
    }

    if spend_btc < state.stack {
        state.stack -= spend_btc;
        let repay = state
            .loan
            .min(state.stack * price * loan.partial_repay_fraction);
        let repay_btc = repay / price;
        state.stack -= repay_btc;
        state.loan -= repay;
        outcome.btc_sold = spend_btc + repay_btc;
        outcome.status = YearStatus::PartialRepay;
        return outcome;
    }

    ruin_outcome(state, outcome)
}

fn ruin_outcome(state: &mut LoanState, mut outcome: LoanYearOutcome) -> LoanYearOutcome {
    outcome.btc_sold = state.stack;
    outcome.status = YearStatus::Ruin;
    state.stack = 0.0;
    outcome
}

/// Price at which the collateral would be liquidated, and whether the current
/// price sits within the warning margin above it.
fn liquidation_exposure(
    state: &LoanState,
    price: f64,
    liquidation_ltv: f64,
) -> (Option<f64>, bool) {
    if state.loan <= 0.0 || state.stack <= 0.0 || liquidation_ltv <= 0.0 {
        return (None, false);
    }
    let liquidation_price = state.loan / (state.stack * liquidation_ltv);
    (
        Some(liquidation_price),
        price <= liquidation_price * LIQUIDATION_WARNING_MARGIN,
    )
}

/// Records the ruin year, pads every remaining year with zeroed ruin
/// placeholders and returns the ruin year.
fn terminate_with_ruin(
    years: &mut Vec<YearRecord>,
    ruin: YearRecord,
    params: &SimulationParams,
    index: u32,
    mode: SimulationMode,
) -> EngineResult<i32> {
    debug!(
        ?mode,
        year = ruin.year,
        spend = ruin.spend,
        scenario = params.scenario.name(),
        "simulation ruined"
    );
    let ruin_year = ruin.year;
    years.push(ruin);
    for pad in index + 1..params.horizon_years {
        let year = params.start_year + pad as i32;
        years.push(YearRecord::ruin_placeholder(year, january_first(year)?));
    }
    Ok(ruin_year)
}

fn base_record(market: &MarketYear, spend: f64) -> YearRecord {
    YearRecord {
        year: market.year,
        date: market.date,
        price: market.price,
        trend_price: market.trend_price,
        multiple: market.multiple,
        sigma_k: market.sigma_k,
        spend,
        btc_sold: 0.0,
        btc_borrowed: 0.0,
        loan_balance: 0.0,
        interest_accrued: 0.0,
        stack: 0.0,
        portfolio_value: 0.0,
        withdrawal_rate: 0.0,
        status: YearStatus::Sell,
        liquidation_price: None,
        liquidation_risk: false,
    }
}

fn withdrawal_rate(spend: f64, portfolio_value: f64) -> f64 {
    if portfolio_value <= 0.0 {
        0.0
    } else {
        spend / portfolio_value
    }
}

fn market_year(
    params: &SimulationParams,
    scenario: &ScenarioEngine,
    index: u32,
) -> EngineResult<MarketYear> {
    let year = params.start_year + index as i32;
    let date = january_first(year)?;
    let trend_price = params.model.trend_price(date);
    let sigma_k = scenario.resolve_scenario_k(params.scenario, index as f64, params.initial_k);
    let price = params.model.band_price(params.sigma, sigma_k, date);
    Ok(MarketYear {
        year,
        date,
        trend_price,
        sigma_k,
        price,
        multiple: price / trend_price,
    })
}

fn scenario_engine(params: &SimulationParams) -> EngineResult<ScenarioEngine> {
    Ok(ScenarioEngine::for_start_date(
        params.cyclical,
        january_first(params.start_year)?,
    ))
}

fn january_first(year: i32) -> EngineResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 1, 1).ok_or(EngineError::InvalidParameter {
        field: "start_year",
        reason: "produces an invalid calendar date",
    })
}

pub fn validate_params(params: &SimulationParams) -> EngineResult<()> {
    let invalid = |field, reason| Err(EngineError::InvalidParameter { field, reason });

    if !params.initial_stack.is_finite() || params.initial_stack < 0.0 {
        return invalid("initial_stack", "must be finite and >= 0");
    }
    if !params.annual_spend.is_finite() || params.annual_spend < 0.0 {
        return invalid("annual_spend", "must be finite and >= 0");
    }
    if params.horizon_years == 0 {
        return invalid("horizon_years", "must be > 0");
    }
    if params.start_year < MIN_START_YEAR
        || params.start_year as i64 + params.horizon_years as i64 > MAX_END_YEAR as i64
    {
        return invalid("start_year", "must be >= 2010 and end before year 9999");
    }
    if !params.spend_inflation.is_finite() || params.spend_inflation <= -1.0 {
        return invalid("spend_inflation", "must be > -1");
    }
    if !params.sigma.is_finite() || params.sigma < 0.0 {
        return invalid("sigma", "must be finite and >= 0");
    }
    if !(params.loan.ltv > 0.0 && params.loan.ltv <= 1.0) {
        return invalid("ltv", "must be in (0, 1]");
    }
    if !params.loan.interest_rate.is_finite() || params.loan.interest_rate < 0.0 {
        return invalid("interest_rate", "must be finite and >= 0");
    }
    if !params.loan.loan_threshold.is_finite() || params.loan.loan_threshold < 0.0 {
        return invalid("loan_threshold", "must be finite and >= 0");
    }
    if !(params.loan.liquidation_ltv > 0.0 && params.loan.liquidation_ltv <= 1.0) {
        return invalid("liquidation_ltv", "must be in (0, 1]");
    }
    if !(0.0..=1.0).contains(&params.loan.partial_repay_fraction) {
        return invalid("partial_repay_fraction", "must be between 0 and 1");
    }
    Ok(())
}
