use tracing::info;

use super::engine::run_loan_simulation;
use super::error::EngineResult;
use super::solver::find_minimum_stack;
use super::types::{ScenarioComparison, ScenarioMode, SimulationParams};

/// Sell-only versus loan-backed minimum stacks for every scenario mode.
pub fn compare_scenarios(base: &SimulationParams) -> EngineResult<Vec<ScenarioComparison>> {
    ScenarioMode::ALL
        .iter()
        .map(|&scenario| {
            compare_scenario(&SimulationParams {
                scenario,
                ..base.clone()
            })
        })
        .collect()
}

pub fn compare_scenario(params: &SimulationParams) -> EngineResult<ScenarioComparison> {
    let sell = find_minimum_stack(params, false)?;
    let loan = find_minimum_stack(params, true)?;

    let total_interest = if loan.is_feasible() {
        run_loan_simulation(&SimulationParams {
            initial_stack: loan.min_stack,
            ..params.clone()
        })?
        .total_interest()
    } else {
        0.0
    };

    let (btc_saved, savings_pct) = if sell.is_feasible() && loan.is_feasible() {
        let saved = sell.min_stack - loan.min_stack;
        (saved, saved / sell.min_stack * 100.0)
    } else {
        (0.0, 0.0)
    };

    info!(
        scenario = params.scenario.name(),
        min_stack_sell = sell.min_stack,
        min_stack_loan = loan.min_stack,
        btc_saved,
        "compared strategies"
    );

    Ok(ScenarioComparison {
        scenario: params.scenario,
        min_stack_sell: sell.min_stack,
        min_stack_loan: loan.min_stack,
        btc_saved,
        savings_pct,
        total_interest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::model_params;
    use crate::core::scenario::CyclicalConfig;
    use crate::core::types::LoanParams;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn base_params() -> SimulationParams {
        SimulationParams {
            initial_stack: 1.0,
            annual_spend: 40_000.0,
            start_year: 2026,
            horizon_years: 20,
            spend_inflation: 0.03,
            model: model_params("santostasi").expect("known model"),
            sigma: 0.2,
            scenario: ScenarioMode::FlatTrend,
            initial_k: Some(-0.5),
            cyclical: CyclicalConfig::default(),
            loan: LoanParams::default(),
        }
    }

    #[test]
    fn comparison_covers_every_scenario_in_order() {
        let rows = compare_scenarios(&base_params()).expect("valid params");
        let scenarios = rows.iter().map(|r| r.scenario).collect::<Vec<_>>();
        assert_eq!(scenarios, ScenarioMode::ALL.to_vec());
        for row in &rows {
            assert!(row.min_stack_sell.is_finite());
            assert!(row.min_stack_loan.is_finite());
            assert_close(row.btc_saved, row.min_stack_sell - row.min_stack_loan, 1e-12);
            assert_close(
                row.savings_pct,
                row.btc_saved / row.min_stack_sell * 100.0,
                1e-9,
            );
            assert!(row.total_interest >= 0.0);
        }
    }

    #[test]
    fn flat_trend_loans_match_selling() {
        // Price sits exactly on trend, which is never below the 1.0 threshold.
        let row = compare_scenario(&base_params()).expect("valid params");
        assert_eq!(row.min_stack_sell, row.min_stack_loan);
        assert_eq!(row.btc_saved, 0.0);
        assert_eq!(row.total_interest, 0.0);
    }

    #[test]
    fn infeasible_scenario_reports_no_savings() {
        let mut params = base_params();
        params.annual_spend = 1e13;
        let row = compare_scenario(&params).expect("valid params");
        assert!(row.min_stack_sell.is_infinite());
        assert_eq!(row.btc_saved, 0.0);
        assert_eq!(row.savings_pct, 0.0);
        assert_eq!(row.total_interest, 0.0);
    }
}
