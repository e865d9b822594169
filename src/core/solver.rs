use tracing::{debug, info};

use super::engine::run_simulation;
use super::error::{EngineError, EngineResult};
use super::types::{SimulationMode, SimulationParams, SpendSolution, StackSolution};

/// Bisection bounds for the minimum-stack search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackSearchConfig {
    pub search_min: f64,
    pub search_max: f64,
    /// Upper bound tried once `search_max` itself is ruined.
    pub escalated_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl Default for StackSearchConfig {
    fn default() -> Self {
        Self {
            search_min: 0.001,
            search_max: 100.0,
            escalated_max: 1_000.0,
            tolerance: 0.001,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendSearchConfig {
    /// Upper bound as a multiple of the first year's stack value.
    pub max_value_multiple: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl Default for SpendSearchConfig {
    fn default() -> Self {
        Self {
            max_value_multiple: 2.0,
            tolerance: 1.0,
            max_iterations: 50,
        }
    }
}

pub fn simulation_mode(use_loans: bool) -> SimulationMode {
    if use_loans {
        SimulationMode::LoanBacked
    } else {
        SimulationMode::SellOnly
    }
}

pub fn find_minimum_stack(base: &SimulationParams, use_loans: bool) -> EngineResult<StackSolution> {
    find_minimum_stack_with(base, use_loans, StackSearchConfig::default())
}

/// Smallest starting stack that survives the whole horizon. Returns
/// `f64::INFINITY` when even `escalated_max` is ruined.
pub fn find_minimum_stack_with(
    base: &SimulationParams,
    use_loans: bool,
    config: StackSearchConfig,
) -> EngineResult<StackSolution> {
    validate_stack_config(config)?;
    let mode = simulation_mode(use_loans);

    if survives_with_stack(base, mode, config.search_min)? {
        return Ok(StackSolution {
            min_stack: config.search_min,
            iterations: 0,
        });
    }

    let mut lo = config.search_min;
    let mut hi = config.search_max;
    if !survives_with_stack(base, mode, hi)? {
        lo = hi;
        hi = config.escalated_max;
        if !survives_with_stack(base, mode, hi)? {
            info!(
                ?mode,
                scenario = base.scenario.name(),
                ceiling = hi,
                "no finite stack survives"
            );
            return Ok(StackSolution {
                min_stack: f64::INFINITY,
                iterations: 0,
            });
        }
    }

    let mut iterations = 0;
    while iterations < config.max_iterations && hi - lo > config.tolerance {
        iterations += 1;
        let mid = (lo + hi) * 0.5;
        let survived = survives_with_stack(base, mode, mid)?;
        debug!(iteration = iterations, lo, hi, mid, survived, "stack probe");
        if survived {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    info!(
        ?mode,
        scenario = base.scenario.name(),
        min_stack = hi,
        iterations,
        "solved minimum stack"
    );
    Ok(StackSolution {
        min_stack: hi,
        iterations,
    })
}

pub fn find_max_spend(base: &SimulationParams, use_loans: bool) -> EngineResult<SpendSolution> {
    find_max_spend_with(base, use_loans, SpendSearchConfig::default())
}

/// Largest starting annual spend the given stack sustains for the whole
/// horizon.
pub fn find_max_spend_with(
    base: &SimulationParams,
    use_loans: bool,
    config: SpendSearchConfig,
) -> EngineResult<SpendSolution> {
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return Err(EngineError::InvalidParameter {
            field: "tolerance",
            reason: "must be > 0",
        });
    }
    let mode = simulation_mode(use_loans);

    if !survives_with_spend(base, mode, 0.0)? {
        return Ok(SpendSolution {
            max_spend: 0.0,
            iterations: 0,
        });
    }

    let first_price = run_simulation(
        &SimulationParams {
            annual_spend: 0.0,
            ..base.clone()
        },
        mode,
    )?
    .years
    .first()
    .map(|y| y.price)
    .unwrap_or(0.0);

    let mut lo = 0.0;
    let mut hi = base.initial_stack * first_price * config.max_value_multiple;
    if survives_with_spend(base, mode, hi)? {
        return Ok(SpendSolution {
            max_spend: hi,
            iterations: 0,
        });
    }

    let mut iterations = 0;
    while iterations < config.max_iterations && hi - lo > config.tolerance {
        iterations += 1;
        let mid = (lo + hi) * 0.5;
        let survived = survives_with_spend(base, mode, mid)?;
        debug!(iteration = iterations, lo, hi, mid, survived, "spend probe");
        if survived {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    info!(
        ?mode,
        scenario = base.scenario.name(),
        max_spend = lo,
        iterations,
        "solved maximum spend"
    );
    Ok(SpendSolution {
        max_spend: lo,
        iterations,
    })
}

fn survives_with_stack(
    base: &SimulationParams,
    mode: SimulationMode,
    stack: f64,
) -> EngineResult<bool> {
    let params = SimulationParams {
        initial_stack: stack,
        ..base.clone()
    };
    Ok(run_simulation(&params, mode)?.survived())
}

fn survives_with_spend(
    base: &SimulationParams,
    mode: SimulationMode,
    spend: f64,
) -> EngineResult<bool> {
    let params = SimulationParams {
        annual_spend: spend,
        ..base.clone()
    };
    Ok(run_simulation(&params, mode)?.survived())
}

fn validate_stack_config(config: StackSearchConfig) -> EngineResult<()> {
    if !config.search_min.is_finite() || config.search_min <= 0.0 {
        return Err(EngineError::InvalidParameter {
            field: "search_min",
            reason: "must be finite and > 0",
        });
    }
    if !(config.search_max > config.search_min && config.escalated_max >= config.search_max) {
        return Err(EngineError::InvalidParameter {
            field: "search_max",
            reason: "must satisfy search_min < search_max <= escalated_max",
        });
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return Err(EngineError::InvalidParameter {
            field: "tolerance",
            reason: "must be > 0",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::model_params;
    use crate::core::scenario::CyclicalConfig;
    use crate::core::engine::run_sell_simulation;
    use crate::core::types::{LoanParams, ScenarioMode};
    use proptest::prelude::{prop_assert, proptest};

    fn base_params() -> SimulationParams {
        SimulationParams {
            initial_stack: 1.0,
            annual_spend: 60_000.0,
            start_year: 2026,
            horizon_years: 25,
            spend_inflation: 0.03,
            model: model_params("santostasi").expect("known model"),
            sigma: 0.2,
            scenario: ScenarioMode::FlatBear,
            initial_k: None,
            cyclical: CyclicalConfig::default(),
            loan: LoanParams::default(),
        }
    }

    fn ruined_at(params: &SimulationParams, stack: f64) -> bool {
        let params = SimulationParams {
            initial_stack: stack,
            ..params.clone()
        };
        !run_sell_simulation(&params).expect("valid params").survived()
    }

    #[test]
    fn zero_spend_returns_search_floor() {
        let mut params = base_params();
        params.annual_spend = 0.0;
        let solution = find_minimum_stack(&params, false).expect("valid params");
        assert_eq!(solution.min_stack, 0.001);
        assert_eq!(solution.iterations, 0);
        assert!(solution.is_feasible());
    }

    #[test]
    fn solved_stack_sits_on_ruin_boundary() {
        let params = base_params();
        let solution = find_minimum_stack(&params, false).expect("valid params");
        assert!(solution.is_feasible());
        assert!(!ruined_at(&params, solution.min_stack));
        assert!(ruined_at(&params, solution.min_stack - 0.002));
        assert!(solution.iterations <= 50);
    }

    #[test]
    fn impossible_scenario_returns_infinity() {
        let mut params = base_params();
        params.annual_spend = 1e13;
        let solution = find_minimum_stack(&params, false).expect("valid params");
        assert!(solution.min_stack.is_infinite());
        assert!(!solution.is_feasible());
    }

    #[test]
    fn escalates_search_ceiling_beyond_one_hundred() {
        let mut params = base_params();
        params.annual_spend = 8_000_000.0;
        params.horizon_years = 3;
        params.spend_inflation = 0.0;
        let solution = find_minimum_stack(&params, false).expect("valid params");
        assert!(solution.min_stack > 100.0 && solution.min_stack < 1_000.0);
        assert!(ruined_at(&params, solution.min_stack - 0.002));
    }

    #[test]
    fn loan_solution_survives_loan_backed_run() {
        let params = base_params();
        let loan = find_minimum_stack(&params, true).expect("valid params");
        assert!(loan.is_feasible());
        let at = SimulationParams {
            initial_stack: loan.min_stack,
            ..params
        };
        assert!(
            run_simulation(&at, SimulationMode::LoanBacked)
                .expect("valid params")
                .survived()
        );
    }

    #[test]
    fn invalid_search_config_is_rejected() {
        let config = StackSearchConfig {
            search_min: 0.0,
            ..StackSearchConfig::default()
        };
        assert!(find_minimum_stack_with(&base_params(), false, config).is_err());
    }

    #[test]
    fn max_spend_survives_and_slightly_more_ruins() {
        let params = base_params();
        let solution = find_max_spend(&params, false).expect("valid params");
        assert!(solution.max_spend > 0.0);

        let at = SimulationParams {
            annual_spend: solution.max_spend,
            ..params.clone()
        };
        assert!(run_sell_simulation(&at).expect("valid params").survived());

        let above = SimulationParams {
            annual_spend: solution.max_spend + 2.0,
            ..params
        };
        assert!(!run_sell_simulation(&above).expect("valid params").survived());
    }

    #[test]
    fn max_spend_is_zero_without_stack() {
        let mut params = base_params();
        params.initial_stack = 0.0;
        let solution = find_max_spend(&params, true).expect("valid params");
        assert_eq!(solution.max_spend, 0.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(16))]

        #[test]
        fn prop_min_stack_is_tight(
            mode_idx in 0usize..5,
            spend in 1_000u32..250_000,
            horizon in 1u32..40,
        ) {
            let mut params = base_params();
            params.scenario = ScenarioMode::ALL[mode_idx];
            params.annual_spend = spend as f64;
            params.horizon_years = horizon;
            let solution = find_minimum_stack(&params, false).expect("valid params");
            prop_assert!(solution.is_feasible());
            prop_assert!(!ruined_at(&params, solution.min_stack));
            if solution.min_stack > 0.001 {
                prop_assert!(ruined_at(&params, solution.min_stack - 0.002));
            }
        }
    }
}
