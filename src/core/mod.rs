mod compare;
mod engine;
mod error;
mod model;
mod scenario;
mod solver;
mod types;

pub use compare::{compare_scenario, compare_scenarios};
pub use engine::{run_loan_simulation, run_sell_simulation, run_simulation, validate_params};
pub use error::{EngineError, EngineResult};
pub use model::{
    BandSet, CalibrationContext, DAYS_PER_YEAR, FittedTrend, MODELS, Valuation, age_in_years,
    calculate_sigma, days_since_genesis, fit_power_law, genesis_date, model_params, trend_price,
    valuation_label,
};
pub use scenario::{CyclicalConfig, K_MAX, K_MIN, ScenarioEngine};
pub use solver::{
    SpendSearchConfig, StackSearchConfig, find_max_spend, find_max_spend_with,
    find_minimum_stack, find_minimum_stack_with, simulation_mode,
};
pub use types::{
    HistoricalPoint, LoanParams, ModelParameters, ScenarioComparison, ScenarioMode,
    SigmaEstimate, SimulationMode, SimulationParams, SimulationResult, SpendSolution,
    StackSolution, YearRecord, YearStatus,
};
