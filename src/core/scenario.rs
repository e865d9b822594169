use std::f64::consts::PI;

use chrono::NaiveDate;

use super::model::age_in_years;
use super::types::ScenarioMode;

pub const K_MIN: f64 = -2.0;
pub const K_MAX: f64 = 2.0;

/// Log-periodic cycle generator settings.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CyclicalConfig {
    /// Ratio by which each cycle is longer than the previous one.
    pub lambda: f64,
    /// Bitcoin age in years of a known cycle low; pinned to `sin(phase) = -1`.
    pub trough_age: f64,
    /// Peak amplitude at age one year.
    pub peak_k0: f64,
    /// Power-law decay exponent of the peak amplitude.
    pub alpha: f64,
    pub trough_depth: f64,
    /// Downward shift applied by the bear variant.
    pub bear_bias: f64,
    /// Years over which a live-market `initial_k` fades into the wave.
    pub anchor_years: f64,
}

impl Default for CyclicalConfig {
    fn default() -> Self {
        Self {
            lambda: 2.007,
            trough_age: 9.95,
            peak_k0: 3.0,
            alpha: 0.35,
            trough_depth: 1.0,
            bear_bias: 0.5,
            anchor_years: 2.0,
        }
    }
}

impl CyclicalConfig {
    pub fn phase_shift(&self) -> f64 {
        -PI / 2.0 - 2.0 * PI * self.trough_age.ln() / self.lambda.ln()
    }

    pub fn phase(&self, age: f64) -> f64 {
        2.0 * PI * age.ln() / self.lambda.ln() + self.phase_shift()
    }

    /// Unbiased wave value at an absolute Bitcoin age. Peaks decay with age,
    /// troughs keep a constant depth.
    pub fn wave_k(&self, age: f64) -> f64 {
        if age <= 0.0 {
            return 0.0;
        }
        let s = self.phase(age).sin();
        let amplitude = if s >= 0.0 {
            self.peak_k0 * age.powf(-self.alpha)
        } else {
            self.trough_depth
        };
        amplitude * s
    }
}

/// Maps scenario modes and year offsets to sigma-k values for one simulation
/// start date.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ScenarioEngine {
    config: CyclicalConfig,
    start_age: f64,
}

impl ScenarioEngine {
    pub fn new(config: CyclicalConfig, start_age: f64) -> Self {
        Self { config, start_age }
    }

    pub fn for_start_date(config: CyclicalConfig, start: NaiveDate) -> Self {
        Self::new(config, age_in_years(start))
    }

    pub fn config(&self) -> &CyclicalConfig {
        &self.config
    }

    pub fn start_age(&self) -> f64 {
        self.start_age
    }

    pub fn resolve_scenario_k(
        &self,
        mode: ScenarioMode,
        year_offset: f64,
        initial_k: Option<f64>,
    ) -> f64 {
        let k = match mode.static_k() {
            Some(k) => k,
            None => self.cyclical_k(
                year_offset,
                initial_k,
                mode == ScenarioMode::CyclicalBear,
            ),
        };
        k.clamp(K_MIN, K_MAX)
    }

    /// Like [`Self::resolve_scenario_k`] for a raw mode name; unknown names
    /// resolve to the trend.
    pub fn resolve_named_k(&self, mode: &str, year_offset: f64, initial_k: Option<f64>) -> f64 {
        ScenarioMode::from_name(mode)
            .map(|m| self.resolve_scenario_k(m, year_offset, initial_k))
            .unwrap_or(0.0)
    }

    fn cyclical_k(&self, year_offset: f64, initial_k: Option<f64>, bear: bool) -> f64 {
        let wave = self.config.wave_k(self.start_age + year_offset);
        let k = match initial_k.filter(|k| k.is_finite()) {
            Some(anchor) if year_offset < self.config.anchor_years => {
                let w = (year_offset / self.config.anchor_years).max(0.0);
                (1.0 - w) * anchor + w * wave
            }
            _ => wave,
        };
        // Bear shift is applied after the anchor blend.
        if bear { k - self.config.bear_bias } else { k }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-9;

    fn engine_at(age: f64) -> ScenarioEngine {
        ScenarioEngine::new(CyclicalConfig::default(), age)
    }

    #[test]
    fn static_modes_return_constants() {
        let engine = engine_at(17.0);
        assert_eq!(engine.resolve_scenario_k(ScenarioMode::FlatTrend, 3.0, Some(1.5)), 0.0);
        assert_eq!(engine.resolve_scenario_k(ScenarioMode::FlatBear, 0.0, None), -1.0);
        assert_eq!(engine.resolve_scenario_k(ScenarioMode::FlatDeepBear, 9.0, None), -2.0);
    }

    #[test]
    fn trough_age_hits_full_trough_depth() {
        let config = CyclicalConfig::default();
        assert!((config.wave_k(config.trough_age) + config.trough_depth).abs() < EPS);
        let next = config.trough_age * config.lambda;
        assert!((config.wave_k(next) + config.trough_depth).abs() < EPS);
    }

    #[test]
    fn peaks_shrink_with_age() {
        let config = CyclicalConfig::default();
        let first_peak = config.trough_age * config.lambda.sqrt();
        let later_peak = first_peak * config.lambda;
        let first = config.wave_k(first_peak);
        let later = config.wave_k(later_peak);
        assert!(first > later && later > 0.0);
        assert!((first - config.peak_k0 * first_peak.powf(-config.alpha)).abs() < EPS);
    }

    #[test]
    fn anchor_equals_initial_k_at_offset_zero() {
        let engine = engine_at(17.0);
        assert_eq!(
            engine.resolve_scenario_k(ScenarioMode::Cyclical, 0.0, Some(-1.5)),
            -1.5
        );
    }

    #[test]
    fn anchor_blends_halfway_after_one_year() {
        let engine = engine_at(17.0);
        let wave = engine.config().wave_k(18.0);
        let k = engine.resolve_scenario_k(ScenarioMode::Cyclical, 1.0, Some(-1.5));
        assert!((k - (0.5 * -1.5 + 0.5 * wave)).abs() < EPS);
    }

    #[test]
    fn anchor_expires_after_anchor_years() {
        let engine = engine_at(17.0);
        let with = engine.resolve_scenario_k(ScenarioMode::Cyclical, 2.0, Some(1.9));
        let without = engine.resolve_scenario_k(ScenarioMode::Cyclical, 2.0, None);
        assert_eq!(with, without);
    }

    #[test]
    fn bear_bias_shifts_wave_down() {
        let engine = engine_at(17.0);
        for offset in [3.0, 5.0, 8.0, 13.0] {
            let plain = engine.resolve_scenario_k(ScenarioMode::Cyclical, offset, None);
            let bear = engine.resolve_scenario_k(ScenarioMode::CyclicalBear, offset, None);
            if plain - 0.5 >= K_MIN {
                assert!((plain - bear - 0.5).abs() < EPS);
            }
        }
    }

    #[test]
    fn bear_bias_applies_during_anchored_years() {
        let engine = engine_at(17.0);
        let bias = engine.config().bear_bias;
        for offset in [0.0, 1.0] {
            let plain = engine.resolve_scenario_k(ScenarioMode::Cyclical, offset, Some(-1.0));
            let bear = engine.resolve_scenario_k(ScenarioMode::CyclicalBear, offset, Some(-1.0));
            assert!((plain - bear - bias).abs() < EPS, "offset {offset}: {plain} vs {bear}");
        }
        assert_eq!(
            engine.resolve_scenario_k(ScenarioMode::CyclicalBear, 0.0, Some(-1.0)),
            -1.0 - bias
        );
    }

    #[test]
    fn out_of_range_anchor_is_clamped() {
        let engine = engine_at(17.0);
        assert_eq!(
            engine.resolve_scenario_k(ScenarioMode::Cyclical, 0.0, Some(-3.7)),
            K_MIN
        );
    }

    #[test]
    fn unknown_mode_name_resolves_to_trend() {
        let engine = engine_at(17.0);
        assert_eq!(engine.resolve_named_k("moonshot", 4.0, Some(1.0)), 0.0);
        assert_eq!(engine.resolve_named_k("flat_bear", 4.0, None), -1.0);
    }

    proptest! {
        #[test]
        fn prop_sigma_k_stays_in_band(
            mode_idx in 0usize..5,
            start_age in 0.5f64..60.0,
            offset in 0.0f64..80.0,
            anchor in proptest::option::of(-10.0f64..10.0),
        ) {
            let engine = engine_at(start_age);
            let k = engine.resolve_scenario_k(ScenarioMode::ALL[mode_idx], offset, anchor);
            prop_assert!((K_MIN..=K_MAX).contains(&k));
        }
    }
}
