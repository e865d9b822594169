use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use tracing::{debug, info};

use super::error::{EngineError, EngineResult};
use super::types::{HistoricalPoint, ModelParameters, SigmaEstimate};

pub const DAYS_PER_YEAR: f64 = 365.25;

pub const MODELS: [ModelParameters; 3] = [
    ModelParameters {
        key: "santostasi",
        beta: 5.82,
        log_a: -17.01,
        sigma: 0.20,
        use_years: false,
    },
    ModelParameters {
        key: "perrenod",
        beta: 5.60,
        log_a: -16.20,
        sigma: 0.22,
        use_years: false,
    },
    ModelParameters {
        key: "years",
        beta: 5.70,
        log_a: -1.975,
        sigma: 0.25,
        use_years: true,
    },
];

/// Bitcoin genesis block date; every time variable is measured from here.
pub fn genesis_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2009, 1, 3).expect("valid genesis date")
}

pub fn days_since_genesis(date: NaiveDate) -> i64 {
    (date - genesis_date()).num_days()
}

/// Bitcoin age in fractional years at `date`.
pub fn age_in_years(date: NaiveDate) -> f64 {
    days_since_genesis(date) as f64 / DAYS_PER_YEAR
}

pub fn model_params(key: &str) -> EngineResult<ModelParameters> {
    MODELS
        .iter()
        .find(|m| m.key == key)
        .copied()
        .ok_or_else(|| EngineError::UnknownModel {
            key: key.to_string(),
        })
}

pub fn trend_price(key: &str, date: NaiveDate) -> EngineResult<f64> {
    Ok(model_params(key)?.trend_price(date))
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandSet {
    pub date: NaiveDate,
    pub trend: f64,
    pub minus2: f64,
    pub minus1: f64,
    pub plus1: f64,
    pub plus2: f64,
}

impl ModelParameters {
    pub fn time_variable(&self, date: NaiveDate) -> f64 {
        let days = days_since_genesis(date) as f64;
        if self.use_years {
            days / DAYS_PER_YEAR
        } else {
            days
        }
    }

    /// `10^logA * t^beta`. Returns 0 at or before genesis where the power is
    /// undefined for fractional exponents.
    pub fn trend_price(&self, date: NaiveDate) -> f64 {
        let t = self.time_variable(date);
        if t <= 0.0 {
            return 0.0;
        }
        10f64.powf(self.log_a) * t.powf(self.beta)
    }

    pub fn band_price(&self, sigma: f64, k: f64, date: NaiveDate) -> f64 {
        self.trend_price(date) * 10f64.powf(k * sigma)
    }

    /// Exact inverse of the trend curve, rounded to the nearest whole day.
    pub fn milestone_date_for_price(&self, target_price: f64) -> EngineResult<NaiveDate> {
        if !target_price.is_finite() || target_price <= 0.0 {
            return Err(EngineError::InvalidParameter {
                field: "target_price",
                reason: "must be finite and > 0",
            });
        }
        let t = (target_price / 10f64.powf(self.log_a)).powf(1.0 / self.beta);
        let days = if self.use_years { t * DAYS_PER_YEAR } else { t };
        if !days.is_finite() || days > i32::MAX as f64 {
            return Err(EngineError::DateOutOfRange { days });
        }
        genesis_date()
            .checked_add_signed(Duration::days(days.round() as i64))
            .ok_or(EngineError::DateOutOfRange { days })
    }

    pub fn multiplier(&self, price: f64, date: NaiveDate) -> f64 {
        let trend = self.trend_price(date);
        if trend <= 0.0 { 0.0 } else { price / trend }
    }

    /// How many sigmas `price` sits above (positive) or below trend.
    pub fn sigma_k_for_price(&self, price: f64, sigma: f64, date: NaiveDate) -> f64 {
        let trend = self.trend_price(date);
        if trend <= 0.0 || price <= 0.0 || sigma <= 0.0 || !price.is_finite() {
            return 0.0;
        }
        (price.log10() - trend.log10()) / sigma
    }

    pub fn band_set(&self, sigma: f64, date: NaiveDate) -> BandSet {
        BandSet {
            date,
            trend: self.trend_price(date),
            minus2: self.band_price(sigma, -2.0, date),
            minus1: self.band_price(sigma, -1.0, date),
            plus1: self.band_price(sigma, 1.0, date),
            plus2: self.band_price(sigma, 2.0, date),
        }
    }

    /// Band rows for January 1 of each year starting after `from`.
    pub fn projection(&self, sigma: f64, from: NaiveDate, years: u32) -> Vec<BandSet> {
        (1..=years as i32)
            .filter_map(|offset| NaiveDate::from_ymd_opt(from.year() + offset, 1, 1))
            .map(|date| self.band_set(sigma, date))
            .collect()
    }
}

/// Population mean and standard deviation of `log10(price) - log10(trend)`.
pub fn calculate_sigma(history: &[HistoricalPoint], model: &ModelParameters) -> SigmaEstimate {
    let residuals = history
        .iter()
        .filter_map(|point| {
            let trend = model.trend_price(point.date);
            (trend > 0.0 && point.price > 0.0).then(|| point.price.log10() - trend.log10())
        })
        .collect::<Vec<_>>();

    let skipped = history.len() - residuals.len();
    if skipped > 0 {
        debug!(model = model.key, skipped, "skipped degenerate history points");
    }

    let count = residuals.len();
    if count == 0 {
        return SigmaEstimate {
            sigma: 0.0,
            mean: 0.0,
            count: 0,
        };
    }

    let n = count as f64;
    let mean = residuals.iter().sum::<f64>() / n;
    let variance = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    SigmaEstimate {
        sigma: variance.sqrt(),
        mean,
        count,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FittedTrend {
    pub beta: f64,
    pub log_a: f64,
    pub r_squared: f64,
    pub count: usize,
}

/// Ordinary least squares of `log10(price)` on `log10(t)`.
pub fn fit_power_law(history: &[HistoricalPoint], use_years: bool) -> EngineResult<FittedTrend> {
    let probe = ModelParameters {
        key: "fit",
        beta: 1.0,
        log_a: 0.0,
        sigma: 0.0,
        use_years,
    };
    let samples = history
        .iter()
        .filter_map(|point| {
            let t = probe.time_variable(point.date);
            (t > 0.0 && point.price > 0.0).then(|| (t.log10(), point.price.log10()))
        })
        .collect::<Vec<_>>();

    let n = samples.len() as f64;
    let mean_x = samples.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = samples.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx = samples.iter().map(|(x, _)| (x - mean_x).powi(2)).sum::<f64>();
    if samples.len() < 2 || sxx <= 1e-15 {
        return Err(EngineError::InsufficientHistory {
            needed: 2,
            got: samples.len(),
        });
    }
    let sxy = samples
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum::<f64>();
    let syy = samples.iter().map(|(_, y)| (y - mean_y).powi(2)).sum::<f64>();

    let beta = sxy / sxx;
    let log_a = mean_y - beta * mean_x;
    let r_squared = if syy <= 0.0 {
        1.0
    } else {
        (sxy * sxy) / (sxx * syy)
    };
    Ok(FittedTrend {
        beta,
        log_a,
        r_squared,
        count: samples.len(),
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Valuation {
    ExtremelyUndervalued,
    Undervalued,
    Fair,
    Overvalued,
    HighlyOvervalued,
    ExtremelyOvervalued,
}

impl Valuation {
    pub fn label(self) -> &'static str {
        match self {
            Valuation::ExtremelyUndervalued => "extremely undervalued",
            Valuation::Undervalued => "undervalued",
            Valuation::Fair => "fair",
            Valuation::Overvalued => "overvalued",
            Valuation::HighlyOvervalued => "highly overvalued",
            Valuation::ExtremelyOvervalued => "extremely overvalued",
        }
    }
}

pub fn valuation_label(ratio: f64) -> Valuation {
    if ratio < 0.5 {
        Valuation::ExtremelyUndervalued
    } else if ratio < 0.75 {
        Valuation::Undervalued
    } else if ratio < 1.25 {
        Valuation::Fair
    } else if ratio < 2.0 {
        Valuation::Overvalued
    } else if ratio < 3.0 {
        Valuation::HighlyOvervalued
    } else {
        Valuation::ExtremelyOvervalued
    }
}

/// A model paired with the sigma calibrated from one historical series.
/// Rebuild it whenever the series or model changes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CalibrationContext {
    model: ModelParameters,
    estimate: SigmaEstimate,
}

impl CalibrationContext {
    pub fn new(model: ModelParameters, history: &[HistoricalPoint]) -> Self {
        let computed = calculate_sigma(history, &model);
        let estimate = if computed.count == 0 || computed.sigma <= 0.0 {
            SigmaEstimate {
                sigma: model.sigma,
                ..computed
            }
        } else {
            computed
        };
        info!(
            model = model.key,
            sigma = estimate.sigma,
            points = estimate.count,
            "calibrated model"
        );
        Self { model, estimate }
    }

    pub fn from_key(key: &str, history: &[HistoricalPoint]) -> EngineResult<Self> {
        Ok(Self::new(model_params(key)?, history))
    }

    pub fn model(&self) -> &ModelParameters {
        &self.model
    }

    pub fn estimate(&self) -> SigmaEstimate {
        self.estimate
    }

    pub fn sigma(&self) -> f64 {
        self.estimate.sigma
    }

    /// Live-market sigma-k, or `None` when no usable spot price is known.
    pub fn initial_k_for_spot(&self, spot: Option<f64>, date: NaiveDate) -> Option<f64> {
        let spot = spot.filter(|p| p.is_finite() && *p > 0.0)?;
        (self.model.trend_price(date) > 0.0)
            .then(|| self.model.sigma_k_for_price(spot, self.sigma(), date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn santostasi() -> ModelParameters {
        model_params("santostasi").expect("known model")
    }

    fn synthetic_history(model: &ModelParameters, offsets: &[f64]) -> Vec<HistoricalPoint> {
        offsets
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let d = date(2015, 1, 1) + Duration::days(30 * i as i64);
                HistoricalPoint {
                    date: d,
                    price: model.trend_price(d) * 10f64.powf(*k),
                }
            })
            .collect()
    }

    #[test]
    fn unknown_model_key_is_rejected() {
        let err = trend_price("stock-to-flow", date(2024, 1, 1)).expect_err("must fail");
        assert_eq!(
            err,
            EngineError::UnknownModel {
                key: "stock-to-flow".to_string()
            }
        );
    }

    #[test]
    fn trend_matches_closed_form() {
        let model = santostasi();
        let d = date(2024, 1, 1);
        let days = days_since_genesis(d) as f64;
        let expected = 10f64.powf(-17.01) * days.powf(5.82);
        assert_eq!(model.trend_price(d), expected);
    }

    #[test]
    fn trend_is_zero_at_and_before_genesis() {
        let model = santostasi();
        assert_eq!(model.trend_price(genesis_date()), 0.0);
        assert_eq!(model.trend_price(date(2008, 6, 1)), 0.0);
    }

    #[test]
    fn year_models_use_fractional_years() {
        let model = model_params("years").expect("known model");
        let d = date(2020, 1, 3);
        let t = days_since_genesis(d) as f64 / DAYS_PER_YEAR;
        assert_eq!(model.time_variable(d), t);
    }

    #[test]
    fn band_price_scales_by_sigma_multiple() {
        let model = santostasi();
        let d = date(2030, 1, 1);
        let trend = model.trend_price(d);
        let upper = model.band_price(0.2, 1.0, d);
        assert!((upper / trend - 10f64.powf(0.2)).abs() < 1e-12);
        assert_eq!(model.band_price(0.2, 0.0, d), trend);
    }

    #[test]
    fn sigma_of_constant_offset_is_zero_with_matching_mean() {
        let model = santostasi();
        let history = synthetic_history(&model, &[0.1; 12]);
        let estimate = calculate_sigma(&history, &model);
        assert_eq!(estimate.count, 12);
        assert!((estimate.mean - 0.1).abs() < 1e-9);
        assert!(estimate.sigma < 1e-9);
    }

    #[test]
    fn sigma_uses_population_deviation() {
        let model = santostasi();
        let history = synthetic_history(&model, &[0.2, -0.2, 0.2, -0.2]);
        let estimate = calculate_sigma(&history, &model);
        assert!((estimate.sigma - 0.2).abs() < 1e-9);
        assert!(estimate.mean.abs() < 1e-9);
    }

    #[test]
    fn sigma_skips_non_positive_points() {
        let model = santostasi();
        let mut history = synthetic_history(&model, &[0.2, -0.2]);
        history.push(HistoricalPoint {
            date: date(2016, 1, 1),
            price: 0.0,
        });
        history.push(HistoricalPoint {
            date: date(2008, 1, 1),
            price: 10.0,
        });
        let estimate = calculate_sigma(&history, &model);
        assert_eq!(estimate.count, 2);
    }

    #[test]
    fn sigma_is_bit_reproducible() {
        let model = santostasi();
        let history = synthetic_history(&model, &[0.31, -0.12, 0.05, 0.44, -0.29, 0.0]);
        assert_eq!(
            calculate_sigma(&history, &model),
            calculate_sigma(&history, &model)
        );
    }

    #[test]
    fn calibration_falls_back_to_canonical_sigma() {
        let context = CalibrationContext::from_key("perrenod", &[]).expect("known model");
        assert_eq!(context.sigma(), 0.22);
        assert_eq!(context.estimate().count, 0);
    }

    #[test]
    fn calibration_keeps_sample_stats_when_sigma_degenerates() {
        let model = santostasi();
        let history = synthetic_history(&model, &[0.3]);
        let context = CalibrationContext::new(model, &history);
        let estimate = context.estimate();
        assert_eq!(estimate.sigma, 0.20);
        assert_eq!(estimate.count, 1);
        assert!((estimate.mean - 0.3).abs() < 1e-9);
    }

    #[test]
    fn initial_k_is_absent_without_spot() {
        let context = CalibrationContext::from_key("santostasi", &[]).expect("known model");
        assert_eq!(context.initial_k_for_spot(None, date(2025, 1, 1)), None);
        assert_eq!(context.initial_k_for_spot(Some(-5.0), date(2025, 1, 1)), None);
    }

    #[test]
    fn initial_k_recovers_band_offset() {
        let context = CalibrationContext::from_key("santostasi", &[]).expect("known model");
        let d = date(2025, 6, 1);
        let spot = context.model().band_price(context.sigma(), -1.5, d);
        let k = context
            .initial_k_for_spot(Some(spot), d)
            .expect("spot is usable");
        assert!((k + 1.5).abs() < 1e-9);
    }

    #[test]
    fn valuation_breakpoints_are_exact() {
        assert_eq!(valuation_label(0.49), Valuation::ExtremelyUndervalued);
        assert_eq!(valuation_label(0.5), Valuation::Undervalued);
        assert_eq!(valuation_label(0.75), Valuation::Fair);
        assert_eq!(valuation_label(1.25), Valuation::Overvalued);
        assert_eq!(valuation_label(2.0), Valuation::HighlyOvervalued);
        assert_eq!(valuation_label(3.0), Valuation::ExtremelyOvervalued);
        assert_eq!(Valuation::Fair.label(), "fair");
    }

    #[test]
    fn fit_recovers_generating_parameters() {
        let model = santostasi();
        let history = synthetic_history(&model, &[0.0; 40]);
        let fit = fit_power_law(&history, false).expect("enough history");
        assert!((fit.beta - model.beta).abs() < 1e-6);
        assert!((fit.log_a - model.log_a).abs() < 1e-5);
        assert!(fit.r_squared > 0.999_999);
    }

    #[test]
    fn fit_rejects_single_point() {
        let model = santostasi();
        let history = synthetic_history(&model, &[0.0]);
        let err = fit_power_law(&history, false).expect_err("must fail");
        assert_eq!(err, EngineError::InsufficientHistory { needed: 2, got: 1 });
    }

    #[test]
    fn milestone_rejects_non_positive_target() {
        assert!(santostasi().milestone_date_for_price(0.0).is_err());
    }

    #[test]
    fn projection_emits_january_rows() {
        let rows = santostasi().projection(0.2, date(2025, 7, 1), 3);
        let dates = rows.iter().map(|r| r.date).collect::<Vec<_>>();
        assert_eq!(dates, vec![date(2026, 1, 1), date(2027, 1, 1), date(2028, 1, 1)]);
        assert!(rows.iter().all(|r| r.minus2 < r.minus1 && r.plus1 < r.plus2));
    }

    proptest! {
        #[test]
        fn prop_trend_is_strictly_increasing(
            model_idx in 0usize..3,
            start in 30i64..20_000,
            gap in 1i64..5_000,
        ) {
            let model = MODELS[model_idx];
            let d1 = genesis_date() + Duration::days(start);
            let d2 = d1 + Duration::days(gap);
            prop_assert!(model.trend_price(d2) > model.trend_price(d1));
        }

        #[test]
        fn prop_milestone_inverts_trend(model_idx in 0usize..3, days in 30i64..30_000) {
            let model = MODELS[model_idx];
            let d = genesis_date() + Duration::days(days);
            let back = model
                .milestone_date_for_price(model.trend_price(d))
                .expect("positive trend");
            prop_assert_eq!(back, d);
        }
    }
}
