//! Glucose rate-of-change estimation.
//!
//! A Savitzky–Golay differentiator: every sample's derivative comes from a
//! least-squares polynomial fitted over the window around it. Near the edges
//! of a run the first or last full window is reused and evaluated off-center,
//! so the derivative is defined everywhere without padding.
//!
//! Runs separated by gaps are filtered independently.

use crate::series::TimeSeries;
use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Singular values below this are treated as zero in the fit
const PSEUDO_INVERSE_EPSILON: f64 = 1e-10;

/// Filter configuration
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrendParams {
    /// Window length in samples, odd
    pub window: usize,
    pub order: usize,
    /// Sample spacing in minutes
    pub delta: f64,
    /// Fit order for the second derivative; `None` skips it
    pub acceleration_order: Option<usize>,
    /// Rescale the rate so its integral matches the observed change
    pub correct_bias: bool,
}

impl Default for TrendParams {
    fn default() -> Self {
        Self {
            window: 41,
            order: 2,
            delta: 1.0,
            acceleration_order: Some(3),
            correct_bias: true,
        }
    }
}

/// Smoothed glucose derivatives
#[derive(Clone, Debug, PartialEq)]
pub struct GlucoseTrend {
    /// First derivative, mg/dl per minute
    pub rate: TimeSeries<f64>,
    /// Second derivative, mg/dl per minute²
    pub acceleration: Option<TimeSeries<f64>>,
    /// Scalar applied to `rate` by the bias correction
    pub correction: f64,
}

/// A least-squares polynomial differentiator
#[derive(Clone, Debug)]
pub struct SavitzkyGolay {
    window: usize,
    order: usize,
    deriv: usize,
    delta: f64,
    /// Pseudo-inverse of the full-window design matrix
    fit: DMatrix<f64>,
}

impl SavitzkyGolay {
    pub fn new(window: usize, order: usize, deriv: usize, delta: f64) -> Result<Self> {
        if window < 3 || window % 2 == 0 {
            return Err(Error::Trend(format!(
                "window must be odd and at least 3, got {}",
                window
            )));
        }
        if order >= window {
            return Err(Error::Trend(format!(
                "polynomial order {} must be below the window {}",
                order, window
            )));
        }
        if deriv > order {
            return Err(Error::Trend(format!(
                "derivative {} exceeds polynomial order {}",
                deriv, order
            )));
        }
        if delta <= 0.0 {
            return Err(Error::Trend(format!("delta must be positive, got {}", delta)));
        }

        Ok(Self {
            window,
            order,
            deriv,
            delta,
            fit: fit_matrix(window, order)?,
        })
    }

    /// Derivative of a gap-free run, `None` when the run is too short
    ///
    /// Runs shorter than the window are fitted whole, with the polynomial
    /// order reduced to what the run supports.
    pub fn apply(&self, run: &[f64]) -> Result<Option<Vec<f64>>> {
        let len = run.len();
        if len >= self.window {
            return Ok(Some(self.sliding(run)));
        }

        let order = self.order.min(len.saturating_sub(1));
        if len < 2 || order < self.deriv {
            return Ok(None);
        }
        let fit = fit_matrix(len, order)?;
        let coefficients = &fit * DVector::from_column_slice(run);
        let center = (len - 1) as f64 / 2.0;
        let derivative = (0..len)
            .map(|i| self.evaluate(&coefficients, i as f64 - center))
            .collect();
        Ok(Some(derivative))
    }

    fn sliding(&self, run: &[f64]) -> Vec<f64> {
        let half = self.window / 2;
        let last_start = run.len() - self.window;

        (0..run.len())
            .map(|i| {
                let start = i.saturating_sub(half).min(last_start);
                let samples = DVector::from_column_slice(&run[start..start + self.window]);
                let coefficients = &self.fit * samples;
                self.evaluate(&coefficients, i as f64 - (start + half) as f64)
            })
            .collect()
    }

    /// `deriv`-th derivative of the fitted polynomial at offset `x`
    fn evaluate(&self, coefficients: &DVector<f64>, x: f64) -> f64 {
        let total: f64 = coefficients
            .iter()
            .enumerate()
            .skip(self.deriv)
            .map(|(j, c)| {
                let falling: f64 = ((j - self.deriv + 1)..=j).map(|k| k as f64).product();
                c * falling * x.powi((j - self.deriv) as i32)
            })
            .sum();
        total / self.delta.powi(self.deriv as i32)
    }
}

/// Least-squares fit matrix for `len` samples centered on zero
fn fit_matrix(len: usize, order: usize) -> Result<DMatrix<f64>> {
    let center = (len - 1) as f64 / 2.0;
    let design = DMatrix::from_fn(len, order + 1, |row, col| {
        (row as f64 - center).powi(col as i32)
    });
    design
        .pseudo_inverse(PSEUDO_INVERSE_EPSILON)
        .map_err(|e| Error::Trend(format!("polynomial fit failed: {}", e)))
}

/// Gap-free runs as `(offset, values)`
fn runs(series: &TimeSeries<f64>) -> Vec<(usize, Vec<f64>)> {
    let mut runs = Vec::new();
    let mut current: Option<(usize, Vec<f64>)> = None;

    for (i, value) in series.values().iter().enumerate() {
        match (value, current.as_mut()) {
            (Some(v), Some((_, run))) => run.push(*v),
            (Some(v), None) => current = Some((i, vec![*v])),
            (None, _) => {
                if let Some(run) = current.take() {
                    runs.push(run);
                }
            }
        }
    }
    if let Some(run) = current {
        runs.push(run);
    }
    runs
}

/// Apply a filter to every gap-free run of a series
pub fn differentiate(series: &TimeSeries<f64>, filter: &SavitzkyGolay) -> Result<TimeSeries<f64>> {
    let mut values = vec![None; series.len()];
    for (offset, run) in runs(series) {
        if let Some(derivative) = filter.apply(&run)? {
            for (i, d) in derivative.into_iter().enumerate() {
                values[offset + i] = Some(d);
            }
        }
    }
    Ok(TimeSeries::from_options(series.start(), values))
}

/// Scalar making the derivative's integral match the observed change
///
/// Integrals are trapezoidal over each gap-free run. Returns 1.0 when the
/// integral is negligible against the derivative's magnitude.
fn bias_correction(glucose: &TimeSeries<f64>, rate: &TimeSeries<f64>, delta: f64) -> f64 {
    let mut observed = 0.0;
    let mut integral = 0.0;
    let mut magnitude = 0.0;

    for (offset, run) in runs(glucose) {
        let derivative: Vec<f64> = (offset..offset + run.len())
            .filter_map(|i| rate.values().get(i).copied().flatten())
            .collect();
        if derivative.len() != run.len() || run.len() < 2 {
            continue;
        }
        observed += run[run.len() - 1] - run[0];
        integral += derivative
            .windows(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0 * delta)
            .sum::<f64>();
        magnitude += derivative.iter().map(|d| d.abs() * delta).sum::<f64>();
    }

    if magnitude == 0.0 || integral.abs() <= 1e-6 * magnitude {
        return 1.0;
    }
    observed / integral
}

/// Estimate glucose rate of change (and optionally acceleration)
pub fn estimate_trend(glucose: &TimeSeries<f64>, params: &TrendParams) -> Result<GlucoseTrend> {
    let filter = SavitzkyGolay::new(params.window, params.order, 1, params.delta)?;
    let mut rate = differentiate(glucose, &filter)?;

    let correction = if params.correct_bias {
        bias_correction(glucose, &rate, params.delta)
    } else {
        1.0
    };
    if correction != 1.0 {
        rate = rate.map(|d| d * correction);
    }

    let acceleration = match params.acceleration_order {
        Some(order) => {
            let filter = SavitzkyGolay::new(params.window, order, 2, params.delta)?;
            Some(differentiate(glucose, &filter)?)
        }
        None => None,
    };

    tracing::debug!(
        "Glucose trend over {} minutes, correction {:.4}",
        glucose.len(),
        correction
    );

    Ok(GlucoseTrend {
        rate,
        acceleration,
        correction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_all_close(series: &TimeSeries<f64>, expected: impl Fn(usize) -> f64, tol: f64) {
        for (i, value) in series.values().iter().enumerate() {
            let value = value.unwrap_or_else(|| panic!("missing derivative at {}", i));
            assert!(
                (value - expected(i)).abs() < tol,
                "at {}: {} vs {}",
                i,
                value,
                expected(i)
            );
        }
    }

    #[test]
    fn test_constant_series_has_zero_rate() {
        let glucose = TimeSeries::from_values(0, vec![120.0; 180]);
        let trend = estimate_trend(&glucose, &TrendParams::default()).unwrap();
        assert_all_close(&trend.rate, |_| 0.0, 1e-9);
    }

    #[test]
    fn test_ramp_has_constant_rate() {
        let glucose = TimeSeries::from_values(0, (0..200).map(|i| 100.0 + 0.5 * i as f64));
        let trend = estimate_trend(&glucose, &TrendParams::default()).unwrap();

        assert_all_close(&trend.rate, |_| 0.5, 1e-6);
        assert!((trend.correction - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_quadratic_edges_are_exact() {
        let glucose = TimeSeries::from_values(0, (0..100).map(|i| (i as f64).powi(2) / 10.0));
        let trend = estimate_trend(&glucose, &TrendParams::default()).unwrap();

        assert_all_close(&trend.rate, |i| i as f64 / 5.0, 1e-6);
        let acceleration = trend.acceleration.unwrap();
        assert_all_close(&acceleration, |_| 0.2, 1e-6);
    }

    #[test]
    fn test_delta_scales_derivative() {
        let glucose = TimeSeries::from_values(0, (0..100).map(|i| i as f64));
        let params = TrendParams {
            delta: 5.0,
            ..TrendParams::default()
        };
        let trend = estimate_trend(&glucose, &params).unwrap();
        assert_all_close(&trend.rate, |_| 0.2, 1e-6);
    }

    #[test]
    fn test_runs_filtered_independently() {
        let mut values: Vec<Option<f64>> = (0..60).map(|i| Some(i as f64)).collect();
        values.push(None);
        values.extend((0..10).map(|i| Some(200.0 - 2.0 * i as f64)));
        values.push(None);
        values.push(Some(50.0));
        let glucose = TimeSeries::from_options(1_000, values);

        let trend = estimate_trend(
            &glucose,
            &TrendParams {
                correct_bias: false,
                ..TrendParams::default()
            },
        )
        .unwrap();

        assert_eq!(trend.rate.start(), 1_000);
        assert!((trend.rate.get(1_010).unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(trend.rate.get(1_060), None);
        // short run fitted whole
        assert!((trend.rate.get(1_065).unwrap() + 2.0).abs() < 1e-6);
        // isolated sample has no derivative
        assert_eq!(trend.rate.get(1_072), None);
    }

    #[test]
    fn test_corrected_rate_integrates_to_observed_change() {
        let glucose =
            TimeSeries::from_values(0, (0..150).map(|i| 100.0 + 30.0 * (i as f64 / 15.0).sin()));
        let trend = estimate_trend(&glucose, &TrendParams::default()).unwrap();
        let observed = glucose.get(149).unwrap() - glucose.get(0).unwrap();

        let integral: f64 = trend
            .rate
            .dense(0.0)
            .windows(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0)
            .sum();
        assert!((integral - observed).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_window() {
        assert!(matches!(SavitzkyGolay::new(40, 2, 1, 1.0), Err(Error::Trend(_))));
        assert!(matches!(SavitzkyGolay::new(5, 5, 1, 1.0), Err(Error::Trend(_))));
        assert!(matches!(SavitzkyGolay::new(5, 1, 2, 1.0), Err(Error::Trend(_))));
    }

    #[test]
    fn test_empty_series() {
        let trend = estimate_trend(&TimeSeries::empty(0), &TrendParams::default()).unwrap();
        assert!(trend.rate.is_empty());
        assert_eq!(trend.correction, 1.0);
    }
}
