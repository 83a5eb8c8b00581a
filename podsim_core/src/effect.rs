//! Glycemic effect and its forecast.
//!
//! The effect series adds scaled free insulin to the scaled glucose rate of
//! change. Past the last minute where both are known, the forecast stays flat
//! at the lowest effect seen in the trailing gap-free run.

use crate::series::TimeSeries;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EffectParams {
    /// Weight of free insulin, per U
    pub insulin_scale: f64,
    /// Weight of the glucose rate, per mg/dl/min
    pub glucose_scale: f64,
    /// Trailing runs shorter than this are logged as weak evidence, minutes
    pub min_trusted_run: usize,
}

impl Default for EffectParams {
    fn default() -> Self {
        Self {
            insulin_scale: 1.0,
            glucose_scale: 1.0 / 28.0,
            min_trusted_run: 15,
        }
    }
}

/// Effect history plus its flat continuation
#[derive(Clone, Debug, PartialEq)]
pub struct EffectPrediction {
    pub history: TimeSeries<f64>,
    /// Starts the minute after the last known effect
    pub forecast: TimeSeries<f64>,
    /// Level of the forecast
    pub floor: f64,
}

/// Effect for every minute where both inputs are known
pub fn combine_effect(
    free_insulin: &TimeSeries<f64>,
    glucose_rate: &TimeSeries<f64>,
    params: &EffectParams,
) -> TimeSeries<f64> {
    if free_insulin.is_empty() || glucose_rate.is_empty() {
        return TimeSeries::empty(free_insulin.start());
    }
    let start = free_insulin.start().min(glucose_rate.start());
    let end = free_insulin.end().max(glucose_rate.end());
    let values = (start..end)
        .map(|minute| match (free_insulin.get(minute), glucose_rate.get(minute)) {
            (Some(insulin), Some(rate)) => {
                Some(params.insulin_scale * insulin + params.glucose_scale * rate)
            }
            _ => None,
        })
        .collect();
    TimeSeries::from_options(start, values)
}

/// Extend an effect series flat up to `horizon` (inclusive)
pub fn predict_effect(effect: &TimeSeries<f64>, horizon: i64, params: &EffectParams) -> EffectPrediction {
    let Some(last) = effect.last_valid_minute() else {
        tracing::warn!("No effect history, forecasting a flat zero");
        let start = effect.start();
        return EffectPrediction {
            history: effect.clone(),
            forecast: flat(start, horizon, 0.0),
            floor: 0.0,
        };
    };

    let mut run_start = last;
    while run_start > effect.start() && effect.get(run_start - 1).is_some() {
        run_start -= 1;
    }
    let run_len = (last - run_start + 1) as usize;

    if run_len < params.min_trusted_run {
        tracing::warn!(
            "Trailing effect run of {} minutes is shorter than {}, forecast rests on little history",
            run_len,
            params.min_trusted_run
        );
    }
    let floor = minimum((run_start..=last).filter_map(|m| effect.get(m).copied()));

    tracing::debug!(
        "Effect forecast from minute {} at {:.4} (trailing run {} minutes)",
        last + 1,
        floor,
        run_len
    );

    EffectPrediction {
        history: effect.window(effect.start(), last + 1),
        forecast: flat(last + 1, horizon, floor),
        floor,
    }
}

fn minimum(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(f64::INFINITY, f64::min)
}

fn flat(start: i64, horizon: i64, level: f64) -> TimeSeries<f64> {
    let len = (horizon - start + 1).max(0) as usize;
    TimeSeries::from_values(start, vec![level; len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_requires_both_inputs() {
        let insulin = TimeSeries::from_values(0, vec![1.0, 1.0, 1.0, 1.0]);
        let rate = TimeSeries::from_options(1, vec![Some(28.0), None, Some(-28.0)]);
        let effect = combine_effect(&insulin, &rate, &EffectParams::default());

        assert_eq!(effect.get(0), None);
        assert!((effect.get(1).unwrap() - 2.0).abs() < 1e-12);
        assert_eq!(effect.get(2), None);
        assert!(effect.get(3).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_forecast_is_flat_at_trailing_minimum() {
        let mut values: Vec<Option<f64>> = vec![Some(-50.0); 10];
        values.push(None);
        values.extend((0..30).map(|i| Some(5.0 + (i as f64 / 3.0).sin())));
        let effect = TimeSeries::from_options(100, values);
        let trailing_min = (0..30)
            .map(|i| 5.0 + (i as f64 / 3.0).sin())
            .fold(f64::INFINITY, f64::min);

        let prediction = predict_effect(&effect, 200, &EffectParams::default());

        assert_eq!(prediction.forecast.start(), 141);
        assert_eq!(prediction.forecast.end(), 201);
        assert_eq!(prediction.floor, trailing_min);
        assert!(prediction
            .forecast
            .values()
            .iter()
            .all(|v| *v == Some(trailing_min)));
    }

    #[test]
    fn test_short_run_never_drops_below_trailing_minimum() {
        crate::logging::init_test();
        let mut values: Vec<Option<f64>> = vec![Some(-3.0); 40];
        values.push(None);
        values.extend(vec![Some(2.0); 10]);
        let effect = TimeSeries::from_options(0, values);

        let prediction = predict_effect(&effect, 80, &EffectParams::default());
        assert_eq!(prediction.floor, 2.0);
        assert_eq!(prediction.forecast.start(), 51);
        assert!(prediction.forecast.values().iter().flatten().all(|v| *v >= 2.0));
    }

    #[test]
    fn test_no_history_forecasts_zero() {
        crate::logging::init_test();
        let effect = TimeSeries::from_options(10, vec![None, None]);
        let prediction = predict_effect(&effect, 14, &EffectParams::default());

        assert_eq!(prediction.floor, 0.0);
        assert_eq!(prediction.forecast.dense(f64::NAN), vec![0.0; 5]);
    }

    #[test]
    fn test_history_ends_at_last_known_minute() {
        let effect = TimeSeries::from_options(0, vec![Some(1.0); 20]);
        let prediction = predict_effect(&effect, 10, &EffectParams::default());

        assert_eq!(prediction.history.end(), 20);
        assert!(prediction.forecast.is_empty());
    }
}
