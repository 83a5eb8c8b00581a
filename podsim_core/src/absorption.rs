//! Subcutaneous insulin absorption.
//!
//! A two-channel depot: each minute's dose is split between a slow channel,
//! which passes through a transit stage before reaching circulation, and a
//! fast channel that transfers directly. Both depot pools lose insulin to
//! saturable local degradation. Transfer to circulation is scaled by an
//! availability factor that shrinks as the total depot mass grows.
//!
//! Amounts are in mU. Integration is forward Euler with a fixed number of
//! sub-steps per minute.

use crate::error::SimulationStage;
use crate::series::TimeSeries;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Kinetic constants of the depot model
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AbsorptionParams {
    /// Share of every dose entering the slow channel
    pub slow_fraction: f64,
    /// Slow channel transfer rate, 1/min (applies to both stages)
    pub slow_rate: f64,
    /// Fast channel transfer rate, 1/min
    pub fast_rate: f64,
    /// Local degradation capacity, mU/min
    pub degradation_max: f64,
    /// Pool size at half the degradation capacity, mU
    pub degradation_midpoint: f64,
    /// Coefficient of the availability factor
    pub availability_coefficient: f64,
    pub substeps: u32,
    /// Total depot mass (mU) below which the depot counts as drained
    pub drain_threshold: f64,
    /// Longest drain tail allowed after the last input minute
    pub max_drain_minutes: usize,
    /// Rescale the output so that total absorbed equals total delivered
    pub normalize_mass: bool,
}

impl Default for AbsorptionParams {
    fn default() -> Self {
        Self {
            slow_fraction: 0.67,
            slow_rate: 0.0112,
            fast_rate: 0.0210,
            degradation_max: 1.93,
            degradation_midpoint: 62.6,
            availability_coefficient: 0.009,
            substeps: 100,
            drain_threshold: 0.05,
            max_drain_minutes: 2880,
            normalize_mass: true,
        }
    }
}

/// Depot pool amounts, mU
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AbsorptionState {
    pub slow: f64,
    pub transit: f64,
    pub fast: f64,
}

impl AbsorptionState {
    pub fn total(&self) -> f64 {
        self.slow + self.transit + self.fast
    }

    fn is_valid(&self) -> bool {
        [self.slow, self.transit, self.fast]
            .iter()
            .all(|&amount| amount >= 0.0)
    }
}

/// Per-substep rate constants
struct SubstepRates {
    slow_fraction: f64,
    slow_rate: f64,
    fast_rate: f64,
    degradation_max: f64,
    degradation_midpoint: f64,
    availability_coefficient: f64,
}

impl SubstepRates {
    fn new(params: &AbsorptionParams) -> Self {
        let steps = params.substeps as f64;
        Self {
            slow_fraction: params.slow_fraction,
            slow_rate: params.slow_rate / steps,
            fast_rate: params.fast_rate / steps,
            degradation_max: params.degradation_max / steps,
            degradation_midpoint: params.degradation_midpoint,
            availability_coefficient: params.availability_coefficient,
        }
    }

    /// Bounded in (0, 1], decreasing with total depot mass
    fn availability(&self, total: f64) -> f64 {
        if total > 0.0 {
            1.0 / (total.powf(2.0 / 3.0) * self.availability_coefficient + 1.0)
        } else {
            1.0
        }
    }

    fn degradation(&self, amount: f64) -> f64 {
        self.degradation_max * amount / (self.degradation_midpoint + amount)
    }

    /// Advance one substep, returning the amount reaching circulation
    fn step(&self, state: &mut AbsorptionState, dose: f64) -> f64 {
        let availability = self.availability(state.total());

        let d_slow = self.slow_fraction * dose
            - self.slow_rate * state.slow
            - self.degradation(state.slow);
        let d_fast = (1.0 - self.slow_fraction) * dose
            - self.fast_rate * availability * state.fast
            - self.degradation(state.fast);
        let d_transit =
            self.slow_rate * availability * state.slow - self.slow_rate * availability * state.transit;
        let absorbed =
            self.slow_rate * availability * state.transit + self.fast_rate * availability * state.fast;

        state.slow += d_slow;
        state.fast += d_fast;
        state.transit += d_transit;
        absorbed
    }
}

impl AbsorptionParams {
    pub fn validate(&self) -> Result<()> {
        if self.substeps == 0 {
            return Err(Error::Config(
                "absorption substeps must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.slow_fraction) {
            return Err(Error::Config(format!(
                "absorption slow_fraction must be within [0, 1], got {}",
                self.slow_fraction
            )));
        }
        if self.degradation_midpoint <= 0.0 || self.drain_threshold <= 0.0 {
            return Err(Error::Config(
                "absorption degradation_midpoint and drain_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Turn per-minute doses (mU) into per-minute absorption into circulation (mU)
///
/// Gaps in the input count as zero dose. The output starts at the first input
/// minute and runs past the input until the depot has drained.
pub fn simulate_absorption(
    doses: &TimeSeries<f64>,
    params: &AbsorptionParams,
) -> Result<TimeSeries<f64>> {
    params.validate()?;
    if doses.is_empty() {
        return Ok(TimeSeries::empty(doses.start()));
    }

    let input = doses.dense(0.0);
    let rates = SubstepRates::new(params);
    let steps = params.substeps as f64;
    let limit = input.len() + params.max_drain_minutes;

    let mut state = AbsorptionState::default();
    let mut absorbed = Vec::with_capacity(input.len());
    let mut minute = 0;

    while minute < input.len() || state.total() > params.drain_threshold {
        if minute >= limit {
            return Err(Error::DrainTimeout {
                minutes: params.max_drain_minutes,
            });
        }

        let dose = input.get(minute).copied().unwrap_or(0.0) / steps;
        let mut reached = 0.0;
        for _ in 0..params.substeps {
            reached += rates.step(&mut state, dose);
            if !state.is_valid() || reached.is_nan() || reached < 0.0 {
                return Err(Error::NumericInstability {
                    stage: SimulationStage::Absorption,
                    minute,
                });
            }
        }
        absorbed.push(reached);
        minute += 1;
    }

    if params.normalize_mass {
        let delivered: f64 = input.iter().sum();
        let total: f64 = absorbed.iter().sum();
        if delivered > 0.0 && total > 0.0 {
            let scale = delivered / total;
            absorbed.iter_mut().for_each(|v| *v *= scale);
        }
    }

    tracing::debug!(
        "Absorption: {} input minutes, {} minute drain tail",
        input.len(),
        absorbed.len() - input.len()
    );

    Ok(TimeSeries::from_values(doses.start(), absorbed))
}
