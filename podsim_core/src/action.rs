//! Insulin distribution across body compartments.
//!
//! Five compartments: plasma, hepatic, interstitial, and the liver and
//! peripheral binding sites. Plasma exchanges linearly with the hepatic and
//! interstitial pools; the binding sites take up insulin at a rate that
//! saturates as they fill. Volumes scale with body weight, and the
//! plasma-interstitial exchange scales with cardiac output estimated from
//! body surface area.

use crate::error::SimulationStage;
use crate::series::TimeSeries;
use crate::types::PatientParameters;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Rate constants (1/min) and per-kg capacities of the compartment model
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionParams {
    pub plasma_clearance: f64,
    pub plasma_to_hepatic: f64,
    pub liver_binding: f64,
    pub liver_release: f64,
    pub liver_degradation: f64,
    /// Liver binding capacity, mU/kg
    pub liver_capacity: f64,
    /// Peripheral binding capacity, mU/kg
    pub peripheral_capacity: f64,
    /// ml/kg
    pub plasma_volume: f64,
    /// ml/kg
    pub hepatic_volume: f64,
    /// ml/kg
    pub interstitial_volume: f64,
    /// ml/min per m² of body surface
    pub cardiac_index: f64,
    /// Share of cardiac output exchanging with the interstitium
    pub exchange_fraction: f64,
    pub substeps: u32,
}

impl Default for ActionParams {
    fn default() -> Self {
        Self {
            plasma_clearance: 0.041,
            plasma_to_hepatic: 0.037,
            liver_binding: 0.790,
            liver_release: 0.150,
            liver_degradation: 0.021,
            liver_capacity: 127.0,
            peripheral_capacity: 82.0,
            plasma_volume: 45.05,
            hepatic_volume: 150.0,
            interstitial_volume: 4.95,
            cardiac_index: 1760.0,
            exchange_fraction: 0.3,
            substeps: 100,
        }
    }
}

impl ActionParams {
    pub fn validate(&self) -> Result<()> {
        if self.substeps == 0 {
            return Err(Error::Config("action substeps must be at least 1".into()));
        }
        let sizes = [
            ("liver_capacity", self.liver_capacity),
            ("peripheral_capacity", self.peripheral_capacity),
            ("plasma_volume", self.plasma_volume),
            ("hepatic_volume", self.hepatic_volume),
            ("interstitial_volume", self.interstitial_volume),
        ];
        for (name, value) in sizes {
            if value <= 0.0 {
                return Err(Error::Config(format!(
                    "action {} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Insulin amounts per compartment
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CompartmentAmounts {
    pub plasma: f64,
    pub hepatic: f64,
    pub interstitial: f64,
    pub liver_bound: f64,
    pub peripheral_bound: f64,
}

impl CompartmentAmounts {
    /// Unbound insulin, available for action
    pub fn free(&self) -> f64 {
        self.plasma + self.hepatic + self.interstitial
    }

    pub fn bound(&self) -> f64 {
        self.liver_bound + self.peripheral_bound
    }

    /// Everything not yet cleared or degraded
    pub fn on_board(&self) -> f64 {
        self.free() + self.bound()
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            plasma: self.plasma * factor,
            hepatic: self.hepatic * factor,
            interstitial: self.interstitial * factor,
            liver_bound: self.liver_bound * factor,
            peripheral_bound: self.peripheral_bound * factor,
        }
    }

    fn is_valid(&self) -> bool {
        [
            self.plasma,
            self.hepatic,
            self.interstitial,
            self.liver_bound,
            self.peripheral_bound,
        ]
        .iter()
        .all(|&amount| amount >= 0.0)
    }
}

/// Per-substep exchange constants for one patient
struct ExchangeRates {
    k01: f64,
    k21: f64,
    k12: f64,
    k31: f64,
    k13: f64,
    k42: f64,
    k24: f64,
    k04: f64,
    k53: f64,
    k35: f64,
    k05: f64,
    liver_capacity: f64,
    peripheral_capacity: f64,
}

impl ExchangeRates {
    fn new(patient: &PatientParameters, params: &ActionParams) -> Self {
        let steps = params.substeps as f64;
        let weight = patient.weight_kg;

        let plasma_volume = params.plasma_volume * weight;
        let hepatic_volume = params.hepatic_volume * weight;
        let interstitial_volume = params.interstitial_volume * weight;
        let liver_capacity = params.liver_capacity * weight;
        let peripheral_capacity = params.peripheral_capacity * weight;
        let cardiac_output = params.cardiac_index * patient.body_surface_area();

        let k21 = params.plasma_to_hepatic / steps;
        let k42 = params.liver_binding / steps;
        let k24 = params.liver_release / steps;
        let k04 = params.liver_degradation / steps;

        Self {
            k01: params.plasma_clearance / steps,
            k21,
            k12: k21 * plasma_volume / hepatic_volume,
            k31: params.exchange_fraction * cardiac_output / plasma_volume / steps,
            k13: params.exchange_fraction * cardiac_output / interstitial_volume / steps,
            k42,
            k24,
            k04,
            // peripheral binding mirrors the liver, scaled by pool sizes
            k53: k42 * hepatic_volume * peripheral_capacity / (liver_capacity * interstitial_volume),
            k35: k24,
            k05: k04,
            liver_capacity,
            peripheral_capacity,
        }
    }

    fn step(&self, q: &mut CompartmentAmounts, input: f64) {
        let liver_free = (1.0 - q.liver_bound / self.liver_capacity).clamp(0.0, 1.0);
        let peripheral_free = (1.0 - q.peripheral_bound / self.peripheral_capacity).clamp(0.0, 1.0);

        let d_plasma = -(self.k01 + self.k21 + self.k31) * q.plasma
            + self.k12 * q.hepatic
            + self.k13 * q.interstitial
            + input;
        let d_hepatic = self.k21 * q.plasma - self.k12 * q.hepatic
            - self.k42 * liver_free * q.hepatic
            + self.k24 * q.liver_bound;
        let d_interstitial = self.k31 * q.plasma - self.k13 * q.interstitial
            - self.k53 * peripheral_free * q.interstitial
            + self.k35 * q.peripheral_bound;
        let d_liver = self.k42 * liver_free * q.hepatic - (self.k04 + self.k24) * q.liver_bound;
        let d_peripheral =
            self.k53 * peripheral_free * q.interstitial - (self.k05 + self.k35) * q.peripheral_bound;

        q.plasma += d_plasma;
        q.hepatic += d_hepatic;
        q.interstitial += d_interstitial;
        q.liver_bound += d_liver;
        q.peripheral_bound += d_peripheral;
    }
}

/// Distribute absorbed insulin (mU/min) across the five compartments
///
/// Produces one `CompartmentAmounts` (mU) per input minute, gaps counted as
/// zero input. The output is exactly as long as the input: callers wanting
/// the tail after the last dose must pad the input.
pub fn simulate_action(
    absorbed: &TimeSeries<f64>,
    patient: &PatientParameters,
    params: &ActionParams,
) -> Result<TimeSeries<CompartmentAmounts>> {
    params.validate()?;
    if patient.weight_kg <= 0.0 || patient.height_cm <= 0.0 {
        return Err(Error::Config(format!(
            "patient weight and height must be positive, got {} kg / {} cm",
            patient.weight_kg, patient.height_cm
        )));
    }

    let rates = ExchangeRates::new(patient, params);
    let steps = params.substeps as f64;
    let mut state = CompartmentAmounts::default();
    let mut amounts = Vec::with_capacity(absorbed.len());

    for (minute, input) in absorbed.dense(0.0).into_iter().enumerate() {
        let input = input / steps;
        for _ in 0..params.substeps {
            rates.step(&mut state, input);
            if !state.is_valid() {
                return Err(Error::NumericInstability {
                    stage: SimulationStage::Action,
                    minute,
                });
            }
        }
        amounts.push(state);
    }

    tracing::debug!(
        "Action: {} minutes for {} kg / {} cm",
        amounts.len(),
        patient.weight_kg,
        patient.height_cm
    );

    Ok(TimeSeries::from_values(absorbed.start(), amounts))
}
