//! Data model assembly.
//!
//! Wires the pieces together for one display window: pod sessions and manual
//! injections become infusion series, infusion runs through absorption and
//! action, glucose through the trend estimator, and both into the effect
//! forecast. The result is one row per minute of the window.
//!
//! Simulation starts 24 hours before the window so that insulin delivered
//! earlier is already on board when the window opens.

use crate::absorption::{simulate_absorption, AbsorptionParams};
use crate::action::{simulate_action, ActionParams, CompartmentAmounts};
use crate::effect::{combine_effect, predict_effect, EffectParams};
use crate::series::{epoch_seconds, minute_of, minute_start, TimeSeries};
use crate::session::{PodSession, Reading, SessionEvent};
use crate::trend::{estimate_trend, TrendParams};
use crate::types::{ManualInjection, PatientParameters};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Minutes simulated ahead of the window start
pub const PRECURSOR_MINUTES: i64 = 24 * 60;

/// mU per U
const MILLI_UNITS: f64 = 1000.0;

/// Parameters of every pipeline stage
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelParams {
    #[serde(default)]
    pub absorption: AbsorptionParams,
    #[serde(default)]
    pub action: ActionParams,
    #[serde(default)]
    pub trend: TrendParams,
    #[serde(default)]
    pub effect: EffectParams,
}

/// Display window in unix minutes, `end` inclusive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelWindow {
    pub start: i64,
    pub now: i64,
    pub end: i64,
}

impl ModelWindow {
    /// Window of `hours_prev` before and `hours_next` after `now`
    pub fn around(now: DateTime<Utc>, hours_prev: u32, hours_next: u32) -> Self {
        let now_minute = minute_of(now);
        Self {
            start: minute_of(now - Duration::hours(hours_prev as i64)),
            now: now_minute,
            end: minute_of(now + Duration::hours(hours_next as i64)),
        }
    }

    pub fn precursor_start(&self) -> i64 {
        self.start - PRECURSOR_MINUTES
    }

    /// Whether any part of `[from, to]` (epoch seconds) falls in the simulated range
    pub fn overlaps(&self, from: f64, to: f64) -> bool {
        let range_start = epoch_seconds(minute_start(self.precursor_start()));
        let range_end = epoch_seconds(minute_start(self.end + 1));
        from < range_end && to >= range_start
    }
}

/// A hypothetical change applied to running pods from `now` on
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WhatIf {
    Suspend { minutes: u32 },
    TempBasal { rate: f64, minutes: u32 },
}

impl WhatIf {
    /// Clone of `session` with the change programmed at `at`
    ///
    /// Ended sessions and sessions without a reading are returned unchanged.
    pub fn project(&self, session: &PodSession, at: f64) -> PodSession {
        let mut projected = session.clone();
        let Some(last) = session.last_reading().copied() else {
            return projected;
        };
        if session.is_ended() {
            return projected;
        }

        let (rate, minutes) = match *self {
            WhatIf::Suspend { minutes } => (0.0, minutes),
            WhatIf::TempBasal { rate, minutes } => (rate, minutes),
        };
        let at = at.max(last.at);
        let elapsed = ((at - last.at) / 60.0).floor() as u32;
        let reading = Reading {
            at,
            minute: last.minute + elapsed,
            ..last
        };
        projected.apply(&SessionEvent::TempBasalStart {
            reading,
            rate,
            minutes,
        });
        projected
    }
}

/// Everything the pipeline consumes
#[derive(Clone, Copy, Debug)]
pub struct ModelInputs<'a> {
    pub sessions: &'a [PodSession],
    pub injections: &'a [ManualInjection],
    /// Per-minute glucose, mg/dl
    pub glucose: &'a TimeSeries<f64>,
    pub patient: PatientParameters,
}

/// One minute of the data model; insulin amounts in U
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelRow {
    pub timestamp: DateTime<Utc>,
    pub glucose: Option<f64>,
    pub glucose_rate: Option<f64>,
    pub glucose_acceleration: Option<f64>,
    /// U/h summed over running pods
    pub infusion_rate: Option<f64>,
    pub bolus: Option<f64>,
    /// Infused since the precursor start
    pub infusion_total: f64,
    /// Absorbed since the precursor start
    pub absorbed_total: f64,
    pub plasma: f64,
    pub hepatic: f64,
    pub interstitial: f64,
    pub liver_bound: f64,
    pub peripheral_bound: f64,
    pub insulin_on_board: f64,
    pub effect: Option<f64>,
    pub effect_forecast: Option<f64>,
}

/// Assembled per-minute model of one window
#[derive(Clone, Debug, PartialEq)]
pub struct DataModel {
    pub window: ModelWindow,
    pub rows: Vec<ModelRow>,
    /// Level of the flat effect forecast
    pub effect_floor: f64,
}

impl DataModel {
    pub fn row_at(&self, minute: i64) -> Option<&ModelRow> {
        if minute < self.window.start {
            return None;
        }
        self.rows.get((minute - self.window.start) as usize)
    }

    /// Row at the window's `now`
    pub fn current(&self) -> Option<&ModelRow> {
        self.row_at(self.window.now)
    }
}

fn bolus_series(sessions: &[PodSession], injections: &[ManualInjection]) -> TimeSeries<f64> {
    let mut boluses = TimeSeries::empty(0);
    for session in sessions {
        for (at, units) in session.bolus_doses() {
            boluses.accumulate((at / 60.0).floor() as i64, units);
        }
    }
    for injection in injections {
        boluses.accumulate(minute_of(injection.timestamp), injection.units);
    }
    boluses
}

fn infusion_rate(sessions: &[PodSession], minute: i64) -> Option<f64> {
    let at = epoch_seconds(minute_start(minute));
    sessions
        .iter()
        .filter_map(|s| s.rate_at(at))
        .fold(None, |total, rate| Some(total.unwrap_or(0.0) + rate))
}

/// Build the per-minute data model for `window`
pub fn build_data_model(
    inputs: &ModelInputs<'_>,
    window: ModelWindow,
    params: &ModelParams,
    what_if: Option<WhatIf>,
) -> Result<DataModel> {
    let precursor = window.precursor_start();
    let now_seconds = epoch_seconds(minute_start(window.now));

    let sessions: Vec<PodSession> = inputs
        .sessions
        .iter()
        .map(|s| match what_if {
            Some(change) if !s.is_ended() => change.project(s, now_seconds),
            _ => s.clone(),
        })
        .collect();

    tracing::info!(
        "Building data model: {} pod sessions, {} injections, minutes {}..={}",
        sessions.len(),
        inputs.injections.len(),
        window.start,
        window.end
    );

    // Infusion, one series per source
    let mut infusions: Vec<TimeSeries<f64>> = sessions
        .iter()
        .map(PodSession::delivery_series)
        .filter(|series| !series.is_empty())
        .collect();
    for injection in inputs.injections {
        infusions.push(TimeSeries::from_values(
            minute_of(injection.timestamp),
            vec![injection.units],
        ));
    }

    let mut infusion = TimeSeries::empty(precursor);
    let mut absorbed = TimeSeries::empty(precursor);
    for series in &infusions {
        infusion = infusion.add(series);
        let doses = series.map(|units| units * MILLI_UNITS);
        absorbed = absorbed.add(&simulate_absorption(&doses, &params.absorption)?);
    }

    // Action runs from the first absorbed minute so earlier insulin is carried in
    let action_start = if absorbed.is_empty() {
        precursor
    } else {
        absorbed.start().min(precursor)
    };
    let action = simulate_action(
        &absorbed.window(action_start, window.end + 1),
        &inputs.patient,
        &params.action,
    )?;
    let compartments = action.map(|q| q.scaled(1.0 / MILLI_UNITS));
    tracing::info!("Simulated insulin action over {} minutes", compartments.len());

    let glucose = inputs.glucose.window(precursor, window.end + 1);
    let trend = estimate_trend(&glucose, &params.trend)?;

    let free_insulin = compartments.map(CompartmentAmounts::free);
    let effect = combine_effect(&free_insulin, &trend.rate, &params.effect);
    let prediction = predict_effect(&effect, window.end, &params.effect);

    let infusion_total = infusion.window(precursor, window.end + 1).cumulative();
    let absorbed_total = absorbed
        .map(|mu| mu / MILLI_UNITS)
        .window(precursor, window.end + 1)
        .cumulative();
    let boluses = bolus_series(&sessions, inputs.injections);

    let rows = (window.start..=window.end)
        .map(|minute| {
            let amounts = compartments.get(minute).copied().unwrap_or_default();
            ModelRow {
                timestamp: minute_start(minute),
                glucose: glucose.get(minute).copied(),
                glucose_rate: trend.rate.get(minute).copied(),
                glucose_acceleration: trend
                    .acceleration
                    .as_ref()
                    .and_then(|a| a.get(minute).copied()),
                infusion_rate: infusion_rate(&sessions, minute),
                bolus: boluses.get(minute).copied(),
                infusion_total: infusion_total.get(minute).copied().unwrap_or(0.0),
                absorbed_total: absorbed_total.get(minute).copied().unwrap_or(0.0),
                plasma: amounts.plasma,
                hepatic: amounts.hepatic,
                interstitial: amounts.interstitial,
                liver_bound: amounts.liver_bound,
                peripheral_bound: amounts.peripheral_bound,
                insulin_on_board: amounts.on_board(),
                effect: prediction.history.get(minute).copied(),
                effect_forecast: prediction.forecast.get(minute).copied(),
            }
        })
        .collect();

    Ok(DataModel {
        window,
        rows,
        effect_floor: prediction.floor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::from_epoch_seconds;
    use crate::session::PodSettings;

    /// Midnight, 2024-03-01 UTC
    const DAY_START: f64 = 1_709_251_200.0;

    fn reading(minute: u32, delivered: f64) -> Reading {
        Reading {
            at: DAY_START + minute as f64 * 60.0,
            minute,
            delivered,
            undelivered: 0.0,
            reservoir: 51.15,
        }
    }

    fn basal_session(rate: f64, hours: u32, ended: bool) -> PodSession {
        let mut session = PodSession::new(PodSettings::default()).with_id("pod");
        session.apply(&SessionEvent::Start {
            reading: reading(0, 0.0),
            basal_rate: rate,
            activation: DAY_START,
        });
        if ended {
            session.apply(&SessionEvent::Deactivate {
                reading: reading(hours * 60, rate * hours as f64),
            });
        }
        session
    }

    fn plasma_curve(session: &PodSession) -> Vec<f64> {
        let doses = session.delivery_series().map(|u| u * MILLI_UNITS);
        let absorbed = simulate_absorption(&doses, &AbsorptionParams::default()).unwrap();
        let padded = absorbed.window(absorbed.start(), doses.start() + 36 * 60);
        simulate_action(&padded, &PatientParameters::default(), &ActionParams::default())
            .unwrap()
            .values()
            .iter()
            .flatten()
            .map(|q| q.plasma)
            .collect()
    }

    #[test]
    fn test_basal_day_plasma_plateaus() {
        let plasma = plasma_curve(&basal_session(1.0, 24, true));

        assert!(plasma.iter().all(|&q| q >= 0.0));
        let early = plasma[2 * 60];
        let hour_20 = plasma[20 * 60];
        let hour_23 = plasma[23 * 60 + 30];
        assert!(early < hour_20, "plasma did not rise: {} vs {}", early, hour_20);
        assert!(
            ((hour_23 - hour_20) / hour_20).abs() < 0.05,
            "no plateau: {} vs {}",
            hour_20,
            hour_23
        );
        // cleared once delivery stops
        assert!(plasma[35 * 60] < hour_20 * 0.1);
    }

    #[test]
    fn test_plasma_integral_scales_with_delivery() {
        let single: f64 = plasma_curve(&basal_session(1.0, 24, true)).iter().sum();
        let double: f64 = plasma_curve(&basal_session(2.0, 24, true)).iter().sum();

        let ratio = double / single;
        assert!((1.7..=2.3).contains(&ratio), "ratio = {}", ratio);
    }

    fn glucose_ramp(from: i64, to: i64) -> TimeSeries<f64> {
        TimeSeries::from_values(from, (from..to).map(|m| 100.0 + 0.1 * (m - from) as f64))
    }

    #[test]
    fn test_build_data_model_rows() {
        crate::logging::init_test();
        let sessions = vec![basal_session(1.0, 24, false)];
        let now = from_epoch_seconds(DAY_START + 12.0 * 3600.0);
        let window = ModelWindow::around(now, 3, 2);
        let glucose = glucose_ramp(window.precursor_start(), window.now + 1);
        let injections = vec![ManualInjection {
            timestamp: from_epoch_seconds(DAY_START + 10.0 * 3600.0),
            units: 2.0,
        }];
        let inputs = ModelInputs {
            sessions: &sessions,
            injections: &injections,
            glucose: &glucose,
            patient: PatientParameters::default(),
        };

        let model = build_data_model(&inputs, window, &ModelParams::default(), None).unwrap();

        assert_eq!(model.rows.len(), 5 * 60 + 1);
        assert_eq!(model.rows[0].timestamp, minute_start(window.start));

        let current = model.current().unwrap();
        assert!(current.glucose.is_some());
        assert!((current.glucose_rate.unwrap() - 0.1).abs() < 1e-6);
        assert_eq!(current.infusion_rate, Some(1.0));
        assert!(current.insulin_on_board > 0.0);
        assert!(current.effect.is_some());
        assert_eq!(current.effect_forecast, None);

        let injected = model.row_at(minute_of(injections[0].timestamp)).unwrap();
        assert_eq!(injected.bolus, Some(2.0));

        for pair in model.rows.windows(2) {
            assert!(pair[1].infusion_total >= pair[0].infusion_total);
            assert!(pair[1].absorbed_total >= pair[0].absorbed_total - 1e-12);
        }

        let after = model.row_at(window.now + 30).unwrap();
        assert_eq!(after.glucose, None);
        assert_eq!(after.effect, None);
        assert_eq!(after.effect_forecast, Some(model.effect_floor));
        assert!(model.rows.last().unwrap().effect_forecast.is_some());
    }

    #[test]
    fn test_suspend_what_if_stops_infusion() {
        let sessions = vec![basal_session(1.0, 24, false)];
        let now = from_epoch_seconds(DAY_START + 12.0 * 3600.0);
        let window = ModelWindow::around(now, 1, 2);
        let glucose = glucose_ramp(window.precursor_start(), window.now + 1);
        let inputs = ModelInputs {
            sessions: &sessions,
            injections: &[],
            glucose: &glucose,
            patient: PatientParameters::default(),
        };
        let params = ModelParams::default();

        let baseline = build_data_model(&inputs, window, &params, None).unwrap();
        let suspended = build_data_model(
            &inputs,
            window,
            &params,
            Some(WhatIf::Suspend { minutes: 60 }),
        )
        .unwrap();

        let during = window.now + 30;
        assert_eq!(suspended.row_at(during).unwrap().infusion_rate, Some(0.0));
        assert_eq!(baseline.row_at(during).unwrap().infusion_rate, Some(1.0));
        assert_eq!(suspended.row_at(window.now + 90).unwrap().infusion_rate, Some(1.0));

        let last = window.end;
        assert!(
            suspended.row_at(last).unwrap().infusion_total
                < baseline.row_at(last).unwrap().infusion_total
        );
        // the source session is untouched
        assert!(sessions[0].overrides().is_empty());
    }

    #[test]
    fn test_what_if_leaves_ended_sessions() {
        let session = basal_session(1.0, 2, true);
        let projected = WhatIf::TempBasal {
            rate: 3.0,
            minutes: 30,
        }
        .project(&session, DAY_START + 3.0 * 3600.0);
        assert_eq!(projected, session);
    }

    #[test]
    fn test_window_overlap() {
        let now = from_epoch_seconds(DAY_START + 48.0 * 3600.0);
        let window = ModelWindow::around(now, 6, 6);

        assert!(window.overlaps(DAY_START, DAY_START + 30.0 * 3600.0));
        assert!(!window.overlaps(DAY_START, DAY_START + 3600.0));
        assert!(!window.overlaps(DAY_START + 60.0 * 3600.0, DAY_START + 70.0 * 3600.0));
    }
}
