//! Pod session state machine.
//!
//! A `PodSession` covers one pod activation. It is built by replaying the
//! pod's status reports in chronological order, each one decoded into a
//! `SessionEvent`. From the resulting state the full delivery schedule can be
//! reconstructed tick by tick, including the parts no report ever described.
//!
//! ```text
//!   Empty --Start--> Active --Deactivate/Fail/Remove--> Ended
//! ```
//!
//! While active, a temp basal override and a bolus can each be open
//! independently. Once ended, the session ignores every further event.

use crate::series::{minute_of_seconds, TimeSeries};
use crate::ticks;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reservoir level (in quanta) the pod reports while more than 50 U remain
const RESERVOIR_SENTINEL_QUANTA: i64 = 1023;

/// Bolus pulses the pod delivers per minute, used for the completion estimate
const BOLUS_QUANTA_PER_MINUTE: i64 = 30;

// ============================================================================
// Settings and Events
// ============================================================================

/// Hardware constants of the pod model
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PodSettings {
    /// Size of one delivered pulse, U
    #[serde(default = "default_quantum")]
    pub quantum: f64,

    /// Hours after activation the pod keeps delivering basal
    #[serde(default = "default_lifetime_hours")]
    pub lifetime_hours: f64,

    /// Reservoir fill assumed until a report says otherwise, U
    #[serde(default = "default_initial_reservoir")]
    pub initial_reservoir: f64,
}

fn default_quantum() -> f64 {
    0.05
}

fn default_lifetime_hours() -> f64 {
    80.0
}

fn default_initial_reservoir() -> f64 {
    170.0
}

impl Default for PodSettings {
    fn default() -> Self {
        Self {
            quantum: default_quantum(),
            lifetime_hours: default_lifetime_hours(),
            initial_reservoir: default_initial_reservoir(),
        }
    }
}

/// Counters carried by every status report
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    /// Report time, epoch seconds
    pub at: f64,
    /// Pod active-minute counter
    pub minute: u32,
    /// Cumulative delivered units
    pub delivered: f64,
    /// Units of the running bolus not delivered yet
    pub undelivered: f64,
    /// Reported reservoir, units
    pub reservoir: f64,
}

/// One decoded telemetry event
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Start {
        reading: Reading,
        /// Programmed basal rate, U/h
        basal_rate: f64,
        /// Activation instant, epoch seconds
        activation: f64,
    },
    TempBasalStart {
        reading: Reading,
        rate: f64,
        minutes: u32,
    },
    TempBasalEnd {
        reading: Reading,
    },
    BolusStart {
        reading: Reading,
        /// Pulse interval in seconds, when the command set one
        interval: Option<f64>,
    },
    BolusEnd {
        reading: Reading,
    },
    Fail {
        reading: Reading,
        failed_minute: u32,
    },
    Deactivate {
        reading: Reading,
    },
    Entry {
        reading: Reading,
    },
    /// Session superseded without a deactivation report
    Remove,
}

impl SessionEvent {
    pub fn reading(&self) -> Option<&Reading> {
        match self {
            SessionEvent::Start { reading, .. }
            | SessionEvent::TempBasalStart { reading, .. }
            | SessionEvent::TempBasalEnd { reading }
            | SessionEvent::BolusStart { reading, .. }
            | SessionEvent::BolusEnd { reading }
            | SessionEvent::Fail { reading, .. }
            | SessionEvent::Deactivate { reading }
            | SessionEvent::Entry { reading } => Some(reading),
            SessionEvent::Remove => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Start { .. } => "start",
            SessionEvent::TempBasalStart { .. } => "temp_basal_start",
            SessionEvent::TempBasalEnd { .. } => "temp_basal_end",
            SessionEvent::BolusStart { .. } => "bolus_start",
            SessionEvent::BolusEnd { .. } => "bolus_end",
            SessionEvent::Fail { .. } => "fail",
            SessionEvent::Deactivate { .. } => "deactivate",
            SessionEvent::Entry { .. } => "entry",
            SessionEvent::Remove => "remove",
        }
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle phase of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Empty,
    Active,
    Ended,
}

/// An override or bolus still in progress, in pod minutes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OpenInterval {
    pub start_minute: u32,
    /// Estimated minute the pod finishes it
    pub end_minute: u32,
    pub total_quanta: i64,
}

/// A temp basal override window
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RateWindow {
    pub start: f64,
    pub end: f64,
    pub ticks_per_hour: u32,
}

/// A bolus as recorded, after any partial cancellation
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BolusDelivery {
    pub start: f64,
    pub quanta: i64,
    /// Seconds between pulses
    pub interval: f64,
}

/// Spread of `report time - active minutes` across all reports
///
/// A wide window means the pod clock and the reporting clock drifted apart.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BaselineWindow {
    pub min: f64,
    pub max: f64,
}

impl BaselineWindow {
    fn include(self, baseline: f64) -> Self {
        Self {
            min: self.min.min(baseline),
            max: self.max.max(baseline),
        }
    }

    pub fn drift(&self) -> f64 {
        self.max - self.min
    }
}

/// One scheduled micro-dose
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct InsulinDeliveryTick {
    /// Epoch seconds
    pub at: f64,
    pub units: f64,
}

/// Why an event did not change the session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    SessionEnded,
    OutOfOrder,
    NoReading,
}

/// Outcome of applying one event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The event changed the session state
    Applied,
    /// Only the report counters were recorded (unmatched close, repeated start)
    Heartbeat,
    Ignored(Rejection),
}

/// Reconstructed delivery state of one pod activation
#[derive(Clone, Debug, PartialEq)]
pub struct PodSession {
    pod_id: Option<String>,
    settings: PodSettings,
    phase: Phase,
    activation: Option<f64>,
    start: Option<f64>,
    start_delivered: i64,
    basal_ticks_per_hour: u32,
    overrides: Vec<RateWindow>,
    boluses: Vec<BolusDelivery>,
    open_override: Option<OpenInterval>,
    open_bolus: Option<OpenInterval>,
    end: Option<f64>,
    reservoir: i64,
    deliveries: BTreeMap<u32, i64>,
    baseline: Option<BaselineWindow>,
    last_reading: Option<Reading>,
}

impl Default for PodSession {
    fn default() -> Self {
        Self::new(PodSettings::default())
    }
}

/// Apply one event to a session and hand it back
pub fn reduce(mut session: PodSession, event: &SessionEvent) -> PodSession {
    session.apply(event);
    session
}

impl PodSession {
    pub fn new(settings: PodSettings) -> Self {
        let reservoir = (settings.initial_reservoir / settings.quantum).round() as i64;
        Self {
            pod_id: None,
            settings,
            phase: Phase::Empty,
            activation: None,
            start: None,
            start_delivered: 0,
            basal_ticks_per_hour: 0,
            overrides: Vec::new(),
            boluses: Vec::new(),
            open_override: None,
            open_bolus: None,
            end: None,
            reservoir,
            deliveries: BTreeMap::new(),
            baseline: None,
            last_reading: None,
        }
    }

    pub fn with_id(mut self, pod_id: impl Into<String>) -> Self {
        self.pod_id = Some(pod_id.into());
        self
    }

    /// Apply one event in place
    pub fn apply(&mut self, event: &SessionEvent) -> Transition {
        if self.phase == Phase::Ended {
            tracing::debug!(
                "Pod {:?}: ignoring {} after session end",
                self.pod_id,
                event.name()
            );
            return Transition::Ignored(Rejection::SessionEnded);
        }

        if let (Some(reading), Some(last)) = (event.reading(), self.last_reading.as_ref()) {
            if reading.at < last.at {
                tracing::warn!(
                    "Pod {:?}: ignoring out-of-order {} at {} (last report {})",
                    self.pod_id,
                    event.name(),
                    reading.at,
                    last.at
                );
                return Transition::Ignored(Rejection::OutOfOrder);
            }
        }

        let transition = match event {
            SessionEvent::Start {
                reading,
                basal_rate,
                activation,
            } => self.start(reading, *basal_rate, *activation),
            SessionEvent::TempBasalStart {
                reading,
                rate,
                minutes,
            } => self.temp_basal_start(reading, *rate, *minutes),
            SessionEvent::TempBasalEnd { reading } => self.temp_basal_end(reading),
            SessionEvent::BolusStart { reading, interval } => self.bolus_start(reading, *interval),
            SessionEvent::BolusEnd { reading } => self.bolus_end(reading),
            SessionEvent::Fail {
                reading,
                failed_minute,
            } => self.fail(reading, *failed_minute),
            SessionEvent::Deactivate { reading } => self.deactivate(reading),
            SessionEvent::Entry { reading } => {
                self.record(reading);
                Transition::Applied
            }
            SessionEvent::Remove => match self.last_reading {
                Some(reading) => self.deactivate(&reading),
                None => Transition::Ignored(Rejection::NoReading),
            },
        };

        tracing::debug!(
            "Pod {:?}: {} -> {:?} ({:?})",
            self.pod_id,
            event.name(),
            transition,
            self.phase
        );
        transition
    }

    /// Apply a sequence of events, stopping once the session ends
    pub fn replay<'a>(&mut self, events: impl IntoIterator<Item = &'a SessionEvent>) {
        for event in events {
            if self.phase == Phase::Ended {
                break;
            }
            self.apply(event);
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn start(&mut self, reading: &Reading, basal_rate: f64, activation: f64) -> Transition {
        if self.phase == Phase::Active {
            self.record(reading);
            return Transition::Heartbeat;
        }
        self.basal_ticks_per_hour = ticks::ticks_per_hour(basal_rate, self.settings.quantum);
        self.start_delivered = self.quanta(reading.delivered);
        self.start = Some(reading.at);
        self.activation = Some(activation);
        self.phase = Phase::Active;
        self.record(reading);
        Transition::Applied
    }

    fn temp_basal_start(&mut self, reading: &Reading, rate: f64, minutes: u32) -> Transition {
        self.truncate_override(reading.at);
        self.record(reading);
        self.open_override = Some(OpenInterval {
            start_minute: reading.minute,
            end_minute: reading.minute + minutes,
            total_quanta: self.quanta(rate * minutes as f64 / 60.0),
        });
        self.overrides.push(RateWindow {
            start: reading.at,
            end: reading.at + minutes as f64 * 60.0,
            ticks_per_hour: ticks::ticks_per_hour(rate, self.settings.quantum),
        });
        Transition::Applied
    }

    fn temp_basal_end(&mut self, reading: &Reading) -> Transition {
        self.record(reading);
        if self.open_override.take().is_none() {
            return Transition::Heartbeat;
        }
        self.truncate_override(reading.at);
        Transition::Applied
    }

    fn bolus_start(&mut self, reading: &Reading, interval: Option<f64>) -> Transition {
        self.record(reading);
        let quanta = self.quanta(reading.undelivered);
        self.open_bolus = Some(OpenInterval {
            start_minute: reading.minute,
            end_minute: reading.minute + (quanta / BOLUS_QUANTA_PER_MINUTE) as u32 + 1,
            total_quanta: quanta,
        });
        self.boluses.push(BolusDelivery {
            start: reading.at,
            quanta,
            interval: interval.unwrap_or(ticks::MIN_TICK_SPACING),
        });
        Transition::Applied
    }

    fn bolus_end(&mut self, reading: &Reading) -> Transition {
        self.record(reading);
        if self.open_bolus.is_none() {
            return Transition::Heartbeat;
        }
        self.cancel_bolus(reading.undelivered);
        Transition::Applied
    }

    fn fail(&mut self, reading: &Reading, failed_minute: u32) -> Transition {
        let failed_at = match self.activation {
            Some(activation) => activation + failed_minute as f64 * 60.0 + 59.0,
            None => reading.at,
        };
        let at_failure = Reading {
            minute: failed_minute,
            ..*reading
        };
        self.record(&at_failure);
        if self.open_bolus.is_some() {
            self.cancel_bolus(reading.undelivered);
        }
        if self.open_override.take().is_some() {
            self.truncate_override(reading.at.min(failed_at));
        }
        self.finish(failed_at);
        Transition::Applied
    }

    fn deactivate(&mut self, reading: &Reading) -> Transition {
        self.record(reading);
        if self.open_bolus.is_some() {
            self.cancel_bolus(reading.undelivered);
        }
        if self.open_override.take().is_some() {
            self.truncate_override(reading.at);
        }
        self.finish(reading.at);
        Transition::Applied
    }

    fn finish(&mut self, at: f64) {
        let end = match self.activation {
            Some(activation) => at.max(activation),
            None => at,
        };
        self.end = Some(end);
        self.phase = Phase::Ended;
    }

    fn truncate_override(&mut self, at: f64) {
        if let Some(last) = self.overrides.last_mut() {
            if last.end > at {
                last.end = at.max(last.start);
            }
        }
    }

    fn cancel_bolus(&mut self, undelivered: f64) {
        self.open_bolus = None;
        let remainder = self.quanta(undelivered);
        if let Some(last) = self.boluses.last_mut() {
            last.quanta = (last.quanta - remainder).max(0);
        }
    }

    /// Bookkeeping shared by every report
    fn record(&mut self, reading: &Reading) {
        self.last_reading = Some(*reading);
        let delivered = self.quanta(reading.delivered);
        self.deliveries.insert(reading.minute, delivered);
        self.update_reservoir(reading);

        let baseline = reading.at - reading.minute as f64 * 60.0;
        self.baseline = Some(match self.baseline {
            Some(window) => window.include(baseline),
            None => BaselineWindow {
                min: baseline,
                max: baseline,
            },
        });
    }

    fn update_reservoir(&mut self, reading: &Reading) {
        let reported = self.quanta(reading.reservoir);
        let fill = reported + self.quanta(reading.delivered);
        // a "50+ U" report cannot lower a fill level we already know
        if reported >= RESERVOIR_SENTINEL_QUANTA && fill < self.reservoir {
            return;
        }
        self.reservoir = fill;
    }

    fn quanta(&self, units: f64) -> i64 {
        (units / self.settings.quantum).round() as i64
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn pod_id(&self) -> Option<&str> {
        self.pod_id.as_deref()
    }

    pub fn settings(&self) -> &PodSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_ended(&self) -> bool {
        self.phase == Phase::Ended
    }

    pub fn activation(&self) -> Option<f64> {
        self.activation
    }

    pub fn start_time(&self) -> Option<f64> {
        self.start
    }

    pub fn end_time(&self) -> Option<f64> {
        self.end
    }

    /// Programmed basal rate, U/h
    pub fn basal_rate(&self) -> f64 {
        self.basal_ticks_per_hour as f64 * self.settings.quantum
    }

    pub fn overrides(&self) -> &[RateWindow] {
        &self.overrides
    }

    pub fn boluses(&self) -> &[BolusDelivery] {
        &self.boluses
    }

    pub fn open_override(&self) -> Option<&OpenInterval> {
        self.open_override.as_ref()
    }

    pub fn open_bolus(&self) -> Option<&OpenInterval> {
        self.open_bolus.as_ref()
    }

    pub fn last_reading(&self) -> Option<&Reading> {
        self.last_reading.as_ref()
    }

    pub fn baseline(&self) -> Option<&BaselineWindow> {
        self.baseline.as_ref()
    }

    /// Delivered units reported at a pod minute
    pub fn delivered_at_minute(&self, minute: u32) -> Option<f64> {
        self.deliveries
            .get(&minute)
            .map(|&q| q as f64 * self.settings.quantum)
    }

    /// Estimated initial fill of the reservoir, U
    pub fn reservoir_fill(&self) -> f64 {
        self.reservoir as f64 * self.settings.quantum
    }

    /// Estimated units left in the reservoir
    pub fn reservoir_remaining(&self) -> f64 {
        let delivered = self
            .last_reading
            .map(|r| self.quanta(r.delivered))
            .unwrap_or(0);
        (self.reservoir - delivered) as f64 * self.settings.quantum
    }

    /// Units reported delivered since the start report (priming excluded)
    pub fn delivered_since_start(&self) -> f64 {
        match (self.start, self.last_reading) {
            (Some(_), Some(reading)) => {
                (self.quanta(reading.delivered) - self.start_delivered) as f64
                    * self.settings.quantum
            }
            _ => 0.0,
        }
    }

    /// End of delivery: the recorded end, or the lifetime cap while running
    pub fn projected_end(&self) -> Option<f64> {
        match (self.end, self.activation) {
            (Some(end), _) => Some(end),
            (None, Some(activation)) => Some(activation + self.settings.lifetime_hours * 3600.0),
            (None, None) => None,
        }
    }

    // ------------------------------------------------------------------------
    // Reconstruction
    // ------------------------------------------------------------------------

    /// Reconstruct every delivered pulse of the session
    ///
    /// Basal runs between override windows at the programmed rate, each
    /// window at its own rate, then bolus pulses are slotted in. Running
    /// sessions are projected to the end of the pod lifetime.
    pub fn delivery_ticks(&self) -> Vec<InsulinDeliveryTick> {
        let units = self.settings.quantum;
        self.tick_instants()
            .into_iter()
            .map(|at| InsulinDeliveryTick { at, units })
            .collect()
    }

    fn tick_instants(&self) -> Vec<f64> {
        let (Some(start), Some(basal_end)) = (self.start, self.projected_end()) else {
            return Vec::new();
        };

        let mut instants = Vec::new();
        let basal_template = ticks::half_hour_ticks(self.basal_ticks_per_hour, 0.0);

        let mut basal_start = start;
        for window in &self.overrides {
            if window.start > basal_start {
                ticks::append_rate_ticks(basal_start, window.start, &basal_template, &mut instants);
            }
            let window_end = match self.end {
                Some(end) if window.end > end => end,
                _ => window.end,
            };
            if window_end > window.start {
                let template = ticks::half_hour_ticks(window.ticks_per_hour, 0.0);
                ticks::append_rate_ticks(window.start, window_end, &template, &mut instants);
            }
            basal_start = window_end;
        }
        ticks::append_rate_ticks(basal_start, basal_end, &basal_template, &mut instants);

        for bolus in &self.boluses {
            if bolus.quanta > 0 {
                ticks::insert_bolus_ticks_with_interval(
                    bolus.start,
                    bolus.quanta as u32,
                    bolus.interval,
                    &mut instants,
                );
            }
        }

        instants
    }

    /// Delivered units per minute, zero-filled between the first and last tick
    pub fn delivery_series(&self) -> TimeSeries<f64> {
        let instants = self.tick_instants();
        let (Some(&first), Some(&last)) = (instants.first(), instants.last()) else {
            return TimeSeries::empty(0);
        };
        let start = minute_of_seconds(first);
        let len = (minute_of_seconds(last) - start + 1) as usize;
        let mut values = vec![0.0; len];
        for at in instants {
            values[(minute_of_seconds(at) - start) as usize] += self.settings.quantum;
        }
        TimeSeries::from_values(start, values)
    }

    /// Effective delivery rate at an instant, U/h, `None` outside delivery
    pub fn rate_at(&self, at: f64) -> Option<f64> {
        let start = self.start?;
        let end = self.projected_end()?;
        if at < start || at >= end {
            return None;
        }
        let ticks_per_hour = self
            .overrides
            .iter()
            .rev()
            .find(|w| w.start <= at && at < w.end)
            .map(|w| w.ticks_per_hour)
            .unwrap_or(self.basal_ticks_per_hour);
        Some(ticks_per_hour as f64 * self.settings.quantum)
    }

    /// Bolus doses as `(start, units)`, canceled remainders removed
    pub fn bolus_doses(&self) -> Vec<(f64, f64)> {
        self.boluses
            .iter()
            .filter(|b| b.quanta > 0)
            .map(|b| (b.start, b.quanta as f64 * self.settings.quantum))
            .collect()
    }
}
