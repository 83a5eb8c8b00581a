//! Core domain types for podsim.
//!
//! This module defines the records that cross the boundary into the core:
//! - Pump status reports and the command they acknowledge
//! - Manual injection records
//! - Patient parameters used by the action model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Pump Telemetry
// ============================================================================

/// Kind of the last command a status report acknowledges
///
/// Commands without their own transition (alerts, acknowledgements, ...)
/// read as `Status`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "String")]
pub enum CommandKind {
    #[serde(rename = "START")]
    Start,
    #[serde(rename = "TEMPBASAL")]
    TempBasal,
    #[serde(rename = "TEMPBASAL_CANCEL")]
    TempBasalCancel,
    #[serde(rename = "BOLUS")]
    Bolus,
    #[serde(rename = "BOLUS_CANCEL")]
    BolusCancel,
    #[serde(rename = "DEACTIVATE")]
    Deactivate,
    #[serde(rename = "STATUS")]
    Status,
}

impl From<String> for CommandKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "START" => CommandKind::Start,
            "TEMPBASAL" => CommandKind::TempBasal,
            "TEMPBASAL_CANCEL" => CommandKind::TempBasalCancel,
            "BOLUS" => CommandKind::Bolus,
            "BOLUS_CANCEL" => CommandKind::BolusCancel,
            "DEACTIVATE" => CommandKind::Deactivate,
            _ => CommandKind::Status,
        }
    }
}

/// Command parameters; only the fields relevant to the kind are present
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct CommandParameters {
    /// Basal schedule programmed at START, U/h
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hourly_rates: Vec<f64>,

    /// Temp basal rate, U/h
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_rate: Option<f64>,

    /// Temp basal duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_hours: Option<f64>,

    /// Bolus pulse interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
}

/// The command a status report was produced for
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PumpCommand {
    pub kind: CommandKind,
    #[serde(default)]
    pub parameters: CommandParameters,
    pub success: bool,
}

/// One raw pump status report
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeliveryEvent {
    pub timestamp: DateTime<Utc>,
    /// Minutes since activation as counted by the pod
    pub active_minute: u32,
    /// Cumulative delivered units
    pub delivered_units: f64,
    /// Units of the current bolus not yet delivered (or canceled)
    pub canceled_units: f64,
    /// Remaining reservoir; the pod reports 51.15 while above 50 U
    pub reservoir_units: f64,
    pub last_command: PumpCommand,
    #[serde(default)]
    pub fault: bool,
    #[serde(default)]
    pub fault_minute: Option<u32>,
    /// Activation date, carried by START reports
    #[serde(default)]
    pub activation_date: Option<DateTime<Utc>>,
}

// ============================================================================
// Other Inputs
// ============================================================================

/// Insulin injected by pen or syringe outside any pod
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManualInjection {
    pub timestamp: DateTime<Utc>,
    pub units: f64,
}

/// Body size used to scale compartment volumes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatientParameters {
    pub weight_kg: f64,
    pub height_cm: f64,
}

impl Default for PatientParameters {
    fn default() -> Self {
        Self {
            weight_kg: 50.0,
            height_cm: 140.0,
        }
    }
}

impl PatientParameters {
    /// Du Bois body surface area in m²
    pub fn body_surface_area(&self) -> f64 {
        0.007184 * self.weight_kg.powf(0.425) * self.height_cm.powf(0.725)
    }
}
