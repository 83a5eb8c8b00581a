#![forbid(unsafe_code)]

//! Core domain model and simulation pipeline for podsim.
//!
//! This crate provides:
//! - Pod session reconstruction from delivery reports
//! - Insulin absorption and action compartment models
//! - Glucose trend estimation and insulin effect prediction
//! - Persistence (JSONL pod history, CSV records and export)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod series;
pub mod ticks;
pub mod session;
pub mod absorption;
pub mod action;
pub mod trend;
pub mod effect;
pub mod model;
pub mod telemetry;
pub mod records;
pub mod export;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use series::TimeSeries;
pub use session::{reduce, PodSession, PodSettings, SessionEvent, Transition};
pub use absorption::simulate_absorption;
pub use action::simulate_action;
pub use trend::estimate_trend;
pub use effect::{combine_effect, predict_effect};
pub use model::{build_data_model, DataModel, ModelInputs, ModelWindow, WhatIf};
pub use telemetry::{load_pod_sessions, replay_events};
