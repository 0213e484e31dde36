//! # anomaly-rs
//!
//! Per-entity, per-metric anomaly detection and forecasting engine.
//!
//! Baselines (statistical, seasonal and cross-metric correlation models) are trained
//! from historical samples on a fixed schedule. Live samples are scored against those
//! baselines and anomalies are forwarded to an alert sink. Short-horizon forecasts with
//! decaying confidence are produced on demand.

pub mod config;
pub mod detection;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod logging;
pub mod model;
pub mod prediction;
pub mod scheduler;
pub mod store;
pub mod training;

pub use engine::{AnomalyEngine, AnomalyEngineBuilder, EngineHandle};
pub use error::{Error, ErrorClass, Result};
