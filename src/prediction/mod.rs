//! Forecasting Module
//!
//! 学習済みベースラインからの短期予測と予測アラート

mod forecaster;
mod types;

pub use forecaster::Forecaster;
pub use types::{Forecast, ForecastPoint, ForecastRange, RiskLevel};
