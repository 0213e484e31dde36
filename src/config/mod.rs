//! Configuration Module
//!
//! エンジン設定の定義・読み込み・検証

mod loader;
mod types;

pub use loader::ConfigLoader;
pub use types::{
    AppConfig, DetectionConfig, EngineConfig, ForecastConfig, IngestionConfig, LoggingConfig,
    MetricSpec, SchedulerConfig, TrainingConfig, MAX_DURATION_SECS, MAX_FORECAST_HORIZON,
};
