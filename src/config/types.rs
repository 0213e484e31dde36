use crate::error::{Error, Result};
use crate::model::{MetricDomain, MetricName, UnknownFieldPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// 秒指定の設定値の上限（100年）
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3600;

/// 予測ステップ数の上限
pub const MAX_FORECAST_HORIZON: usize = 10_000;

/// 上限で丸めてから chrono の期間へ変換する
fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine settings
    pub engine: EngineConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error or an EnvFilter directive)
    pub level: String,

    /// Log directory for file output
    pub log_dir: Option<PathBuf>,

    /// Rotation: daily, hourly or never
    pub rotation: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Emit JSON formatted lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            rotation: "daily".to_string(),
            console: true,
            file: false,
            json: false,
        }
    }
}

/// Immutable engine settings supplied at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Baseline training settings
    pub training: TrainingConfig,

    /// Real-time scoring settings
    pub detection: DetectionConfig,

    /// Forecast settings
    pub forecast: ForecastConfig,

    /// Periodic driver settings
    pub scheduler: SchedulerConfig,

    /// Tracked metrics and their valid domains
    pub metrics: Vec<MetricSpec>,

    /// Ingestion schema settings
    pub ingestion: IngestionConfig,

    /// Directory for persisted models (None disables persistence)
    pub persistence_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            training: TrainingConfig::default(),
            detection: DetectionConfig::default(),
            forecast: ForecastConfig::default(),
            scheduler: SchedulerConfig::default(),
            metrics: vec![
                MetricSpec::new("cpu_usage", MetricDomain::bounded(0.0, 100.0)),
                MetricSpec::new("memory_usage", MetricDomain::bounded(0.0, 100.0)),
                MetricSpec::new("disk_usage", MetricDomain::bounded(0.0, 100.0)),
                MetricSpec::new("network_io", MetricDomain::non_negative()),
            ],
            ingestion: IngestionConfig::default(),
            persistence_dir: None,
        }
    }
}

/// Tracked metric definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Metric name
    pub name: MetricName,

    /// Valid value domain
    #[serde(default)]
    pub domain: MetricDomain,
}

impl MetricSpec {
    pub fn new(name: impl Into<MetricName>, domain: MetricDomain) -> Self {
        Self {
            name: name.into(),
            domain,
        }
    }
}

/// Baseline training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Minimum samples required before a model is built
    pub min_data_points: usize,

    /// Historical window length in seconds
    pub history_window_secs: u64,

    /// Moving-average window sizes
    pub moving_average_windows: Vec<usize>,

    /// Slope magnitude separating stable from trending
    pub trend_stability_threshold: f64,

    /// Tukey fence multiplier
    pub iqr_multiplier: f64,

    /// Sigma multiplier for the warning threshold
    pub warning_sigma: f64,

    /// Sigma multiplier for the critical threshold
    pub critical_sigma: f64,

    /// Sigma multiplier for the anomaly boundary
    pub anomaly_boundary_sigma: f64,

    /// Minimum aligned samples for a correlation coefficient
    pub min_correlation_points: usize,

    /// Minimum time span covered before seasonal decomposition runs
    pub seasonal_min_span_secs: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_data_points: 100,
            history_window_secs: 7 * 24 * 3600,
            moving_average_windows: vec![5, 10, 20],
            trend_stability_threshold: 0.1,
            iqr_multiplier: 1.5,
            warning_sigma: 2.0,
            critical_sigma: 3.0,
            anomaly_boundary_sigma: 2.5,
            min_correlation_points: 10,
            seasonal_min_span_secs: 24 * 3600,
        }
    }
}

impl TrainingConfig {
    pub fn history_window(&self) -> chrono::Duration {
        bounded_seconds(self.history_window_secs)
    }

    pub fn seasonal_min_span(&self) -> chrono::Duration {
        bounded_seconds(self.seasonal_min_span_secs)
    }
}

/// Real-time scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Sigma distance mapped to a score of 1.0
    pub score_sigma_scale: f64,

    /// Scores above this emit a HIGH event
    pub emission_cutoff: f64,

    /// Scores above this emit a CRITICAL event
    pub critical_cutoff: f64,

    /// Relative deviation above which a correlation event is emitted
    pub correlation_deviation_cutoff: f64,

    /// Relative deviation above which a correlation event is HIGH
    pub correlation_high_cutoff: f64,

    /// Pairs with |r| below this are not checked
    pub min_correlation_strength: f64,

    /// Look-back window for the latest live values, in seconds
    pub lookback_secs: u64,

    /// Recorded scores kept per key
    pub score_history_size: usize,

    /// Emit events for forecasts that breach thresholds
    pub predictive_alerts: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            score_sigma_scale: 3.0,
            emission_cutoff: 0.8,
            critical_cutoff: 0.95,
            correlation_deviation_cutoff: 0.3,
            correlation_high_cutoff: 0.5,
            min_correlation_strength: 0.0,
            lookback_secs: 300,
            score_history_size: 1000,
            predictive_alerts: false,
        }
    }
}

impl DetectionConfig {
    pub fn lookback(&self) -> chrono::Duration {
        bounded_seconds(self.lookback_secs)
    }
}

/// Forecast configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Default number of steps
    pub default_horizon: usize,

    /// Time between forecast steps in seconds
    pub step_secs: u64,

    /// Confidence floor
    pub min_confidence: f64,

    /// Confidence lost across the full horizon
    pub confidence_decay: f64,

    /// Weight of the hour-of-day pattern
    pub hourly_weight: f64,

    /// Weight of the day-of-week pattern
    pub daily_weight: f64,

    /// Confidence required before a forecast raises an event
    pub predictive_alert_confidence: f64,

    /// Points below this confidence are marked uncertain
    pub uncertain_confidence: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            default_horizon: 30,
            step_secs: 3600,
            min_confidence: 0.5,
            confidence_decay: 0.5,
            hourly_weight: 0.7,
            daily_weight: 0.3,
            predictive_alert_confidence: 0.7,
            uncertain_confidence: 0.3,
        }
    }
}

impl ForecastConfig {
    pub fn step(&self) -> chrono::Duration {
        bounded_seconds(self.step_secs)
    }
}

/// Periodic driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Training cycle interval in seconds
    pub training_interval_secs: u64,

    /// Detection scan interval in seconds
    pub detection_interval_secs: u64,

    /// Upper bound for one entity's training
    pub entity_training_timeout_secs: u64,

    /// Entities processed in parallel
    pub max_concurrent_entities: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            training_interval_secs: 24 * 3600,
            detection_interval_secs: 300,
            entity_training_timeout_secs: 60,
            max_concurrent_entities: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn training_interval(&self) -> Duration {
        Duration::from_secs(self.training_interval_secs)
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs(self.detection_interval_secs)
    }

    pub fn entity_training_timeout(&self) -> Duration {
        Duration::from_secs(self.entity_training_timeout_secs)
    }
}

/// Ingestion configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Policy for fields outside the record schema
    pub unknown_fields: UnknownFieldPolicy,
}

impl EngineConfig {
    /// Look up a tracked metric
    pub fn metric(&self, name: &MetricName) -> Option<&MetricSpec> {
        self.metrics.iter().find(|m| &m.name == name)
    }

    /// Names of all tracked metrics
    pub fn metric_names(&self) -> Vec<MetricName> {
        self.metrics.iter().map(|m| m.name.clone()).collect()
    }

    /// Domain of a metric (unbounded when untracked)
    pub fn domain(&self, name: &MetricName) -> MetricDomain {
        self.metric(name).map(|m| m.domain).unwrap_or_default()
    }

    /// Validate all settings, rejecting anything out of range
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        ensure(t.min_data_points >= 4, "training.min_data_points must be >= 4")?;
        ensure(t.history_window_secs > 0, "training.history_window_secs must be > 0")?;
        ensure(
            t.history_window_secs <= MAX_DURATION_SECS
                && t.seasonal_min_span_secs <= MAX_DURATION_SECS,
            "training durations must not exceed 100 years",
        )?;
        ensure(
            t.moving_average_windows.iter().all(|w| *w > 0),
            "training.moving_average_windows must be positive",
        )?;
        ensure(
            t.trend_stability_threshold >= 0.0,
            "training.trend_stability_threshold must be >= 0",
        )?;
        ensure(t.iqr_multiplier > 0.0, "training.iqr_multiplier must be > 0")?;
        ensure(
            t.warning_sigma > 0.0 && t.critical_sigma > 0.0 && t.anomaly_boundary_sigma > 0.0,
            "training sigma multipliers must be > 0",
        )?;
        ensure(
            t.warning_sigma <= t.critical_sigma,
            "training.warning_sigma must not exceed training.critical_sigma",
        )?;
        ensure(
            t.min_correlation_points >= 2,
            "training.min_correlation_points must be >= 2",
        )?;

        let d = &self.detection;
        ensure(d.score_sigma_scale > 0.0, "detection.score_sigma_scale must be > 0")?;
        ensure(
            in_unit_interval(d.emission_cutoff) && in_unit_interval(d.critical_cutoff),
            "detection cutoffs must be within (0, 1]",
        )?;
        ensure(
            d.emission_cutoff <= d.critical_cutoff,
            "detection.emission_cutoff must not exceed detection.critical_cutoff",
        )?;
        ensure(
            d.correlation_deviation_cutoff > 0.0
                && d.correlation_deviation_cutoff <= d.correlation_high_cutoff,
            "detection correlation cutoffs must satisfy 0 < deviation <= high",
        )?;
        ensure(
            (0.0..=1.0).contains(&d.min_correlation_strength),
            "detection.min_correlation_strength must be within [0, 1]",
        )?;
        ensure(
            d.lookback_secs > 0 && d.lookback_secs <= MAX_DURATION_SECS,
            "detection.lookback_secs must be within (0, 100 years]",
        )?;
        ensure(
            d.score_history_size > 0,
            "detection.score_history_size must be > 0",
        )?;

        let f = &self.forecast;
        ensure(
            f.default_horizon > 0 && f.default_horizon <= MAX_FORECAST_HORIZON,
            &format!("forecast.default_horizon must be within 1..={}", MAX_FORECAST_HORIZON),
        )?;
        ensure(
            f.step_secs > 0 && f.step_secs <= MAX_DURATION_SECS,
            "forecast.step_secs must be within (0, 100 years]",
        )?;
        ensure(
            (0.0..=1.0).contains(&f.min_confidence) && (0.0..=1.0).contains(&f.confidence_decay),
            "forecast confidence settings must be within [0, 1]",
        )?;
        ensure(
            (0.0..=1.0).contains(&f.hourly_weight) && (0.0..=1.0).contains(&f.daily_weight),
            "forecast seasonal weights must be within [0, 1]",
        )?;
        ensure(
            (0.0..=1.0).contains(&f.predictive_alert_confidence)
                && (0.0..=1.0).contains(&f.uncertain_confidence),
            "forecast alert confidences must be within [0, 1]",
        )?;

        let s = &self.scheduler;
        ensure(
            s.training_interval_secs > 0 && s.detection_interval_secs > 0,
            "scheduler intervals must be > 0",
        )?;
        ensure(
            s.entity_training_timeout_secs > 0,
            "scheduler.entity_training_timeout_secs must be > 0",
        )?;
        ensure(
            [
                s.training_interval_secs,
                s.detection_interval_secs,
                s.entity_training_timeout_secs,
            ]
            .iter()
            .all(|secs| *secs <= MAX_DURATION_SECS),
            "scheduler durations must not exceed 100 years",
        )?;
        ensure(
            s.max_concurrent_entities > 0,
            "scheduler.max_concurrent_entities must be > 0",
        )?;

        ensure(!self.metrics.is_empty(), "at least one metric must be tracked")?;
        let mut seen = HashSet::new();
        for spec in &self.metrics {
            ensure(
                seen.insert(&spec.name),
                &format!("metric {} is listed twice", spec.name),
            )?;
            if let (Some(min), Some(max)) = (spec.domain.min, spec.domain.max) {
                ensure(
                    min < max,
                    &format!("metric {} has an empty domain [{}, {}]", spec.name, min, max),
                )?;
            }
        }

        Ok(())
    }
}

fn in_unit_interval(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Configuration(message.to_string()))
    }
}
