//! Data Model
//!
//! メトリクスサンプル・履歴ウィンドウ・学習済みモデルの定義

mod record;
mod types;

pub use record::{MetricRecord, UnknownFieldPolicy};
pub use types::{
    group_by_metric, CorrelationProfile, DynamicThresholds, EntityId, MetricDomain, MetricName,
    MetricPair, MetricSample, MetricWindow, ModelKey, OutlierBounds, PairCorrelation,
    SeasonalProfile, StatisticalModel, Trend, TrendDirection,
};
