//! Model Types
//!
//! エンティティ・メトリクス・学習済みモデルの型定義

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 監視対象エンティティID（ホスト・サービスインスタンス）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// メトリクス名
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricName(String);

impl MetricName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MetricName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// 統計モデルの複合キー（エンティティ, メトリクス）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub entity_id: EntityId,
    pub metric: MetricName,
}

impl ModelKey {
    pub fn new(entity_id: EntityId, metric: MetricName) -> Self {
        Self { entity_id, metric }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_id, self.metric)
    }
}

/// 順序なしメトリクスペア
///
/// 常に `first <= second` に正規化されるため、(A, B) と (B, A) は同じキーになる。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricPair {
    first: MetricName,
    second: MetricName,
}

impl MetricPair {
    pub fn new(a: MetricName, b: MetricName) -> Self {
        if a <= b {
            Self {
                first: a,
                second: b,
            }
        } else {
            Self {
                first: b,
                second: a,
            }
        }
    }

    pub fn first(&self) -> &MetricName {
        &self.first
    }

    pub fn second(&self) -> &MetricName {
        &self.second
    }
}

impl fmt::Display for MetricPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.first, self.second)
    }
}

/// メトリクスの有効値域
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricDomain {
    /// 下限（None = 無制限）
    pub min: Option<f64>,
    /// 上限（None = 無制限）
    pub max: Option<f64>,
}

impl MetricDomain {
    pub fn bounded(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn non_negative() -> Self {
        Self {
            min: Some(0.0),
            max: None,
        }
    }

    /// 値域内に収める
    pub fn clamp(&self, value: f64) -> f64 {
        let lower = self.min.unwrap_or(f64::NEG_INFINITY);
        let upper = self.max.unwrap_or(f64::INFINITY);
        value.max(lower).min(upper)
    }
}

/// メトリクスサンプル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub entity_id: EntityId,
    pub metric: MetricName,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl MetricSample {
    pub fn new(
        entity_id: impl Into<EntityId>,
        metric: impl Into<MetricName>,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric: metric.into(),
            timestamp,
            value,
        }
    }
}

/// 時系列順に並んだ履歴ウィンドウ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricWindow {
    samples: Vec<MetricSample>,
}

impl MetricWindow {
    /// サンプルを時系列順（安定ソート）に並べてウィンドウを作成
    pub fn from_samples(mut samples: Vec<MetricSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    /// 最初と最後のサンプル間の期間
    pub fn span(&self) -> Duration {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => Duration::zero(),
        }
    }

    /// 最新のサンプル
    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.last()
    }
}

/// サンプル列をメトリクスごとのウィンドウに分割
pub fn group_by_metric(samples: &[MetricSample]) -> BTreeMap<MetricName, MetricWindow> {
    let mut grouped: BTreeMap<MetricName, Vec<MetricSample>> = BTreeMap::new();
    for sample in samples {
        grouped
            .entry(sample.metric.clone())
            .or_default()
            .push(sample.clone());
    }
    grouped
        .into_iter()
        .map(|(metric, samples)| (metric, MetricWindow::from_samples(samples)))
        .collect()
}

/// トレンド方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    /// 上昇トレンド
    Increasing,
    /// 下降トレンド
    Decreasing,
    /// 安定
    Stable,
}

/// 線形トレンド
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    /// サンプルインデックスあたりの傾き
    pub slope: f64,
    pub direction: TrendDirection,
}

/// Tukey法による外れ値境界
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierBounds {
    pub lower: f64,
    pub upper: f64,
}

/// 動的しきい値（warning <= critical <= anomaly_boundary）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DynamicThresholds {
    pub warning: f64,
    pub critical: f64,
    pub anomaly_boundary: f64,
}

/// エンティティ・メトリクス単位の統計ベースライン
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalModel {
    pub key: ModelKey,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    pub skewness: f64,
    pub kurtosis: f64,
    pub trend: Trend,
    /// ウィンドウサイズ → 移動平均系列
    pub moving_averages: BTreeMap<usize, Vec<f64>>,
    pub outlier_bounds: OutlierBounds,
    /// 学習ウィンドウ内の外れ値数
    pub outlier_count: usize,
    pub dynamic_thresholds: DynamicThresholds,
    pub data_point_count: usize,
    pub trained_at: DateTime<Utc>,
}

impl StatisticalModel {
    /// 分散ゼロ（定数信号）かどうか
    pub fn is_degenerate(&self) -> bool {
        self.stddev == 0.0
    }
}

/// 季節性プロファイル
///
/// 各バケットは複合信号の算術平均。観測がないバケットは `None`（補正なし）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalProfile {
    pub entity_id: EntityId,
    /// 時間帯別（0-23, UTC）
    pub hourly: [Option<f64>; 24],
    /// 曜日別（0 = 月曜）
    pub daily: [Option<f64>; 7],
    /// 月別（0 = 1月）
    pub monthly: [Option<f64>; 12],
    /// 複合信号全体の平均
    pub overall_mean: f64,
    pub sample_count: usize,
    pub trained_at: DateTime<Utc>,
}

impl SeasonalProfile {
    /// 時間帯バケットの全体平均からの偏差
    pub fn hourly_deviation(&self, timestamp: DateTime<Utc>) -> Option<f64> {
        self.hourly[timestamp.hour() as usize].map(|v| v - self.overall_mean)
    }

    /// 曜日バケットの全体平均からの偏差
    pub fn daily_deviation(&self, timestamp: DateTime<Utc>) -> Option<f64> {
        self.daily[timestamp.weekday().num_days_from_monday() as usize]
            .map(|v| v - self.overall_mean)
    }

    /// 月バケットの全体平均からの偏差
    pub fn monthly_deviation(&self, timestamp: DateTime<Utc>) -> Option<f64> {
        self.monthly[timestamp.month0() as usize].map(|v| v - self.overall_mean)
    }
}

/// ペア相関係数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairCorrelation {
    pub pair: MetricPair,
    /// ピアソン相関係数 [-1, 1]
    pub coefficient: f64,
    /// 整列後のサンプル数
    pub sample_count: usize,
}

/// エンティティの相関プロファイル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationProfile {
    pub entity_id: EntityId,
    /// ペア順にソート済み
    pub correlations: Vec<PairCorrelation>,
    pub trained_at: DateTime<Utc>,
}

impl CorrelationProfile {
    pub fn new(
        entity_id: EntityId,
        mut correlations: Vec<PairCorrelation>,
        trained_at: DateTime<Utc>,
    ) -> Self {
        correlations.sort_by(|a, b| a.pair.cmp(&b.pair));
        correlations.dedup_by(|a, b| a.pair == b.pair);
        Self {
            entity_id,
            correlations,
            trained_at,
        }
    }

    /// 2メトリクス間の相関係数（順序は問わない）
    pub fn coefficient(&self, a: &MetricName, b: &MetricName) -> Option<f64> {
        let pair = MetricPair::new(a.clone(), b.clone());
        self.correlations
            .binary_search_by(|c| c.pair.cmp(&pair))
            .ok()
            .map(|idx| self.correlations[idx].coefficient)
    }

    pub fn is_empty(&self) -> bool {
        self.correlations.is_empty()
    }
}
