//! Forecast Types
//!
//! 予測結果の型定義

use crate::model::{DynamicThresholds, EntityId, MetricName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 予測値のリスクレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// warning 以下
    Low,
    /// warning 超過
    Medium,
    /// critical 超過
    High,
    /// anomaly_boundary 超過
    Critical,
    /// 信頼度が低く判定不能
    Uncertain,
}

impl RiskLevel {
    /// 予測アラートの対象か
    pub fn is_actionable(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
            RiskLevel::Uncertain => "UNCERTAIN",
        };
        f.write_str(label)
    }
}

/// 予測値の範囲
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastRange {
    pub min: f64,
    pub max: f64,
}

/// 予測点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    /// 1始まりのステップ番号
    pub step: usize,
    pub timestamp: DateTime<Utc>,
    pub predicted_value: f64,
    /// 信頼度（0.0-1.0）
    pub confidence: f64,
    pub range: ForecastRange,
    pub risk: RiskLevel,
}

/// エンティティ・メトリクスの予測系列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub entity_id: EntityId,
    pub metric: MetricName,
    pub horizon: usize,
    /// 予測に使ったベースライン平均
    pub baseline_mean: f64,
    /// リスク判定に使ったしきい値
    pub thresholds: DynamicThresholds,
    pub points: Vec<ForecastPoint>,
    pub generated_at: DateTime<Utc>,
}

impl Forecast {
    /// 最もリスクの高い予測点（Uncertain は除く）
    pub fn peak_risk(&self) -> RiskLevel {
        let rank = |r: RiskLevel| match r {
            RiskLevel::Uncertain => 0,
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
            RiskLevel::Critical => 4,
        };
        self.points
            .iter()
            .map(|p| p.risk)
            .max_by_key(|r| rank(*r))
            .unwrap_or(RiskLevel::Low)
    }
}
