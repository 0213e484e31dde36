//! Anomaly Detection Types
//!
//! 異常イベントの型定義

use crate::model::{EntityId, MetricName, MetricPair};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 重大度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// 中
    Medium,
    /// 高
    High,
    /// 致命的
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// 検知手法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// 統計ベースライン（偏差スコア）
    Statistical,
    /// メトリクス間相関の整合性
    Correlation,
    /// 予測値のしきい値超過
    Predictive,
}

/// 期待範囲
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedRange {
    pub min: f64,
    pub max: f64,
}

impl ExpectedRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// 異常の対象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalySubject {
    /// 単一メトリクス
    Metric { metric: MetricName, value: f64 },
    /// メトリクスペア（value1 → first, value2 → second）
    Pair {
        pair: MetricPair,
        value1: f64,
        value2: f64,
        predicted2: f64,
    },
    /// 予測値
    Forecast {
        metric: MetricName,
        predicted_value: f64,
        target_time: DateTime<Utc>,
        confidence: f64,
    },
}

/// 異常イベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub entity_id: EntityId,
    pub subject: AnomalySubject,
    /// 異常スコア（0.0-1.0）
    pub anomaly_score: f64,
    pub severity: Severity,
    pub expected_range: ExpectedRange,
    pub method: DetectionMethod,
    pub timestamp: DateTime<Utc>,
}

impl AnomalyEvent {
    pub fn new(
        entity_id: EntityId,
        subject: AnomalySubject,
        anomaly_score: f64,
        severity: Severity,
        expected_range: ExpectedRange,
        method: DetectionMethod,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            subject,
            anomaly_score: anomaly_score.clamp(0.0, 1.0),
            severity,
            expected_range,
            method,
            timestamp,
        }
    }

    /// 対象メトリクス名（ペアの場合は "a~b"）
    pub fn metric_label(&self) -> String {
        match &self.subject {
            AnomalySubject::Metric { metric, .. } | AnomalySubject::Forecast { metric, .. } => {
                metric.to_string()
            }
            AnomalySubject::Pair { pair, .. } => pair.to_string(),
        }
    }
}
