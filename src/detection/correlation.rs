//! Correlation Anomaly Detector
//!
//! 学習済み相関に対する2メトリクス間の整合性チェック

use super::types::{AnomalyEvent, AnomalySubject, DetectionMethod, ExpectedRange, Severity};
use crate::config::DetectionConfig;
use crate::model::{CorrelationProfile, EntityId, MetricName, MetricPair, PairCorrelation};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::trace;

/// ペア1件のチェック結果
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationCheck {
    pub pair: MetricPair,
    pub value1: f64,
    pub value2: f64,
    /// value1 × 相関係数（原点を通る線形近似）
    pub predicted2: f64,
    pub deviation: f64,
    pub severity: Option<Severity>,
}

/// 相関異常検知器
#[derive(Debug, Clone)]
pub struct CorrelationAnomalyDetector {
    config: DetectionConfig,
}

impl CorrelationAnomalyDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// ペアの現在値をチェック（value1 は `pair.first()`、value2 は `pair.second()` の値）
    pub fn check(&self, correlation: &PairCorrelation, value1: f64, value2: f64) -> CorrelationCheck {
        let predicted2 = value1 * correlation.coefficient;
        let deviation = if predicted2 == 0.0 {
            (value2 - predicted2).abs()
        } else {
            (value2 - predicted2).abs() / predicted2.abs()
        };

        let severity = if deviation > self.config.correlation_high_cutoff {
            Some(Severity::High)
        } else if deviation > self.config.correlation_deviation_cutoff {
            Some(Severity::Medium)
        } else {
            None
        };

        CorrelationCheck {
            pair: correlation.pair.clone(),
            value1,
            value2,
            predicted2,
            deviation,
            severity,
        }
    }

    /// チェック結果の期待範囲
    pub fn expected_range(&self, check: &CorrelationCheck) -> ExpectedRange {
        let margin = self.config.correlation_deviation_cutoff * check.predicted2.abs();
        ExpectedRange {
            min: check.predicted2 - margin,
            max: check.predicted2 + margin,
        }
    }

    /// エンティティの最新値に対して全ペアをチェックし、発報対象をイベント化
    ///
    /// 最新値が揃わないペアや相関の弱いペアはスキップする。
    pub fn detect(
        &self,
        entity_id: &EntityId,
        profile: &CorrelationProfile,
        latest: &BTreeMap<MetricName, f64>,
        timestamp: DateTime<Utc>,
    ) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();

        for correlation in &profile.correlations {
            if correlation.coefficient.abs() < self.config.min_correlation_strength {
                continue;
            }
            let (Some(&value1), Some(&value2)) = (
                latest.get(correlation.pair.first()),
                latest.get(correlation.pair.second()),
            ) else {
                continue;
            };

            let check = self.check(correlation, value1, value2);
            trace!(
                entity = %entity_id,
                pair = %check.pair,
                deviation = check.deviation,
                "Correlation checked"
            );

            let Some(severity) = check.severity else {
                continue;
            };
            events.push(AnomalyEvent::new(
                entity_id.clone(),
                AnomalySubject::Pair {
                    pair: check.pair.clone(),
                    value1: check.value1,
                    value2: check.value2,
                    predicted2: check.predicted2,
                },
                check.deviation.min(1.0),
                severity,
                self.expected_range(&check),
                DetectionMethod::Correlation,
                timestamp,
            ));
        }

        events
    }
}
