//! Anomaly Scorer
//!
//! 学習済みベースラインに対する偏差スコアリング

use super::types::{AnomalyEvent, AnomalySubject, DetectionMethod, ExpectedRange, Severity};
use crate::config::DetectionConfig;
use crate::error::{Error, Result};
use crate::model::{EntityId, MetricDomain, MetricName, MetricSample, ModelKey, StatisticalModel};
use crate::store::ModelStore;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// スコアの算出根拠
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBasis {
    /// 標準偏差による正規化
    Normal,
    /// 分散ゼロ（平均と一致すれば 0.0、それ以外は 1.0）
    Degenerate,
}

/// スコアリング結果（発報しないスコアもダッシュボード用に保持される）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreOutcome {
    pub key: ModelKey,
    pub value: f64,
    pub score: f64,
    pub basis: ScoreBasis,
    /// 発報対象の場合のみ `Some`
    pub severity: Option<Severity>,
    pub expected_range: ExpectedRange,
    pub timestamp: DateTime<Utc>,
}

impl ScoreOutcome {
    pub fn is_anomalous(&self) -> bool {
        self.severity.is_some()
    }

    /// 発報対象なら異常イベントに変換
    pub fn to_event(&self) -> Option<AnomalyEvent> {
        let severity = self.severity?;
        Some(AnomalyEvent::new(
            self.key.entity_id.clone(),
            AnomalySubject::Metric {
                metric: self.key.metric.clone(),
                value: self.value,
            },
            self.score,
            severity,
            self.expected_range,
            DetectionMethod::Statistical,
            self.timestamp,
        ))
    }
}

/// 偏差スコアラー
#[derive(Debug, Clone)]
pub struct AnomalyScorer {
    config: DetectionConfig,
}

impl AnomalyScorer {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// 偏差スコア（0.0-1.0）
    pub fn raw_score(&self, model: &StatisticalModel, value: f64) -> (f64, ScoreBasis) {
        if model.is_degenerate() {
            let score = if value == model.mean { 0.0 } else { 1.0 };
            return (score, ScoreBasis::Degenerate);
        }

        let z = (value - model.mean).abs() / model.stddev;
        ((z / self.config.score_sigma_scale).min(1.0), ScoreBasis::Normal)
    }

    /// スコアから重大度を判定（`emission_cutoff` 以下は発報しない）
    pub fn classify(&self, score: f64) -> Option<Severity> {
        if score > self.config.critical_cutoff {
            Some(Severity::Critical)
        } else if score > self.config.emission_cutoff {
            Some(Severity::High)
        } else {
            None
        }
    }

    /// 発報されない値の範囲
    pub fn expected_range(&self, model: &StatisticalModel, domain: MetricDomain) -> ExpectedRange {
        let margin = self.config.score_sigma_scale * self.config.emission_cutoff * model.stddev;
        ExpectedRange {
            min: domain.clamp(model.mean - margin),
            max: domain.clamp(model.mean + margin),
        }
    }

    /// 1サンプルをスコアリング
    pub fn score(
        &self,
        model: &StatisticalModel,
        value: f64,
        timestamp: DateTime<Utc>,
        domain: MetricDomain,
    ) -> ScoreOutcome {
        let (score, basis) = self.raw_score(model, value);
        ScoreOutcome {
            key: model.key.clone(),
            value,
            score,
            basis,
            severity: self.classify(score),
            expected_range: self.expected_range(model, domain),
            timestamp,
        }
    }

    /// ストアのモデルでサンプルをスコアリング
    pub async fn score_sample(
        &self,
        store: &ModelStore,
        sample: &MetricSample,
        domain: MetricDomain,
    ) -> Result<ScoreOutcome> {
        if !sample.value.is_finite() {
            return Err(Error::InvalidSample(format!(
                "non-finite value for {}/{}",
                sample.entity_id, sample.metric
            )));
        }
        let key = ModelKey::new(sample.entity_id.clone(), sample.metric.clone());
        let model = store
            .statistical(&key)
            .await
            .ok_or_else(|| Error::ModelNotFound(key.to_string()))?;
        Ok(self.score(&model, sample.value, sample.timestamp, domain))
    }

    /// エンティティ・メトリクス・値から直接スコアリング
    pub async fn score_value(
        &self,
        store: &ModelStore,
        entity_id: &EntityId,
        metric: &MetricName,
        value: f64,
        timestamp: DateTime<Utc>,
        domain: MetricDomain,
    ) -> Result<ScoreOutcome> {
        let sample = MetricSample::new(entity_id.clone(), metric.clone(), timestamp, value);
        self.score_sample(store, &sample, domain).await
    }
}
