//! Forecaster
//!
//! ベースライン + 線形トレンド + 季節性補正による短期予測

use super::types::{Forecast, ForecastPoint, ForecastRange, RiskLevel};
use crate::config::{ForecastConfig, MAX_FORECAST_HORIZON};
use crate::detection::{AnomalyEvent, AnomalySubject, DetectionMethod, ExpectedRange, Severity};
use crate::error::{Error, Result};
use crate::model::{EntityId, MetricDomain, MetricName, ModelKey, SeasonalProfile, StatisticalModel};
use crate::store::ModelStore;
use chrono::{DateTime, Utc};
use tracing::debug;

/// 予測器
#[derive(Debug, Clone)]
pub struct Forecaster {
    config: ForecastConfig,
}

impl Forecaster {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    /// ステップ `step`（1始まり）の信頼度。ステップが進むほど単調に減少する
    pub fn confidence(&self, step: usize, horizon: usize) -> f64 {
        if horizon == 0 {
            return self.config.min_confidence;
        }
        let decayed = 1.0 - (step as f64 / horizon as f64) * self.config.confidence_decay;
        decayed.max(self.config.min_confidence)
    }

    /// 季節性補正（全体平均からの時間帯・曜日偏差の加重和）
    ///
    /// 観測のないバケットは補正なし。
    pub fn seasonal_adjustment(
        &self,
        profile: Option<&SeasonalProfile>,
        timestamp: DateTime<Utc>,
    ) -> f64 {
        let Some(profile) = profile else {
            return 0.0;
        };
        let hourly = profile.hourly_deviation(timestamp).unwrap_or(0.0);
        let daily = profile.daily_deviation(timestamp).unwrap_or(0.0);
        self.config.hourly_weight * hourly + self.config.daily_weight * daily
    }

    /// 予測値をモデルのしきい値に照らしてリスク判定
    pub fn risk(&self, model: &StatisticalModel, predicted: f64, confidence: f64) -> RiskLevel {
        let thresholds = &model.dynamic_thresholds;
        if confidence < self.config.uncertain_confidence {
            RiskLevel::Uncertain
        } else if predicted > thresholds.anomaly_boundary {
            RiskLevel::Critical
        } else if predicted > thresholds.critical {
            RiskLevel::High
        } else if predicted > thresholds.warning {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// 学習済みモデルから予測系列を生成
    ///
    /// ステップ数が上限を超える場合、または時刻が表現範囲を外れる場合は
    /// `Configuration` エラー。
    pub fn forecast_model(
        &self,
        model: &StatisticalModel,
        seasonal: Option<&SeasonalProfile>,
        domain: MetricDomain,
        start: DateTime<Utc>,
        horizon: usize,
    ) -> Result<Forecast> {
        if horizon == 0 {
            return Err(Error::Configuration(
                "forecast horizon must be at least 1 step".to_string(),
            ));
        }
        if horizon > MAX_FORECAST_HORIZON {
            return Err(Error::Configuration(format!(
                "forecast horizon {} exceeds the maximum of {} steps",
                horizon, MAX_FORECAST_HORIZON
            )));
        }

        let step = self.config.step();
        let points = (1..=horizon)
            .map(|i| {
                let timestamp = i32::try_from(i)
                    .ok()
                    .and_then(|n| step.checked_mul(n))
                    .and_then(|offset| start.checked_add_signed(offset))
                    .ok_or_else(|| {
                        Error::Configuration(format!(
                            "forecast step {} falls outside the representable time range",
                            i
                        ))
                    })?;
                let confidence = self.confidence(i, horizon);
                let raw = model.mean
                    + model.trend.slope * i as f64
                    + self.seasonal_adjustment(seasonal, timestamp);
                let margin = model.stddev * (1.0 - confidence);
                let predicted_value = domain.clamp(raw);

                Ok(ForecastPoint {
                    step: i,
                    timestamp,
                    predicted_value,
                    confidence,
                    range: ForecastRange {
                        min: domain.clamp(raw - margin),
                        max: domain.clamp(raw + margin),
                    },
                    risk: self.risk(model, predicted_value, confidence),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Forecast {
            entity_id: model.key.entity_id.clone(),
            metric: model.key.metric.clone(),
            horizon,
            baseline_mean: model.mean,
            thresholds: model.dynamic_thresholds,
            points,
            generated_at: start,
        })
    }

    /// ストアのモデルで予測（`horizon` 省略時は既定値）
    pub async fn forecast(
        &self,
        store: &ModelStore,
        entity_id: &EntityId,
        metric: &MetricName,
        horizon: Option<usize>,
        domain: MetricDomain,
        start: DateTime<Utc>,
    ) -> Result<Forecast> {
        let key = ModelKey::new(entity_id.clone(), metric.clone());
        let model = store
            .statistical(&key)
            .await
            .ok_or_else(|| Error::ModelNotFound(key.to_string()))?;
        let seasonal = store.seasonal(entity_id).await;

        let forecast = self.forecast_model(
            &model,
            seasonal.as_deref(),
            domain,
            start,
            horizon.unwrap_or(self.config.default_horizon),
        )?;
        debug!(
            key = %key,
            horizon = forecast.horizon,
            peak_risk = %forecast.peak_risk(),
            "Forecast generated"
        );
        Ok(forecast)
    }

    /// 予測アラート
    ///
    /// 信頼度が `predictive_alert_confidence` を超え、リスクが High/Critical となる
    /// 最初の予測点のみをイベント化する。
    pub fn predictive_event(&self, forecast: &Forecast, domain: MetricDomain) -> Option<AnomalyEvent> {
        let point = forecast.points.iter().find(|p| {
            p.confidence > self.config.predictive_alert_confidence && p.risk.is_actionable()
        })?;

        let severity = match point.risk {
            RiskLevel::Critical => Severity::Critical,
            _ => Severity::High,
        };
        let warning = forecast.thresholds.warning;
        let expected_range = ExpectedRange {
            min: domain.clamp(2.0 * forecast.baseline_mean - warning),
            max: warning,
        };

        Some(AnomalyEvent::new(
            forecast.entity_id.clone(),
            AnomalySubject::Forecast {
                metric: forecast.metric.clone(),
                predicted_value: point.predicted_value,
                target_time: point.timestamp,
                confidence: point.confidence,
            },
            point.confidence,
            severity,
            expected_range,
            DetectionMethod::Predictive,
            forecast.generated_at,
        ))
    }
}
