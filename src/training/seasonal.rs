//! Seasonal Decomposer
//!
//! 複合信号を時間帯・曜日・月ごとに平均化する

use super::TrainingOutcome;
use crate::model::{EntityId, MetricName, MetricSample, SeasonalProfile};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::collections::BTreeMap;

/// 季節性分解器
///
/// 複合信号は、同一タイムスタンプで観測された追跡メトリクス値の重みなし平均。
#[derive(Debug, Clone)]
pub struct SeasonalDecomposer {
    metrics: Vec<MetricName>,
    min_span: Duration,
}

/// バケットごとの合計と件数
#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    sum: f64,
    count: usize,
}

impl Bucket {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

impl SeasonalDecomposer {
    pub fn new(metrics: Vec<MetricName>, min_span: Duration) -> Self {
        Self { metrics, min_span }
    }

    /// 複合信号の時系列を構築
    pub fn composite_signal(&self, samples: &[MetricSample]) -> Vec<(DateTime<Utc>, f64)> {
        let mut by_timestamp: BTreeMap<DateTime<Utc>, Bucket> = BTreeMap::new();
        for sample in samples {
            if !sample.value.is_finite() || !self.metrics.contains(&sample.metric) {
                continue;
            }
            by_timestamp
                .entry(sample.timestamp)
                .or_default()
                .add(sample.value);
        }

        by_timestamp
            .into_iter()
            .filter_map(|(ts, bucket)| bucket.mean().map(|v| (ts, v)))
            .collect()
    }

    /// エンティティの季節性プロファイルを抽出
    pub fn decompose(
        &self,
        entity_id: &EntityId,
        samples: &[MetricSample],
        trained_at: DateTime<Utc>,
    ) -> TrainingOutcome<SeasonalProfile> {
        let signal = self.composite_signal(samples);

        let span = match (signal.first(), signal.last()) {
            (Some((first, _)), Some((last, _))) => *last - *first,
            _ => Duration::zero(),
        };
        if signal.is_empty() || span < self.min_span {
            return TrainingOutcome::insufficient_span(
                self.min_span.num_seconds().max(0) as usize,
                span.num_seconds().max(0) as usize,
            );
        }

        let mut hourly = [Bucket::default(); 24];
        let mut daily = [Bucket::default(); 7];
        let mut monthly = [Bucket::default(); 12];
        let mut overall = Bucket::default();

        for (timestamp, value) in &signal {
            hourly[timestamp.hour() as usize].add(*value);
            daily[timestamp.weekday().num_days_from_monday() as usize].add(*value);
            monthly[timestamp.month0() as usize].add(*value);
            overall.add(*value);
        }

        TrainingOutcome::Trained(SeasonalProfile {
            entity_id: entity_id.clone(),
            hourly: hourly.map(|b| b.mean()),
            daily: daily.map(|b| b.mean()),
            monthly: monthly.map(|b| b.mean()),
            overall_mean: overall.mean().unwrap_or(0.0),
            sample_count: signal.len(),
            trained_at,
        })
    }
}
