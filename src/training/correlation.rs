//! Correlation Model Trainer
//!
//! メトリクスペア間のピアソン相関係数を学習

use crate::model::{
    CorrelationProfile, EntityId, MetricName, MetricPair, MetricWindow, PairCorrelation,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// 相関モデル学習器
#[derive(Debug, Clone)]
pub struct CorrelationModelTrainer {
    min_points: usize,
}

impl CorrelationModelTrainer {
    pub fn new(min_points: usize) -> Self {
        Self { min_points }
    }

    /// 全メトリクスペアの相関プロファイルを学習
    ///
    /// 整列後のサンプル数が不足するペアは除外される。
    pub fn train(
        &self,
        entity_id: &EntityId,
        windows: &BTreeMap<MetricName, MetricWindow>,
        trained_at: DateTime<Utc>,
    ) -> CorrelationProfile {
        let metrics: Vec<&MetricName> = windows.keys().collect();
        let mut correlations = Vec::new();

        for (i, a) in metrics.iter().enumerate() {
            for b in &metrics[i + 1..] {
                let pair = MetricPair::new((*a).clone(), (*b).clone());
                let (xs, ys) = align(&windows[pair.first()], &windows[pair.second()]);

                if xs.len() < self.min_points {
                    debug!(
                        entity = %entity_id,
                        pair = %pair,
                        aligned = xs.len(),
                        "Skipping pair with too few aligned samples"
                    );
                    continue;
                }

                correlations.push(PairCorrelation {
                    coefficient: pearson(&xs, &ys),
                    sample_count: xs.len(),
                    pair,
                });
            }
        }

        CorrelationProfile::new(entity_id.clone(), correlations, trained_at)
    }
}

/// タイムスタンプで2系列を整列（欠損・非有限値は除外）
pub fn align(a: &MetricWindow, b: &MetricWindow) -> (Vec<f64>, Vec<f64>) {
    let by_time: HashMap<DateTime<Utc>, f64> = a
        .samples()
        .iter()
        .filter(|s| s.value.is_finite())
        .map(|s| (s.timestamp, s.value))
        .collect();

    b.samples()
        .iter()
        .filter(|s| s.value.is_finite())
        .filter_map(|s| by_time.get(&s.timestamp).map(|x| (*x, s.value)))
        .unzip()
}

/// ピアソン相関係数（分母がゼロの場合は0）
pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let len = xs.len().min(ys.len());
    if len == 0 {
        return 0.0;
    }
    let n = len as f64;

    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2, mut sum_y2) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys.iter()) {
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
        sum_y2 += y * y;
    }

    let numerator = n * sum_xy - sum_x * sum_y;
    let denominator = ((n * sum_x2 - sum_x * sum_x) * (n * sum_y2 - sum_y * sum_y)).sqrt();

    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }
    (numerator / denominator).clamp(-1.0, 1.0)
}
