//! Statistical Model Trainer
//!
//! 履歴ウィンドウから統計ベースラインを学習

use super::TrainingOutcome;
use crate::config::TrainingConfig;
use crate::model::{
    DynamicThresholds, MetricDomain, MetricWindow, ModelKey, OutlierBounds, StatisticalModel,
    Trend, TrendDirection,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// 統計モデル学習器
#[derive(Debug, Clone)]
pub struct StatisticalModelTrainer {
    config: TrainingConfig,
}

impl StatisticalModelTrainer {
    /// 新しい学習器を作成
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// ウィンドウからモデルを学習
    ///
    /// 有限値が `min_data_points` 未満の場合はエラーではなく `InsufficientData` を返す。
    pub fn train(
        &self,
        key: ModelKey,
        window: &MetricWindow,
        domain: MetricDomain,
        trained_at: DateTime<Utc>,
    ) -> TrainingOutcome<StatisticalModel> {
        let values: Vec<f64> = window
            .values()
            .into_iter()
            .filter(|v| v.is_finite())
            .collect();

        if values.len() < self.config.min_data_points {
            return TrainingOutcome::insufficient_samples(self.config.min_data_points, values.len());
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        let mut sorted = values.clone();
        sorted.sort_by(f64::total_cmp);
        let q1 = sorted[quantile_index(sorted.len(), 0.25)];
        let median = sorted[quantile_index(sorted.len(), 0.5)];
        let q3 = sorted[quantile_index(sorted.len(), 0.75)];
        let iqr = q3 - q1;

        let outlier_bounds = OutlierBounds {
            lower: q1 - self.config.iqr_multiplier * iqr,
            upper: q3 + self.config.iqr_multiplier * iqr,
        };
        let outlier_count = values
            .iter()
            .filter(|v| **v < outlier_bounds.lower || **v > outlier_bounds.upper)
            .count();

        let model = StatisticalModel {
            key,
            mean,
            median,
            stddev,
            variance,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            q1,
            q3,
            iqr,
            skewness: skewness(&values, mean, stddev),
            kurtosis: kurtosis(&values, mean, stddev),
            trend: self.trend(&values),
            moving_averages: self.moving_averages(&values),
            outlier_bounds,
            outlier_count,
            dynamic_thresholds: self.thresholds(mean, stddev, domain),
            data_point_count: values.len(),
            trained_at,
        };

        debug!(
            key = %model.key,
            mean = model.mean,
            stddev = model.stddev,
            points = model.data_point_count,
            "Statistical model trained"
        );

        TrainingOutcome::Trained(model)
    }

    /// 最小二乗法による傾きとトレンド分類
    fn trend(&self, values: &[f64]) -> Trend {
        let slope = ols_slope(values);
        let threshold = self.config.trend_stability_threshold;
        let direction = if slope > threshold {
            TrendDirection::Increasing
        } else if slope < -threshold {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        };
        Trend { slope, direction }
    }

    /// 設定された各ウィンドウサイズの移動平均
    fn moving_averages(&self, values: &[f64]) -> BTreeMap<usize, Vec<f64>> {
        self.config
            .moving_average_windows
            .iter()
            .filter(|w| **w > 0 && **w <= values.len())
            .map(|&w| {
                let series = values
                    .windows(w)
                    .map(|slice| slice.iter().sum::<f64>() / w as f64)
                    .collect();
                (w, series)
            })
            .collect()
    }

    /// 動的しきい値（値域でクランプし、warning <= critical <= anomaly_boundary を保証）
    fn thresholds(&self, mean: f64, stddev: f64, domain: MetricDomain) -> DynamicThresholds {
        let warning = domain.clamp(mean + self.config.warning_sigma * stddev);
        let critical = domain
            .clamp(mean + self.config.critical_sigma * stddev)
            .max(warning);
        let anomaly_boundary = domain
            .clamp(mean + self.config.anomaly_boundary_sigma * stddev)
            .max(critical);

        DynamicThresholds {
            warning,
            critical,
            anomaly_boundary,
        }
    }
}

fn quantile_index(len: usize, q: f64) -> usize {
    ((len as f64 * q).floor() as usize).min(len - 1)
}

/// 標本歪度
fn skewness(values: &[f64], mean: f64, stddev: f64) -> f64 {
    let n = values.len() as f64;
    if stddev == 0.0 || n < 3.0 {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|v| ((v - mean) / stddev).powi(3)).sum();
    (n / ((n - 1.0) * (n - 2.0))) * sum
}

/// 超過尖度
fn kurtosis(values: &[f64], mean: f64, stddev: f64) -> f64 {
    let n = values.len() as f64;
    if stddev == 0.0 || n < 4.0 {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|v| ((v - mean) / stddev).powi(4)).sum();
    let scale = (n * (n + 1.0)) / ((n - 1.0) * (n - 2.0) * (n - 3.0));
    let correction = 3.0 * (n - 1.0).powi(2) / ((n - 2.0) * (n - 3.0));
    scale * sum - correction
}

/// インデックスに対する値の最小二乗傾き
fn ols_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }

    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (i, &y) in values.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }

    let denominator = n * sum_x2 - sum_x * sum_x;
    if denominator == 0.0 {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}
