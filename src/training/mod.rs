//! Baseline Training Module
//!
//! 統計モデル・季節性プロファイル・相関プロファイルの学習

mod correlation;
mod entity;
mod seasonal;
mod statistical;

pub use correlation::{align, pearson, CorrelationModelTrainer};
pub use entity::{EntityTrainer, EntityTrainingReport, MetricTrainingStatus};
pub use seasonal::SeasonalDecomposer;
pub use statistical::StatisticalModelTrainer;

/// 学習結果（データ不足はエラーではなく明示的な結果）
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome<T> {
    /// 学習済みモデル
    Trained(T),
    /// データ不足
    InsufficientData {
        required: usize,
        actual: usize,
        /// 単位（"samples" / "seconds"）
        unit: &'static str,
    },
}

impl<T> TrainingOutcome<T> {
    pub(crate) fn insufficient_samples(required: usize, actual: usize) -> Self {
        TrainingOutcome::InsufficientData {
            required,
            actual,
            unit: "samples",
        }
    }

    pub(crate) fn insufficient_span(required: usize, actual: usize) -> Self {
        TrainingOutcome::InsufficientData {
            required,
            actual,
            unit: "seconds",
        }
    }

    /// 学習済みモデルを取り出す
    pub fn model(self) -> Option<T> {
        match self {
            TrainingOutcome::Trained(model) => Some(model),
            TrainingOutcome::InsufficientData { .. } => None,
        }
    }

    /// `Result` に変換（データ不足は `Error::InsufficientData`）
    pub fn into_result(self, scope: impl Into<String>) -> crate::error::Result<T> {
        match self {
            TrainingOutcome::Trained(model) => Ok(model),
            TrainingOutcome::InsufficientData {
                required, actual, ..
            } => Err(crate::error::Error::InsufficientData {
                scope: scope.into(),
                required,
                actual,
            }),
        }
    }
}
