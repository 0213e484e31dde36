//! Error types for the anomaly detection engine.
//!
//! エラー分類（ソフト／回復可能／致命的）

use serde::Serialize;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// エラーの重大度分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// 対象スコープのみスキップ（他は続行）
    Soft,
    /// 今サイクルは中断、次サイクルで再試行
    Recoverable,
    /// 構築時に即座に拒否
    Fatal,
}

/// Error types for training, detection and forecasting
#[derive(Debug, Error)]
pub enum Error {
    /// Not enough samples to build a model
    #[error("Insufficient data for {scope}: required {required}, got {actual}")]
    InsufficientData {
        scope: String,
        required: usize,
        actual: usize,
    },

    /// Historical data source failure
    #[error("Upstream fetch failed for entity {entity}: {reason}")]
    UpstreamFetch { entity: String, reason: String },

    /// Model persistence failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sample rejected at ingestion
    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    /// No trained model for the requested key
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Entity was deregistered or reset while its training was running
    #[error("Entity {0} was removed during training")]
    EntityRemoved(String),

    /// Per-entity training exceeded its time budget
    #[error("Training timed out for entity {entity} after {timeout_secs}s")]
    TrainingTimeout { entity: String, timeout_secs: u64 },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// エラー分類を取得
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InsufficientData { .. }
            | Error::InvalidSample(_)
            | Error::ModelNotFound(_)
            | Error::EntityRemoved(_) => ErrorClass::Soft,
            Error::Configuration(_) => ErrorClass::Fatal,
            Error::UpstreamFetch { .. }
            | Error::Persistence(_)
            | Error::TrainingTimeout { .. }
            | Error::Json(_)
            | Error::Io(_) => ErrorClass::Recoverable,
        }
    }

    /// 上流取得エラーを作成
    pub fn upstream(entity: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Error::UpstreamFetch {
            entity: entity.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class() {
        let err = Error::InsufficientData {
            scope: "host-1/cpu_usage".to_string(),
            required: 100,
            actual: 12,
        };
        assert_eq!(err.class(), ErrorClass::Soft);
        assert!(err.to_string().contains("required 100"));

        assert_eq!(
            Error::Configuration("bad".to_string()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            Error::upstream("host-1", "connection refused").class(),
            ErrorClass::Recoverable
        );
    }

    #[test]
    fn test_upstream_message() {
        let err = Error::upstream("host-2", "timeout");
        assert_eq!(
            err.to_string(),
            "Upstream fetch failed for entity host-2: timeout"
        );
    }
}
