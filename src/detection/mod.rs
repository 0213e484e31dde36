//! Real-time Anomaly Detection
//!
//! リアルタイム異常検知（偏差スコア・相関整合性）

mod correlation;
mod history;
mod scorer;
mod types;

pub use correlation::{CorrelationAnomalyDetector, CorrelationCheck};
pub use history::ScoreHistory;
pub use scorer::{AnomalyScorer, ScoreBasis, ScoreOutcome};
pub use types::{AnomalyEvent, AnomalySubject, DetectionMethod, ExpectedRange, Severity};
