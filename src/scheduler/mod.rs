//! Scheduling Module
//!
//! 学習・検知の周期実行（時計・ティック源の注入、キャンセル、エンティティ単位の障害分離）

mod clock;
mod detection;
mod ticker;
mod training;

pub use clock::{Clock, ManualClock, SystemClock};
pub use detection::{DetectionLoop, DetectionReport};
pub use ticker::{IntervalTicker, ManualTicker, TickHandle, Ticker};
pub use training::{
    RequestOutcome, SchedulerState, TrainingCycleReport, TrainingScheduler, TrainingScope,
};

use crate::error::{Error, ErrorClass};
use crate::model::EntityId;
use serde::Serialize;

/// エンティティ単位の失敗（サイクル全体は継続）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityFailure {
    pub entity_id: EntityId,
    pub error: String,
    pub class: ErrorClass,
}

impl EntityFailure {
    pub fn new(entity_id: EntityId, error: &Error) -> Self {
        Self {
            entity_id,
            error: error.to_string(),
            class: error.class(),
        }
    }
}
