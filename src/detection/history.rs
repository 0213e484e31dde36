//! Score History
//!
//! ダッシュボード向けに、発報有無に関わらず全スコアを保持する（キーごとに上限あり）

use super::scorer::ScoreOutcome;
use crate::model::{EntityId, ModelKey};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// スコア履歴
pub struct ScoreHistory {
    capacity: usize,
    entries: RwLock<HashMap<ModelKey, VecDeque<ScoreOutcome>>>,
}

impl ScoreHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// スコアを記録（古いものから破棄）
    pub async fn record(&self, outcome: ScoreOutcome) {
        let mut entries = self.entries.write().await;
        let history = entries.entry(outcome.key.clone()).or_default();
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(outcome);
    }

    /// 直近 `limit` 件（新しい順）
    pub async fn recent(&self, key: &ModelKey, limit: usize) -> Vec<ScoreOutcome> {
        self.entries
            .read()
            .await
            .get(key)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// エンティティの履歴を削除
    pub async fn remove_entity(&self, entity_id: &EntityId) {
        self.entries
            .write()
            .await
            .retain(|key, _| &key.entity_id != entity_id);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// 記録されているキー数
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
