//! In-memory interface implementations

use super::{
    AlertSink, EntityRegistry, HistoricalDataSource, ModelPersistence, PersistedModel,
    PersistenceKey,
};
use crate::detection::AnomalyEvent;
use crate::error::Result;
use crate::model::{EntityId, MetricName, MetricSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tokio::sync::{Mutex, RwLock};

/// メモリ上の履歴データ
#[derive(Default)]
pub struct InMemoryDataSource {
    samples: RwLock<Vec<MetricSample>>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_samples(samples: Vec<MetricSample>) -> Self {
        Self {
            samples: RwLock::new(samples),
        }
    }

    /// サンプルを追加
    pub async fn extend(&self, samples: impl IntoIterator<Item = MetricSample>) {
        self.samples.write().await.extend(samples);
    }

    /// 全サンプル数
    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.samples.read().await.is_empty()
    }
}

#[async_trait]
impl HistoricalDataSource for InMemoryDataSource {
    async fn fetch(
        &self,
        entity_id: &EntityId,
        metrics: &[MetricName],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let samples = self.samples.read().await;
        Ok(samples
            .iter()
            .filter(|s| &s.entity_id == entity_id)
            .filter(|s| metrics.is_empty() || metrics.contains(&s.metric))
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect())
    }
}

/// メモリ上のエンティティレジストリ
#[derive(Default)]
pub struct InMemoryEntityRegistry {
    entities: RwLock<BTreeSet<EntityId>>,
}

impl InMemoryEntityRegistry {
    pub fn new(entities: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            entities: RwLock::new(entities.into_iter().collect()),
        }
    }

    /// エンティティを登録
    pub async fn register(&self, entity_id: EntityId) -> bool {
        self.entities.write().await.insert(entity_id)
    }
}

#[async_trait]
impl EntityRegistry for InMemoryEntityRegistry {
    async fn list_active_entities(&self) -> Result<Vec<EntityId>> {
        Ok(self.entities.read().await.iter().cloned().collect())
    }

    async fn deregister(&self, entity_id: &EntityId) -> Result<()> {
        self.entities.write().await.remove(entity_id);
        Ok(())
    }
}

/// 受け取ったイベントを保持する通知先（ダッシュボード・テスト用）
#[derive(Default)]
pub struct MemoryAlertSink {
    events: Mutex<Vec<AnomalyEvent>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 受信済みイベント
    pub async fn events(&self) -> Vec<AnomalyEvent> {
        self.events.lock().await.clone()
    }

    /// 受信済みイベントをクリア
    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn publish(&self, event: AnomalyEvent) {
        self.events.lock().await.push(event);
    }
}

/// 永続化なし（コールドスタート時は常に再学習）
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl ModelPersistence for NoopPersistence {
    async fn save(&self, _key: &PersistenceKey, _model: &PersistedModel) -> Result<()> {
        Ok(())
    }

    async fn load(&self, _key: &PersistenceKey) -> Result<Option<PersistedModel>> {
        Ok(None)
    }
}
