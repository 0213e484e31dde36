//! External Interfaces
//!
//! エンジン外部との境界（データ取得・永続化・通知・エンティティ一覧）。
//! コアはこれらのトレイト経由でのみ I/O を行う。

mod file;
mod memory;
mod sink;

pub use file::{JsonFilePersistence, JsonLinesDataSource};
pub use memory::{InMemoryDataSource, InMemoryEntityRegistry, MemoryAlertSink, NoopPersistence};
pub use sink::{BroadcastAlertSink, LogAlertSink};

use crate::detection::AnomalyEvent;
use crate::error::Result;
use crate::model::{
    CorrelationProfile, EntityId, MetricName, MetricSample, ModelKey, SeasonalProfile,
    StatisticalModel,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 履歴データ取得元
///
/// 部分的・空の結果は正常系（データ不足として扱う）。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoricalDataSource: Send + Sync {
    async fn fetch(
        &self,
        entity_id: &EntityId,
        metrics: &[MetricName],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>>;
}

/// 永続化キー
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PersistenceKey {
    Statistical(ModelKey),
    Seasonal(EntityId),
    Correlation(EntityId),
}

impl PersistenceKey {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            PersistenceKey::Statistical(key) => &key.entity_id,
            PersistenceKey::Seasonal(entity) | PersistenceKey::Correlation(entity) => entity,
        }
    }
}

/// 永続化対象モデル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "model", rename_all = "snake_case")]
pub enum PersistedModel {
    Statistical(StatisticalModel),
    Seasonal(SeasonalProfile),
    Correlation(CorrelationProfile),
}

/// モデル永続化（任意）
#[async_trait]
pub trait ModelPersistence: Send + Sync {
    async fn save(&self, key: &PersistenceKey, model: &PersistedModel) -> Result<()>;

    async fn load(&self, key: &PersistenceKey) -> Result<Option<PersistedModel>>;

    /// エンティティの全モデルを削除
    async fn remove_entity(&self, _entity_id: &EntityId) -> Result<()> {
        Ok(())
    }
}

/// 異常イベントの通知先（fire-and-forget、再送は通知先の責務）
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish(&self, event: AnomalyEvent);
}

/// アクティブなエンティティの一覧
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn list_active_entities(&self) -> Result<Vec<EntityId>>;

    /// 外部から登録解除（対応しないレジストリは何もしない）
    async fn deregister(&self, _entity_id: &EntityId) -> Result<()> {
        Ok(())
    }
}
