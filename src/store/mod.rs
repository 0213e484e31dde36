//! Model Store
//!
//! 学習済みモデルのキー付きレジストリ（単一ライター／複数リーダー）。
//! 更新は常に `Arc` の差し替えで行い、読み手が更新途中の状態を見ることはない。
//! エンティティ削除・全削除は世代を進め、それ以前に始まった学習の反映を拒否する。

use crate::interfaces::PersistedModel;
use crate::model::{
    CorrelationProfile, EntityId, MetricName, ModelKey, SeasonalProfile, StatisticalModel,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// 1エンティティ分の学習結果
///
/// 同一の履歴スナップショットから学習されたモデルをまとめて反映する。
/// `None` や欠けているメトリクスは前回のモデルを維持する。
#[derive(Debug, Clone)]
pub struct EntityModels {
    pub entity_id: EntityId,
    pub statistical: Vec<StatisticalModel>,
    pub seasonal: Option<SeasonalProfile>,
    pub correlation: Option<CorrelationProfile>,
}

impl EntityModels {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            statistical: Vec::new(),
            seasonal: None,
            correlation: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statistical.is_empty() && self.seasonal.is_none() && self.correlation.is_none()
    }
}

/// ストア統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub statistical_models: usize,
    pub seasonal_profiles: usize,
    pub correlation_profiles: usize,
    pub entities: usize,
}

/// 学習開始時点のエンティティ世代
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    epoch: u64,
    removals: u64,
}

#[derive(Default)]
struct Models {
    statistical: HashMap<ModelKey, Arc<StatisticalModel>>,
    seasonal: HashMap<EntityId, Arc<SeasonalProfile>>,
    correlation: HashMap<EntityId, Arc<CorrelationProfile>>,
    /// `clear` の回数
    epoch: u64,
    /// エンティティごとの `remove_entity` 回数（削除後も保持）
    removals: HashMap<EntityId, u64>,
}

impl Models {
    fn generation(&self, entity_id: &EntityId) -> Generation {
        Generation {
            epoch: self.epoch,
            removals: self.removals.get(entity_id).copied().unwrap_or(0),
        }
    }
}

/// モデルストア
#[derive(Default)]
pub struct ModelStore {
    models: RwLock<Models>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// エンティティの現在の世代
    pub async fn generation(&self, entity_id: &EntityId) -> Generation {
        self.models.read().await.generation(entity_id)
    }

    /// 世代が `generation` のままか
    pub async fn is_current(&self, entity_id: &EntityId, generation: Generation) -> bool {
        self.models.read().await.generation(entity_id) == generation
    }

    /// エンティティの学習結果を一括で反映
    pub async fn commit(&self, update: EntityModels) {
        let generation = self.generation(&update.entity_id).await;
        self.commit_if_current(update, generation).await;
    }

    /// 世代が変わっていなければ学習結果を反映
    ///
    /// 世代の確認と反映は同じ書き込みロック内で行う。学習中に登録解除・全削除された
    /// 場合は何も反映せず `false` を返す。
    pub async fn commit_if_current(&self, update: EntityModels, generation: Generation) -> bool {
        if update.is_empty() {
            return self.is_current(&update.entity_id, generation).await;
        }

        let statistical: Vec<(ModelKey, Arc<StatisticalModel>)> = update
            .statistical
            .into_iter()
            .map(|m| (m.key.clone(), Arc::new(m)))
            .collect();
        let seasonal = update.seasonal.map(Arc::new);
        let correlation = update.correlation.map(Arc::new);

        let mut models = self.models.write().await;
        if models.generation(&update.entity_id) != generation {
            drop(models);
            debug!(entity = %update.entity_id, "Entity removed during training, discarding models");
            return false;
        }
        let replaced = statistical.len();
        for (key, model) in statistical {
            models.statistical.insert(key, model);
        }
        if let Some(profile) = seasonal {
            models.seasonal.insert(update.entity_id.clone(), profile);
        }
        if let Some(profile) = correlation {
            models.correlation.insert(update.entity_id.clone(), profile);
        }
        drop(models);

        debug!(entity = %update.entity_id, statistical = replaced, "Models committed");
        true
    }

    /// 永続化済みモデルを1件投入（ウォームスタート用）
    pub async fn insert(&self, model: PersistedModel) {
        let mut models = self.models.write().await;
        match model {
            PersistedModel::Statistical(m) => {
                models.statistical.insert(m.key.clone(), Arc::new(m));
            }
            PersistedModel::Seasonal(p) => {
                models.seasonal.insert(p.entity_id.clone(), Arc::new(p));
            }
            PersistedModel::Correlation(p) => {
                models.correlation.insert(p.entity_id.clone(), Arc::new(p));
            }
        }
    }

    pub async fn statistical(&self, key: &ModelKey) -> Option<Arc<StatisticalModel>> {
        self.models.read().await.statistical.get(key).cloned()
    }

    pub async fn seasonal(&self, entity_id: &EntityId) -> Option<Arc<SeasonalProfile>> {
        self.models.read().await.seasonal.get(entity_id).cloned()
    }

    pub async fn correlation(&self, entity_id: &EntityId) -> Option<Arc<CorrelationProfile>> {
        self.models.read().await.correlation.get(entity_id).cloned()
    }

    /// エンティティの統計モデル一覧（メトリクス名順）
    pub async fn statistical_for_entity(
        &self,
        entity_id: &EntityId,
    ) -> Vec<Arc<StatisticalModel>> {
        let models = self.models.read().await;
        let mut found: Vec<Arc<StatisticalModel>> = models
            .statistical
            .iter()
            .filter(|(key, _)| &key.entity_id == entity_id)
            .map(|(_, model)| model.clone())
            .collect();
        found.sort_by(|a, b| a.key.metric.cmp(&b.key.metric));
        found
    }

    /// 学習済みメトリクス名
    pub async fn trained_metrics(&self, entity_id: &EntityId) -> Vec<MetricName> {
        self.statistical_for_entity(entity_id)
            .await
            .iter()
            .map(|m| m.key.metric.clone())
            .collect()
    }

    /// モデルを持つエンティティ一覧
    pub async fn entities(&self) -> Vec<EntityId> {
        let models = self.models.read().await;
        let entities: BTreeSet<EntityId> = models
            .statistical
            .keys()
            .map(|k| k.entity_id.clone())
            .chain(models.seasonal.keys().cloned())
            .chain(models.correlation.keys().cloned())
            .collect();
        entities.into_iter().collect()
    }

    /// エンティティの全モデルを削除
    pub async fn remove_entity(&self, entity_id: &EntityId) -> usize {
        let mut models = self.models.write().await;
        let before = models.statistical.len();
        models.statistical.retain(|key, _| &key.entity_id != entity_id);
        let mut removed = before - models.statistical.len();
        removed += usize::from(models.seasonal.remove(entity_id).is_some());
        removed += usize::from(models.correlation.remove(entity_id).is_some());
        *models.removals.entry(entity_id.clone()).or_insert(0) += 1;
        removed
    }

    /// 全モデルを削除
    pub async fn clear(&self) {
        let mut models = self.models.write().await;
        models.statistical.clear();
        models.seasonal.clear();
        models.correlation.clear();
        models.removals.clear();
        models.epoch += 1;
    }

    /// ストア統計
    pub async fn stats(&self) -> StoreStats {
        let entities = self.entities().await.len();
        let models = self.models.read().await;
        StoreStats {
            statistical_models: models.statistical.len(),
            seasonal_profiles: models.seasonal.len(),
            correlation_profiles: models.correlation.len(),
            entities,
        }
    }
}
