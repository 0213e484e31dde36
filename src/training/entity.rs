//! Entity Training Unit
//!
//! 1エンティティ分の全モデル（統計・季節性・相関）を同一スナップショットから順に学習する

use super::{CorrelationModelTrainer, SeasonalDecomposer, StatisticalModelTrainer, TrainingOutcome};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::interfaces::{HistoricalDataSource, ModelPersistence, PersistedModel, PersistenceKey};
use crate::model::{group_by_metric, EntityId, MetricName, MetricWindow, ModelKey};
use crate::scheduler::Clock;
use crate::store::{EntityModels, ModelStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// メトリクスごとの学習結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricTrainingStatus {
    /// 学習済み
    Trained { data_points: usize },
    /// データ不足（前回のモデルを維持）
    InsufficientData { required: usize, actual: usize },
}

/// エンティティ学習レポート
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityTrainingReport {
    pub entity_id: EntityId,
    pub metrics: BTreeMap<MetricName, MetricTrainingStatus>,
    pub seasonal_trained: bool,
    /// 学習できた相関ペア数
    pub correlation_pairs: usize,
    /// 保存に失敗したモデル数
    pub persistence_failures: usize,
    pub trained_at: DateTime<Utc>,
}

impl EntityTrainingReport {
    /// 学習できた統計モデル数
    pub fn trained_count(&self) -> usize {
        self.metrics
            .values()
            .filter(|s| matches!(s, MetricTrainingStatus::Trained { .. }))
            .count()
    }
}

/// エンティティ学習器
pub struct EntityTrainer {
    config: Arc<EngineConfig>,
    statistical: StatisticalModelTrainer,
    seasonal: SeasonalDecomposer,
    correlation: CorrelationModelTrainer,
    source: Arc<dyn HistoricalDataSource>,
    persistence: Arc<dyn ModelPersistence>,
    store: Arc<ModelStore>,
    clock: Arc<dyn Clock>,
}

impl EntityTrainer {
    pub fn new(
        config: Arc<EngineConfig>,
        source: Arc<dyn HistoricalDataSource>,
        persistence: Arc<dyn ModelPersistence>,
        store: Arc<ModelStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            statistical: StatisticalModelTrainer::new(config.training.clone()),
            seasonal: SeasonalDecomposer::new(
                config.metric_names(),
                config.training.seasonal_min_span(),
            ),
            correlation: CorrelationModelTrainer::new(config.training.min_correlation_points),
            config,
            source,
            persistence,
            store,
            clock,
        }
    }

    /// エンティティの全モデルを学習してストアへ反映
    ///
    /// 取得失敗時はストアに触れず `Error::UpstreamFetch` を返す（前回のモデルが有効のまま）。
    /// 学習中にエンティティが削除された場合は何も反映・保存せず `Error::EntityRemoved` を返す。
    pub async fn train(&self, entity_id: &EntityId) -> Result<EntityTrainingReport> {
        let generation = self.store.generation(entity_id).await;
        let trained_at = self.clock.now();
        let start = trained_at - self.config.training.history_window();
        let tracked = self.config.metric_names();

        info!(entity = %entity_id, "Training entity models");

        let samples = self
            .source
            .fetch(entity_id, &tracked, start, trained_at)
            .await
            .map_err(|e| match e {
                Error::UpstreamFetch { .. } => e,
                other => Error::upstream(entity_id, other),
            })?;

        let samples: Vec<_> = samples
            .into_iter()
            .filter(|s| &s.entity_id == entity_id && tracked.contains(&s.metric))
            .collect();
        let windows = group_by_metric(&samples);

        let mut update = EntityModels::new(entity_id.clone());
        let mut statuses = BTreeMap::new();
        let empty = MetricWindow::default();

        for spec in &self.config.metrics {
            let window = windows.get(&spec.name).unwrap_or(&empty);
            let key = ModelKey::new(entity_id.clone(), spec.name.clone());
            let status = match self.statistical.train(key, window, spec.domain, trained_at) {
                TrainingOutcome::Trained(model) => {
                    let data_points = model.data_point_count;
                    update.statistical.push(model);
                    MetricTrainingStatus::Trained { data_points }
                }
                TrainingOutcome::InsufficientData {
                    required, actual, ..
                } => {
                    info!(
                        entity = %entity_id,
                        metric = %spec.name,
                        required,
                        actual,
                        "Insufficient data, keeping previous model"
                    );
                    MetricTrainingStatus::InsufficientData { required, actual }
                }
            };
            statuses.insert(spec.name.clone(), status);
        }

        match self.seasonal.decompose(entity_id, &samples, trained_at) {
            TrainingOutcome::Trained(profile) => update.seasonal = Some(profile),
            TrainingOutcome::InsufficientData {
                required, actual, unit,
            } => debug!(
                entity = %entity_id,
                required,
                actual,
                unit,
                "Seasonal profile skipped"
            ),
        }

        let correlation = self.correlation.train(entity_id, &windows, trained_at);
        let correlation_pairs = correlation.correlations.len();
        if !correlation.is_empty() {
            update.correlation = Some(correlation);
        }

        let seasonal_trained = update.seasonal.is_some();
        let entries = persisted_entries(&update);
        if !self.store.commit_if_current(update, generation).await {
            info!(entity = %entity_id, "Entity removed during training, models discarded");
            return Err(Error::EntityRemoved(entity_id.to_string()));
        }

        let persistence_failures = self.persist(entity_id, entries).await;
        // 保存中に削除された場合、削除側のファイル削除より前に書いた分を取り消す
        if !self.store.is_current(entity_id, generation).await {
            if let Err(e) = self.persistence.remove_entity(entity_id).await {
                warn!(entity = %entity_id, error = %e, "Failed to remove models of removed entity");
            }
            info!(entity = %entity_id, "Entity removed while persisting, models discarded");
            return Err(Error::EntityRemoved(entity_id.to_string()));
        }

        let report = EntityTrainingReport {
            entity_id: entity_id.clone(),
            metrics: statuses,
            seasonal_trained,
            correlation_pairs,
            persistence_failures,
            trained_at,
        };

        info!(
            entity = %entity_id,
            trained = report.trained_count(),
            metrics = report.metrics.len(),
            seasonal = report.seasonal_trained,
            correlation_pairs,
            "Entity training completed"
        );
        Ok(report)
    }

    /// 学習結果を保存（失敗はログに残して続行）
    async fn persist(
        &self,
        entity_id: &EntityId,
        entries: Vec<(PersistenceKey, PersistedModel)>,
    ) -> usize {
        let mut failures = 0;
        for (key, model) in entries {
            if let Err(e) = self.persistence.save(&key, &model).await {
                failures += 1;
                warn!(entity = %entity_id, error = %e, "Failed to persist model");
            }
        }
        failures
    }
}

fn persisted_entries(update: &EntityModels) -> Vec<(PersistenceKey, PersistedModel)> {
    let mut entries: Vec<(PersistenceKey, PersistedModel)> = update
        .statistical
        .iter()
        .map(|m| {
            (
                PersistenceKey::Statistical(m.key.clone()),
                PersistedModel::Statistical(m.clone()),
            )
        })
        .collect();
    if let Some(profile) = &update.seasonal {
        entries.push((
            PersistenceKey::Seasonal(update.entity_id.clone()),
            PersistedModel::Seasonal(profile.clone()),
        ));
    }
    if let Some(profile) = &update.correlation {
        entries.push((
            PersistenceKey::Correlation(update.entity_id.clone()),
            PersistedModel::Correlation(profile.clone()),
        ));
    }
    entries
}
