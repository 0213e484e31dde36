//! Anomaly Engine
//!
//! 依存関係を注入して一度だけ構築するコンポジションルート。
//! 設定の検証は構築時に行い、不正な設定ではスケジューリングを開始しない。

use crate::config::EngineConfig;
use crate::detection::{AnomalyScorer, ScoreHistory, ScoreOutcome};
use crate::error::{Error, Result};
use crate::interfaces::{
    AlertSink, EntityRegistry, HistoricalDataSource, LogAlertSink, ModelPersistence,
    NoopPersistence, PersistenceKey,
};
use crate::model::{EntityId, MetricName, MetricSample, ModelKey};
use crate::prediction::{Forecast, Forecaster};
use crate::scheduler::{
    Clock, DetectionLoop, DetectionReport, IntervalTicker, RequestOutcome, SystemClock, Ticker,
    TrainingScheduler, TrainingScope,
};
use crate::store::{ModelStore, StoreStats};
use crate::training::EntityTrainer;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// エンジンビルダー
pub struct AnomalyEngineBuilder {
    config: EngineConfig,
    source: Option<Arc<dyn HistoricalDataSource>>,
    registry: Option<Arc<dyn EntityRegistry>>,
    sink: Option<Arc<dyn AlertSink>>,
    persistence: Option<Arc<dyn ModelPersistence>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AnomalyEngineBuilder {
    pub fn data_source(mut self, source: Arc<dyn HistoricalDataSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn EntityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 通知先（省略時は `LogAlertSink`）
    pub fn sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 永続化（省略時は永続化なし）
    pub fn persistence(mut self, persistence: Arc<dyn ModelPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// 時計（省略時はシステム時計）
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 設定を検証してエンジンを構築
    pub fn build(self) -> Result<AnomalyEngine> {
        self.config.validate()?;

        let source = self
            .source
            .ok_or_else(|| Error::Configuration("a historical data source is required".into()))?;
        let registry = self
            .registry
            .ok_or_else(|| Error::Configuration("an entity registry is required".into()))?;
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogAlertSink));
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(NoopPersistence));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let config = Arc::new(self.config);
        let store = Arc::new(ModelStore::new());
        let history = Arc::new(ScoreHistory::new(config.detection.score_history_size));

        let trainer = Arc::new(EntityTrainer::new(
            config.clone(),
            source.clone(),
            persistence.clone(),
            store.clone(),
            clock.clone(),
        ));
        let training = Arc::new(TrainingScheduler::new(
            trainer,
            registry.clone(),
            config.scheduler.clone(),
            clock.clone(),
        ));
        let detection = Arc::new(DetectionLoop::new(
            config.clone(),
            store.clone(),
            source,
            registry.clone(),
            sink,
            clock.clone(),
            history.clone(),
        ));

        info!(
            metrics = config.metrics.len(),
            min_data_points = config.training.min_data_points,
            "Anomaly engine built"
        );

        Ok(AnomalyEngine {
            scorer: AnomalyScorer::new(config.detection.clone()),
            forecaster: Forecaster::new(config.forecast.clone()),
            config,
            store,
            history,
            training,
            detection,
            registry,
            persistence,
            clock,
        })
    }
}

/// 異常検知・予測エンジン
pub struct AnomalyEngine {
    config: Arc<EngineConfig>,
    store: Arc<ModelStore>,
    history: Arc<ScoreHistory>,
    training: Arc<TrainingScheduler>,
    detection: Arc<DetectionLoop>,
    registry: Arc<dyn EntityRegistry>,
    persistence: Arc<dyn ModelPersistence>,
    clock: Arc<dyn Clock>,
    scorer: AnomalyScorer,
    forecaster: Forecaster,
}

impl AnomalyEngine {
    pub fn builder(config: EngineConfig) -> AnomalyEngineBuilder {
        AnomalyEngineBuilder {
            config,
            source: None,
            registry: None,
            sink: None,
            persistence: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    pub fn score_history(&self) -> &Arc<ScoreHistory> {
        &self.history
    }

    pub fn training_scheduler(&self) -> &Arc<TrainingScheduler> {
        &self.training
    }

    pub fn detection_loop(&self) -> &Arc<DetectionLoop> {
        &self.detection
    }

    /// 即時学習（実行中スコープへのリクエストは破棄）
    pub async fn train_now(&self, scope: TrainingScope) -> Result<RequestOutcome> {
        self.training
            .request(scope, &CancellationToken::new())
            .await
    }

    /// 即時に検知サイクルを1回実行
    pub async fn detect_now(&self) -> Result<DetectionReport> {
        self.detection.run_cycle().await
    }

    /// サンプル1件をスコアリング（履歴に記録、イベントは発行しない）
    pub async fn score(&self, sample: &MetricSample) -> Result<ScoreOutcome> {
        let outcome = self
            .scorer
            .score_sample(&self.store, sample, self.config.domain(&sample.metric))
            .await?;
        self.history.record(outcome.clone()).await;
        Ok(outcome)
    }

    /// 予測（`horizon` 省略時は既定値）
    pub async fn forecast(
        &self,
        entity_id: &EntityId,
        metric: &MetricName,
        horizon: Option<usize>,
    ) -> Result<Forecast> {
        self.forecaster
            .forecast(
                &self.store,
                entity_id,
                metric,
                horizon,
                self.config.domain(metric),
                self.clock.now(),
            )
            .await
    }

    /// モデル統計
    pub async fn model_stats(&self) -> StoreStats {
        self.store.stats().await
    }

    /// 永続化済みモデルをアクティブなエンティティ分読み込む
    ///
    /// 見つからないモデルは無視し、読み込みエラーはログに残して続行する。
    pub async fn warm_start(&self) -> Result<usize> {
        let entities = self.registry.list_active_entities().await?;
        let mut loaded = 0;

        for entity_id in &entities {
            let mut keys: Vec<PersistenceKey> = self
                .config
                .metric_names()
                .into_iter()
                .map(|metric| PersistenceKey::Statistical(ModelKey::new(entity_id.clone(), metric)))
                .collect();
            keys.push(PersistenceKey::Seasonal(entity_id.clone()));
            keys.push(PersistenceKey::Correlation(entity_id.clone()));

            for key in keys {
                match self.persistence.load(&key).await {
                    Ok(Some(model)) => {
                        self.store.insert(model).await;
                        loaded += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(entity = %entity_id, error = %e, "Failed to load model"),
                }
            }
        }

        info!(entities = entities.len(), models = loaded, "Warm start completed");
        Ok(loaded)
    }

    /// エンティティを登録解除し、モデルを削除
    pub async fn deregister_entity(&self, entity_id: &EntityId) -> Result<()> {
        self.registry.deregister(entity_id).await?;
        let removed = self.store.remove_entity(entity_id).await;
        self.history.remove_entity(entity_id).await;
        self.detection.forget_entity(entity_id).await;
        if let Err(e) = self.persistence.remove_entity(entity_id).await {
            warn!(entity = %entity_id, error = %e, "Failed to remove persisted models");
        }
        info!(entity = %entity_id, removed, "Entity deregistered");
        Ok(())
    }

    /// 全モデルを破棄
    pub async fn reset(&self) {
        self.store.clear().await;
        self.history.clear().await;
        self.detection.clear_predictions().await;
        info!("All models reset");
    }

    /// 既定のインターバルで学習・検知ループを開始
    pub fn start(&self) -> EngineHandle {
        self.start_with(
            IntervalTicker::new(self.config.scheduler.training_interval()),
            IntervalTicker::new(self.config.scheduler.detection_interval()),
        )
    }

    /// 任意のティック源で学習・検知ループを開始
    pub fn start_with<T, D>(&self, training_ticker: T, detection_ticker: D) -> EngineHandle
    where
        T: Ticker + 'static,
        D: Ticker + 'static,
    {
        let cancel = CancellationToken::new();

        let training = {
            let scheduler = self.training.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(training_ticker, cancel).await })
        };
        let detection = {
            let detection = self.detection.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { detection.run(detection_ticker, cancel).await })
        };

        EngineHandle {
            cancel,
            tasks: vec![training, detection],
        }
    }
}

/// 実行中ループのハンドル
pub struct EngineHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// グレースフルシャットダウン
    ///
    /// 新しいサイクル・エンティティの開始を止め、実行中の学習の完了を待つ
    /// （エンティティごとのタイムアウトで上限あり）。
    pub async fn shutdown(self) {
        info!("Shutting down anomaly engine");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        debug!("Anomaly engine stopped");
    }
}
