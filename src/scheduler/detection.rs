//! Detection Loop
//!
//! 登録エンティティを周期的にスキャンし、異常イベントを通知先へ転送する
//!
//! 予測イベントは対象時刻を過ぎるか重大度が上がるまで再発報しない。

use super::{Clock, EntityFailure, Ticker};
use crate::config::EngineConfig;
use crate::detection::{
    AnomalyEvent, AnomalyScorer, AnomalySubject, CorrelationAnomalyDetector, ScoreHistory, Severity,
};
use crate::error::{Error, Result};
use crate::interfaces::{AlertSink, EntityRegistry, HistoricalDataSource};
use crate::model::{group_by_metric, EntityId, MetricName, ModelKey};
use crate::prediction::Forecaster;
use crate::store::ModelStore;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// 検知サイクルのレポート
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub started_at: DateTime<Utc>,
    pub entities_scanned: usize,
    /// 記録したスコア数（発報しないものを含む）
    pub scores_recorded: usize,
    pub events_emitted: usize,
    /// エンティティID順
    pub failures: Vec<EntityFailure>,
}

/// 発報済みで対象時刻が未到来の予測
#[derive(Debug, Clone, Copy)]
struct OutstandingForecast {
    target_time: DateTime<Utc>,
    severity: Severity,
}

struct EntityScan {
    scores: usize,
    events: Vec<AnomalyEvent>,
}

/// 検知ループ
pub struct DetectionLoop {
    config: Arc<EngineConfig>,
    store: Arc<ModelStore>,
    source: Arc<dyn HistoricalDataSource>,
    registry: Arc<dyn EntityRegistry>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    history: Arc<ScoreHistory>,
    scorer: AnomalyScorer,
    correlation: CorrelationAnomalyDetector,
    forecaster: Forecaster,
    predicted: Mutex<HashMap<ModelKey, OutstandingForecast>>,
    cycles: watch::Sender<u64>,
}

impl DetectionLoop {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<ModelStore>,
        source: Arc<dyn HistoricalDataSource>,
        registry: Arc<dyn EntityRegistry>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        history: Arc<ScoreHistory>,
    ) -> Self {
        let (cycles, _) = watch::channel(0);
        Self {
            scorer: AnomalyScorer::new(config.detection.clone()),
            correlation: CorrelationAnomalyDetector::new(config.detection.clone()),
            forecaster: Forecaster::new(config.forecast.clone()),
            config,
            store,
            source,
            registry,
            sink,
            clock,
            history,
            predicted: Mutex::new(HashMap::new()),
            cycles,
        }
    }

    /// 完了したサイクル数を購読
    pub fn subscribe_cycles(&self) -> watch::Receiver<u64> {
        self.cycles.subscribe()
    }

    /// 1サイクル実行
    ///
    /// レジストリ取得の失敗のみサイクル全体のエラー。エンティティ単位の失敗はレポートに記録する。
    pub async fn run_cycle(&self) -> Result<DetectionReport> {
        let started_at = self.clock.now();
        let entities = self.registry.list_active_entities().await?;
        let concurrency = self.config.scheduler.max_concurrent_entities.max(1);

        let scans: Vec<(EntityId, Result<EntityScan>)> = stream::iter(entities)
            .map(|entity| async move {
                let scan = self.scan_entity(&entity, started_at).await;
                (entity, scan)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = DetectionReport {
            started_at,
            entities_scanned: scans.len(),
            scores_recorded: 0,
            events_emitted: 0,
            failures: Vec::new(),
        };

        for (entity, scan) in scans {
            match scan {
                Ok(scan) => {
                    report.scores_recorded += scan.scores;
                    for event in scan.events {
                        debug!(
                            entity = %event.entity_id,
                            metric = %event.metric_label(),
                            severity = %event.severity,
                            score = event.anomaly_score,
                            "Publishing anomaly event"
                        );
                        self.sink.publish(event).await;
                        report.events_emitted += 1;
                    }
                }
                Err(e) => {
                    warn!(entity = %entity, error = %e, class = ?e.class(), "Entity scan failed");
                    report.failures.push(EntityFailure::new(entity, &e));
                }
            }
        }
        report.failures.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        info!(
            entities = report.entities_scanned,
            scores = report.scores_recorded,
            events = report.events_emitted,
            failed = report.failures.len(),
            "Detection cycle completed"
        );
        self.cycles.send_modify(|count| *count += 1);
        Ok(report)
    }

    /// エンティティ1件をスキャン
    async fn scan_entity(&self, entity_id: &EntityId, now: DateTime<Utc>) -> Result<EntityScan> {
        let tracked = self.config.metric_names();
        let samples = self
            .source
            .fetch(entity_id, &tracked, now - self.config.detection.lookback(), now)
            .await
            .map_err(|e| match e {
                Error::UpstreamFetch { .. } => e,
                other => Error::upstream(entity_id, other),
            })?;

        let samples: Vec<_> = samples
            .into_iter()
            .filter(|s| &s.entity_id == entity_id && s.value.is_finite())
            .collect();
        let windows = group_by_metric(&samples);

        let mut scan = EntityScan {
            scores: 0,
            events: Vec::new(),
        };
        let mut latest: BTreeMap<MetricName, f64> = BTreeMap::new();

        for (metric, window) in &windows {
            let Some(sample) = window.latest() else {
                continue;
            };
            latest.insert(metric.clone(), sample.value);

            let key = ModelKey::new(entity_id.clone(), metric.clone());
            let Some(model) = self.store.statistical(&key).await else {
                trace!(key = %key, "No model yet, skipping score");
                continue;
            };

            let outcome =
                self.scorer
                    .score(&model, sample.value, sample.timestamp, self.config.domain(metric));
            if let Some(event) = outcome.to_event() {
                scan.events.push(event);
            }
            self.history.record(outcome).await;
            scan.scores += 1;
        }

        if let Some(profile) = self.store.correlation(entity_id).await {
            scan.events
                .extend(self.correlation.detect(entity_id, &profile, &latest, now));
        }

        if self.config.detection.predictive_alerts {
            scan.events.extend(self.predictive_events(entity_id, now).await);
        }

        Ok(scan)
    }

    async fn predictive_events(&self, entity_id: &EntityId, now: DateTime<Utc>) -> Vec<AnomalyEvent> {
        let seasonal = self.store.seasonal(entity_id).await;
        let mut events = Vec::new();

        for model in self.store.statistical_for_entity(entity_id).await {
            let domain = self.config.domain(&model.key.metric);
            match self.forecaster.forecast_model(
                &model,
                seasonal.as_deref(),
                domain,
                now,
                self.config.forecast.default_horizon,
            ) {
                Ok(forecast) => {
                    let event = self.forecaster.predictive_event(&forecast, domain);
                    if let Some(event) = self.dedup_predictive(&model.key, event, now).await {
                        events.push(event);
                    }
                }
                Err(e) => debug!(key = %model.key, error = %e, "Forecast skipped"),
            }
        }
        events
    }

    /// 未到来の予測と同等以下の重大度なら抑止し、発報したものを記録する
    async fn dedup_predictive(
        &self,
        key: &ModelKey,
        event: Option<AnomalyEvent>,
        now: DateTime<Utc>,
    ) -> Option<AnomalyEvent> {
        let mut predicted = self.predicted.lock().await;
        let Some(event) = event else {
            predicted.remove(key);
            return None;
        };
        let AnomalySubject::Forecast { target_time, .. } = &event.subject else {
            return Some(event);
        };

        if let Some(outstanding) = predicted.get(key) {
            if outstanding.target_time > now && event.severity <= outstanding.severity {
                trace!(
                    key = %key,
                    target_time = %outstanding.target_time,
                    "Predictive alert already raised"
                );
                return None;
            }
        }
        predicted.insert(
            key.clone(),
            OutstandingForecast {
                target_time: *target_time,
                severity: event.severity,
            },
        );
        Some(event)
    }

    /// エンティティの予測発報履歴を破棄
    pub async fn forget_entity(&self, entity_id: &EntityId) {
        self.predicted
            .lock()
            .await
            .retain(|key, _| &key.entity_id != entity_id);
    }

    /// 全エンティティの予測発報履歴を破棄
    pub async fn clear_predictions(&self) {
        self.predicted.lock().await.clear();
    }

    /// 周期実行ループ（キャンセルまで）
    pub async fn run<T: Ticker>(&self, mut ticker: T, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.scheduler.detection_interval_secs,
            "Detection loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ticked = ticker.tick() => {
                    if !ticked {
                        break;
                    }
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "Detection cycle failed");
                    }
                }
            }
        }

        info!("Detection loop stopped");
    }
}
