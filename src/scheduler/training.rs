//! Training Scheduler
//!
//! 学習サイクルの周期実行と明示的リクエスト。
//! スコープごとに単一実行（実行中スコープへの重複リクエストは破棄）。

use super::{Clock, EntityFailure, Ticker};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::interfaces::EntityRegistry;
use crate::model::EntityId;
use crate::training::{EntityTrainer, EntityTrainingReport};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 学習スコープ
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingScope {
    /// 全アクティブエンティティ
    All,
    /// 単一エンティティ
    Entity(EntityId),
}

impl fmt::Display for TrainingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingScope::All => f.write_str("all"),
            TrainingScope::Entity(id) => write!(f, "entity:{}", id),
        }
    }
}

/// スケジューラ状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Training,
}

/// 学習リクエストの結果
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// 実行完了
    Completed(TrainingCycleReport),
    /// 同一スコープが実行中のため破棄
    AlreadyRunning,
}

impl RequestOutcome {
    pub fn report(&self) -> Option<&TrainingCycleReport> {
        match self {
            RequestOutcome::Completed(report) => Some(report),
            RequestOutcome::AlreadyRunning => None,
        }
    }
}

/// 学習サイクルのレポート
#[derive(Debug, Clone, Serialize)]
pub struct TrainingCycleReport {
    pub scope: TrainingScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// エンティティID順
    pub trained: Vec<EntityTrainingReport>,
    pub failures: Vec<EntityFailure>,
    /// 他の実行がロック中、またはキャンセルで未着手のエンティティ
    pub skipped: Vec<EntityId>,
    pub cancelled: bool,
}

enum EntityResult {
    Trained(EntityTrainingReport),
    Failed(EntityFailure),
    Skipped(EntityId),
}

#[derive(Default)]
struct Locks {
    all: bool,
    entities: HashSet<EntityId>,
    active: usize,
}

/// スコープのロック（ドロップで解放）
struct ScopeGuard<'a> {
    scheduler: &'a TrainingScheduler,
    scope: TrainingScope,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.scheduler.lock_state();
        match &self.scope {
            TrainingScope::All => locks.all = false,
            TrainingScope::Entity(id) => {
                locks.entities.remove(id);
            }
        }
        locks.active = locks.active.saturating_sub(1);
        if locks.active == 0 {
            self.scheduler.state.send_replace(SchedulerState::Idle);
        }
    }
}

/// 学習スケジューラ
pub struct TrainingScheduler {
    trainer: Arc<EntityTrainer>,
    registry: Arc<dyn EntityRegistry>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    locks: Mutex<Locks>,
    state: watch::Sender<SchedulerState>,
    cycles: watch::Sender<u64>,
}

impl TrainingScheduler {
    pub fn new(
        trainer: Arc<EntityTrainer>,
        registry: Arc<dyn EntityRegistry>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        let (cycles, _) = watch::channel(0);
        Self {
            trainer,
            registry,
            config,
            clock,
            locks: Mutex::new(Locks::default()),
            state,
            cycles,
        }
    }

    /// 現在の状態
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// 状態変化を購読
    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// 完了したリクエスト数を購読
    pub fn subscribe_cycles(&self) -> watch::Receiver<u64> {
        self.cycles.subscribe()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Locks> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_acquire(&self, scope: &TrainingScope) -> Option<ScopeGuard<'_>> {
        let mut locks = self.lock_state();
        let acquired = match scope {
            TrainingScope::All => !std::mem::replace(&mut locks.all, true),
            TrainingScope::Entity(id) => locks.entities.insert(id.clone()),
        };
        if !acquired {
            return None;
        }
        locks.active += 1;
        self.state.send_replace(SchedulerState::Training);
        Some(ScopeGuard {
            scheduler: self,
            scope: scope.clone(),
        })
    }

    /// 学習をリクエスト
    ///
    /// 同一スコープが実行中なら待たずに `AlreadyRunning` を返す。
    /// キャンセル後は未着手のエンティティを開始しない。
    pub async fn request(
        &self,
        scope: TrainingScope,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome> {
        let Some(_guard) = self.try_acquire(&scope) else {
            debug!(scope = %scope, "Training already running, request dropped");
            return Ok(RequestOutcome::AlreadyRunning);
        };

        let started_at = self.clock.now();
        let results = match &scope {
            TrainingScope::All => self.train_all(cancel).await?,
            TrainingScope::Entity(id) => vec![self.train_one(id.clone()).await],
        };

        let mut report = TrainingCycleReport {
            scope,
            started_at,
            finished_at: self.clock.now(),
            trained: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            cancelled: cancel.is_cancelled(),
        };
        for result in results {
            match result {
                EntityResult::Trained(r) => report.trained.push(r),
                EntityResult::Failed(f) => report.failures.push(f),
                EntityResult::Skipped(id) => report.skipped.push(id),
            }
        }
        report.trained.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        report.failures.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        report.skipped.sort();

        info!(
            scope = %report.scope,
            trained = report.trained.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "Training cycle completed"
        );
        self.cycles.send_modify(|count| *count += 1);
        Ok(RequestOutcome::Completed(report))
    }

    async fn train_all(&self, cancel: &CancellationToken) -> Result<Vec<EntityResult>> {
        let entities = self.registry.list_active_entities().await?;
        debug!(entities = entities.len(), "Starting training for active entities");

        Ok(stream::iter(entities)
            .map(|entity| async move {
                if cancel.is_cancelled() {
                    return EntityResult::Skipped(entity);
                }
                let scope = TrainingScope::Entity(entity.clone());
                let Some(_guard) = self.try_acquire(&scope) else {
                    debug!(entity = %entity, "Entity locked by another run, skipping");
                    return EntityResult::Skipped(entity);
                };
                self.train_bounded(entity).await
            })
            .buffer_unordered(self.config.max_concurrent_entities.max(1))
            .collect()
            .await)
    }

    async fn train_one(&self, entity: EntityId) -> EntityResult {
        // スコープロックは request で取得済み
        self.train_bounded(entity).await
    }

    /// タイムアウト付きでエンティティを学習
    async fn train_bounded(&self, entity: EntityId) -> EntityResult {
        let timeout = self.config.entity_training_timeout();
        let result = match tokio::time::timeout(timeout, self.trainer.train(&entity)).await {
            Ok(result) => result,
            Err(_) => Err(Error::TrainingTimeout {
                entity: entity.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        };

        match result {
            Ok(report) => EntityResult::Trained(report),
            Err(e) => {
                warn!(entity = %entity, error = %e, class = ?e.class(), "Entity training failed");
                EntityResult::Failed(EntityFailure::new(entity, &e))
            }
        }
    }

    /// 周期実行ループ（キャンセルまで）
    pub async fn run<T: Ticker>(&self, mut ticker: T, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.training_interval_secs,
            "Training scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ticked = ticker.tick() => {
                    if !ticked {
                        break;
                    }
                    match self.request(TrainingScope::All, &cancel).await {
                        Ok(RequestOutcome::Completed(_)) => {}
                        Ok(RequestOutcome::AlreadyRunning) => {
                            debug!("Scheduled training skipped, previous cycle still running");
                        }
                        Err(e) => warn!(error = %e, "Training cycle failed"),
                    }
                }
            }
        }

        info!("Training scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::interfaces::{
        HistoricalDataSource, InMemoryDataSource, InMemoryEntityRegistry, NoopPersistence,
    };
    use crate::model::{MetricName, MetricSample};
    use crate::scheduler::{ManualClock, ManualTicker};
    use crate::store::ModelStore;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap()
    }

    fn history(entity: &str) -> Vec<MetricSample> {
        (0..150)
            .map(|i| {
                MetricSample::new(
                    entity,
                    "cpu_usage",
                    now() - Duration::minutes(10 * (i + 1)),
                    30.0 + (i % 7) as f64,
                )
            })
            .collect()
    }

    /// 指定エンティティの取得だけ遅延させるデータソース
    struct SlowSource {
        inner: InMemoryDataSource,
        slow: EntityId,
        delay: StdDuration,
    }

    #[async_trait]
    impl HistoricalDataSource for SlowSource {
        async fn fetch(
            &self,
            entity_id: &EntityId,
            metrics: &[MetricName],
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<MetricSample>> {
            if entity_id == &self.slow {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.fetch(entity_id, metrics, start, end).await
        }
    }

    fn scheduler(
        source: Arc<dyn HistoricalDataSource>,
        entities: &[&str],
        store: Arc<ModelStore>,
    ) -> TrainingScheduler {
        let config = Arc::new(EngineConfig::default());
        let clock = Arc::new(ManualClock::new(now()));
        let trainer = Arc::new(EntityTrainer::new(
            config.clone(),
            source,
            Arc::new(NoopPersistence),
            store,
            clock.clone(),
        ));
        let registry = Arc::new(InMemoryEntityRegistry::new(
            entities.iter().map(|e| EntityId::new(*e)),
        ));
        TrainingScheduler::new(trainer, registry, config.scheduler.clone(), clock)
    }

    #[tokio::test]
    async fn test_request_all_trains_every_entity() {
        let mut samples = history("a");
        samples.extend(history("b"));
        let store = Arc::new(ModelStore::new());
        let scheduler = scheduler(
            Arc::new(InMemoryDataSource::with_samples(samples)),
            &["a", "b", "c"],
            store.clone(),
        );

        let outcome = scheduler
            .request(TrainingScope::All, &CancellationToken::new())
            .await
            .unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.trained.len(), 3);
        assert_eq!(report.trained[0].trained_count(), 1);
        // c は履歴なし → データ不足（エラーではない）
        assert_eq!(report.trained[2].trained_count(), 0);
        assert!(report.failures.is_empty());
        assert_eq!(store.stats().await.statistical_models, 2);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(*scheduler.subscribe_cycles().borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_request_for_same_scope_is_dropped() {
        let source = SlowSource {
            inner: InMemoryDataSource::with_samples(history("a")),
            slow: "a".into(),
            delay: StdDuration::from_secs(5),
        };
        let scheduler = Arc::new(scheduler(
            Arc::new(source),
            &["a"],
            Arc::new(ModelStore::new()),
        ));
        let cancel = CancellationToken::new();

        let running = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                scheduler
                    .request(TrainingScope::Entity("a".into()), &cancel)
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(scheduler.state(), SchedulerState::Training);

        let dropped = scheduler
            .request(TrainingScope::Entity("a".into()), &cancel)
            .await
            .unwrap();
        assert!(matches!(dropped, RequestOutcome::AlreadyRunning));

        // エンティティ a がロック中なので All サイクルでは skip される
        let all = scheduler.request(TrainingScope::All, &cancel).await.unwrap();
        assert_eq!(all.report().unwrap().skipped, vec![EntityId::new("a")]);

        let first = running.await.unwrap().unwrap();
        assert_eq!(first.report().unwrap().trained.len(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_entity_times_out() {
        let mut samples = history("fast");
        samples.extend(history("slow"));
        let source = SlowSource {
            inner: InMemoryDataSource::with_samples(samples),
            slow: "slow".into(),
            delay: StdDuration::from_secs(3600),
        };
        let scheduler = scheduler(Arc::new(source), &["fast", "slow"], Arc::new(ModelStore::new()));

        let outcome = scheduler
            .request(TrainingScope::All, &CancellationToken::new())
            .await
            .unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.trained.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity_id, EntityId::new("slow"));
        assert_eq!(
            report.failures[0].class,
            crate::error::ErrorClass::Recoverable
        );
        assert!(report.failures[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_starts_no_entities() {
        let scheduler = scheduler(
            Arc::new(InMemoryDataSource::with_samples(history("a"))),
            &["a", "b"],
            Arc::new(ModelStore::new()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = scheduler.request(TrainingScope::All, &cancel).await.unwrap();
        let report = outcome.report().unwrap();
        assert!(report.cancelled);
        assert!(report.trained.is_empty());
        assert_eq!(report.skipped.len(), 2);
    }

    #[tokio::test]
    async fn test_run_loop_until_cancelled() {
        let store = Arc::new(ModelStore::new());
        let scheduler = Arc::new(scheduler(
            Arc::new(InMemoryDataSource::with_samples(history("a"))),
            &["a"],
            store.clone(),
        ));
        let (ticker, handle) = ManualTicker::new();
        let cancel = CancellationToken::new();
        let mut cycles = scheduler.subscribe_cycles();

        let task = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(ticker, cancel).await })
        };

        assert!(handle.tick());
        cycles.changed().await.unwrap();
        assert_eq!(*cycles.borrow(), 1);
        assert_eq!(store.stats().await.statistical_models, 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
