use anomaly_rs::config::EngineConfig;
use anomaly_rs::detection::{DetectionMethod, Severity};
use anomaly_rs::interfaces::{
    EntityRegistry, HistoricalDataSource, InMemoryDataSource, InMemoryEntityRegistry,
    JsonFilePersistence, JsonLinesDataSource, MemoryAlertSink,
};
use anomaly_rs::model::{EntityId, MetricName, MetricSample, ModelKey, UnknownFieldPolicy};
use anomaly_rs::scheduler::{ManualClock, ManualTicker, TrainingScope};
use anomaly_rs::{AnomalyEngine, Error, ErrorClass, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::{Notify, RwLock};

const CPU: &str = "cpu_usage";
const MEMORY: &str = "memory_usage";

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

/// 1分間隔の履歴を生成
fn history(entity: &str, metric: &str, values: &[f64]) -> Vec<MetricSample> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| MetricSample::new(entity, metric, start_time() + Duration::minutes(i as i64), *v))
        .collect()
}

/// 履歴の直後の時刻
fn now_after(len: usize) -> DateTime<Utc> {
    start_time() + Duration::minutes(len as i64)
}

fn normal_values(seed: u64, count: usize, mean: f64, stddev: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            // Box-Muller
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            mean + stddev * z
        })
        .collect()
}

struct Harness {
    engine: AnomalyEngine,
    source: Arc<InMemoryDataSource>,
    registry: Arc<InMemoryEntityRegistry>,
    sink: Arc<MemoryAlertSink>,
    now: DateTime<Utc>,
}

fn harness(entities: &[&str], samples: Vec<MetricSample>, now: DateTime<Utc>) -> Harness {
    let source = Arc::new(InMemoryDataSource::with_samples(samples));
    let registry = Arc::new(InMemoryEntityRegistry::new(
        entities.iter().map(|e| EntityId::new(*e)),
    ));
    let sink = Arc::new(MemoryAlertSink::new());

    let engine = AnomalyEngine::builder(EngineConfig::default())
        .data_source(source.clone())
        .registry(registry.clone())
        .sink(sink.clone())
        .clock(Arc::new(ManualClock::new(now)))
        .build()
        .unwrap();

    Harness {
        engine,
        source,
        registry,
        sink,
        now,
    }
}

/// 指定エンティティの取得だけ失敗するデータソース（`recover` で復旧）
struct FailingFor {
    inner: InMemoryDataSource,
    failing: RwLock<Option<EntityId>>,
}

impl FailingFor {
    async fn recover(&self) {
        *self.failing.write().await = None;
    }
}

#[async_trait]
impl HistoricalDataSource for FailingFor {
    async fn fetch(
        &self,
        entity_id: &EntityId,
        metrics: &[MetricName],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        if self.failing.read().await.as_ref() == Some(entity_id) {
            return Err(Error::upstream(entity_id, "connection refused"));
        }
        self.inner.fetch(entity_id, metrics, start, end).await
    }
}

/// 取得開始を通知し、解放されるまで結果を返さないデータソース
struct GatedSource {
    inner: InMemoryDataSource,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl HistoricalDataSource for GatedSource {
    async fn fetch(
        &self,
        entity_id: &EntityId,
        metrics: &[MetricName],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.fetch(entity_id, metrics, start, end).await
    }
}

#[tokio::test]
async fn test_constant_baseline_flags_any_deviation_as_critical() {
    let samples = history("web-1", CPU, &[50.0; 120]);
    let h = harness(&["web-1"], samples, now_after(120));

    let outcome = h.engine.train_now(TrainingScope::All).await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.trained.len(), 1);
    assert!(report.failures.is_empty());

    let same = h
        .engine
        .score(&MetricSample::new("web-1", CPU, h.now, 50.0))
        .await
        .unwrap();
    assert_eq!(same.score, 0.0);
    assert!(!same.is_anomalous());

    h.source
        .extend([MetricSample::new("web-1", CPU, h.now - Duration::seconds(10), 60.0)])
        .await;
    let detection = h.engine.detect_now().await.unwrap();
    assert_eq!(detection.events_emitted, 1);

    let events = h.sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].anomaly_score, 1.0);
    assert_eq!(events[0].severity, Severity::Critical);
    assert_eq!(events[0].method, DetectionMethod::Statistical);
}

#[tokio::test]
async fn test_entity_failure_is_isolated() {
    let mut samples = Vec::new();
    for entity in ["a", "b", "c"] {
        samples.extend(history(entity, CPU, &normal_values(7, 150, 40.0, 5.0)));
    }
    let now = now_after(150);
    let inner = InMemoryDataSource::with_samples(samples);
    inner
        .extend(
            ["a", "b", "c"]
                .into_iter()
                .map(|e| MetricSample::new(e, CPU, now - Duration::seconds(5), 99.0)),
        )
        .await;

    let sink = Arc::new(MemoryAlertSink::new());
    let source = Arc::new(FailingFor {
        inner,
        failing: RwLock::new(Some(EntityId::new("b"))),
    });
    let engine = AnomalyEngine::builder(EngineConfig::default())
        .data_source(source.clone())
        .registry(Arc::new(InMemoryEntityRegistry::new(
            ["a", "b", "c"].into_iter().map(EntityId::new),
        )))
        .sink(sink.clone())
        .clock(Arc::new(ManualClock::new(now)))
        .build()
        .unwrap();

    let outcome = engine.train_now(TrainingScope::All).await.unwrap();
    let training = outcome.report().unwrap();
    assert_eq!(training.trained.len(), 2);
    assert_eq!(training.failures.len(), 1);
    assert_eq!(training.failures[0].entity_id, EntityId::new("b"));
    assert_eq!(training.failures[0].class, ErrorClass::Recoverable);

    let detection = engine.detect_now().await.unwrap();
    assert_eq!(detection.entities_scanned, 3);
    assert_eq!(detection.failures.len(), 1);
    assert_eq!(detection.failures[0].entity_id, EntityId::new("b"));

    let mut flagged: Vec<String> = sink
        .events()
        .await
        .into_iter()
        .map(|e| e.entity_id.to_string())
        .collect();
    flagged.sort();
    assert_eq!(flagged, vec!["a", "c"]);

    // 次のサイクルで b は再試行され、a / c のモデルはそのまま
    let key = |e: &str| ModelKey::new(EntityId::new(e), MetricName::new(CPU));
    let a_before = engine.store().statistical(&key("a")).await.unwrap();
    let c_before = engine.store().statistical(&key("c")).await.unwrap();
    assert!(engine.store().statistical(&key("b")).await.is_none());

    source.recover().await;
    let outcome = engine.train_now(TrainingScope::All).await.unwrap();
    let retry = outcome.report().unwrap();
    assert_eq!(retry.trained.len(), 3);
    assert!(retry.failures.is_empty());

    assert!(engine.store().statistical(&key("b")).await.is_some());
    assert_eq!(*engine.store().statistical(&key("a")).await.unwrap(), *a_before);
    assert_eq!(*engine.store().statistical(&key("c")).await.unwrap(), *c_before);
}

#[test]
fn test_build_rejects_oversized_history_window() {
    let mut config = EngineConfig::default();
    config.training.history_window_secs = 10_000_000_000_000_000;
    let result = AnomalyEngine::builder(config)
        .data_source(Arc::new(InMemoryDataSource::new()))
        .registry(Arc::new(InMemoryEntityRegistry::new([EntityId::new("a")])))
        .build();
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn test_deregister_during_training_discards_models() {
    let dir = tempdir().unwrap();
    let source = Arc::new(GatedSource {
        inner: InMemoryDataSource::with_samples(history("a", CPU, &[30.0; 120])),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let engine = AnomalyEngine::builder(EngineConfig::default())
        .data_source(source.clone())
        .registry(Arc::new(InMemoryEntityRegistry::new([EntityId::new("a")])))
        .persistence(Arc::new(JsonFilePersistence::new(dir.path())))
        .clock(Arc::new(ManualClock::new(now_after(120))))
        .build()
        .unwrap();
    let entity = EntityId::new("a");

    let (outcome, _) = tokio::join!(
        engine.train_now(TrainingScope::Entity(entity.clone())),
        async {
            source.entered.notified().await;
            engine.deregister_entity(&entity).await.unwrap();
            source.release.notify_one();
        }
    );

    let outcome = outcome.unwrap();
    let report = outcome.report().unwrap();
    assert!(report.trained.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].class, ErrorClass::Soft);

    assert_eq!(engine.model_stats().await.statistical_models, 0);
    assert!(engine.store().entities().await.is_empty());
    assert!(!dir.path().join("a").exists());
}

#[tokio::test]
async fn test_normal_window_thresholds() {
    let samples = history("db-1", CPU, &normal_values(42, 1000, 50.0, 10.0));
    let h = harness(&["db-1"], samples, now_after(1000));
    h.engine.train_now(TrainingScope::All).await.unwrap();

    let model = h
        .engine
        .store()
        .statistical(&ModelKey::new(EntityId::new("db-1"), MetricName::new(CPU)))
        .await
        .unwrap();

    assert_eq!(model.data_point_count, 1000);
    assert!((model.mean - 50.0).abs() < 1.5, "mean = {}", model.mean);
    assert!((model.stddev - 10.0).abs() < 1.5, "stddev = {}", model.stddev);

    let t = model.dynamic_thresholds;
    assert!((t.warning - (model.mean + 2.0 * model.stddev)).abs() < 1e-9);
    assert!((t.critical - (model.mean + 3.0 * model.stddev)).abs() < 1e-9);
    assert!(t.warning <= t.critical && t.critical <= t.anomaly_boundary);
}

#[tokio::test]
async fn test_correlated_metrics_flag_broken_relationship() {
    let cpu: Vec<f64> = (0..120).map(|i| 20.0 + (i % 40) as f64).collect();
    let mut samples = history("app-1", CPU, &cpu);
    samples.extend(history("app-1", MEMORY, &cpu));
    let h = harness(&["app-1"], samples, now_after(120));

    let outcome = h
        .engine
        .train_now(TrainingScope::Entity(EntityId::new("app-1")))
        .await
        .unwrap();
    assert_eq!(outcome.report().unwrap().trained[0].correlation_pairs, 1);

    let profile = h
        .engine
        .store()
        .correlation(&EntityId::new("app-1"))
        .await
        .unwrap();
    let r = profile
        .coefficient(&MetricName::new(CPU), &MetricName::new(MEMORY))
        .unwrap();
    assert!(r > 0.99, "r = {}", r);

    let live = h.now - Duration::seconds(5);
    h.source
        .extend([
            MetricSample::new("app-1", CPU, live, 40.0),
            MetricSample::new("app-1", MEMORY, live, 80.0),
        ])
        .await;
    h.engine.detect_now().await.unwrap();

    let correlation: Vec<_> = h
        .sink
        .events()
        .await
        .into_iter()
        .filter(|e| e.method == DetectionMethod::Correlation)
        .collect();
    assert_eq!(correlation.len(), 1);
    assert_eq!(correlation[0].severity, Severity::High);
    assert!(!correlation[0].expected_range.contains(80.0));
}

#[tokio::test]
async fn test_forecast_confidence_decays_with_horizon() {
    let values: Vec<f64> = (0..120).map(|i| 30.0 + 0.1 * i as f64).collect();
    let h = harness(&["web-2"], history("web-2", CPU, &values), now_after(120));
    h.engine.train_now(TrainingScope::All).await.unwrap();

    let forecast = h
        .engine
        .forecast(&EntityId::new("web-2"), &MetricName::new(CPU), Some(30))
        .await
        .unwrap();

    assert_eq!(forecast.points.len(), 30);
    let tenth = &forecast.points[9];
    assert_eq!(tenth.step, 10);
    assert!((tenth.confidence - (1.0 - (10.0 / 30.0) * 0.5)).abs() < 1e-9);
    assert!(forecast
        .points
        .windows(2)
        .all(|w| w[1].confidence <= w[0].confidence));
    assert!(forecast
        .points
        .iter()
        .all(|p| (0.0..=100.0).contains(&p.predicted_value)));
}

#[tokio::test]
async fn test_forecast_without_model_fails() {
    let h = harness(&["web-3"], Vec::new(), now_after(0));
    let result = h
        .engine
        .forecast(&EntityId::new("web-3"), &MetricName::new(CPU), None)
        .await;
    assert!(matches!(result, Err(Error::ModelNotFound(_))));
}

#[tokio::test]
async fn test_training_is_deterministic() {
    let values = normal_values(3, 300, 60.0, 8.0);
    let key = ModelKey::new(EntityId::new("node"), MetricName::new(CPU));

    let first = harness(&["node"], history("node", CPU, &values), now_after(300));
    let second = harness(&["node"], history("node", CPU, &values), now_after(300));
    first.engine.train_now(TrainingScope::All).await.unwrap();
    second.engine.train_now(TrainingScope::All).await.unwrap();

    let a = first.engine.store().statistical(&key).await.unwrap();
    let b = second.engine.store().statistical(&key).await.unwrap();
    assert_eq!(*a, *b);
}

#[tokio::test]
async fn test_invalid_config_rejected_at_build() {
    let mut config = EngineConfig::default();
    config.detection.emission_cutoff = 0.99;
    config.detection.critical_cutoff = 0.9;

    let result = AnomalyEngine::builder(config)
        .data_source(Arc::new(InMemoryDataSource::new()))
        .registry(Arc::new(InMemoryEntityRegistry::new(Vec::new())))
        .build();
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn test_missing_data_source_rejected_at_build() {
    let result = AnomalyEngine::builder(EngineConfig::default())
        .registry(Arc::new(InMemoryEntityRegistry::new(Vec::new())))
        .build();
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn test_warm_start_restores_persisted_models() {
    let dir = tempdir().unwrap();
    let samples = history("api", CPU, &normal_values(11, 200, 35.0, 4.0));
    let now = now_after(200);
    let key = ModelKey::new(EntityId::new("api"), MetricName::new(CPU));

    let build = |samples: Vec<MetricSample>| {
        AnomalyEngine::builder(EngineConfig::default())
            .data_source(Arc::new(InMemoryDataSource::with_samples(samples)))
            .registry(Arc::new(InMemoryEntityRegistry::new([EntityId::new("api")])))
            .persistence(Arc::new(JsonFilePersistence::new(dir.path())))
            .clock(Arc::new(ManualClock::new(now)))
            .build()
            .unwrap()
    };

    let trained = build(samples);
    trained.train_now(TrainingScope::All).await.unwrap();
    let before = trained.store().statistical(&key).await.unwrap();

    let restarted = build(Vec::new());
    assert!(restarted.store().statistical(&key).await.is_none());

    let loaded = restarted.warm_start().await.unwrap();
    assert!(loaded >= 1);
    let restored = restarted.store().statistical(&key).await.unwrap();
    assert_eq!(*restored, *before);
}

#[tokio::test]
async fn test_deregister_removes_models() {
    let samples = history("old", CPU, &normal_values(5, 150, 20.0, 2.0));
    let h = harness(&["old"], samples, now_after(150));
    h.engine.train_now(TrainingScope::All).await.unwrap();
    assert_eq!(h.engine.model_stats().await.statistical_models, 1);

    h.engine.deregister_entity(&EntityId::new("old")).await.unwrap();

    assert_eq!(h.engine.model_stats().await.statistical_models, 0);
    assert!(h.registry.list_active_entities().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_jsonl_source_feeds_training() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("metrics.jsonl");
    let mut lines = Vec::new();
    for i in 0..150 {
        let ts = start_time() + Duration::minutes(i);
        lines.push(format!(
            r#"{{"entity_id":"edge","timestamp":"{}","cpu_usage":{},"memory_usage":{}}}"#,
            ts.to_rfc3339(),
            30.0 + (i % 10) as f64,
            60.0 - (i % 10) as f64
        ));
    }
    lines.push("not json".to_string());
    std::fs::write(&path, lines.join("\n")).unwrap();

    let source = Arc::new(JsonLinesDataSource::new(&path, UnknownFieldPolicy::Ignore));
    assert_eq!(source.entities().await.unwrap(), vec![EntityId::new("edge")]);

    let engine = AnomalyEngine::builder(EngineConfig::default())
        .data_source(source)
        .registry(Arc::new(InMemoryEntityRegistry::new([EntityId::new("edge")])))
        .clock(Arc::new(ManualClock::new(now_after(150))))
        .build()
        .unwrap();
    engine.train_now(TrainingScope::All).await.unwrap();

    let metrics = engine.store().trained_metrics(&EntityId::new("edge")).await;
    assert_eq!(metrics, vec![MetricName::new(CPU), MetricName::new(MEMORY)]);
}

#[tokio::test]
async fn test_loops_run_until_shutdown() {
    let samples = history("svc", CPU, &[25.0; 120]);
    let h = harness(&["svc"], samples, now_after(120));

    let (training_ticker, training_tick) = ManualTicker::new();
    let (detection_ticker, detection_tick) = ManualTicker::new();
    let mut training_cycles = h.engine.training_scheduler().subscribe_cycles();
    let mut detection_cycles = h.engine.detection_loop().subscribe_cycles();

    let handle = h.engine.start_with(training_ticker, detection_ticker);

    assert!(training_tick.tick());
    tokio::time::timeout(std::time::Duration::from_secs(5), training_cycles.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.engine.model_stats().await.statistical_models, 1);

    h.source
        .extend([MetricSample::new("svc", CPU, h.now - Duration::seconds(1), 90.0)])
        .await;
    assert!(detection_tick.tick());
    tokio::time::timeout(std::time::Duration::from_secs(5), detection_cycles.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.sink.events().await.len(), 1);

    handle.shutdown().await;
    assert!(!training_tick.tick());
    assert!(!detection_tick.tick());
}
