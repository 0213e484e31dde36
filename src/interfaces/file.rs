//! File-backed Interfaces
//!
//! JSON Lines の履歴データと、JSON ファイルによるモデル永続化

use super::{HistoricalDataSource, ModelPersistence, PersistedModel, PersistenceKey};
use crate::error::{Error, Result};
use crate::model::{EntityId, MetricName, MetricRecord, MetricSample, UnknownFieldPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// JSON Lines 形式の `MetricRecord` ファイル
///
/// 取得のたびにファイルを読み直す。スキーマ違反の行はスキップしてログに残す。
#[derive(Debug, Clone)]
pub struct JsonLinesDataSource {
    path: PathBuf,
    policy: UnknownFieldPolicy,
}

impl JsonLinesDataSource {
    pub fn new(path: impl Into<PathBuf>, policy: UnknownFieldPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    /// ファイル全体をサンプル列として読み込む
    pub async fn read_all(&self) -> Result<Vec<MetricSample>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut samples = Vec::new();
        let mut rejected = 0usize;

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match MetricRecord::parse(line).and_then(|r| r.into_samples(self.policy)) {
                Ok(parsed) => samples.extend(parsed),
                Err(e) => {
                    rejected += 1;
                    debug!(path = %self.path.display(), line = line_no + 1, error = %e, "Rejected record");
                }
            }
        }

        if rejected > 0 {
            warn!(path = %self.path.display(), rejected, "Skipped invalid metric records");
        }
        Ok(samples)
    }

    /// ファイルに出現するエンティティ一覧
    pub async fn entities(&self) -> Result<Vec<EntityId>> {
        let mut entities: Vec<EntityId> = self
            .read_all()
            .await?
            .into_iter()
            .map(|s| s.entity_id)
            .collect();
        entities.sort();
        entities.dedup();
        Ok(entities)
    }
}

#[async_trait]
impl HistoricalDataSource for JsonLinesDataSource {
    async fn fetch(
        &self,
        entity_id: &EntityId,
        metrics: &[MetricName],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let samples = self
            .read_all()
            .await
            .map_err(|e| Error::upstream(entity_id, e))?;

        Ok(samples
            .into_iter()
            .filter(|s| &s.entity_id == entity_id)
            .filter(|s| metrics.is_empty() || metrics.contains(&s.metric))
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .collect())
    }
}

/// モデルごとに1ファイルの JSON 永続化
///
/// レイアウト: `<dir>/<entity>/statistical_<metric>.json`, `seasonal.json`, `correlation.json`
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entity_dir(&self, entity_id: &EntityId) -> PathBuf {
        self.dir.join(urlencoding::encode(entity_id.as_str()).as_ref())
    }

    /// キーに対応するファイルパス
    pub fn path_for(&self, key: &PersistenceKey) -> PathBuf {
        let file_name = match key {
            PersistenceKey::Statistical(model_key) => format!(
                "statistical_{}.json",
                urlencoding::encode(model_key.metric.as_str())
            ),
            PersistenceKey::Seasonal(_) => "seasonal.json".to_string(),
            PersistenceKey::Correlation(_) => "correlation.json".to_string(),
        };
        self.entity_dir(key.entity_id()).join(file_name)
    }
}

fn persistence_error(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::Persistence(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl ModelPersistence for JsonFilePersistence {
    async fn save(&self, key: &PersistenceKey, model: &PersistedModel) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence_error(parent, e))?;
        }

        let json = serde_json::to_vec_pretty(model)?;
        // 書きかけのファイルを読ませないよう一時ファイル経由で置き換える
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| persistence_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| persistence_error(&path, e))?;

        debug!(path = %path.display(), "Model persisted");
        Ok(())
    }

    async fn load(&self, key: &PersistenceKey) -> Result<Option<PersistedModel>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| persistence_error(&path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence_error(&path, e)),
        }
    }

    async fn remove_entity(&self, entity_id: &EntityId) -> Result<()> {
        let dir = self.entity_dir(entity_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence_error(&dir, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CorrelationProfile, MetricPair, ModelKey, PairCorrelation};
    use chrono::TimeZone;
    use std::io::Write;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_json_lines_fetch_skips_invalid_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"entity_id":"web-1","timestamp":"2024-03-01T00:00:00Z","cpu_usage":40.0,"memory_usage":60.0}}"#
        )
        .unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(
            file,
            r#"{{"entity_id":"web-1","timestamp":"2024-03-01T00:05:00Z","cpu_usage":42.0,"gpu":1}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"entity_id":"web-2","timestamp":"2024-03-01T00:00:00Z","cpu_usage":10.0}}"#
        )
        .unwrap();

        let source = JsonLinesDataSource::new(file.path(), UnknownFieldPolicy::Reject);
        let samples = source
            .fetch(
                &"web-1".into(),
                &["cpu_usage".into()],
                t0(),
                t0() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        // "gpu" を含む行は Reject ポリシーで除外される
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 40.0);

        let entities = source.entities().await.unwrap();
        assert_eq!(entities, vec![EntityId::new("web-1"), EntityId::new("web-2")]);
    }

    #[tokio::test]
    async fn test_json_lines_missing_file_is_upstream_error() {
        let source = JsonLinesDataSource::new("/nonexistent/metrics.jsonl", Default::default());
        let err = source
            .fetch(&"a".into(), &[], t0(), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamFetch { .. }));
    }

    #[tokio::test]
    async fn test_file_persistence_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JsonFilePersistence::new(dir.path());
        let entity = EntityId::new("db/primary");

        let profile = CorrelationProfile::new(
            entity.clone(),
            vec![PairCorrelation {
                pair: MetricPair::new("cpu_usage".into(), "memory_usage".into()),
                coefficient: 0.9,
                sample_count: 20,
            }],
            t0(),
        );
        let key = PersistenceKey::Correlation(entity.clone());
        persistence
            .save(&key, &PersistedModel::Correlation(profile.clone()))
            .await
            .unwrap();

        // エンティティIDの "/" はエンコードされる
        assert!(dir.path().join("db%2Fprimary").join("correlation.json").exists());

        let loaded = persistence.load(&key).await.unwrap();
        assert_eq!(loaded, Some(PersistedModel::Correlation(profile)));

        let missing = PersistenceKey::Statistical(ModelKey::new(entity.clone(), "cpu_usage".into()));
        assert!(persistence.load(&missing).await.unwrap().is_none());

        persistence.remove_entity(&entity).await.unwrap();
        assert!(persistence.load(&key).await.unwrap().is_none());
        persistence.remove_entity(&entity).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_persistence_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JsonFilePersistence::new(dir.path());
        let key = PersistenceKey::Seasonal("web-1".into());
        let path = persistence.path_for(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{broken").unwrap();

        let err = persistence.load(&key).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }
}
