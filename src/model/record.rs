//! Metric Record Ingestion
//!
//! 取り込み時のスキーマ検証（固定の数値フィールド）

use super::types::{EntityId, MetricSample};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// 未知フィールドの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownFieldPolicy {
    /// 無視（debugログのみ）
    #[default]
    Ignore,
    /// レコード全体を拒否
    Reject,
}

/// エンティティ1件・1時刻分のメトリクスレコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub entity_id: EntityId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_io: Option<f64>,
    /// スキーマ外のフィールド
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MetricRecord {
    /// 既知フィールド名
    pub const FIELDS: [&'static str; 4] = ["cpu_usage", "memory_usage", "disk_usage", "network_io"];

    pub fn new(entity_id: impl Into<EntityId>, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp,
            cpu_usage: None,
            memory_usage: None,
            disk_usage: None,
            network_io: None,
            extra: BTreeMap::new(),
        }
    }

    /// JSON文字列からレコードをパース
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::InvalidSample(e.to_string()))
    }

    /// 検証してサンプル列に変換
    pub fn into_samples(self, policy: UnknownFieldPolicy) -> Result<Vec<MetricSample>> {
        if !self.extra.is_empty() {
            let unknown: Vec<&str> = self.extra.keys().map(String::as_str).collect();
            match policy {
                UnknownFieldPolicy::Reject => {
                    return Err(Error::InvalidSample(format!(
                        "unknown fields for entity {}: {}",
                        self.entity_id,
                        unknown.join(", ")
                    )));
                }
                UnknownFieldPolicy::Ignore => {
                    debug!(entity = %self.entity_id, fields = ?unknown, "Ignoring unknown fields");
                }
            }
        }

        let fields = [
            (Self::FIELDS[0], self.cpu_usage),
            (Self::FIELDS[1], self.memory_usage),
            (Self::FIELDS[2], self.disk_usage),
            (Self::FIELDS[3], self.network_io),
        ];

        let mut samples = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            let Some(value) = value else { continue };
            if !value.is_finite() {
                return Err(Error::InvalidSample(format!(
                    "non-finite value for {}/{}",
                    self.entity_id, name
                )));
            }
            samples.push(MetricSample::new(
                self.entity_id.clone(),
                name,
                self.timestamp,
                value,
            ));
        }

        Ok(samples)
    }
}
