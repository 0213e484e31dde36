use super::types::AppConfig;
use crate::error::{Error, Result};
use config::{Config, Environment, File};
use std::path::Path;

/// Configuration loader with builder pattern
///
/// 優先順位: デフォルト値 → 設定ファイル → 環境変数 (`ANOMALY_ENGINE__DETECTION__EMISSION_CUTOFF=0.7`)
pub struct ConfigLoader {
    config_file: Option<String>,
    load_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_file: None,
            load_env: false,
        }
    }

    /// Load configuration from file
    pub fn load_from_file(mut self, path: Option<&str>) -> Self {
        self.config_file = path.map(String::from);
        self
    }

    /// Load configuration from environment variables
    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Build and validate the final configuration
    pub fn build(self) -> Result<AppConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        if let Some(config_path) = &self.config_file {
            if !Path::new(config_path).exists() {
                return Err(Error::Configuration(format!(
                    "config file not found: {}",
                    config_path
                )));
            }
            builder = builder.add_source(File::with_name(config_path));
        } else {
            // 標準の場所を試行
            builder = builder
                .add_source(File::with_name("anomaly-rs").required(false))
                .add_source(File::with_name("config/anomaly-rs").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix("ANOMALY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.engine.validate()?;

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl AppConfig {
    /// サンプル設定ファイルの内容を生成
    pub fn sample_toml() -> Result<String> {
        let toml_content = toml::to_string_pretty(&AppConfig::default())
            .map_err(|e| Error::Configuration(e.to_string()))?;

        Ok(format!(
            r#"# anomaly-rs configuration
#
# anomaly-rs.toml として保存してください
# 環境変数での上書きも可能です (例: ANOMALY_ENGINE__SCHEDULER__DETECTION_INTERVAL_SECS=60)

{}"#,
            toml_content
        ))
    }
}
