use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_NAME: &str = "anomaly-rs.log";

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// ログレベル (trace, debug, info, warn, error)
    pub level: String,
    /// ログディレクトリ
    pub log_dir: PathBuf,
    /// ファイルローテーション設定
    pub rotation: LogRotation,
    /// コンソール出力有効
    pub console_enabled: bool,
    /// ファイル出力有効
    pub file_enabled: bool,
    /// JSON 形式で出力
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

impl LogRotation {
    /// 文字列から解析（不明な値は日次）
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "hourly" => LogRotation::Hourly,
            "never" => LogRotation::Never,
            _ => LogRotation::Daily,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: default_log_dir(),
            rotation: LogRotation::Daily,
            console_enabled: true,
            file_enabled: false,
            json: false,
        }
    }
}

impl LogConfig {
    /// 設定ファイルのログセクションから作成
    pub fn from_logging_config(logging: &LoggingConfig) -> Self {
        Self {
            level: logging.level.clone(),
            log_dir: logging.log_dir.clone().unwrap_or_else(default_log_dir),
            rotation: LogRotation::parse(&logging.rotation),
            console_enabled: logging.console,
            file_enabled: logging.file,
            json: logging.json,
        }
    }

    /// カスタムログディレクトリを設定
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// ログレベル設定
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// コンソール出力制御
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console_enabled = enabled;
        self
    }

    /// ファイル出力制御
    pub fn with_file(mut self, enabled: bool) -> Self {
        self.file_enabled = enabled;
        self
    }
}

/// デフォルトログディレクトリ（カレントの logs、作成できなければテンプ）
fn default_log_dir() -> PathBuf {
    let current_log_dir = PathBuf::from("logs");
    if ensure_log_dir(&current_log_dir).is_ok() {
        return current_log_dir;
    }
    std::env::temp_dir().join("anomaly-rs").join("logs")
}

/// ログディレクトリを確保
fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    Ok(())
}

/// ログシステムを初期化
///
/// ファイル出力時は `WorkerGuard` を返す。ドロップするまでバッファがフラッシュされるため、
/// 呼び出し側はプロセス終了まで保持すること。
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guard = None;
    let file_layer = if config.file_enabled {
        ensure_log_dir(&config.log_dir)?;
        let file_appender = match config.rotation {
            LogRotation::Daily => rolling::daily(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Hourly => rolling::hourly(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Never => rolling::never(&config.log_dir, LOG_FILE_NAME),
        };
        let (writer, file_guard) = non_blocking(file_appender);
        guard = Some(file_guard);

        let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
        Some(if config.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        })
    } else {
        None
    };

    // 何も出力しない設定でも警告以上はコンソールへ出す
    let console_enabled = config.console_enabled || !config.file_enabled;
    let console_layer = console_enabled.then(|| {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);
        if config.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    tracing::info!(
        level = %config.level,
        console = console_enabled,
        file = config.file_enabled,
        log_dir = %config.log_dir.display(),
        "Logging initialized"
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_log_config_from_logging_section() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            log_dir: Some(PathBuf::from("/var/log/anomaly")),
            rotation: "Hourly".to_string(),
            console: false,
            file: true,
            json: true,
        };

        let config = LogConfig::from_logging_config(&logging);
        assert_eq!(config.level, "debug");
        assert_eq!(config.log_dir, PathBuf::from("/var/log/anomaly"));
        assert_eq!(config.rotation, LogRotation::Hourly);
        assert!(!config.console_enabled);
        assert!(config.file_enabled);
        assert!(config.json);
    }

    #[test]
    fn test_rotation_parse() {
        assert_eq!(LogRotation::parse("never"), LogRotation::Never);
        assert_eq!(LogRotation::parse("daily"), LogRotation::Daily);
        assert_eq!(LogRotation::parse("weekly"), LogRotation::Daily);
    }

    #[test]
    fn test_ensure_log_dir() {
        let temp_dir = tempdir().unwrap();
        let log_dir = temp_dir.path().join("test_logs");

        assert!(ensure_log_dir(&log_dir).is_ok());
        assert!(log_dir.exists());
    }
}
