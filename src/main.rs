use anomaly_rs::config::{AppConfig, ConfigLoader};
use anomaly_rs::interfaces::{
    InMemoryEntityRegistry, JsonFilePersistence, JsonLinesDataSource, LogAlertSink,
    ModelPersistence, NoopPersistence,
};
use anomaly_rs::logging::{init_logging, LogConfig};
use anomaly_rs::model::{EntityId, MetricName};
use anomaly_rs::scheduler::{Clock, ManualClock, SystemClock, TrainingScope};
use anomaly_rs::AnomalyEngine;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "anomaly-rs")]
#[command(author, version, about = "Per-entity anomaly detection and forecasting engine")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "ANOMALY_CONFIG")]
    config: Option<String>,

    /// Override the log level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DataArgs {
    /// JSON Lines file of metric records
    #[arg(short, long)]
    data: PathBuf,

    /// Entities to monitor (default: every entity found in the data file)
    #[arg(short, long, value_delimiter = ',')]
    entities: Vec<String>,

    /// Evaluate as of this RFC 3339 timestamp instead of the system clock
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the training scheduler and detection loop until interrupted
    Run {
        #[command(flatten)]
        data: DataArgs,

        /// Load persisted models before the first cycle
        #[arg(long)]
        warm_start: bool,
    },

    /// Train models once and print the training report
    Train {
        #[command(flatten)]
        data: DataArgs,

        /// Train a single entity only
        #[arg(long)]
        entity: Option<String>,
    },

    /// Train an entity and print a forecast for one metric
    Forecast {
        #[command(flatten)]
        data: DataArgs,

        /// Entity to forecast
        entity: String,

        /// Metric to forecast
        metric: String,

        /// Number of forecast steps
        #[arg(long)]
        horizon: Option<usize>,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenerateConfig { output } = &cli.command {
        let sample = AppConfig::sample_toml()?;
        match output {
            Some(path) => std::fs::write(path, sample)
                .with_context(|| format!("failed to write {}", path.display()))?,
            None => print!("{}", sample),
        }
        return Ok(());
    }

    let app_config = ConfigLoader::new()
        .load_from_file(cli.config.as_deref())
        .load_from_env()
        .build()
        .context("failed to load configuration")?;

    let mut log_config = LogConfig::from_logging_config(&app_config.logging);
    if let Some(level) = &cli.log_level {
        log_config = log_config.with_level(level.clone());
    }
    let _guard = init_logging(&log_config)?;

    match cli.command {
        Commands::Run { data, warm_start } => run(app_config, data, warm_start).await,
        Commands::Train { data, entity } => train(app_config, data, entity).await,
        Commands::Forecast {
            data,
            entity,
            metric,
            horizon,
        } => forecast(app_config, data, entity, metric, horizon).await,
        Commands::GenerateConfig { .. } => Ok(()),
    }
}

async fn build_engine(config: &AppConfig, data: &DataArgs) -> Result<AnomalyEngine> {
    let source = Arc::new(JsonLinesDataSource::new(
        &data.data,
        config.engine.ingestion.unknown_fields,
    ));

    let entities: Vec<EntityId> = if data.entities.is_empty() {
        source
            .entities()
            .await
            .with_context(|| format!("failed to read {}", data.data.display()))?
    } else {
        data.entities.iter().map(EntityId::new).collect()
    };
    if entities.is_empty() {
        bail!("no entities to monitor in {}", data.data.display());
    }

    let persistence: Arc<dyn ModelPersistence> = match &config.engine.persistence_dir {
        Some(dir) => Arc::new(JsonFilePersistence::new(dir)),
        None => Arc::new(NoopPersistence),
    };
    let clock: Arc<dyn Clock> = match data.as_of {
        Some(as_of) => Arc::new(ManualClock::new(as_of)),
        None => Arc::new(SystemClock),
    };

    let engine = AnomalyEngine::builder(config.engine.clone())
        .data_source(source)
        .registry(Arc::new(InMemoryEntityRegistry::new(entities)))
        .sink(Arc::new(LogAlertSink))
        .persistence(persistence)
        .clock(clock)
        .build()
        .context("invalid engine configuration")?;
    Ok(engine)
}

async fn run(config: AppConfig, data: DataArgs, warm_start: bool) -> Result<()> {
    let engine = build_engine(&config, &data).await?;
    if warm_start {
        engine.warm_start().await?;
    }

    let handle = engine.start();
    info!("Engine running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    handle.shutdown().await;
    Ok(())
}

async fn train(config: AppConfig, data: DataArgs, entity: Option<String>) -> Result<()> {
    let engine = build_engine(&config, &data).await?;
    let scope = match entity {
        Some(id) => TrainingScope::Entity(EntityId::new(id)),
        None => TrainingScope::All,
    };

    let outcome = engine.train_now(scope).await?;
    let report = outcome
        .report()
        .context("training request was dropped")?;
    println!("{}", serde_json::to_string_pretty(report)?);
    println!("{}", serde_json::to_string_pretty(&engine.model_stats().await)?);
    Ok(())
}

async fn forecast(
    config: AppConfig,
    data: DataArgs,
    entity: String,
    metric: String,
    horizon: Option<usize>,
) -> Result<()> {
    let engine = build_engine(&config, &data).await?;
    let entity_id = EntityId::new(entity);
    let metric = MetricName::new(metric);

    engine
        .train_now(TrainingScope::Entity(entity_id.clone()))
        .await?;
    let forecast = engine
        .forecast(&entity_id, &metric, horizon)
        .await
        .with_context(|| format!("no forecast available for {}/{}", entity_id, metric))?;
    println!("{}", serde_json::to_string_pretty(&forecast)?);
    Ok(())
}
