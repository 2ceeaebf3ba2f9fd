//! deptrack - Dependency-call correlation agent
//!
//! Replays recorded begin/end notifications through the HTTP and SQL
//! trackers and exports the resulting dependency telemetry.

mod driver;

use clap::{Parser, Subcommand};
use deptrack_core::config::{AgentConfig, ConfigLoader, StoreMode};
use deptrack_core::replay::{CallEventReplay, ReplayConfig};
use deptrack_core::sink::FanoutSink;
use deptrack_core::{TelemetrySink, TrackingMetrics};
use deptrack_correlate::{
    CapacityBoundStore, CorrelationIdResolver, CorrelationStore, HttpTracker, HttpTrackerConfig,
    IdentityBoundStore, ProfileApiClient, SqlTracker, SqlTrackerConfig,
};
use deptrack_export::{JsonlSink, JsonlSinkConfig};
use driver::{IdentityKeys, KeyMapper, ReplayCall, ReplayDriver, SyntheticKeys};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "deptrack")]
#[command(version)]
#[command(about = "Dependency-call correlation agent", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "DEPTRACK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded call events through the trackers
    Replay {
        /// Input file (JSONL call events)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for JSONL telemetry
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Correlation store (capacity, identity)
        #[arg(long)]
        store: Option<String>,

        /// Speed multiplier (0 = instant, 1 = recorded timing)
        #[arg(long, default_value = "0")]
        speed: f64,

        /// Metrics output after the run (prometheus, json, none)
        #[arg(long, default_value = "none")]
        metrics_format: String,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print built-in defaults instead of the loaded file
        #[arg(long)]
        default: bool,
    },

    /// Show agent status and configuration summary
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence over the config file
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.agent.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Replay {
            input,
            output,
            store,
            speed,
            metrics_format,
        } => {
            let mode = match store {
                Some(mode) => mode.parse()?,
                None => config.store.mode,
            };
            let options = ReplayOptions {
                input,
                output,
                mode,
                speed,
                metrics_format,
            };
            replay_command(&config, options).await
        }
        Commands::Config { default } => config_command(&config, default),
        Commands::Status => status_command(&config),
    }
}

/// Load configuration from file or use defaults
fn load_config(cli_path: Option<PathBuf>) -> AgentConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            AgentConfig::default()
        }
    }
}

struct ReplayOptions {
    input: PathBuf,
    output: Option<PathBuf>,
    mode: StoreMode,
    speed: f64,
    metrics_format: String,
}

/// Shared pieces every tracker is built from
struct Pipeline {
    sink: Arc<dyn TelemetrySink>,
    metrics: Arc<TrackingMetrics>,
    resolver: Option<Arc<CorrelationIdResolver>>,
    http: HttpTrackerConfig,
    sql: SqlTrackerConfig,
}

impl Pipeline {
    fn build(config: &AgentConfig, output: Option<PathBuf>) -> anyhow::Result<Self> {
        let metrics = Arc::new(TrackingMetrics::new());

        let mut fanout = FanoutSink::new();
        let mut jsonl_config = JsonlSinkConfig::from(&config.export.jsonl);
        if let Some(path) = output {
            jsonl_config.path = path;
            fanout.add(Arc::new(JsonlSink::open(jsonl_config)?));
        } else if config.export.jsonl.enabled {
            fanout.add(Arc::new(JsonlSink::open(jsonl_config)?));
        }
        if fanout.is_empty() {
            warn!("No telemetry sink configured, records will be discarded");
        }

        let resolver = match (&config.agent.instrumentation_key, config.resolver.enabled) {
            (Some(_), true) => {
                let client =
                    ProfileApiClient::new(&config.resolver.endpoint, config.resolver.timeout())?;
                let resolver =
                    CorrelationIdResolver::from_settings(Arc::new(client), &config.resolver)
                        .with_metrics(metrics.clone());
                Some(Arc::new(resolver))
            }
            _ => None,
        };

        Ok(Self {
            sink: Arc::new(fanout),
            metrics,
            resolver,
            http: HttpTrackerConfig::from_config(config),
            sql: SqlTrackerConfig::from(&config.sql),
        })
    }

    fn trackers<S: CorrelationStore>(
        &self,
        http_store: Arc<S>,
        sql_store: Arc<S>,
    ) -> (HttpTracker<S>, SqlTracker<S>) {
        let mut http = HttpTracker::new(http_store, self.sink.clone(), self.http.clone())
            .with_metrics(self.metrics.clone());
        if let Some(resolver) = &self.resolver {
            http = http.with_resolver(resolver.clone());
        }
        let sql = SqlTracker::new(sql_store, self.sink.clone(), self.sql.clone())
            .with_metrics(self.metrics.clone());
        (http, sql)
    }
}

/// What a replay run did
#[derive(Debug)]
struct ReplaySummary {
    events: u64,
    dispatched: u64,
    open_records: usize,
}

async fn replay_command(config: &AgentConfig, options: ReplayOptions) -> anyhow::Result<()> {
    info!("Replaying {:?} with {:?} store", options.input, options.mode);

    let pipeline = Pipeline::build(config, options.output)?;
    let replay = CallEventReplay::new(ReplayConfig {
        input_file: options.input,
        speed_multiplier: options.speed,
    });

    let summary = run_replay(&pipeline, config, options.mode, replay).await?;
    pipeline.sink.flush();

    println!();
    println!(
        "Replayed {} events ({} dispatched)",
        summary.events, summary.dispatched
    );
    println!("Open records left: {}", summary.open_records);
    let (http, sql) = (&pipeline.metrics.http, &pipeline.metrics.sql);
    println!("HTTP dependencies emitted: {}", load(&http.emitted));
    println!("SQL dependencies emitted: {}", load(&sql.emitted));

    match options.metrics_format.as_str() {
        "prometheus" => print!("\n{}", pipeline.metrics.to_prometheus()),
        "json" => println!(
            "\n{}",
            serde_json::to_string_pretty(&pipeline.metrics.to_json())?
        ),
        _ => {}
    }

    Ok(())
}

async fn run_replay(
    pipeline: &Pipeline,
    config: &AgentConfig,
    mode: StoreMode,
    replay: CallEventReplay,
) -> anyhow::Result<ReplaySummary> {
    let settings = &config.store;
    match mode {
        StoreMode::Capacity => {
            let store = || {
                Arc::new(
                    CapacityBoundStore::new(settings.max_entries)
                        .with_max_bytes(settings.max_bytes)
                        .with_metrics(pipeline.metrics.clone()),
                )
            };
            let (http, sql) = pipeline.trackers(store(), store());
            drive(ReplayDriver::new(http, sql, SyntheticKeys), replay).await
        }
        StoreMode::Identity => {
            let store = || {
                Arc::new(
                    IdentityBoundStore::<ReplayCall>::new(settings.sweep_interval)
                        .with_metrics(pipeline.metrics.clone()),
                )
            };
            let (http, sql) = pipeline.trackers(store(), store());
            drive(ReplayDriver::new(http, sql, IdentityKeys::default()), replay).await
        }
    }
}

async fn drive<S, M>(
    mut driver: ReplayDriver<S, M>,
    replay: CallEventReplay,
) -> anyhow::Result<ReplaySummary>
where
    S: CorrelationStore,
    M: KeyMapper<Key = S::Key>,
{
    let (tx, mut rx) = mpsc::channel(1024);

    let consume = async {
        while let Some(event) = rx.recv().await {
            driver.dispatch(event);
        }
    };
    let (sent, ()) = tokio::join!(replay.run(tx), consume);
    let events = sent?;

    Ok(ReplaySummary {
        events,
        dispatched: driver.dispatched(),
        open_records: driver.open_records(),
    })
}

fn load(counter: &std::sync::atomic::AtomicU64) -> u64 {
    counter.load(std::sync::atomic::Ordering::Relaxed)
}

fn config_command(config: &AgentConfig, default: bool) -> anyhow::Result<()> {
    let rendered = if default {
        toml::to_string_pretty(&AgentConfig::default())?
    } else {
        toml::to_string_pretty(config)?
    };
    print!("{}", rendered);
    Ok(())
}

fn status_command(config: &AgentConfig) -> anyhow::Result<()> {
    println!();
    println!("deptrack v{}", deptrack_core::AGENT_VERSION);
    println!();
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    if let Some(path) = ConfigLoader::default_config_path() {
        println!("Config path: {}", path.display());
    }

    println!();
    println!("Correlation store:");
    println!("  Mode: {:?}", config.store.mode);
    println!("  Max entries: {}", config.store.max_entries);
    match config.store.max_bytes {
        Some(bytes) => println!("  Byte budget: {}", bytes),
        None => println!("  Byte budget: none"),
    }
    println!("  Sweep interval: {}", config.store.sweep_interval);

    println!();
    println!("Cross-component resolution:");
    println!("  Enabled: {}", config.resolver.enabled);
    println!(
        "  Instrumentation key set: {}",
        config.agent.instrumentation_key.is_some()
    );
    println!("  Endpoint: {}", config.resolver.endpoint);

    println!();
    println!("Export:");
    if config.export.jsonl.enabled {
        println!("  JSONL: {}", config.export.jsonl.path);
    } else {
        println!("  JSONL: disabled");
    }
    println!();

    Ok(())
}
