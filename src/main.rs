use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use logwarden::config::{Config, LogFormat, LoggingConfig};
use logwarden::detect::EventData;
use logwarden::storage::export::ExportFormat;
use logwarden::storage::record::LogInput;
use logwarden::storage::search::SearchQuery;
use logwarden::Monitor;

#[derive(Parser)]
#[command(
    name = "logwarden",
    about = "In-memory log store with baseline-driven anomaly detection",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $LOGWARDEN_CONFIG, then /etc/logwarden/logwarden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (store + retention sweeper + API server)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Load newline-delimited JSON records into a fresh store
    Replay {
        /// NDJSON file, one record per line
        #[arg(long)]
        input: PathBuf,

        /// Run anomaly detection for every record that names a user
        #[arg(long)]
        analyze: bool,

        /// Export all loaded records to this file
        #[arg(long)]
        export: Option<PathBuf>,

        /// Export format
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;

    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            config.validate()?;
            tracing::info!(bind = %config.api.bind, "Starting logwarden daemon");
            logwarden::serve(config).await?;
        }
        Commands::Replay {
            input,
            analyze,
            export,
            format,
        } => {
            replay(config, &input, analyze, export.as_deref(), format)?;
        }
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{rendered}");
        }
    }

    Ok(())
}

fn replay(
    config: Config,
    input: &Path,
    analyze: bool,
    export: Option<&Path>,
    format: ExportFormat,
) -> Result<()> {
    let monitor = Monitor::new(config).context("failed to build monitor")?;
    let file =
        File::open(input).with_context(|| format!("failed to open {}", input.display()))?;

    let mut loaded = 0usize;
    let mut skipped = 0usize;
    let mut alerts = 0usize;
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", input.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record_input: LogInput = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(line = n + 1, error = %e, "skipping malformed record");
                skipped += 1;
                continue;
            }
        };
        let record = monitor.add_log(record_input);
        loaded += 1;

        if !analyze {
            continue;
        }
        let Some(user) = record.user_id.as_deref() else {
            continue;
        };
        // Behavioural fields may ride along in the record's data payload.
        let mut event: EventData = match serde_json::from_value(record.data.clone()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = n + 1, error = %e, "ignoring behavioural fields in record data");
                EventData::default()
            }
        };
        event.timestamp.get_or_insert(record.timestamp);
        if event.response_time.is_none() {
            event.response_time = record.metadata.duration;
        }
        let report = monitor.analyze(user, &event);
        alerts += report.alerts.len();
    }

    tracing::info!(loaded, skipped, alerts, "replay finished");
    let stats = serde_json::to_string_pretty(&monitor.stats())?;
    println!("{stats}");
    if analyze {
        println!("alerts raised: {alerts}");
    }

    if let Some(target) = export {
        // Relative to the working directory rather than the export directory.
        let target = if target.is_absolute() {
            target.to_path_buf()
        } else {
            std::env::current_dir()
                .context("failed to resolve working directory")?
                .join(target)
        };
        // Hard-cap eviction may have dropped some of the loaded records.
        let exported = monitor.store().len();
        let path = monitor
            .export_to_file(&target, format, &SearchQuery::default())
            .with_context(|| format!("failed to export to {}", target.display()))?;
        println!("exported {exported} records to {}", path.display());
    }
    Ok(())
}
