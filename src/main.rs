//! CLI entry point for the LOTTR rater.
//!
//! Provides subcommands for scoring a single extract, running a configured
//! multi-extract job with merge and network summary, and auditing the
//! period calendar.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lottr_rater::analyzers::analyzer::{analyze_extract, run};
use lottr_rater::analyzers::percentile::PercentileMethod;
use lottr_rater::attributes::SegmentAttributes;
use lottr_rater::config::{AggregationStrategy, ExtractConfig, RunConfig};
use lottr_rater::output::{merged_csv, persist, print_json, segment_csv, write_json};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "lottr_rater")]
#[command(about = "Travel time reliability (LOTTR) metrics for road segments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a single extract with default settings plus overrides
    Analyze {
        /// Path to the extract CSV
        #[arg(value_name = "EXTRACT")]
        source: PathBuf,

        /// CSV file to write per-segment, per-period results to
        #[arg(short, long, default_value = "lottr.csv")]
        output: PathBuf,

        /// High percentile rank used in the LOTTR numerator
        #[arg(short, long, default_value_t = 80.0)]
        percentile: f64,

        /// Worst-period LOTTR at or below which a segment is reliable
        #[arg(short, long, default_value_t = 1.5)]
        threshold: f64,

        /// Minimum samples for a segment/period group to be scored
        #[arg(long, default_value_t = 1)]
        min_samples: u64,

        /// Pick the closest observation instead of interpolating
        #[arg(long, default_value_t = false)]
        closest_observation: bool,

        /// Stream through this many on-disk partitions instead of loading the extract
        #[arg(long)]
        partitions: Option<usize>,

        /// Segment attribute CSV providing lengths
        #[arg(short, long)]
        attributes: Option<PathBuf>,
    },
    /// Run every extract in a config file, merge and summarize
    Run {
        /// JSON run configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Directory for the merged table, summaries and report
        #[arg(short = 'd', long, default_value = "output")]
        output_dir: PathBuf,

        /// Maximum number of extracts processed at once
        #[arg(short = 'j', long, default_value_t = 2)]
        concurrency: usize,

        /// Gzip compress outputs
        #[arg(long, default_value_t = false)]
        gzip: bool,
    },
    /// Print the compiled period calendar
    Periods {
        /// Optional run configuration whose calendar to print
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/lottr_rater.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("lottr_rater.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            source,
            output,
            percentile,
            threshold,
            min_samples,
            closest_observation,
            partitions,
            attributes,
        } => {
            let mut config = RunConfig::default();
            config.analysis.percentile = percentile;
            config.analysis.threshold = threshold;
            config.analysis.min_samples = min_samples;
            if closest_observation {
                config.analysis.percentile_method = PercentileMethod::ClosestObservation;
            }
            if let Some(partitions) = partitions {
                config.strategy = AggregationStrategy::Partitioned { partitions };
            }
            config.attributes = attributes;
            let name = source
                .file_stem()
                .and_then(OsStr::to_str)
                .unwrap_or("extract")
                .to_string();
            config.extracts.push(ExtractConfig::new(name, source));

            analyze_single(config, &output).await?;
        }
        Commands::Run {
            config,
            output_dir,
            concurrency,
            gzip,
        } => {
            let run_config = RunConfig::load(&config)
                .with_context(|| format!("loading run configuration {}", config.display()))?;
            run_all(run_config, &output_dir, concurrency, gzip).await?;
        }
        Commands::Periods { config } => {
            let calendar = match config {
                Some(path) => RunConfig::load(&path)?.calendar,
                None => RunConfig::default().calendar,
            };
            let compiled = calendar.compile()?;
            for span in compiled.spans() {
                info!(
                    day_type = ?span.day_type,
                    start = %span.start,
                    end = %span.end,
                    period = %span.period.map_or("EXCLUDED", |p| p.as_str()),
                    "Calendar span"
                );
            }
            if compiled.uncovered_slots() > 0 {
                warn!(
                    uncovered_slots = compiled.uncovered_slots(),
                    "Observations in uncovered slots will be dropped"
                );
            }
        }
    }

    Ok(())
}

/// Scores one extract and writes its per-segment CSV and report.
#[tracing::instrument(skip(config), fields(output = %output.display()))]
async fn analyze_single(config: RunConfig, output: &Path) -> Result<()> {
    config.validate()?;
    let calendar = config.calendar.compile()?;
    let attributes = config
        .attributes
        .as_deref()
        .map(|path| SegmentAttributes::from_path(path, &config.attribute_columns))
        .transpose()?;

    let (outcome, _) = tokio::task::spawn_blocking(move || {
        let extract = &config.extracts[0];
        analyze_extract(&config, extract, &calendar, attributes.as_ref(), None, false)
    })
    .await??;

    persist(output, segment_csv(&outcome.table)?, false)?;
    let report_path = output.with_extension("report.json");
    write_json(&report_path, &outcome.report, false)?;
    print_json(&outcome.report.scoring)?;

    info!(
        segments = outcome.table.len(),
        report = %report_path.display(),
        "Extract scored"
    );
    Ok(())
}

/// Runs the configured extracts and writes merged table, summaries and report.
#[tracing::instrument(skip(config), fields(output_dir = %output_dir.display()))]
async fn run_all(
    config: RunConfig,
    output_dir: &Path,
    concurrency: usize,
    gzip: bool,
) -> Result<()> {
    let outcome = run(config, concurrency).await?;

    if outcome.merged.is_empty() {
        for failure in &outcome.failures {
            warn!(
                extract = %failure.extract,
                stage = failure.stage,
                error = %failure.error,
                "Failure"
            );
        }
        bail!("no extract produced scored segments");
    }

    let merged_path = persist(
        &output_dir.join("lottr_merged.csv"),
        merged_csv(&outcome.merged)?,
        gzip,
    )?;
    let summary_path = write_json(
        &output_dir.join("network_summary.json"),
        &outcome.summaries,
        gzip,
    )?;
    let report_path = write_json(&output_dir.join("run_report.json"), &outcome, gzip)?;

    for summary in outcome.summaries.values() {
        info!(
            extract = %summary.extract,
            segments = summary.segments,
            reliable_segments = summary.reliable_segments,
            reliable_weight_pct = format!("{:.2}", summary.reliable_weight_pct),
            "Network reliability"
        );
    }
    if !outcome.failures.is_empty() {
        warn!(failures = outcome.failures.len(), "Run finished with failures, see run report");
    }

    info!(
        merged = %merged_path.display(),
        summary = %summary_path.display(),
        report = %report_path.display(),
        "Outputs written"
    );
    Ok(())
}
