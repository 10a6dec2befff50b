use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::analyzers::aggregate::{AggregationReport, aggregate};
use crate::analyzers::merge::merge;
use crate::analyzers::score::{ScoringReport, score};
use crate::analyzers::spill::{SpillReport, aggregate_partitioned};
use crate::analyzers::summary::{SegmentWeights, summarize};
use crate::analyzers::types::{MergedTable, NetworkSummary, ReliabilityTable};
use crate::attributes::SegmentAttributes;
use crate::config::{AggregationStrategy, ExtractConfig, RunConfig};
use crate::coverage::{CoverageReport, coverage_gaps};
use crate::error::Error;
use crate::ingest::{ExtractReader, IngestReport, ObservationTable};
use crate::period::{ClassificationReport, CompiledCalendar};

/// Per-stage diagnostics for one extract.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractReport {
    pub extract: String,
    pub ingest: IngestReport,
    pub coverage: Option<CoverageReport>,
    pub classification: ClassificationReport,
    pub aggregation: AggregationReport,
    pub spill: Option<SpillReport>,
    pub scoring: ScoringReport,
}

#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub table: ReliabilityTable,
    pub report: ExtractReport,
}

/// An extract or summary that did not complete.
#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub extract: String,
    pub stage: &'static str,
    pub error: String,
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    #[serde(skip)]
    pub merged: MergedTable,
    pub summaries: BTreeMap<String, NetworkSummary>,
    pub reports: Vec<ExtractReport>,
    pub failures: Vec<StageFailure>,
}

/// Classifies, aggregates and scores an in-memory table.
pub fn analyze_table(
    run: &RunConfig,
    extract: &ExtractConfig,
    table: &ObservationTable,
    calendar: &CompiledCalendar,
    attributes: Option<&SegmentAttributes>,
) -> Result<ExtractOutcome, Error> {
    let classification = calendar.classify_table(table);
    let aggregation = aggregate(table, &classification, &run.aggregate_config(extract))?;
    let (scored, scoring) = score(
        &extract.name,
        &aggregation.stats,
        &run.scoring_config(),
        attributes,
    );

    Ok(ExtractOutcome {
        table: scored,
        report: ExtractReport {
            extract: extract.name.clone(),
            ingest: table.report().clone(),
            coverage: None,
            classification: classification.report,
            aggregation: aggregation.report,
            spill: None,
            scoring,
        },
    })
}

/// Runs one extract end to end with the configured strategy.
///
/// When `coverage_base` is given the extract's intervals are compared with
/// it for the report; scores only use the extract's own observations. The
/// table is returned when `keep_table` is set so dependants can use it.
pub fn analyze_extract(
    run: &RunConfig,
    extract: &ExtractConfig,
    calendar: &CompiledCalendar,
    attributes: Option<&SegmentAttributes>,
    coverage_base: Option<&ObservationTable>,
    keep_table: bool,
) -> Result<(ExtractOutcome, Option<ObservationTable>), Error> {
    let columns = run.columns_for(extract);

    match run.strategy {
        AggregationStrategy::InMemory => {
            let table = ObservationTable::from_path(&extract.path, columns)?;
            let mut outcome = analyze_table(run, extract, &table, calendar, attributes)?;
            outcome.report.coverage = coverage_base.map(|base| coverage_gaps(&table, base));
            Ok((outcome, keep_table.then_some(table)))
        }
        AggregationStrategy::Partitioned { partitions } => {
            let reader = ExtractReader::from_path(&extract.path, columns)?;
            let config = run.aggregate_config(extract);
            let spilled = aggregate_partitioned(reader, calendar, &config, partitions)?;
            let (scored, scoring) = score(
                &extract.name,
                &spilled.aggregation.stats,
                &run.scoring_config(),
                attributes,
            );
            let outcome = ExtractOutcome {
                table: scored,
                report: ExtractReport {
                    extract: extract.name.clone(),
                    ingest: spilled.ingest,
                    coverage: None,
                    classification: spilled.classification,
                    aggregation: spilled.aggregation.report,
                    spill: Some(spilled.spill),
                    scoring,
                },
            };
            Ok((outcome, None))
        }
    }
}

struct ExtractJob {
    run: Arc<RunConfig>,
    extract: ExtractConfig,
    calendar: Arc<CompiledCalendar>,
    attributes: Option<Arc<SegmentAttributes>>,
    coverage_base: Option<Arc<ObservationTable>>,
    keep_table: bool,
}

impl ExtractJob {
    fn execute(self) -> Result<(ExtractOutcome, Option<ObservationTable>), Error> {
        analyze_extract(
            &self.run,
            &self.extract,
            &self.calendar,
            self.attributes.as_deref(),
            self.coverage_base.as_deref(),
            self.keep_table,
        )
    }
}

type JobResult = Result<(ExtractOutcome, Option<ObservationTable>)>;

/// Runs jobs on the blocking pool, at most `semaphore` permits at a time.
async fn run_wave(jobs: Vec<ExtractJob>, semaphore: &Arc<Semaphore>) -> Vec<(String, JobResult)> {
    let mut tasks = Vec::with_capacity(jobs.len());

    for job in jobs {
        let sem = semaphore.clone();
        let name = job.extract.name.clone();
        let span = tracing::info_span!("extract", extract = %name);

        let task = tokio::spawn(async move {
            let _permit = sem.acquire_owned().await?;
            let result =
                tokio::task::spawn_blocking(move || span.in_scope(|| job.execute())).await?;
            anyhow::Ok(result?)
        });
        tasks.push((name, task));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for (name, task) in tasks {
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };
        results.push((name, result));
    }
    results
}

fn load_attributes(run: &RunConfig) -> Result<HashMap<PathBuf, Arc<SegmentAttributes>>> {
    let mut loaded: HashMap<PathBuf, Arc<SegmentAttributes>> = HashMap::new();
    for extract in &run.extracts {
        let Some(path) = run.attributes_for(extract) else {
            continue;
        };
        if loaded.contains_key(path) {
            continue;
        }
        let attributes = SegmentAttributes::from_path(path, &run.attribute_columns)
            .with_context(|| format!("loading segment attributes from {}", path.display()))?;
        loaded.insert(path.to_path_buf(), Arc::new(attributes));
    }
    Ok(loaded)
}

/// Processes every configured extract, merges the survivors and summarizes
/// each merged extract by segment length.
///
/// Extracts that fail are reported in [`RunOutcome::failures`] and left out
/// of the merge. Extracts with a coverage base run in a second wave, after
/// their base; if the base failed they are still scored, without coverage.
///
/// # Errors
///
/// Invalid configuration, unreadable attribute tables, and metadata
/// conflicts during the merge abort the whole run.
pub async fn run(config: RunConfig, concurrency: usize) -> Result<RunOutcome> {
    config.validate()?;
    let calendar = Arc::new(config.calendar.compile()?);
    let attributes = load_attributes(&config)?;
    let run = Arc::new(config);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let bases: HashSet<String> = run
        .extracts
        .iter()
        .filter_map(|e| e.coverage_base.clone())
        .collect();

    let make_job =
        |extract: &ExtractConfig, coverage_base: Option<Arc<ObservationTable>>| ExtractJob {
            run: run.clone(),
            extract: extract.clone(),
            calendar: calendar.clone(),
            attributes: run
                .attributes_for(extract)
                .and_then(|p| attributes.get(p).cloned()),
            coverage_base,
            keep_table: bases.contains(&extract.name),
        };

    info!(
        extracts = run.extracts.len(),
        concurrency,
        coverage_bases = bases.len(),
        "Starting reliability run"
    );

    let (first, second): (Vec<&ExtractConfig>, Vec<&ExtractConfig>) = run
        .extracts
        .iter()
        .partition(|e| e.coverage_base.is_none());

    let mut outcomes = Vec::new();
    let mut failures = Vec::new();
    let mut kept: HashMap<String, Arc<ObservationTable>> = HashMap::new();

    let wave = first.into_iter().map(|e| make_job(e, None)).collect();
    for (name, result) in run_wave(wave, &semaphore).await {
        match result {
            Ok((outcome, table)) => {
                if let Some(table) = table {
                    kept.insert(name, Arc::new(table));
                }
                outcomes.push(outcome);
            }
            Err(e) => {
                error!(extract = %name, error = %e, "Extract failed");
                failures.push(StageFailure {
                    extract: name,
                    stage: "extract",
                    error: format!("{e:#}"),
                });
            }
        }
    }

    let mut wave = Vec::new();
    for extract in second {
        let base = extract.coverage_base.as_deref().unwrap_or_default();
        let table = kept.get(base).cloned();
        if table.is_none() {
            warn!(extract = %extract.name, base, "Coverage base unavailable, scoring without it");
        }
        wave.push(make_job(extract, table));
    }
    for (name, result) in run_wave(wave, &semaphore).await {
        match result {
            Ok((outcome, _)) => outcomes.push(outcome),
            Err(e) => {
                error!(extract = %name, error = %e, "Extract failed");
                failures.push(StageFailure {
                    extract: name,
                    stage: "extract",
                    error: format!("{e:#}"),
                });
            }
        }
    }
    drop(kept);

    let (tables, reports): (Vec<_>, Vec<_>) =
        outcomes.into_iter().map(|o| (o.table, o.report)).unzip();
    let merged = merge(tables)?;

    let weights = SegmentWeights::from_lengths(&merged);
    let mut summaries = BTreeMap::new();
    for extract in &merged.extracts {
        match summarize(&merged, extract, &weights) {
            Ok(summary) => {
                summaries.insert(extract.clone(), summary);
            }
            Err(e) => {
                warn!(extract = %extract, error = %e, "Network summary unavailable");
                failures.push(StageFailure {
                    extract: extract.clone(),
                    stage: "summary",
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        merged_segments = merged.len(),
        summaries = summaries.len(),
        failures = failures.len(),
        "Reliability run complete"
    );
    Ok(RunOutcome {
        merged,
        summaries,
        reports,
        failures,
    })
}
