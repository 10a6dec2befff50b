use serde::Serialize;
use tracing::info;

use crate::analyzers::percentile::{PercentileMethod, percentile};
use crate::analyzers::types::SegmentPeriodStats;
use crate::error::{Error, Result};
use crate::ingest::ObservationTable;
use crate::period::{Classification, Period};

/// Settings for percentile aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateConfig {
    /// High percentile rank in `[0, 100]`.
    pub percentile: f64,
    pub method: PercentileMethod,
    /// Groups with fewer samples are excluded.
    pub min_samples: u64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            percentile: 80.0,
            method: PercentileMethod::default(),
            min_samples: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationReport {
    pub groups: u64,
    pub excluded_groups: u64,
    pub excluded_samples: u64,
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub stats: Vec<SegmentPeriodStats>,
    pub report: AggregationReport,
}

/// Reduces one group's values to its statistics, or records an exclusion.
///
/// `values` is sorted in place.
pub(crate) fn reduce_group(
    segment_id: &str,
    period: Period,
    values: &mut [f32],
    config: &AggregateConfig,
    report: &mut AggregationReport,
) -> Option<SegmentPeriodStats> {
    let samples = values.len() as u64;
    if samples == 0 {
        return None;
    }
    if samples < config.min_samples {
        report.excluded_groups += 1;
        report.excluded_samples += samples;
        return None;
    }

    values.sort_unstable_by(f32::total_cmp);
    report.groups += 1;

    Some(SegmentPeriodStats {
        segment_id: segment_id.to_string(),
        period,
        samples,
        median: percentile(values, 50.0, config.method),
        percentile: percentile(values, config.percentile, config.method),
        percentile_rank: config.percentile,
        min: values[0] as f64,
        max: values[values.len() - 1] as f64,
    })
}

pub(crate) fn sort_stats(stats: &mut [SegmentPeriodStats]) {
    stats.sort_by(|a, b| {
        a.segment_id
            .cmp(&b.segment_id)
            .then_with(|| a.period.cmp(&b.period))
    });
}

/// Computes exact per-(segment, period) statistics for a classified table.
///
/// Row indices are counting-sorted by group key, then each group is
/// gathered into one reusable scratch buffer, so at most one group's values
/// are materialized besides the table itself.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] when the table is too large to index
/// with `u32` row numbers; such inputs need the partitioned strategy.
#[tracing::instrument(skip_all, fields(source = %table.source_name(), rows = table.len()))]
pub fn aggregate(
    table: &ObservationTable,
    classification: &Classification,
    config: &AggregateConfig,
) -> Result<Aggregation> {
    if table.len() > u32::MAX as usize {
        return Err(Error::InvalidConfig(format!(
            "{} rows exceed the in-memory aggregation limit; use the partitioned strategy",
            table.len()
        )));
    }

    let periods = classification.codes();
    let group_count = table.dictionary().len() * Period::COUNT;
    let key_of = |row: usize| -> Option<usize> {
        Period::from_code(periods[row])
            .map(|p| table.segment_code(row) as usize * Period::COUNT + p.code() as usize)
    };

    let mut offsets = vec![0u32; group_count + 1];
    for row in 0..table.len() {
        if let Some(key) = key_of(row) {
            offsets[key + 1] += 1;
        }
    }
    for key in 0..group_count {
        offsets[key + 1] += offsets[key];
    }

    let mut cursor = offsets.clone();
    let mut order = vec![0u32; offsets[group_count] as usize];
    for row in 0..table.len() {
        if let Some(key) = key_of(row) {
            order[cursor[key] as usize] = row as u32;
            cursor[key] += 1;
        }
    }
    drop(cursor);

    let travel_times = table.travel_times();
    let mut scratch: Vec<f32> = Vec::new();
    let mut stats = Vec::new();
    let mut report = AggregationReport::default();

    for key in 0..group_count {
        let rows = &order[offsets[key] as usize..offsets[key + 1] as usize];
        if rows.is_empty() {
            continue;
        }
        scratch.clear();
        scratch.extend(rows.iter().map(|&row| travel_times[row as usize]));

        let segment_id = table.dictionary().resolve((key / Period::COUNT) as u32);
        let Some(period) = Period::from_code((key % Period::COUNT) as u8) else {
            continue;
        };
        if let Some(group) = reduce_group(segment_id, period, &mut scratch, config, &mut report) {
            stats.push(group);
        }
    }

    sort_stats(&mut stats);
    info!(
        groups = report.groups,
        excluded_groups = report.excluded_groups,
        excluded_samples = report.excluded_samples,
        "Aggregated segment periods"
    );
    Ok(Aggregation { stats, report })
}
