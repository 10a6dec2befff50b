use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analyzers::types::{
    PeriodLottr, ReliabilityTable, SegmentPeriodStats, SegmentReliability,
};
use crate::attributes::SegmentAttributes;

/// Denominator of the LOTTR ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    /// The period's own median travel time.
    #[default]
    Median,
    /// Free-flow travel time supplied in the segment attributes.
    FreeFlow,
    /// The fastest observed travel time in the period.
    ObservedMinimum,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub reference: ReferencePolicy,
    /// Segments with `worst_lottr <= threshold` are reliable.
    pub threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            reference: ReferencePolicy::default(),
            threshold: 1.5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoringReport {
    pub segments: u64,
    pub reliable_segments: u64,
    pub periods_scored: u64,
    pub missing_reference: u64,
    pub zero_reference: u64,
    pub omitted_segments: u64,
}

/// Scores every segment of one extract.
///
/// Periods without a usable (present, positive) reference are skipped and
/// counted; segments left with no scored period are omitted. The worst
/// period is the first maximum in [`Period`](crate::period::Period) order.
#[tracing::instrument(skip_all, fields(extract = %extract, stats = stats.len()))]
pub fn score(
    extract: &str,
    stats: &[SegmentPeriodStats],
    config: &ScoringConfig,
    attributes: Option<&SegmentAttributes>,
) -> (ReliabilityTable, ScoringReport) {
    let mut by_segment: BTreeMap<&str, Vec<&SegmentPeriodStats>> = BTreeMap::new();
    for s in stats {
        by_segment.entry(&s.segment_id).or_default().push(s);
    }

    let mut report = ScoringReport::default();
    let mut rows = BTreeMap::new();
    let percentile_rank = stats.first().map_or(0.0, |s| s.percentile_rank);

    for (segment_id, group) in by_segment {
        let mut periods = BTreeMap::new();

        for s in group {
            let reference = match config.reference {
                ReferencePolicy::Median => Some(s.median),
                ReferencePolicy::ObservedMinimum => Some(s.min),
                ReferencePolicy::FreeFlow => attributes.and_then(|a| a.free_flow(segment_id)),
            };
            let Some(reference) = reference else {
                report.missing_reference += 1;
                continue;
            };
            if reference <= 0.0 {
                report.zero_reference += 1;
                continue;
            }

            report.periods_scored += 1;
            periods.insert(
                s.period,
                PeriodLottr {
                    lottr: s.percentile / reference,
                    percentile_tt: s.percentile,
                    reference_tt: reference,
                    samples: s.samples,
                },
            );
        }

        let Some((worst_period, worst_lottr)) = periods.iter().fold(None, |worst, (&p, l)| {
            match worst {
                Some((_, w)) if l.lottr <= w => worst,
                _ => Some((p, l.lottr)),
            }
        }) else {
            report.omitted_segments += 1;
            continue;
        };

        let reliable = worst_lottr <= config.threshold;
        report.segments += 1;
        if reliable {
            report.reliable_segments += 1;
        }

        rows.insert(
            segment_id.to_string(),
            SegmentReliability {
                segment_id: segment_id.to_string(),
                periods,
                worst_lottr,
                worst_period,
                reliable,
                length: attributes.and_then(|a| a.length(segment_id)),
            },
        );
    }

    info!(
        segments = report.segments,
        reliable = report.reliable_segments,
        omitted = report.omitted_segments,
        "Scored segments"
    );
    (
        ReliabilityTable {
            extract: extract.to_string(),
            percentile_rank,
            rows,
        },
        report,
    )
}
