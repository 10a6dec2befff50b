//! Interval coverage of one extract against another.
//!
//! Truck-only extracts miss intervals where no truck probe was recorded.
//! Comparing them with the all-vehicle extract shows how many intervals
//! each segment lacks. The comparison is a diagnostic only; scores are
//! always computed from the extract's own observations.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::info;

use crate::ingest::ObservationTable;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    /// Extract the intervals were taken from.
    pub base: String,
    pub base_intervals: u64,
    /// Base intervals with no matching (segment, timestamp) in the extract.
    pub missing_intervals: u64,
    /// Base segments the extract does not report at all.
    pub uncovered_segments: u64,
    /// Missing interval count per segment, only segments with gaps.
    pub missing_by_segment: BTreeMap<String, u64>,
}

impl CoverageReport {
    /// Share of base intervals the extract reports, in percent.
    pub fn covered_pct(&self) -> f64 {
        if self.base_intervals == 0 {
            return 100.0;
        }
        100.0 * (self.base_intervals - self.missing_intervals) as f64 / self.base_intervals as f64
    }
}

/// Counts the `base` observations whose (segment id, timestamp) does not
/// occur in `target`.
#[tracing::instrument(skip_all, fields(target = %target.source_name(), base = %base.source_name()))]
pub fn coverage_gaps(target: &ObservationTable, base: &ObservationTable) -> CoverageReport {
    let present: HashSet<(u32, i64)> = (0..target.len())
        .map(|row| (target.segment_code(row), target.absolute_minute(row)))
        .collect();

    // Indexed by base segment code.
    let mut missing = vec![0u64; base.dictionary().len()];
    for row in 0..base.len() {
        let code = base.segment_code(row);
        let covered = target
            .dictionary()
            .code_of(base.segment_id(row))
            .is_some_and(|target_code| {
                present.contains(&(target_code, base.absolute_minute(row)))
            });
        if !covered {
            missing[code as usize] += 1;
        }
    }

    let mut report = CoverageReport {
        base: base.source_name().to_string(),
        base_intervals: base.len() as u64,
        ..Default::default()
    };
    for (code, &count) in missing.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let segment_id = base.dictionary().resolve(code as u32);
        if target.dictionary().code_of(segment_id).is_none() {
            report.uncovered_segments += 1;
        }
        report.missing_intervals += count;
        report.missing_by_segment.insert(segment_id.to_string(), count);
    }

    info!(
        missing = report.missing_intervals,
        uncovered_segments = report.uncovered_segments,
        covered_pct = report.covered_pct(),
        "Interval coverage"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ColumnMap, ExtractReader};

    fn table(name: &str, body: &str) -> ObservationTable {
        let csv = format!("tmc_code,measurement_tstamp,travel_time_seconds\n{body}");
        let reader =
            ExtractReader::from_reader(name, csv.as_bytes(), &ColumnMap::default()).unwrap();
        ObservationTable::from_extract(reader).unwrap()
    }

    #[test]
    fn test_counts_missing_intervals_per_segment() {
        let all = table(
            "all.csv",
            "A,2023-03-15 06:00:00,30\n\
             A,2023-03-15 06:15:00,31\n\
             B,2023-03-15 06:00:00,40\n",
        );
        let trucks = table("trucks.csv", "A,2023-03-15 06:00:00,45\n");

        let report = coverage_gaps(&trucks, &all);

        assert_eq!(report.base, "all.csv");
        assert_eq!(report.base_intervals, 3);
        assert_eq!(report.missing_intervals, 2);
        assert_eq!(report.uncovered_segments, 1);
        assert_eq!(report.missing_by_segment.get("A"), Some(&1));
        assert_eq!(report.missing_by_segment.get("B"), Some(&1));
        // The target table is left as it was.
        assert_eq!(trucks.len(), 1);
        assert_eq!(trucks.travel_times(), &[45.0]);
    }

    #[test]
    fn test_full_coverage() {
        let all = table("all.csv", "A,2023-03-15 06:00:00,30\n");
        let trucks = table(
            "trucks.csv",
            "A,2023-03-15 06:00:00,45\n\
             C,2023-03-15 06:00:00,50\n",
        );

        let report = coverage_gaps(&trucks, &all);
        assert_eq!(report.missing_intervals, 0);
        assert!(report.missing_by_segment.is_empty());
        assert_eq!(report.covered_pct(), 100.0);
    }

    #[test]
    fn test_matches_across_different_base_dates() {
        let all = table(
            "all.csv",
            "A,2023-03-14 23:45:00,30\n\
             A,2023-03-15 00:00:00,31\n",
        );
        let trucks = table("trucks.csv", "A,2023-03-15 00:00:00,50\n");

        let report = coverage_gaps(&trucks, &all);
        assert_eq!(report.missing_intervals, 1);
        assert_eq!(report.uncovered_segments, 0);
        assert_eq!(report.covered_pct(), 50.0);
    }
}
