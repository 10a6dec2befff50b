use std::collections::HashMap;

use tracing::info;

use crate::analyzers::types::{MergedTable, NetworkSummary};
use crate::error::{Error, Result};

/// Externally supplied per-segment weights (length, VMT, ...).
#[derive(Debug, Clone, Default)]
pub struct SegmentWeights(HashMap<String, f64>);

impl SegmentWeights {
    /// Weights each segment by the length carried in the merged table.
    pub fn from_lengths(table: &MergedTable) -> Self {
        table
            .rows
            .values()
            .filter_map(|row| row.length.map(|l| (row.segment_id.clone(), l)))
            .collect()
    }

    pub fn insert(&mut self, segment_id: impl Into<String>, weight: f64) {
        self.0.insert(segment_id.into(), weight);
    }

    pub fn get(&self, segment_id: &str) -> Option<f64> {
        self.0.get(segment_id).copied()
    }
}

impl FromIterator<(String, f64)> for SegmentWeights {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Weighted reliability of the segments `extract` reports.
///
/// Segments without a weight are counted but contribute no weight.
///
/// # Errors
///
/// [`Error::UnknownExtract`] if the extract was not merged and
/// [`Error::ZeroTotalWeight`] if the counted segments weigh nothing.
#[tracing::instrument(skip(table, weights))]
pub fn summarize(
    table: &MergedTable,
    extract: &str,
    weights: &SegmentWeights,
) -> Result<NetworkSummary> {
    if !table.extracts.iter().any(|e| e == extract) {
        return Err(Error::UnknownExtract(extract.to_string()));
    }

    let mut summary = NetworkSummary {
        extract: extract.to_string(),
        segments: 0,
        reliable_segments: 0,
        unreliable_segments: 0,
        unweighted_segments: 0,
        total_weight: 0.0,
        reliable_weight: 0.0,
        reliable_weight_pct: 0.0,
    };

    for row in table.rows.values() {
        let Some(reliability) = row.get(extract) else {
            continue;
        };
        summary.segments += 1;
        if reliability.reliable {
            summary.reliable_segments += 1;
        } else {
            summary.unreliable_segments += 1;
        }

        match weights.get(&row.segment_id) {
            Some(weight) => {
                summary.total_weight += weight;
                if reliability.reliable {
                    summary.reliable_weight += weight;
                }
            }
            None => summary.unweighted_segments += 1,
        }
    }

    if summary.total_weight <= 0.0 {
        return Err(Error::ZeroTotalWeight {
            extract: extract.to_string(),
        });
    }
    summary.reliable_weight_pct = 100.0 * summary.reliable_weight / summary.total_weight;

    info!(
        segments = summary.segments,
        reliable = summary.reliable_segments,
        pct = summary.reliable_weight_pct,
        "Network summary"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::types::{MergedSegmentReliability, SegmentReliability};
    use crate::period::Period;
    use std::collections::BTreeMap;

    fn merged(rows: &[(&str, bool, Option<f64>)]) -> MergedTable {
        let rows = rows
            .iter()
            .map(|&(id, reliable, length)| {
                let mut extracts = BTreeMap::new();
                extracts.insert(
                    "all".to_string(),
                    SegmentReliability {
                        segment_id: id.to_string(),
                        periods: BTreeMap::new(),
                        worst_lottr: if reliable { 1.1 } else { 1.9 },
                        worst_period: Period::AmPeak,
                        reliable,
                        length,
                    },
                );
                (
                    id.to_string(),
                    MergedSegmentReliability {
                        segment_id: id.to_string(),
                        length,
                        extracts,
                    },
                )
            })
            .collect();
        MergedTable {
            extracts: vec!["all".to_string()],
            rows,
        }
    }

    #[test]
    fn test_weighted_percentage_scenario() {
        let table = merged(&[("S1", false, Some(10.0)), ("S2", true, Some(30.0))]);
        let summary = summarize(&table, "all", &SegmentWeights::from_lengths(&table)).unwrap();

        assert_eq!(summary.segments, 2);
        assert_eq!(summary.reliable_segments, 1);
        assert_eq!(summary.unreliable_segments, 1);
        assert_eq!(summary.total_weight, 40.0);
        assert_eq!(summary.reliable_weight, 30.0);
        assert_eq!(summary.reliable_weight_pct, 75.0);
    }

    #[test]
    fn test_all_and_none_reliable() {
        let all = merged(&[("S1", true, Some(1.0)), ("S2", true, Some(2.0))]);
        let pct = summarize(&all, "all", &SegmentWeights::from_lengths(&all))
            .unwrap()
            .reliable_weight_pct;
        assert_eq!(pct, 100.0);

        let none = merged(&[("S1", false, Some(1.0)), ("S2", false, Some(2.0))]);
        let pct = summarize(&none, "all", &SegmentWeights::from_lengths(&none))
            .unwrap()
            .reliable_weight_pct;
        assert_eq!(pct, 0.0);
    }

    #[test]
    fn test_zero_total_weight_is_an_error() {
        let table = merged(&[("S1", true, Some(0.0)), ("S2", true, None)]);
        let err = summarize(&table, "all", &SegmentWeights::from_lengths(&table)).unwrap_err();
        assert!(matches!(err, Error::ZeroTotalWeight { .. }));
    }

    #[test]
    fn test_external_weights_and_unweighted_segments() {
        let table = merged(&[("S1", true, None), ("S2", false, None), ("S3", true, None)]);
        let mut weights = SegmentWeights::default();
        weights.insert("S1", 5.0);
        weights.insert("S2", 15.0);

        let summary = summarize(&table, "all", &weights).unwrap();
        assert_eq!(summary.unweighted_segments, 1);
        assert_eq!(summary.reliable_segments, 2);
        assert_eq!(summary.reliable_weight_pct, 25.0);
    }

    #[test]
    fn test_unknown_extract() {
        let table = merged(&[("S1", true, Some(1.0))]);
        assert!(matches!(
            summarize(&table, "trucks", &SegmentWeights::default()),
            Err(Error::UnknownExtract(_))
        ));
    }
}
