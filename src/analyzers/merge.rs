use std::collections::BTreeMap;

use tracing::info;

use crate::analyzers::types::{MergedSegmentReliability, MergedTable, ReliabilityTable};
use crate::error::{Error, Result};

/// Lengths closer than this are the same length.
const LENGTH_TOLERANCE: f64 = 1e-6;

/// Combines per-extract tables into one table keyed by segment id.
///
/// Each extract's fields stay under the extract's name; nothing is averaged
/// or overwritten. Tables are processed in extract-name order, so the
/// result (and any conflict reported) does not depend on input order.
///
/// # Errors
///
/// [`Error::DuplicateExtract`] when two tables share a name and
/// [`Error::ConflictingSegmentMetadata`] when a segment's length differs
/// between extracts.
#[tracing::instrument(skip_all)]
pub fn merge(tables: impl IntoIterator<Item = ReliabilityTable>) -> Result<MergedTable> {
    let mut tables: Vec<ReliabilityTable> = tables.into_iter().collect();
    tables.sort_by(|a, b| a.extract.cmp(&b.extract));
    if let Some(pair) = tables.windows(2).find(|w| w[0].extract == w[1].extract) {
        return Err(Error::DuplicateExtract(pair[0].extract.clone()));
    }

    let extracts: Vec<String> = tables.iter().map(|t| t.extract.clone()).collect();
    let mut rows: BTreeMap<String, MergedSegmentReliability> = BTreeMap::new();
    // Extract that supplied each segment's length, for conflict reports.
    let mut length_sources: BTreeMap<String, String> = BTreeMap::new();

    for table in tables {
        let extract = table.extract;
        for (segment_id, reliability) in table.rows {
            let merged = rows
                .entry(segment_id.clone())
                .or_insert_with(|| MergedSegmentReliability {
                    segment_id: segment_id.clone(),
                    length: None,
                    extracts: BTreeMap::new(),
                });

            if let Some(length) = reliability.length {
                match merged.length {
                    Some(known) if (known - length).abs() > LENGTH_TOLERANCE => {
                        return Err(Error::ConflictingSegmentMetadata {
                            segment_id,
                            field: "length",
                            first_extract: length_sources
                                .get(&merged.segment_id)
                                .cloned()
                                .unwrap_or_default(),
                            first_value: known,
                            second_extract: extract,
                            second_value: length,
                        });
                    }
                    Some(_) => {}
                    None => {
                        merged.length = Some(length);
                        length_sources.insert(segment_id.clone(), extract.clone());
                    }
                }
            }

            merged.extracts.insert(extract.clone(), reliability);
        }
    }

    info!(
        extracts = extracts.len(),
        segments = rows.len(),
        "Merged extract tables"
    );
    Ok(MergedTable { extracts, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::types::{PeriodLottr, SegmentReliability};
    use crate::period::Period;

    fn reliability(segment: &str, lottr: f64, length: Option<f64>) -> SegmentReliability {
        let mut periods = BTreeMap::new();
        periods.insert(
            Period::AmPeak,
            PeriodLottr {
                lottr,
                percentile_tt: lottr * 100.0,
                reference_tt: 100.0,
                samples: 10,
            },
        );
        SegmentReliability {
            segment_id: segment.to_string(),
            periods,
            worst_lottr: lottr,
            worst_period: Period::AmPeak,
            reliable: lottr <= 1.5,
            length,
        }
    }

    fn table(extract: &str, rows: Vec<SegmentReliability>) -> ReliabilityTable {
        ReliabilityTable {
            extract: extract.to_string(),
            percentile_rank: 80.0,
            rows: rows.into_iter().map(|r| (r.segment_id.clone(), r)).collect(),
        }
    }

    #[test]
    fn test_segment_only_in_truck_extract_is_absent_elsewhere() {
        let all = table("all_vehicles", vec![reliability("S1", 1.1, Some(0.5))]);
        let trucks = table(
            "trucks",
            vec![reliability("S1", 1.3, Some(0.5)), reliability("S2", 1.2, None)],
        );

        let merged = merge([all, trucks]).unwrap();
        let s2 = merged.get("S2").unwrap();
        assert!(s2.get("all_vehicles").is_none());
        assert_eq!(s2.get("trucks").unwrap().worst_lottr, 1.2);
        assert_eq!(s2.length, None);

        let s1 = merged.get("S1").unwrap();
        assert_eq!(s1.get("all_vehicles").unwrap().worst_lottr, 1.1);
        assert_eq!(s1.get("trucks").unwrap().worst_lottr, 1.3);
        assert_eq!(s1.length, Some(0.5));
        assert_eq!(merged.extracts, vec!["all_vehicles", "trucks"]);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let make = || {
            vec![
                table("a", vec![reliability("S1", 1.1, Some(1.0)), reliability("S3", 2.0, None)]),
                table("b", vec![reliability("S2", 1.4, Some(2.0))]),
                table("c", vec![reliability("S3", 1.0, Some(3.0)), reliability("S1", 1.6, None)]),
            ]
        };
        let forward = merge(make()).unwrap();
        let mut reversed_input = make();
        reversed_input.reverse();
        let reversed = merge(reversed_input).unwrap();
        let mut rotated_input = make();
        rotated_input.rotate_left(1);
        let rotated = merge(rotated_input).unwrap();

        assert_eq!(forward, reversed);
        assert_eq!(forward, rotated);
        assert_eq!(forward.get("S3").unwrap().length, Some(3.0));
    }

    #[test]
    fn test_conflicting_length_is_an_error() {
        let a = table("a", vec![reliability("S1", 1.1, Some(1.0))]);
        let b = table("b", vec![reliability("S1", 1.1, Some(1.5))]);
        match merge([b, a]).unwrap_err() {
            Error::ConflictingSegmentMetadata {
                segment_id,
                first_extract,
                second_extract,
                ..
            } => {
                assert_eq!(segment_id, "S1");
                assert_eq!(first_extract, "a");
                assert_eq!(second_extract, "b");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_extract_names_rejected() {
        let a = table("a", vec![]);
        let b = table("a", vec![]);
        assert!(matches!(merge([a, b]), Err(Error::DuplicateExtract(_))));
    }
}
