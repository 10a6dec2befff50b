//! Data types produced by the aggregation pipeline.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::period::Period;

/// Percentile statistics for one (segment, period) bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentPeriodStats {
    pub segment_id: String,
    pub period: Period,
    pub samples: u64,
    pub median: f64,
    /// Travel time at `percentile_rank`.
    pub percentile: f64,
    pub percentile_rank: f64,
    pub min: f64,
    pub max: f64,
}

/// LOTTR inputs and result for one period of a segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodLottr {
    pub lottr: f64,
    pub percentile_tt: f64,
    pub reference_tt: f64,
    pub samples: u64,
}

/// Reliability of one segment within one extract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentReliability {
    pub segment_id: String,
    pub periods: BTreeMap<Period, PeriodLottr>,
    pub worst_lottr: f64,
    pub worst_period: Period,
    pub reliable: bool,
    /// Segment length from the extract's attribute table, if known.
    pub length: Option<f64>,
}

/// All scored segments of one extract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilityTable {
    pub extract: String,
    pub percentile_rank: f64,
    pub rows: BTreeMap<String, SegmentReliability>,
}

impl ReliabilityTable {
    pub fn get(&self, segment_id: &str) -> Option<&SegmentReliability> {
        self.rows.get(segment_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One segment's reliability across every extract that reported it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedSegmentReliability {
    pub segment_id: String,
    pub length: Option<f64>,
    pub extracts: BTreeMap<String, SegmentReliability>,
}

impl MergedSegmentReliability {
    /// The extract's fields, `None` when the segment is absent from it.
    pub fn get(&self, extract: &str) -> Option<&SegmentReliability> {
        self.extracts.get(extract)
    }
}

/// Consolidated segment table keyed by segment id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedTable {
    /// Extract names in merge order (sorted).
    pub extracts: Vec<String>,
    pub rows: BTreeMap<String, MergedSegmentReliability>,
}

impl MergedTable {
    pub fn get(&self, segment_id: &str) -> Option<&MergedSegmentReliability> {
        self.rows.get(segment_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Weighted network-level reliability for one extract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSummary {
    pub extract: String,
    pub segments: u64,
    pub reliable_segments: u64,
    pub unreliable_segments: u64,
    pub unweighted_segments: u64,
    pub total_weight: f64,
    pub reliable_weight: f64,
    pub reliable_weight_pct: f64,
}
