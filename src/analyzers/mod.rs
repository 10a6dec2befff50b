//! Segment aggregation and reliability scoring.
//!
//! This module turns classified observations into exact per-segment,
//! per-period percentiles, scores them as LOTTR ratios, merges the
//! per-extract tables and rolls them up into weighted network summaries.

pub mod aggregate;
pub mod analyzer;
pub mod merge;
pub mod percentile;
pub mod score;
pub mod spill;
pub mod summary;
pub mod types;
