//! Error types for the reliability pipeline.
//!
//! Drops and exclusions (unbucketed timestamps, thin groups, missing
//! references) are not errors; they are counted in the per-stage reports.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Schema or type violation while ingesting an extract.
    #[error("malformed input in {source_name}: {message}")]
    MalformedInput {
        source_name: String,
        message: String,
    },

    /// The extract produced zero usable rows.
    #[error("extract {source_name} contains no usable observations")]
    EmptyInput { source_name: String },

    /// The same segment carries contradictory immutable metadata across extracts.
    #[error(
        "segment {segment_id} has conflicting {field}: {first_value} in {first_extract}, {second_value} in {second_extract}"
    )]
    ConflictingSegmentMetadata {
        segment_id: String,
        field: &'static str,
        first_extract: String,
        first_value: f64,
        second_extract: String,
        second_value: f64,
    },

    /// Weighted summary requested over a table whose weights sum to zero.
    #[error("total weight for extract {extract} is zero; weighted reliability is undefined")]
    ZeroTotalWeight { extract: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("extract {0} appears more than once")]
    DuplicateExtract(String),

    #[error("unknown extract {0}")]
    UnknownExtract(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn malformed(source_name: &str, message: impl Into<String>) -> Self {
        Error::MalformedInput {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
