//! Externally supplied per-segment attributes (length, free-flow time).
//!
//! NPMRDS ships these as a `TMC_Identification.csv` next to each extract.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeColumns {
    pub segment: String,
    pub length: Option<String>,
    pub free_flow: Option<String>,
}

impl Default for AttributeColumns {
    fn default() -> Self {
        Self {
            segment: "tmc".to_string(),
            length: Some("miles".to_string()),
            free_flow: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegmentAttribute {
    pub length: Option<f64>,
    pub free_flow_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentAttributes {
    rows: HashMap<String, SegmentAttribute>,
}

fn parse_value(source: &str, line: u64, column: &str, cell: &str) -> Result<Option<f64>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(None);
    }
    match cell.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(Some(v)),
        _ => Err(Error::malformed(
            source,
            format!("line {line}: invalid {column} '{cell}'"),
        )),
    }
}

impl SegmentAttributes {
    #[tracing::instrument(skip(columns), fields(path = %path.display()))]
    pub fn from_path(path: &Path, columns: &AttributeColumns) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(&path.display().to_string(), file, columns)
    }

    /// Reads an attribute table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] for missing columns, invalid
    /// numbers, or a segment listed twice with different values.
    pub fn from_reader<R: Read>(source: &str, rdr: R, columns: &AttributeColumns) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(rdr);
        let headers = reader.headers()?.clone();
        let position = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| {
                    Error::malformed(source, format!("missing attribute column '{name}'"))
                })
        };

        let segment_idx = position(&columns.segment)?;
        let length_idx = columns.length.as_deref().map(&position).transpose()?;
        let free_flow_idx = columns.free_flow.as_deref().map(&position).transpose()?;

        let mut rows = HashMap::new();
        for record in reader.records() {
            let record = record?;
            let line = record.position().map_or(0, |p| p.line());
            let segment_id = record.get(segment_idx).unwrap_or("").trim();
            if segment_id.is_empty() {
                continue;
            }

            let value = |idx: Option<usize>, name: &Option<String>| -> Result<Option<f64>> {
                match (idx, name) {
                    (Some(idx), Some(name)) => {
                        parse_value(source, line, name, record.get(idx).unwrap_or(""))
                    }
                    _ => Ok(None),
                }
            };
            let attribute = SegmentAttribute {
                length: value(length_idx, &columns.length)?,
                free_flow_seconds: value(free_flow_idx, &columns.free_flow)?,
            };

            if let Some(previous) = rows.insert(segment_id.to_string(), attribute) {
                if previous != attribute {
                    return Err(Error::malformed(
                        source,
                        format!(
                            "line {line}: segment {segment_id} listed twice with different values"
                        ),
                    ));
                }
            }
        }

        info!(source, segments = rows.len(), "Segment attributes loaded");
        Ok(Self { rows })
    }

    pub fn get(&self, segment_id: &str) -> Option<&SegmentAttribute> {
        self.rows.get(segment_id)
    }

    pub fn length(&self, segment_id: &str) -> Option<f64> {
        self.get(segment_id).and_then(|a| a.length)
    }

    pub fn free_flow(&self, segment_id: &str) -> Option<f64> {
        self.get(segment_id).and_then(|a| a.free_flow_seconds)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
