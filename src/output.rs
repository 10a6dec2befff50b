//! Output formatting and persistence for reliability results.
//!
//! Tables are written as CSV and reports as JSON, optionally gzip-compressed.

use anyhow::Result;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::analyzers::types::{MergedTable, ReliabilityTable};
use crate::period::Period;

/// Logs a value as pretty-printed JSON.
pub fn print_json(value: &impl Serialize) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Writes `bytes` to `path`, or gzip-compressed to `path.gz`.
///
/// Returns the path actually written.
pub fn persist(path: &Path, bytes: Vec<u8>, gzip: bool) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let (body, target) = if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes)?;
        let mut name = path.as_os_str().to_owned();
        name.push(".gz");
        (encoder.finish()?, PathBuf::from(name))
    } else {
        (bytes, path.to_path_buf())
    };

    std::fs::write(&target, &body)?;
    debug!(path = %target.display(), bytes = body.len(), gzip, "Wrote output");
    Ok(target)
}

pub fn write_json(path: &Path, value: &impl Serialize, gzip: bool) -> Result<PathBuf> {
    persist(path, serde_json::to_vec_pretty(value)?, gzip)
}

#[derive(Serialize)]
struct SegmentPeriodRow<'a> {
    segment_id: &'a str,
    period: Period,
    samples: u64,
    percentile_tt: f64,
    reference_tt: f64,
    lottr: f64,
    worst_lottr: f64,
    reliable: bool,
    length: Option<f64>,
}

/// One row per scored (segment, period) of a single extract.
pub fn segment_csv(table: &ReliabilityTable) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in table.rows.values() {
        for (&period, lottr) in &row.periods {
            writer.serialize(SegmentPeriodRow {
                segment_id: &row.segment_id,
                period,
                samples: lottr.samples,
                percentile_tt: lottr.percentile_tt,
                reference_tt: lottr.reference_tt,
                lottr: lottr.lottr,
                worst_lottr: row.worst_lottr,
                reliable: row.reliable,
                length: row.length,
            })?;
        }
    }
    Ok(writer.into_inner()?)
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Wide layout: one row per segment, one column group per extract.
///
/// Cells of extracts that do not report the segment are left blank.
pub fn merged_csv(table: &MergedTable) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["segment_id".to_string(), "length".to_string()];
    for extract in &table.extracts {
        for period in Period::ALL {
            header.push(format!("{extract}_{}_lottr", period.as_str().to_lowercase()));
        }
        header.push(format!("{extract}_worst_lottr"));
        header.push(format!("{extract}_worst_period"));
        header.push(format!("{extract}_reliable"));
    }
    writer.write_record(&header)?;

    for row in table.rows.values() {
        let mut record = vec![row.segment_id.clone(), cell(row.length)];
        for extract in &table.extracts {
            let reliability = row.get(extract);
            for period in Period::ALL {
                record.push(cell(
                    reliability.and_then(|r| r.periods.get(&period)).map(|p| p.lottr),
                ));
            }
            record.push(cell(reliability.map(|r| r.worst_lottr)));
            record.push(
                reliability
                    .map(|r| r.worst_period.to_string())
                    .unwrap_or_default(),
            );
            record.push(
                reliability
                    .map(|r| r.reliable.to_string())
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&record)?;
    }

    Ok(writer.into_inner()?)
}
