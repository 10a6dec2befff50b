//! Extract ingestion into a compact columnar table.
//!
//! Segment identifiers are dictionary-encoded, timestamps are stored as
//! minutes from the table's base date and travel times are downcast to
//! `f32` as each row is read, so nothing wider is ever materialized.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Column names and timestamp formats of an extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub segment: String,
    pub timestamp: String,
    pub travel_time: String,
    pub timestamp_formats: Vec<String>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            segment: "tmc_code".to_string(),
            timestamp: "measurement_tstamp".to_string(),
            travel_time: "travel_time_seconds".to_string(),
            timestamp_formats: vec![
                "%Y-%m-%d %H:%M:%S".to_string(),
                "%Y-%m-%dT%H:%M:%S".to_string(),
                "%Y-%m-%d %H:%M".to_string(),
            ],
        }
    }
}

/// Interned segment identifiers.
#[derive(Debug, Clone, Default)]
pub struct SegmentDictionary {
    ids: Vec<Arc<str>>,
    index: HashMap<Arc<str>, u32>,
}

impl SegmentDictionary {
    pub fn intern(&mut self, segment_id: &str) -> u32 {
        if let Some(&code) = self.index.get(segment_id) {
            return code;
        }
        let code = self.ids.len() as u32;
        let id: Arc<str> = Arc::from(segment_id);
        self.ids.push(id.clone());
        self.index.insert(id, code);
        code
    }

    pub fn code_of(&self, segment_id: &str) -> Option<u32> {
        self.index.get(segment_id).copied()
    }

    pub fn resolve(&self, code: u32) -> &str {
        &self.ids[code as usize]
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Segment code column, `u16` until the dictionary outgrows it.
#[derive(Debug, Clone)]
pub enum SegmentCodes {
    Narrow(Vec<u16>),
    Wide(Vec<u32>),
}

impl Default for SegmentCodes {
    fn default() -> Self {
        SegmentCodes::Narrow(Vec::new())
    }
}

impl SegmentCodes {
    pub fn push(&mut self, code: u32) {
        match self {
            SegmentCodes::Narrow(codes) => match u16::try_from(code) {
                Ok(narrow) => codes.push(narrow),
                Err(_) => {
                    let mut wide: Vec<u32> = codes.iter().map(|&c| c as u32).collect();
                    wide.push(code);
                    *self = SegmentCodes::Wide(wide);
                }
            },
            SegmentCodes::Wide(codes) => codes.push(code),
        }
    }

    pub fn get(&self, row: usize) -> u32 {
        match self {
            SegmentCodes::Narrow(codes) => codes[row] as u32,
            SegmentCodes::Wide(codes) => codes[row],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SegmentCodes::Narrow(codes) => codes.len(),
            SegmentCodes::Wide(codes) => codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_narrow(&self) -> bool {
        matches!(self, SegmentCodes::Narrow(_))
    }

    fn heap_bytes(&self) -> usize {
        match self {
            SegmentCodes::Narrow(codes) => codes.capacity() * size_of::<u16>(),
            SegmentCodes::Wide(codes) => codes.capacity() * size_of::<u32>(),
        }
    }
}

/// Row counters collected while reading an extract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub rows_read: u64,
    pub missing_travel_time: u64,
    pub observations: u64,
    pub segments: usize,
}

/// One parsed row, borrowing the segment id from the reader's buffer.
#[derive(Debug, Clone, Copy)]
pub struct RawObservation<'a> {
    pub segment_id: &'a str,
    pub timestamp: NaiveDateTime,
    pub travel_time: f32,
}

/// Row-by-row view of an extract, shared by the table builder and the
/// partitioned aggregator.
pub struct ExtractReader<R> {
    source_name: String,
    reader: csv::Reader<R>,
    record: StringRecord,
    segment_idx: usize,
    timestamp_idx: usize,
    travel_time_idx: usize,
    formats: Vec<String>,
    report: IngestReport,
}

impl ExtractReader<File> {
    pub fn from_path(path: &Path, columns: &ColumnMap) -> Result<Self> {
        let reader = csv::ReaderBuilder::new().from_path(path)?;
        Self::new(path.display().to_string(), reader, columns)
    }
}

impl<R: Read> ExtractReader<R> {
    pub fn from_reader(source_name: &str, rdr: R, columns: &ColumnMap) -> Result<Self> {
        let reader = csv::ReaderBuilder::new().from_reader(rdr);
        Self::new(source_name.to_string(), reader, columns)
    }

    fn new(source_name: String, mut reader: csv::Reader<R>, columns: &ColumnMap) -> Result<Self> {
        let headers = reader
            .headers()
            .map_err(|e| Error::malformed(&source_name, format!("unreadable header: {e}")))?
            .clone();
        let position = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| {
                    Error::malformed(&source_name, format!("missing required column '{name}'"))
                })
        };

        let segment_idx = position(&columns.segment)?;
        let timestamp_idx = position(&columns.timestamp)?;
        let travel_time_idx = position(&columns.travel_time)?;

        if columns.timestamp_formats.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one timestamp format is required".to_string(),
            ));
        }

        Ok(Self {
            source_name,
            reader,
            record: StringRecord::new(),
            segment_idx,
            timestamp_idx,
            travel_time_idx,
            formats: columns.timestamp_formats.clone(),
            report: IngestReport::default(),
        })
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn report(&self) -> &IngestReport {
        &self.report
    }

    fn line(&self) -> u64 {
        self.record.position().map_or(0, |p| p.line())
    }

    fn parse_timestamp(&self, cell: &str) -> Option<NaiveDateTime> {
        let cell = cell.trim();
        self.formats
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(cell, format).ok())
    }

    /// Reads the next usable observation.
    ///
    /// Rows with an empty travel-time cell are skipped and counted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] for ragged rows, empty segment ids,
    /// unparsable timestamps, or travel times that are not finite and
    /// non-negative.
    pub fn next_observation(&mut self) -> Result<Option<RawObservation<'_>>> {
        loop {
            let more = self.reader.read_record(&mut self.record).map_err(|e| {
                if e.is_io_error() {
                    Error::Csv(e)
                } else {
                    Error::malformed(&self.source_name, e.to_string())
                }
            })?;
            if !more {
                return Ok(None);
            }
            self.report.rows_read += 1;

            let cell = self.record.get(self.travel_time_idx).unwrap_or("").trim();
            if cell.is_empty() {
                self.report.missing_travel_time += 1;
                continue;
            }
            let travel_time = match cell.parse::<f64>() {
                Ok(value) if value.is_finite() && value >= 0.0 => value as f32,
                _ => {
                    return Err(Error::malformed(
                        &self.source_name,
                        format!("line {}: invalid travel time '{}'", self.line(), cell),
                    ));
                }
            };

            let cell = self.record.get(self.timestamp_idx).unwrap_or("");
            let Some(timestamp) = self.parse_timestamp(cell) else {
                return Err(Error::malformed(
                    &self.source_name,
                    format!("line {}: unparsable timestamp '{}'", self.line(), cell),
                ));
            };

            let segment_id = self.record.get(self.segment_idx).unwrap_or("").trim();
            if segment_id.is_empty() {
                return Err(Error::malformed(
                    &self.source_name,
                    format!("line {}: empty segment id", self.line()),
                ));
            }

            self.report.observations += 1;
            return Ok(Some(RawObservation {
                segment_id,
                timestamp,
                travel_time,
            }));
        }
    }
}

/// Immutable columnar table of one extract's observations.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    source_name: String,
    base_date: NaiveDate,
    segments: SegmentDictionary,
    codes: SegmentCodes,
    minutes: Vec<i32>,
    travel_times: Vec<f32>,
    report: IngestReport,
}

impl ObservationTable {
    pub(crate) fn empty(source_name: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            base_date: NaiveDate::default(),
            segments: SegmentDictionary::default(),
            codes: SegmentCodes::default(),
            minutes: Vec::new(),
            travel_times: Vec::new(),
            report: IngestReport::default(),
        }
    }

    /// Reads an extract from disk.
    #[tracing::instrument(skip(columns), fields(path = %path.display()))]
    pub fn from_path(path: &Path, columns: &ColumnMap) -> Result<Self> {
        Self::from_extract(ExtractReader::from_path(path, columns)?)
    }

    /// Drains `reader` into a table.
    ///
    /// # Errors
    ///
    /// Propagates reader errors and returns [`Error::EmptyInput`] when no
    /// usable observation was found.
    pub fn from_extract<R: Read>(mut reader: ExtractReader<R>) -> Result<Self> {
        let mut table = Self::empty(reader.source_name());

        while let Some(obs) = reader.next_observation()? {
            table.push(obs.segment_id, obs.timestamp, obs.travel_time)?;
        }

        if table.is_empty() {
            return Err(Error::EmptyInput {
                source_name: table.source_name,
            });
        }

        table.report = IngestReport {
            segments: table.segments.len(),
            ..reader.report().clone()
        };
        info!(
            source = %table.source_name,
            rows_read = table.report.rows_read,
            observations = table.report.observations,
            missing_travel_time = table.report.missing_travel_time,
            segments = table.report.segments,
            narrow_codes = table.codes.is_narrow(),
            heap_bytes = table.heap_bytes(),
            "Extract ingested"
        );
        Ok(table)
    }

    pub(crate) fn push(
        &mut self,
        segment_id: &str,
        timestamp: NaiveDateTime,
        travel_time: f32,
    ) -> Result<()> {
        if self.minutes.is_empty() {
            self.base_date = timestamp.date();
        }
        let offset = (timestamp - self.base_date.and_time(NaiveTime::MIN)).num_minutes();
        let minutes = i32::try_from(offset).map_err(|_| {
            Error::malformed(
                &self.source_name,
                format!("timestamp {timestamp} is too far from {}", self.base_date),
            )
        })?;

        let code = self.segments.intern(segment_id);
        self.codes.push(code);
        self.minutes.push(minutes);
        self.travel_times.push(travel_time);
        Ok(())
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn len(&self) -> usize {
        self.travel_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.travel_times.is_empty()
    }

    pub fn report(&self) -> &IngestReport {
        &self.report
    }

    pub fn dictionary(&self) -> &SegmentDictionary {
        &self.segments
    }

    pub fn codes(&self) -> &SegmentCodes {
        &self.codes
    }

    pub fn segment_code(&self, row: usize) -> u32 {
        self.codes.get(row)
    }

    pub fn segment_id(&self, row: usize) -> &str {
        self.segments.resolve(self.codes.get(row))
    }

    /// Minutes since midnight of the base date, one per row.
    pub fn minutes(&self) -> &[i32] {
        &self.minutes
    }

    pub fn travel_times(&self) -> &[f32] {
        &self.travel_times
    }

    /// Calendar date `day_offset` days after the base date.
    pub fn date_at(&self, day_offset: i32) -> NaiveDate {
        let days = Days::new(day_offset.unsigned_abs() as u64);
        let date = if day_offset >= 0 {
            self.base_date.checked_add_days(days)
        } else {
            self.base_date.checked_sub_days(days)
        };
        date.unwrap_or(self.base_date)
    }

    pub fn timestamp(&self, row: usize) -> NaiveDateTime {
        self.base_date.and_time(NaiveTime::MIN)
            + chrono::Duration::minutes(self.minutes[row] as i64)
    }

    /// Minutes since 0001-01-01, comparable across tables.
    pub fn absolute_minute(&self, row: usize) -> i64 {
        self.base_date.num_days_from_ce() as i64 * 1440 + self.minutes[row] as i64
    }

    pub fn heap_bytes(&self) -> usize {
        self.codes.heap_bytes()
            + self.minutes.capacity() * size_of::<i32>()
            + self.travel_times.capacity() * size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "tmc_code,measurement_tstamp,speed,travel_time_seconds\n";

    fn table_from(body: &str) -> Result<ObservationTable> {
        let csv = format!("{HEADER}{body}");
        let reader = ExtractReader::from_reader("test.csv", csv.as_bytes(), &ColumnMap::default())?;
        ObservationTable::from_extract(reader)
    }

    #[test]
    fn test_ingest_basic_rows() {
        let table = table_from(
            "111+04099,2023-03-15 06:00:00,55.0,31.5\n\
             111+04099,2023-03-15 06:15:00,54.0,32.25\n\
             111-04100,2023-03-15 06:00:00,60.0,20\n",
        )
        .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.dictionary().len(), 2);
        assert_eq!(table.segment_id(0), "111+04099");
        assert_eq!(table.segment_code(0), table.segment_code(1));
        assert_eq!(table.segment_id(2), "111-04100");
        assert_eq!(table.minutes(), &[360, 375, 360]);
        assert_eq!(table.travel_times(), &[31.5, 32.25, 20.0]);
        assert!(table.codes().is_narrow());
        assert_eq!(
            table.timestamp(1),
            NaiveDateTime::parse_from_str("2023-03-15 06:15:00", "%Y-%m-%d %H:%M:%S").unwrap()
        );
    }

    #[test]
    fn test_rows_before_base_date_get_negative_offsets() {
        let table = table_from(
            "A,2023-03-15 00:00:00,1,10\n\
             A,2023-03-14 23:45:00,1,10\n",
        )
        .unwrap();
        assert_eq!(table.minutes(), &[0, -15]);
        assert_eq!(table.date_at(-1), NaiveDate::from_ymd_opt(2023, 3, 14).unwrap());
    }

    #[test]
    fn test_missing_travel_time_is_counted_not_fatal() {
        let table = table_from(
            "A,2023-03-15 06:00:00,55,\n\
             A,2023-03-15 06:15:00,55,30\n",
        )
        .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.report().rows_read, 2);
        assert_eq!(table.report().missing_travel_time, 1);
        assert_eq!(table.report().observations, 1);
        assert_eq!(table.report().segments, 1);
    }

    #[test]
    fn test_missing_column_is_malformed() {
        let csv = "tmc_code,measurement_tstamp\nA,2023-03-15 06:00:00\n";
        let err = ExtractReader::from_reader("bad.csv", csv.as_bytes(), &ColumnMap::default())
            .err()
            .unwrap();
        match err {
            Error::MalformedInput { message, .. } => {
                assert!(message.contains("travel_time_seconds"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_bad_timestamp_is_malformed() {
        let err = table_from("A,yesterday,55,30\n").unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[test]
    fn test_negative_travel_time_is_malformed() {
        let err = table_from("A,2023-03-15 06:00:00,55,-3\n").unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[test]
    fn test_ragged_row_is_malformed() {
        let err = table_from("A,2023-03-15 06:00:00\n").unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[test]
    fn test_empty_extract() {
        let err = table_from("").unwrap_err();
        assert!(matches!(err, Error::EmptyInput { .. }));

        let err = table_from("A,2023-03-15 06:00:00,55,\n").unwrap_err();
        assert!(matches!(err, Error::EmptyInput { .. }));
    }

    #[test]
    fn test_custom_columns_and_format() {
        let columns = ColumnMap {
            segment: "segment".to_string(),
            timestamp: "when".to_string(),
            travel_time: "tt".to_string(),
            timestamp_formats: vec!["%m/%d/%Y %H:%M".to_string()],
        };
        let csv = "when,tt,segment\n03/15/2023 07:30,12.5,S9\n";
        let reader = ExtractReader::from_reader("custom.csv", csv.as_bytes(), &columns).unwrap();
        let table = ObservationTable::from_extract(reader).unwrap();
        assert_eq!(table.segment_id(0), "S9");
        assert_eq!(table.minutes(), &[450]);
    }

    #[test]
    fn test_segment_codes_widen_past_u16() {
        let mut codes = SegmentCodes::default();
        codes.push(1);
        codes.push(u16::MAX as u32);
        assert!(codes.is_narrow());
        codes.push(u16::MAX as u32 + 1);
        assert!(!codes.is_narrow());
        assert_eq!(codes.len(), 3);
        assert_eq!(codes.get(0), 1);
        assert_eq!(codes.get(2), 65536);
    }
}
