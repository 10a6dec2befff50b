//! Partition-then-scan aggregation for extracts that do not fit in memory.
//!
//! Rows are streamed from the extract, classified on the fly and written as
//! fixed-width records into `partitions` files, partitioned by segment code.
//! Every group lives in exactly one partition, so partitions are loaded,
//! sorted and scanned one at a time.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info};

use crate::analyzers::aggregate::{
    AggregateConfig, Aggregation, AggregationReport, reduce_group, sort_stats,
};
use crate::error::{Error, Result};
use crate::ingest::{ExtractReader, IngestReport, SegmentDictionary};
use crate::period::{Classified, ClassificationReport, CompiledCalendar, Period};

/// Segment code (u32), period code (u8), travel time (f32), little endian.
const RECORD_LEN: usize = 9;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpillReport {
    pub partitions: usize,
    pub spilled_records: u64,
    pub largest_partition: u64,
}

/// Everything the partitioned path learns about one extract.
#[derive(Debug, Clone)]
pub struct SpilledAggregation {
    pub aggregation: Aggregation,
    pub classification: ClassificationReport,
    pub ingest: IngestReport,
    pub spill: SpillReport,
}

struct PartitionWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

fn encode(code: u32, period: Period, travel_time: f32) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[0..4].copy_from_slice(&code.to_le_bytes());
    record[4] = period.code();
    record[5..9].copy_from_slice(&travel_time.to_le_bytes());
    record
}

fn decode(record: &[u8]) -> (u64, f32) {
    let code = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    let travel_time = f32::from_le_bytes([record[5], record[6], record[7], record[8]]);
    (code as u64 * Period::COUNT as u64 + record[4] as u64, travel_time)
}

/// Streams `reader` through classification into on-disk partitions, then
/// aggregates one partition at a time.
///
/// # Errors
///
/// Propagates ingest errors, returns [`Error::EmptyInput`] when the extract
/// has no usable rows and [`Error::InvalidConfig`] for zero partitions.
#[tracing::instrument(skip_all, fields(source = %reader.source_name(), partitions = partitions))]
pub fn aggregate_partitioned<R: Read>(
    mut reader: ExtractReader<R>,
    calendar: &CompiledCalendar,
    config: &AggregateConfig,
    partitions: usize,
) -> Result<SpilledAggregation> {
    if partitions == 0 {
        return Err(Error::InvalidConfig(
            "partitioned aggregation needs at least one partition".to_string(),
        ));
    }

    let scratch_dir = tempfile::Builder::new().prefix("lottr-spill-").tempdir()?;
    let mut writers = (0..partitions)
        .map(|i| -> Result<PartitionWriter> {
            let path = scratch_dir.path().join(format!("partition-{i:04}.bin"));
            let file = File::create(&path)?;
            Ok(PartitionWriter {
                path,
                writer: BufWriter::new(file),
                records: 0,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut dictionary = SegmentDictionary::default();
    let mut classification = ClassificationReport::default();

    while let Some(obs) = reader.next_observation()? {
        let code = dictionary.intern(obs.segment_id);
        let classified = calendar.classify(obs.timestamp);
        classification.record(classified);
        let Classified::Period(period) = classified else {
            continue;
        };
        let partition = &mut writers[code as usize % partitions];
        partition
            .writer
            .write_all(&encode(code, period, obs.travel_time))?;
        partition.records += 1;
    }

    let ingest = IngestReport {
        segments: dictionary.len(),
        ..reader.report().clone()
    };
    if ingest.observations == 0 {
        return Err(Error::EmptyInput {
            source_name: reader.source_name().to_string(),
        });
    }

    let mut spill = SpillReport {
        partitions,
        ..Default::default()
    };
    let mut paths = Vec::with_capacity(partitions);
    for partition in writers {
        let mut writer = partition.writer;
        writer.flush()?;
        spill.spilled_records += partition.records;
        spill.largest_partition = spill.largest_partition.max(partition.records);
        paths.push(partition.path);
    }
    debug!(
        spilled_records = spill.spilled_records,
        largest_partition = spill.largest_partition,
        "Spill complete"
    );

    let mut stats = Vec::new();
    let mut report = AggregationReport::default();
    let mut scratch: Vec<f32> = Vec::new();

    for path in &paths {
        let bytes = std::fs::read(path)?;
        let mut records: Vec<(u64, f32)> = bytes.chunks_exact(RECORD_LEN).map(decode).collect();
        drop(bytes);
        records.sort_unstable_by_key(|&(key, _)| key);

        for run in records.chunk_by(|a, b| a.0 == b.0) {
            let key = run[0].0;
            let segment_id = dictionary.resolve((key / Period::COUNT as u64) as u32);
            let Some(period) = Period::from_code((key % Period::COUNT as u64) as u8) else {
                continue;
            };
            scratch.clear();
            scratch.extend(run.iter().map(|&(_, tt)| tt));
            if let Some(group) = reduce_group(segment_id, period, &mut scratch, config, &mut report)
            {
                stats.push(group);
            }
        }
        std::fs::remove_file(path)?;
    }

    sort_stats(&mut stats);
    info!(
        observations = ingest.observations,
        groups = report.groups,
        excluded_groups = report.excluded_groups,
        "Aggregated extract through partitions"
    );

    Ok(SpilledAggregation {
        aggregation: Aggregation { stats, report },
        classification,
        ingest,
        spill,
    })
}
