//! Durable record sinks.
//!
//! Every measurement kind persists the same record schema; only the payload
//! width changes (one value for the cryostat, one per bin for a spectrum):
//!
//! | column        | meaning                                           |
//! |---------------|---------------------------------------------------|
//! | `job_id`      | owning measurement job                            |
//! | `sequence`    | channel sequence number, unique within the job    |
//! | `elapsed_s`   | monotonic seconds since the job started           |
//! | `acquired_at` | RFC 3339 wall clock time                          |
//! | `channel`     | producing device                                  |
//! | `width`       | payload length                                    |
//! | `payload`     | values joined by `;`                              |
//!
//! [`CsvSink`] writes one file per job plus a JSON metadata sidecar.
//! [`MemorySink`] keeps everything in memory and can be told to fail.

use crate::core::{JobId, Sample};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Owning job.
    pub job_id: String,
    /// Channel sequence number.
    pub sequence: u64,
    /// Seconds since the job started.
    pub elapsed_s: f64,
    /// Wall clock acquisition time.
    pub acquired_at: DateTime<Utc>,
    /// Producing device.
    pub channel: String,
    /// Readings.
    pub payload: Vec<f64>,
}

impl Record {
    /// Build a record from a sequenced sample.
    pub fn from_sample(job_id: &JobId, sequence: u64, sample: &Sample, started: Instant) -> Self {
        Self {
            job_id: job_id.to_string(),
            sequence,
            elapsed_s: sample.timestamp.saturating_duration_since(started).as_secs_f64(),
            acquired_at: sample.acquired_at,
            channel: sample.channel_id.clone(),
            payload: sample.payload.clone(),
        }
    }

    /// Payload length.
    pub fn width(&self) -> usize {
        self.payload.len()
    }

    /// Payload values joined by `;`.
    pub fn payload_field(&self) -> String {
        self.payload
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Parse a `;`-joined payload field.
    pub fn parse_payload(field: &str) -> AppResult<Vec<f64>> {
        if field.is_empty() {
            return Ok(Vec::new());
        }
        field
            .split(';')
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|e| DaqError::Storage(format!("bad payload value '{v}': {e}")))
            })
            .collect()
    }
}

/// Job description written next to the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Job id.
    pub job_id: String,
    /// Measurement kind (`background`, `kinetic`, ...).
    pub kind: String,
    /// Wall clock start time.
    pub started_at: DateTime<Utc>,
    /// Free text entered by the operator.
    pub comments: String,
    /// Serialised measurement parameters.
    pub parameters: serde_json::Value,
    /// Settings snapshot of each participating device.
    pub instruments: BTreeMap<String, serde_json::Value>,
    /// Version of this software.
    pub software_version: String,
}

impl JobMetadata {
    /// Metadata for `job_id` with empty comments.
    pub fn new(job_id: &JobId, kind: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind: kind.into(),
            started_at: Utc::now(),
            comments: String::new(),
            parameters,
            instruments: BTreeMap::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Append-only destination for records of one job.
#[async_trait]
pub trait RecordSink: Send {
    /// Prepare storage for a job.
    async fn open(&mut self, metadata: &JobMetadata) -> AppResult<()>;

    /// Append records in order.
    async fn append(&mut self, records: &[Record]) -> AppResult<()>;

    /// Push buffered records to durable storage.
    async fn flush(&mut self) -> AppResult<()>;

    /// Flush and release the storage.
    async fn close(&mut self) -> AppResult<()>;
}

/// Creates one sink per persisted job.
pub type SinkFactory = Arc<dyn Fn(&JobId) -> Box<dyn RecordSink> + Send + Sync>;

// =============================================================================
// CSV
// =============================================================================

/// Column names of the CSV data file.
pub const CSV_HEADER: [&str; 7] = [
    "job_id",
    "sequence",
    "elapsed_s",
    "acquired_at",
    "channel",
    "width",
    "payload",
];

/// Writes `<job>.csv` and `<job>_metadata.json` under an output directory.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    output_dir: PathBuf,
    write_metadata: bool,
    path: Option<PathBuf>,
    writer: Option<csv::Writer<std::fs::File>>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Sink writing below `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>, write_metadata: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            write_metadata,
            path: None,
            writer: None,
        }
    }

    /// Factory producing a fresh `CsvSink` per job.
    pub fn factory(output_dir: impl Into<PathBuf>, write_metadata: bool) -> SinkFactory {
        let output_dir = output_dir.into();
        Arc::new(move |_job: &JobId| {
            Box::new(CsvSink::new(output_dir.clone(), write_metadata)) as Box<dyn RecordSink>
        })
    }

    /// Data file path once opened.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    fn csv_err(e: csv::Error) -> DaqError {
        DaqError::Storage(e.to_string())
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl RecordSink for CsvSink {
    async fn open(&mut self, metadata: &JobMetadata) -> AppResult<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(format!("{}.csv", metadata.job_id));

        if self.write_metadata {
            let sidecar = self
                .output_dir
                .join(format!("{}_metadata.json", metadata.job_id));
            let json = serde_json::to_string_pretty(metadata)
                .map_err(|e| DaqError::Storage(e.to_string()))?;
            std::fs::write(&sidecar, json)?;
        }

        let mut writer = csv::Writer::from_path(&path).map_err(Self::csv_err)?;
        writer.write_record(CSV_HEADER).map_err(Self::csv_err)?;
        tracing::info!(job_id = %metadata.job_id, path = %path.display(), "CSV sink opened");
        self.path = Some(path);
        self.writer = Some(writer);
        Ok(())
    }

    async fn append(&mut self, records: &[Record]) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Storage("CSV sink is not open".to_string()))?;
        for r in records {
            writer
                .write_record([
                    r.job_id.clone(),
                    r.sequence.to_string(),
                    format!("{:.6}", r.elapsed_s),
                    r.acquired_at.to_rfc3339(),
                    r.channel.clone(),
                    r.width().to_string(),
                    r.payload_field(),
                ])
                .map_err(Self::csv_err)?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            tracing::info!(path = ?self.path, "CSV sink closed");
        }
        Ok(())
    }
}

/// Read back a data file written by [`CsvSink`].
#[cfg(feature = "storage_csv")]
pub fn read_csv_records(path: &std::path::Path) -> AppResult<Vec<Record>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| DaqError::Storage(e.to_string()))?;
    let mut out = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| DaqError::Storage(e.to_string()))?;
        let field = |i: usize| row.get(i).unwrap_or_default();
        let parse_err = |what: &str| DaqError::Storage(format!("bad {what} in {}", path.display()));
        out.push(Record {
            job_id: field(0).to_string(),
            sequence: field(1).parse().map_err(|_| parse_err("sequence"))?,
            elapsed_s: field(2).parse().map_err(|_| parse_err("elapsed_s"))?,
            acquired_at: DateTime::parse_from_rfc3339(field(3))
                .map_err(|_| parse_err("acquired_at"))?
                .with_timezone(&Utc),
            channel: field(4).to_string(),
            payload: Record::parse_payload(field(6))?,
        });
    }
    Ok(out)
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryStore {
    records: Vec<Record>,
    metadata: Vec<JobMetadata>,
    flushes: u64,
    closed: u64,
}

/// Sink that keeps records in memory. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemorySink {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory handing out clones of this sink.
    pub fn factory(&self) -> SinkFactory {
        let sink = self.clone();
        Arc::new(move |_job: &JobId| Box::new(sink.clone()) as Box<dyn RecordSink>)
    }

    /// Make every `append` fail with a storage error until switched off.
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// All records written so far.
    pub fn records(&self) -> Vec<Record> {
        self.store.lock().records.clone()
    }

    /// Records of one job.
    pub fn records_for(&self, job_id: &JobId) -> Vec<Record> {
        self.store
            .lock()
            .records
            .iter()
            .filter(|r| r.job_id == job_id.as_str())
            .cloned()
            .collect()
    }

    /// Metadata of every opened job.
    pub fn metadata(&self) -> Vec<JobMetadata> {
        self.store.lock().metadata.clone()
    }

    /// Number of `close` calls.
    pub fn close_count(&self) -> u64 {
        self.store.lock().closed
    }

    /// Number of `flush` calls.
    pub fn flush_count(&self) -> u64 {
        self.store.lock().flushes
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn open(&mut self, metadata: &JobMetadata) -> AppResult<()> {
        self.store.lock().metadata.push(metadata.clone());
        Ok(())
    }

    async fn append(&mut self, records: &[Record]) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DaqError::Storage("simulated disk full".to_string()));
        }
        self.store.lock().records.extend_from_slice(records);
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.store.lock().flushes += 1;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.store.lock().closed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, payload: Vec<f64>) -> Record {
        Record {
            job_id: "job1".into(),
            sequence: seq,
            elapsed_s: seq as f64 * 0.1,
            acquired_at: Utc::now(),
            channel: "spectrometer".into(),
            payload,
        }
    }

    #[test]
    fn payload_field_round_trips() {
        let r = record(0, vec![1.5, -2.0, 3.25]);
        assert_eq!(r.payload_field(), "1.5;-2;3.25");
        assert_eq!(Record::parse_payload(&r.payload_field()).unwrap(), r.payload);
        assert!(Record::parse_payload("").unwrap().is_empty());
        assert!(Record::parse_payload("1;x").is_err());
    }

    #[tokio::test]
    async fn memory_sink_can_fail_writes() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.append(&[record(0, vec![1.0])]).await.unwrap();
        sink.fail_writes(true);
        assert!(writer.append(&[record(1, vec![1.0])]).await.is_err());
        assert_eq!(sink.records().len(), 1);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn csv_sink_writes_data_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobId::from_string("job1");
        let mut meta = JobMetadata::new(&job, "kinetic", serde_json::json!({"period_ms": 50}));
        meta.comments = "sample A, 10 K".into();

        let mut sink = CsvSink::new(dir.path(), true);
        sink.open(&meta).await.unwrap();
        sink.append(&[record(0, vec![4.2]), record(1, vec![1.0, 2.0, 3.0])])
            .await
            .unwrap();
        sink.close().await.unwrap();

        let rows = read_csv_records(&dir.path().join("job1.csv")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].sequence, 1);
        assert_eq!(rows[1].payload, vec![1.0, 2.0, 3.0]);

        let sidecar = std::fs::read_to_string(dir.path().join("job1_metadata.json")).unwrap();
        let parsed: JobMetadata = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(parsed.comments, "sample A, 10 K");
        assert_eq!(parsed.kind, "kinetic");
    }
}
