//! Acquisition pipeline integration tests
//!
//! Drives mock instruments through `AcquisitionWorker`, `DataChannel` and
//! `PersistenceWorker` into CSV files under a temporary directory.
//!
//! # Test Coverage
//!
//! - Channel ordering under concurrent producer and consumer
//! - Live and persistence channels side by side
//! - Worker lifecycle: double start, lease release, fault escalation
//! - End-to-end persistence with metadata sidecar
//! - Sink faults do not stop acquisition

use spectro_daq::acquisition::{AcquisitionConfig, AcquisitionLimit, AcquisitionWorker, WorkerState};
use spectro_daq::core::{JobId, Sample};
#[cfg(feature = "storage_csv")]
use spectro_daq::data::{storage::read_csv_records, CsvSink};
use spectro_daq::data::{
    DataChannel, JobMetadata, MemorySink, OverflowPolicy, PersistenceConfig, PersistenceWorker,
};
use spectro_daq::error::DaqError;
use spectro_daq::error_recovery::RetryPolicy;
use spectro_daq::hardware::mock::{FaultInjector, MockSpectrometer};
use spectro_daq::hardware::InstrumentHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
#[cfg(feature = "storage_csv")]
use tempfile::TempDir;
use tokio::sync::watch;

// =============================================================================
// Test Helper Functions
// =============================================================================

async fn spectrometer(bins: usize) -> (Arc<InstrumentHandle>, FaultInjector) {
    let driver = MockSpectrometer::new(bins);
    let faults = driver.faults();
    let handle = Arc::new(InstrumentHandle::new("spectrometer", driver));
    handle.connect().await.expect("mock connects");
    (handle, faults)
}

fn fast_config(limit: AcquisitionLimit) -> AcquisitionConfig {
    AcquisitionConfig::new(Duration::from_millis(1))
        .with_limit(limit)
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
}

fn quick_flush() -> PersistenceConfig {
    PersistenceConfig {
        batch_size: 8,
        flush_interval: Duration::from_millis(10),
    }
}

// =============================================================================
// DataChannel
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_sees_non_decreasing_sequence_under_contention() {
    let channel = Arc::new(DataChannel::new("contended", 16, OverflowPolicy::Block));
    let producers: Vec<_> = (0..4)
        .map(|p| {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                for i in 0..250 {
                    channel
                        .push(Arc::new(Sample::scalar(format!("p{p}"), i as f64)))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    let consumer = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            let (_tx, mut never) = watch::channel(false);
            let mut seqs = Vec::new();
            loop {
                let batch = channel.recv_batch(7, &mut never).await;
                if batch.is_empty() {
                    break;
                }
                seqs.extend(batch.iter().map(|s| s.seq));
            }
            seqs
        })
    };

    for producer in producers {
        producer.await.unwrap();
    }
    channel.close();
    let seqs = consumer.await.unwrap();

    assert_eq!(seqs.len(), 1000);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(channel.dropped(), 0);
}

// =============================================================================
// AcquisitionWorker lifecycle
// =============================================================================

#[tokio::test]
async fn second_start_fails_and_worker_keeps_running() {
    let (handle, _) = spectrometer(8).await;
    let out = Arc::new(DataChannel::new("out", 8, OverflowPolicy::DropOldest));
    let mut worker = AcquisitionWorker::new("kinetic");

    worker
        .start(&handle, vec![Arc::clone(&out)], fast_config(AcquisitionLimit::Continuous), None)
        .unwrap();
    let err = worker
        .start(&handle, vec![out], fast_config(AcquisitionLimit::Continuous), None)
        .unwrap_err();

    assert!(matches!(err, DaqError::AlreadyRunning(_)));
    assert_eq!(worker.state(), WorkerState::Running);
    worker.stop().await;
}

#[tokio::test]
async fn lease_is_free_as_soon_as_stop_returns() {
    let (handle, _) = spectrometer(8).await;
    let out = Arc::new(DataChannel::new("out", 64, OverflowPolicy::DropOldest));

    let mut first = AcquisitionWorker::new("first");
    first
        .start(&handle, vec![Arc::clone(&out)], fast_config(AcquisitionLimit::Continuous), None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.stop().await;
    assert_eq!(first.state(), WorkerState::Stopped);
    assert_eq!(handle.lease_holder(), None);

    let mut second = AcquisitionWorker::new("second");
    second
        .start(&handle, vec![out], fast_config(AcquisitionLimit::Count(3)), None)
        .unwrap();
    let exit = second.join().await;
    assert_eq!(exit.samples, 3);
    assert!(exit.fault().is_none());
}

#[tokio::test]
async fn faults_beyond_retry_bound_stop_with_device_fault() {
    let (handle, faults) = spectrometer(8).await;
    faults.fail_always(true);
    let out = Arc::new(DataChannel::new("out", 8, OverflowPolicy::DropOldest));
    let mut worker = AcquisitionWorker::new("doomed");
    worker
        .start(&handle, vec![out], fast_config(AcquisitionLimit::Continuous), None)
        .unwrap();

    let exit = worker.join().await;
    assert!(matches!(exit.fault(), Some(DaqError::DeviceFault { device, .. }) if device == "spectrometer"));
    assert_eq!(exit.retries, 2);
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(handle.lease_holder(), None);
}

// =============================================================================
// Persistence
// =============================================================================

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn worker_to_csv_round_trip() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (handle, _) = spectrometer(16).await;
    let job_id = JobId::new();
    let started = Instant::now();

    let live = Arc::new(DataChannel::new("live", 4, OverflowPolicy::DropOldest));
    let persist = Arc::new(DataChannel::new("persist", 32, OverflowPolicy::Block));
    let mut metadata = JobMetadata::new(&job_id, "kinetic", serde_json::json!({ "samples": 12 }));
    metadata.comments = "round trip".to_string();
    let writer = PersistenceWorker::spawn(
        metadata,
        Arc::clone(&persist),
        Box::new(CsvSink::new(dir.path(), true)),
        quick_flush(),
        started,
        None,
    );

    let mut worker = AcquisitionWorker::new("kinetic");
    worker.start(
        &handle,
        vec![Arc::clone(&live), Arc::clone(&persist)],
        fast_config(AcquisitionLimit::Count(12)),
        None,
    )?;
    let exit = worker.join().await;
    assert_eq!(exit.samples, 12);

    let report = writer.stop().await;
    assert_eq!(report.written, 12);
    assert_eq!(report.fault_count, 0);

    let records = read_csv_records(&dir.path().join(format!("{job_id}.csv")))?;
    let seqs: Vec<u64> = records.iter().map(|r| r.sequence).collect();
    assert_eq!(seqs, (0..12).collect::<Vec<_>>());
    assert!(records.iter().all(|r| r.payload.len() == 16 && r.channel == "spectrometer"));
    assert!(records.windows(2).all(|w| w[0].elapsed_s <= w[1].elapsed_s));
    // live consumer never read anything; only the newest survive there
    assert_eq!(live.len(), 4);
    assert_eq!(live.dropped(), 8);

    let sidecar = std::fs::read_to_string(dir.path().join(format!("{job_id}_metadata.json")))?;
    let sidecar: JobMetadata = serde_json::from_str(&sidecar)?;
    assert_eq!(sidecar.comments, "round trip");
    assert_eq!(sidecar.kind, "kinetic");
    Ok(())
}

#[tokio::test]
async fn sink_faults_are_reported_without_stopping_acquisition() {
    let (handle, _) = spectrometer(4).await;
    let sink = MemorySink::new();
    sink.fail_writes(true);
    let job_id = JobId::new();
    let persist = Arc::new(DataChannel::new("persist", 16, OverflowPolicy::Block));
    let (fault_tx, mut fault_rx) = tokio::sync::mpsc::unbounded_channel();
    let writer = PersistenceWorker::spawn(
        JobMetadata::new(&job_id, "run", serde_json::Value::Null),
        Arc::clone(&persist),
        (sink.factory())(&job_id),
        quick_flush(),
        Instant::now(),
        Some(fault_tx),
    );

    let mut worker = AcquisitionWorker::new("run");
    worker
        .start(&handle, vec![persist], fast_config(AcquisitionLimit::Count(10)), None)
        .unwrap();
    let exit = worker.join().await;
    assert_eq!(exit.samples, 10);
    assert!(exit.fault().is_none());

    let report = writer.stop().await;
    assert_eq!(report.written, 0);
    assert_eq!(report.failed, 10);
    assert!(report.fault_count > 0);
    assert!(report
        .faults
        .iter()
        .all(|f| matches!(f, DaqError::PersistFault(_))));
    assert!(matches!(fault_rx.try_recv(), Ok(DaqError::PersistFault(_))));
}
