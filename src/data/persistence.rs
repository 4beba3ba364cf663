//! Persistence worker.
//!
//! Drains one [`DataChannel`] in batches and appends the samples to a
//! [`RecordSink`], decoupled from acquisition timing. Write failures are
//! recorded as [`DaqError::PersistFault`] and reported, but the worker keeps
//! draining so a broken disk never stalls a backpressure-mode producer.
//!
//! Pausing stops draining. Under [`OverflowPolicy::Block`](super::OverflowPolicy)
//! the producer then waits and nothing is lost; under the lossy policy the
//! channel drops, and the drop count ends up in the [`PersistReport`].

use super::channel::DataChannel;
use super::storage::{JobMetadata, Record, RecordSink};
use crate::core::{JobId, Sequenced};
use crate::error::DaqError;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Most faults kept verbatim in a report; the rest are only counted.
const MAX_REPORTED_FAULTS: usize = 16;

/// Tuning of one persistence worker.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Largest batch handed to the sink at once.
    pub batch_size: usize,
    /// Period of explicit sink flushes.
    pub flush_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            flush_interval: Duration::from_millis(500),
        }
    }
}

/// Outcome of a persistence worker, attached to the job report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersistReport {
    /// Records accepted by the sink.
    pub written: u64,
    /// Records lost to sink errors.
    pub failed: u64,
    /// Number of sink errors.
    pub fault_count: u64,
    /// First sink errors, as `PersistFault`.
    pub faults: Vec<DaqError>,
    /// Samples the channel dropped before they could be drained.
    pub channel_dropped: u64,
}

impl PersistReport {
    fn record_fault(&mut self, fault: DaqError) {
        self.fault_count += 1;
        if self.faults.len() < MAX_REPORTED_FAULTS {
            self.faults.push(fault);
        }
    }
}

/// Handle to a running persistence task.
#[derive(Debug)]
pub struct PersistenceWorker {
    job_id: JobId,
    stop_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    task: JoinHandle<PersistReport>,
}

impl PersistenceWorker {
    /// Start draining `channel` into `sink`.
    ///
    /// `started` is the job's monotonic start, used for `elapsed_s`. Every
    /// `PersistFault` is also sent on `faults` as it happens.
    pub fn spawn(
        metadata: JobMetadata,
        channel: Arc<DataChannel>,
        sink: Box<dyn RecordSink>,
        config: PersistenceConfig,
        started: Instant,
        faults: Option<mpsc::UnboundedSender<DaqError>>,
    ) -> Self {
        let job_id = JobId::from_string(metadata.job_id.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        let task = tokio::spawn(
            PersistLoop {
                job_id: job_id.clone(),
                channel,
                sink,
                config,
                started,
                faults,
                report: PersistReport::default(),
                sink_open: false,
            }
            .run(metadata, stop_rx, pause_rx),
        );
        Self {
            job_id,
            stop_tx,
            pause_tx,
            task,
        }
    }

    /// Job this worker persists.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Stop draining until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    /// Continue draining.
    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    /// Whether draining is paused.
    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Drain what is left, close the sink and return the report.
    pub async fn stop(self) -> PersistReport {
        self.stop_tx.send_replace(true);
        match self.task.await {
            Ok(report) => report,
            Err(err) => {
                error!(job_id = %self.job_id, error = %err, "Persistence task panicked");
                let mut report = PersistReport::default();
                report.record_fault(DaqError::PersistFault(format!("persistence task failed: {err}")));
                report
            }
        }
    }
}

struct PersistLoop {
    job_id: JobId,
    channel: Arc<DataChannel>,
    sink: Box<dyn RecordSink>,
    config: PersistenceConfig,
    started: Instant,
    faults: Option<mpsc::UnboundedSender<DaqError>>,
    report: PersistReport,
    sink_open: bool,
}

impl PersistLoop {
    async fn run(
        mut self,
        metadata: JobMetadata,
        mut stop_rx: watch::Receiver<bool>,
        mut pause_rx: watch::Receiver<bool>,
    ) -> PersistReport {
        match self.sink.open(&metadata).await {
            Ok(()) => self.sink_open = true,
            Err(err) => self.fault("open", err),
        }
        info!(job_id = %self.job_id, channel = %self.channel.name(), "Persistence started");

        let mut flush_tick = tokio::time::interval(self.config.flush_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let batch_size = self.config.batch_size.max(1);

        loop {
            if *stop_rx.borrow() {
                break;
            }
            if *pause_rx.borrow() {
                debug!(job_id = %self.job_id, "Persistence paused");
                tokio::select! {
                    _ = pause_rx.wait_for(|paused| !*paused) => {}
                    _ = stop_rx.wait_for(|stop| *stop) => {}
                }
                continue;
            }

            tokio::select! {
                batch = self.channel.recv_batch(batch_size, &mut stop_rx) => {
                    if batch.is_empty() {
                        if self.channel.is_closed() && self.channel.is_empty() {
                            break;
                        }
                        continue;
                    }
                    self.write(batch).await;
                }
                _ = flush_tick.tick() => self.flush().await,
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        // worker handle dropped without stop
                        break;
                    }
                }
            }
        }

        loop {
            let batch = self.channel.pop_batch(batch_size);
            if batch.is_empty() {
                break;
            }
            self.write(batch).await;
        }
        self.flush().await;
        if self.sink_open {
            if let Err(err) = self.sink.close().await {
                self.fault("close", err);
            }
        }

        self.report.channel_dropped = self.channel.dropped();
        info!(
            job_id = %self.job_id,
            written = self.report.written,
            failed = self.report.failed,
            dropped = self.report.channel_dropped,
            "Persistence stopped"
        );
        self.report
    }

    async fn write(&mut self, batch: Vec<Sequenced>) {
        let n = batch.len() as u64;
        if !self.sink_open {
            self.report.failed += n;
            return;
        }
        let records: Vec<Record> = batch
            .iter()
            .map(|s| Record::from_sample(&self.job_id, s.seq, &s.sample, self.started))
            .collect();
        match self.sink.append(&records).await {
            Ok(()) => self.report.written += n,
            Err(err) => {
                self.report.failed += n;
                self.fault("append", err);
            }
        }
    }

    async fn flush(&mut self) {
        if self.sink_open {
            if let Err(err) = self.sink.flush().await {
                self.fault("flush", err);
            }
        }
    }

    fn fault(&mut self, op: &str, err: DaqError) {
        let fault = DaqError::PersistFault(format!("{op}: {err}"));
        warn!(job_id = %self.job_id, error = %fault, "Persistence fault");
        if let Some(tx) = &self.faults {
            let _ = tx.send(fault.clone());
        }
        self.report.record_fault(fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Sample;
    use crate::data::channel::OverflowPolicy;
    use crate::data::storage::MemorySink;

    fn metadata(job: &str) -> JobMetadata {
        JobMetadata::new(&JobId::from_string(job), "run", serde_json::Value::Null)
    }

    fn fast_config() -> PersistenceConfig {
        PersistenceConfig {
            batch_size: 4,
            flush_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn stop_drains_remaining_samples() {
        let channel = Arc::new(DataChannel::new("persist", 100, OverflowPolicy::Block));
        let sink = MemorySink::new();
        let worker = PersistenceWorker::spawn(
            metadata("job-a"),
            Arc::clone(&channel),
            Box::new(sink.clone()),
            fast_config(),
            Instant::now(),
            None,
        );
        for i in 0..25 {
            channel.push(Arc::new(Sample::scalar("cryo", i as f64))).await.unwrap();
        }
        let report = worker.stop().await;

        assert_eq!(report.written, 25);
        assert_eq!(report.failed, 0);
        let seqs: Vec<u64> = sink.records().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, (0..25).collect::<Vec<_>>());
        assert_eq!(sink.close_count(), 1);
        assert_eq!(sink.metadata()[0].job_id, "job-a");
    }

    #[tokio::test]
    async fn pause_under_backpressure_loses_nothing() {
        let channel = Arc::new(DataChannel::new("persist", 3, OverflowPolicy::Block));
        let sink = MemorySink::new();
        let worker = PersistenceWorker::spawn(
            metadata("job-b"),
            Arc::clone(&channel),
            Box::new(sink.clone()),
            fast_config(),
            Instant::now(),
            None,
        );
        worker.pause();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let producer = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                for i in 0..10 {
                    channel.push(Arc::new(Sample::scalar("cryo", i as f64))).await.unwrap();
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!producer.is_finished());
        assert!(sink.records().is_empty());

        worker.resume();
        producer.await.unwrap();
        let report = worker.stop().await;
        assert_eq!(report.written, 10);
        assert_eq!(report.channel_dropped, 0);
    }

    #[tokio::test]
    async fn write_failures_are_reported_not_fatal() {
        let channel = Arc::new(DataChannel::new("persist", 100, OverflowPolicy::Block));
        let sink = MemorySink::new();
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let worker = PersistenceWorker::spawn(
            metadata("job-c"),
            Arc::clone(&channel),
            Box::new(sink.clone()),
            fast_config(),
            Instant::now(),
            Some(fault_tx),
        );

        sink.fail_writes(true);
        channel.push(Arc::new(Sample::scalar("spectrometer", 1.0))).await.unwrap();
        let fault = tokio::time::timeout(Duration::from_secs(1), fault_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fault, DaqError::PersistFault(_)));

        sink.fail_writes(false);
        channel.push(Arc::new(Sample::scalar("spectrometer", 2.0))).await.unwrap();
        let report = worker.stop().await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.written, 1);
        assert_eq!(report.fault_count, 1);
        assert_eq!(sink.records()[0].payload, vec![2.0]);
    }

    #[tokio::test]
    async fn lossy_drops_surface_in_report() {
        let channel = Arc::new(DataChannel::new("live", 2, OverflowPolicy::DropOldest));
        for i in 0..5 {
            channel.push(Arc::new(Sample::scalar("spectrometer", i as f64))).await.unwrap();
        }
        let sink = MemorySink::new();
        let worker = PersistenceWorker::spawn(
            metadata("job-d"),
            Arc::clone(&channel),
            Box::new(sink.clone()),
            fast_config(),
            Instant::now(),
            None,
        );
        let report = worker.stop().await;
        assert_eq!(report.channel_dropped, 3);
        assert_eq!(report.written, 2);
    }
}
