//! Per-job runtime shared by every measurement kind.
//!
//! [`JobPlan`] is the validated form of a request. Validation only inspects
//! registry and controller state, so a plan that fails it never touched a
//! device. [`JobContext`] carries the job's signals, its live channel and the
//! running tally that ends up in the [`JobReport`].

use super::controller::ControllerShared;
use super::{
    background, spectral_beam, stream, temperature_series, vertical_beam, JobReport, JobResult, JobState, JobStatus,
    MeasurementKind, MeasurementRequest, PeakInfo,
};
use crate::acquisition::{AcquisitionConfig, AcquisitionLimit, AcquisitionWorker, WorkerEvent, WorkerExit};
use crate::core::{JobId, Sample, SharedSample};
use crate::data::{DataChannel, JobMetadata, PersistReport, PersistenceWorker};
use crate::error::{AppResult, DaqError};
use crate::hardware::InstrumentHandle;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Plans
// =============================================================================

/// Validated request, ready to run.
pub(crate) enum JobPlan {
    Background(background::BackgroundPlan),
    Calibration(vertical_beam::CalibrationPlan),
    SpectralCalibration(spectral_beam::SpectralCalibrationPlan),
    Stream(stream::StreamPlan),
    TemperatureSeries(temperature_series::TemperatureSeriesPlan),
}

impl JobPlan {
    /// Check preconditions and resolve devices. Performs no device I/O.
    pub(crate) fn validate(
        request: &MeasurementRequest,
        shared: &ControllerShared,
    ) -> AppResult<Self> {
        match request {
            MeasurementRequest::Background(p) => {
                background::validate(p, shared).map(JobPlan::Background)
            }
            MeasurementRequest::Calibration(p) => {
                vertical_beam::validate(p, shared).map(JobPlan::Calibration)
            }
            MeasurementRequest::Kinetic(p) => stream::validate_kinetic(p, shared).map(JobPlan::Stream),
            MeasurementRequest::Run(p) => stream::validate_run(p, shared).map(JobPlan::Stream),
            MeasurementRequest::View(p) => stream::validate_view(p, shared).map(JobPlan::Stream),
            MeasurementRequest::SpectralCalibration(p) => {
                spectral_beam::validate(p, shared).map(JobPlan::SpectralCalibration)
            }
            MeasurementRequest::TemperatureSeries(p) => {
                temperature_series::validate(p, shared).map(JobPlan::TemperatureSeries)
            }
        }
    }

    pub(crate) async fn run(self, ctx: &mut JobContext) -> AppResult<JobResult> {
        match self {
            JobPlan::Background(plan) => background::run(plan, ctx).await,
            JobPlan::Calibration(plan) => vertical_beam::run(plan, ctx).await,
            JobPlan::SpectralCalibration(plan) => spectral_beam::run(plan, ctx).await,
            JobPlan::Stream(plan) => stream::run(plan, ctx).await,
            JobPlan::TemperatureSeries(plan) => temperature_series::run(plan, ctx).await,
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Controller side of a job's signals.
#[derive(Debug)]
pub(crate) struct JobControl {
    stop: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
    pause: watch::Sender<bool>,
}

/// Job side of the signals.
#[derive(Debug, Clone)]
pub(crate) struct JobSignals {
    pub(crate) stop: watch::Receiver<bool>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) pause: watch::Receiver<bool>,
}

impl JobControl {
    pub(crate) fn new() -> (Self, JobSignals) {
        let (stop, stop_rx) = watch::channel(false);
        let (cancel, cancel_rx) = watch::channel(false);
        let (pause, pause_rx) = watch::channel(false);
        (
            Self {
                stop,
                cancel,
                pause,
            },
            JobSignals {
                stop: stop_rx,
                cancel: cancel_rx,
                pause: pause_rx,
            },
        )
    }

    pub(crate) fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.pause.send_replace(paused);
    }
}

/// Resolve once `rx` holds `true`. Never resolves if the sender is gone.
pub(crate) async fn raised(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolve with the new value on the next change.
async fn toggled(rx: &mut watch::Receiver<bool>) -> bool {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
    *rx.borrow_and_update()
}

// =============================================================================
// Persistence pipe
// =============================================================================

/// Persistence channel and worker of one job.
pub(crate) struct PersistPipe {
    pub(crate) channel: Arc<DataChannel>,
    worker: PersistenceWorker,
    forwarder: JoinHandle<()>,
}

/// How a driven worker ended, from the job's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ending {
    /// Limit reached or worker fault.
    Finished,
    /// `stop` requested.
    Stopped,
    /// `cancel` requested.
    Cancelled,
}

/// Outcome of [`JobContext::drive_worker`].
pub(crate) struct Driven {
    pub(crate) exit: WorkerExit,
    pub(crate) ending: Ending,
}

impl Driven {
    /// Map the worker exit onto the job outcome: a fault fails the job, a
    /// cancel cancels it, anything else lets the kind build its result.
    pub(crate) fn into_result(self) -> AppResult<()> {
        if let Some(err) = self.exit.fault() {
            return Err(err.clone());
        }
        if self.ending == Ending::Cancelled {
            return Err(DaqError::Cancelled);
        }
        Ok(())
    }
}

// =============================================================================
// Context
// =============================================================================

/// Everything a running job needs.
pub(crate) struct JobContext {
    pub(crate) id: JobId,
    pub(crate) kind: MeasurementKind,
    pub(crate) shared: Arc<ControllerShared>,
    pub(crate) signals: JobSignals,
    pub(crate) live: Arc<DataChannel>,
    pub(crate) started: Instant,
    pub(crate) started_at: DateTime<Utc>,
    parameters: serde_json::Value,
    comments: String,
    status: Arc<watch::Sender<JobStatus>>,
    state: JobState,
    samples: u64,
    retries: u64,
    peak: Option<PeakInfo>,
    persist: Option<PersistReport>,
    last_percent: Option<u32>,
    progress_span: (f64, f64),
    sample_base: u64,
}

impl JobContext {
    pub(crate) fn new(
        id: JobId,
        request: &MeasurementRequest,
        shared: Arc<ControllerShared>,
        signals: JobSignals,
        status: Arc<watch::Sender<JobStatus>>,
    ) -> Self {
        let kind = request.kind();
        let settings = &shared.settings;
        let live = Arc::new(DataChannel::new(
            format!("{id}-live"),
            settings.live_capacity,
            settings.live_overflow,
        ));
        let comments = match request {
            MeasurementRequest::Background(p) => p.comments.clone(),
            MeasurementRequest::Calibration(p) => p.comments.clone(),
            MeasurementRequest::Kinetic(p) => p.comments.clone(),
            MeasurementRequest::Run(p) => p.comments.clone(),
            MeasurementRequest::View(_) => String::new(),
            MeasurementRequest::SpectralCalibration(p) => p.comments.clone(),
            MeasurementRequest::TemperatureSeries(p) => p.comments.clone(),
        };
        Self {
            id,
            kind,
            shared,
            signals,
            live,
            started: Instant::now(),
            started_at: Utc::now(),
            parameters: request.parameters(),
            comments,
            status,
            state: JobState::Created,
            samples: 0,
            retries: 0,
            peak: None,
            persist: None,
            last_percent: None,
            progress_span: (0.0, 100.0),
            sample_base: 0,
        }
    }

    /// Update the status and push it to subscribers.
    fn publish(&self, update: impl FnOnce(&mut JobStatus)) {
        self.status.send_modify(update);
        let snapshot = self.status.borrow().clone();
        self.shared.publish(&snapshot);
    }

    /// Update the status without notifying subscribers.
    fn touch(&self, update: impl FnOnce(&mut JobStatus)) {
        self.status.send_modify(update);
    }

    pub(crate) fn set_state(&mut self, next: JobState) {
        if self.state == next {
            return;
        }
        match self.state.transition(next) {
            Ok(()) => {
                debug!(job_id = %self.id, kind = %self.kind, state = %next, "Job state changed");
                self.publish(|s| s.state = next);
            }
            Err(err) => debug!(job_id = %self.id, error = %err, "Ignoring transition"),
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        *self.signals.stop.borrow()
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        *self.signals.cancel.borrow()
    }

    /// Account for one acquired sample.
    pub(crate) fn record_sample(&mut self, sample: &Sample, count: u64) {
        self.samples = count;
        if let Some((index, value)) = sample.peak() {
            self.peak = Some(PeakInfo {
                value,
                index,
                elapsed_s: sample.timestamp.saturating_duration_since(self.started).as_secs_f64(),
            });
        }
        self.touch(|s| s.samples = count);
    }

    /// Publish progress when the whole percentage changes.
    pub(crate) fn set_progress(&mut self, percent: f64) {
        let whole = percent.floor() as u32;
        if self.last_percent == Some(whole) {
            return;
        }
        self.last_percent = Some(whole);
        self.publish(|s| s.progress = Some(percent));
    }

    /// Start a new segment of a multi-worker job: worker counts add to the
    /// samples taken so far and worker progress maps onto `start..end`
    /// percent of the job.
    pub(crate) fn begin_segment(&mut self, start: f64, end: f64) {
        self.progress_span = (start, end);
        self.sample_base = self.samples;
    }

    /// Wait while the job is paused. Returns early on stop and fails with
    /// `Cancelled` on cancel.
    pub(crate) async fn wait_while_paused(&mut self) -> AppResult<()> {
        let mut pause = self.signals.pause.clone();
        let mut stop = self.signals.stop.clone();
        let mut cancel = self.signals.cancel.clone();
        loop {
            if *cancel.borrow() {
                return Err(DaqError::Cancelled);
            }
            if *stop.borrow() || !*pause.borrow_and_update() {
                return Ok(());
            }
            self.publish(|s| s.paused = true);
            tokio::select! {
                paused = toggled(&mut pause) => {
                    if !paused {
                        self.publish(|s| s.paused = false);
                    }
                }
                _ = raised(&mut stop) => {}
                _ = raised(&mut cancel) => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Start persisting this job. `devices` contribute their settings snapshot
    /// to the metadata sidecar.
    pub(crate) fn open_persistence(
        &self,
        devices: &[&Arc<InstrumentHandle>],
    ) -> AppResult<PersistPipe> {
        let factory = self.shared.sink_factory.as_ref().ok_or_else(|| {
            DaqError::PreconditionFailed("persistence requested but no sink configured".into())
        })?;
        let settings = &self.shared.settings;
        let mut metadata = JobMetadata::new(&self.id, self.kind.as_str(), self.parameters.clone());
        metadata.comments = self.comments.clone();
        for handle in devices {
            let snapshot = serde_json::json!({
                "kind": handle.kind(),
                "settings": handle.read_settings(),
            });
            metadata.instruments.insert(handle.id().to_string(), snapshot);
        }

        let channel = Arc::new(DataChannel::new(
            format!("{}-persist", self.id),
            settings.persist_capacity,
            settings.persist_overflow,
        ));
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let worker = PersistenceWorker::spawn(
            metadata,
            Arc::clone(&channel),
            factory(&self.id),
            settings.persistence.clone(),
            self.started,
            Some(fault_tx),
        );

        let status = Arc::clone(&self.status);
        let shared = Arc::clone(&self.shared);
        let forwarder = tokio::spawn(async move {
            while fault_rx.recv().await.is_some() {
                status.send_modify(|s| s.persist_faults += 1);
                let snapshot = status.borrow().clone();
                shared.publish(&snapshot);
            }
        });
        Ok(PersistPipe {
            channel,
            worker,
            forwarder,
        })
    }

    /// Drain, close and record the report of a persistence pipe.
    pub(crate) async fn finish_persistence(&mut self, pipe: Option<PersistPipe>) {
        let Some(pipe) = pipe else {
            return;
        };
        let report = pipe.worker.stop().await;
        pipe.channel.close();
        if let Err(err) = pipe.forwarder.await {
            warn!(job_id = %self.id, error = %err, "Persist fault forwarder failed");
        }
        self.persist = Some(report);
    }

    /// Live channel plus the persistence channel, if any.
    pub(crate) fn outputs(&self, pipe: Option<&PersistPipe>) -> Vec<Arc<DataChannel>> {
        let mut outputs = vec![Arc::clone(&self.live)];
        if let Some(pipe) = pipe {
            outputs.push(Arc::clone(&pipe.channel));
        }
        outputs
    }

    // -------------------------------------------------------------------------
    // Acquisition
    // -------------------------------------------------------------------------

    /// Run one acquisition worker on `handle` until it ends, following the
    /// job's pause, stop and cancel signals. Every acquired sample is passed to
    /// `on_sample`.
    pub(crate) async fn drive_worker<F>(
        &mut self,
        handle: &Arc<InstrumentHandle>,
        outputs: Vec<Arc<DataChannel>>,
        config: AcquisitionConfig,
        mut on_sample: F,
    ) -> AppResult<Driven>
    where
        F: FnMut(&SharedSample),
    {
        let limit = config.limit.clone();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut worker = AcquisitionWorker::new(format!("{}-{}", self.kind, self.id));
        worker.start(handle, outputs, config, Some(events_tx))?;

        let mut stop = self.signals.stop.clone();
        let mut cancel = self.signals.cancel.clone();
        let mut pause = self.signals.pause.clone();
        if *pause.borrow_and_update() {
            self.apply_pause(&worker, true);
        }

        let mut ending = Ending::Finished;
        let exit = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(WorkerEvent::Finished { .. }) | None => break worker.join().await,
                    Some(event) => self.handle_event(event, &limit, &mut on_sample),
                },
                _ = raised(&mut stop) => {
                    ending = Ending::Stopped;
                    break worker.stop().await;
                }
                _ = raised(&mut cancel) => {
                    ending = Ending::Cancelled;
                    break worker.stop().await;
                }
                paused = toggled(&mut pause) => self.apply_pause(&worker, paused),
            }
        };
        while let Ok(event) = events.try_recv() {
            self.handle_event(event, &limit, &mut on_sample);
        }
        self.samples = self.samples.max(self.sample_base + exit.samples);
        self.retries += exit.retries;
        if exit.fault().is_none() {
            self.set_state(JobState::Running);
        }
        Ok(Driven { exit, ending })
    }

    fn apply_pause(&self, worker: &AcquisitionWorker, paused: bool) {
        let applied = if paused { worker.pause() } else { worker.resume() };
        match applied {
            Ok(()) => {
                info!(job_id = %self.id, paused, "Job pause changed");
                self.publish(|s| s.paused = paused);
            }
            Err(err) => debug!(job_id = %self.id, error = %err, "Pause ignored"),
        }
    }

    fn handle_event<F>(&mut self, event: WorkerEvent, limit: &AcquisitionLimit, on_sample: &mut F)
    where
        F: FnMut(&SharedSample),
    {
        match event {
            WorkerEvent::Acquired { count, sample, .. } => {
                self.record_sample(&sample, self.sample_base + count);
                on_sample(&sample);
                if let Some(percent) = limit.progress(count, self.started.elapsed()) {
                    let (start, end) = self.progress_span;
                    self.set_progress(start + (end - start) * percent / 100.0);
                }
            }
            WorkerEvent::Retrying { attempt, error, .. } => {
                warn!(job_id = %self.id, attempt, error = %error, "Job retrying device fault");
                self.set_state(JobState::Retrying);
            }
            WorkerEvent::Recovered { .. } => self.set_state(JobState::Running),
            WorkerEvent::Finished { .. } => {}
        }
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    /// Move to the terminal state for `outcome`, close the live channel and
    /// publish the report.
    pub(crate) fn finish(mut self, outcome: AppResult<JobResult>) -> JobReport {
        let (state, error, result) = match outcome {
            Ok(result) => (JobState::Completed, None, Some(result)),
            Err(DaqError::Cancelled) => (JobState::Cancelled, Some(DaqError::Cancelled), None),
            Err(err) => (JobState::Failed, Some(err), None),
        };
        self.live.close();
        if !self.state.can_transition_to(state) {
            debug!(job_id = %self.id, from = %self.state, to = %state, "Forcing terminal state");
        }
        self.state = state;

        let report = JobReport {
            job_id: self.id.clone(),
            kind: self.kind,
            state: self.state,
            error: error.clone(),
            samples: self.samples,
            retries: self.retries,
            live_dropped: self.live.dropped(),
            persist: self.persist.take(),
            peak: self.peak,
            result,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        match (&report.state, &report.error) {
            (JobState::Failed, Some(err)) => warn!(
                job_id = %self.id,
                kind = %self.kind,
                error = %err,
                samples = report.samples,
                "Job failed"
            ),
            _ => info!(
                job_id = %self.id,
                kind = %self.kind,
                state = %report.state,
                samples = report.samples,
                dropped = report.dropped(),
                persist_faults = report.persist_faults(),
                "Job finished"
            ),
        }

        let terminal = report.clone();
        self.publish(move |s| {
            s.state = terminal.state;
            s.paused = false;
            s.samples = terminal.samples;
            s.error = terminal.error.clone();
            s.report = Some(terminal);
        });
        report
    }
}
