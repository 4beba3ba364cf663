//! Acquisition worker.
//!
//! An [`AcquisitionWorker`] is a tokio task that repeatedly pulls a sample from
//! one leased [`InstrumentHandle`] and pushes it into every bound
//! [`DataChannel`]. State machine:
//!
//! ```text
//! Idle ──start──▶ Running ◀──resume── Paused
//!                   │  └────pause────▶  │
//!                   ▼                   ▼
//!                 Stopped ◀─────────────┘
//! ```
//!
//! - The device lease is taken in `start` and held for the worker's lifetime;
//!   it is released before the worker reports `Stopped`.
//! - Cadence uses `tokio::time::interval` with [`MissedTickBehavior::Delay`]:
//!   an acquisition that overruns the period is followed immediately by the
//!   next one, and missed ticks are never queued.
//! - A transient [`DaqError::DeviceFault`] is retried with the configured
//!   [`RetryPolicy`] backoff. Exhausting the bound stops the worker with
//!   [`ExitReason::Faulted`], which the owning measurement job escalates.

use crate::core::{Sample, SharedSample};
use crate::data::DataChannel;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{cancellable_sleep, retry_transient, RetryPolicy};
use crate::hardware::{InstrumentHandle, InstrumentSettings, Lease};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Lifecycle of an acquisition worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    /// Created, not started.
    Idle,
    /// Acquiring at its cadence.
    Running,
    /// Started but not acquiring.
    Paused,
    /// Finished. The device lease has been released.
    Stopped,
}

/// When a worker stops on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum AcquisitionLimit {
    /// Until `stop()`.
    #[default]
    Continuous,
    /// After this many samples.
    Count(u64),
    /// After this much time since start.
    Duration(Duration),
    /// One acquisition at each offset from start. Offsets already in the past
    /// are acquired immediately.
    Schedule(Vec<Duration>),
}

impl AcquisitionLimit {
    /// Fraction of the limit reached, in percent. `None` for continuous runs.
    pub fn progress(&self, samples: u64, elapsed: Duration) -> Option<f64> {
        let pct = match self {
            AcquisitionLimit::Continuous => return None,
            AcquisitionLimit::Count(n) if *n > 0 => samples as f64 / *n as f64,
            AcquisitionLimit::Duration(d) if !d.is_zero() => elapsed.as_secs_f64() / d.as_secs_f64(),
            AcquisitionLimit::Schedule(offsets) if !offsets.is_empty() => {
                samples as f64 / offsets.len() as f64
            }
            _ => 1.0,
        };
        Some((pct * 100.0).clamp(0.0, 100.0))
    }
}

/// Per-sample transformation applied before fan-out (background subtraction,
/// transmission or absorbance).
pub type SampleTransform = Arc<dyn Fn(&Sample) -> Sample + Send + Sync>;

/// How a worker acquires.
#[derive(Clone)]
pub struct AcquisitionConfig {
    /// Target period between acquisitions.
    pub period: Duration,
    /// Retry bound and backoff for transient device faults.
    pub retry: RetryPolicy,
    /// When to stop on its own.
    pub limit: AcquisitionLimit,
    /// Settings applied under the lease before the first acquisition.
    pub settings: Option<InstrumentSettings>,
    /// Settings applied under the lease after the last acquisition, whatever
    /// the exit reason. Not interrupted by `stop()`.
    pub restore: Option<InstrumentSettings>,
    /// Optional inline transformation.
    pub transform: Option<SampleTransform>,
}

impl fmt::Debug for AcquisitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionConfig")
            .field("period", &self.period)
            .field("retry", &self.retry)
            .field("limit", &self.limit)
            .field("settings", &self.settings)
            .field("restore", &self.restore)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl AcquisitionConfig {
    /// Continuous acquisition at `period` with the default retry policy.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            retry: RetryPolicy::default(),
            limit: AcquisitionLimit::Continuous,
            settings: None,
            restore: None,
            transform: None,
        }
    }

    /// Builder: set the stop condition.
    pub fn with_limit(mut self, limit: AcquisitionLimit) -> Self {
        self.limit = limit;
        self
    }

    /// Builder: set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder: apply settings before the first acquisition.
    pub fn with_settings(mut self, settings: InstrumentSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Builder: apply settings once acquisition is over, before the lease is
    /// released.
    pub fn with_restore(mut self, settings: InstrumentSettings) -> Self {
        self.restore = Some(settings);
        self
    }

    /// Builder: transform each sample before fan-out.
    pub fn with_transform(mut self, transform: SampleTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// The configured limit was reached.
    Completed,
    /// `stop()` was requested.
    Stopped,
    /// A device error that could not be retried away.
    Faulted(DaqError),
}

/// Final tally of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerExit {
    /// Why it stopped.
    pub reason: ExitReason,
    /// Samples fanned out.
    pub samples: u64,
    /// Retries performed over the whole run.
    pub retries: u64,
    /// Failure to apply the restore settings, if any.
    pub restore_error: Option<DaqError>,
}

impl WorkerExit {
    fn stopped_idle() -> Self {
        Self {
            reason: ExitReason::Stopped,
            samples: 0,
            retries: 0,
            restore_error: None,
        }
    }

    /// The escalated fault, if any.
    pub fn fault(&self) -> Option<&DaqError> {
        match &self.reason {
            ExitReason::Faulted(err) => Some(err),
            _ => None,
        }
    }
}

/// Notifications from a running worker to its owner.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A sample was fanned out.
    Acquired {
        /// Worker name.
        worker: String,
        /// Samples so far, including this one.
        count: u64,
        /// The (transformed) sample.
        sample: SharedSample,
    },
    /// A transient fault is being retried.
    Retrying {
        /// Worker name.
        worker: String,
        /// Consecutive failure count.
        attempt: u32,
        /// The fault.
        error: DaqError,
    },
    /// An acquisition succeeded after one or more retries.
    Recovered {
        /// Worker name.
        worker: String,
    },
    /// The worker task ended.
    Finished {
        /// Worker name.
        worker: String,
        /// Final tally.
        exit: WorkerExit,
    },
}

/// Handle to one acquisition task.
pub struct AcquisitionWorker {
    name: String,
    state: Arc<watch::Sender<WorkerState>>,
    stop_tx: Option<watch::Sender<bool>>,
    pause_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<WorkerExit>>,
    exit: Option<WorkerExit>,
}

impl fmt::Debug for AcquisitionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionWorker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl AcquisitionWorker {
    /// Idle worker labelled `name`. The label is also the lease owner.
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            name: name.into(),
            state: Arc::new(state),
            stop_tx: None,
            pause_tx: None,
            task: None,
            exit: None,
        }
    }

    /// Worker label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Lease `handle` and start acquiring into `outputs`.
    ///
    /// Fails with `AlreadyRunning` unless the worker is `Idle` (the state is
    /// left untouched) and with `Busy` when another worker holds the lease.
    pub fn start(
        &mut self,
        handle: &Arc<InstrumentHandle>,
        outputs: Vec<Arc<DataChannel>>,
        config: AcquisitionConfig,
        events: Option<mpsc::UnboundedSender<WorkerEvent>>,
    ) -> AppResult<()> {
        if self.state() != WorkerState::Idle {
            return Err(DaqError::AlreadyRunning(self.name.clone()));
        }
        let lease = handle.try_lease(self.name.as_str())?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        self.state.send_replace(WorkerState::Running);
        info!(
            worker = %self.name,
            device = %handle.id(),
            period_ms = config.period.as_millis() as u64,
            outputs = outputs.len(),
            "Acquisition worker started"
        );

        let run = WorkerLoop {
            name: self.name.clone(),
            lease,
            outputs,
            config,
            events,
            state: Arc::clone(&self.state),
            stop_rx,
            pause_rx,
            samples: 0,
            retries: 0,
        };
        self.task = Some(tokio::spawn(run.run()));
        self.stop_tx = Some(stop_tx);
        self.pause_tx = Some(pause_tx);
        Ok(())
    }

    /// Suspend acquisition. The lease stays held.
    pub fn pause(&self) -> AppResult<()> {
        match (self.state(), &self.pause_tx) {
            (WorkerState::Running | WorkerState::Paused, Some(tx)) => {
                tx.send_replace(true);
                Ok(())
            }
            (state, _) => Err(DaqError::InvalidState(format!(
                "cannot pause worker '{}' in state {state:?}",
                self.name
            ))),
        }
    }

    /// Resume after [`pause`](Self::pause).
    pub fn resume(&self) -> AppResult<()> {
        match (self.state(), &self.pause_tx) {
            (WorkerState::Running | WorkerState::Paused, Some(tx)) => {
                tx.send_replace(false);
                Ok(())
            }
            (state, _) => Err(DaqError::InvalidState(format!(
                "cannot resume worker '{}' in state {state:?}",
                self.name
            ))),
        }
    }

    /// Request cessation and wait until the worker is `Stopped`.
    ///
    /// When this returns the device lease is free.
    pub async fn stop(&mut self) -> WorkerExit {
        if let Some(tx) = &self.stop_tx {
            tx.send_replace(true);
        }
        self.join().await
    }

    /// Wait for the worker to stop on its own (limit reached or fault).
    pub async fn join(&mut self) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match self.task.take() {
            Some(task) => match task.await {
                Ok(exit) => exit,
                Err(err) => {
                    error!(worker = %self.name, error = %err, "Acquisition task panicked");
                    WorkerExit {
                        reason: ExitReason::Faulted(DaqError::InvalidState(format!(
                            "worker task failed: {err}"
                        ))),
                        samples: 0,
                        retries: 0,
                        restore_error: None,
                    }
                }
            },
            None => WorkerExit::stopped_idle(),
        };
        self.state.send_replace(WorkerState::Stopped);
        self.exit = Some(exit.clone());
        exit
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        if let Some(tx) = &self.stop_tx {
            tx.send_replace(true);
        }
    }
}

enum Step {
    Continue,
    Exit(ExitReason),
}

struct WorkerLoop {
    name: String,
    lease: Lease,
    outputs: Vec<Arc<DataChannel>>,
    config: AcquisitionConfig,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
    state: Arc<watch::Sender<WorkerState>>,
    stop_rx: watch::Receiver<bool>,
    pause_rx: watch::Receiver<bool>,
    samples: u64,
    retries: u64,
}

impl WorkerLoop {
    async fn run(mut self) -> WorkerExit {
        let reason = self.acquire_loop().await;
        let restore_error = match self.config.restore.clone() {
            Some(settings) => self.restore_settings(&settings).await.err(),
            None => None,
        };
        let exit = WorkerExit {
            reason,
            samples: self.samples,
            retries: self.retries,
            restore_error,
        };
        match &exit.reason {
            ExitReason::Faulted(err) => error!(
                worker = %self.name,
                device = %self.lease.device_id(),
                error = %err,
                samples = exit.samples,
                "Acquisition worker faulted"
            ),
            reason => info!(
                worker = %self.name,
                device = %self.lease.device_id(),
                ?reason,
                samples = exit.samples,
                "Acquisition worker stopped"
            ),
        }

        let WorkerLoop {
            name, lease, state, events, ..
        } = self;
        drop(lease);
        state.send_replace(WorkerState::Stopped);
        if let Some(tx) = events {
            let _ = tx.send(WorkerEvent::Finished {
                worker: name,
                exit: exit.clone(),
            });
        }
        exit
    }

    async fn acquire_loop(&mut self) -> ExitReason {
        let started = Instant::now();

        if let Some(settings) = self.config.settings.clone() {
            if let Err(err) = self.apply_settings(&settings).await {
                return match err {
                    DaqError::Cancelled => ExitReason::Stopped,
                    err => ExitReason::Faulted(err),
                };
            }
        }

        let mut ticker = tokio::time::interval(self.config.period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;
        let mut retry_now = false;

        loop {
            if *self.stop_rx.borrow() {
                return ExitReason::Stopped;
            }
            if *self.pause_rx.borrow() {
                if let Step::Exit(reason) = self.wait_while_paused().await {
                    return reason;
                }
                ticker.reset_immediately();
                continue;
            }

            if !retry_now {
                let scheduled = match &self.config.limit {
                    AcquisitionLimit::Schedule(offsets) => {
                        Some(offsets.get(self.samples as usize).copied())
                    }
                    _ => None,
                };
                let wait = match scheduled {
                    Some(Some(offset)) => self.wait_for_offset(started, offset).await,
                    Some(None) => return ExitReason::Completed,
                    None => {
                        tokio::select! {
                            _ = ticker.tick() => Step::Continue,
                            _ = self.stop_rx.wait_for(|stop| *stop) => Step::Exit(ExitReason::Stopped),
                            _ = self.pause_rx.changed() => continue,
                        }
                    }
                };
                if let Step::Exit(reason) = wait {
                    return reason;
                }
            }
            retry_now = false;

            match self.lease.acquire().await {
                Ok(raw) => {
                    if failures > 0 {
                        info!(worker = %self.name, after = failures, "Acquisition recovered");
                        self.emit(WorkerEvent::Recovered {
                            worker: self.name.clone(),
                        });
                        failures = 0;
                    }
                    let sample = match &self.config.transform {
                        Some(transform) => Arc::new(transform(&raw)),
                        None => raw,
                    };
                    if let Step::Exit(reason) = self.fan_out(&sample).await {
                        return reason;
                    }
                    self.samples += 1;
                    self.emit(WorkerEvent::Acquired {
                        worker: self.name.clone(),
                        count: self.samples,
                        sample,
                    });

                    let done = match &self.config.limit {
                        AcquisitionLimit::Count(n) => self.samples >= *n,
                        AcquisitionLimit::Duration(d) => started.elapsed() >= *d,
                        AcquisitionLimit::Schedule(offsets) => self.samples as usize >= offsets.len(),
                        AcquisitionLimit::Continuous => false,
                    };
                    if done {
                        return ExitReason::Completed;
                    }
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    if !self.config.retry.allows_retry(failures) {
                        return ExitReason::Faulted(err);
                    }
                    self.retries += 1;
                    let delay = self.config.retry.delay_for(failures);
                    warn!(
                        worker = %self.name,
                        attempt = failures,
                        ?delay,
                        error = %err,
                        "Device fault, retrying"
                    );
                    self.emit(WorkerEvent::Retrying {
                        worker: self.name.clone(),
                        attempt: failures,
                        error: err,
                    });
                    if cancellable_sleep(delay, &mut self.stop_rx).await.is_err() {
                        return ExitReason::Stopped;
                    }
                    retry_now = true;
                }
                Err(err) => return ExitReason::Faulted(err),
            }
        }
    }

    async fn apply_settings(&mut self, settings: &InstrumentSettings) -> AppResult<()> {
        let mut failures = 0;
        loop {
            match self.lease.apply_settings(settings).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    failures += 1;
                    if !self.config.retry.allows_retry(failures) {
                        return Err(err);
                    }
                    self.retries += 1;
                    let delay = self.config.retry.delay_for(failures);
                    warn!(worker = %self.name, attempt = failures, error = %err, "Settings fault, retrying");
                    cancellable_sleep(delay, &mut self.stop_rx).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn restore_settings(&self, settings: &InstrumentSettings) -> AppResult<()> {
        let (_keep, mut never) = watch::channel(false);
        let lease = &self.lease;
        retry_transient(&self.config.retry, &mut never, "restore settings", move || {
            lease.apply_settings(settings)
        })
        .await
        .inspect_err(|err| {
            error!(
                worker = %self.name,
                device = %self.lease.device_id(),
                error = %err,
                "Restore settings failed"
            );
        })
    }

    async fn wait_while_paused(&mut self) -> Step {
        self.state.send_replace(WorkerState::Paused);
        debug!(worker = %self.name, "Acquisition paused");
        let step = tokio::select! {
            _ = self.pause_rx.wait_for(|paused| !*paused) => Step::Continue,
            _ = self.stop_rx.wait_for(|stop| *stop) => Step::Exit(ExitReason::Stopped),
        };
        if matches!(step, Step::Continue) {
            self.state.send_replace(WorkerState::Running);
            debug!(worker = %self.name, "Acquisition resumed");
        }
        step
    }

    async fn wait_for_offset(&mut self, started: Instant, offset: Duration) -> Step {
        let Some(target) = started.checked_add(offset) else {
            // beyond any representable instant: only stop ends the wait
            let _ = self.stop_rx.wait_for(|stop| *stop).await;
            return Step::Exit(ExitReason::Stopped);
        };
        let now = Instant::now();
        if now > target {
            let late = now - target;
            if late > self.config.period {
                warn!(
                    worker = %self.name,
                    offset_ms = offset.as_millis() as u64,
                    late_ms = late.as_millis() as u64,
                    "Scheduled acquisition is late, acquiring now"
                );
            }
            return Step::Continue;
        }
        match cancellable_sleep(target - now, &mut self.stop_rx).await {
            Ok(()) => Step::Continue,
            Err(_) => Step::Exit(ExitReason::Stopped),
        }
    }

    async fn fan_out(&mut self, sample: &SharedSample) -> Step {
        let mut closed = Vec::new();
        for (i, channel) in self.outputs.iter().enumerate() {
            let pushed = tokio::select! {
                pushed = channel.push(Arc::clone(sample)) => pushed,
                _ = self.stop_rx.wait_for(|stop| *stop) => return Step::Exit(ExitReason::Stopped),
            };
            if let Err(err) = pushed {
                warn!(worker = %self.name, channel = %channel.name(), error = %err, "Output channel closed, detaching");
                closed.push(i);
            }
        }
        for i in closed.into_iter().rev() {
            self.outputs.remove(i);
        }
        Step::Continue
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
