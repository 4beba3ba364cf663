//! Measurement controller.
//!
//! Owns the stores that outlive single jobs (baselines, reference spectra, the
//! latest calibrations, the attached cryostat loop) and the table of jobs. Commands never perform device
//! I/O on the caller's task: each accepted job runs on its own supervisor task.

use super::job::{JobContext, JobControl, JobPlan};
use super::{Baseline, JobReport, JobState, JobStatus, MeasurementRequest, MeasurementSettings};
use crate::calibration::{CalibrationResult, SpectralCalibration};
use crate::core::JobId;
use crate::cryostat::CryostatControl;
use crate::data::{DataChannel, SinkFactory};
use crate::error::{AppResult, DaqError};
use crate::hardware::{DeviceRegistry, InstrumentHandle};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Capacity of the status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Callback invoked with every published status.
pub type StatusCallback = Arc<dyn Fn(&JobStatus) + Send + Sync>;

// =============================================================================
// Shared state
// =============================================================================

/// State shared between the controller and its running jobs.
pub(crate) struct ControllerShared {
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) settings: MeasurementSettings,
    pub(crate) sink_factory: Option<SinkFactory>,
    pub(crate) baselines: Mutex<HashMap<String, Arc<Baseline>>>,
    pub(crate) references: Mutex<HashMap<String, Arc<Vec<f64>>>>,
    pub(crate) calibration: Mutex<Option<Arc<CalibrationResult>>>,
    pub(crate) spectral_calibration: Mutex<Option<Arc<SpectralCalibration>>>,
    pub(crate) cryostat: Mutex<Option<CryostatControl>>,
    status_tx: broadcast::Sender<JobStatus>,
    callback: Mutex<Option<StatusCallback>>,
}

impl ControllerShared {
    /// Push a status to subscribers and the callback.
    pub(crate) fn publish(&self, status: &JobStatus) {
        // no subscribers is fine
        let _ = self.status_tx.send(status.clone());
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    /// Device named explicitly, or the one configured for `role`.
    pub(crate) fn resolve_device(
        &self,
        explicit: Option<&str>,
        role: Option<&str>,
        role_name: &str,
    ) -> AppResult<Arc<InstrumentHandle>> {
        let id = explicit.or(role).ok_or_else(|| {
            DaqError::PreconditionFailed(format!("no device given and no {role_name} role configured"))
        })?;
        self.registry.get(id)
    }

    /// Fail unless `handle` is connected and not leased.
    pub(crate) fn require_ready(handle: &InstrumentHandle, role_name: &str) -> AppResult<()> {
        if !handle.is_connected() {
            return Err(DaqError::PreconditionFailed(format!(
                "{role_name} '{}' is not connected",
                handle.id()
            )));
        }
        if let Some(holder) = handle.lease_holder() {
            return Err(DaqError::Busy {
                device: handle.id().to_string(),
                holder,
            });
        }
        Ok(())
    }

    pub(crate) fn require_sink(&self, persist: bool) -> AppResult<()> {
        if persist && self.sink_factory.is_none() {
            return Err(DaqError::PreconditionFailed(
                "persistence requested but no sink configured".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn baseline(&self, device: &str) -> Option<Arc<Baseline>> {
        self.baselines.lock().get(device).cloned()
    }

    pub(crate) fn reference(&self, device: &str) -> Option<Arc<Vec<f64>>> {
        self.references.lock().get(device).cloned()
    }
}

// =============================================================================
// Jobs table
// =============================================================================

struct JobEntry {
    control: JobControl,
    status: watch::Receiver<JobStatus>,
    report: watch::Receiver<Option<Arc<JobReport>>>,
    live: Arc<DataChannel>,
}

impl JobEntry {
    fn state(&self) -> JobState {
        self.status.borrow().state
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Accepts measurement requests and supervises the resulting jobs.
///
/// # Example
///
/// ```rust,ignore
/// let controller = MeasurementController::new(registry, MeasurementSettings::default())
///     .with_sink_factory(CsvSink::factory("data", true));
/// let background = controller.start(MeasurementRequest::Background(Default::default()))?;
/// controller.wait(&background).await?;
/// let kinetic = controller.start(MeasurementRequest::Kinetic(KineticParams::new(
///     KineticLimit::Count { samples: 100 },
/// )))?;
/// let report = controller.wait(&kinetic).await?;
/// ```
pub struct MeasurementController {
    shared: Arc<ControllerShared>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
}

impl fmt::Debug for MeasurementController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementController")
            .field("devices", &self.shared.registry.ids())
            .field("jobs", &self.jobs.lock().len())
            .finish()
    }
}

impl MeasurementController {
    /// Controller over `registry`. Without a sink factory every persisted
    /// request fails validation.
    pub fn new(registry: Arc<DeviceRegistry>, settings: MeasurementSettings) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(ControllerShared {
                registry,
                settings,
                sink_factory: None,
                baselines: Mutex::new(HashMap::new()),
                references: Mutex::new(HashMap::new()),
                calibration: Mutex::new(None),
                spectral_calibration: Mutex::new(None),
                cryostat: Mutex::new(None),
                status_tx,
                callback: Mutex::new(None),
            }),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Builder: persist through sinks created by `factory`.
    ///
    /// Must be called before any job is started.
    pub fn with_sink_factory(mut self, factory: SinkFactory) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.sink_factory = Some(factory),
            None => warn!("Sink factory ignored: controller already shared with running jobs"),
        }
        self
    }

    /// Builder: invoke `callback` with every status update.
    pub fn with_status_callback(self, callback: StatusCallback) -> Self {
        self.set_status_callback(Some(callback));
        self
    }

    /// Replace the status callback.
    pub fn set_status_callback(&self, callback: Option<StatusCallback>) {
        *self.shared.callback.lock() = callback;
    }

    /// Receive every status update from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    /// Controller settings.
    pub fn settings(&self) -> &MeasurementSettings {
        &self.shared.settings
    }

    // -------------------------------------------------------------------------
    // Stores
    // -------------------------------------------------------------------------

    /// Stored background of `device`.
    pub fn baseline(&self, device: &str) -> Option<Arc<Baseline>> {
        self.shared.baseline(device)
    }

    /// Forget the background of `device`.
    pub fn clear_baseline(&self, device: &str) -> Option<Arc<Baseline>> {
        self.shared.baselines.lock().remove(device)
    }

    /// Reference spectrum for transmission and absorbance on `device`.
    pub fn set_reference(&self, device: &str, spectrum: Vec<f64>) -> AppResult<()> {
        if spectrum.is_empty() || spectrum.iter().any(|v| !v.is_finite()) {
            return Err(DaqError::PreconditionFailed(
                "reference spectrum must be non-empty and finite".into(),
            ));
        }
        self.shared.registry.get(device)?;
        info!(device, bins = spectrum.len(), "Reference spectrum set");
        self.shared
            .references
            .lock()
            .insert(device.to_string(), Arc::new(spectrum));
        Ok(())
    }

    /// Reference spectrum of `device`.
    pub fn reference(&self, device: &str) -> Option<Arc<Vec<f64>>> {
        self.shared.reference(device)
    }

    /// Latest calibration.
    pub fn calibration(&self) -> Option<Arc<CalibrationResult>> {
        self.shared.calibration.lock().clone()
    }

    /// Latest spectral beam calibration.
    pub fn spectral_calibration(&self) -> Option<Arc<SpectralCalibration>> {
        self.shared.spectral_calibration.lock().clone()
    }

    /// Let temperature series drive this cryostat loop. Replaces any loop
    /// attached before; jobs already running keep the one they started with.
    pub fn attach_cryostat(&self, control: CryostatControl) {
        info!(device = control.device_id(), "Cryostat loop attached");
        *self.shared.cryostat.lock() = Some(control);
    }

    /// Detach the cryostat loop.
    pub fn detach_cryostat(&self) -> Option<CryostatControl> {
        self.shared.cryostat.lock().take()
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Validate `request` and start it.
    ///
    /// Validation runs on the caller's task and never touches a device. A
    /// failed validation still registers the job, publishes its `Failed`
    /// status and returns the cause.
    pub fn start(&self, request: MeasurementRequest) -> AppResult<JobId> {
        let id = JobId::new();
        let kind = request.kind();
        let (control, signals) = JobControl::new();
        let (status_tx, status_rx) = watch::channel(JobStatus::new(id.clone(), kind));
        let status_tx = Arc::new(status_tx);
        let (report_tx, report_rx) = watch::channel(None);

        let mut ctx = JobContext::new(
            id.clone(),
            &request,
            Arc::clone(&self.shared),
            signals,
            status_tx,
        );
        self.shared.publish(&status_rx.borrow().clone());
        self.jobs.lock().insert(
            id.clone(),
            JobEntry {
                control,
                status: status_rx,
                report: report_rx,
                live: Arc::clone(&ctx.live),
            },
        );

        ctx.set_state(JobState::Validating);
        let plan = match JobPlan::validate(&request, &self.shared) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(job_id = %id, %kind, error = %err, "Job rejected");
                let report = ctx.finish(Err(err.clone()));
                report_tx.send_replace(Some(Arc::new(report)));
                return Err(err);
            }
        };

        ctx.set_state(JobState::Running);
        info!(job_id = %id, %kind, "Job started");
        tokio::spawn(async move {
            let outcome = plan.run(&mut ctx).await;
            let report = ctx.finish(outcome);
            report_tx.send_replace(Some(Arc::new(report)));
        });
        Ok(id)
    }

    /// Pause acquisition of a running job.
    pub fn pause(&self, id: &JobId) -> AppResult<()> {
        self.with_active(id, "pause", |entry| entry.control.set_paused(true))
    }

    /// Resume a paused job.
    pub fn resume(&self, id: &JobId) -> AppResult<()> {
        self.with_active(id, "resume", |entry| entry.control.set_paused(false))
    }

    /// End a job gracefully. The job completes with what it acquired so far.
    ///
    /// Returns the final report; stopping a finished job just returns it.
    pub async fn stop(&self, id: &JobId) -> AppResult<JobReport> {
        {
            let jobs = self.jobs.lock();
            let entry = jobs
                .get(id)
                .ok_or_else(|| DaqError::UnknownJob(id.to_string()))?;
            entry.control.request_stop();
        }
        self.wait(id).await
    }

    /// Cancel a running job.
    ///
    /// Returns once every lease the job held has been released.
    pub async fn cancel(&self, id: &JobId) -> AppResult<JobReport> {
        self.with_active(id, "cancel", |entry| entry.control.request_cancel())?;
        self.wait(id).await
    }

    /// Wait for a job to end and return its report.
    pub async fn wait(&self, id: &JobId) -> AppResult<JobReport> {
        let mut report_rx = {
            let jobs = self.jobs.lock();
            jobs.get(id)
                .ok_or_else(|| DaqError::UnknownJob(id.to_string()))?
                .report
                .clone()
        };
        let report = report_rx
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| DaqError::InvalidState(format!("job {id} ended without a report")))?
            .clone();
        report
            .map(|r| (*r).clone())
            .ok_or_else(|| DaqError::InvalidState(format!("job {id} ended without a report")))
    }

    /// Latest status of a job.
    pub fn status(&self, id: &JobId) -> AppResult<JobStatus> {
        self.jobs
            .lock()
            .get(id)
            .map(|e| e.status.borrow().clone())
            .ok_or_else(|| DaqError::UnknownJob(id.to_string()))
    }

    /// Statuses of every known job.
    pub fn jobs(&self) -> Vec<JobStatus> {
        self.jobs
            .lock()
            .values()
            .map(|e| e.status.borrow().clone())
            .collect()
    }

    /// Ids of jobs that have not ended.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.jobs
            .lock()
            .iter()
            .filter(|(_, e)| !e.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Live channel of a job, for display consumers.
    pub fn live_channel(&self, id: &JobId) -> AppResult<Arc<DataChannel>> {
        self.jobs
            .lock()
            .get(id)
            .map(|e| Arc::clone(&e.live))
            .ok_or_else(|| DaqError::UnknownJob(id.to_string()))
    }

    /// Drop the entries of ended jobs. Returns how many were removed.
    pub fn forget_finished(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, e| e.report.borrow().is_none());
        before - jobs.len()
    }

    /// Cancel every running job and wait for all of them.
    pub async fn shutdown(&self) -> Vec<JobReport> {
        let active = self.active_jobs();
        let ended = join_all(active.iter().map(|id| async move {
            match self.cancel(id).await {
                Ok(report) => Some(report),
                // ended on its own in the meantime
                Err(DaqError::InvalidState(_)) => self.wait(id).await.ok(),
                Err(err) => {
                    warn!(job_id = %id, error = %err, "Shutdown cancel failed");
                    None
                }
            }
        }))
        .await;
        ended.into_iter().flatten().collect()
    }

    fn with_active(
        &self,
        id: &JobId,
        command: &str,
        f: impl FnOnce(&JobEntry),
    ) -> AppResult<()> {
        let jobs = self.jobs.lock();
        let entry = jobs
            .get(id)
            .ok_or_else(|| DaqError::UnknownJob(id.to_string()))?;
        let state = entry.state();
        if !state.is_active() {
            return Err(DaqError::InvalidState(format!(
                "cannot {command} job {id} in state {state}"
            )));
        }
        f(entry);
        Ok(())
    }
}
