//! Control loop task and the handle used to steer it.

use super::{CryostatLoopConfig, CryostatSetpoint, CryostatStatus, PiState};
use crate::core::Sample;
use crate::data::{DataChannel, OverflowPolicy};
use crate::error::{AppResult, DaqError};
use crate::hardware::{InstrumentHandle, InstrumentSettings, Lease};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Lease owner label of the control loop.
pub const LOOP_OWNER: &str = "cryostat-loop";

/// Self-healing temperature control loop.
///
/// Each period the loop reads the temperature, runs the PI controller against
/// the current setpoint, applies the clamped heater command and records
/// `[temperature_k, target_k, output]` on a lossy monitor channel. A device
/// fault costs one cycle and is logged; the loop itself only ends on
/// [`CryostatLoopHandle::stop`].
pub struct CryostatControlLoop;

impl CryostatControlLoop {
    /// Lease the cryostat and start controlling.
    ///
    /// Fails with `Busy` when the cryostat is leased elsewhere and with
    /// `PreconditionFailed` when the initial setpoint is outside the safe range.
    pub fn spawn(
        handle: &Arc<InstrumentHandle>,
        config: CryostatLoopConfig,
    ) -> AppResult<CryostatLoopHandle> {
        config.validate_setpoint(&config.initial_setpoint)?;
        let lease = handle.try_lease(LOOP_OWNER)?;

        let monitor = Arc::new(DataChannel::new(
            format!("{}-monitor", handle.id()),
            config.monitor_capacity,
            OverflowPolicy::DropOldest,
        ));
        let (setpoint_tx, setpoint_rx) = watch::channel(config.initial_setpoint);
        let (status_tx, status_rx) = watch::channel(CryostatStatus::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(
            device = %handle.id(),
            target_k = config.initial_setpoint.target_k,
            period_ms = config.period.as_millis() as u64,
            "Cryostat control loop started"
        );
        let task = tokio::spawn(run(
            lease,
            config.clone(),
            Arc::clone(&monitor),
            setpoint_rx,
            status_tx,
            stop_rx,
        ));

        Ok(CryostatLoopHandle {
            control: CryostatControl {
                device: handle.id().to_string(),
                config: Arc::new(config),
                setpoint_tx: Arc::new(setpoint_tx),
                status_rx,
            },
            stop_tx,
            monitor,
            task: Some(task),
        })
    }
}

/// Setpoint and status access to a running loop.
///
/// Cheap to clone; measurement jobs hold one to step the temperature without
/// owning the loop. Once the loop stops, [`wait_until_stable`] fails with
/// `InvalidState`.
///
/// [`wait_until_stable`]: CryostatControl::wait_until_stable
#[derive(Debug, Clone)]
pub struct CryostatControl {
    device: String,
    config: Arc<CryostatLoopConfig>,
    setpoint_tx: Arc<watch::Sender<CryostatSetpoint>>,
    status_rx: watch::Receiver<CryostatStatus>,
}

impl CryostatControl {
    /// Id of the controlled cryostat.
    pub fn device_id(&self) -> &str {
        &self.device
    }

    /// Loop configuration, including the safe setpoint range.
    pub fn config(&self) -> &CryostatLoopConfig {
        &self.config
    }

    /// Setpoint currently in force.
    pub fn setpoint(&self) -> CryostatSetpoint {
        *self.setpoint_tx.borrow()
    }

    /// Change the setpoint. Takes effect at the next control period.
    pub fn set_setpoint(&self, target_k: f64, tolerance_k: f64) -> AppResult<()> {
        let setpoint = CryostatSetpoint {
            target_k,
            tolerance_k,
        };
        self.config.validate_setpoint(&setpoint)?;
        self.setpoint_tx.send_replace(setpoint);
        info!(device = %self.device, target_k, tolerance_k, "Cryostat setpoint changed");
        Ok(())
    }

    /// Latest loop status.
    pub fn status(&self) -> CryostatStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch status updates, one per cycle.
    pub fn subscribe_status(&self) -> watch::Receiver<CryostatStatus> {
        self.status_rx.clone()
    }

    /// Whether the loop task still publishes status.
    pub fn is_running(&self) -> bool {
        self.status_rx.has_changed().is_ok()
    }

    /// Wait until the temperature has stayed inside the tolerance band for
    /// `hold`.
    ///
    /// Fails with `PreconditionFailed` after `timeout` and with `Cancelled` when
    /// `cancel` flips to `true`.
    pub async fn wait_until_stable(
        &self,
        hold: Duration,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> AppResult<CryostatStatus> {
        let mut status_rx = self.status_rx.clone();
        let mut cancel_live = cancel.is_some();
        let (_never_tx, never_rx) = watch::channel(false);
        let mut cancel = cancel.unwrap_or(never_rx);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut in_band_since: Option<Instant> = None;

        loop {
            let status = status_rx.borrow_and_update().clone();
            let target = self.setpoint();
            let stable_now = status.setpoint == Some(target) && status.in_band;
            if stable_now {
                let since = *in_band_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= hold {
                    debug!(temperature_k = ?status.temperature_k, "Cryostat stable");
                    return Ok(status);
                }
            } else {
                in_band_since = None;
            }

            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Err(DaqError::InvalidState("cryostat loop has stopped".into()));
                    }
                }
                _ = &mut deadline => {
                    return Err(DaqError::PreconditionFailed(format!(
                        "temperature not within {} K of {} K for {:?} after {:?}",
                        target.tolerance_k, target.target_k, hold, timeout
                    )));
                }
                cancelled = cancel.wait_for(|stop| *stop), if cancel_live => {
                    if cancelled.is_ok() {
                        return Err(DaqError::Cancelled);
                    }
                    cancel_live = false;
                }
            }
        }
    }
}

/// Control surface of a running loop.
#[derive(Debug)]
pub struct CryostatLoopHandle {
    control: CryostatControl,
    stop_tx: watch::Sender<bool>,
    monitor: Arc<DataChannel>,
    task: Option<JoinHandle<()>>,
}

impl CryostatLoopHandle {
    /// Clonable setpoint and status access for jobs.
    pub fn control(&self) -> CryostatControl {
        self.control.clone()
    }

    /// Setpoint currently in force.
    pub fn setpoint(&self) -> CryostatSetpoint {
        self.control.setpoint()
    }

    /// Change the setpoint. Takes effect at the next control period.
    pub fn set_setpoint(&self, target_k: f64, tolerance_k: f64) -> AppResult<()> {
        self.control.set_setpoint(target_k, tolerance_k)
    }

    /// Latest loop status.
    pub fn status(&self) -> CryostatStatus {
        self.control.status()
    }

    /// Watch status updates, one per cycle.
    pub fn subscribe_status(&self) -> watch::Receiver<CryostatStatus> {
        self.control.subscribe_status()
    }

    /// Monitor channel with `[temperature_k, target_k, output]` samples.
    pub fn monitor(&self) -> Arc<DataChannel> {
        Arc::clone(&self.monitor)
    }

    /// Whether the loop task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// See [`CryostatControl::wait_until_stable`].
    pub async fn wait_until_stable(
        &self,
        hold: Duration,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> AppResult<CryostatStatus> {
        self.control.wait_until_stable(hold, timeout, cancel).await
    }

    /// Stop the loop and release the cryostat lease. The heater is left at its
    /// last command.
    pub async fn stop(mut self) -> CryostatStatus {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "Cryostat loop task failed");
            }
        }
        self.monitor.close();
        self.status()
    }
}

impl Drop for CryostatLoopHandle {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

async fn run(
    lease: Lease,
    config: CryostatLoopConfig,
    monitor: Arc<DataChannel>,
    mut setpoint_rx: watch::Receiver<CryostatSetpoint>,
    status_tx: watch::Sender<CryostatStatus>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let device = lease.device_id().to_string();
    let controller = config.controller;
    let mut ticker = tokio::time::interval(config.period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pi_state = PiState::default();
    let mut last_update: Option<Instant> = None;
    let mut status = CryostatStatus::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.wait_for(|stop| *stop) => break,
        }
        let setpoint = *setpoint_rx.borrow_and_update();

        let temperature = match lease.acquire().await.and_then(|s| {
            s.value()
                .ok_or_else(|| DaqError::device_fault(device.as_str(), "empty temperature readback"))
        }) {
            Ok(t) => t,
            Err(err) => {
                record_fault(&mut status, &device, &err);
                status_tx.send_replace(status.clone());
                continue;
            }
        };

        let now = Instant::now();
        let dt = last_update.map_or(0.0, |t| now.duration_since(t).as_secs_f64());
        last_update = Some(now);
        let (next_state, output) = controller.update(&pi_state, temperature, setpoint.target_k, dt);

        if let Err(err) = lease
            .apply_settings(&InstrumentSettings::default().with_heater_output(output))
            .await
        {
            record_fault(&mut status, &device, &err);
            status_tx.send_replace(status.clone());
            continue;
        }
        pi_state = next_state;

        status.temperature_k = Some(temperature);
        status.setpoint = Some(setpoint);
        status.output = output;
        status.error_k = setpoint.target_k - temperature;
        status.in_band = setpoint.contains(temperature);
        status.cycles += 1;
        status_tx.send_replace(status.clone());

        let record = Sample::new(device.as_str(), vec![temperature, setpoint.target_k, output]);
        if monitor.push(Arc::new(record)).await.is_err() {
            debug!(device = %device, "Monitor channel closed");
        }
    }

    info!(
        device = %device,
        cycles = status.cycles,
        faults = status.faults,
        "Cryostat control loop stopped"
    );
}

fn record_fault(status: &mut CryostatStatus, device: &str, err: &DaqError) {
    status.faults += 1;
    status.last_fault = Some(err.to_string());
    warn!(device = %device, error = %err, "Cryostat cycle failed, continuing");
}
