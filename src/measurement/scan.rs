//! Step-and-measure loop shared by the beam calibration jobs.
//!
//! Both jobs lease a spectrometer and the SLM for the whole scan and, per
//! position, move the SLM, wait for it to settle and acquire one spectrum.
//! A position whose move or acquisition still fails after the retry policy is
//! skipped; the fit downstream decides whether enough points remain.

use super::controller::ControllerShared;
use super::job::{JobContext, PersistPipe};
use crate::core::{Sample, SharedSample};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{cancellable_sleep, retry_transient};
use crate::hardware::{InstrumentHandle, InstrumentKind, InstrumentSettings, Lease};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolved spectrometer and beam positioner of a scan.
pub(crate) struct ScanDevices {
    pub(crate) spectrometer: Arc<InstrumentHandle>,
    pub(crate) positioner: Arc<InstrumentHandle>,
}

impl ScanDevices {
    /// Resolve both roles and check they are connected devices of the right
    /// kind. No device I/O.
    pub(crate) fn resolve(
        spectrometer: Option<&str>,
        positioner: Option<&str>,
        shared: &ControllerShared,
    ) -> AppResult<Self> {
        let settings = &shared.settings;
        let positioner = shared.resolve_device(
            positioner,
            settings.beam_positioner.as_deref(),
            "beam positioner",
        )?;
        if positioner.kind() != InstrumentKind::Slm {
            return Err(DaqError::PreconditionFailed(format!(
                "'{}' is a {}, not a beam positioner",
                positioner.id(),
                positioner.kind()
            )));
        }
        ControllerShared::require_ready(&positioner, "beam positioner")?;

        let spectrometer = shared.resolve_device(
            spectrometer,
            settings.spectrometer.as_deref(),
            "spectrometer",
        )?;
        if !spectrometer.kind().is_spectral() {
            return Err(DaqError::PreconditionFailed(format!(
                "'{}' is a {}, not a spectral device",
                spectrometer.id(),
                spectrometer.kind()
            )));
        }
        ControllerShared::require_ready(&spectrometer, "spectrometer")?;
        Ok(Self {
            spectrometer,
            positioner,
        })
    }

    /// Lease both devices for `ctx`'s job.
    pub(crate) fn lease(&self, ctx: &JobContext) -> AppResult<(Lease, Lease)> {
        let owner = format!("{}-{}", ctx.kind, ctx.id);
        let spectrometer = self.spectrometer.try_lease(owner.as_str())?;
        let positioner = self.positioner.try_lease(owner.as_str())?;
        Ok((spectrometer, positioner))
    }
}

/// Positions must be finite to be written to the SLM.
pub(crate) fn check_finite(positions: &[f64], what: &str) -> AppResult<()> {
    match positions.iter().position(|p| !p.is_finite()) {
        Some(index) => Err(DaqError::PreconditionFailed(format!(
            "{what} {index} is not finite"
        ))),
        None => Ok(()),
    }
}

/// One scan over leased devices.
pub(crate) struct Scan<'a> {
    pub(crate) spectrometer: &'a Lease,
    pub(crate) positioner: &'a Lease,
    pub(crate) settings: &'a InstrumentSettings,
    pub(crate) settle: Duration,
}

impl Scan<'_> {
    /// Visit `positions` in order.
    ///
    /// `move_to` builds the SLM overlay for a position. `measure` sees every
    /// acquired spectrum and returns the record to persist when the point is
    /// kept, or `None` to discard it. A stop ends the scan early with what was
    /// kept so far.
    pub(crate) async fn run<M, R>(
        &self,
        ctx: &mut JobContext,
        positions: &[f64],
        pipe: Option<&PersistPipe>,
        move_to: M,
        mut measure: R,
    ) -> AppResult<usize>
    where
        M: Fn(f64) -> InstrumentSettings,
        R: FnMut(f64, &SharedSample) -> Option<Sample>,
    {
        let retry = ctx.shared.settings.retry.clone();
        let mut cancel = ctx.signals.cancel.clone();
        let (spectrometer, positioner) = (self.spectrometer, self.positioner);

        if !self.settings.is_empty() {
            let settings = self.settings;
            retry_transient(&retry, &mut cancel, "spectrometer settings", move || {
                spectrometer.apply_settings(settings)
            })
            .await?;
        }

        let total = positions.len();
        let mut kept = 0usize;
        for (i, &position) in positions.iter().enumerate() {
            ctx.wait_while_paused().await?;
            if ctx.cancel_requested() {
                return Err(DaqError::Cancelled);
            }
            if ctx.stop_requested() {
                info!(job_id = %ctx.id, done = i, total, "Scan stopped early");
                break;
            }

            let target = &move_to(position);
            match retry_transient(&retry, &mut cancel, "beam move", move || {
                positioner.apply_settings(target)
            })
            .await
            {
                Ok(()) => {}
                Err(DaqError::Cancelled) => return Err(DaqError::Cancelled),
                Err(err) => {
                    warn!(job_id = %ctx.id, position, error = %err, "Beam move failed, skipping point");
                    ctx.set_progress(progress(i + 1, total));
                    continue;
                }
            }
            cancellable_sleep(self.settle, &mut cancel).await?;

            let spectrum = match retry_transient(&retry, &mut cancel, "scan acquire", move || {
                spectrometer.acquire()
            })
            .await
            {
                Ok(sample) => sample,
                Err(DaqError::Cancelled) => return Err(DaqError::Cancelled),
                Err(err) => {
                    warn!(job_id = %ctx.id, position, error = %err, "Acquisition failed, skipping point");
                    ctx.set_progress(progress(i + 1, total));
                    continue;
                }
            };

            if let Some(record) = measure(position, &spectrum) {
                kept += 1;
                ctx.record_sample(&spectrum, kept as u64);
                // lossy unless configured otherwise
                if let Err(err) = ctx.live.push(Arc::clone(&spectrum)).await {
                    debug!(job_id = %ctx.id, error = %err, "Live channel closed");
                }
                if let Some(pipe) = pipe {
                    pipe.channel.push(Arc::new(record)).await?;
                }
            }
            ctx.set_progress(progress(i + 1, total));
        }
        Ok(kept)
    }
}

fn progress(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}
