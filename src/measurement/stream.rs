//! Streaming jobs: kinetic, run and view.
//!
//! All three drive a single acquisition worker into the job's live channel and,
//! for persisted kinetic and run jobs, a persistence channel. Background
//! subtraction and the optional correction are applied inline by the worker
//! so both consumers see the same processed spectrum.

use super::controller::ControllerShared;
use super::correction::spectrum_transform;
use super::job::JobContext;
use super::{Correction, JobResult, KineticParams, RunParams, ViewParams};
use crate::acquisition::{AcquisitionConfig, AcquisitionLimit, SampleTransform};
use crate::core::SharedSample;
use crate::error::{AppResult, DaqError};
use crate::hardware::{InstrumentHandle, InstrumentSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub(crate) struct StreamPlan {
    handle: Arc<InstrumentHandle>,
    period: Duration,
    limit: AcquisitionLimit,
    settings: InstrumentSettings,
    transform: Option<SampleTransform>,
    persist: bool,
}

/// Device, baseline and reference checks shared by kinetic, run and
/// temperature series jobs.
pub(crate) fn resolve_spectral(
    device: Option<&str>,
    correction: Correction,
    override_background: bool,
    persist: bool,
    shared: &ControllerShared,
) -> AppResult<(Arc<InstrumentHandle>, Option<SampleTransform>)> {
    let handle = shared.resolve_device(device, shared.settings.spectrometer.as_deref(), "spectrometer")?;
    ControllerShared::require_ready(&handle, "spectrometer")?;

    let baseline = shared.baseline(handle.id());
    if baseline.is_none() && !override_background {
        return Err(DaqError::PreconditionFailed(format!(
            "no background stored for '{}'; run a background first or set override_background",
            handle.id()
        )));
    }
    let reference = shared.reference(handle.id());
    if correction.needs_reference() && reference.is_none() {
        return Err(DaqError::PreconditionFailed(format!(
            "{correction:?} correction needs a reference spectrum for '{}'",
            handle.id()
        )));
    }
    shared.require_sink(persist)?;

    let baseline = baseline.map(|b| Arc::new(b.payload.clone()));
    let transform = spectrum_transform(baseline, correction, reference);
    Ok((handle, transform))
}

pub(crate) fn period(period_ms: Option<u64>, shared: &ControllerShared) -> Duration {
    period_ms.map_or(shared.settings.default_period, Duration::from_millis)
}

pub(crate) fn validate_kinetic(
    params: &KineticParams,
    shared: &ControllerShared,
) -> AppResult<StreamPlan> {
    params.limit.validate()?;
    let (handle, transform) = resolve_spectral(
        params.device.as_deref(),
        params.correction,
        params.override_background,
        params.persist,
        shared,
    )?;
    Ok(StreamPlan {
        handle,
        period: period(params.period_ms, shared),
        limit: params.limit.to_acquisition_limit(),
        settings: params.settings.clone(),
        transform,
        persist: params.persist,
    })
}

pub(crate) fn validate_run(params: &RunParams, shared: &ControllerShared) -> AppResult<StreamPlan> {
    let (handle, transform) = resolve_spectral(
        params.device.as_deref(),
        params.correction,
        params.override_background,
        params.persist,
        shared,
    )?;
    Ok(StreamPlan {
        handle,
        period: period(params.period_ms, shared),
        limit: AcquisitionLimit::Continuous,
        settings: params.settings.clone(),
        transform,
        persist: params.persist,
    })
}

/// Views accept any device and subtract a stored background when asked to.
pub(crate) fn validate_view(params: &ViewParams, shared: &ControllerShared) -> AppResult<StreamPlan> {
    let handle = shared.resolve_device(
        params.device.as_deref(),
        shared.settings.spectrometer.as_deref(),
        "view device",
    )?;
    ControllerShared::require_ready(&handle, "view device")?;
    let baseline = if params.subtract_background {
        shared.baseline(handle.id()).map(|b| Arc::new(b.payload.clone()))
    } else {
        None
    };
    Ok(StreamPlan {
        transform: spectrum_transform(baseline, Correction::None, None),
        handle,
        period: period(params.period_ms, shared),
        limit: AcquisitionLimit::Continuous,
        settings: params.settings.clone(),
        persist: false,
    })
}

pub(crate) async fn run(plan: StreamPlan, ctx: &mut JobContext) -> AppResult<JobResult> {
    let pipe = if plan.persist {
        Some(ctx.open_persistence(&[&plan.handle])?)
    } else {
        None
    };

    let mut config = AcquisitionConfig::new(plan.period)
        .with_retry(ctx.shared.settings.retry.clone())
        .with_limit(plan.limit);
    if !plan.settings.is_empty() {
        config = config.with_settings(plan.settings);
    }
    if let Some(transform) = plan.transform {
        config = config.with_transform(transform);
    }

    let mut last: Option<SharedSample> = None;
    let outputs = ctx.outputs(pipe.as_ref());
    let driven = ctx
        .drive_worker(&plan.handle, outputs, config, |s| last = Some(Arc::clone(s)))
        .await;
    ctx.finish_persistence(pipe).await;

    let driven = driven?;
    debug!(job_id = %ctx.id, ending = ?driven.ending, samples = driven.exit.samples, "Stream ended");
    driven.into_result()?;
    Ok(JobResult::Spectrum {
        device: plan.handle.id().to_string(),
        payload: last.map(|s| s.payload.clone()).unwrap_or_default(),
    })
}
