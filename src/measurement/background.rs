//! Background capture.

use super::controller::ControllerShared;
use super::job::JobContext;
use super::{Baseline, BackgroundParams, JobResult};
use crate::acquisition::{AcquisitionConfig, AcquisitionLimit};
use crate::core::{average_payloads, SharedSample};
use crate::error::{AppResult, DaqError};
use crate::hardware::{InstrumentHandle, InstrumentSettings};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub(crate) struct BackgroundPlan {
    handle: Arc<InstrumentHandle>,
    scans: u32,
    period: Duration,
    settings: InstrumentSettings,
    persist: bool,
}

pub(crate) fn validate(
    params: &BackgroundParams,
    shared: &ControllerShared,
) -> AppResult<BackgroundPlan> {
    let handle = shared.resolve_device(
        params.device.as_deref(),
        shared.settings.spectrometer.as_deref(),
        "spectrometer",
    )?;
    if !handle.kind().is_spectral() {
        return Err(DaqError::PreconditionFailed(format!(
            "background needs a spectral device, '{}' is a {}",
            handle.id(),
            handle.kind()
        )));
    }
    ControllerShared::require_ready(&handle, "spectrometer")?;
    if params.scans == 0 {
        return Err(DaqError::PreconditionFailed("background needs at least one scan".into()));
    }
    shared.require_sink(params.persist)?;

    Ok(BackgroundPlan {
        handle,
        scans: params.scans,
        period: params
            .period_ms
            .map_or(shared.settings.default_period, Duration::from_millis),
        settings: params.settings.clone().with_shutter(false),
        persist: params.persist,
    })
}

/// Acquire `scans` dark spectra, average them and store the baseline. The
/// worker reopens the shutter under its lease whatever the outcome.
pub(crate) async fn run(plan: BackgroundPlan, ctx: &mut JobContext) -> AppResult<JobResult> {
    let pipe = if plan.persist {
        Some(ctx.open_persistence(&[&plan.handle])?)
    } else {
        None
    };
    let config = AcquisitionConfig::new(plan.period)
        .with_retry(ctx.shared.settings.retry.clone())
        .with_limit(AcquisitionLimit::Count(u64::from(plan.scans)))
        .with_settings(plan.settings)
        .with_restore(InstrumentSettings::default().with_shutter(true));

    let mut scans: Vec<SharedSample> = Vec::with_capacity(plan.scans as usize);
    let outputs = ctx.outputs(pipe.as_ref());
    let driven = ctx
        .drive_worker(&plan.handle, outputs, config, |s| scans.push(Arc::clone(s)))
        .await;
    ctx.finish_persistence(pipe).await;

    let driven = driven?;
    let shutter = driven.exit.restore_error.clone();
    driven.into_result()?;
    if let Some(err) = shutter {
        error!(job_id = %ctx.id, device = %plan.handle.id(), error = %err, "Shutter left closed");
        return Err(err);
    }

    let payload = average_payloads(scans.iter().map(|s| s.as_ref())).ok_or_else(|| {
        DaqError::InvalidState(format!(
            "background on '{}' ended with no usable scans",
            plan.handle.id()
        ))
    })?;
    let baseline = Baseline {
        device: plan.handle.id().to_string(),
        payload,
        scans: scans.len() as u32,
        created_at: Utc::now(),
    };
    info!(
        job_id = %ctx.id,
        device = %baseline.device,
        scans = baseline.scans,
        "Background stored"
    );
    ctx.shared
        .baselines
        .lock()
        .insert(baseline.device.clone(), Arc::new(baseline.clone()));
    Ok(JobResult::Baseline(baseline))
}
