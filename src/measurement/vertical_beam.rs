//! Vertical beam calibration.
//!
//! The job scans beam rows on the SLM and keeps the integrated intensity of
//! each spectrum as the reading, then fits position against reading. Records
//! persisted are `[position, reading]` on the positioner's channel.

use super::controller::ControllerShared;
use super::job::JobContext;
use super::scan::{check_finite, Scan, ScanDevices};
use super::{CalibrationParams, JobResult};
use crate::calibration::{CalibrationEngine, CalibrationPoint};
use crate::core::Sample;
use crate::error::{AppResult, DaqError};
use crate::hardware::InstrumentSettings;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) struct CalibrationPlan {
    devices: ScanDevices,
    positions: Vec<f64>,
    settle: Duration,
    settings: InstrumentSettings,
    persist: bool,
}

pub(crate) fn validate(
    params: &CalibrationParams,
    shared: &ControllerShared,
) -> AppResult<CalibrationPlan> {
    let devices = ScanDevices::resolve(
        params.spectrometer.as_deref(),
        params.positioner.as_deref(),
        shared,
    )?;
    let settings = &shared.settings;
    let min_points = settings.calibration_min_points.max(crate::calibration::MIN_FIT_POINTS);
    if params.positions.len() < min_points {
        return Err(DaqError::InsufficientPoints {
            got: params.positions.len(),
            needed: min_points,
        });
    }
    check_finite(&params.positions, "beam position")?;
    shared.require_sink(params.persist)?;

    Ok(CalibrationPlan {
        devices,
        positions: params.positions.clone(),
        settle: params.settle_ms.map_or(settings.settle, Duration::from_millis),
        settings: params.settings.clone(),
        persist: params.persist,
    })
}

pub(crate) async fn run(plan: CalibrationPlan, ctx: &mut JobContext) -> AppResult<JobResult> {
    let (spectrometer, positioner) = plan.devices.lease(ctx)?;
    let pipe = if plan.persist {
        Some(ctx.open_persistence(&[&plan.devices.spectrometer, &plan.devices.positioner])?)
    } else {
        None
    };

    let mut points = Vec::with_capacity(plan.positions.len());
    let channel = positioner.device_id().to_string();
    let job_id = ctx.id.clone();
    let scan = Scan {
        spectrometer: &spectrometer,
        positioner: &positioner,
        settings: &plan.settings,
        settle: plan.settle,
    };
    let scanned = scan
        .run(
            ctx,
            &plan.positions,
            pipe.as_ref(),
            |position| InstrumentSettings::default().with_beam_position(position),
            |position, spectrum| {
                let reading = spectrum.integrated();
                if !reading.is_finite() {
                    warn!(job_id = %job_id, position, "Non-finite reading, skipping point");
                    return None;
                }
                debug!(job_id = %job_id, position, reading, "Calibration point");
                points.push(CalibrationPoint { position, reading });
                Some(Sample::new(channel.as_str(), vec![position, reading]))
            },
        )
        .await;
    drop(positioner);
    drop(spectrometer);
    ctx.finish_persistence(pipe).await;

    scanned?;
    let settings = &ctx.shared.settings;
    let engine = CalibrationEngine::new(
        settings.calibration_min_points,
        settings.calibration_unit.clone(),
    );
    let result = engine.fit_points(&points)?;
    info!(
        job_id = %ctx.id,
        points = points.len(),
        slope = result.linear.slope,
        r_squared = result.linear.r_squared,
        "Calibration stored"
    );
    *ctx.shared.calibration.lock() = Some(Arc::new(result.clone()));
    Ok(JobResult::Calibration(result))
}
