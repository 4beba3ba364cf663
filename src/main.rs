//! CLI entry point for spectro-daq
//!
//! Provides command-line interface for:
//! - Running a demo measurement sequence against the simulated rig
//! - Validating a rig configuration file
//!
//! # Usage
//!
//! ```bash
//! spectro-daq demo --config config/spectro_daq.toml --samples 50 --calibrate
//! spectro-daq demo --spectral --temperatures 290,285
//! spectro-daq check-config config/spectro_daq.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spectro_daq::config::RigConfig;
use spectro_daq::cryostat::{CryostatControlLoop, CryostatLoopHandle};
use spectro_daq::hardware::DeviceRegistry;
use spectro_daq::logging;
use spectro_daq::measurement::{
    BackgroundParams, CalibrationParams, JobReport, JobResult, JobStatus, KineticLimit,
    KineticParams, MeasurementController, MeasurementRequest, SpectralCalibrationParams,
    TemperatureSeriesParams,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "spectro-daq")]
#[command(about = "Acquisition core for an optical spectroscopy rig", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run background, kinetic and optionally calibration and temperature
    /// series jobs on the mock rig
    Demo {
        /// Rig configuration file
        #[arg(long, default_value = "config/spectro_daq.toml")]
        config: PathBuf,

        /// Kinetic samples to acquire
        #[arg(long, default_value_t = 20)]
        samples: u64,

        /// Dark scans averaged into the background
        #[arg(long, default_value_t = 5)]
        scans: u32,

        /// Also run a vertical beam calibration
        #[arg(long)]
        calibrate: bool,

        /// Calibration points between row 0 and the last SLM row
        #[arg(long, default_value_t = 9)]
        steps: usize,

        /// Also run a spectral beam calibration across the SLM columns
        #[arg(long)]
        spectral: bool,

        /// Column step of the spectral calibration
        #[arg(long, default_value_t = 128.0)]
        column_step: f64,

        /// Run a temperature series at these setpoints (K), comma separated
        #[arg(long, value_delimiter = ',')]
        temperatures: Vec<f64>,

        /// Override `storage.output_dir`
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Rig configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            config,
            samples,
            scans,
            calibrate,
            steps,
            spectral,
            column_step,
            temperatures,
            output_dir,
        } => {
            let mut rig = load(&config)?;
            if let Some(dir) = output_dir {
                rig.storage.output_dir = dir;
            }
            logging::init_from_config(&rig)?;
            let plan = DemoPlan {
                samples,
                scans,
                calibration_steps: calibrate.then_some(steps),
                column_step: spectral.then_some(column_step),
                temperatures,
            };
            run_demo(rig, plan).await
        }
        Commands::CheckConfig { config } => {
            let rig = load(&config)?;
            println!(
                "{}: {} instrument(s), {} enabled, cryostat loop {}",
                config.display(),
                rig.instruments.len(),
                rig.enabled_instruments().len(),
                if rig.cryostat.enabled { "on" } else { "off" }
            );
            Ok(())
        }
    }
}

/// Jobs the demo runs after the background.
struct DemoPlan {
    samples: u64,
    scans: u32,
    calibration_steps: Option<usize>,
    column_step: Option<f64>,
    temperatures: Vec<f64>,
}

fn load(path: &Path) -> Result<RigConfig> {
    let rig = RigConfig::load_from(path)
        .with_context(|| format!("reading {}", path.display()))?;
    rig.validate()?;
    Ok(rig)
}

async fn run_demo(rig: RigConfig, plan: DemoPlan) -> Result<()> {
    info!(app = %rig.application.name, "Starting demo");
    let registry = Arc::new(DeviceRegistry::from_config(&rig.instruments)?);
    registry.connect_all().await?;

    let controller = MeasurementController::new(Arc::clone(&registry), rig.measurement_settings());
    #[cfg(feature = "storage_csv")]
    let controller = controller.with_sink_factory(spectro_daq::data::CsvSink::factory(
        rig.storage.output_dir.clone(),
        rig.storage.write_metadata,
    ));
    let persist = cfg!(feature = "storage_csv");

    let mut status_rx = controller.subscribe();
    let status_logger = tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(status) => log_status(&status),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Status logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cryostat = match rig.resolved_cryostat().filter(|_| rig.cryostat.enabled) {
        Some(id) => {
            let handle = registry.get(&id)?;
            Some(CryostatControlLoop::spawn(&handle, rig.cryostat_loop_config()?)?)
        }
        None => None,
    };

    if let Some(cryostat) = &cryostat {
        controller.attach_cryostat(cryostat.control());
    }

    let outcome = sequence(&controller, &rig, &plan, persist).await;

    if let Some(cryostat) = cryostat {
        report_cryostat(cryostat).await;
    }
    controller.shutdown().await;
    status_logger.abort();
    registry.disconnect_all().await;
    outcome
}

async fn sequence(
    controller: &MeasurementController,
    rig: &RigConfig,
    plan: &DemoPlan,
    persist: bool,
) -> Result<()> {
    let samples = plan.samples;
    let background = controller.start(MeasurementRequest::Background(BackgroundParams {
        scans: plan.scans,
        comments: "demo dark frame".into(),
        ..BackgroundParams::default()
    }))?;
    checked(controller.wait(&background).await?)?;

    let mut kinetic = KineticParams::new(KineticLimit::Count { samples });
    kinetic.persist = persist;
    kinetic.comments = format!("demo kinetic, {samples} samples");
    let kinetic = controller.start(MeasurementRequest::Kinetic(kinetic))?;
    let report = checked(controller.wait(&kinetic).await?)?;
    if let Some(peak) = &report.peak {
        info!(value = peak.value, bin = peak.index, at_s = peak.elapsed_s, "Kinetic peak");
    }

    if let Some(steps) = plan.calibration_steps {
        let rows = slm_option(rig, "rows").unwrap_or(1080);
        let mut params = CalibrationParams::linear(0.0, (rows - 1) as f64, steps);
        params.persist = persist;
        let calibration = controller.start(MeasurementRequest::Calibration(params))?;
        checked(controller.wait(&calibration).await?)?;
        if let Some(result) = controller.calibration() {
            info!(
                slope = result.linear.slope,
                intercept = result.linear.intercept,
                r_squared = result.linear.r_squared,
                "Beam calibration"
            );
        }
    }

    if let Some(step) = plan.column_step {
        let columns = slm_option(rig, "columns").unwrap_or(1920);
        let mut params =
            SpectralCalibrationParams::stepped(0.0, columns as f64, step, (500.0, 800.0));
        params.persist = persist;
        let spectral = controller.start(MeasurementRequest::SpectralCalibration(params))?;
        checked(controller.wait(&spectral).await?)?;
        if let Some(result) = controller.spectral_calibration() {
            info!(
                points = result.columns.len(),
                first_nm = result.wavelength_at(0.0),
                r_squared = result.fit.r_squared,
                "Spectral calibration"
            );
        }
    }

    if !plan.temperatures.is_empty() {
        let mut params = TemperatureSeriesParams::new(plan.temperatures.clone());
        params.persist = persist;
        params.spectra = 5;
        let series = controller.start(MeasurementRequest::TemperatureSeries(params))?;
        let report = checked(controller.wait(&series).await?)?;
        if let Some(JobResult::TemperatureSeries { points, .. }) = &report.result {
            for point in points {
                info!(
                    target_k = point.target_k,
                    temperature_k = ?point.temperature_k,
                    integrated = point.payload.iter().sum::<f64>(),
                    "Temperature point"
                );
            }
        }
    }
    Ok(())
}

fn slm_option(rig: &RigConfig, key: &str) -> Option<i64> {
    rig.resolved_beam_positioner()
        .and_then(|id| rig.instruments.iter().find(|i| i.id == id))
        .and_then(|def| def.config.get(key).and_then(|v| v.as_integer()))
}

fn checked(report: JobReport) -> Result<JobReport> {
    if report.is_success() {
        return Ok(report);
    }
    let reason = report
        .error
        .as_ref()
        .map_or_else(|| "no error recorded".to_string(), ToString::to_string);
    anyhow::bail!("{} job {} ended {}: {reason}", report.kind, report.job_id, report.state)
}

fn log_status(status: &JobStatus) {
    match &status.report {
        Some(report) => info!(
            job_id = %status.job_id,
            kind = %status.kind,
            state = %status.state,
            samples = report.samples,
            dropped = report.dropped(),
            persist_faults = report.persist_faults(),
            "Job finished"
        ),
        None => info!(
            job_id = %status.job_id,
            kind = %status.kind,
            state = %status.state,
            progress = %progress_label(status.progress),
            "Job status"
        ),
    }
}

/// Whole-percent progress, or `-` for jobs without a known end.
fn progress_label(progress: Option<f64>) -> String {
    progress.map_or_else(|| "-".to_string(), |p| format!("{p:.0}%"))
}

async fn report_cryostat(cryostat: CryostatLoopHandle) {
    let setpoint = cryostat.setpoint();
    let status = cryostat.stop().await;
    info!(
        temperature_k = ?status.temperature_k,
        output = status.output,
        cycles = status.cycles,
        faults = status.faults,
        target_k = setpoint.target_k,
        in_band = status.in_band,
        "Cryostat loop stopped"
    );
}
