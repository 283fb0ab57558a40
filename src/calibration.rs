//! Sensor self-calibration
//!
//! Sweeps the upper power supply through an arithmetic sequence of current
//! setpoints, collects paired (analyzer current, sensor voltage) samples at
//! each one, fits `voltage = k * current + m` by ordinary least squares and
//! installs the inverted map into the sensor poller.
//!
//! The run is synchronous: it completes (or fails) on the calling task and
//! expects exclusive use of the supply for its whole duration. Every wait on
//! the analyzer is bounded; a device that never settles fails the run
//! instead of hanging it. The supply is de-energized on the way out whether
//! the sweep succeeded or not.

use crate::analyzer::PowerAnalyzer;
use crate::config::{AcquisitionConfig, SweepConfig};
use crate::error::{BenchError, Result};
use crate::persistence::CalibrationStore;
use crate::sensor::SensorPoller;
use crate::supply::PowerSupply;
use crate::types::{Calibration, channel_key};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Analyzer readings at or above this current are treated as saturated
/// (supply still slewing / sensor out of valid range) and not sampled.
const SATURATION_LIMIT_A: f64 = 1000.0;

/// The sweep deliberately overshoots the nominal ceiling by this much
const SWEEP_MARGIN_A: f64 = 10.0;

/// Supply voltage while sweeping current setpoints
const STARTUP_VOLTAGE_V: f64 = 1.0;

/// Both instruments are sampled on their first channel
const REFERENCE_CHANNEL: u8 = 1;

/// Poll interval while waiting for the analyzer to settle
const SETTLE_POLL: Duration = Duration::from_millis(10);

/// Samples collected for one setpoint: (analyzer current, sensor voltage)
type SamplePairs = Vec<(f64, f64)>;

/// Result of a completed calibration run
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    /// Fitted and installed coefficients
    pub calibration: Calibration,

    /// Number of sample pairs collected, across all setpoints
    pub sample_count: usize,

    /// Audit file written for this run, if requested
    pub audit_file: Option<PathBuf>,
}

/// Run a full calibration: sweep, fit, persist, install.
///
/// On success the new coefficients are saved to `store` and installed into
/// `sensor` before returning. On failure the supply has still been
/// de-energized, and the sweep error reaches the caller.
pub async fn run_calibration(
    supply: &mut PowerSupply,
    analyzer: &PowerAnalyzer,
    sensor: &SensorPoller,
    config: &AcquisitionConfig,
    store: &CalibrationStore,
    save_audit: bool,
) -> Result<CalibrationOutcome> {
    let logger = crate::logging::get_logger("calibration");
    let sweep = &config.calibration;
    let setpoints = sweep_setpoints(sweep);
    logger.info(&format!(
        "Starting calibration sweep: {} setpoints, {} samples each",
        setpoints.len(),
        sweep.samples
    ));

    supply.set_voltage(STARTUP_VOLTAGE_V).await?;
    supply.set_current(0.0).await?;
    if !supply.is_on() {
        supply.toggle_output().await?;
    }

    let collected = collect_sweep(supply, analyzer, sensor, sweep, &setpoints).await;

    // De-energize no matter how the sweep went; its error still wins.
    let cleanup = de_energize(supply).await;
    if let Err(e) = &cleanup {
        logger.error(&format!("De-energize after sweep failed: {}", e));
    }
    let dataset = collected?;
    cleanup?;

    let pairs: SamplePairs = dataset.iter().flatten().copied().collect();
    let (k, m) = linear_fit(&pairs)?;
    let calibration = Calibration { k, m };
    logger.info(&format!(
        "Fitted calibration from {} samples: k={}, m={}",
        pairs.len(),
        k,
        m
    ));

    store.save(calibration)?;
    sensor.set_calibration(calibration);

    let audit_file = if save_audit {
        let path = write_audit_file(&config.measurement_path, &setpoints, &dataset)?;
        logger.info(&format!("Wrote audit file {}", path.display()));
        Some(path)
    } else {
        None
    };

    Ok(CalibrationOutcome {
        calibration,
        sample_count: pairs.len(),
        audit_file,
    })
}

/// Arithmetic setpoint sequence `start, start+step, ...`, running a fixed
/// margin past the nominal ceiling
pub fn sweep_setpoints(sweep: &SweepConfig) -> Vec<f64> {
    let mut setpoints = Vec::new();
    let mut current = sweep.current_start;
    while current < sweep.current_max + SWEEP_MARGIN_A {
        setpoints.push(current);
        current += sweep.current_step;
    }
    setpoints
}

async fn collect_sweep(
    supply: &mut PowerSupply,
    analyzer: &PowerAnalyzer,
    sensor: &SensorPoller,
    sweep: &SweepConfig,
    setpoints: &[f64],
) -> Result<Vec<SamplePairs>> {
    let settle_delay = Duration::from_millis(sweep.settle_delay_ms);
    let sample_delay = Duration::from_millis(sweep.sample_delay_ms);
    let settle_timeout = Duration::from_secs_f64(sweep.settle_timeout_secs);
    let channel = channel_key(REFERENCE_CHANNEL);

    let mut dataset = Vec::with_capacity(setpoints.len());
    for setpoint in setpoints {
        supply.set_current(*setpoint).await?;
        sleep(settle_delay).await;
        wait_until_settled(analyzer, &channel, settle_timeout).await?;

        let mut pairs = SamplePairs::with_capacity(sweep.samples);
        while pairs.len() < sweep.samples {
            let voltage = sensor
                .read()
                .channels
                .get(&channel)
                .map(|reading| reading.voltage)
                .ok_or_else(|| {
                    BenchError::calibration(format!("Sensor has not published {} yet", channel))
                })?;
            let current = wait_until_settled(analyzer, &channel, settle_timeout).await?;
            pairs.push((current, voltage));
            sleep(sample_delay).await;
        }
        dataset.push(pairs);
    }
    Ok(dataset)
}

/// Wait until the analyzer's reference-channel current drops below the
/// saturation limit, returning that current. Bounded: a device that never
/// settles fails the run.
async fn wait_until_settled(
    analyzer: &PowerAnalyzer,
    channel: &str,
    settle_timeout: Duration,
) -> Result<f64> {
    let deadline = Instant::now() + settle_timeout;
    loop {
        if let Some(reading) = analyzer.read().get(channel)
            && let Some(current) = reading.current
            && current < SATURATION_LIMIT_A
        {
            return Ok(current);
        }
        if Instant::now() >= deadline {
            return Err(BenchError::calibration_timeout(format!(
                "Analyzer {} current stayed at or above {} A for {:?}",
                channel, SATURATION_LIMIT_A, settle_timeout
            )));
        }
        sleep(SETTLE_POLL).await;
    }
}

async fn de_energize(supply: &mut PowerSupply) -> Result<()> {
    supply.set_voltage(0.0).await?;
    supply.set_current(0.0).await?;
    if supply.is_on() {
        supply.toggle_output().await?;
    }
    Ok(())
}

/// Ordinary least squares for `y = k * x + m`.
///
/// Rejects datasets that cannot produce a usable inverse map: fewer than two
/// pairs, currents with no spread, or a zero slope.
pub fn linear_fit(pairs: &[(f64, f64)]) -> Result<(f64, f64)> {
    if pairs.len() < 2 {
        return Err(BenchError::calibration(format!(
            "Need at least two sample pairs, got {}",
            pairs.len()
        )));
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let sxx: f64 = pairs.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let sxy: f64 = pairs
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();

    if sxx.abs() < f64::EPSILON {
        return Err(BenchError::calibration(
            "Current samples have no spread, cannot fit a slope",
        ));
    }

    let k = sxy / sxx;
    let m = mean_y - k * mean_x;
    if k.abs() < f64::EPSILON {
        return Err(BenchError::calibration(
            "Fitted slope is zero, sensor voltage does not track current",
        ));
    }
    Ok((k, m))
}

/// Write the raw per-setpoint sample pairs to a timestamped CSV for audit
fn write_audit_file(
    directory: &Path,
    setpoints: &[f64],
    dataset: &[SamplePairs],
) -> Result<PathBuf> {
    std::fs::create_dir_all(directory)?;
    let stamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
    let path = directory.join(format!("measurements_{}.csv", stamp));

    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(["setpoint_a", "analyzer_current_a", "sensor_voltage_v"])?;
    for (setpoint, pairs) in setpoints.iter().zip(dataset) {
        for (current, voltage) in pairs {
            writer.write_record(&[
                setpoint.to_string(),
                current.to_string(),
                voltage.to_string(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(path)
}
