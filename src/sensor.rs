//! Current/voltage sensor stream poller
//!
//! On start the board is sent a `subscribe` command and begins streaming
//! unsolicited lines of comma-separated raw ADC counts. Each line is scaled
//! to volts against the 3.3 V reference and, when calibration coefficients
//! are installed, converted to calibrated current. The published frame
//! embeds the coefficients in effect at conversion time.
//!
//! Coefficients live in their own watch cell: the calibration engine swaps
//! the whole `Option<Calibration>` in one visible update, so the polling
//! task never observes a slope without its intercept.

use crate::config::SensorConfig;
use crate::error::{BenchError, Result};
use crate::link::InstrumentLink;
use crate::logging::StructuredLogger;
use crate::types::{
    Calibration, ChannelMap, Reading, SENSOR_ADC_FULL_SCALE, SENSOR_REFERENCE_VOLTAGE, SensorFrame,
    channel_key,
};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

/// Handle to the sensor streaming task
pub struct SensorPoller {
    /// Latest published frame
    latest: watch::Receiver<SensorFrame>,

    /// Calibration coefficients applied by the streaming task
    calibration: watch::Sender<Option<Calibration>>,

    /// Cooperative stop signal
    stop: mpsc::UnboundedSender<()>,

    /// Streaming task, taken on shutdown
    task: StdMutex<Option<JoinHandle<()>>>,

    /// Bound on waiting for the task to exit
    join_timeout: Duration,

    /// Logger
    logger: StructuredLogger,
}

impl SensorPoller {
    /// Connect to the board, subscribe to its stream and start the reader.
    ///
    /// `calibration` seeds the conversion coefficients, typically from the
    /// calibration store at startup.
    pub async fn start(config: &SensorConfig, calibration: Option<Calibration>) -> Result<Self> {
        let logger = crate::logging::get_logger("sensor");
        let mut link = InstrumentLink::connect(
            &config.ip,
            config.port,
            config.buffer_size,
            config.timeout(),
        )
        .await?;
        link.send("subscribe").await?;

        let (latest_tx, latest_rx) = watch::channel(SensorFrame::default());
        let (cal_tx, cal_rx) = watch::channel(calibration);
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let period = Duration::from_secs_f64(1.0 / config.sampling_frequency);

        let task = tokio::spawn(stream_loop(link, period, cal_rx, latest_tx, stop_rx));
        logger.info("Sensor stream started");

        Ok(Self {
            latest: latest_rx,
            calibration: cal_tx,
            stop: stop_tx,
            task: StdMutex::new(Some(task)),
            join_timeout: config.timeout(),
            logger,
        })
    }

    /// Deep copy of the latest published frame; empty before the first line.
    pub fn read(&self) -> SensorFrame {
        self.latest.borrow().clone()
    }

    /// Watch handle on the latest value, for the snapshot task
    pub fn subscribe(&self) -> watch::Receiver<SensorFrame> {
        self.latest.clone()
    }

    /// Coefficients currently applied to conversions
    pub fn calibration(&self) -> Option<Calibration> {
        *self.calibration.borrow()
    }

    /// Install new coefficients without restarting the stream. The pair
    /// becomes visible to the streaming task as a single update.
    pub fn set_calibration(&self, calibration: Calibration) {
        self.calibration.send_replace(Some(calibration));
        self.logger.info(&format!(
            "Calibration installed: k={}, m={}",
            calibration.k, calibration.m
        ));
    }

    /// Stop the stream: signal, join within the configured bound, abort as
    /// a backstop. The task unsubscribes and closes the link on exit.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(());
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut task) = task {
            if timeout(self.join_timeout, &mut task).await.is_err() {
                self.logger.warn("Stream task did not stop in time, aborting");
                task.abort();
            }
            self.logger.info("Sensor stream stopped");
        }
    }
}

async fn stream_loop(
    mut link: InstrumentLink,
    period: Duration,
    calibration: watch::Receiver<Option<Calibration>>,
    latest: watch::Sender<SensorFrame>,
    mut stop: mpsc::UnboundedReceiver<()>,
) {
    let logger = crate::logging::get_logger("sensor");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match link.read_line().await {
                    Ok(line) => match parse_sensor_line(&line) {
                        Ok(counts) => {
                            let frame = convert_counts(&counts, *calibration.borrow());
                            latest.send_replace(frame);
                        }
                        Err(e) => logger.warn(&format!("Discarding sensor line: {}", e)),
                    },
                    Err(e) => logger.warn(&format!("Sensor read failed: {}", e)),
                }
            }
            _ = stop.recv() => break,
        }
    }

    // Best-effort: the board keeps streaming until told otherwise.
    if let Err(e) = link.send("unsubscribe").await {
        logger.warn(&format!("Unsubscribe failed: {}", e));
    }
    link.close();
}

/// Parse one stream line of comma-separated raw ADC counts
pub fn parse_sensor_line(line: &str) -> Result<Vec<u32>> {
    let counts: Vec<u32> = line
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|value| {
            value
                .parse::<u32>()
                .map_err(|e| BenchError::protocol(format!("Bad ADC count {:?}: {}", value, e)))
        })
        .collect::<Result<_>>()?;

    if counts.is_empty() {
        return Err(BenchError::protocol(format!("Empty sensor line {:?}", line)));
    }
    if let Some(count) = counts.iter().find(|c| **c > SENSOR_ADC_FULL_SCALE) {
        return Err(BenchError::protocol(format!(
            "ADC count {} above full scale {}",
            count, SENSOR_ADC_FULL_SCALE
        )));
    }
    Ok(counts)
}

/// Scale raw counts to volts and apply the calibration transform when
/// coefficients are present; current stays absent otherwise.
pub fn convert_counts(counts: &[u32], calibration: Option<Calibration>) -> SensorFrame {
    let mut channels = ChannelMap::new();
    for (index, count) in counts.iter().enumerate() {
        let voltage =
            f64::from(*count) / f64::from(SENSOR_ADC_FULL_SCALE) * SENSOR_REFERENCE_VOLTAGE;
        let current = calibration.map(|cal| cal.current_from_voltage(voltage));
        channels.insert(
            channel_key(index as u8 + 1),
            Reading { voltage, current },
        );
    }
    SensorFrame {
        channels,
        calibration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sensor_line() {
        assert_eq!(parse_sensor_line("512,0").unwrap(), vec![512, 0]);
        assert_eq!(parse_sensor_line(" 1023 , 7 ").unwrap(), vec![1023, 7]);
    }

    #[test]
    fn test_parse_sensor_line_rejects_malformed() {
        assert!(parse_sensor_line("").is_err());
        assert!(parse_sensor_line("512,abc").is_err());
        assert!(parse_sensor_line("512,-3").is_err());
        assert!(parse_sensor_line("2000,0").is_err());
    }

    #[test]
    fn test_convert_counts_uncalibrated() {
        let frame = convert_counts(&[512, 0], None);
        let ch1 = &frame.channels["channel1"];
        assert!((ch1.voltage - 1.652).abs() < 1e-3);
        assert!(ch1.current.is_none());
        assert!(frame.calibration.is_none());
    }

    #[test]
    fn test_convert_counts_calibrated() {
        let cal = Calibration { k: 0.01, m: 0.2 };
        let frame = convert_counts(&[512, 0], Some(cal));
        let ch1 = &frame.channels["channel1"];
        let current = ch1.current.unwrap();
        assert!((current - 145.2).abs() < 0.1);
        assert_eq!(frame.calibration, Some(cal));

        // Channel 2 sits at 0 counts: 0 V, current = (0 - m) / k
        let ch2 = &frame.channels["channel2"];
        assert_eq!(ch2.voltage, 0.0);
        assert!((ch2.current.unwrap() + 20.0).abs() < 1e-9);
    }
}
