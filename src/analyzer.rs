//! Power analyzer polling loop
//!
//! A background task queries RMS voltage and current for all tracked
//! channels in one combined round trip per tick and publishes the parsed
//! result by wholesale replacement of a watch cell. A bad cycle (I/O or
//! parse failure) is logged and skipped; the loop only stops on shutdown.

use crate::config::AnalyzerConfig;
use crate::error::{BenchError, Result};
use crate::link::InstrumentLink;
use crate::logging::StructuredLogger;
use crate::types::{ChannelMap, Reading, channel_key};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

/// Handle to the analyzer polling task
pub struct PowerAnalyzer {
    /// Latest published channel map
    latest: watch::Receiver<ChannelMap>,

    /// Cooperative stop signal
    stop: mpsc::UnboundedSender<()>,

    /// Polling task, taken on shutdown
    task: StdMutex<Option<JoinHandle<()>>>,

    /// Bound on waiting for the task to exit
    join_timeout: Duration,

    /// Logger
    logger: StructuredLogger,
}

impl PowerAnalyzer {
    /// Connect to the analyzer and start its polling loop
    pub async fn start(config: &AnalyzerConfig) -> Result<Self> {
        let logger = crate::logging::get_logger("analyzer");
        let link = InstrumentLink::connect(
            &config.ip,
            config.port,
            config.buffer_size,
            config.timeout(),
        )
        .await?;

        let (latest_tx, latest_rx) = watch::channel(ChannelMap::new());
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let period = Duration::from_secs_f64(1.0 / config.sampling_frequency);
        let channels = config.channels.clone();

        let task = tokio::spawn(poll_loop(link, channels, period, latest_tx, stop_rx));
        logger.info("Analyzer polling started");

        Ok(Self {
            latest: latest_rx,
            stop: stop_tx,
            task: StdMutex::new(Some(task)),
            join_timeout: config.timeout(),
            logger,
        })
    }

    /// Deep copy of the latest published channel map; empty before the
    /// first successful cycle.
    pub fn read(&self) -> ChannelMap {
        self.latest.borrow().clone()
    }

    /// Watch handle on the latest value, for the snapshot task
    pub fn subscribe(&self) -> watch::Receiver<ChannelMap> {
        self.latest.clone()
    }

    /// Stop the polling loop: signal, join within the configured bound,
    /// abort as a backstop. The task closes the link on exit. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(());
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut task) = task {
            if timeout(self.join_timeout, &mut task).await.is_err() {
                self.logger.warn("Polling task did not stop in time, aborting");
                task.abort();
            }
            self.logger.info("Analyzer polling stopped");
        }
    }
}

async fn poll_loop(
    mut link: InstrumentLink,
    channels: Vec<u8>,
    period: Duration,
    latest: watch::Sender<ChannelMap>,
    mut stop: mpsc::UnboundedReceiver<()>,
) {
    let logger = crate::logging::get_logger("analyzer");
    let command = measurement_query(&channels);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match link.send_and_receive(&command).await {
                    Ok(reply) => match parse_measurement_reply(&reply, &channels) {
                        Ok(map) => {
                            latest.send_replace(map);
                        }
                        Err(e) => logger.warn(&format!("Discarding analyzer reply: {}", e)),
                    },
                    Err(e) => logger.warn(&format!("Analyzer poll failed: {}", e)),
                }
            }
            _ = stop.recv() => break,
        }
    }

    link.close();
}

/// Build the combined multi-channel RMS query, one round trip for all
/// tracked channels: `:MEAS? Urms1,...,UrmsN;:MEAS? Irms1,...,IrmsN`
pub fn measurement_query(channels: &[u8]) -> String {
    let urms: Vec<String> = channels.iter().map(|ch| format!("Urms{}", ch)).collect();
    let irms: Vec<String> = channels.iter().map(|ch| format!("Irms{}", ch)).collect();
    format!(":MEAS? {};:MEAS? {}", urms.join(","), irms.join(","))
}

/// Parse the analyzer reply: `;` separates the per-query groups, `,` the
/// per-channel values within a group.
pub fn parse_measurement_reply(reply: &str, channels: &[u8]) -> Result<ChannelMap> {
    let groups: Vec<&str> = reply
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if groups.len() != 2 {
        return Err(BenchError::protocol(format!(
            "Expected 2 value groups, got {} in {:?}",
            groups.len(),
            reply
        )));
    }

    let voltages = parse_group(groups[0])?;
    let currents = parse_group(groups[1])?;
    if voltages.len() != channels.len() || currents.len() != channels.len() {
        return Err(BenchError::protocol(format!(
            "Expected {} values per group, got {}/{} in {:?}",
            channels.len(),
            voltages.len(),
            currents.len(),
            reply
        )));
    }

    let mut map = ChannelMap::new();
    for ((ch, voltage), current) in channels.iter().zip(voltages).zip(currents) {
        map.insert(
            channel_key(*ch),
            Reading {
                voltage,
                current: Some(current),
            },
        );
    }
    Ok(map)
}

fn parse_group(group: &str) -> Result<Vec<f64>> {
    group
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|value| {
            value
                .parse::<f64>()
                .map_err(|e| BenchError::protocol(format!("Bad measurement value {:?}: {}", value, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_query() {
        assert_eq!(
            measurement_query(&[1, 2]),
            ":MEAS? Urms1,Urms2;:MEAS? Irms1,Irms2"
        );
        assert_eq!(measurement_query(&[3]), ":MEAS? Urms3;:MEAS? Irms3");
    }

    #[test]
    fn test_parse_measurement_reply() {
        let map = parse_measurement_reply("230.1,231.4;2.50,2.61", &[1, 2]).unwrap();
        assert_eq!(map["channel1"].voltage, 230.1);
        assert_eq!(map["channel1"].current, Some(2.50));
        assert_eq!(map["channel2"].voltage, 231.4);
        assert_eq!(map["channel2"].current, Some(2.61));
    }

    #[test]
    fn test_parse_measurement_reply_tolerates_whitespace() {
        let map = parse_measurement_reply(" 230.1 , 231.4 ; 2.5 , 2.6 \r", &[1, 2]).unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_parse_measurement_reply_rejects_malformed() {
        assert!(parse_measurement_reply("230.1,231.4", &[1, 2]).is_err());
        assert!(parse_measurement_reply("230.1;2.5,2.6", &[1, 2]).is_err());
        assert!(parse_measurement_reply("a,b;c,d", &[1, 2]).is_err());
        assert!(parse_measurement_reply("", &[1]).is_err());
    }
}
