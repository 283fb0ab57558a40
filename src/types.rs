//! Shared telemetry value types
//!
//! Everything here is an immutable value: pollers publish by replacing a
//! whole `ChannelMap` or `SensorFrame`, and the snapshot task replaces a
//! whole `Snapshot`. Readers never observe partial updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ADC full-scale reference voltage of the sensor board
pub const SENSOR_REFERENCE_VOLTAGE: f64 = 3.3;

/// ADC full-scale count of the sensor board (10-bit converter)
pub const SENSOR_ADC_FULL_SCALE: u32 = 1023;

/// One instrument channel: measured voltage, and current when it is known.
///
/// Current is `None` on the sensor side until calibration coefficients have
/// been installed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Measured voltage in volts
    pub voltage: f64,

    /// Measured or derived current in amperes; absent while uncalibrated
    pub current: Option<f64>,
}

/// Ordered channel identifier -> reading map (`channel1`, `channel2`, ...)
pub type ChannelMap = BTreeMap<String, Reading>;

/// Build the canonical key for a channel number
pub fn channel_key(channel: u8) -> String {
    format!("channel{}", channel)
}

/// Linear calibration coefficients mapping current to sensor voltage:
/// `voltage = k * current + m`, so `current = (voltage - m) / k` at read time.
///
/// Both fields exist together or not at all; an uncalibrated sensor carries
/// `Option::<Calibration>::None`, never a half-written pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Slope of the voltage/current relationship
    pub k: f64,

    /// Voltage intercept at zero current
    pub m: f64,
}

impl Calibration {
    /// Invert the linear map: derive current from a raw sensor voltage
    pub fn current_from_voltage(&self, voltage: f64) -> f64 {
        (voltage - self.m) / self.k
    }
}

/// One published sensor observation: converted channel readings plus the
/// calibration in effect when they were converted, so a consumer can tell
/// whether a given reading was calibrated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    /// Converted per-channel readings
    pub channels: ChannelMap,

    /// Coefficients applied to this frame, if any
    pub calibration: Option<Calibration>,
}

/// One timestamped bundle of the most recent readings from all instruments.
///
/// Fields are each "most recent" per instrument; they are not jointly atomic
/// across instruments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Assembly time of this snapshot
    pub time: DateTime<Utc>,

    /// Latest power analyzer channel readings
    pub analyzer: ChannelMap,

    /// Latest sensor frame
    pub sensor: SensorFrame,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            time: DateTime::UNIX_EPOCH,
            analyzer: ChannelMap::new(),
            sensor: SensorFrame::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_key() {
        assert_eq!(channel_key(1), "channel1");
        assert_eq!(channel_key(4), "channel4");
    }

    #[test]
    fn test_calibration_inversion() {
        let cal = Calibration { k: 0.01, m: 0.2 };
        let current = cal.current_from_voltage(1.652);
        assert!((current - 145.2).abs() < 0.01);
    }

    #[test]
    fn test_default_snapshot_is_empty_at_epoch() {
        let snapshot = Snapshot::default();
        assert_eq!(snapshot.time, DateTime::UNIX_EPOCH);
        assert!(snapshot.analyzer.is_empty());
        assert!(snapshot.sensor.channels.is_empty());
        assert!(snapshot.sensor.calibration.is_none());
    }

    #[test]
    fn test_uncalibrated_current_serializes_as_null() {
        let reading = Reading {
            voltage: 1.65,
            current: None,
        };
        let json = serde_json::to_value(reading).unwrap();
        assert!(json["current"].is_null());
    }
}
