//! Configuration management for Wattbench
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files.

use crate::error::{BenchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Snapshot/broadcast and calibration sweep configuration
    pub acquisition: AcquisitionConfig,

    /// Power supply connection and safety limits
    pub power_supply: SupplyConfig,

    /// Power analyzer connection and polling configuration
    pub power_analyzer: AnalyzerConfig,

    /// Sensor board connection and stream configuration
    pub sensor: SensorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Web server binding configuration
    pub web: WebConfig,
}

/// Snapshot cadence, storage paths and calibration sweep parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Snapshot assembly/broadcast frequency in Hz
    pub sample_frequency: f64,

    /// Directory for calibration audit files
    pub measurement_path: PathBuf,

    /// Calibration coefficient file
    pub calibration_path: PathBuf,

    /// Calibration sweep parameters
    pub calibration: SweepConfig,
}

/// Calibration sweep parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// First setpoint current in amperes
    pub current_start: f64,

    /// Setpoint increment in amperes
    pub current_step: f64,

    /// Nominal sweep ceiling in amperes (the sweep runs a fixed margin past it)
    pub current_max: f64,

    /// Paired samples collected per setpoint
    pub samples: usize,

    /// Delay after commanding a setpoint before sampling, in milliseconds
    pub settle_delay_ms: u64,

    /// Delay between successive sample pairs, in milliseconds
    pub sample_delay_ms: u64,

    /// Upper bound on each wait for the analyzer to settle, in seconds
    pub settle_timeout_secs: f64,
}

/// Power supply connection parameters and safety limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyConfig {
    /// Addresses of the upper and lower supply, in that order
    pub ip: Vec<String>,

    /// TCP port shared by both supplies
    pub port: u16,

    /// Socket read buffer size in bytes
    pub buffer_size: usize,

    /// I/O timeout in seconds
    pub timeout_secs: f64,

    /// Safety maxima
    pub limits: SupplyLimits,
}

/// Safety maxima for supply setpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyLimits {
    /// Maximum commanded voltage in volts
    pub max_voltage: f64,

    /// Maximum commanded current in amperes
    pub max_current: f64,

    /// Power ceiling programmed at initialization, in watts
    pub max_power: f64,
}

/// Power analyzer connection and polling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Instrument address
    pub ip: String,

    /// TCP port
    pub port: u16,

    /// Socket read buffer size in bytes
    pub buffer_size: usize,

    /// I/O timeout in seconds
    pub timeout_secs: f64,

    /// Polling frequency in Hz
    pub sampling_frequency: f64,

    /// Channel numbers tracked in each combined query
    pub channels: Vec<u8>,
}

/// Sensor board connection and stream parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Board address
    pub ip: String,

    /// TCP port
    pub port: u16,

    /// Socket read buffer size in bytes
    pub buffer_size: usize,

    /// I/O timeout in seconds
    pub timeout_secs: f64,

    /// Rate at which the board streams lines once subscribed, in Hz
    pub sampling_frequency: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Path to log file
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_frequency: 5.0,
            measurement_path: PathBuf::from("measurements"),
            calibration_path: PathBuf::from("calibration.yaml"),
            calibration: SweepConfig::default(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            current_start: 0.0,
            current_step: 10.0,
            current_max: 100.0,
            samples: 10,
            settle_delay_ms: 500,
            sample_delay_ms: 10,
            settle_timeout_secs: 30.0,
        }
    }
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            ip: vec!["192.168.1.10".to_string(), "192.168.1.11".to_string()],
            port: 5025,
            buffer_size: 1024,
            timeout_secs: 2.0,
            limits: SupplyLimits::default(),
        }
    }
}

impl Default for SupplyLimits {
    fn default() -> Self {
        Self {
            max_voltage: 60.0,
            max_current: 120.0,
            max_power: 1500.0,
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.1.20".to_string(),
            port: 5025,
            buffer_size: 1024,
            timeout_secs: 2.0,
            sampling_frequency: 10.0,
            channels: vec![1, 2, 3, 4],
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.1.30".to_string(),
            port: 8888,
            buffer_size: 1024,
            timeout_secs: 2.0,
            sampling_frequency: 10.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/tmp/wattbench.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionConfig::default(),
            power_supply: SupplyConfig::default(),
            power_analyzer: AnalyzerConfig::default(),
            sensor: SensorConfig::default(),
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl SupplyConfig {
    /// I/O timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

impl AnalyzerConfig {
    /// I/O timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

impl SensorConfig {
    /// I/O timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let default_paths = [
            "wattbench_config.yaml",
            "/data/wattbench_config.yaml",
            "/etc/wattbench/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.power_supply.ip.len() != 2 {
            return Err(BenchError::config(
                "power_supply.ip must list exactly two addresses (upper, lower)",
            ));
        }
        if self.power_supply.ip.iter().any(|ip| ip.is_empty()) {
            return Err(BenchError::config(
                "power_supply.ip entries cannot be empty",
            ));
        }
        if self.power_supply.port == 0 {
            return Err(BenchError::config("power_supply.port must be greater than 0"));
        }
        if self.power_supply.limits.max_voltage <= 0.0
            || self.power_supply.limits.max_current <= 0.0
            || self.power_supply.limits.max_power <= 0.0
        {
            return Err(BenchError::config(
                "power_supply.limits must all be positive",
            ));
        }

        if self.power_analyzer.ip.is_empty() {
            return Err(BenchError::config("power_analyzer.ip cannot be empty"));
        }
        if self.power_analyzer.sampling_frequency <= 0.0 {
            return Err(BenchError::config(
                "power_analyzer.sampling_frequency must be positive",
            ));
        }
        if self.power_analyzer.channels.is_empty() {
            return Err(BenchError::config(
                "power_analyzer.channels cannot be empty",
            ));
        }

        if self.sensor.ip.is_empty() {
            return Err(BenchError::config("sensor.ip cannot be empty"));
        }
        if self.sensor.sampling_frequency <= 0.0 {
            return Err(BenchError::config(
                "sensor.sampling_frequency must be positive",
            ));
        }

        if self.acquisition.sample_frequency <= 0.0 {
            return Err(BenchError::config(
                "acquisition.sample_frequency must be positive",
            ));
        }
        let sweep = &self.acquisition.calibration;
        if sweep.current_step <= 0.0 {
            return Err(BenchError::config(
                "acquisition.calibration.current_step must be positive",
            ));
        }
        if sweep.current_max < sweep.current_start {
            return Err(BenchError::config(
                "acquisition.calibration.current_max must not be below current_start",
            ));
        }
        if sweep.samples == 0 {
            return Err(BenchError::config(
                "acquisition.calibration.samples must be greater than 0",
            ));
        }
        if sweep.settle_timeout_secs <= 0.0 {
            return Err(BenchError::config(
                "acquisition.calibration.settle_timeout_secs must be positive",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.power_supply.ip.len(), 2);
        assert_eq!(config.power_analyzer.channels, vec![1, 2, 3, 4]);
        assert_eq!(config.acquisition.sample_frequency, 5.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.power_supply.ip = vec!["192.168.1.10".to_string()];
        assert!(config.validate().is_err());

        config = Config::default();
        config.acquisition.calibration.current_step = 0.0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.sensor.sampling_frequency = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.power_supply.port, deserialized.power_supply.port);
        assert_eq!(
            config.acquisition.calibration.samples,
            deserialized.acquisition.calibration.samples
        );
    }

    #[test]
    fn test_timeout_conversion() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(2));
    }
}
