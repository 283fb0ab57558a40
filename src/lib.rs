//! # Wattbench - Lab Power Bench Acquisition & Calibration
//!
//! Drives a small laboratory test bench (two programmable power supplies,
//! a multi-channel power analyzer and a microcontroller current/voltage
//! sensor) over line-oriented SCPI-like TCP, keeps per-instrument telemetry
//! fresh with background pollers, and runs a self-calibration sweep that
//! derives a linear mapping from raw sensor voltage to calibrated current.
//!
//! ## Architecture
//!
//! The crate follows a modular architecture with clear separation of concerns:
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `link`: Line-oriented TCP client for instrument communication
//! - `supply`: Power supply driver (setpoints, output toggle, safety limits)
//! - `analyzer`: Power analyzer polling loop (multi-channel RMS telemetry)
//! - `sensor`: Sensor stream poller with live calibration transform
//! - `snapshot`: Latest-value snapshot cache and live-subscriber broadcast
//! - `calibration`: Calibration sweep, linear fit and audit output
//! - `persistence`: Calibration coefficient storage
//! - `bench`: Top-level orchestration of all instruments
//! - `web`: HTTP server and REST/SSE API

pub mod analyzer;
pub mod bench;
pub mod calibration;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod persistence;
pub mod sensor;
pub mod snapshot;
pub mod supply;
pub mod types;
pub mod web;

// Re-export commonly used types
pub use bench::TestBench;
pub use config::Config;
pub use error::{BenchError, Result};
pub use types::{Calibration, ChannelMap, Reading, SensorFrame, Snapshot};
