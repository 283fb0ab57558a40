//! Top-level bench orchestration
//!
//! [`TestBench`] owns every instrument on the bench: the two supplies, both
//! pollers, the snapshot broadcaster and the calibration store. The web
//! layer holds it behind an `Arc` and talks to the pieces through the
//! accessors here.

use crate::analyzer::PowerAnalyzer;
use crate::calibration::{CalibrationOutcome, run_calibration};
use crate::config::Config;
use crate::error::Result;
use crate::logging::StructuredLogger;
use crate::persistence::CalibrationStore;
use crate::sensor::SensorPoller;
use crate::snapshot::SnapshotBroadcaster;
use crate::supply::PowerSupply;
use crate::types::Snapshot;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};

/// Which of the two bench supplies a request addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupplyId {
    /// The supply feeding the upper rail; also drives calibration sweeps
    Upper,
    /// The supply feeding the lower rail
    Lower,
}

/// The assembled test bench
pub struct TestBench {
    /// Configuration the bench was started with
    config: Config,

    /// Upper supply; the calibration engine holds this lock for a whole run
    upper: Mutex<PowerSupply>,

    /// Lower supply
    lower: Mutex<PowerSupply>,

    /// Power analyzer poller
    analyzer: PowerAnalyzer,

    /// Sensor stream poller
    sensor: SensorPoller,

    /// Snapshot cache and broadcast task
    snapshots: SnapshotBroadcaster,

    /// Calibration coefficient storage
    store: CalibrationStore,

    /// Logger
    logger: StructuredLogger,
}

impl TestBench {
    /// Connect every instrument and start the background tasks.
    ///
    /// The stored calibration (if any) is installed into the sensor poller
    /// before its first conversion. Expects a validated configuration.
    pub async fn start(config: Config) -> Result<Self> {
        let logger = crate::logging::get_logger("bench");

        let store = CalibrationStore::new(&config.acquisition.calibration_path);
        let calibration = store.load()?;

        let supply_cfg = &config.power_supply;
        let upper = PowerSupply::connect("upper", &supply_cfg.ip[0], supply_cfg).await?;
        let lower = PowerSupply::connect("lower", &supply_cfg.ip[1], supply_cfg).await?;

        let analyzer = PowerAnalyzer::start(&config.power_analyzer).await?;
        let sensor = SensorPoller::start(&config.sensor, calibration).await?;
        let snapshots = SnapshotBroadcaster::start(
            config.acquisition.sample_frequency,
            analyzer.subscribe(),
            sensor.subscribe(),
        );

        logger.info("Test bench started");
        Ok(Self {
            config,
            upper: Mutex::new(upper),
            lower: Mutex::new(lower),
            analyzer,
            sensor,
            snapshots,
            store,
            logger,
        })
    }

    /// Configuration reference
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The requested supply, behind its lock
    pub fn supply(&self, id: SupplyId) -> &Mutex<PowerSupply> {
        match id {
            SupplyId::Upper => &self.upper,
            SupplyId::Lower => &self.lower,
        }
    }

    /// Last assembled snapshot (pull interface)
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.read()
    }

    /// Register a live snapshot subscriber (push interface)
    pub fn subscribe(&self) -> mpsc::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// Number of currently registered live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.snapshots.subscriber_count()
    }

    /// Run a calibration sweep on the upper supply.
    ///
    /// Holding the supply lock across the whole run keeps control-plane
    /// callers out until the sweep has finished and the supply is
    /// de-energized.
    pub async fn calibrate(&self, save_audit: bool) -> Result<CalibrationOutcome> {
        let mut supply = self.upper.lock().await;
        run_calibration(
            &mut supply,
            &self.analyzer,
            &self.sensor,
            &self.config.acquisition,
            &self.store,
            save_audit,
        )
        .await
    }

    /// Stop background tasks and release every instrument, in order:
    /// broadcaster first, then the pollers, then the supplies.
    pub async fn shutdown(&self) {
        self.logger.info("Shutting down test bench");
        self.snapshots.shutdown().await;
        self.analyzer.shutdown().await;
        self.sensor.shutdown().await;

        for supply in [&self.upper, &self.lower] {
            let mut supply = supply.lock().await;
            if let Err(e) = supply.shutdown().await {
                self.logger
                    .warn(&format!("Supply {} shutdown failed: {}", supply.name(), e));
            }
        }
        self.logger.info("Test bench shutdown complete");
    }
}
