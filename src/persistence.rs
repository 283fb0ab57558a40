//! Calibration coefficient storage
//!
//! A small YAML record of the two fitted coefficients, read once at startup
//! and overwritten after each successful calibration run. Null fields (or a
//! missing file) mean the bench is uncalibrated.

use crate::error::Result;
use crate::logging::StructuredLogger;
use crate::types::Calibration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk calibration record; both fields null while uncalibrated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CalibrationRecord {
    k: Option<f64>,
    m: Option<f64>,
}

/// Manages the calibration coefficient file
pub struct CalibrationStore {
    path: PathBuf,
    logger: StructuredLogger,
}

impl CalibrationStore {
    /// Create a store around the given file path
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            logger: crate::logging::get_logger("persistence"),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load stored coefficients.
    ///
    /// A missing file or a record with null fields yields `Ok(None)`; only a
    /// complete pair counts as calibrated.
    pub fn load(&self) -> Result<Option<Calibration>> {
        if !self.path.exists() {
            self.logger
                .info("No calibration file found, starting uncalibrated");
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let record: CalibrationRecord = serde_yaml::from_str(&contents)?;
        match (record.k, record.m) {
            (Some(k), Some(m)) => {
                self.logger
                    .info(&format!("Loaded calibration: k={}, m={}", k, m));
                Ok(Some(Calibration { k, m }))
            }
            _ => {
                self.logger
                    .info("Calibration file holds no complete pair, starting uncalibrated");
                Ok(None)
            }
        }
    }

    /// Overwrite the record with a new coefficient pair
    pub fn save(&self, calibration: Calibration) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let record = CalibrationRecord {
            k: Some(calibration.k),
            m: Some(calibration.m),
        };
        std::fs::write(&self.path, serde_yaml::to_string(&record)?)?;
        self.logger.debug("Saved calibration to disk");
        Ok(())
    }
}
