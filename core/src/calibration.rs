//! Two-point probe calibration
//!
//! Each probe is calibrated against a low and a high buffer. The pair of
//! (pH, mV) points defines the linear transform used for every subsequent
//! conversion; mV falls as pH rises on a healthy probe, so the slope is
//! normally negative.
//!
//! The on-disk form is a YAML map from probe id to the four point values:
//!
//! ```yaml
//! F.0.1.22_1:
//!   LowPH: 4.0
//!   LowPHmV: 171.43
//!   HighPH: 9.0
//!   HighPHmV: -114.29
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{ResultExt, SystemError, TypedError, TypedResult};
use crate::probe::ProbeId;
use crate::problem;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    #[serde(rename = "LowPH")]
    pub low_ph: f64,
    #[serde(rename = "LowPHmV")]
    pub low_mv: f64,
    #[serde(rename = "HighPH")]
    pub high_ph: f64,
    #[serde(rename = "HighPHmV")]
    pub high_mv: f64,
}

impl CalibrationEntry {
    pub fn new(low_ph: f64, low_mv: f64, high_ph: f64, high_mv: f64) -> TypedResult<Self> {
        if low_mv == high_mv {
            problem!(Config, "calibration points coincide at {low_mv} mV");
        }
        Ok(Self {
            low_ph,
            low_mv,
            high_ph,
            high_mv,
        })
    }

    /// Linear interpolation through the two calibration points.
    pub fn ph_from_mv(&self, mv: f64) -> f64 {
        let slope = (self.low_ph - self.high_ph) / (self.low_mv - self.high_mv);
        self.low_ph + (mv - self.low_mv) * slope
    }
}

/// One consistent snapshot of every probe's calibration.
///
/// Recalibration never patches a table in place; a whole new snapshot is
/// published so conversions running concurrently keep a coherent view.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct CalibrationTable(BTreeMap<ProbeId, CalibrationEntry>);

impl CalibrationTable {
    pub fn load(path: &Path) -> TypedResult<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("could not read calibration data {path:?}: {e}"))
            .typ(SystemError::Config)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let table: Self = serde_yaml::from_str(&contents).typ(SystemError::Config)?;
        for (probe, entry) in &table.0 {
            if entry.low_mv == entry.high_mv {
                problem!(Config, "calibration for {probe} has coinciding mV points");
            }
        }
        Ok(table)
    }

    /// Writes the table next to `path` and renames it into place, so a
    /// concurrent reader sees either the old or the new file, never a
    /// partial one.
    pub fn save(&self, path: &Path) -> TypedResult<()> {
        let serialized = serde_yaml::to_string(self).typ(SystemError::Config)?;
        let tmp = path.with_extension("yml.tmp");
        fs::write(&tmp, serialized)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| anyhow!("could not persist calibration data {path:?}: {e}"))
            .typ(SystemError::Config)
    }

    pub fn insert(&mut self, probe: ProbeId, entry: CalibrationEntry) {
        self.0.insert(probe, entry);
    }

    pub fn get(&self, probe: &ProbeId) -> Option<&CalibrationEntry> {
        self.0.get(probe)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Converts a raw mV reading for `probe`, failing when the probe was
    /// never calibrated.
    pub fn ph_from_mv(&self, probe: &ProbeId, mv: f64) -> TypedResult<f64> {
        match self.0.get(probe) {
            Some(entry) => Ok(entry.ph_from_mv(mv)),
            None => Err(TypedError::new(
                SystemError::Config,
                anyhow!("no calibration data recorded for probe {probe}"),
            )),
        }
    }
}
