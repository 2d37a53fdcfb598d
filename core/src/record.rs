//! Step records and run persistence
//!
//! Every scheduler tick appends one record. The in-memory run is
//! append-only; when live recording is on, the whole sheet is rewritten
//! after each step so a crash loses at most the current tick. A restart
//! later reconstructs the task queue from this sheet.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{ResultExt, SystemError, TypedResult};

/// One row of the results sheet.
///
/// `actual_ph` is NaN when the probe read failed on that tick; the step is
/// still recorded so the gap shows up in the data. On disk the failed read
/// is an empty `ActualPH` cell, which is what the plotting tooling expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(rename = "PumpTask")]
    pub pump_id: u8,
    #[serde(rename = "TimePoint", with = "rfc3339")]
    pub timestamp: SystemTime,
    #[serde(rename = "ExpectedPH")]
    pub expected_ph: f64,
    #[serde(rename = "ActualPH", with = "nan_cell")]
    pub actual_ph: f64,
    #[serde(rename = "DidPump")]
    pub did_pump: bool,
    #[serde(rename = "PumpMultiplier")]
    pub pump_multiplier: u32,
}

mod rfc3339 {
    use std::time::SystemTime;

    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_rfc3339_millis(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_rfc3339(&s).map_err(D::Error::custom)
    }
}

/// A failed read travels as NaN in memory but as an empty cell on disk.
mod nan_cell {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(f64::NAN);
        }
        raw.parse().map_err(D::Error::custom)
    }
}

/// The records of one run, in append order.
#[derive(Debug, Clone, Default)]
pub struct RunRecords {
    records: Vec<StepRecord>,
}

impl RunRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first(&self) -> Option<&StepRecord> {
        self.records.first()
    }

    pub fn for_pump(&self, pump_id: u8) -> impl Iterator<Item = &StepRecord> {
        self.records.iter().filter(move |r| r.pump_id == pump_id)
    }

    pub fn last_for(&self, pump_id: u8) -> Option<&StepRecord> {
        self.for_pump(pump_id).last()
    }

    /// Rewrites the whole sheet; a temp-file-and-rename keeps the previous
    /// version readable until the new one is complete.
    pub fn save(&self, path: &Path) -> TypedResult<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in &self.records {
            writer.serialize(record).typ(SystemError::Config)?;
        }
        let bytes = writer.into_inner().map_err(|e| anyhow!("{e}")).typ(SystemError::Config)?;
        let tmp = path.with_extension("csv.tmp");
        fs::write(&tmp, bytes)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| anyhow!("could not persist results sheet {path:?}: {e}"))
            .typ(SystemError::Config)
    }

    pub fn load(path: &Path) -> TypedResult<Self> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| anyhow!("could not open results sheet {path:?}: {e}"))
            .typ(SystemError::Config)?;
        let mut records = Vec::new();
        for record in reader.deserialize() {
            records.push(record.typ(SystemError::Config)?);
        }
        Ok(Self { records })
    }
}

/// Results sheet path for a run of `protocol_path` started at `now`.
/// Colons are not allowed in Windows file names, so the timestamp swaps
/// them for underscores.
pub fn results_path_for(protocol_path: &Path, now: SystemTime) -> PathBuf {
    let stem = protocol_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".into());
    let timestamp = humantime::format_rfc3339_seconds(now)
        .to_string()
        .replace(':', "_");
    protocol_path.with_file_name(format!("{stem}_results_{timestamp}.csv"))
}
