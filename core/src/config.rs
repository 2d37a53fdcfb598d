//! Station configuration
//!
//! One `config.yml` describes the whole rig: where the recipe sheet and the
//! calibration data live, which ports the meter and the pump controller sit
//! on, and how the scheduler should behave. The device and scheduler keys
//! keep the PascalCase names the operators' existing config files use.
//!
//! ```rust
//! # use phstat_core::config::Config;
//! # let yaml = "
//! protocol_path: evening_run.csv
//! calibration_data_path: calibration_data.yml
//! phmeter:
//!   ComPort: 1
//!   ShouldPrintPhMeterMessages: false
//! pumps:
//!   ComPort: 2
//!   BaudRate: 19200
//!   Diameter: 12.45
//!   InfusionRate: 1.0
//!   ShouldPrintPumpMessages: false
//! scheduler:
//!   ShouldPrintSchedulingMessages: true
//!   ShouldRecordStepsWhileRunning: true
//!   PhCalibrationDataPath: calibration_data.yml
//!   ShouldInitiallyEnsureCorrectPHBeforeStarting: false
//!   IncreasedPumpFactorWhenPerformingInitialCorrection: 3
//!   AdaptivePumpingActivateAfterNHours: 2.0
//! networking:
//!   ShouldPrintSendRecieveMessages: false
//! # ";
//! # serde_yaml::from_str::<Config>(yaml).unwrap();
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{ResultExt, SystemError, TypedResult};

/// Main configuration of the station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Recipe sheet used when a run is started without picking another one
    pub protocol_path: PathBuf,

    /// Probe calibration store, shared with the calibration routine
    pub calibration_data_path: PathBuf,

    pub phmeter: MeterSettings,

    pub pumps: PumpSettings,

    pub scheduler: SchedulerSettings,

    /// Optional crash/finish notification settings; parsed so existing
    /// config files load, acted on by an external notifier
    #[serde(default)]
    pub email: Option<EmailSettings>,

    #[serde(default)]
    pub networking: Option<NetworkingSettings>,
}

impl Config {
    pub fn load(path: &Path) -> TypedResult<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("could not read config {path:?}: {e}"))
            .typ(SystemError::Config)?;
        serde_yaml::from_str(&contents).typ(SystemError::Config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSettings {
    #[serde(rename = "ComPort")]
    pub com_port: u32,
    #[serde(rename = "ShouldPrintPhMeterMessages")]
    pub print_messages: bool,
}

impl MeterSettings {
    pub fn port_name(&self) -> String {
        port_name(self.com_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpSettings {
    #[serde(rename = "ComPort")]
    pub com_port: u32,
    #[serde(rename = "BaudRate")]
    pub baud_rate: u32,
    /// Syringe diameter in mm, sent to every pump during configuration
    #[serde(rename = "Diameter")]
    pub diameter: f64,
    /// Infusion rate in mL/min
    #[serde(rename = "InfusionRate")]
    pub infusion_rate: f64,
    #[serde(rename = "ShouldPrintPumpMessages")]
    pub print_messages: bool,
}

impl PumpSettings {
    pub fn port_name(&self) -> String {
        port_name(self.com_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(rename = "ShouldPrintSchedulingMessages")]
    pub print_messages: bool,

    /// Persist the full results sheet after every step
    #[serde(rename = "ShouldRecordStepsWhileRunning")]
    pub record_steps: bool,

    #[serde(rename = "PhCalibrationDataPath")]
    pub calibration_data_path: PathBuf,

    /// Dose every vessel up to its phase-0 start pH before the run begins
    #[serde(rename = "ShouldInitiallyEnsureCorrectPHBeforeStarting")]
    pub precondition: bool,

    /// Extra doses per polling round while preconditioning
    #[serde(rename = "IncreasedPumpFactorWhenPerformingInitialCorrection")]
    pub precondition_pump_factor: u32,

    /// Hours after run start before the adaptive controller takes over;
    /// zero or negative activates it from the first tick
    #[serde(rename = "AdaptivePumpingActivateAfterNHours")]
    pub adaptive_after_hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(rename = "ShouldSendEmail")]
    pub enabled: bool,
    #[serde(rename = "EmailSettingsFile")]
    pub settings_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkingSettings {
    // The misspelling is load-bearing: operators' config files have it.
    #[serde(rename = "ShouldPrintSendRecieveMessages")]
    pub print_messages: bool,
}

#[cfg(windows)]
fn port_name(com_port: u32) -> String {
    format!("COM{com_port}")
}

#[cfg(not(windows))]
fn port_name(com_port: u32) -> String {
    // COMn maps to ttyS(n-1) on the Linux side of the rig.
    format!("/dev/ttyS{}", com_port.saturating_sub(1))
}
