//! Module and probe addressing
//!
//! A pH amplifier module sits on the meter bus under a dotted hex address
//! such as `F.0.1.22` and exposes four probe channels. A probe is therefore
//! named `<module>_<channel>` with the channel counted from 1, e.g.
//! `F.0.1.22_3`.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{SystemError, TypedError};

pub const CHANNELS_PER_MODULE: u8 = 4;

/// Dotted four-byte bus address of a pH amplifier module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleAddress(pub [u8; 4]);

impl ModuleAddress {
    pub fn octets(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for ModuleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a:X}.{b:X}.{c:X}.{d:X}")
    }
}

impl FromStr for ModuleAddress {
    type Err = TypedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 4];
        let mut parts = s.split('.');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| {
                TypedError::new(
                    SystemError::Config,
                    anyhow!("module address {s:?} needs four dotted parts"),
                )
            })?;
            *octet = u8::from_str_radix(part, 16).map_err(|e| {
                TypedError::new(SystemError::Config, anyhow!("bad module address {s:?}: {e}"))
            })?;
        }
        if parts.next().is_some() {
            return Err(TypedError::new(
                SystemError::Config,
                anyhow!("module address {s:?} has more than four parts"),
            ));
        }
        Ok(Self(octets))
    }
}

/// One probe channel on one module, `1..=4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProbeId {
    pub module: ModuleAddress,
    pub channel: u8,
}

impl ProbeId {
    pub fn new(module: ModuleAddress, channel: u8) -> Result<Self, TypedError> {
        if channel == 0 || channel > CHANNELS_PER_MODULE {
            return Err(TypedError::new(
                SystemError::Config,
                anyhow!("probe channel {channel} outside 1..={CHANNELS_PER_MODULE}"),
            ));
        }
        Ok(Self { module, channel })
    }

    /// Zero-based index into a module's four-channel mV block.
    pub fn channel_index(&self) -> usize {
        usize::from(self.channel) - 1
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.module, self.channel)
    }
}

impl FromStr for ProbeId {
    type Err = TypedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split on the first underscore only; the module part never contains one.
        let (module, channel) = s.split_once('_').ok_or_else(|| {
            TypedError::new(
                SystemError::Config,
                anyhow!("probe id {s:?} must look like <module>_<channel>"),
            )
        })?;
        let channel = channel.parse::<u8>().map_err(|e| {
            TypedError::new(SystemError::Config, anyhow!("bad probe channel in {s:?}: {e}"))
        })?;
        Self::new(module.parse()?, channel)
    }
}

// Probe ids key YAML calibration maps and JSON probe lists, so they cross
// serde boundaries as plain strings.
impl Serialize for ProbeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProbeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: TypedError| D::Error::custom(e.to_string()))
    }
}

impl Serialize for ModuleAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModuleAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: TypedError| D::Error::custom(e.to_string()))
    }
}
