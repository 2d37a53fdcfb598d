//! ASCII command codec for the syringe-pump controller
//!
//! Pumps are addressed 1..=99 on a shared RS-232 line. A command is the
//! address, a verb and an optional argument, terminated by a single carriage
//! return. The broadcast forms `*ADR` / `*ADR <n>` talk to whichever pump is
//! plugged into the programming cable and are used when assigning addresses.
//!
//! The controller's character set is Latin-1; every verb we emit is plain
//! ASCII, so encoding is a byte-for-byte copy of the rendered string.

use std::fmt;

use crate::error::TypedResult;
use crate::problem;

pub const MIN_PUMP_ADDRESS: u8 = 1;
pub const MAX_PUMP_ADDRESS: u8 = 99;

#[derive(Debug, Clone, PartialEq)]
pub enum PumpCommand {
    /// Asks the directly connected pump for its address (`*ADR`).
    QueryAddress,
    /// Assigns an address to the directly connected pump (`*ADR <n>`).
    AssignAddress(u8),
    /// Presence test (`<a> ADR`); any reply bytes mean the pump is there.
    Probe(u8),
    /// Syringe diameter in mm (`<a> DIA <mm>`).
    Diameter(u8, f64),
    /// Infusion rate in mL/min (`<a> RAT <r> MM`).
    Rate(u8, f64),
    /// Infuse direction (`<a> DIR INF`).
    DirectionInfuse(u8),
    /// Dose volumes are given in microlitres (`<a> VOL UL`).
    VolumeUnitsUl(u8),
    /// Clears the dispensed-volume counter (`<a> CLD INF`).
    ClearDispensed(u8),
    /// Target volume of one dose (`<a> VOL <uL>`).
    Volume(u8, u64),
    /// Dispenses one dose (`<a> RUN`).
    Run(u8),
}

impl fmt::Display for PumpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueryAddress => write!(f, "*ADR"),
            Self::AssignAddress(n) => write!(f, "*ADR {n}"),
            Self::Probe(a) => write!(f, "{a} ADR"),
            Self::Diameter(a, mm) => write!(f, "{a} DIA {mm:?}"),
            Self::Rate(a, rate) => write!(f, "{a} RAT {rate:?} MM"),
            Self::DirectionInfuse(a) => write!(f, "{a} DIR INF"),
            Self::VolumeUnitsUl(a) => write!(f, "{a} VOL UL"),
            Self::ClearDispensed(a) => write!(f, "{a} CLD INF"),
            Self::Volume(a, ul) => write!(f, "{a} VOL {ul}"),
            Self::Run(a) => write!(f, "{a} RUN"),
        }
    }
}

impl PumpCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.to_string().into_bytes();
        bytes.push(b'\r');
        bytes
    }

    /// Parses a rendered command back; the exercisers and tests use this to
    /// react to traffic the way the real controller would.
    pub fn decode(frame: &[u8]) -> TypedResult<Self> {
        let Some(text) = frame
            .strip_suffix(b"\r")
            .and_then(|t| std::str::from_utf8(t).ok())
        else {
            problem!(ReadFailure, "pump command {frame:02X?} is not CR-terminated ASCII");
        };
        let mut words = text.split(' ');
        let addr = words.next().unwrap_or_default();
        let verb = words.next().unwrap_or_default();
        let arg = words.next();
        let unit = words.next();

        if addr.starts_with('*') {
            // Broadcast: "*ADR" or "*ADR <n>"
            let cmd = match (addr, verb, arg) {
                ("*ADR", "", None) => Self::QueryAddress,
                ("*ADR", n, None) => match n.parse() {
                    Ok(n) => Self::AssignAddress(n),
                    Err(e) => problem!(ReadFailure, "bad broadcast address in {text:?}: {e}"),
                },
                _ => problem!(ReadFailure, "bad broadcast command {text:?}"),
            };
            return Ok(cmd);
        }

        let Ok(addr) = addr.parse::<u8>() else {
            problem!(ReadFailure, "bad pump address in {text:?}");
        };
        let parse_f64 = |s: Option<&str>| -> TypedResult<f64> {
            match s.and_then(|s| s.parse().ok()) {
                Some(v) => Ok(v),
                None => problem!(ReadFailure, "missing numeric argument in {text:?}"),
            }
        };
        let cmd = match (verb, arg, unit) {
            ("ADR", None, None) => Self::Probe(addr),
            ("DIA", arg, None) => Self::Diameter(addr, parse_f64(arg)?),
            ("RAT", arg, Some("MM")) => Self::Rate(addr, parse_f64(arg)?),
            ("DIR", Some("INF"), None) => Self::DirectionInfuse(addr),
            ("VOL", Some("UL"), None) => Self::VolumeUnitsUl(addr),
            ("CLD", Some("INF"), None) => Self::ClearDispensed(addr),
            ("VOL", Some(ul), None) => match ul.parse() {
                Ok(ul) => Self::Volume(addr, ul),
                Err(e) => problem!(ReadFailure, "bad volume in {text:?}: {e}"),
            },
            ("RUN", None, None) => Self::Run(addr),
            _ => problem!(ReadFailure, "unknown pump command {text:?}"),
        };
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::PumpCommand;

    #[test]
    fn renders_the_configuration_verbs() {
        assert_eq!(PumpCommand::Probe(1).encode(), b"1 ADR\r");
        assert_eq!(PumpCommand::Diameter(1, 12.45).encode(), b"1 DIA 12.45\r");
        assert_eq!(PumpCommand::Rate(1, 1.0).encode(), b"1 RAT 1.0 MM\r");
        assert_eq!(PumpCommand::DirectionInfuse(1).encode(), b"1 DIR INF\r");
        assert_eq!(PumpCommand::VolumeUnitsUl(1).encode(), b"1 VOL UL\r");
        assert_eq!(PumpCommand::ClearDispensed(1).encode(), b"1 CLD INF\r");
        assert_eq!(PumpCommand::Volume(1, 50).encode(), b"1 VOL 50\r");
        assert_eq!(PumpCommand::Run(1).encode(), b"1 RUN\r");
    }

    #[test]
    fn renders_the_broadcast_verbs() {
        assert_eq!(PumpCommand::QueryAddress.encode(), b"*ADR\r");
        assert_eq!(PumpCommand::AssignAddress(7).encode(), b"*ADR 7\r");
    }

    #[test]
    fn round_trips_every_verb() {
        let commands = [
            PumpCommand::QueryAddress,
            PumpCommand::AssignAddress(42),
            PumpCommand::Probe(3),
            PumpCommand::Diameter(3, 12.45),
            PumpCommand::Rate(3, 1.0),
            PumpCommand::DirectionInfuse(3),
            PumpCommand::VolumeUnitsUl(3),
            PumpCommand::ClearDispensed(3),
            PumpCommand::Volume(3, 120),
            PumpCommand::Run(3),
        ];
        for cmd in commands {
            assert_eq!(PumpCommand::decode(&cmd.encode()).unwrap(), cmd);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(PumpCommand::decode(b"1 RUN").is_err()); // no CR
        assert!(PumpCommand::decode(b"x FOO\r").is_err());
    }
}
