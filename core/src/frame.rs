//! Binary framing for the pH-meter bus
//!
//! Requests address a module as `M, length, command, id0..id3, checksum,
//! CR, LF` where the checksum is the low byte of the sum over everything
//! before it. Replies echo the command and carry one 2-byte big-endian
//! two's-complement mV word per channel, scaled 0.1 mV per unit.
//!
//! The meter itself pads reply checksums unreliably (a literal `0x00` on
//! some firmware revisions), so decoding records the received checksum but
//! does not reject on mismatch; [MeterReply::checksum_ok] lets callers log
//! the discrepancy.

use anyhow::anyhow;

use crate::error::{SystemError, TypedError, TypedResult};
use crate::probe::ModuleAddress;
use crate::problem;

pub const LINE_END: [u8; 2] = [13, 10];

/// Recipient byte of every outgoing meter frame.
pub const RECIPIENT_METER: u8 = b'M';

/// Command code for "report the mV values of all four channels".
pub const CMD_READ_MV: u8 = 10;

/// Length field of an mV request: command + four id bytes + checksum.
pub const REQUEST_LENGTH: u8 = 6;

/// An mV reply carries two bytes for each of the four channels.
pub const MV_DATA_LEN: usize = 8;

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Outgoing request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterRequest {
    pub command: u8,
    pub module: ModuleAddress,
}

impl MeterRequest {
    pub fn read_mv(module: ModuleAddress) -> Self {
        Self {
            command: CMD_READ_MV,
            module,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![RECIPIENT_METER, REQUEST_LENGTH, self.command];
        frame.extend_from_slice(&self.module.octets());
        frame.push(checksum(&frame));
        frame.extend_from_slice(&LINE_END);
        frame
    }

    pub fn decode(frame: &[u8]) -> TypedResult<Self> {
        if frame.len() != 10 {
            problem!(ReadFailure, "request frame is {} bytes, expected 10", frame.len());
        }
        if frame[0] != RECIPIENT_METER || frame[1] != REQUEST_LENGTH {
            problem!(ReadFailure, "bad request header {:02X?}", &frame[..2]);
        }
        if frame[8..10] != LINE_END {
            problem!(ReadFailure, "request frame missing CRLF trailer");
        }
        if checksum(&frame[..7]) != frame[7] {
            problem!(ReadFailure, "request checksum mismatch");
        }
        Ok(Self {
            command: frame[2],
            module: ModuleAddress([frame[3], frame[4], frame[5], frame[6]]),
        })
    }
}

/// Incoming reply frame, already stripped of its CRLF trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterReply {
    pub recipient: u8,
    pub length: u8,
    pub command: u8,
    pub module_id: [u8; 4],
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl MeterReply {
    /// Number of data bytes announced by a reply's length field: the length
    /// counts command, id and checksum alongside the data.
    pub fn data_len(length: u8) -> usize {
        usize::from(length).saturating_sub(1 + 4 + 1)
    }

    pub fn checksum_ok(&self) -> bool {
        let mut sum = checksum(&[self.recipient, self.length, self.command]);
        sum = sum.wrapping_add(checksum(&self.module_id));
        sum = sum.wrapping_add(checksum(&self.data));
        sum == self.checksum
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![self.recipient, self.length, self.command];
        frame.extend_from_slice(&self.module_id);
        frame.extend_from_slice(&self.data);
        frame.push(self.checksum);
        frame.extend_from_slice(&LINE_END);
        frame
    }

    pub fn decode(frame: &[u8]) -> TypedResult<Self> {
        if frame.len() < 9 {
            problem!(ReadFailure, "reply frame is {} bytes, too short", frame.len());
        }
        let length = frame[1];
        let data_len = Self::data_len(length);
        let expected = 2 + 1 + 4 + data_len + 1 + 2;
        if frame.len() != expected {
            problem!(
                ReadFailure,
                "reply frame is {} bytes but its length field demands {expected}",
                frame.len()
            );
        }
        if frame[expected - 2..] != LINE_END {
            problem!(ReadFailure, "reply frame missing CRLF trailer");
        }
        Ok(Self {
            recipient: frame[0],
            length,
            command: frame[2],
            module_id: [frame[3], frame[4], frame[5], frame[6]],
            data: frame[7..7 + data_len].to_vec(),
            checksum: frame[7 + data_len],
        })
    }

    /// Decodes the four channel mV values of an mV reply.
    pub fn channel_mv(&self) -> TypedResult<[f64; 4]> {
        if self.data.len() != MV_DATA_LEN {
            return Err(TypedError::new(
                SystemError::ReadFailure,
                anyhow!(
                    "mV reply carries {} data bytes instead of {MV_DATA_LEN}: {:02X?}",
                    self.data.len(),
                    self.data
                ),
            ));
        }
        let mut values = [0.0; 4];
        for (channel, value) in values.iter_mut().enumerate() {
            *value = mv_from_raw(self.data[2 * channel], self.data[2 * channel + 1]);
        }
        Ok(values)
    }
}

/// Two bytes big-endian, two's complement over 16 bits, 0.1 mV per unit.
pub fn mv_from_raw(hi: u8, lo: u8) -> f64 {
    f64::from(i16::from_be_bytes([hi, lo])) / 10.0
}

/// Inverse of [mv_from_raw]; used by vessel simulations and round-trip tests.
pub fn mv_to_raw(mv: f64) -> [u8; 2] {
    ((mv * 10.0).round() as i16).to_be_bytes()
}
