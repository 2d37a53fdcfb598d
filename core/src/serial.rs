//! Serial session layer shared by the meter and pump drivers
//!
//! Both buses are half-duplex RS-232 controlled by DTR: the driver raises
//! DTR while transmitting and drops it to listen. The drivers only talk to
//! the [SerialLink] trait so that tests can replace the physical port with a
//! scripted one.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::{ResultExt, SystemError, TypedResult};

/// Per-read timeout; a byte that does not arrive within this window is a
/// read failure.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Minimum quiet period after every write before the device is ready again.
pub const POST_WRITE_SETTLE: Duration = Duration::from_millis(500);

pub trait SerialLink: Send {
    fn write_all(&mut self, bytes: &[u8]) -> TypedResult<()>;

    /// Reads exactly `buf.len()` bytes or fails with
    /// [SystemError::ReadFailure].
    fn read_exact(&mut self, buf: &mut [u8]) -> TypedResult<()>;

    /// Reads and returns whatever is currently pending on the line.
    fn drain(&mut self) -> TypedResult<Vec<u8>>;

    fn set_dtr(&mut self, level: bool) -> TypedResult<()>;
}

/// Opens a bus port with the rig's fixed line settings: 8-N-1, no flow
/// control, [READ_TIMEOUT] per read.
pub fn open(port_name: &str, baud_rate: u32) -> TypedResult<Box<dyn SerialLink>> {
    let port = serialport::new(port_name, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()
        .typ(SystemError::Bus)?;
    debug!("opened serial port {port_name} at {baud_rate} baud");
    Ok(Box::new(PortLink(port)))
}

struct PortLink(Box<dyn SerialPort>);

impl SerialLink for PortLink {
    fn write_all(&mut self, bytes: &[u8]) -> TypedResult<()> {
        Write::write_all(&mut self.0, bytes).typ(SystemError::Bus)?;
        self.0.flush().typ(SystemError::Bus)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> TypedResult<()> {
        Read::read_exact(&mut self.0, buf).typ(SystemError::ReadFailure)
    }

    fn drain(&mut self) -> TypedResult<Vec<u8>> {
        let pending = self.0.bytes_to_read().typ(SystemError::ReadFailure)?;
        let mut bytes = vec![0u8; pending as usize];
        if pending > 0 {
            Read::read_exact(&mut self.0, &mut bytes).typ(SystemError::ReadFailure)?;
        }
        Ok(bytes)
    }

    fn set_dtr(&mut self, level: bool) -> TypedResult<()> {
        self.0
            .write_data_terminal_ready(level)
            .typ(SystemError::Bus)
    }
}
