//! pH-meter driver
//!
//! One RS-232 bus carries every amplifier module; the driver serialises all
//! traffic and groups reads by module, since one module reply already
//! carries all four channels.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::calibration::CalibrationTable;
use crate::clock::Clock;
use crate::config::MeterSettings;
use crate::error::{SystemError, TypedResult};
use crate::frame::{MeterReply, MeterRequest, LINE_END};
use crate::probe::{ModuleAddress, ProbeId};
use crate::serial::{self, SerialLink, POST_WRITE_SETTLE};

pub const METER_BAUD_RATE: u32 = 19200;

pub struct Meter {
    link: Box<dyn SerialLink>,
    clock: Arc<dyn Clock>,
    calibration: Arc<CalibrationTable>,
    print_messages: bool,
}

impl Meter {
    pub fn open(
        settings: &MeterSettings,
        calibration: CalibrationTable,
        clock: Arc<dyn Clock>,
    ) -> TypedResult<Self> {
        let mut link = serial::open(&settings.port_name(), METER_BAUD_RATE)?;
        // The meter keeps chattering after power-up; start from a clean line.
        link.drain()?;
        Ok(Self::from_link(
            link,
            calibration,
            clock,
            settings.print_messages,
        ))
    }

    pub fn from_link(
        link: Box<dyn SerialLink>,
        calibration: CalibrationTable,
        clock: Arc<dyn Clock>,
        print_messages: bool,
    ) -> Self {
        Self {
            link,
            clock,
            calibration: Arc::new(calibration),
            print_messages,
        }
    }

    /// Publishes a new calibration snapshot; conversions already holding the
    /// previous snapshot finish consistently on it.
    pub fn update_calibration(&mut self, table: CalibrationTable) {
        self.calibration = Arc::new(table);
    }

    pub fn calibration(&self) -> Arc<CalibrationTable> {
        self.calibration.clone()
    }

    /// Reads the four channel mV values of one module, retrying once on a
    /// read failure before surfacing the error.
    pub fn read_module_mv(&mut self, module: ModuleAddress) -> TypedResult<[f64; 4]> {
        match self.request_module_mv(module) {
            Err(e) if e.err() == SystemError::ReadFailure => {
                warn!("retrying mV read of module {module}: {e}");
                self.request_module_mv(module)
            }
            other => other,
        }
    }

    fn request_module_mv(&mut self, module: ModuleAddress) -> TypedResult<[f64; 4]> {
        self.send(&MeterRequest::read_mv(module))?;
        let reply = self.read_reply()?;
        if self.print_messages {
            info!("module {module} replied {:02X?}", reply.data);
        }
        reply.channel_mv()
    }

    fn send(&mut self, request: &MeterRequest) -> TypedResult<()> {
        let frame = request.encode();
        self.link.set_dtr(true)?;
        self.link.write_all(&frame)?;
        if self.print_messages {
            info!("sent meter command {frame:02X?}");
        }
        // Half-duplex: give the module time to turn the line around.
        self.clock.sleep(POST_WRITE_SETTLE);
        Ok(())
    }

    fn read_reply(&mut self) -> TypedResult<MeterReply> {
        self.link.set_dtr(false)?;
        let mut header = [0u8; 3];
        self.link.read_exact(&mut header)?;
        let [recipient, length, command] = header;
        let mut module_id = [0u8; 4];
        self.link.read_exact(&mut module_id)?;
        let mut data = vec![0u8; MeterReply::data_len(length)];
        self.link.read_exact(&mut data)?;
        let mut checksum = [0u8; 1];
        self.link.read_exact(&mut checksum)?;
        let mut trailer = [0u8; 2];
        self.link.read_exact(&mut trailer)?;
        if trailer != LINE_END {
            warn!("meter reply ended in {trailer:02X?} instead of CRLF");
        }
        // Some firmware appends a stray NUL after the trailer.
        let stragglers = self.link.drain()?;
        if !stragglers.iter().all(|b| *b == 0) {
            warn!("unexpected extra meter reply bytes {stragglers:02X?}");
        }
        let reply = MeterReply {
            recipient,
            length,
            command,
            module_id,
            data,
            checksum: checksum[0],
        };
        if !reply.checksum_ok() {
            debug!("meter reply checksum mismatch (firmware pads these)");
        }
        Ok(reply)
    }

    /// Measures one probe: one module read plus the calibration transform.
    pub fn measure_ph(&mut self, probe: &ProbeId) -> TypedResult<f64> {
        let mv = self.read_module_mv(probe.module)?[probe.channel_index()];
        self.calibration.ph_from_mv(probe, mv)
    }

    /// Reads raw mV for a set of probes with one bus round-trip per
    /// referenced module. A failed module read gets a second chance after a
    /// short pause before the error surfaces.
    pub fn read_mv_many(&mut self, probes: &[ProbeId]) -> TypedResult<BTreeMap<ProbeId, f64>> {
        let modules: BTreeSet<ModuleAddress> = probes.iter().map(|p| p.module).collect();
        let mut by_module = BTreeMap::new();
        for module in modules {
            let values = match self.read_module_mv(module) {
                Err(e) if e.err() == SystemError::ReadFailure => {
                    self.clock.sleep(Duration::from_secs(1));
                    self.read_module_mv(module)?
                }
                other => other?,
            };
            by_module.insert(module, values);
        }
        Ok(probes
            .iter()
            .map(|probe| (*probe, by_module[&probe.module][probe.channel_index()]))
            .collect())
    }

    /// As [Meter::read_mv_many], but converted through the calibration.
    pub fn read_ph_many(&mut self, probes: &[ProbeId]) -> TypedResult<BTreeMap<ProbeId, f64>> {
        let mv_values = self.read_mv_many(probes)?;
        let mut ph_values = BTreeMap::new();
        for (probe, mv) in mv_values {
            ph_values.insert(probe, self.calibration.ph_from_mv(&probe, mv)?);
        }
        Ok(ph_values)
    }
}
