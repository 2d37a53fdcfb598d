//! Syringe-pump driver
//!
//! All pumps of the rig share one controller line. Before a run every pump
//! named by the recipe is probed for presence and walked through the fixed
//! configuration sequence; afterwards a dose is just `RUN`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::PumpSettings;
use crate::error::TypedResult;
use crate::problem;
use crate::pumpcmd::PumpCommand;
use crate::serial::{self, SerialLink, POST_WRITE_SETTLE};

pub struct Pumps {
    link: Box<dyn SerialLink>,
    clock: Arc<dyn Clock>,
    diameter: f64,
    infusion_rate: f64,
    print_messages: bool,
}

impl Pumps {
    pub fn open(settings: &PumpSettings, clock: Arc<dyn Clock>) -> TypedResult<Self> {
        let link = serial::open(&settings.port_name(), settings.baud_rate)?;
        Ok(Self::from_link(
            link,
            settings.diameter,
            settings.infusion_rate,
            clock,
            settings.print_messages,
        ))
    }

    pub fn from_link(
        link: Box<dyn SerialLink>,
        diameter: f64,
        infusion_rate: f64,
        clock: Arc<dyn Clock>,
        print_messages: bool,
    ) -> Self {
        Self {
            link,
            clock,
            diameter,
            infusion_rate,
            print_messages,
        }
    }

    fn send(&mut self, command: &PumpCommand) -> TypedResult<()> {
        self.link.set_dtr(true)?;
        self.link.write_all(&command.encode())?;
        if self.print_messages {
            info!("sent pump command {command}");
        }
        // The controller chokes when commands arrive back to back.
        self.clock.sleep(POST_WRITE_SETTLE);
        Ok(())
    }

    fn read_reply(&mut self) -> TypedResult<Vec<u8>> {
        self.link.set_dtr(false)?;
        self.link.drain()
    }

    /// Presence test: the pump answered a `<addr> ADR` with anything at all.
    pub fn probe_address(&mut self, address: u8) -> TypedResult<()> {
        self.read_reply()?; // clear leftovers first
        self.send(&PumpCommand::Probe(address))?;
        let reply = self.read_reply()?;
        if reply.is_empty() {
            problem!(ReadFailure, "pump {address} did not answer its presence check");
        }
        Ok(())
    }

    /// Address of whatever pump hangs on the programming cable.
    pub fn current_address(&mut self) -> TypedResult<String> {
        self.read_reply()?;
        self.send(&PumpCommand::QueryAddress)?;
        let reply = self.read_reply()?;
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    /// Assigns `address` to the directly connected pump and reads the
    /// address back as confirmation.
    pub fn assign_address(&mut self, address: u8) -> TypedResult<String> {
        self.send(&PumpCommand::AssignAddress(address))?;
        // The pump takes a moment to commit the new address.
        self.clock.sleep(Duration::from_secs(2));
        self.read_reply()?;
        self.current_address()
    }

    /// Walks every pump of the run through the fixed configuration
    /// sequence. The dose volume is the only per-pump difference.
    pub fn configure_all(&mut self, dose_volumes: &BTreeMap<u8, f64>) -> TypedResult<()> {
        let diameter = self.diameter;
        let rate = self.infusion_rate;
        for (&pump, &volume) in dose_volumes {
            self.probe_address(pump)?;
            self.send(&PumpCommand::Diameter(pump, diameter))?;
            self.send(&PumpCommand::Rate(pump, rate))?;
            self.send(&PumpCommand::DirectionInfuse(pump))?;
            self.send(&PumpCommand::VolumeUnitsUl(pump))?;
            self.send(&PumpCommand::ClearDispensed(pump))?;
            self.send(&PumpCommand::Volume(pump, volume as u64))?;
        }
        Ok(())
    }

    /// Dispenses one configured dose.
    pub fn run(&mut self, address: u8) -> TypedResult<()> {
        self.send(&PumpCommand::Run(address))
    }

    /// Dispenses `count` doses; the post-write settle of each `RUN` doubles
    /// as the plunger settling time.
    pub fn run_n(&mut self, address: u8, count: u32) -> TypedResult<()> {
        for _ in 0..count {
            self.run(address)?;
        }
        Ok(())
    }

    /// Rewrites every pump's dose volume to `⌊base · factor⌋` µL.
    pub fn set_dose_multiplier(
        &mut self,
        dose_volumes: &BTreeMap<u8, f64>,
        factor: u32,
    ) -> TypedResult<()> {
        for (&pump, &volume) in dose_volumes {
            let scaled = (volume * f64::from(factor)).floor() as u64;
            self.send(&PumpCommand::Volume(pump, scaled))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::SystemTime;

    use crate::clock::MockClock;
    use crate::serial::testing::MockLink;

    use super::Pumps;

    fn pumps(link: MockLink) -> Pumps {
        let clock = MockClock::starting_at(SystemTime::UNIX_EPOCH);
        Pumps::from_link(Box::new(link), 12.45, 1.0, clock, false)
    }

    #[test]
    fn configures_every_pump_with_the_fixed_sequence() {
        let mut link = MockLink::new();
        link.expect(b"1 ADR\r", b"connection");
        link.expect(b"2 ADR\r", b"connection");
        let log = link.written_log();
        let mut doses = BTreeMap::new();
        doses.insert(1u8, 50.0);
        doses.insert(2u8, 10.0);

        pumps(link).configure_all(&doses).unwrap();

        let expected: Vec<&[u8]> = vec![
            b"1 ADR\r",
            b"1 DIA 12.45\r",
            b"1 RAT 1.0 MM\r",
            b"1 DIR INF\r",
            b"1 VOL UL\r",
            b"1 CLD INF\r",
            b"1 VOL 50\r",
            b"2 ADR\r",
            b"2 DIA 12.45\r",
            b"2 RAT 1.0 MM\r",
            b"2 DIR INF\r",
            b"2 VOL UL\r",
            b"2 CLD INF\r",
            b"2 VOL 10\r",
        ];
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn missing_presence_reply_fails_configuration() {
        let link = MockLink::new(); // nothing scripted: ADR gets no bytes back
        let mut doses = BTreeMap::new();
        doses.insert(3u8, 50.0);
        assert!(pumps(link).configure_all(&doses).is_err());
    }

    #[test]
    fn run_n_issues_one_run_per_dose() {
        let link = MockLink::new();
        let log = link.written_log();
        pumps(link).run_n(1, 3).unwrap();
        let expected: Vec<&[u8]> = vec![b"1 RUN\r", b"1 RUN\r", b"1 RUN\r"];
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn dose_multiplier_rewrites_the_volume() {
        let link = MockLink::new();
        let log = link.written_log();
        let mut doses = BTreeMap::new();
        doses.insert(1u8, 12.5);
        pumps(link).set_dose_multiplier(&doses, 3).unwrap();
        let expected: Vec<&[u8]> = vec![b"1 VOL 37\r"];
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn assign_address_confirms_with_a_query() {
        let mut link = MockLink::new();
        link.expect(b"*ADR 7\r", b"");
        link.expect(b"*ADR\r", b"7\r\n");
        let log = link.written_log();
        let address = pumps(link).assign_address(7).unwrap();
        assert_eq!(address, "7");
        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
