//! Physical-systems façade
//!
//! The scheduler and the operator CLI talk to a single [PhysicalSystems]
//! handle and never to the drivers directly. Two implementations satisfy
//! the contract: [LocalSystems] owns the serial devices in-process, and
//! [crate::net::RemoteSystems] forwards every call to a session broker.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::calibration::CalibrationTable;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::TypedResult;
use crate::meter::Meter;
use crate::probe::ProbeId;
use crate::problem;
use crate::pumps::Pumps;
use crate::recipe::Recipe;

pub trait PhysicalSystems {
    /// Connects to the devices. Must be called before anything else.
    fn initialize(&mut self) -> TypedResult<()>;

    /// Presence-checks and configures every pump the recipe uses.
    fn initialize_pumps_used_in_protocol(&mut self, recipe: &Recipe) -> TypedResult<()>;

    fn current_pump_address(&mut self) -> TypedResult<String>;

    fn assign_pump_address(&mut self, address: u8) -> TypedResult<String>;

    fn mv_of_selected_probes(
        &mut self,
        probes: &[ProbeId],
    ) -> TypedResult<BTreeMap<ProbeId, f64>>;

    fn ph_of_selected_probes(
        &mut self,
        probes: &[ProbeId],
    ) -> TypedResult<BTreeMap<ProbeId, f64>>;

    /// One probe measurement for a scheduler tick.
    fn measure_ph_for_task(&mut self, probe: &ProbeId) -> TypedResult<f64>;

    fn pump(&mut self, pump_id: u8) -> TypedResult<()>;

    fn pump_n_times(&mut self, pump_id: u8, count: u32) -> TypedResult<()>;

    fn set_pump_dose_multiplier(&mut self, recipe: &Recipe, factor: u32) -> TypedResult<()>;

    /// Reloads the calibration store and publishes it to the meter.
    fn recalibrate(&mut self) -> TypedResult<()>;

    /// Ends the session for this recipe's pumps and probes.
    fn disconnect(&mut self, recipe: &Recipe) -> TypedResult<()>;
}

/// In-process implementation owning both serial buses.
pub struct LocalSystems {
    config: Config,
    clock: Arc<dyn Clock>,
    calibration_path: PathBuf,
    meter: Option<Meter>,
    pumps: Option<Pumps>,
}

impl LocalSystems {
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Self {
        let calibration_path = config.calibration_data_path.clone();
        Self {
            config,
            clock,
            calibration_path,
            meter: None,
            pumps: None,
        }
    }

    /// Assembles a façade around already-open drivers; the tests and the
    /// broker's self-test use this.
    pub fn from_parts(
        config: Config,
        clock: Arc<dyn Clock>,
        meter: Meter,
        pumps: Pumps,
    ) -> Self {
        let calibration_path = config.calibration_data_path.clone();
        Self {
            config,
            clock,
            calibration_path,
            meter: Some(meter),
            pumps: Some(pumps),
        }
    }

    fn meter(&mut self) -> TypedResult<&mut Meter> {
        match self.meter.as_mut() {
            Some(meter) => Ok(meter),
            None => problem!(Bus, "pH meter connection was never initialized"),
        }
    }

    fn pumps(&mut self) -> TypedResult<&mut Pumps> {
        match self.pumps.as_mut() {
            Some(pumps) => Ok(pumps),
            None => problem!(Bus, "pump system connection was never initialized"),
        }
    }
}

impl PhysicalSystems for LocalSystems {
    fn initialize(&mut self) -> TypedResult<()> {
        if self.meter.is_none() {
            let calibration = CalibrationTable::load(&self.calibration_path)?;
            self.meter = Some(Meter::open(
                &self.config.phmeter,
                calibration,
                self.clock.clone(),
            )?);
        }
        if self.pumps.is_none() {
            self.pumps = Some(Pumps::open(&self.config.pumps, self.clock.clone())?);
        }
        Ok(())
    }

    fn initialize_pumps_used_in_protocol(&mut self, recipe: &Recipe) -> TypedResult<()> {
        let doses = recipe.dose_volumes();
        self.pumps()?.configure_all(&doses)
    }

    fn current_pump_address(&mut self) -> TypedResult<String> {
        self.pumps()?.current_address()
    }

    fn assign_pump_address(&mut self, address: u8) -> TypedResult<String> {
        self.pumps()?.assign_address(address)
    }

    fn mv_of_selected_probes(
        &mut self,
        probes: &[ProbeId],
    ) -> TypedResult<BTreeMap<ProbeId, f64>> {
        self.meter()?.read_mv_many(probes)
    }

    fn ph_of_selected_probes(
        &mut self,
        probes: &[ProbeId],
    ) -> TypedResult<BTreeMap<ProbeId, f64>> {
        self.meter()?.read_ph_many(probes)
    }

    fn measure_ph_for_task(&mut self, probe: &ProbeId) -> TypedResult<f64> {
        self.meter()?.measure_ph(probe)
    }

    fn pump(&mut self, pump_id: u8) -> TypedResult<()> {
        self.pumps()?.run(pump_id)
    }

    fn pump_n_times(&mut self, pump_id: u8, count: u32) -> TypedResult<()> {
        self.pumps()?.run_n(pump_id, count)
    }

    fn set_pump_dose_multiplier(&mut self, recipe: &Recipe, factor: u32) -> TypedResult<()> {
        let doses = recipe.dose_volumes();
        self.pumps()?.set_dose_multiplier(&doses, factor)
    }

    fn recalibrate(&mut self) -> TypedResult<()> {
        let table = CalibrationTable::load(&self.calibration_path)?;
        self.meter()?.update_calibration(table);
        Ok(())
    }

    fn disconnect(&mut self, _recipe: &Recipe) -> TypedResult<()> {
        // The serial ports stay open for the next run; lease bookkeeping
        // only exists on the broker side.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::SystemTime;

    use crate::calibration::{CalibrationEntry, CalibrationTable};
    use crate::clock::MockClock;
    use crate::config::Config;
    use crate::meter::Meter;
    use crate::pumps::Pumps;
    use crate::recipe::Recipe;
    use crate::serial::testing::MockLink;

    use super::{LocalSystems, PhysicalSystems};

    const MV_REQUEST: &[u8] = &[0x4D, 0x06, 0x0A, 0x0F, 0x01, 0x00, 0x22, 0x8F, 0x0D, 0x0A];
    const MV_REPLY: &[u8] = &[
        0x50, 0x0E, 0x10, 0x0F, 0x01, 0x00, 0x22, 0x00, 0x00, 0x02, 0xC3, 0xFD, 0x3D, 0x00, 0x00,
        0x00, 0x0D, 0x0A,
    ];

    const CONFIG: &str = "
protocol_path: run.csv
calibration_data_path: calibration_data.yml
phmeter:
  ComPort: 1
  ShouldPrintPhMeterMessages: false
pumps:
  ComPort: 2
  BaudRate: 19200
  Diameter: 12.45
  InfusionRate: 1.0
  ShouldPrintPumpMessages: false
scheduler:
  ShouldPrintSchedulingMessages: false
  ShouldRecordStepsWhileRunning: false
  PhCalibrationDataPath: calibration_data.yml
  ShouldInitiallyEnsureCorrectPHBeforeStarting: false
  IncreasedPumpFactorWhenPerformingInitialCorrection: 1
  AdaptivePumpingActivateAfterNHours: 0.0
";

    #[test]
    fn one_facade_drives_both_buses() {
        let clock = MockClock::starting_at(SystemTime::UNIX_EPOCH);
        let mut table = CalibrationTable::default();
        table.insert(
            "F.1.0.22_2".parse().unwrap(),
            CalibrationEntry::new(4.0, 171.43, 9.0, -114.29).unwrap(),
        );
        let mut meter_link = MockLink::new();
        meter_link.expect(MV_REQUEST, MV_REPLY);
        let meter = Meter::from_link(Box::new(meter_link), table, clock.clone(), false);

        let pump_link = MockLink::new();
        let pump_log = pump_link.written_log();
        let pumps = Pumps::from_link(Box::new(pump_link), 12.45, 1.0, clock.clone(), false);

        let config: Config = serde_yaml::from_str(CONFIG).unwrap();
        let mut systems = LocalSystems::from_parts(config, clock, meter, pumps);

        let ph = systems
            .measure_ph_for_task(&"F.1.0.22_2".parse().unwrap())
            .unwrap();
        assert!((ph - 5.76).abs() < 0.005);

        let sheet = "Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay\n\
                     1,1,F.1.0.22_2,60,6.5,7.0,50,1\n";
        let recipe = Recipe::parse(sheet.as_bytes()).unwrap();
        systems.pump_n_times(1, 2).unwrap();
        systems.set_pump_dose_multiplier(&recipe, 3).unwrap();
        let expected: Vec<&[u8]> = vec![b"1 RUN\r", b"1 RUN\r", b"1 VOL 150\r"];
        assert_eq!(*pump_log.lock().unwrap(), expected);

        systems.disconnect(&recipe).unwrap();
    }
}
