//! Interactive operator CLI
//!
//! A one-key numeric menu wraps the scheduler and the maintenance chores:
//! calibration, live pH reading, manual dosing, pump address assignment and
//! crash recovery. The CLI is a thin shell; everything it does goes through
//! the [PhysicalSystems] façade so it works identically against the local
//! rig and a broker.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;

use phstat_core::calibration::{CalibrationEntry, CalibrationTable};
use phstat_core::clock::Clock;
use phstat_core::config::Config;
use phstat_core::error::{ResultExt, SystemError, TypedResult};
use phstat_core::facade::PhysicalSystems;
use phstat_core::probe::ProbeId;
use phstat_core::recipe::Recipe;

use crate::pause::KeypressSignal;
use crate::runlog::RunLog;
use crate::scheduler::Scheduler;

pub struct Cli<S: PhysicalSystems> {
    config: Config,
    systems: S,
    clock: Arc<dyn Clock>,
    runlog: RunLog,
    protocol_path: PathBuf,
    input: Box<dyn BufRead>,
}

impl<S: PhysicalSystems> Cli<S> {
    pub fn new(config: Config, systems: S, clock: Arc<dyn Clock>) -> Self {
        Self::with_input(config, systems, clock, Box::new(std::io::stdin().lock()))
    }

    pub fn with_input(
        config: Config,
        systems: S,
        clock: Arc<dyn Clock>,
        input: Box<dyn BufRead>,
    ) -> Self {
        let protocol_path = config.protocol_path.clone();
        let runlog = RunLog::for_protocol(&protocol_path, clock.clone());
        Self {
            config,
            systems,
            clock,
            runlog,
            protocol_path,
            input,
        }
    }

    pub fn run(&mut self) -> TypedResult<()> {
        println!("Starting CLI");
        println!("Settings can be changed in the config.yml file.");
        println!();
        println!("Initializing ph meter connection and pump system connection.");
        if let Err(e) = self.initialize() {
            self.runlog.log(&e);
            return Err(e);
        }

        loop {
            self.print_menu();
            let command = self.read_line()?;
            println!();
            let result = match command.as_str() {
                "1" => self.set_protocol(),
                "2" => self.calibrate(),
                "3" => {
                    self.start_run()?;
                    break;
                }
                "4" => self.assign_pump_addresses(),
                "5" => {
                    self.restart_run()?;
                    break;
                }
                "6" => self.live_read(),
                "7" => self.pump_liquid(),
                "8" => {
                    println!("Exiting program.");
                    break;
                }
                _ => {
                    println!("Viable input not given. Try again.");
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.runlog.log(&e);
                return Err(e);
            }
            println!();
        }
        Ok(())
    }

    fn initialize(&mut self) -> TypedResult<()> {
        self.systems.initialize()
    }

    fn print_menu(&self) {
        println!("Options:");
        println!(
            "1 - Set protocol used for run. Currently {:?}.",
            self.protocol_path
        );
        println!("2 - Calibrate ph-measuring probes. Old calibration data will be used if this is not done.");
        println!("3 - Run selected protocol.");
        println!("4 - Assign new ID's for the pumps.");
        println!("5 - Restart failed run.");
        println!("6 - Live read pH. pH will be measured using all probes in the selected protocol.");
        println!("7 - Pump liquid. Useful after the liquid in the syringes have been changed.");
        println!("8 - Exit program.");
        println!();
        println!("Input:");
    }

    fn read_line(&mut self) -> TypedResult<String> {
        let mut line = String::new();
        let bytes = self
            .input
            .read_line(&mut line)
            .typ(SystemError::Config)?;
        if bytes == 0 {
            return Err(phstat_core::error::TypedError::new(
                SystemError::Config,
                anyhow!("stdin closed while waiting for input"),
            ));
        }
        Ok(line.trim().to_string())
    }

    fn set_protocol(&mut self) -> TypedResult<()> {
        println!("Enter the path of the protocol sheet:");
        let path = PathBuf::from(self.read_line()?);
        if !path.exists() {
            println!("The file {path:?} does not exist; keeping the current protocol.");
            return Ok(());
        }
        println!("Selected protocol: {path:?}");
        self.runlog.set_protocol(&path);
        self.protocol_path = path;
        Ok(())
    }

    fn start_run(&mut self) -> TypedResult<()> {
        println!("Press any key followed by enter to pause the run between ticks.");
        let pause = KeypressSignal::watch_stdin();
        let result = {
            let mut scheduler = Scheduler::new(
                self.config.scheduler.clone(),
                &mut self.systems,
                self.clock.clone(),
                pause,
            );
            scheduler.start(&self.protocol_path)
        };
        match result {
            Ok((_, results_path)) => {
                println!("Run has finished. Results recorded in {results_path:?}.");
                Ok(())
            }
            Err(e) => {
                self.runlog.log(&e);
                Err(e)
            }
        }
    }

    fn restart_run(&mut self) -> TypedResult<()> {
        let records_path = loop {
            println!("Enter the name of the saved run data, or write \"stop\" to go back:");
            let filename = self.read_line()?;
            if filename == "stop" {
                return Ok(());
            }
            let path = PathBuf::from(&filename);
            if path.exists() {
                break path;
            }
            println!("The file {filename:?} did not exist. Try again.");
        };
        println!(
            "The run {records_path:?} will be restarted based on the protocol {:?}.",
            self.protocol_path
        );
        let pause = KeypressSignal::watch_stdin();
        let result = {
            let mut scheduler = Scheduler::new(
                self.config.scheduler.clone(),
                &mut self.systems,
                self.clock.clone(),
                pause,
            );
            scheduler.restart(&self.protocol_path, &records_path)
        };
        match result {
            Ok(_) => {
                println!("Run has finished.");
                Ok(())
            }
            Err(e) => {
                self.runlog.log(&e);
                Err(e)
            }
        }
    }

    fn calibrate(&mut self) -> TypedResult<()> {
        let available = self.probes_in_protocol();
        if available.is_empty() {
            println!("The protocol {:?} names no probes.", self.protocol_path);
            return Ok(());
        }
        let selected = self.choose_probes(&available)?;

        let (low_mv, low_ph) = self.read_buffer_point("low", &selected)?;
        let (high_mv, high_ph) = self.read_buffer_point("high", &selected)?;

        let path = self.config.calibration_data_path.clone();
        let mut table = if path.exists() {
            CalibrationTable::load(&path)?
        } else {
            CalibrationTable::default()
        };
        for probe in &selected {
            table.insert(
                *probe,
                CalibrationEntry::new(low_ph, low_mv[probe], high_ph, high_mv[probe])?,
            );
        }
        table.save(&path)?;
        self.systems.recalibrate()?;
        println!("Calibration finished.");
        Ok(())
    }

    fn read_buffer_point(
        &mut self,
        level: &str,
        probes: &[ProbeId],
    ) -> TypedResult<(std::collections::BTreeMap<ProbeId, f64>, f64)> {
        println!("Place the probes in a buffer with a {level} pH. Enter the pH of this buffer:");
        let ph: f64 = self
            .read_line()?
            .parse()
            .map_err(|e| anyhow!("that is not a pH value: {e}"))
            .typ(SystemError::Config)?;

        println!("The mV readings of the probes need to stabilize.");
        println!("The values will be printed until you press a key; the last printed values are recorded.");
        let signal = KeypressSignal::watch_stdin();
        let mut mv_values = self.systems.mv_of_selected_probes(probes)?;
        while !signal.raised() {
            self.print_probe_values(&mv_values, "mV");
            mv_values = self.systems.mv_of_selected_probes(probes)?;
        }
        println!("The final mV values for the probes are:");
        self.print_probe_values(&mv_values, "mV");
        Ok((mv_values, ph))
    }

    fn live_read(&mut self) -> TypedResult<()> {
        let probes = self.probes_in_protocol();
        if probes.is_empty() {
            println!("The protocol {:?} names no probes.", self.protocol_path);
            return Ok(());
        }
        println!("Probes used in {:?}: {probes:?}", self.protocol_path);
        println!("Printing measured pH until a key is pressed.");
        let signal = KeypressSignal::watch_stdin();
        while !signal.raised() {
            match self.systems.ph_of_selected_probes(&probes) {
                Ok(values) => self.print_probe_values(&values, "pH"),
                Err(e) if e.err() == SystemError::ReadFailure => {
                    println!("Error reading from the pH meter; check the probe connections if this continues. Retrying...");
                }
                Err(e) => {
                    println!("Unknown error while reading pH, retrying: {e}");
                }
            }
        }
        println!("A key has been pressed. Stopped live-reading pH values.");
        Ok(())
    }

    fn pump_liquid(&mut self) -> TypedResult<()> {
        let recipe = self.load_protocol()?;
        let available: Vec<u8> = recipe.pump_ids().into_iter().collect();
        if available.is_empty() {
            println!("The protocol {:?} names no pumps.", self.protocol_path);
            return Ok(());
        }
        println!("Pumps used in the selected protocol: {available:?}");
        println!("Select pumps as a comma separated list, or write 'ALL'.");
        let chosen: Vec<u8> = loop {
            let raw = self.read_line()?;
            match parse_selection(&raw, &available) {
                Some(list) => break list,
                None => println!("At least one pump needs to be selected. Try again:"),
            }
        };
        println!("How many times should each pump dose? Write an integer.");
        let count: u32 = self
            .read_line()?
            .parse()
            .map_err(|e| anyhow!("that is not a count: {e}"))
            .typ(SystemError::Config)?;
        for pump in chosen {
            println!("Pumping with pump {pump}.");
            self.systems.pump_n_times(pump, count)?;
        }
        Ok(())
    }

    fn assign_pump_addresses(&mut self) -> TypedResult<()> {
        println!("Plug the main cable from the computer into the pump you want to assign an ID.");
        println!("Write the ID to assign (1 to 99), 'measure' to read the current one, or 'stop' to finish.");
        loop {
            println!("Input:");
            let raw = self.read_line()?;
            match raw.to_lowercase().as_str() {
                "stop" => break,
                "measure" => {
                    let address = self.systems.current_pump_address()?;
                    println!("Current pump has address: {address}");
                }
                other => match other.parse::<u8>() {
                    Ok(address) if (1..=99).contains(&address) => {
                        let confirmed = self.systems.assign_pump_address(address)?;
                        println!("It now has the address: {confirmed}");
                    }
                    _ => println!("Addresses go from 1 to 99. Try again."),
                },
            }
        }
        println!("Stopped assigning ID's.");
        Ok(())
    }

    fn choose_probes(&mut self, available: &[ProbeId]) -> TypedResult<Vec<ProbeId>> {
        println!("The following probes are used in the selected protocol: {available:?}");
        println!("Select the probes as a comma separated list, or write 'ALL'.");
        loop {
            let raw = self.read_line()?;
            match parse_selection(&raw, available) {
                Some(probes) => {
                    println!("Selected probes: {probes:?}");
                    return Ok(probes);
                }
                None => println!("At least one probe needs to be selected. Try again:"),
            }
        }
    }

    fn load_protocol(&self) -> TypedResult<Recipe> {
        Recipe::load(&self.protocol_path)
    }

    fn probes_in_protocol(&self) -> Vec<ProbeId> {
        self.load_protocol()
            .map(|recipe| recipe.probe_ids().into_iter().collect())
            .unwrap_or_default()
    }

    fn print_probe_values(&self, values: &std::collections::BTreeMap<ProbeId, f64>, unit: &str) {
        let recipe = self.load_protocol().ok();
        let rendered: Vec<String> = values
            .iter()
            .map(|(probe, value)| {
                match recipe.as_ref().and_then(|r| r.pump_for_probe(probe)) {
                    Some(pump) => format!("pump {pump}: {value:.2} {unit}"),
                    None => format!("{probe}: {value:.2} {unit}"),
                }
            })
            .collect();
        println!("{}", rendered.join(", "));
    }
}

/// `ALL`, or a comma separated subset of `available`. `None` asks the
/// caller to prompt again.
fn parse_selection<T>(raw: &str, available: &[T]) -> Option<Vec<T>>
where
    T: Clone + std::str::FromStr + PartialEq,
{
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("all") {
        return Some(available.to_vec());
    }
    if trimmed.replace(' ', "").is_empty() {
        return None;
    }
    let chosen: Vec<T> = trimmed
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .filter(|item| available.contains(item))
        .collect();
    if chosen.is_empty() {
        None
    } else {
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use phstat_core::probe::ProbeId;

    use super::parse_selection;

    #[test]
    fn all_selects_everything() {
        let available = vec![1u8, 2, 3];
        assert_eq!(parse_selection("ALL", &available), Some(vec![1, 2, 3]));
        assert_eq!(parse_selection("all", &available), Some(vec![1, 2, 3]));
    }

    #[test]
    fn comma_lists_are_filtered_against_the_protocol() {
        let available: Vec<ProbeId> = vec![
            "F.0.1.22_1".parse().unwrap(),
            "F.0.1.22_2".parse().unwrap(),
        ];
        let chosen = parse_selection("F.0.1.22_2, F.9.9.99_1", &available).unwrap();
        assert_eq!(chosen, vec!["F.0.1.22_2".parse::<ProbeId>().unwrap()]);
    }

    #[test]
    fn empty_input_asks_again() {
        let available = vec![1u8, 2];
        assert_eq!(parse_selection("", &available), None);
        assert_eq!(parse_selection("   ", &available), None);
    }
}
