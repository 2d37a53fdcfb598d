//! Recipe sheet parsing
//!
//! A run is described by a tabular sheet with one row per vessel:
//!
//! ```text
//! Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay
//! 1,1,F.0.1.22_1,60,6.5,7.0,50,1
//! 2,1,F.0.1.22_2,60,6.5,7.0,10,1
//! ```
//!
//! `Step` is the phase duration in minutes and `Force delay` the minimum
//! delay between two dosations of the vessel, also in minutes. A row may
//! append further groups of five cells to chain follow-on phases; the chain
//! ends at the first empty cell. Rows with `On/off` 0 are kept in the sheet
//! for documentation but take no part in the run.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{ResultExt, SystemError, TypedResult};
use crate::probe::ProbeId;
use crate::problem;
use crate::pumpcmd::{MAX_PUMP_ADDRESS, MIN_PUMP_ADDRESS};

/// One linear pH ramp segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub duration_min: f64,
    pub ph_start: f64,
    pub ph_end: f64,
    pub dose_volume_ul: f64,
    pub minimum_delay_min: f64,
}

impl Phase {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_min * 60.0)
    }

    pub fn minimum_delay(&self) -> Duration {
        Duration::from_secs_f64(self.minimum_delay_min * 60.0)
    }
}

/// A vessel's pump, probe and chain of ramp phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselPlan {
    pub pump_id: u8,
    pub probe: ProbeId,
    pub phases: Vec<Phase>,
}

/// The parsed sheet; the broker and scheduler both work from this form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub vessels: Vec<VesselPlan>,
}

impl Recipe {
    pub fn load(path: &Path) -> TypedResult<Self> {
        let file = File::open(path)
            .map_err(|e| anyhow!("could not open recipe sheet {path:?}: {e}"))
            .typ(SystemError::Config)?;
        Self::parse(file)
    }

    pub fn parse<R: io::Read>(reader: R) -> TypedResult<Self> {
        let mut sheet = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut vessels = Vec::new();
        for (index, record) in sheet.records().enumerate() {
            let row = index + 2; // header is line 1
            let record = record.typ(SystemError::Config)?;
            let on_off: f64 = parse_cell(&record, 1, row)?;
            if on_off == 0.0 {
                continue;
            }
            let pump_id: u8 = parse_cell(&record, 0, row)?;
            if !(MIN_PUMP_ADDRESS..=MAX_PUMP_ADDRESS).contains(&pump_id) {
                problem!(Config, "row {row}: pump address {pump_id} outside 1..=99");
            }
            let probe: ProbeId = cell(&record, 2, row)?.parse()?;
            let phases = parse_phase_groups(&record, row)?;
            vessels.push(VesselPlan {
                pump_id,
                probe,
                phases,
            });
        }

        if let Some(pump) = vessels.iter().map(|v| v.pump_id).duplicates().next() {
            problem!(Config, "pump {pump} drives more than one vessel in the sheet");
        }
        if let Some(probe) = vessels.iter().map(|v| &v.probe).duplicates().next() {
            problem!(Config, "probe {probe} measures more than one vessel in the sheet");
        }

        Ok(Self { vessels })
    }

    pub fn pump_ids(&self) -> BTreeSet<u8> {
        self.vessels.iter().map(|v| v.pump_id).collect()
    }

    pub fn probe_ids(&self) -> BTreeSet<ProbeId> {
        self.vessels.iter().map(|v| v.probe).collect()
    }

    /// Dose volume each pump is configured with, taken from the first phase
    /// of its vessel.
    pub fn dose_volumes(&self) -> BTreeMap<u8, f64> {
        self.vessels
            .iter()
            .filter_map(|v| v.phases.first().map(|p| (v.pump_id, p.dose_volume_ul)))
            .collect()
    }

    pub fn pump_for_probe(&self, probe: &ProbeId) -> Option<u8> {
        self.vessels
            .iter()
            .find(|v| &v.probe == probe)
            .map(|v| v.pump_id)
    }

    pub fn to_json(&self) -> TypedResult<String> {
        serde_json::to_string(self).typ(SystemError::Config)
    }

    pub fn from_json(json: &str) -> TypedResult<Self> {
        serde_json::from_str(json).typ(SystemError::Protocol)
    }
}

fn cell<'r>(record: &'r csv::StringRecord, index: usize, row: usize) -> TypedResult<&'r str> {
    match record.get(index) {
        Some(cell) => Ok(cell),
        None => problem!(Config, "row {row} is missing column {}", index + 1),
    }
}

fn parse_cell<T: std::str::FromStr>(
    record: &csv::StringRecord,
    index: usize,
    row: usize,
) -> TypedResult<T>
where
    T::Err: std::fmt::Display,
{
    let raw = cell(record, index, row)?;
    match raw.parse() {
        Ok(value) => Ok(value),
        Err(e) => problem!(Config, "row {row}, column {}: bad value {raw:?}: {e}", index + 1),
    }
}

fn is_blank(cell: Option<&str>) -> bool {
    match cell {
        None => true,
        Some(raw) => raw.is_empty() || raw.eq_ignore_ascii_case("nan"),
    }
}

/// Reads consecutive five-cell groups starting at the `Step` column until a
/// blank cell ends the chain.
fn parse_phase_groups(record: &csv::StringRecord, row: usize) -> TypedResult<Vec<Phase>> {
    let mut phases = Vec::new();
    let mut index = 3;
    while !is_blank(record.get(index)) {
        phases.push(Phase {
            duration_min: parse_cell(record, index, row)?,
            ph_start: parse_cell(record, index + 1, row)?,
            ph_end: parse_cell(record, index + 2, row)?,
            dose_volume_ul: parse_cell(record, index + 3, row)?,
            minimum_delay_min: parse_cell(record, index + 4, row)?,
        });
        index += 5;
    }
    if phases.is_empty() {
        problem!(Config, "row {row} describes no phase at all");
    }
    Ok(phases)
}

#[cfg(test)]
mod tests {
    use super::Recipe;

    const SHEET: &str = "\
Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay
1,1,F.0.1.22_1,60,6.5,7.0,50,1
2,1,F.0.1.22_2,60,6.5,7.0,10,1
";

    #[test]
    fn parses_one_vessel_per_row() {
        let recipe = Recipe::parse(SHEET.as_bytes()).unwrap();
        assert_eq!(recipe.vessels.len(), 2);
        let first = &recipe.vessels[0];
        assert_eq!(first.pump_id, 1);
        assert_eq!(first.probe.to_string(), "F.0.1.22_1");
        assert_eq!(first.phases.len(), 1);
        assert_eq!(first.phases[0].duration_min, 60.0);
        assert_eq!(first.phases[0].dose_volume_ul, 50.0);
        assert_eq!(recipe.dose_volumes()[&2], 10.0);
    }

    #[test]
    fn off_rows_produce_no_vessel() {
        let sheet = "\
Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay
1,0,F.0.1.22_1,60,6.5,7.0,50,1
2,1,F.0.1.22_2,60,6.5,7.0,10,1
";
        let recipe = Recipe::parse(sheet.as_bytes()).unwrap();
        assert_eq!(recipe.pump_ids().into_iter().collect::<Vec<_>>(), [2]);
    }

    #[test]
    fn extra_cell_groups_chain_follow_on_phases() {
        let sheet = "\
Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay
1,1,F.0.1.22_1,60,6.5,7.0,50,1,120,7.0,7.5,50,2
";
        let recipe = Recipe::parse(sheet.as_bytes()).unwrap();
        let phases = &recipe.vessels[0].phases;
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[1].duration_min, 120.0);
        assert_eq!(phases[1].ph_start, 7.0);
        assert_eq!(phases[1].minimum_delay_min, 2.0);
    }

    #[test]
    fn blank_or_nan_cells_end_the_chain() {
        let sheet = "\
Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay
1,1,F.0.1.22_1,60,6.5,7.0,50,1,NaN,,,,
";
        let recipe = Recipe::parse(sheet.as_bytes()).unwrap();
        assert_eq!(recipe.vessels[0].phases.len(), 1);
    }

    #[test]
    fn duplicate_pump_is_rejected() {
        let sheet = "\
Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay
1,1,F.0.1.22_1,60,6.5,7.0,50,1
1,1,F.0.1.22_2,60,6.5,7.0,10,1
";
        assert!(Recipe::parse(sheet.as_bytes()).is_err());
    }

    #[test]
    fn duplicate_probe_is_rejected() {
        let sheet = "\
Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay
1,1,F.0.1.22_1,60,6.5,7.0,50,1
2,1,F.0.1.22_1,60,6.5,7.0,10,1
";
        assert!(Recipe::parse(sheet.as_bytes()).is_err());
    }

    #[test]
    fn json_round_trip() {
        let recipe = Recipe::parse(SHEET.as_bytes()).unwrap();
        let json = recipe.to_json().unwrap();
        assert_eq!(Recipe::from_json(&json).unwrap(), recipe);
    }
}
