//! Request dispatch and session leases
//!
//! The broker hands out leases on pumps and probes per recipe: a recipe may
//! only start when none of its pumps or probes is part of another client's
//! running session. Everything else forwards to the owned physical systems.

use std::collections::HashSet;

use phstat_core::error::{ResultExt, SystemError, TypedResult};
use phstat_core::facade::PhysicalSystems;
use phstat_core::net::{Reply, Request};
use phstat_core::probe::ProbeId;
use phstat_core::problem;
use phstat_core::recipe::Recipe;

pub struct Broker<S: PhysicalSystems> {
    systems: S,
    leased_pumps: HashSet<u8>,
    leased_probes: HashSet<ProbeId>,
}

/// What the serve loop should do after a reply went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

impl<S: PhysicalSystems> Broker<S> {
    pub fn new(systems: S) -> Self {
        Self {
            systems,
            leased_pumps: HashSet::new(),
            leased_probes: HashSet::new(),
        }
    }

    /// Handles one request. Faults become `ERROR` replies; the broker
    /// itself never dies on a bad request.
    pub fn handle(&mut self, request: &Request) -> (Reply, Flow) {
        let flow = match request {
            Request::Stop => Flow::Stop,
            _ => Flow::Continue,
        };
        match self.dispatch(request) {
            Ok(reply) => (reply, flow),
            Err(e) => {
                error!("{} failed: {e}", request.verb());
                (Reply::error(&e), Flow::Continue)
            }
        }
    }

    fn dispatch(&mut self, request: &Request) -> TypedResult<Reply> {
        match request {
            Request::InitializePumpsUsedInProtocol { protocol } => {
                let recipe = Recipe::from_json(protocol)?;
                self.lease(&recipe)?;
                if let Err(e) = self.systems.initialize_pumps_used_in_protocol(&recipe) {
                    // A pump that failed configuration must not stay leased.
                    self.release(&recipe);
                    return Err(e);
                }
                Ok(Reply::Done)
            }
            Request::GetCurrentPumpAddress => {
                self.systems.current_pump_address().map(Reply::Value)
            }
            Request::SetAndGetAddressForCurrentPump { address } => {
                self.systems.assign_pump_address(*address).map(Reply::Value)
            }
            Request::GetMvValuesOfSelectedProbes { probes } => {
                let probes = parse_probes(probes)?;
                let values = self.systems.mv_of_selected_probes(&probes)?;
                Ok(Reply::Value(to_json(&values)?))
            }
            Request::GetPhValuesOfSelectedProbes { probes } => {
                let probes = parse_probes(probes)?;
                let values = self.systems.ph_of_selected_probes(&probes)?;
                Ok(Reply::Value(to_json(&values)?))
            }
            Request::MeasurePhWithProbeAssociatedWithTask { probe } => {
                let ph = self.systems.measure_ph_for_task(probe)?;
                Ok(Reply::Value(ph.to_string()))
            }
            Request::RecalibratePhMeter => {
                self.systems.recalibrate()?;
                Ok(Reply::Done)
            }
            Request::SetPumpDoseMultiplicationFactor { protocol, factor } => {
                let recipe = Recipe::from_json(protocol)?;
                self.systems.set_pump_dose_multiplier(&recipe, *factor)?;
                Ok(Reply::Done)
            }
            Request::PumpNTimes { pump_id, count } => {
                self.systems.pump_n_times(*pump_id, *count)?;
                Ok(Reply::Done)
            }
            Request::Disconnect { protocol } => {
                let recipe = Recipe::from_json(protocol)?;
                self.release(&recipe);
                self.systems.disconnect(&recipe)?;
                Ok(Reply::Done)
            }
            Request::Test => Ok(Reply::Value("test answer".into())),
            Request::Stop => Ok(Reply::Value("Stopping".into())),
        }
    }

    fn lease(&mut self, recipe: &Recipe) -> TypedResult<()> {
        let pumps = recipe.pump_ids();
        let probes = recipe.probe_ids();
        let pump_clash: Vec<_> = pumps.iter().filter(|p| self.leased_pumps.contains(p)).collect();
        if !pump_clash.is_empty() {
            problem!(
                LeaseConflict,
                "pumps {pump_clash:?} are part of another running session ({:?} leased in total)",
                self.leased_pumps
            );
        }
        let probe_clash: Vec<_> = probes
            .iter()
            .filter(|p| self.leased_probes.contains(p))
            .collect();
        if !probe_clash.is_empty() {
            problem!(
                LeaseConflict,
                "probes {probe_clash:?} are part of another running session"
            );
        }
        self.leased_pumps.extend(pumps);
        self.leased_probes.extend(probes);
        Ok(())
    }

    fn release(&mut self, recipe: &Recipe) {
        for pump in recipe.pump_ids() {
            self.leased_pumps.remove(&pump);
        }
        for probe in recipe.probe_ids() {
            self.leased_probes.remove(&probe);
        }
    }
}

fn parse_probes(json: &str) -> TypedResult<Vec<ProbeId>> {
    serde_json::from_str(json).typ(SystemError::Protocol)
}

fn to_json<T: serde::Serialize>(value: &T) -> TypedResult<String> {
    serde_json::to_string(value).typ(SystemError::Protocol)
}
