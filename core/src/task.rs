//! Per-vessel task state
//!
//! A task carries one vessel through its chain of ramp phases. The
//! scheduler keeps tasks in a min-heap ordered by `(next_tick, pump_id)`;
//! the pump-id tiebreak makes runs with colliding tick times deterministic.

use std::cmp::Ordering;
use std::time::{Duration, SystemTime};

use crate::controller::Controller;
use crate::probe::ProbeId;
use crate::recipe::{Phase, VesselPlan};

#[derive(Debug, Clone)]
pub struct PumpTask {
    pub pump_id: u8,
    pub probe: ProbeId,
    phases: Vec<Phase>,
    cursor: usize,
    start_time: SystemTime,
    pub next_tick: SystemTime,
    pub controller: Controller,
}

impl PumpTask {
    pub fn from_plan(plan: &VesselPlan, start_time: SystemTime, controller: Controller) -> Self {
        Self {
            pump_id: plan.pump_id,
            probe: plan.probe,
            phases: plan.phases.clone(),
            cursor: 0,
            start_time,
            next_tick: start_time,
            controller,
        }
    }

    /// The phase the cursor currently points at.
    pub fn phase(&self) -> &Phase {
        &self.phases[self.cursor]
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Moves the whole chain to a new run start, as a restart does.
    pub fn set_start_time(&mut self, start_time: SystemTime) {
        self.start_time = start_time;
        self.next_tick = start_time;
    }

    /// Planned start of the current phase: run start plus the durations of
    /// all completed phases.
    pub fn phase_start(&self) -> SystemTime {
        let preceding: Duration = self.phases[..self.cursor].iter().map(Phase::duration).sum();
        self.start_time + preceding
    }

    /// Planned end of the current phase.
    pub fn end_time(&self) -> SystemTime {
        self.phase_start() + self.phase().duration()
    }

    /// Planned end of the final phase of the chain.
    pub fn final_end_time(&self) -> SystemTime {
        let total: Duration = self.phases.iter().map(Phase::duration).sum();
        self.start_time + total
    }

    /// Where on the linear ramp the vessel is supposed to be at `now`.
    pub fn expected_ph_at(&self, now: SystemTime) -> f64 {
        let phase = self.phase();
        let elapsed = now
            .duration_since(self.phase_start())
            .unwrap_or(Duration::ZERO);
        let fraction = (elapsed.as_secs_f64() / phase.duration().as_secs_f64()).clamp(0.0, 1.0);
        phase.ph_start + (phase.ph_end - phase.ph_start) * fraction
    }

    /// Steps the cursor to the follow-on phase. Returns false once the chain
    /// is exhausted and the task should be retired.
    pub fn advance_phase(&mut self) -> bool {
        if self.cursor + 1 < self.phases.len() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    pub fn ordering_key(&self) -> (SystemTime, u8) {
        (self.next_tick, self.pump_id)
    }
}

impl PartialEq for PumpTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PumpTask {}

impl Ord for PumpTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}

impl PartialOrd for PumpTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
