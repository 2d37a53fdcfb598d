//! The scheduler
//!
//! All vessels run on one control thread. Tasks live in a min-heap ordered
//! by `(next_tick, pump_id)`; the loop pops the earliest task, suspends
//! until it is due, measures, doses, records, and pushes the task back with
//! its next tick time. Exactly one task is active at a time, so the two
//! serial buses never see interleaved traffic from different vessels.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use phstat_core::clock::Clock;
use phstat_core::config::SchedulerSettings;
use phstat_core::controller::{Controller, WindowedDerivative};
use phstat_core::error::TypedResult;
use phstat_core::facade::PhysicalSystems;
use phstat_core::problem;
use phstat_core::recipe::Recipe;
use phstat_core::record::{results_path_for, RunRecords, StepRecord};
use phstat_core::task::PumpTask;

use crate::pause::KeypressSignal;

/// Back-off before retrying a vessel whose probe read failed.
const READ_FAILURE_RETRY: Duration = Duration::from_secs(10);

/// Polling interval of the pre-conditioning loop.
const PRECONDITION_POLL: Duration = Duration::from_secs(60);

type TaskQueue = BinaryHeap<Reverse<PumpTask>>;

pub struct Scheduler<'a, S: PhysicalSystems> {
    settings: SchedulerSettings,
    systems: &'a mut S,
    clock: Arc<dyn Clock>,
    pause: KeypressSignal,
    start_time: SystemTime,
}

impl<'a, S: PhysicalSystems> Scheduler<'a, S> {
    pub fn new(
        settings: SchedulerSettings,
        systems: &'a mut S,
        clock: Arc<dyn Clock>,
        pause: KeypressSignal,
    ) -> Self {
        let start_time = clock.now();
        Self {
            settings,
            systems,
            clock,
            pause,
            start_time,
        }
    }

    /// Runs the recipe at `recipe_path` to completion and returns the
    /// records together with the results sheet path.
    pub fn start(&mut self, recipe_path: &Path) -> TypedResult<(RunRecords, PathBuf)> {
        let recipe = Recipe::load(recipe_path)?;
        self.systems.initialize_pumps_used_in_protocol(&recipe)?;
        let results_path = results_path_for(recipe_path, self.clock.now());

        if self.settings.precondition {
            self.precondition(&recipe)?;
        }

        // All tasks share the moment dosing control takes over.
        self.start_time = self.clock.now();
        let queue = self.build_queue(&recipe, self.start_time);

        let mut records = RunRecords::new();
        self.run_queue(queue, &mut records, &results_path)?;
        records.save(&results_path)?;
        self.systems.disconnect(&recipe)?;
        Ok((records, results_path))
    }

    /// Resumes a crashed run from its results sheet. The task queue is
    /// rebuilt from the recipe, adopts the recorded start time, and every
    /// task picks up one minimum delay after its last recorded step. Dose
    /// history is not replayed, so restarting twice is harmless.
    pub fn restart(
        &mut self,
        recipe_path: &Path,
        records_path: &Path,
    ) -> TypedResult<(RunRecords, PathBuf)> {
        let recipe = Recipe::load(recipe_path)?;
        self.systems.initialize_pumps_used_in_protocol(&recipe)?;

        let mut records = RunRecords::load(records_path)?;
        let Some(first) = records.first() else {
            problem!(Config, "results sheet {records_path:?} is empty, nothing to resume");
        };
        let original_start = first.timestamp;
        self.start_time = original_start;

        let mut queue = TaskQueue::new();
        for plan in &recipe.vessels {
            let mut task = PumpTask::from_plan(plan, original_start, default_controller());
            if let Some(last) = records.last_for(task.pump_id) {
                task.next_tick = last.timestamp + task.phase().minimum_delay();
            }
            // Skip phases the previous run already finished.
            while task.next_tick >= task.end_time() && task.advance_phase() {}
            if task.next_tick < task.end_time() {
                queue.push(Reverse(task));
            }
        }

        self.run_queue(queue, &mut records, records_path)?;
        records.save(records_path)?;
        self.systems.disconnect(&recipe)?;
        Ok((records, records_path.to_path_buf()))
    }

    fn build_queue(&self, recipe: &Recipe, start: SystemTime) -> TaskQueue {
        recipe
            .vessels
            .iter()
            .map(|plan| Reverse(PumpTask::from_plan(plan, start, default_controller())))
            .collect()
    }

    fn run_queue(
        &mut self,
        mut queue: TaskQueue,
        records: &mut RunRecords,
        results_path: &Path,
    ) -> TypedResult<()> {
        while let Some(Reverse(mut task)) = queue.pop() {
            if self.pause.raised() {
                self.block_until_resumed();
            }
            self.wait_until_ready(&task);
            let delay = self.tick(&mut task, records, results_path)?;
            self.reschedule(task, delay, &mut queue);
        }
        Ok(())
    }

    fn block_until_resumed(&self) {
        println!("Pausing; press enter to resume the run.");
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        self.pause.clear();
        println!("Resuming.");
    }

    /// Cooperative suspension until the task's tick time.
    fn wait_until_ready(&self, task: &PumpTask) {
        if let Ok(wait) = task.next_tick.duration_since(self.clock.now()) {
            if !wait.is_zero() {
                if self.settings.print_messages {
                    info!(
                        "waiting {} until pump {} is due",
                        humantime::format_duration(wait),
                        task.pump_id
                    );
                }
                self.clock.sleep(wait);
            }
        }
    }

    /// One control step for one vessel: measure, dose, record. Returns the
    /// delay to the task's next tick.
    fn tick(
        &mut self,
        task: &mut PumpTask,
        records: &mut RunRecords,
        results_path: &Path,
    ) -> TypedResult<Duration> {
        let expected_ph = task.expected_ph_at(self.clock.now());
        let actual_ph = match self.systems.measure_ph_for_task(&task.probe) {
            Ok(ph) => ph,
            Err(e) => {
                // A transient device fault never drops the task; record the
                // gap and come back shortly.
                warn!("probe read for pump {} failed: {e}", task.pump_id);
                f64::NAN
            }
        };

        let mut delay = task.phase().minimum_delay();
        let mut doses = 0;
        if actual_ph.is_nan() {
            delay = READ_FAILURE_RETRY;
        } else {
            doses = self.dose_count(task, expected_ph, actual_ph);
            if doses > 0 {
                self.systems.pump_n_times(task.pump_id, doses)?;
            }
        }

        let record = StepRecord {
            pump_id: task.pump_id,
            timestamp: self.clock.now(),
            expected_ph,
            actual_ph,
            did_pump: doses > 0,
            pump_multiplier: doses,
        };
        if self.settings.print_messages {
            info!(
                "pump {}: expected {expected_ph:.2}, measured {actual_ph:.2}, dosed {doses}",
                record.pump_id
            );
        }
        records.push(record);
        if self.settings.record_steps {
            records.save(results_path)?;
        }
        Ok(delay)
    }

    fn reschedule(&self, mut task: PumpTask, delay: Duration, queue: &mut TaskQueue) {
        task.next_tick = self.clock.now() + delay;
        loop {
            if task.next_tick < task.end_time() {
                queue.push(Reverse(task));
                return;
            }
            if !task.advance_phase() {
                if self.settings.print_messages {
                    info!("pump {} finished its phase chain", task.pump_id);
                }
                return;
            }
            task.next_tick = self.clock.now() + task.phase().minimum_delay();
        }
    }

    fn dose_count(&mut self, task: &mut PumpTask, expected_ph: f64, actual_ph: f64) -> u32 {
        if self.adaptive_enabled() {
            task.controller.step(expected_ph, actual_ph)
        } else {
            u32::from(actual_ph < expected_ph)
        }
    }

    /// Single-dose control until the configured number of hours has passed;
    /// a threshold of zero or less turns the adaptive controller on from
    /// the first tick.
    fn adaptive_enabled(&self) -> bool {
        let hours = self.settings.adaptive_after_hours;
        if hours <= 0.0 {
            return true;
        }
        self.start_time + Duration::from_secs_f64(hours * 3600.0) < self.clock.now()
    }

    /// Doses every vessel sitting below its phase-0 start pH, polling once
    /// a minute, until none is. Read errors surface to the operator here;
    /// unlike the main loop there is no trajectory to fall behind yet.
    fn precondition(&mut self, recipe: &Recipe) -> TypedResult<()> {
        info!("dosing all vessels up to their start pH before the run begins");
        let factor = self.settings.precondition_pump_factor;
        loop {
            let mut any_below = false;
            for plan in &recipe.vessels {
                let target = plan.phases[0].ph_start;
                let measured = self.systems.measure_ph_for_task(&plan.probe)?;
                if self.settings.print_messages {
                    info!(
                        "pump {}: measured {measured:.2}, start target {target:.2}",
                        plan.pump_id
                    );
                }
                if measured < target {
                    any_below = true;
                    for _ in 0..factor {
                        self.systems.pump(plan.pump_id)?;
                    }
                }
            }
            if !any_below {
                info!("all vessels at or above their start pH");
                return Ok(());
            }
            self.clock.sleep(PRECONDITION_POLL);
        }
    }
}

fn default_controller() -> Controller {
    Controller::WindowedDerivative(WindowedDerivative::new())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    use itertools::Itertools;

    use phstat_core::clock::{Clock, MockClock};
    use phstat_core::config::SchedulerSettings;
    use phstat_core::error::TypedResult;
    use phstat_core::facade::PhysicalSystems;
    use phstat_core::probe::ProbeId;
    use phstat_core::problem;
    use phstat_core::recipe::Recipe;
    use phstat_core::record::RunRecords;

    use crate::pause::KeypressSignal;

    use super::Scheduler;

    /// Simulated rig: each probe reads the pH of its vessel, each dose
    /// raises it by a fixed step. Every bus operation is logged in order.
    #[derive(Default)]
    struct MockRig {
        vessels: HashMap<ProbeId, f64>,
        pump_to_probe: HashMap<u8, ProbeId>,
        dose_effect: f64,
        fail_next_reads: u32,
        ops: Arc<Mutex<Vec<String>>>,
    }

    impl MockRig {
        fn for_recipe(recipe: &Recipe, initial_ph: f64, dose_effect: f64) -> Self {
            let mut rig = Self {
                dose_effect,
                ..Self::default()
            };
            for plan in &recipe.vessels {
                rig.vessels.insert(plan.probe, initial_ph);
                rig.pump_to_probe.insert(plan.pump_id, plan.probe);
            }
            rig
        }

        fn ph_of(&self, probe: &str) -> f64 {
            self.vessels[&probe.parse::<ProbeId>().unwrap()]
        }
    }

    impl PhysicalSystems for MockRig {
        fn initialize(&mut self) -> TypedResult<()> {
            Ok(())
        }

        fn initialize_pumps_used_in_protocol(&mut self, _recipe: &Recipe) -> TypedResult<()> {
            self.ops.lock().unwrap().push("configure".into());
            Ok(())
        }

        fn current_pump_address(&mut self) -> TypedResult<String> {
            Ok("1".into())
        }

        fn assign_pump_address(&mut self, address: u8) -> TypedResult<String> {
            Ok(address.to_string())
        }

        fn mv_of_selected_probes(
            &mut self,
            probes: &[ProbeId],
        ) -> TypedResult<BTreeMap<ProbeId, f64>> {
            Ok(probes.iter().map(|p| (*p, 0.0)).collect())
        }

        fn ph_of_selected_probes(
            &mut self,
            probes: &[ProbeId],
        ) -> TypedResult<BTreeMap<ProbeId, f64>> {
            Ok(probes.iter().map(|p| (*p, self.vessels[p])).collect())
        }

        fn measure_ph_for_task(&mut self, probe: &ProbeId) -> TypedResult<f64> {
            if self.fail_next_reads > 0 {
                self.fail_next_reads -= 1;
                self.ops.lock().unwrap().push(format!("measure {probe} FAILED"));
                problem!(ReadFailure, "scripted read failure");
            }
            self.ops.lock().unwrap().push(format!("measure {probe}"));
            Ok(self.vessels[probe])
        }

        fn pump(&mut self, pump_id: u8) -> TypedResult<()> {
            self.pump_n_times(pump_id, 1)
        }

        fn pump_n_times(&mut self, pump_id: u8, count: u32) -> TypedResult<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("pump {pump_id} x{count}"));
            let probe = self.pump_to_probe[&pump_id];
            *self.vessels.get_mut(&probe).unwrap() += self.dose_effect * f64::from(count);
            Ok(())
        }

        fn set_pump_dose_multiplier(&mut self, _recipe: &Recipe, _factor: u32) -> TypedResult<()> {
            Ok(())
        }

        fn recalibrate(&mut self) -> TypedResult<()> {
            Ok(())
        }

        fn disconnect(&mut self, _recipe: &Recipe) -> TypedResult<()> {
            self.ops.lock().unwrap().push("disconnect".into());
            Ok(())
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            print_messages: false,
            record_steps: false,
            calibration_data_path: "calibration_data.yml".into(),
            precondition: false,
            precondition_pump_factor: 3,
            adaptive_after_hours: 1e6, // single-dose control unless a test opts in
        }
    }

    fn write_recipe(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("run.csv");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const TWO_VESSELS: &str = "\
Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay
1,1,F.0.1.22_1,60,6.5,7.0,50,1
2,1,F.0.1.22_2,60,6.5,7.0,50,1
";

    const TWO_PHASES: &str = "\
Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay
1,1,F.0.1.22_1,60,6.5,7.0,50,1,30,7.0,7.2,50,1
";

    fn start_run(
        sheet: &str,
        settings: SchedulerSettings,
        initial_ph: f64,
    ) -> (RunRecords, MockRig, Arc<MockClock>) {
        let dir = tempfile::tempdir().unwrap();
        let recipe_path = write_recipe(dir.path(), sheet);
        let recipe = Recipe::load(&recipe_path).unwrap();
        let mut rig = MockRig::for_recipe(&recipe, initial_ph, 0.01);
        let clock = MockClock::starting_at(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let records = {
            let mut scheduler = Scheduler::new(
                settings,
                &mut rig,
                clock.clone(),
                KeypressSignal::disarmed(),
            );
            scheduler.start(&recipe_path).unwrap().0
        };
        (records, rig, clock)
    }

    #[test]
    fn records_track_the_trajectory_for_every_vessel() {
        let (records, _rig, _clock) = start_run(TWO_VESSELS, settings(), 6.5);

        for pump in [1u8, 2] {
            let rows: Vec<_> = records.for_pump(pump).collect();
            assert!(rows.len() >= 50, "pump {pump} only ticked {} times", rows.len());

            for (a, b) in rows.iter().tuple_windows() {
                // Time moves strictly forward per task.
                assert!(a.timestamp < b.timestamp);
                // The target trajectory ramps strictly upward.
                assert!(a.expected_ph < b.expected_ph);
                // The vessel only moves when its pump fires.
                if a.did_pump {
                    assert!(a.actual_ph < b.actual_ph);
                } else {
                    assert_eq!(a.actual_ph, b.actual_ph);
                }
            }
            for row in &rows {
                assert!(
                    (row.actual_ph - row.expected_ph).abs() < 0.2,
                    "pump {pump} drifted: expected {}, measured {}",
                    row.expected_ph,
                    row.actual_ph
                );
            }
        }
    }

    #[test]
    fn simultaneous_ticks_run_in_pump_order_without_interleaving() {
        let (_records, rig, _clock) = start_run(TWO_VESSELS, settings(), 6.4);

        let ops = rig.ops.lock().unwrap();
        // Both vessels start below target and share every tick time. The
        // first round must be measure 1, dose 1, measure 2, dose 2: pump-id
        // order with vessel 1's whole tick finished before vessel 2 starts.
        let bus: Vec<&str> = ops
            .iter()
            .map(String::as_str)
            .filter(|op| op.starts_with("measure") || op.starts_with("pump"))
            .collect();
        assert_eq!(
            &bus[..4],
            [
                "measure F.0.1.22_1",
                "pump 1 x1",
                "measure F.0.1.22_2",
                "pump 2 x1"
            ]
        );
        // Every later round keeps the same strict alternation.
        let measures: Vec<&&str> = bus.iter().filter(|op| op.starts_with("measure")).collect();
        for pair in measures.chunks(2) {
            assert_eq!(*pair[0], "measure F.0.1.22_1");
            assert_eq!(*pair[1], "measure F.0.1.22_2");
        }
    }

    #[test]
    fn chained_phases_span_the_sum_of_their_durations() {
        let (records, _rig, _clock) = start_run(TWO_PHASES, settings(), 6.5);

        let rows: Vec<_> = records.for_pump(1).collect();
        let span = rows
            .last()
            .unwrap()
            .timestamp
            .duration_since(rows.first().unwrap().timestamp)
            .unwrap();
        let total = Duration::from_secs((60 + 30) * 60);
        let tolerance = Duration::from_secs(60); // one minimum delay
        assert!(span + tolerance >= total && span <= total + tolerance, "span {span:?}");
        // The second phase's trajectory continues where the first ended.
        assert!(rows.iter().any(|r| r.expected_ph > 7.0));
    }

    #[test]
    fn failed_reads_record_nan_and_retry_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let recipe_path = write_recipe(
            dir.path(),
            "Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay\n1,1,F.0.1.22_1,5,6.5,6.6,50,1\n",
        );
        let recipe = Recipe::load(&recipe_path).unwrap();
        let mut rig = MockRig::for_recipe(&recipe, 6.5, 0.01);
        rig.fail_next_reads = 2;
        let clock = MockClock::starting_at(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let records = {
            let mut scheduler = Scheduler::new(
                settings(),
                &mut rig,
                clock.clone(),
                KeypressSignal::disarmed(),
            );
            scheduler.start(&recipe_path).unwrap().0
        };

        let rows: Vec<_> = records.for_pump(1).collect();
        assert!(rows[0].actual_ph.is_nan());
        assert!(!rows[0].did_pump);
        assert!(rows[1].actual_ph.is_nan());
        // The retry happened on the fast path, not a whole minimum delay later.
        let gap = rows[1].timestamp.duration_since(rows[0].timestamp).unwrap();
        assert_eq!(gap, Duration::from_secs(10));
        // After the fault clears the run continues normally.
        assert!(!rows[2].actual_ph.is_nan());
    }

    #[test]
    fn adaptive_gate_switches_controllers_after_the_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let recipe_path = write_recipe(dir.path(), TWO_VESSELS);
        let recipe = Recipe::load(&recipe_path).unwrap();
        let mut rig = MockRig::for_recipe(&recipe, 6.5, 0.01);
        let clock = MockClock::starting_at(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let mut config = settings();
        config.adaptive_after_hours = 1.2;
        let mut scheduler = Scheduler::new(
            config,
            &mut rig,
            clock.clone(),
            KeypressSignal::disarmed(),
        );

        let mut task = phstat_core::task::PumpTask::from_plan(
            &recipe.vessels[0],
            clock.now(),
            super::default_controller(),
        );

        assert!(!scheduler.adaptive_enabled());
        // Far below target, the single-dose gate still pumps exactly once.
        assert_eq!(scheduler.dose_count(&mut task, 7.0, 1.0), 1);

        clock.advance(Duration::from_secs(3600));
        assert!(!scheduler.adaptive_enabled());

        clock.advance(Duration::from_secs(1800));
        assert!(scheduler.adaptive_enabled());
        assert_eq!(scheduler.dose_count(&mut task, 7.0, 1.0), 1);
        assert_eq!(scheduler.dose_count(&mut task, 7.0, 8.0), 0);

        // A zero threshold means adaptive from the very first tick.
        let mut config = settings();
        config.adaptive_after_hours = 0.0;
        let scheduler = Scheduler::new(
            config,
            &mut rig,
            clock.clone(),
            KeypressSignal::disarmed(),
        );
        assert!(scheduler.adaptive_enabled());
    }

    #[test]
    fn precondition_doses_until_every_vessel_reaches_its_start_ph() {
        let dir = tempfile::tempdir().unwrap();
        let recipe_path = write_recipe(
            dir.path(),
            "Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay\n1,1,F.0.1.22_1,2,6.5,6.6,50,1\n",
        );
        let recipe = Recipe::load(&recipe_path).unwrap();
        // 0.05 pH per dose, factor 3: 6.0 -> 6.15 -> ... -> 6.6 in 4 rounds.
        let mut rig = MockRig::for_recipe(&recipe, 6.0, 0.05);
        let clock = MockClock::starting_at(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let mut config = settings();
        config.precondition = true;
        let records = {
            let mut scheduler = Scheduler::new(
                config,
                &mut rig,
                clock.clone(),
                KeypressSignal::disarmed(),
            );
            scheduler.start(&recipe_path).unwrap().0
        };

        // The run's first real measurement starts at or above the target.
        assert!(records.first().unwrap().actual_ph >= 6.5);
        let singles = rig
            .ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| *op == "pump 1 x1")
            .count();
        assert_eq!(singles, 12, "four polling rounds of three doses each");
    }

    #[test]
    fn restart_resumes_the_second_phase_at_the_recorded_offset() {
        let dir = tempfile::tempdir().unwrap();

        // Phase 0 alone, run to completion: this is the state a crash at the
        // end of the first phase leaves behind.
        let phase0_path = write_recipe(
            dir.path(),
            "Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay\n1,1,F.0.1.22_1,60,6.5,7.0,50,1\n",
        );
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = MockClock::starting_at(start);
        let recipe = Recipe::load(&phase0_path).unwrap();
        // Already at the ramp's end value: no pump fires during phase 0 or
        // between the crash and the resume, which is the restart-fidelity
        // precondition.
        let mut rig = MockRig::for_recipe(&recipe, 7.0, 0.01);
        let (records, results_path) = {
            let mut scheduler = Scheduler::new(
                settings(),
                &mut rig,
                clock.clone(),
                KeypressSignal::disarmed(),
            );
            scheduler.start(&phase0_path).unwrap()
        };
        let pre_crash = records.len();
        let last_ph = records.last_for(1).unwrap().actual_ph;
        let vessel_ph = rig.ph_of("F.0.1.22_1");

        // Resume against the full two-phase recipe.
        let full_path = dir.path().join("full.csv");
        std::fs::write(&full_path, TWO_PHASES).unwrap();
        let full_recipe = Recipe::load(&full_path).unwrap();
        let mut rig = MockRig::for_recipe(&full_recipe, vessel_ph, 0.01);
        let resumed = {
            let mut scheduler = Scheduler::new(
                settings(),
                &mut rig,
                clock.clone(),
                KeypressSignal::disarmed(),
            );
            scheduler.restart(&full_path, &results_path).unwrap().0
        };

        let rows: Vec<_> = resumed.for_pump(1).collect();
        assert!(rows.len() > pre_crash);
        let first_resumed = rows[pre_crash];
        // The second phase picks up exactly one phase-0 duration after the
        // original start.
        assert_eq!(
            first_resumed.timestamp,
            start + Duration::from_secs(60 * 60)
        );
        // No pump fired in between, so the measurement carries straight over.
        assert_eq!(first_resumed.actual_ph, last_ph);
        // The resumed trajectory belongs to the second phase.
        assert!(first_resumed.expected_ph >= 7.0);
    }

    #[test]
    fn results_sheet_is_rewritten_every_step_when_recording_is_on() {
        let dir = tempfile::tempdir().unwrap();
        let recipe_path = write_recipe(
            dir.path(),
            "Pump,On/off,pH probe,Step,pH start,pH end,Dose vol.,Force delay\n1,1,F.0.1.22_1,3,6.5,6.6,50,1\n",
        );
        let recipe = Recipe::load(&recipe_path).unwrap();
        let mut rig = MockRig::for_recipe(&recipe, 6.5, 0.01);
        let clock = MockClock::starting_at(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let mut config = settings();
        config.record_steps = true;
        let (records, results_path) = {
            let mut scheduler = Scheduler::new(
                config,
                &mut rig,
                clock.clone(),
                KeypressSignal::disarmed(),
            );
            scheduler.start(&recipe_path).unwrap()
        };
        let persisted = RunRecords::load(&results_path).unwrap();
        assert_eq!(persisted.len(), records.len());
    }
}
