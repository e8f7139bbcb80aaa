//! The scheduled control loop.
//!
//! One task owns the run: it revalidates the configs, composes overrides,
//! then walks the stages. Inside a stage it sleeps until the next timer
//! deadline and processes every event at that tick — measurers first,
//! then fusion, then effectors, then the stage-end marker — so a tick is
//! atomic with respect to timer ordering. Measurers reschedule from their
//! scheduled time, not from now, so periods do not drift.

use crate::drivers::DriverRegistry;
use crate::error::ProcessError;
use crate::events::{ShutdownReason, StatusMessage, StatusSink};
use crate::overrides;
use crate::state::{RunState, TimerEvent};
use crate::types::*;
use crate::validate::{self, ValidatedConfig};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a run ended. `Complete` has parked every active effector at its
/// shutdown setting; the safety, process-error, and cancellation paths
/// have parked every effector.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Complete,
    ValidationFailed { message: String },
    ProcessFailed { message: String },
    Safety { variable: String, value: f64 },
    /// The host dropped the status queue receiver.
    Cancelled,
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunOutcome::Complete)
    }
}

/// Why the stage loop stopped early.
enum Interrupt {
    Safety { variable: String, value: f64 },
    Process(ProcessError),
    Cancelled,
}

impl From<ProcessError> for Interrupt {
    fn from(error: ProcessError) -> Self {
        Interrupt::Process(error)
    }
}

/// Owns the driver registry and runs one process at a time to completion.
pub struct ProcessEngine {
    drivers: DriverRegistry,
}

impl ProcessEngine {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self { drivers }
    }

    pub fn drivers_mut(&mut self) -> &mut DriverRegistry {
        &mut self.drivers
    }

    pub fn into_drivers(self) -> DriverRegistry {
        self.drivers
    }

    /// Execute a machine + process config pair, emitting status messages
    /// to `sink` until the run ends.
    pub async fn run(
        &mut self,
        machine: &Value,
        process: &Value,
        sink: &StatusSink,
    ) -> RunOutcome {
        if sink.send(StatusMessage::Start).is_err() {
            return RunOutcome::Cancelled;
        }

        let validated = match validate::validate_config(machine, process, &self.drivers) {
            Ok(validated) => validated,
            Err(error) => {
                let message = error.to_string();
                warn!(%message, "validation failed");
                let _ = sink.send(StatusMessage::Shutdown(ShutdownReason::ValidationError {
                    message: message.clone(),
                }));
                return RunOutcome::ValidationFailed { message };
            }
        };
        if sink.send(StatusMessage::ValidationOk).is_err() {
            return RunOutcome::Cancelled;
        }

        let mut run = ActiveRun::new(&mut self.drivers, sink, validated);
        let result = run.execute().await;
        match &result {
            Ok(()) => run.drive_active_to_shutdown(),
            Err(_) => run.drive_all_to_shutdown(),
        }

        match result {
            Ok(()) => {
                info!("run complete");
                let _ = sink.send(StatusMessage::Shutdown(ShutdownReason::Complete));
                RunOutcome::Complete
            }
            Err(Interrupt::Safety { variable, value }) => {
                warn!(variable = %variable, value, "safety trip");
                let _ = sink.send(StatusMessage::Shutdown(ShutdownReason::Safety {
                    variable: variable.clone(),
                    value,
                }));
                RunOutcome::Safety { variable, value }
            }
            Err(Interrupt::Process(error)) => {
                let message = error.to_string();
                warn!(%message, "process error");
                let _ = sink.send(StatusMessage::Shutdown(ShutdownReason::ProcessError {
                    message: message.clone(),
                }));
                RunOutcome::ProcessFailed { message }
            }
            Err(Interrupt::Cancelled) => {
                info!("run cancelled by host");
                RunOutcome::Cancelled
            }
        }
    }
}

/// State of one in-flight run.
struct ActiveRun<'a> {
    drivers: &'a mut DriverRegistry,
    sink: &'a StatusSink,
    /// Post-process-override machine, decoded.
    working: MachineSpec,
    /// Post-process-override machine, raw — the base for stage overrides.
    working_tree: JsonMap,
    process: ProcessSpec,
    /// The machine the current stage runs on.
    current: MachineSpec,
    state: RunState,
    start: Instant,
}

impl<'a> ActiveRun<'a> {
    fn new(drivers: &'a mut DriverRegistry, sink: &'a StatusSink, validated: ValidatedConfig) -> Self {
        let state = RunState::new(&validated.working);
        Self {
            drivers,
            sink,
            current: validated.working.clone(),
            working: validated.working,
            working_tree: validated.working_tree,
            process: validated.process,
            state,
            start: Instant::now(),
        }
    }

    async fn execute(&mut self) -> Result<(), Interrupt> {
        let stages = self.process.stages.clone();
        for (index, stage) in stages.iter().enumerate() {
            self.emit(StatusMessage::StageInit { stage: index })?;
            info!(stage = index, name = %stage.name, "stage init");

            let machine = self.compose_stage(index, stage)?;
            for (variable, target) in &stage.variable_targets {
                if let Some(vs) = self.state.variables.get_mut(variable) {
                    vs.target = Some(*target);
                }
            }

            if matches!(stage.end, StageEnd::Shutdown) {
                self.current = machine;
                return Ok(());
            }

            self.stage_setup(&machine, stage)?;
            self.current = machine;
            loop {
                if self.step(stage).await? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Deep-copy the working machine, apply the stage override, decode.
    /// The composition was already validated, so a failure here is an
    /// internal invariant break, not a config error.
    fn compose_stage(&self, index: usize, stage: &StageSpec) -> Result<MachineSpec, Interrupt> {
        let Some(patch) = &stage.overrides else {
            return Ok(self.working.clone());
        };
        let tree = overrides::compose(&self.working_tree, patch, "")
            .map_err(|source| ProcessError::StageDecode { stage: index, source })?;
        let spec = validate::decode_machine("", &tree)
            .map_err(|source| ProcessError::StageDecode { stage: index, source })?;
        Ok(spec)
    }

    /// Compute the stage's initial timer wheel and drive the immediate
    /// effector writes.
    fn stage_setup(&mut self, machine: &MachineSpec, stage: &StageSpec) -> Result<(), Interrupt> {
        let step = self.state.step_ms;

        if stage.recalculate_timers {
            self.state.wheel.clear();
            self.state.pid.clear();
        } else {
            // carry phases across the boundary for anything still active
            self.state.wheel.retain(|event| match event {
                TimerEvent::Measure(key) => {
                    machine.measurers.get(key).is_some_and(|m| m.active)
                }
                TimerEvent::Effect(key) => machine
                    .effectors
                    .get(key)
                    .is_some_and(|e| e.active && !e.law.is_static()),
                TimerEvent::StageEnd => false,
            });
        }

        for vs in self.state.variables.values_mut() {
            vs.feeders.clear();
        }
        for (key, measurer) in &machine.measurers {
            if !measurer.active {
                continue;
            }
            if let Some(vs) = self.state.variables.get_mut(&measurer.variable) {
                if !vs.feeders.contains(key) {
                    vs.feeders.push(key.clone());
                }
            }
            let event = TimerEvent::Measure(key.clone());
            if !self.state.wheel.is_scheduled(&event) {
                self.state.wheel.schedule(step + measurer.offset_ms, event);
            }
        }

        for (key, effector) in &machine.effectors {
            if effector.law.is_static() {
                let value = stage
                    .effector_settings
                    .get(key)
                    .copied()
                    .unwrap_or(effector.shutdown_setting);
                self.drivers.effect(&effector.driver_key, value)?;
                self.state.last_write_ms.insert(key.clone(), step);
            } else if !effector.active {
                self.drivers
                    .effect(&effector.driver_key, effector.shutdown_setting)?;
            } else {
                let event = TimerEvent::Effect(key.clone());
                if !self.state.wheel.is_scheduled(&event) {
                    self.state.wheel.schedule(step + effector.offset_ms, event);
                }
            }
        }

        if let StageEnd::Time(after) = stage.end {
            self.state.wheel.schedule(step + after, TimerEvent::StageEnd);
        }
        Ok(())
    }

    /// One tick: sleep to the next deadline, then measure → fuse →
    /// actuate → test stage end. Returns true when the stage is over.
    async fn step(&mut self, stage: &StageSpec) -> Result<bool, Interrupt> {
        let Some(tick) = self.state.wheel.next_deadline() else {
            return Err(Interrupt::Process(ProcessError::EmptyWheel));
        };
        if self.sink.is_closed() {
            return Err(Interrupt::Cancelled);
        }
        self.sleep_until(tick).await;
        self.state.step_ms = tick;

        let events = self.state.wheel.pop_due(tick);
        debug!(tick, events = events.len(), "tick");

        let mut dirty: BTreeSet<String> = BTreeSet::new();
        let mut effector_queue: BTreeSet<String> = BTreeSet::new();
        let mut end_fired = false;

        for event in events {
            match event {
                TimerEvent::Measure(key) => {
                    let Some(measurer) = self.current.measurers.get(&key) else {
                        return Err(Interrupt::Process(ProcessError::UnknownEvent {
                            kind: "measurer",
                            key,
                        }));
                    };
                    let driver_key = measurer.driver_key.clone();
                    let variable = measurer.variable.clone();
                    let iterate = measurer.iterate_ms;
                    let reading = self.drivers.measure(&driver_key)?;
                    if let Some(ms) = self.state.measurers.get_mut(&key) {
                        ms.last = Some(reading);
                    }
                    dirty.insert(variable);
                    // reschedule from the scheduled time so the period holds
                    self.state
                        .wheel
                        .schedule(tick + iterate, TimerEvent::Measure(key));
                }
                TimerEvent::Effect(key) => {
                    effector_queue.insert(key);
                }
                TimerEvent::StageEnd => end_fired = true,
            }
        }

        self.fuse_dirty_variables(&dirty)?;
        self.evaluate_effectors(tick, &dirty, &effector_queue)?;

        let ended = match &stage.end {
            StageEnd::Time(_) | StageEnd::Shutdown => end_fired,
            StageEnd::Target(conditions) => {
                end_fired
                    || conditions.iter().all(|(variable, condition)| {
                        // an unmeasured variable cannot satisfy a target
                        self.state
                            .variables
                            .get(variable)
                            .and_then(|vs| vs.value)
                            .is_some_and(|value| match condition.comparator {
                                Comparator::Above => value >= condition.threshold as f64,
                                Comparator::Below => value <= condition.threshold as f64,
                            })
                    })
            }
        };
        Ok(ended)
    }

    /// Combine the latest readings of each dirty variable's feeders and
    /// run the safety check on the fused value.
    fn fuse_dirty_variables(&mut self, dirty: &BTreeSet<String>) -> Result<(), Interrupt> {
        for variable in dirty {
            let Some(spec) = self.current.variables.get(variable) else {
                continue;
            };
            let mixing = spec.sensor_mixing;
            let shutdown_range = spec.shutdown_range;
            let safe_range = spec.safe_range;

            let readings: Vec<i64> = match self.state.variables.get(variable) {
                Some(vs) => vs
                    .feeders
                    .iter()
                    .filter_map(|m| self.state.measurers.get(m).and_then(|s| s.last))
                    .collect(),
                None => continue,
            };
            let fused = match readings.as_slice() {
                [] => continue,
                [only] => *only as f64,
                many => match mixing {
                    Some(SensorMixing::Min) => many.iter().min().copied().unwrap_or(0) as f64,
                    Some(SensorMixing::Max) => many.iter().max().copied().unwrap_or(0) as f64,
                    Some(SensorMixing::Avg) => {
                        many.iter().sum::<i64>() as f64 / many.len() as f64
                    }
                    None => {
                        return Err(Interrupt::Process(ProcessError::MixingUnset(
                            variable.clone(),
                        )))
                    }
                },
            };
            if let Some(vs) = self.state.variables.get_mut(variable) {
                vs.value = Some(fused);
            }

            if let Some((low, high)) = shutdown_range {
                if fused < low as f64 || fused > high as f64 {
                    return Err(Interrupt::Safety {
                        variable: variable.clone(),
                        value: fused,
                    });
                }
            }
            if let Some((low, high)) = safe_range {
                if fused < low as f64 || fused > high as f64 {
                    warn!(variable = %variable, value = fused, "reading outside safe range");
                }
            }
        }
        Ok(())
    }

    /// Evaluate every effector that either had a scheduled event this tick
    /// or whose control variable just updated, honoring the write lockout.
    fn evaluate_effectors(
        &mut self,
        tick: Millis,
        dirty: &BTreeSet<String>,
        effector_queue: &BTreeSet<String>,
    ) -> Result<(), Interrupt> {
        for (key, effector) in &self.current.effectors {
            if effector.law.is_static() || !effector.active {
                continue;
            }
            let scheduled = effector_queue.contains(key);
            let input_updated = effector
                .law
                .control_variable()
                .is_some_and(|variable| dirty.contains(variable));
            if !scheduled && !input_updated {
                continue;
            }

            if let Some(delay) = effector.min_change_delay_ms {
                if let Some(&last) = self.state.last_write_ms.get(key) {
                    if tick < last + delay {
                        // locked out: defer to the moment the lockout ends
                        let event = TimerEvent::Effect(key.clone());
                        if !self.state.wheel.is_scheduled(&event) {
                            self.state.wheel.schedule(last + delay, event);
                        }
                        continue;
                    }
                }
            }

            let Some(output) = effector_output(
                &effector.law,
                key,
                tick,
                &self.state.variables,
                &mut self.state.pid,
            ) else {
                continue;
            };
            self.drivers.effect(&effector.driver_key, output)?;
            self.state.last_write_ms.insert(key.clone(), tick);
            if let Some(delay) = effector.min_change_delay_ms {
                let event = TimerEvent::Effect(key.clone());
                if !self.state.wheel.is_scheduled(&event) {
                    self.state.wheel.schedule(tick + delay, event);
                }
            }
        }
        Ok(())
    }

    /// Normal termination: every active effector to its shutdown setting.
    fn drive_active_to_shutdown(&mut self) {
        self.write_shutdown_settings(|effector| effector.active);
    }

    /// The safety, process-error, and cancellation exit: every effector,
    /// active or not.
    fn drive_all_to_shutdown(&mut self) {
        self.write_shutdown_settings(|_| true);
    }

    fn write_shutdown_settings(&mut self, include: impl Fn(&EffectorSpec) -> bool) {
        for effector in self.current.effectors.values() {
            if !include(effector) {
                continue;
            }
            if let Err(error) = self
                .drivers
                .effect(&effector.driver_key, effector.shutdown_setting)
            {
                warn!(%error, effector = %effector.name, "shutdown write failed");
            }
        }
    }

    fn emit(&self, message: StatusMessage) -> Result<(), Interrupt> {
        self.sink.send(message).map_err(|_| Interrupt::Cancelled)
    }

    async fn sleep_until(&self, at_ms: Millis) {
        let deadline = self.start + Duration::from_millis(at_ms);
        tokio::time::sleep_until(deadline).await;
    }
}

/// Apply an effector's control law. `None` means the law's inputs are not
/// ready yet (no fused value, or no target for PID) and nothing is written.
fn effector_output(
    law: &ControlLaw,
    key: &str,
    tick: Millis,
    variables: &std::collections::BTreeMap<String, crate::state::VariableState>,
    pid: &mut std::collections::BTreeMap<String, crate::state::PidState>,
) -> Option<i64> {
    let value_of = |variable: &str| variables.get(variable).and_then(|v| v.value);
    match law {
        ControlLaw::Static => None,
        ControlLaw::Binary {
            variable,
            threshold,
        } => Some(if value_of(variable)? > *threshold as f64 {
            1
        } else {
            0
        }),
        ControlLaw::BinaryInverted {
            variable,
            threshold,
        } => Some(if value_of(variable)? > *threshold as f64 {
            0
        } else {
            1
        }),
        ControlLaw::Lookup {
            mode,
            variable,
            table,
        } => Some(lookup_output(*mode, table, value_of(variable)?)),
        ControlLaw::Pid {
            variable,
            kp,
            ki,
            kd,
        } => {
            let measured = value_of(variable)?;
            let target = variables.get(variable)?.target? as f64;
            let state = pid.entry(key.to_string()).or_default();
            let error = target - measured;
            let dt = state
                .prev_eval_ms
                .map(|prev| (tick - prev) as f64 / 1000.0)
                .unwrap_or(0.0);
            if dt > 0.0 {
                state.integral += error * dt;
            }
            let derivative = match (state.prev_error, dt > 0.0) {
                (Some(prev), true) => (error - prev) / dt,
                _ => 0.0,
            };
            state.prev_error = Some(error);
            state.prev_eval_ms = Some(tick);
            let output =
                *kp as f64 * error + *ki as f64 * state.integral + *kd as f64 * derivative;
            Some(output.round() as i64)
        }
    }
}

/// Table search for the lookup laws. The table is non-empty and sorted by
/// input key.
fn lookup_output(mode: LookupMode, table: &[(i64, i64)], value: f64) -> i64 {
    match mode {
        // largest input key at or below the value, else the smallest entry
        LookupMode::Min => table
            .iter()
            .rev()
            .find(|(input, _)| (*input as f64) <= value)
            .or_else(|| table.first())
            .map(|(_, out)| *out)
            .unwrap_or(0),
        // smallest input key at or above the value, else the largest entry
        LookupMode::Max => table
            .iter()
            .find(|(input, _)| (*input as f64) >= value)
            .or_else(|| table.last())
            .map(|(_, out)| *out)
            .unwrap_or(0),
        // nearest input key, ties resolved toward the lower key
        LookupMode::Closest => {
            let mut best: Option<(f64, i64)> = None;
            for (input, out) in table {
                let distance = (*input as f64 - value).abs();
                if best.is_none_or(|(d, _)| distance < d) {
                    best = Some((distance, *out));
                }
            }
            best.map(|(_, out)| out).unwrap_or(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StatusMessage as Msg;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    type Writes = Arc<Mutex<Vec<(Instant, i64)>>>;

    fn recorder() -> (Writes, impl FnMut(i64) + Send + 'static) {
        let writes: Writes = Arc::new(Mutex::new(Vec::new()));
        let inner = writes.clone();
        (writes, move |v| {
            inner.lock().unwrap().push((Instant::now(), v));
        })
    }

    fn machine(effector: serde_json::Value) -> serde_json::Value {
        json!({
            "name": "Rig",
            "variables": {
                "Heat": {
                    "name": "Heat",
                    "visible": true,
                    "shutdownRange": [-50, 130]
                }
            },
            "measurers": {
                "HeatSensor": {
                    "name": "HeatSensor",
                    "variable": "Heat",
                    "driverKey": "heat_measure",
                    "iterateMS": 10,
                    "active": true
                }
            },
            "effectors": {"Heater": effector}
        })
    }

    fn binary_heater() -> serde_json::Value {
        json!({
            "name": "Heater",
            "driverKey": "heat_effect",
            "controlType": "binary",
            "controlVariable": "Heat",
            "controlBinaryThreshold": 50,
            "shutdownSetting": 0,
            "active": true
        })
    }

    fn time_process(timer: u64) -> serde_json::Value {
        json!({
            "name": "Brew",
            "forMachine": "Rig",
            "stages": {
                "0": {"name": "hold", "stageEndControl": "time", "stageEndTimer": timer}
            }
        })
    }

    async fn run_and_drain(
        drivers: DriverRegistry,
        machine: &serde_json::Value,
        process: &serde_json::Value,
    ) -> (RunOutcome, Vec<Msg>) {
        let mut engine = ProcessEngine::new(drivers);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = engine.run(machine, process, &tx).await;
        drop(tx);
        let mut messages = Vec::new();
        while let Some(msg) = rx.recv().await {
            messages.push(msg);
        }
        (outcome, messages)
    }

    #[tokio::test(start_paused = true)]
    async fn time_stage_runs_to_completion() {
        let reads: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let read_log = reads.clone();
        let (writes, effect) = recorder();
        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", move || {
            read_log.lock().unwrap().push(Instant::now());
            42
        });
        drivers.add_effect("heat_effect", effect);

        let started = Instant::now();
        let (outcome, messages) =
            run_and_drain(drivers, &machine(binary_heater()), &time_process(100)).await;

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(
            messages,
            vec![
                Msg::Start,
                Msg::ValidationOk,
                Msg::StageInit { stage: 0 },
                Msg::Shutdown(ShutdownReason::Complete),
            ]
        );
        // the effector was driven at least once during the stage, plus the
        // shutdown write at the end
        assert!(writes.lock().unwrap().len() >= 2);

        let reads = reads.lock().unwrap();
        assert!(reads.len() >= 10, "got {} reads", reads.len());
        let last = *reads.last().unwrap();
        assert!(last.duration_since(started) >= Duration::from_millis(90));
        // successive polls of one measurer are at least iterateMS apart
        for pair in reads.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn target_stage_ends_on_first_satisfying_tick() {
        let reads = Arc::new(Mutex::new(0i64));
        let counter = reads.clone();
        let mut drivers = DriverRegistry::new();
        // rises 10, 20, 30, 40, ... one step per poll
        drivers.add_measure("heat_measure", move || {
            let mut n = counter.lock().unwrap();
            *n += 10;
            *n
        });
        let (_writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let process = json!({
            "name": "Brew",
            "forMachine": "Rig",
            "stages": {
                "0": {
                    "name": "heat up",
                    "stageEndControl": "target",
                    "stageEndTarget": {"Heat": ["above", 40]}
                }
            }
        });
        let (outcome, messages) =
            run_and_drain(drivers, &machine(binary_heater()), &process).await;

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(
            messages.last(),
            Some(&Msg::Shutdown(ShutdownReason::Complete))
        );
        // polls at t=0,10,20,30 read 10,20,30,40; 40 ≥ 40 ends the stage
        assert_eq!(*reads.lock().unwrap(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn binary_law_tracks_the_threshold() {
        let step = Arc::new(Mutex::new(0usize));
        let counter = step.clone();
        // 30 (below), then 60 (above), then 30 again
        let levels = [30i64, 60, 30];
        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", move || {
            let mut n = counter.lock().unwrap();
            let v = levels[(*n).min(levels.len() - 1)];
            *n += 1;
            v
        });
        let (writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let (outcome, _) =
            run_and_drain(drivers, &machine(binary_heater()), &time_process(25)).await;
        assert_eq!(outcome, RunOutcome::Complete);

        let written: Vec<i64> = writes.lock().unwrap().iter().map(|&(_, v)| v).collect();
        // t=0 → 30 → 0; t=10 → 60 → 1; t=20 → 30 → 0; then shutdown 0
        assert_eq!(written, vec![0, 1, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn min_change_delay_spaces_writes() {
        let mut heater = binary_heater();
        heater["minChangeDelayMS"] = json!(25);
        let flip = Arc::new(Mutex::new(false));
        let state = flip.clone();
        let mut drivers = DriverRegistry::new();
        // alternates across the threshold so every update wants a write
        drivers.add_measure("heat_measure", move || {
            let mut on = state.lock().unwrap();
            *on = !*on;
            if *on {
                100
            } else {
                0
            }
        });
        let (writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let (outcome, _) = run_and_drain(drivers, &machine(heater), &time_process(100)).await;
        assert_eq!(outcome, RunOutcome::Complete);

        let writes = writes.lock().unwrap();
        // ignore the final shutdown write, which is outside the stage
        let in_stage = &writes[..writes.len() - 1];
        assert!(in_stage.len() >= 3);
        for pair in in_stage.windows(2) {
            assert!(
                pair[1].0.duration_since(pair[0].0) >= Duration::from_millis(25),
                "writes only {:?} apart",
                pair[1].0.duration_since(pair[0].0)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_mixing_fuses_readings() {
        for (mixing, expected_first_write) in [("avg", 1i64), ("min", 0), ("max", 1)] {
            let mut m = machine(binary_heater());
            m["variables"]["Heat"]["sensorMixing"] = json!(mixing);
            m["measurers"]["HeatSensor2"] = json!({
                "name": "HeatSensor2",
                "variable": "Heat",
                "driverKey": "heat_measure_2",
                "iterateMS": 10,
                "active": true
            });
            // threshold 50: readings 40 and 80 → avg 60 → 1, min 40 → 0, max 80 → 1
            let mut drivers = DriverRegistry::new();
            drivers.add_measure("heat_measure", || 40);
            drivers.add_measure("heat_measure_2", || 80);
            let (writes, effect) = recorder();
            drivers.add_effect("heat_effect", effect);

            let (outcome, _) = run_and_drain(drivers, &m, &time_process(15)).await;
            assert_eq!(outcome, RunOutcome::Complete, "mixing {mixing}");
            let first = writes.lock().unwrap()[0].1;
            assert_eq!(first, expected_first_write, "mixing {mixing}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_range_excursion_trips_the_run() {
        let reads = Arc::new(Mutex::new(100i64));
        let counter = reads.clone();
        let mut drivers = DriverRegistry::new();
        // 110, 120, 130, 140 — the last is outside [-50, 130]
        drivers.add_measure("heat_measure", move || {
            let mut n = counter.lock().unwrap();
            *n += 10;
            *n
        });
        let (writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let (outcome, messages) =
            run_and_drain(drivers, &machine(binary_heater()), &time_process(1000)).await;

        assert_eq!(
            outcome,
            RunOutcome::Safety {
                variable: "Heat".into(),
                value: 140.0
            }
        );
        assert_eq!(
            messages.last(),
            Some(&Msg::Shutdown(ShutdownReason::Safety {
                variable: "Heat".into(),
                value: 140.0
            }))
        );
        // the trip still drove the effector to its shutdown setting
        assert_eq!(writes.lock().unwrap().last().unwrap().1, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn static_effectors_take_stage_settings() {
        let mut m = machine(binary_heater());
        m["effectors"]["Pump"] = json!({
            "name": "Pump",
            "driverKey": "pump_control",
            "controlType": "static",
            "shutdownSetting": 0,
            "active": true
        });
        let process = json!({
            "name": "Brew",
            "forMachine": "Rig",
            "stages": {
                "0": {
                    "name": "pump on",
                    "stageEndControl": "time",
                    "stageEndTimer": 20,
                    "effectorSettings": {"Pump": 7}
                },
                "1": {"name": "pump off", "stageEndControl": "time", "stageEndTimer": 20}
            }
        });

        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", || 42);
        let (_heat, heat_effect) = recorder();
        drivers.add_effect("heat_effect", heat_effect);
        let (pump_writes, pump_effect) = recorder();
        drivers.add_effect("pump_control", pump_effect);

        let (outcome, messages) = run_and_drain(drivers, &m, &process).await;
        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(
            messages
                .iter()
                .filter(|m| matches!(m, Msg::StageInit { .. }))
                .count(),
            2
        );

        let pump: Vec<i64> = pump_writes.lock().unwrap().iter().map(|&(_, v)| v).collect();
        // stage 0 setting, stage 1 fallback to shutdownSetting, final shutdown
        assert_eq!(pump, vec![7, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_effector_is_parked_at_shutdown_setting() {
        let mut heater = binary_heater();
        heater["active"] = json!(false);
        heater["shutdownSetting"] = json!(-1);
        let m = machine(heater);

        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", || 42);
        let (writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let (outcome, _) = run_and_drain(drivers, &m, &time_process(30)).await;
        assert_eq!(outcome, RunOutcome::Complete);
        let written: Vec<i64> = writes.lock().unwrap().iter().map(|&(_, v)| v).collect();
        // parked once at stage setup; the completion sweep only touches
        // active effectors, so no second write arrives
        assert_eq!(written, vec![-1]);
    }

    #[tokio::test(start_paused = true)]
    async fn measurer_phase_carries_across_stages() {
        let reads: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let read_log = reads.clone();
        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", move || {
            read_log.lock().unwrap().push(Instant::now());
            42
        });
        let (_writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let process = json!({
            "name": "Brew",
            "forMachine": "Rig",
            "stages": {
                "0": {"name": "a", "stageEndControl": "time", "stageEndTimer": 35},
                "1": {"name": "b", "stageEndControl": "time", "stageEndTimer": 30}
            }
        });
        let started = Instant::now();
        let (outcome, _) = run_and_drain(drivers, &machine(binary_heater()), &process).await;
        assert_eq!(outcome, RunOutcome::Complete);

        let offsets: Vec<u64> = reads
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(started).as_millis() as u64)
            .collect();
        // the 10ms cadence holds straight through the stage boundary at 35
        assert_eq!(offsets, vec![0, 10, 20, 30, 40, 50, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn recalculate_timers_rephases_the_measurer() {
        let reads: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let read_log = reads.clone();
        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", move || {
            read_log.lock().unwrap().push(Instant::now());
            42
        });
        let (_writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let process = json!({
            "name": "Brew",
            "forMachine": "Rig",
            "stages": {
                "0": {"name": "a", "stageEndControl": "time", "stageEndTimer": 35},
                "1": {
                    "name": "b",
                    "stageEndControl": "time",
                    "stageEndTimer": 30,
                    "recalculateTimers": true
                }
            }
        });
        let started = Instant::now();
        let (outcome, _) = run_and_drain(drivers, &machine(binary_heater()), &process).await;
        assert_eq!(outcome, RunOutcome::Complete);

        let offsets: Vec<u64> = reads
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(started).as_millis() as u64)
            .collect();
        // stage 1 discards the pending event at 40 and restarts at 35
        assert_eq!(offsets, vec![0, 10, 20, 30, 35, 45, 55, 65]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stage_terminates_immediately() {
        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", || 42);
        let (writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let process = json!({
            "name": "Brew",
            "forMachine": "Rig",
            "stages": {
                "0": {"name": "hold", "stageEndControl": "time", "stageEndTimer": 20},
                "1": {"name": "done", "stageEndControl": "shutdown"}
            }
        });
        let (outcome, messages) =
            run_and_drain(drivers, &machine(binary_heater()), &process).await;

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(
            messages,
            vec![
                Msg::Start,
                Msg::ValidationOk,
                Msg::StageInit { stage: 0 },
                Msg::StageInit { stage: 1 },
                Msg::Shutdown(ShutdownReason::Complete),
            ]
        );
        assert_eq!(writes.lock().unwrap().last().unwrap().1, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pid_integral_accrues_between_evaluations() {
        let mut m = machine(json!({
            "name": "Heater",
            "driverKey": "heat_effect",
            "controlType": "PID",
            "controlVariable": "Heat",
            "controlPIDConsts": [0, 5, 0],
            "shutdownSetting": 0,
            "active": true
        }));
        m["variables"]["Heat"]["defaultTarget"] = json!(60);
        m["measurers"]["HeatSensor"]["iterateMS"] = json!(100);

        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", || 50);
        let (writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let (outcome, _) = run_and_drain(drivers, &m, &time_process(250)).await;
        assert_eq!(outcome, RunOutcome::Complete);

        let written: Vec<i64> = writes.lock().unwrap().iter().map(|&(_, v)| v).collect();
        // error is a constant 10; with ki=5 the integral term contributes
        // 10·0.1s·5 = 5 more per 100ms evaluation; shutdown write is last
        assert_eq!(written, vec![0, 5, 10, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failure_reports_and_stops() {
        let mut m = machine(binary_heater());
        m["effectors"]["Heater"]["controlType"] = json!("PID");

        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", || 42);
        drivers.add_effect("heat_effect", |_| {});

        let (outcome, messages) = run_and_drain(drivers, &m, &time_process(100)).await;
        assert!(matches!(outcome, RunOutcome::ValidationFailed { .. }));
        assert_eq!(messages.len(), 2);
        assert!(matches!(
            &messages[1],
            Msg::Shutdown(ShutdownReason::ValidationError { message })
                if message.contains("controlPIDConsts")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sink_cancels_the_run() {
        let mut drivers = DriverRegistry::new();
        drivers.add_measure("heat_measure", || 42);
        let (writes, effect) = recorder();
        drivers.add_effect("heat_effect", effect);

        let mut engine = ProcessEngine::new(drivers);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let outcome = engine
            .run(&machine(binary_heater()), &time_process(100_000), &tx)
            .await;
        assert_eq!(outcome, RunOutcome::Cancelled);
        // cancellation before the first tick writes nothing
        assert!(writes.lock().unwrap().is_empty());
    }

    // ── lookup laws ──

    const TABLE: &[(i64, i64)] = &[(0, 10), (50, 20), (100, 30)];

    #[test]
    fn lookup_min_takes_the_floor_entry() {
        assert_eq!(lookup_output(LookupMode::Min, TABLE, 75.0), 20);
        assert_eq!(lookup_output(LookupMode::Min, TABLE, 50.0), 20);
        assert_eq!(lookup_output(LookupMode::Min, TABLE, -5.0), 10);
        assert_eq!(lookup_output(LookupMode::Min, TABLE, 200.0), 30);
    }

    #[test]
    fn lookup_max_takes_the_ceiling_entry() {
        assert_eq!(lookup_output(LookupMode::Max, TABLE, 75.0), 30);
        assert_eq!(lookup_output(LookupMode::Max, TABLE, 50.0), 20);
        assert_eq!(lookup_output(LookupMode::Max, TABLE, -5.0), 10);
        assert_eq!(lookup_output(LookupMode::Max, TABLE, 200.0), 30);
    }

    #[test]
    fn lookup_closest_breaks_ties_toward_the_lower_key() {
        assert_eq!(lookup_output(LookupMode::Closest, TABLE, 75.0), 20);
        assert_eq!(lookup_output(LookupMode::Closest, TABLE, 76.0), 30);
        assert_eq!(lookup_output(LookupMode::Closest, TABLE, 10.0), 10);
        assert_eq!(lookup_output(LookupMode::Closest, TABLE, 1000.0), 30);
    }
}
