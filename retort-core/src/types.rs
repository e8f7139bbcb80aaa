use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A JSON mapping, the shape machine and process configs arrive in.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Milliseconds relative to run start (monotonic).
pub type Millis = u64;

// ─── Machine ──────────────────────────────────────────────────

/// A validated machine config: the static description of the hardware.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub description: Option<String>,
    pub variables: BTreeMap<String, VariableSpec>,
    pub measurers: BTreeMap<String, MeasurerSpec>,
    pub effectors: BTreeMap<String, EffectorSpec>,
}

/// A named physical quantity tracked by the machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub visible: bool,
    /// Normalized `(low, high)` with `low < high`.
    pub safe_range: Option<(i64, i64)>,
    /// Normalized `(low, high)`; a fused value outside it trips the run.
    pub shutdown_range: Option<(i64, i64)>,
    pub sensor_mixing: Option<SensorMixing>,
    pub default_target: Option<i64>,
    pub description: Option<String>,
}

/// How readings from multiple measurers fuse into one variable value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorMixing {
    Min,
    Max,
    Avg,
}

/// A polled sensor bound to one variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurerSpec {
    pub name: String,
    pub variable: String,
    pub driver_key: String,
    /// Period between samples; always positive.
    pub iterate_ms: Millis,
    /// Initial phase relative to stage entry.
    pub offset_ms: Millis,
    pub active: bool,
    pub description: Option<String>,
}

/// An actuator driven by a control law.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectorSpec {
    pub name: String,
    pub driver_key: String,
    /// Written on shutdown, while inactive, and for unset static effectors.
    pub shutdown_setting: i64,
    pub active: bool,
    pub offset_ms: Millis,
    /// Minimum interval between driver writes.
    pub min_change_delay_ms: Option<Millis>,
    pub law: ControlLaw,
    pub description: Option<String>,
}

/// The control law, carrying exactly the fields its kind requires.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ControlLaw {
    /// Written once at stage setup, never re-evaluated.
    Static,
    /// 1 when the control variable exceeds the threshold, else 0.
    Binary { variable: String, threshold: i64 },
    /// 0 when the control variable exceeds the threshold, else 1.
    BinaryInverted { variable: String, threshold: i64 },
    /// Table search keyed on the control variable.
    Lookup {
        mode: LookupMode,
        variable: String,
        /// `(input key, output)` pairs, sorted by input key at decode.
        table: Vec<(i64, i64)>,
    },
    /// Textbook PID against the variable's runtime target.
    Pid {
        variable: String,
        kp: i64,
        ki: i64,
        kd: i64,
    },
}

impl ControlLaw {
    /// The variable whose fused value feeds this law, if any.
    pub fn control_variable(&self) -> Option<&str> {
        match self {
            ControlLaw::Static => None,
            ControlLaw::Binary { variable, .. }
            | ControlLaw::BinaryInverted { variable, .. }
            | ControlLaw::Lookup { variable, .. }
            | ControlLaw::Pid { variable, .. } => Some(variable),
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, ControlLaw::Static)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupMode {
    Min,
    Max,
    Closest,
}

// ─── Process ──────────────────────────────────────────────────

/// A validated process config: the recipe executed against one machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub for_machine: String,
    pub description: Option<String>,
    /// Machine-config patch applied for the whole run.
    pub overrides: Option<JsonMap>,
    /// Dense: stage i came from key `"i"`.
    pub stages: Vec<StageSpec>,
}

/// One step of a process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub description: Option<String>,
    pub end: StageEnd,
    /// Per-variable runtime targets set on stage entry.
    pub variable_targets: BTreeMap<String, i64>,
    /// Per-static-effector values written at stage setup.
    pub effector_settings: BTreeMap<String, i64>,
    /// Machine-config patch applied for this stage only.
    pub overrides: Option<JsonMap>,
    pub recalculate_timers: bool,
}

/// How a stage decides it is finished.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StageEnd {
    /// Ends when every condition is satisfied simultaneously.
    Target(BTreeMap<String, TargetCondition>),
    /// Ends a fixed interval after stage entry.
    Time(Millis),
    /// Terminates the run cleanly on entry.
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCondition {
    pub comparator: Comparator,
    pub threshold: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    /// Satisfied when the fused value is at or above the threshold.
    Above,
    /// Satisfied when the fused value is at or below the threshold.
    Below,
}
