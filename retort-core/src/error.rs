use thiserror::Error;

/// A validation diagnostic: the path being validated plus what went wrong.
///
/// The path is a prefix like `"Stage 2 override: Effector Heater: "` built
/// up as the validator descends; the top level has an empty path.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{path}{kind}")]
pub struct ConfigError {
    pub path: String,
    pub kind: ConfigErrorKind,
}

impl ConfigError {
    pub fn new(path: impl Into<String>, kind: ConfigErrorKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigErrorKind {
    #[error("Expected a mapping for {0}")]
    NotAMapping(&'static str),

    #[error("Invalid keyword: {0}")]
    UnknownKeyword(String),

    #[error("Invalid type for keyword: {keyword}. Expected: {expected} Received: {received}")]
    WrongType {
        keyword: String,
        expected: &'static str,
        received: &'static str,
    },

    #[error("Invalid value for keyword: {0}")]
    EnumViolation(String),

    #[error("Missing required keyword: {0}")]
    MissingKeyword(String),

    #[error("Validation failed for keyword: {keyword}. {hint}")]
    ShapeInvalid {
        keyword: String,
        hint: &'static str,
    },

    #[error("Key {key} does not match name {name}")]
    KeyNameMismatch { key: String, name: String },

    #[error("Namespace collision: {kind} name {name} already used")]
    NamespaceCollision { kind: &'static str, name: String },

    #[error("forMachine '{for_machine}' and machine name '{machine}' do not match")]
    MachineMismatch {
        for_machine: String,
        machine: String,
    },

    #[error("{kind} {name} is not present")]
    MissingReference { kind: &'static str, name: String },

    #[error("Variable {0} has multiple active measurers but no sensorMixing")]
    MixingRequired(String),

    #[error("Invalid override keyword: {0}")]
    BannedOverrideKey(String),

    #[error("effectorSettings targets non-static effector: {0}")]
    NonStaticEffectorSetting(String),

    #[error("Control variable {0} has no active measurer feeding it")]
    NoActiveMeasurer(String),
}

/// An internal invariant broken during execution. Never surfaced for a
/// config problem — those are caught before the run starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessError {
    #[error("timer wheel is empty with the stage still running")]
    EmptyWheel,

    #[error("driver {0} is not registered")]
    UnknownDriver(String),

    #[error("driver {key} is not a {wanted} driver")]
    DriverKind { key: String, wanted: &'static str },

    #[error("stage {stage} config failed to decode after validation: {source}")]
    StageDecode { stage: usize, source: ConfigError },

    #[error("variable {0} has multiple readings but no sensorMixing")]
    MixingUnset(String),

    #[error("event references unknown {kind}: {key}")]
    UnknownEvent { kind: &'static str, key: String },
}
