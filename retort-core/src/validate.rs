//! Machine + process config validation.
//!
//! Validation and decoding are one pass: each section is checked against
//! the schema tables and decoded into the typed AST in the same step, so a
//! section that fails any check never decodes. The checks
//! run in a fixed order — namespace, section decode, referential
//! integrity, sensor mixing, override composition, stage semantics — and
//! the first failure wins. Every diagnostic is prefixed with the path
//! being validated. The validator never mutates its inputs.

use crate::drivers::DriverRegistry;
use crate::error::{ConfigError, ConfigErrorKind};
use crate::overrides;
use crate::schema::{self, SectionRules};
use crate::types::*;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The decoded output of a successful validation, ready for execution.
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    /// The machine as configured, before any override.
    pub machine: MachineSpec,
    /// The machine with the process-level override applied.
    pub working: MachineSpec,
    /// Raw tree of `working`, the base for per-stage composition.
    pub working_tree: JsonMap,
    pub process: ProcessSpec,
}

/// Validate a machine config, process config, and driver registry.
///
/// Returns `(true, "")` on success, `(false, diagnostic)` on the first
/// failure.
pub fn validate(machine: &Value, process: &Value, drivers: &DriverRegistry) -> (bool, String) {
    match validate_config(machine, process, drivers) {
        Ok(_) => (true, String::new()),
        Err(e) => (false, e.to_string()),
    }
}

/// As [`validate`], but keeps the decoded config for the executor.
pub fn validate_config(
    machine: &Value,
    process: &Value,
    drivers: &DriverRegistry,
) -> Result<ValidatedConfig, ConfigError> {
    let machine_map = as_mapping(machine, "Machine config")?;
    let process_map = as_mapping(process, "Process config")?;

    check_namespace(machine_map, process_map)?;

    let base = decode_machine("", machine_map)?;
    check_machine_semantics("", &base, drivers)?;

    let process_spec = decode_process(process_map)?;

    let (working_tree, working) = match &process_spec.overrides {
        Some(patch) => {
            let path = "Process override: ";
            let tree = overrides::compose(machine_map, patch, path)?;
            let spec = decode_machine(path, &tree)?;
            check_machine_semantics(path, &spec, drivers)?;
            (tree, spec)
        }
        None => (machine_map.clone(), base.clone()),
    };

    for (i, stage) in process_spec.stages.iter().enumerate() {
        let stage_path = format!("Stage {i}: ");
        match &stage.overrides {
            Some(patch) => {
                let path = format!("Stage {i} override: ");
                let tree = overrides::compose(&working_tree, patch, &path)?;
                let spec = decode_machine(&path, &tree)?;
                check_machine_semantics(&path, &spec, drivers)?;
                check_stage_semantics(&stage_path, stage, &spec)?;
            }
            None => check_stage_semantics(&stage_path, stage, &working)?,
        }
    }

    Ok(ValidatedConfig {
        machine: base,
        working,
        working_tree,
        process: process_spec,
    })
}

// ─── Namespace ────────────────────────────────────────────────

fn check_namespace(machine: &JsonMap, process: &JsonMap) -> Result<(), ConfigError> {
    let machine_name = require_name("Machine config: ", machine)?;
    let mut namespace: BTreeSet<String> = BTreeSet::new();
    namespace.insert(machine_name.to_string());

    for (keyword, kind) in [
        ("variables", "Variable"),
        ("measurers", "Measurer"),
        ("effectors", "Effector"),
    ] {
        // a missing or mistyped collection is reported by section decode
        let Some(records) = machine.get(keyword).and_then(Value::as_object) else {
            continue;
        };
        for (key, record) in records {
            let path = format!("{kind} {key}: ");
            let Some(record) = record.as_object() else {
                return Err(ConfigError::new(path, ConfigErrorKind::NotAMapping(kind)));
            };
            let name = require_name(&path, record)?;
            if !namespace.insert(name.to_string()) {
                return Err(ConfigError::new(
                    "",
                    ConfigErrorKind::NamespaceCollision {
                        kind,
                        name: name.to_string(),
                    },
                ));
            }
        }
    }

    let process_name = require_name("Process config: ", process)?;
    let mut process_namespace: BTreeSet<String> = BTreeSet::new();
    process_namespace.insert(process_name.to_string());
    if let Some(stages) = process.get("stages").and_then(Value::as_object) {
        for (key, record) in stages {
            let path = format!("Stage {key}: ");
            let Some(record) = record.as_object() else {
                return Err(ConfigError::new(path, ConfigErrorKind::NotAMapping("Stage")));
            };
            let name = require_name(&path, record)?;
            if !process_namespace.insert(name.to_string()) {
                return Err(ConfigError::new(
                    "",
                    ConfigErrorKind::NamespaceCollision {
                        kind: "Stage",
                        name: name.to_string(),
                    },
                ));
            }
        }
    }

    match process.get("forMachine") {
        Some(Value::String(for_machine)) if for_machine == machine_name => Ok(()),
        Some(Value::String(for_machine)) => Err(ConfigError::new(
            "",
            ConfigErrorKind::MachineMismatch {
                for_machine: for_machine.clone(),
                machine: machine_name.to_string(),
            },
        )),
        Some(other) => Err(ConfigError::new(
            "Process config: ",
            wrong_type("forMachine", "string", other),
        )),
        None => Err(ConfigError::new(
            "Process config: ",
            ConfigErrorKind::MissingKeyword("forMachine".into()),
        )),
    }
}

// ─── Section checking ─────────────────────────────────────────

/// One section against the schema tables: unknown keywords, types, enum
/// values, discriminator-implied requirements, shape predicates, and
/// finally the required-keyword sweep.
fn check_section(path: &str, data: &JsonMap, rules: &SectionRules) -> Result<(), ConfigError> {
    let mut required: Vec<&'static str> = rules.required.to_vec();
    for (keyword, value) in data {
        if !rules.admits(keyword) {
            return Err(ConfigError::new(
                path,
                ConfigErrorKind::UnknownKeyword(keyword.clone()),
            ));
        }
        if let Some(expected) = schema::expected_type(keyword) {
            if !expected.matches(value) {
                return Err(ConfigError::new(
                    path,
                    wrong_type(keyword, expected.name(), value),
                ));
            }
        }
        if let Some(allowed) = schema::enum_values(keyword) {
            let s = value.as_str().unwrap_or_default();
            if !allowed.contains(&s) {
                return Err(ConfigError::new(
                    path,
                    ConfigErrorKind::EnumViolation(keyword.clone()),
                ));
            }
        }
        if let Some(s) = value.as_str() {
            for &extra in schema::conditional_requirements(keyword, s) {
                if !required.contains(&extra) {
                    required.push(extra);
                }
            }
        }
        if let Err(hint) = schema::keyword_shape(keyword, value) {
            return Err(ConfigError::new(
                path,
                ConfigErrorKind::ShapeInvalid {
                    keyword: keyword.clone(),
                    hint,
                },
            ));
        }
    }
    for keyword in required {
        if !data.contains_key(keyword) {
            return Err(ConfigError::new(
                path,
                ConfigErrorKind::MissingKeyword(keyword.to_string()),
            ));
        }
    }
    Ok(())
}

// ─── Machine decode ───────────────────────────────────────────

pub(crate) fn decode_machine(path: &str, map: &JsonMap) -> Result<MachineSpec, ConfigError> {
    check_section(&format!("{path}Machine config: "), map, &schema::MACHINE_RULES)?;

    let mut variables = BTreeMap::new();
    for (key, record) in collection(map, "variables") {
        let record = record_mapping(path, "Variable", key, record)?;
        variables.insert(key.clone(), decode_variable(path, key, record)?);
    }
    let mut measurers = BTreeMap::new();
    for (key, record) in collection(map, "measurers") {
        let record = record_mapping(path, "Measurer", key, record)?;
        measurers.insert(key.clone(), decode_measurer(path, key, record)?);
    }
    let mut effectors = BTreeMap::new();
    for (key, record) in collection(map, "effectors") {
        let record = record_mapping(path, "Effector", key, record)?;
        effectors.insert(key.clone(), decode_effector(path, key, record)?);
    }

    Ok(MachineSpec {
        name: get_string(map, "name"),
        description: get_opt_string(map, "description"),
        variables,
        measurers,
        effectors,
    })
}

fn decode_variable(path: &str, key: &str, data: &JsonMap) -> Result<VariableSpec, ConfigError> {
    let spath = format!("{path}Variable {key}: ");
    check_record_name(&spath, key, data)?;
    check_section(&spath, data, &schema::VARIABLE_RULES)?;
    Ok(VariableSpec {
        name: key.to_string(),
        visible: get_bool(data, "visible"),
        safe_range: get_range(data, "safeRange"),
        shutdown_range: get_range(data, "shutdownRange"),
        sensor_mixing: data
            .get("sensorMixing")
            .and_then(Value::as_str)
            .map(|s| match s {
                "min" => SensorMixing::Min,
                "max" => SensorMixing::Max,
                _ => SensorMixing::Avg,
            }),
        default_target: data.get("defaultTarget").and_then(Value::as_i64),
        description: get_opt_string(data, "description"),
    })
}

fn decode_measurer(path: &str, key: &str, data: &JsonMap) -> Result<MeasurerSpec, ConfigError> {
    let spath = format!("{path}Measurer {key}: ");
    check_record_name(&spath, key, data)?;
    check_section(&spath, data, &schema::MEASURER_RULES)?;
    Ok(MeasurerSpec {
        name: key.to_string(),
        variable: get_string(data, "variable"),
        driver_key: get_string(data, "driverKey"),
        iterate_ms: get_ms(data, "iterateMS", 1),
        offset_ms: get_ms(data, "offsetMS", 0),
        active: get_bool(data, "active"),
        description: get_opt_string(data, "description"),
    })
}

fn decode_effector(path: &str, key: &str, data: &JsonMap) -> Result<EffectorSpec, ConfigError> {
    let spath = format!("{path}Effector {key}: ");
    check_record_name(&spath, key, data)?;
    check_section(&spath, data, &schema::EFFECTOR_RULES)?;

    let control_variable = || get_string(data, "controlVariable");
    let law = match data.get("controlType").and_then(Value::as_str) {
        Some("static") => ControlLaw::Static,
        Some("binary") => ControlLaw::Binary {
            variable: control_variable(),
            threshold: get_i64(data, "controlBinaryThreshold"),
        },
        Some("binaryInverted") => ControlLaw::BinaryInverted {
            variable: control_variable(),
            threshold: get_i64(data, "controlBinaryThreshold"),
        },
        Some(lookup @ ("lookupMin" | "lookupMax" | "lookupClosest")) => {
            let mode = match lookup {
                "lookupMin" => LookupMode::Min,
                "lookupMax" => LookupMode::Max,
                _ => LookupMode::Closest,
            };
            let mut table: Vec<(i64, i64)> = data
                .get("controlLookupTable")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let pair = row.as_array()?;
                            Some((pair.first()?.as_i64()?, pair.get(1)?.as_i64()?))
                        })
                        .collect()
                })
                .unwrap_or_default();
            table.sort_by_key(|&(input, _)| input);
            ControlLaw::Lookup {
                mode,
                variable: control_variable(),
                table,
            }
        }
        Some("PID") => {
            let consts: Vec<i64> = data
                .get("controlPIDConsts")
                .and_then(Value::as_array)
                .map(|xs| xs.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default();
            ControlLaw::Pid {
                variable: control_variable(),
                kp: consts.first().copied().unwrap_or(0),
                ki: consts.get(1).copied().unwrap_or(0),
                kd: consts.get(2).copied().unwrap_or(0),
            }
        }
        _ => {
            return Err(ConfigError::new(
                spath,
                ConfigErrorKind::EnumViolation("controlType".into()),
            ))
        }
    };

    Ok(EffectorSpec {
        name: key.to_string(),
        driver_key: get_string(data, "driverKey"),
        shutdown_setting: get_i64(data, "shutdownSetting"),
        active: get_bool(data, "active"),
        offset_ms: get_ms(data, "offsetMS", 0),
        min_change_delay_ms: data
            .get("minChangeDelayMS")
            .and_then(Value::as_i64)
            .map(|n| n as Millis),
        law,
        description: get_opt_string(data, "description"),
    })
}

// ─── Process decode ───────────────────────────────────────────

fn decode_process(map: &JsonMap) -> Result<ProcessSpec, ConfigError> {
    check_section("Process config: ", map, &schema::PROCESS_RULES)?;

    let stages_map = map
        .get("stages")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let mut stages = Vec::with_capacity(stages_map.len());
    for i in 0..stages_map.len() {
        let path = format!("Stage {i}: ");
        // dense keys are guaranteed by the stages shape predicate
        let record = stages_map
            .get(&i.to_string())
            .and_then(Value::as_object)
            .ok_or_else(|| ConfigError::new(path.clone(), ConfigErrorKind::NotAMapping("Stage")))?;
        stages.push(decode_stage(i, record)?);
    }

    Ok(ProcessSpec {
        name: get_string(map, "name"),
        for_machine: get_string(map, "forMachine"),
        description: get_opt_string(map, "description"),
        overrides: map
            .get("overrides")
            .and_then(Value::as_object)
            .cloned(),
        stages,
    })
}

fn decode_stage(index: usize, data: &JsonMap) -> Result<StageSpec, ConfigError> {
    let path = format!("Stage {index}: ");
    require_name(&path, data)?;
    check_section(&path, data, &schema::STAGE_RULES)?;

    let end = match data.get("stageEndControl").and_then(Value::as_str) {
        Some("target") => {
            let mut conditions = BTreeMap::new();
            if let Some(targets) = data.get("stageEndTarget").and_then(Value::as_object) {
                for (variable, pair) in targets {
                    // shape guaranteed by the stageEndTarget predicate
                    let pair = pair.as_array().cloned().unwrap_or_default();
                    let comparator = match pair.first().and_then(Value::as_str) {
                        Some("above") => Comparator::Above,
                        _ => Comparator::Below,
                    };
                    let threshold = pair.get(1).and_then(Value::as_i64).unwrap_or(0);
                    conditions.insert(
                        variable.clone(),
                        TargetCondition {
                            comparator,
                            threshold,
                        },
                    );
                }
            }
            StageEnd::Target(conditions)
        }
        Some("time") => StageEnd::Time(get_ms(data, "stageEndTimer", 0)),
        Some("shutdown") => StageEnd::Shutdown,
        _ => {
            return Err(ConfigError::new(
                path,
                ConfigErrorKind::EnumViolation("stageEndControl".into()),
            ))
        }
    };

    Ok(StageSpec {
        name: get_string(data, "name"),
        description: get_opt_string(data, "description"),
        end,
        variable_targets: int_map(data, "variableTargets"),
        effector_settings: int_map(data, "effectorSettings"),
        overrides: data.get("overrides").and_then(Value::as_object).cloned(),
        recalculate_timers: get_bool(data, "recalculateTimers"),
    })
}

// ─── Semantic checks ──────────────────────────────────────────

/// Referential integrity, the multi-measurer mixing rule, and the
/// requirement that every controlled variable has a live input.
fn check_machine_semantics(
    path: &str,
    machine: &MachineSpec,
    drivers: &DriverRegistry,
) -> Result<(), ConfigError> {
    for measurer in machine.measurers.values() {
        if !machine.variables.contains_key(&measurer.variable) {
            return Err(missing_ref(path, "Measurer variable", &measurer.variable));
        }
        if !drivers.contains(&measurer.driver_key) {
            return Err(missing_ref(path, "Driver", &measurer.driver_key));
        }
    }
    for effector in machine.effectors.values() {
        if let Some(variable) = effector.law.control_variable() {
            if !machine.variables.contains_key(variable) {
                return Err(missing_ref(path, "Effector variable", variable));
            }
        }
        if !drivers.contains(&effector.driver_key) {
            return Err(missing_ref(path, "Driver", &effector.driver_key));
        }
    }

    let mut active_feeders: BTreeMap<&str, usize> = BTreeMap::new();
    for measurer in machine.measurers.values().filter(|m| m.active) {
        *active_feeders.entry(measurer.variable.as_str()).or_default() += 1;
    }
    for (variable, count) in &active_feeders {
        if *count >= 2 {
            let mixing = machine
                .variables
                .get(*variable)
                .and_then(|v| v.sensor_mixing);
            if mixing.is_none() {
                return Err(ConfigError::new(
                    path,
                    ConfigErrorKind::MixingRequired(variable.to_string()),
                ));
            }
        }
    }

    for effector in machine.effectors.values() {
        if let Some(variable) = effector.law.control_variable() {
            if active_feeders.get(variable).copied().unwrap_or(0) == 0 {
                return Err(ConfigError::new(
                    path,
                    ConfigErrorKind::NoActiveMeasurer(variable.to_string()),
                ));
            }
        }
    }
    Ok(())
}

/// Stage keys must resolve against the machine this stage actually runs on.
fn check_stage_semantics(
    path: &str,
    stage: &StageSpec,
    machine: &MachineSpec,
) -> Result<(), ConfigError> {
    for variable in stage.variable_targets.keys() {
        if !machine.variables.contains_key(variable) {
            return Err(missing_ref(path, "variableTargets variable", variable));
        }
    }
    for effector in stage.effector_settings.keys() {
        match machine.effectors.get(effector) {
            None => return Err(missing_ref(path, "effectorSettings effector", effector)),
            Some(spec) if !spec.law.is_static() => {
                return Err(ConfigError::new(
                    path,
                    ConfigErrorKind::NonStaticEffectorSetting(effector.clone()),
                ));
            }
            Some(_) => {}
        }
    }
    if let StageEnd::Target(conditions) = &stage.end {
        for variable in conditions.keys() {
            if !machine.variables.contains_key(variable) {
                return Err(missing_ref(path, "stageEndTarget variable", variable));
            }
        }
    }
    Ok(())
}

// ─── Helpers ──────────────────────────────────────────────────

fn as_mapping<'a>(value: &'a Value, what: &'static str) -> Result<&'a JsonMap, ConfigError> {
    value
        .as_object()
        .ok_or_else(|| ConfigError::new("", ConfigErrorKind::NotAMapping(what)))
}

fn record_mapping<'a>(
    path: &str,
    kind: &'static str,
    key: &str,
    record: &'a Value,
) -> Result<&'a JsonMap, ConfigError> {
    record.as_object().ok_or_else(|| {
        ConfigError::new(
            format!("{path}{kind} {key}: "),
            ConfigErrorKind::NotAMapping(kind),
        )
    })
}

fn collection<'a>(map: &'a JsonMap, keyword: &str) -> impl Iterator<Item = (&'a String, &'a Value)> {
    map.get(keyword)
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|m| m.iter())
}

fn require_name<'a>(path: &str, data: &'a JsonMap) -> Result<&'a str, ConfigError> {
    match data.get("name") {
        Some(Value::String(name)) => Ok(name),
        Some(other) => Err(ConfigError::new(path, wrong_type("name", "string", other))),
        None => Err(ConfigError::new(
            path,
            ConfigErrorKind::MissingKeyword("name".into()),
        )),
    }
}

fn check_record_name(path: &str, key: &str, data: &JsonMap) -> Result<(), ConfigError> {
    let name = require_name(path, data)?;
    if name != key {
        return Err(ConfigError::new(
            path,
            ConfigErrorKind::KeyNameMismatch {
                key: key.to_string(),
                name: name.to_string(),
            },
        ));
    }
    Ok(())
}

fn wrong_type(keyword: &str, expected: &'static str, received: &Value) -> ConfigErrorKind {
    ConfigErrorKind::WrongType {
        keyword: keyword.to_string(),
        expected,
        received: schema::received_type_name(received),
    }
}

fn missing_ref(path: &str, kind: &'static str, name: &str) -> ConfigError {
    ConfigError::new(
        path,
        ConfigErrorKind::MissingReference {
            kind,
            name: name.to_string(),
        },
    )
}

fn get_string(data: &JsonMap, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn get_opt_string(data: &JsonMap, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_bool(data: &JsonMap, key: &str) -> bool {
    data.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn get_i64(data: &JsonMap, key: &str) -> i64 {
    data.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn get_ms(data: &JsonMap, key: &str, default: Millis) -> Millis {
    data.get(key)
        .and_then(Value::as_i64)
        .map(|n| n.max(0) as Millis)
        .unwrap_or(default)
}

fn get_range(data: &JsonMap, key: &str) -> Option<(i64, i64)> {
    let pair = data.get(key)?.as_array()?;
    let a = pair.first()?.as_i64()?;
    let b = pair.get(1)?.as_i64()?;
    Some((a.min(b), a.max(b)))
}

fn int_map(data: &JsonMap, key: &str) -> BTreeMap<String, i64> {
    data.get(key)
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_i64()?)))
                .collect()
        })
        .unwrap_or_default()
}
