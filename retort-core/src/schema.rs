//! Declarative schema tables for machine and process configs.
//!
//! Everything here is data consulted by the validator: which keywords each
//! section admits, what type each keyword carries, which values the
//! enum-valued keywords allow, which extra keywords a discriminator value
//! pulls in, and the shape predicates for the structured keywords.

use serde_json::Value;

/// Keyword lists for one config section.
pub struct SectionRules {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl SectionRules {
    pub fn admits(&self, keyword: &str) -> bool {
        self.required.contains(&keyword) || self.optional.contains(&keyword)
    }
}

pub const MACHINE_RULES: SectionRules = SectionRules {
    required: &["name", "variables", "measurers", "effectors"],
    optional: &["description"],
};

pub const VARIABLE_RULES: SectionRules = SectionRules {
    required: &["name", "visible"],
    optional: &[
        "description",
        "safeRange",
        "shutdownRange",
        "sensorMixing",
        "defaultTarget",
    ],
};

pub const MEASURER_RULES: SectionRules = SectionRules {
    required: &["name", "variable", "driverKey", "iterateMS", "active"],
    optional: &["description", "offsetMS"],
};

pub const EFFECTOR_RULES: SectionRules = SectionRules {
    required: &["name", "driverKey", "controlType", "shutdownSetting", "active"],
    optional: &[
        "description",
        "controlVariable",
        "controlBinaryThreshold",
        "controlLookupTable",
        "controlPIDConsts",
        "minChangeDelayMS",
        "offsetMS",
    ],
};

pub const PROCESS_RULES: SectionRules = SectionRules {
    required: &["name", "forMachine", "stages"],
    optional: &["description", "overrides"],
};

pub const STAGE_RULES: SectionRules = SectionRules {
    required: &["name", "stageEndControl"],
    optional: &[
        "description",
        "overrides",
        "variableTargets",
        "effectorSettings",
        "recalculateTimers",
        "stageEndTimer",
        "stageEndTarget",
    ],
};

/// Keys an override patch may never carry, at any depth.
pub const BANNED_OVERRIDE_KEYS: &[&str] = &["name", "description"];

// ─── Types ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedType {
    Str,
    Int,
    Bool,
    List,
    Mapping,
}

impl ExpectedType {
    pub fn name(self) -> &'static str {
        match self {
            ExpectedType::Str => "string",
            ExpectedType::Int => "int",
            ExpectedType::Bool => "bool",
            ExpectedType::List => "list",
            ExpectedType::Mapping => "mapping",
        }
    }

    /// Config numbers are integers; floats never match.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ExpectedType::Str => value.is_string(),
            ExpectedType::Int => value.is_i64(),
            ExpectedType::Bool => value.is_boolean(),
            ExpectedType::List => value.is_array(),
            ExpectedType::Mapping => value.is_object(),
        }
    }
}

/// The semantic type name of a received JSON value, for diagnostics.
pub fn received_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Keyword → expected type. Keywords absent here are unconstrained.
pub fn expected_type(keyword: &str) -> Option<ExpectedType> {
    use ExpectedType::*;
    Some(match keyword {
        "name" | "description" | "sensorMixing" | "driverKey" | "controlType"
        | "controlVariable" | "variable" | "stageEndControl" | "forMachine" => Str,
        "iterateMS" | "offsetMS" | "minChangeDelayMS" | "defaultTarget" | "shutdownSetting"
        | "controlBinaryThreshold" | "stageEndTimer" => Int,
        "visible" | "active" | "recalculateTimers" => Bool,
        "safeRange" | "shutdownRange" | "controlPIDConsts" | "controlLookupTable" => List,
        "variables" | "measurers" | "effectors" | "stages" | "overrides" | "stageEndTarget"
        | "variableTargets" | "effectorSettings" => Mapping,
        _ => return None,
    })
}

// ─── Enums ────────────────────────────────────────────────────

pub const SENSOR_MIXING_VALUES: &[&str] = &["min", "max", "avg"];
pub const CONTROL_TYPE_VALUES: &[&str] = &[
    "static",
    "lookupMin",
    "lookupMax",
    "lookupClosest",
    "PID",
    "binary",
    "binaryInverted",
];
pub const STAGE_END_CONTROL_VALUES: &[&str] = &["target", "time", "shutdown"];
pub const COMPARATOR_VALUES: &[&str] = &["above", "below"];

/// Keyword → allowed value set, for enum-valued keywords.
pub fn enum_values(keyword: &str) -> Option<&'static [&'static str]> {
    match keyword {
        "sensorMixing" => Some(SENSOR_MIXING_VALUES),
        "controlType" => Some(CONTROL_TYPE_VALUES),
        "stageEndControl" => Some(STAGE_END_CONTROL_VALUES),
        _ => None,
    }
}

// ─── Cross-field requirements ─────────────────────────────────

/// Extra keywords a discriminator value requires in its section.
pub fn conditional_requirements(keyword: &str, value: &str) -> &'static [&'static str] {
    match (keyword, value) {
        ("controlType", "lookupMin" | "lookupMax" | "lookupClosest") => {
            &["controlLookupTable", "controlVariable"]
        }
        ("controlType", "PID") => &["controlPIDConsts", "controlVariable"],
        ("controlType", "binary" | "binaryInverted") => {
            &["controlBinaryThreshold", "controlVariable"]
        }
        ("stageEndControl", "target") => &["stageEndTarget"],
        ("stageEndControl", "time") => &["stageEndTimer"],
        _ => &[],
    }
}

// ─── Shape predicates ─────────────────────────────────────────

/// Check the structured keywords whose shape the type table cannot express.
/// Returns the failure hint on rejection. Membership checks against the
/// machine namespace are the validator's job, not the schema's.
pub fn keyword_shape(keyword: &str, value: &Value) -> Result<(), &'static str> {
    match keyword {
        "safeRange" | "shutdownRange" => {
            distinct_int_pair(value).then_some(()).ok_or("Needs to be a list with two non equal integers")
        }
        "controlPIDConsts" => {
            let ok = value
                .as_array()
                .is_some_and(|xs| xs.len() == 3 && xs.iter().all(Value::is_i64));
            ok.then_some(()).ok_or("Needs to be a list with three integers")
        }
        "controlLookupTable" => {
            let ok = value.as_array().is_some_and(|xs| {
                !xs.is_empty()
                    && xs.iter().all(|x| {
                        x.as_array()
                            .is_some_and(|p| p.len() == 2 && p.iter().all(Value::is_i64))
                    })
            });
            ok.then_some(())
                .ok_or("Needs to be a non-empty list of [integer, integer] pairs")
        }
        "stages" => dense_stage_keys(value)
            .then_some(())
            .ok_or("Stage keys must start from 0 and count up by one"),
        "stageEndTarget" => {
            let ok = value.as_object().is_some_and(|m| {
                m.values().all(|v| {
                    v.as_array().is_some_and(|p| {
                        p.len() == 2
                            && p[0]
                                .as_str()
                                .is_some_and(|c| COMPARATOR_VALUES.contains(&c))
                            && p[1].is_i64()
                    })
                })
            });
            ok.then_some(())
                .ok_or("Each value must be a pair of 'above' or 'below' and an integer")
        }
        "variableTargets" | "effectorSettings" => {
            let ok = value
                .as_object()
                .is_some_and(|m| m.values().all(Value::is_i64));
            ok.then_some(()).ok_or("Each value must be an integer")
        }
        "iterateMS" => positive(value).then_some(()).ok_or("Must be a positive integer"),
        "offsetMS" | "stageEndTimer" | "minChangeDelayMS" => non_negative(value)
            .then_some(())
            .ok_or("Must not be negative"),
        _ => Ok(()),
    }
}

fn distinct_int_pair(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|xs| xs.len() == 2 && xs.iter().all(Value::is_i64) && xs[0] != xs[1])
}

fn positive(value: &Value) -> bool {
    value.as_i64().is_some_and(|n| n > 0)
}

fn non_negative(value: &Value) -> bool {
    value.as_i64().is_some_and(|n| n >= 0)
}

/// Stage keys must be exactly `"0" … "N-1"` with no gaps.
fn dense_stage_keys(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };
    (0..map.len()).all(|i| map.contains_key(&i.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn int_type_rejects_floats() {
        assert!(ExpectedType::Int.matches(&json!(3)));
        assert!(!ExpectedType::Int.matches(&json!(3.5)));
        assert!(!ExpectedType::Int.matches(&json!("3")));
        assert_eq!(received_type_name(&json!(3.5)), "float");
    }

    #[test]
    fn stage_keys_must_be_dense() {
        assert!(keyword_shape("stages", &json!({"0": {}, "1": {}})).is_ok());
        assert!(keyword_shape("stages", &json!({"0": {}, "2": {}})).is_err());
        assert!(keyword_shape("stages", &json!({"1": {}})).is_err());
        // an empty process has no stages to run but the keys are not the problem
        assert!(keyword_shape("stages", &json!({})).is_ok());
    }

    #[test]
    fn ranges_need_two_distinct_ints() {
        assert!(keyword_shape("safeRange", &json!([10, 90])).is_ok());
        assert!(keyword_shape("shutdownRange", &json!([90, 10])).is_ok());
        assert!(keyword_shape("safeRange", &json!([10, 10])).is_err());
        assert!(keyword_shape("safeRange", &json!([10])).is_err());
        assert!(keyword_shape("safeRange", &json!([10, 90.5])).is_err());
    }

    #[test]
    fn lookup_table_shape() {
        assert!(keyword_shape("controlLookupTable", &json!([[0, 1], [50, 2]])).is_ok());
        assert!(keyword_shape("controlLookupTable", &json!([])).is_err());
        assert!(keyword_shape("controlLookupTable", &json!([[0, 1, 2]])).is_err());
        assert!(keyword_shape("controlLookupTable", &json!([[0.5, 1]])).is_err());
    }

    #[test]
    fn pid_consts_are_three_ints() {
        assert!(keyword_shape("controlPIDConsts", &json!([1, 0, 0])).is_ok());
        assert!(keyword_shape("controlPIDConsts", &json!([1, 0])).is_err());
        assert!(keyword_shape("controlPIDConsts", &json!([1, 0, 0, 0])).is_err());
    }

    #[test]
    fn cross_field_table() {
        assert_eq!(
            conditional_requirements("controlType", "PID"),
            &["controlPIDConsts", "controlVariable"]
        );
        assert!(conditional_requirements("controlType", "static").is_empty());
        assert_eq!(
            conditional_requirements("stageEndControl", "time"),
            &["stageEndTimer"]
        );
    }

    #[test]
    fn iterate_must_be_positive() {
        assert!(keyword_shape("iterateMS", &json!(1)).is_ok());
        assert!(keyword_shape("iterateMS", &json!(0)).is_err());
        assert!(keyword_shape("offsetMS", &json!(0)).is_ok());
        assert!(keyword_shape("offsetMS", &json!(-5)).is_err());
    }
}
