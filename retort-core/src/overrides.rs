//! Deep-merge of override patches into a machine config tree.
//!
//! Overrides only mutate keys that already exist in the target; unknown
//! patch keys are silently ignored so a process written for a richer
//! machine still applies. `name` and `description` may never appear in a
//! patch at any depth.

use crate::error::{ConfigError, ConfigErrorKind};
use crate::schema::BANNED_OVERRIDE_KEYS;
use crate::types::JsonMap;
use serde_json::Value;

/// Merge `patch` into `target` in place. Callers own the deep copy.
pub fn apply_override(target: &mut JsonMap, patch: &JsonMap, path: &str) -> Result<(), ConfigError> {
    scan_banned(patch, path)?;
    merge(target, patch);
    Ok(())
}

/// Clone `base` and apply `patch` to the clone.
pub fn compose(base: &JsonMap, patch: &JsonMap, path: &str) -> Result<JsonMap, ConfigError> {
    let mut tree = base.clone();
    apply_override(&mut tree, patch, path)?;
    Ok(tree)
}

/// Reject banned keys anywhere in the patch, including inside values that
/// would replace a scalar wholesale.
fn scan_banned(patch: &JsonMap, path: &str) -> Result<(), ConfigError> {
    for (key, value) in patch {
        if BANNED_OVERRIDE_KEYS.contains(&key.as_str()) {
            return Err(ConfigError::new(
                path,
                ConfigErrorKind::BannedOverrideKey(key.clone()),
            ));
        }
        scan_banned_value(value, path)?;
    }
    Ok(())
}

fn scan_banned_value(value: &Value, path: &str) -> Result<(), ConfigError> {
    match value {
        Value::Object(map) => scan_banned(map, path),
        Value::Array(items) => items.iter().try_for_each(|v| scan_banned_value(v, path)),
        _ => Ok(()),
    }
}

fn merge(target: &mut JsonMap, patch: &JsonMap) {
    for (key, value) in patch {
        let Some(slot) = target.get_mut(key) else {
            continue;
        };
        if slot.is_object() && value.is_object() {
            if let (Some(dst), Some(src)) = (slot.as_object_mut(), value.as_object()) {
                merge(dst, src);
            }
        } else {
            *slot = value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: serde_json::Value) -> JsonMap {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn merges_nested_mappings() {
        let mut target = map(json!({
            "variables": {"Heat": {"visible": true, "defaultTarget": 60}},
            "active": true
        }));
        let patch = map(json!({"variables": {"Heat": {"defaultTarget": 75}}}));
        apply_override(&mut target, &patch, "").unwrap();
        assert_eq!(target["variables"]["Heat"]["defaultTarget"], json!(75));
        assert_eq!(target["variables"]["Heat"]["visible"], json!(true));
    }

    #[test]
    fn ignores_keys_absent_from_target() {
        let mut target = map(json!({"active": true}));
        let patch = map(json!({"missing": 1, "active": false}));
        apply_override(&mut target, &patch, "").unwrap();
        assert_eq!(target.get("missing"), None);
        assert_eq!(target["active"], json!(false));
    }

    #[test]
    fn rejects_banned_key_at_top_level() {
        let mut target = map(json!({"name": "machine"}));
        let patch = map(json!({"name": "other"}));
        let err = apply_override(&mut target, &patch, "Process override: ").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Process override: Invalid override keyword: name"
        );
        // target untouched on failure
        assert_eq!(target["name"], json!("machine"));
    }

    #[test]
    fn rejects_banned_key_at_depth() {
        let mut target = map(json!({"variables": {"Heat": {"visible": true}}}));
        let patch = map(json!({"variables": {"Heat": {"description": "sneaky"}}}));
        let err = apply_override(&mut target, &patch, "").unwrap_err();
        assert_eq!(err.to_string(), "Invalid override keyword: description");
    }

    #[test]
    fn rejects_banned_key_inside_replacement_value() {
        // the patch value would replace a scalar wholesale, so the banned
        // key is only reachable by the deep scan
        let mut target = map(json!({"visible": true}));
        let patch = map(json!({"visible": {"name": "x"}}));
        assert!(apply_override(&mut target, &patch, "").is_err());
    }

    #[test]
    fn scalar_replaces_mapping_and_vice_versa() {
        let mut target = map(json!({"a": {"inner": 1}, "b": 2}));
        let patch = map(json!({"a": 5, "b": {"inner": 3}}));
        apply_override(&mut target, &patch, "").unwrap();
        assert_eq!(target["a"], json!(5));
        assert_eq!(target["b"], json!({"inner": 3}));
    }
}
