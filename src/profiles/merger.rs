//! Profile `extends` inheritance resolver.
//! A model profile with "extends": "_bases/generic_sled" is deep-merged on top
//! of its base, which may itself extend another base.
//!
//! Merge rules:
//!   - metadata, slot_bridge, speed_translation: recursive merge (model wins)
//!   - commands: merged per key, a model command replaces the base command whole
//!   - slot_types: merged per key
//!   - initialization: APPEND (model init runs after base)
//!   - reset_to_factory: REPLACE

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::info;

const MAX_EXTENDS_DEPTH: usize = 8;

/// Resolve `extends` by loading the base chain and merging the profile on top.
/// Operates on raw JSON so a model profile only needs the fields it overrides.
pub fn resolve_extends(profile: Value, base_dir: &Path) -> Result<Value> {
    resolve_value(profile, base_dir, 0)
}

fn resolve_value(value: Value, base_dir: &Path, depth: usize) -> Result<Value> {
    let extends = match value.get("extends").and_then(Value::as_str) {
        Some(extends) => extends.to_string(),
        None => return Ok(value),
    };
    if depth >= MAX_EXTENDS_DEPTH {
        bail!("Profile extends chain deeper than {} (cycle?) at {}", MAX_EXTENDS_DEPTH, extends);
    }

    // "_bases/generic_sled" -> "_bases/generic_sled.json"
    let base_path = base_dir.join(format!("{}.json", extends));
    info!("Resolving extends: {} -> {:?}", extends, base_path);

    let base_content = std::fs::read_to_string(&base_path)
        .with_context(|| format!("Failed to read base profile: {:?}", base_path))?;
    let base_value: Value = serde_json::from_str(&base_content)
        .with_context(|| format!("Failed to parse base profile: {:?}", base_path))?;

    let base_parent = base_path
        .parent()
        .ok_or_else(|| anyhow!("Cannot determine directory of {:?}", base_path))?;
    let base_resolved = resolve_value(base_value, base_parent, depth + 1)?;

    Ok(deep_merge(base_resolved, value))
}

fn deep_merge(base: Value, over: Value) -> Value {
    match (base, over) {
        (Value::Object(mut base_map), Value::Object(over_map)) => {
            for (key, over_val) in over_map {
                // Option::None serializes to null; it never clears a base value
                if over_val.is_null() {
                    continue;
                }

                match key.as_str() {
                    "extends" => {}
                    "reset_to_factory" => {
                        base_map.insert(key, over_val);
                    }
                    "initialization" => {
                        let merged = match (base_map.remove(&key), over_val) {
                            (Some(Value::Array(mut base_arr)), Value::Array(over_arr)) => {
                                base_arr.extend(over_arr);
                                Value::Array(base_arr)
                            }
                            (_, over_val) => over_val,
                        };
                        base_map.insert(key, merged);
                    }
                    "commands" => {
                        let merged = match (base_map.remove(&key), over_val) {
                            (Some(Value::Object(mut base_cmds)), Value::Object(over_cmds)) => {
                                base_cmds.extend(over_cmds);
                                Value::Object(base_cmds)
                            }
                            (_, over_val) => over_val,
                        };
                        base_map.insert(key, merged);
                    }
                    _ => {
                        let merged = match base_map.remove(&key) {
                            Some(base_val) => deep_merge(base_val, over_val),
                            None => over_val,
                        };
                        base_map.insert(key, merged);
                    }
                }
            }
            Value::Object(base_map)
        }
        (_, over) => over,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_rules() {
        let base = json!({
            "metadata": { "vendor": "Generic", "schema_version": "1.0" },
            "protocols": { "ipmi": {
                "commands": {
                    "identify": { "bytes": "0x06 0x01", "response": { "offset": 2 } },
                    "read_temperature": { "bytes": "0x04 0x2d 0x01" }
                },
                "slot_types": { "0x01": "Compute" },
                "lifecycle": {
                    "initialization": [{ "name": "a", "bytes": "0x01" }],
                    "reset_to_factory": [{ "name": "base_reset", "bytes": "0x02", "critical": true }]
                }
            }}
        });
        let over = json!({
            "extends": "_bases/generic",
            "metadata": { "vendor": "Acme" },
            "protocols": { "ipmi": {
                "commands": { "identify": { "bytes": "0x06 0x02" } },
                "slot_types": { "0x02": "Jbod" },
                "lifecycle": {
                    "initialization": [{ "name": "b", "bytes": "0x03" }],
                    "reset_to_factory": [{ "name": "model_reset", "bytes": "0x04", "critical": true }]
                }
            }}
        });

        let merged = deep_merge(base, over);
        let ipmi = &merged["protocols"]["ipmi"];
        assert_eq!(merged["metadata"]["vendor"], "Acme");
        assert_eq!(merged["metadata"]["schema_version"], "1.0");
        assert!(merged.get("extends").is_none());
        // Replaced whole: the base response rule does not leak into the override.
        assert_eq!(ipmi["commands"]["identify"], json!({ "bytes": "0x06 0x02" }));
        assert_eq!(ipmi["commands"]["read_temperature"]["bytes"], "0x04 0x2d 0x01");
        assert_eq!(ipmi["slot_types"], json!({ "0x01": "Compute", "0x02": "Jbod" }));
        let init: Vec<_> = ipmi["lifecycle"]["initialization"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(init, vec!["a", "b"]);
        assert_eq!(ipmi["lifecycle"]["reset_to_factory"][0]["name"], "model_reset");
    }

    #[test]
    fn test_extends_cycle_is_rejected() {
        let dir = std::env::temp_dir().join(format!("pankha-merger-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.json"), r#"{"extends": "b"}"#).unwrap();
        std::fs::write(dir.join("b.json"), r#"{"extends": "a"}"#).unwrap();

        let err = resolve_value(json!({ "extends": "a" }), &dir, 0).unwrap_err();
        assert!(err.to_string().contains("deeper than"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
