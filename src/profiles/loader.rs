//! JSON profile loader with validation.
//! Reads a chassis profile from disk, resolves `extends` inheritance via the
//! merger, and rejects profiles that could leave the chassis uncontrollable.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;

use super::merger::resolve_extends;
use super::types::{ChassisProfile, IpmiProtocol};
use crate::system::parser::parse_hex_byte;

/// Commands the control loops cannot run without.
pub const REQUIRED_COMMANDS: [&str; 6] = [
    "read_temperature",
    "read_power_enable",
    "set_power_enable",
    "identify",
    "reinitialize",
    "set_fan_speed",
];

/// Relative profile paths resolve against the executable's directory.
pub fn resolve_profile_path(path: &str) -> Result<PathBuf> {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        return Ok(path);
    }
    let exe_dir = std::env::current_exe()?
        .parent()
        .ok_or_else(|| anyhow!("Cannot determine executable directory"))?
        .to_path_buf();
    Ok(exe_dir.join(path))
}

/// Load a chassis profile from a JSON file, resolve `extends`, and validate it.
pub fn load_profile(path: &Path) -> Result<ChassisProfile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile: {:?}", path))?;

    let raw: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse profile JSON: {:?}", path))?;

    let base_dir = path
        .parent()
        .ok_or_else(|| anyhow!("Cannot determine profile directory"))?;
    let resolved = resolve_extends(raw, base_dir)?;

    let mut profile: ChassisProfile = serde_json::from_value(resolved)
        .with_context(|| format!("Profile {:?} does not match the chassis profile schema", path))?;
    profile.extends = None;

    let ipmi = validate_profile(&profile)?;

    info!(
        "Loaded profile: {} ({}) - {} commands, {} init commands, {} reset commands",
        profile.metadata.vendor,
        profile.metadata.description.as_deref().unwrap_or("no description"),
        ipmi.commands.len(),
        ipmi.lifecycle.initialization.len(),
        ipmi.lifecycle.reset_to_factory.len(),
    );

    Ok(profile)
}

/// Safety checks on a resolved profile. Returns its IPMI section.
pub fn validate_profile(profile: &ChassisProfile) -> Result<&IpmiProtocol> {
    let ipmi = profile
        .protocols
        .as_ref()
        .and_then(|p| p.ipmi.as_ref())
        .ok_or_else(|| anyhow!("Profile has no IPMI protocol section after resolution"))?;

    // Without a critical reset, a crashed controller would leave the BMC in manual fan mode.
    if !ipmi.lifecycle.reset_to_factory.iter().any(|cmd| cmd.critical) {
        bail!(
            "Safety violation: reset_to_factory must contain at least one critical: true command. \
             Profile rejected to prevent BMC lockout on controller crash."
        );
    }

    let missing: Vec<&str> = REQUIRED_COMMANDS
        .iter()
        .copied()
        .filter(|name| !ipmi.commands.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        bail!("Profile is missing required commands: {}", missing.join(", "));
    }

    for key in ipmi.slot_types.keys() {
        parse_hex_byte(key).with_context(|| format!("Invalid slot_types key '{}'", key))?;
    }

    Ok(ipmi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::types::SpeedTranslation;

    fn shipped(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("chassis-profiles").join(name)
    }

    #[test]
    fn test_shipped_profile_resolves() {
        let profile = load_profile(&shipped("example_chassis.json")).unwrap();
        assert!(profile.extends.is_none());
        let ipmi = validate_profile(&profile).unwrap();
        assert_eq!(
            ipmi.speed_translation,
            SpeedTranslation::ByteScale { output_min: 0, output_max: 255 }
        );
        for name in REQUIRED_COMMANDS {
            assert!(ipmi.commands.contains_key(name), "{}", name);
        }
        assert!(ipmi.slot_bridge.is_some());
        assert!(ipmi.lifecycle.initialization.len() >= 2);
    }

    #[test]
    fn test_profile_path_resolution() {
        assert_eq!(
            resolve_profile_path("/etc/pankha/ex24.json").unwrap(),
            PathBuf::from("/etc/pankha/ex24.json")
        );
        let relative = resolve_profile_path("chassis-profiles/ex24.json").unwrap();
        assert!(relative.is_absolute());
        assert!(relative.ends_with("chassis-profiles/ex24.json"));
    }

    #[test]
    fn test_missing_critical_reset_is_rejected() {
        let mut profile = load_profile(&shipped("example_chassis.json")).unwrap();
        if let Some(ipmi) = profile.protocols.as_mut().and_then(|p| p.ipmi.as_mut()) {
            for cmd in &mut ipmi.lifecycle.reset_to_factory {
                cmd.critical = false;
            }
        }
        let err = validate_profile(&profile).unwrap_err();
        assert!(err.to_string().contains("reset_to_factory"));
    }

    #[test]
    fn test_missing_required_command_is_rejected() {
        let mut profile = load_profile(&shipped("example_chassis.json")).unwrap();
        if let Some(ipmi) = profile.protocols.as_mut().and_then(|p| p.ipmi.as_mut()) {
            ipmi.commands.remove("identify");
        }
        let err = validate_profile(&profile).unwrap_err();
        assert!(err.to_string().contains("identify"));
    }
}
