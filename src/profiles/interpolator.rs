//! Placeholder substitution for profile command templates.

use std::time::Duration;

use anyhow::{bail, Result};

use super::types::SpeedTranslation;

/// Translate a percentage (0-100) into the form the BMC expects.
pub fn translate_speed(percent: u8, translation: &SpeedTranslation) -> String {
    let percent = percent.min(100);
    match translation {
        SpeedTranslation::ByteScale { output_min, output_max } => {
            // 50% of 0..=255 -> 128 -> "0x80"
            let range = f64::from(output_max.saturating_sub(*output_min));
            let value = (f64::from(percent) / 100.0 * range).round() as u8;
            format!("0x{:02x}", output_min.saturating_add(value))
        }
        SpeedTranslation::DecimalHex => format!("0x{:02x}", percent),
        SpeedTranslation::Integer => percent.to_string(),
    }
}

/// Values available to one command template.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    /// Already translated by [`translate_speed`].
    pub speed: Option<String>,
    pub index: Option<u8>,
    pub state: Option<bool>,
    pub idle: Option<Duration>,
}

/// Substitute `{{SPEED_HEX}}`, `{{SPEED}}`, `{{INDEX_HEX}}`, `{{STATE_HEX}}` and
/// `{{IDLE_HEX}}`. A placeholder without a value is an error.
pub fn interpolate_command(template: &str, values: &Placeholders) -> Result<String> {
    let mut out = template.to_string();

    if let Some(speed) = &values.speed {
        out = out.replace("{{SPEED_HEX}}", speed).replace("{{SPEED}}", speed);
    }
    if let Some(index) = values.index {
        out = out.replace("{{INDEX_HEX}}", &format!("0x{:02x}", index));
    }
    if let Some(state) = values.state {
        out = out.replace("{{STATE_HEX}}", if state { "0x01" } else { "0x00" });
    }
    if let Some(idle) = values.idle {
        // Seconds, two bytes little endian
        let secs = u16::try_from(idle.as_secs()).unwrap_or(u16::MAX);
        let [lo, hi] = secs.to_le_bytes();
        out = out.replace("{{IDLE_HEX}}", &format!("0x{:02x} 0x{:02x}", lo, hi));
    }

    if let Some(start) = out.find("{{") {
        let rest = &out[start..];
        let end = rest.find("}}").map(|e| e + 2).unwrap_or(rest.len());
        bail!("Unresolved placeholder {} in '{}'", &rest[..end], template);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_speed() {
        let scale = SpeedTranslation::ByteScale { output_min: 0, output_max: 255 };
        assert_eq!(translate_speed(50, &scale), "0x80");
        assert_eq!(translate_speed(100, &scale), "0xff");
        assert_eq!(translate_speed(0, &scale), "0x00");
        assert_eq!(translate_speed(50, &SpeedTranslation::DecimalHex), "0x32");
        assert_eq!(translate_speed(50, &SpeedTranslation::Integer), "50");
        assert_eq!(translate_speed(150, &SpeedTranslation::DecimalHex), "0x64");
    }

    #[test]
    fn test_interpolate_all_placeholders() {
        let values = Placeholders {
            speed: Some("0x3c".to_string()),
            index: Some(3),
            state: Some(true),
            idle: Some(Duration::from_secs(300)),
        };
        let template = "0x30 {{SPEED_HEX}} {{INDEX_HEX}} {{STATE_HEX}} {{IDLE_HEX}}";
        assert_eq!(
            interpolate_command(template, &values).unwrap(),
            "0x30 0x3c 0x03 0x01 0x2c 0x01"
        );
    }

    #[test]
    fn test_missing_value_is_an_error() {
        let err =
            interpolate_command("0x30 0x70 {{INDEX_HEX}}", &Placeholders::default()).unwrap_err();
        assert!(err.to_string().contains("{{INDEX_HEX}}"));
        assert_eq!(
            interpolate_command("0x06 0x01", &Placeholders::default()).unwrap(),
            "0x06 0x01"
        );
    }
}
