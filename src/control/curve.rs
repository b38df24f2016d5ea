//! Temperature-to-PWM interpolation and the chassis fan command pipeline.

use tracing::warn;

use crate::config::types::ThermalSettings;

/// Map a slot's inlet reading onto `[min_pwm, max_pwm]`.
///
/// Inverted thresholds or a reading outside `[low, high]` fall back to
/// `min_pwm` with a warning.
pub fn interpolate_pwm(reading: f64, thermal: &ThermalSettings) -> u8 {
    let low = thermal.input_sensor_low;
    let high = thermal.input_sensor_high;
    let min = thermal.min_pwm;
    let max = thermal.max_pwm;

    if low >= high {
        warn!(
            "Input sensor thresholds inverted (low {} >= high {}); requesting min PWM {}",
            low, high, min
        );
        return min;
    }
    if !(low..=high).contains(&reading) {
        warn!(
            "Inlet reading {:.1} outside [{}, {}]; requesting min PWM {}",
            reading, low, high, min
        );
        return min;
    }

    let span = f64::from(max.saturating_sub(min));
    let pwm = f64::from(min) + (reading - low) / (high - low) * span;
    clamp_pwm(pwm, min, max)
}

/// Inverted bounds are tolerated: the result lands between them either way.
fn clamp_pwm(pwm: f64, min: u8, max: u8) -> u8 {
    let (lo, hi) = (min.min(max), min.max(max));
    pwm.round().clamp(f64::from(lo), f64::from(hi)) as u8
}

/// Scale for fan units that are not spinning.
///
/// One unit down: spread its share across the rest. More than one down (or
/// the only unit down): `None`, meaning run at maximum.
pub fn compensate_for_fan_failures(required: f64, total: usize, working: usize) -> Option<f64> {
    let down = total.saturating_sub(working);
    match down {
        0 => Some(required),
        1 if total > 1 => Some(required * total as f64 / (total - 1) as f64),
        _ => None,
    }
}

/// Air is thinner at altitude: `1 + factor * floor(feet / 1000)`.
pub fn altitude_multiplier(altitude_feet: u32, factor: f64) -> f64 {
    1.0 + factor * f64::from(altitude_feet / 1000)
}

/// Bound decreases to `step` per pass; increases pass through.
///
/// This steps by `max(required, previous - step)` rather than only stepping
/// once `previous >= required + 2 * step`, so the command never drops more
/// than `step` in one pass and still settles exactly on `required`.
///
/// A `previous` of 0 means no command has been issued yet.
pub fn limit_ramp_down(required: u8, previous: u8, step: u8) -> u8 {
    if previous == 0 {
        return required;
    }
    required.max(previous.saturating_sub(step))
}

/// Inputs for one actuation pass.
#[derive(Debug, Clone, Copy)]
pub struct FanInputs {
    /// Highest per-slot requirement.
    pub required: u8,
    pub safe_mode: bool,
    pub total_fans: usize,
    pub working_fans: usize,
    pub previous_command: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanDecision {
    pub command: u8,
    pub fan_failure: bool,
}

/// Full chassis fan pipeline: safe mode, fan-failure compensation, altitude,
/// clamp, ramp-down limit.
pub fn compute_fan_command(inputs: &FanInputs, thermal: &ThermalSettings) -> FanDecision {
    let max = f64::from(thermal.max_pwm);

    let mut required = if inputs.safe_mode { max } else { f64::from(inputs.required) };

    let fan_failure = inputs.working_fans < inputs.total_fans;
    required = compensate_for_fan_failures(required, inputs.total_fans, inputs.working_fans)
        .unwrap_or(max);

    required *= altitude_multiplier(thermal.altitude_feet, thermal.altitude_correction_factor);

    let clamped = clamp_pwm(required, thermal.min_pwm, thermal.max_pwm);
    let command = limit_ramp_down(clamped, inputs.previous_command, thermal.step_pwm);

    FanDecision { command, fan_failure }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thermal() -> ThermalSettings {
        ThermalSettings::default()
    }

    fn inputs(required: u8, working: usize, previous: u8) -> FanInputs {
        FanInputs {
            required,
            safe_mode: false,
            total_fans: 6,
            working_fans: working,
            previous_command: previous,
        }
    }

    #[test]
    fn test_interpolate_midpoint() {
        assert_eq!(interpolate_pwm(50.0, &thermal()), 60);
        assert_eq!(interpolate_pwm(0.0, &thermal()), 20);
        assert_eq!(interpolate_pwm(100.0, &thermal()), 100);
    }

    #[test]
    fn test_interpolate_out_of_range_uses_min() {
        assert_eq!(interpolate_pwm(-5.0, &thermal()), 20);
        assert_eq!(interpolate_pwm(120.0, &thermal()), 20);
        assert_eq!(interpolate_pwm(f64::NAN, &thermal()), 20);
    }

    #[test]
    fn test_interpolate_inverted_thresholds_use_min() {
        let mut t = thermal();
        t.input_sensor_low = 60.0;
        t.input_sensor_high = 60.0;
        assert_eq!(interpolate_pwm(60.0, &t), 20);
    }

    #[test]
    fn test_interpolate_stays_in_bounds() {
        let t = thermal();
        let mut reading = -50.0;
        while reading <= 150.0 {
            let pwm = interpolate_pwm(reading, &t);
            assert!((t.min_pwm..=t.max_pwm).contains(&pwm), "{} -> {}", reading, pwm);
            reading += 0.7;
        }
    }

    #[test]
    fn test_inverted_pwm_bounds_do_not_panic() {
        let mut t = thermal();
        t.min_pwm = 60;
        t.max_pwm = 40;
        let pwm = interpolate_pwm(50.0, &t);
        assert!((40..=60).contains(&pwm), "{}", pwm);
        let command = compute_fan_command(&inputs(90, 6, 0), &t).command;
        assert!((40..=60).contains(&command), "{}", command);
    }

    #[test]
    fn test_fan_failure_compensation() {
        assert_eq!(compensate_for_fan_failures(50.0, 6, 6), Some(50.0));
        let one_down = compensate_for_fan_failures(50.0, 6, 5).unwrap();
        assert!((one_down - 60.0).abs() < 1e-9);
        assert_eq!(compensate_for_fan_failures(50.0, 6, 4), None);
        assert_eq!(compensate_for_fan_failures(50.0, 1, 0), None);
    }

    #[test]
    fn test_one_fan_down_scales_and_flags() {
        let d = compute_fan_command(&inputs(50, 5, 0), &thermal());
        assert_eq!(d, FanDecision { command: 60, fan_failure: true });
    }

    #[test]
    fn test_two_fans_down_forces_max() {
        let d = compute_fan_command(&inputs(20, 4, 0), &thermal());
        assert_eq!(d, FanDecision { command: 100, fan_failure: true });
    }

    #[test]
    fn test_safe_mode_forces_max() {
        let mut i = inputs(20, 6, 0);
        i.safe_mode = true;
        assert_eq!(compute_fan_command(&i, &thermal()).command, 100);
    }

    #[test]
    fn test_altitude_correction() {
        let mut t = thermal();
        t.altitude_feet = 5_999;
        let multiplier = altitude_multiplier(t.altitude_feet, t.altitude_correction_factor);
        assert!((multiplier - 1.16).abs() < 1e-9);
        // 50 * 1.16 = 58
        assert_eq!(compute_fan_command(&inputs(50, 6, 0), &t).command, 58);
    }

    #[test]
    fn test_clamped_to_max() {
        let mut t = thermal();
        t.altitude_feet = 10_000;
        assert_eq!(compute_fan_command(&inputs(95, 5, 0), &t).command, 100);
    }

    #[test]
    fn test_ramp_down_is_step_limited() {
        assert_eq!(compute_fan_command(&inputs(20, 6, 100), &thermal()).command, 90);
        assert_eq!(compute_fan_command(&inputs(85, 6, 100), &thermal()).command, 90);
        assert_eq!(compute_fan_command(&inputs(95, 6, 100), &thermal()).command, 95);
    }

    #[test]
    fn test_ramp_up_is_immediate() {
        assert_eq!(compute_fan_command(&inputs(100, 6, 20), &thermal()).command, 100);
    }

    #[test]
    fn test_ramp_down_bound_holds_over_sequences() {
        let t = thermal();
        let demands = [100u8, 20, 20, 75, 30, 20, 90, 20, 20, 20, 20, 20];
        let mut previous = 0u8;
        for demand in demands {
            let command = compute_fan_command(&inputs(demand, 6, previous), &t).command;
            if previous != 0 {
                assert!(command >= previous.saturating_sub(t.step_pwm));
            }
            previous = command;
        }
        assert_eq!(previous, 40);
    }
}
