//! Chassis configuration structs, defaults, and validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .reasons.join(", "))]
    InvalidConfig { reasons: Vec<String> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChassisConfig {
    pub chassis: ChassisSettings,
    pub control: ControlSettings,
    pub thermal: ThermalSettings,
    pub gateway: GatewaySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChassisSettings {
    pub id: String,
    pub name: String,
    pub population: usize,
    pub fan_count: usize,
    pub psu_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub get_period_ms: u64,
    pub set_period_ms: u64,
    /// Fail-state liveness failures tolerated before forcing reinitialization.
    pub max_fail_count: u32,
    /// Multiplied by population to get the HardPowerOff re-check interval (in passes).
    pub max_retries: u32,
    pub power_off_settle_ms: u64,
    pub serial_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalSettings {
    pub min_pwm: u8,
    pub max_pwm: u8,
    pub step_pwm: u8,
    pub input_sensor_low: f64,
    pub input_sensor_high: f64,
    pub altitude_feet: u32,
    pub altitude_correction_factor: f64,
    pub fan_monitoring_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayBackend {
    Ipmitool,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub backend: GatewayBackend,
    pub command_timeout_ms: u64,
    pub profile: String,
    /// Consecutive transport failures before the gateway reports safe mode.
    pub safe_mode_threshold: u32,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
    pub format: LogFormat,
}

impl Default for ChassisSettings {
    fn default() -> Self {
        let hostname = hostname::get()
            .unwrap_or_else(|_| std::ffi::OsString::from("unknown"))
            .to_string_lossy()
            .to_string();

        // chassis-hostname-UUID (short UUID: first 8 chars)
        let unique_id = Uuid::new_v4();
        let short_uuid = &unique_id.to_string()[..8];

        Self {
            id: format!("chassis-{}-{}", hostname, short_uuid),
            name: hostname,
            population: 24,
            fan_count: 6,
            psu_count: 6,
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            get_period_ms: 30_000,
            set_period_ms: 30_000,
            max_fail_count: 2,
            max_retries: 3,
            power_off_settle_ms: 2_000,
            serial_idle_timeout_secs: 120,
        }
    }
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            min_pwm: 20,
            max_pwm: 100,
            step_pwm: 10,
            input_sensor_low: 0.0,
            input_sensor_high: 100.0,
            altitude_feet: 0,
            altitude_correction_factor: 0.032,
            fan_monitoring_enabled: true,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            backend: GatewayBackend::Ipmitool,
            command_timeout_ms: 5_000,
            profile: "profile.json".to_string(),
            safe_mode_threshold: 5,
            dry_run: false,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ChassisConfig {
    /// Reject configurations the control loops cannot run with; return
    /// warnings for values that are legal but almost certainly wrong.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if self.chassis.population == 0 {
            reasons.push("chassis.population must be at least 1".to_string());
        }
        if self.chassis.fan_count == 0 {
            reasons.push("chassis.fan_count must be at least 1".to_string());
        }
        if self.control.get_period_ms == 0 {
            reasons.push("control.get_period_ms must be non-zero".to_string());
        }
        if self.control.set_period_ms == 0 {
            reasons.push("control.set_period_ms must be non-zero".to_string());
        }
        if self.thermal.min_pwm > self.thermal.max_pwm {
            reasons.push(format!(
                "thermal.min_pwm ({}) exceeds thermal.max_pwm ({})",
                self.thermal.min_pwm, self.thermal.max_pwm
            ));
        }
        if self.thermal.max_pwm > 100 {
            reasons.push(format!("thermal.max_pwm ({}) exceeds 100", self.thermal.max_pwm));
        }
        if self.gateway.command_timeout_ms == 0 {
            reasons.push("gateway.command_timeout_ms must be non-zero".to_string());
        }

        if !reasons.is_empty() {
            return Err(ConfigError::InvalidConfig { reasons });
        }

        if self.thermal.input_sensor_low >= self.thermal.input_sensor_high {
            warnings.push(format!(
                "thermal.input_sensor_low ({}) >= input_sensor_high ({}): every slot will request min_pwm",
                self.thermal.input_sensor_low, self.thermal.input_sensor_high
            ));
        }
        if self.thermal.step_pwm == 0 {
            warnings.push("thermal.step_pwm is 0: fan speed will never ramp down".to_string());
        }
        if self.chassis.psu_count == 0 {
            warnings.push("chassis.psu_count is 0: PSU health is not monitored".to_string());
        }
        if self.gateway.command_timeout_ms >= self.control.set_period_ms {
            warnings.push(format!(
                "gateway.command_timeout_ms ({}) >= control.set_period_ms ({}): a stalled call can starve the watchdog",
                self.gateway.command_timeout_ms, self.control.set_period_ms
            ));
        }

        Ok(warnings)
    }
}
