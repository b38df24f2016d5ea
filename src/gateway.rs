//! DeviceGateway trait definition: the only path from the control core to hardware.
//!
//! Every call addresses one [`Endpoint`] with one [`Command`] and returns a
//! [`Completion`]. Failures are values, never panics: the control loops turn a
//! [`DeviceFault`] into a state transition (or into nothing at all).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::chassis::{SlotId, SlotType};

pub mod ipmi;
pub mod sim;
pub mod timed;

pub use ipmi::IpmitoolGateway;
pub use sim::SimulatedChassis;
pub use timed::TimedGateway;

/// Addressable hardware endpoints inside the chassis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Endpoint {
    /// Management controller of the sled in bay `n` (1-based).
    Slot(SlotId),
    /// Hot-swap controller driving the power-enable line of bay `n`.
    PowerEnable(SlotId),
    /// A single fan unit (0-based), used for speed probes.
    Fan(usize),
    /// All fan units as one group, used for set-speed.
    FanGroup,
    /// A single power supply (0-based).
    Psu(usize),
    AttentionLed,
    Watchdog,
    SerialConsoles,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Slot(n) => write!(f, "slot {}", n),
            Endpoint::PowerEnable(n) => write!(f, "power-enable {}", n),
            Endpoint::Fan(i) => write!(f, "fan {}", i),
            Endpoint::FanGroup => write!(f, "fan group"),
            Endpoint::Psu(i) => write!(f, "psu {}", i),
            Endpoint::AttentionLed => write!(f, "attention led"),
            Endpoint::Watchdog => write!(f, "watchdog"),
            Endpoint::SerialConsoles => write!(f, "serial consoles"),
        }
    }
}

/// Commands understood by the gateway. Probes are idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Command {
    ReadTemperature,
    ReadPowerEnable,
    SetPowerEnable(bool),
    /// Lightweight identity query (liveness probe).
    Identify,
    /// Re-establish the management session with a sled controller.
    Reinitialize,
    ReadFanSpeed,
    SetFanSpeed(u8),
    ReadPsuStatus,
    ClearPsuFaults,
    ReadAttentionLed,
    SetAttentionLed(bool),
    PulseWatchdog,
    CloseIdleSessions { idle: Duration },
}

impl Command {
    /// Stable name used as the key into chassis profiles and in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ReadTemperature => "read_temperature",
            Command::ReadPowerEnable => "read_power_enable",
            Command::SetPowerEnable(_) => "set_power_enable",
            Command::Identify => "identify",
            Command::Reinitialize => "reinitialize",
            Command::ReadFanSpeed => "read_fan_speed",
            Command::SetFanSpeed(_) => "set_fan_speed",
            Command::ReadPsuStatus => "read_psu_status",
            Command::ClearPsuFaults => "clear_psu_faults",
            Command::ReadAttentionLed => "read_attention_led",
            Command::SetAttentionLed(_) => "set_attention_led",
            Command::PulseWatchdog => "pulse_watchdog",
            Command::CloseIdleSessions { .. } => "close_idle_sessions",
        }
    }
}

/// Successful completion payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    /// Inlet temperature in degrees C.
    Temperature(f64),
    PowerEnable(bool),
    Identity { slot_type: SlotType },
    FanSpeed { rpm: u32 },
    PsuStatus { output_on: bool },
    LedState(bool),
}

/// Non-success completion statuses.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceFault {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("device error (completion code {0:#04x})")]
    DeviceError(u8),
    #[error("command not supported by endpoint")]
    NotSupported,
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),
}

pub type Completion = Result<Payload, DeviceFault>;

impl Payload {
    pub fn into_temperature(self) -> Result<f64, DeviceFault> {
        match self {
            Payload::Temperature(t) => Ok(t),
            other => Err(unexpected("temperature", &other)),
        }
    }

    pub fn into_power_enable(self) -> Result<bool, DeviceFault> {
        match self {
            Payload::PowerEnable(on) => Ok(on),
            other => Err(unexpected("power-enable state", &other)),
        }
    }

    pub fn into_fan_rpm(self) -> Result<u32, DeviceFault> {
        match self {
            Payload::FanSpeed { rpm } => Ok(rpm),
            other => Err(unexpected("fan speed", &other)),
        }
    }

    pub fn into_psu_output_on(self) -> Result<bool, DeviceFault> {
        match self {
            Payload::PsuStatus { output_on } => Ok(output_on),
            other => Err(unexpected("psu status", &other)),
        }
    }

    pub fn into_led_state(self) -> Result<bool, DeviceFault> {
        match self {
            Payload::LedState(on) => Ok(on),
            other => Err(unexpected("led state", &other)),
        }
    }

    /// Identity payloads carry the sled type; anything else counts as a
    /// successful answer of unknown type.
    pub fn slot_type(&self) -> SlotType {
        match self {
            Payload::Identity { slot_type } => *slot_type,
            _ => SlotType::Unknown,
        }
    }
}

fn unexpected(wanted: &str, got: &Payload) -> DeviceFault {
    DeviceFault::UnexpectedPayload(format!("expected {}, got {:?}", wanted, got))
}

#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Issue one command to one endpoint. Must return in bounded time.
    async fn execute(&self, endpoint: Endpoint, command: Command) -> Completion;

    /// Transport-wide degraded condition: probing is suspended and cooling maximized.
    fn safe_mode(&self) -> bool;

    /// Sled type from the transport's session cache (no hardware I/O).
    fn slot_type(&self, slot: SlotId) -> SlotType;
}
