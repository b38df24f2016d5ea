//! Chassis control core: the health state machine, the telemetry and
//! actuation loops, and the lock-serialized power paths.

pub mod actuation;
pub mod curve;
pub mod health;
pub mod power;
pub mod telemetry;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::chassis::{ChassisState, Slot, SlotRegistry};
use crate::config::types::{ControlSettings, ThermalSettings};
use crate::config::ChassisConfig;
use crate::gateway::DeviceGateway;
use health::SlotContext;

pub use actuation::ActuationLoop;
pub use telemetry::TelemetryLoop;

/// Everything both loops and the external API share. Built once at service
/// start and handed around as `Arc<ControlContext>`.
pub struct ControlContext {
    pub slots: SlotRegistry,
    pub chassis: ChassisState,
    pub gateway: Arc<dyn DeviceGateway>,
    pub control: ControlSettings,
    pub thermal: ThermalSettings,
    pub fan_count: usize,
    pub psu_count: usize,
}

impl ControlContext {
    pub fn new(config: &ChassisConfig, gateway: Arc<dyn DeviceGateway>) -> Self {
        Self {
            slots: SlotRegistry::new(config.chassis.population, config.thermal.min_pwm),
            chassis: ChassisState::new(),
            gateway,
            control: config.control.clone(),
            thermal: config.thermal.clone(),
            fan_count: config.chassis.fan_count,
            psu_count: config.chassis.psu_count,
        }
    }

    pub fn slot_context(&self, slot: &Slot) -> SlotContext {
        SlotContext {
            slot_type: slot.slot_type(),
            fail_count: slot.fail_count(),
            max_fail_count: self.control.max_fail_count,
        }
    }

    pub fn get_period(&self) -> Duration {
        Duration::from_millis(self.control.get_period_ms)
    }

    pub fn set_period(&self) -> Duration {
        Duration::from_millis(self.control.set_period_ms)
    }

    pub fn power_off_settle(&self) -> Duration {
        Duration::from_millis(self.control.power_off_settle_ms)
    }
}

/// How a loop pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed,
    /// Shutdown was observed part-way through.
    Interrupted,
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*s), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*owned), "bang");
        let other: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(&*other), "unknown panic");
    }
}
