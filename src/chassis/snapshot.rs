//! Serializable point-in-time view of the chassis, for `--test` output and
//! debug logging.

use serde::Serialize;

use super::{ChassisState, Slot, SlotId, SlotRegistry, SlotState, SlotType};

#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub state: SlotState,
    pub slot_type: SlotType,
    pub fail_count: u32,
    pub power_fail_count: u32,
    pub fan_requirement: u8,
}

impl From<&Slot> for SlotSnapshot {
    fn from(slot: &Slot) -> Self {
        Self {
            id: slot.id(),
            state: slot.state(),
            slot_type: slot.slot_type(),
            fail_count: slot.fail_count(),
            power_fail_count: slot.power_fail_count(),
            fan_requirement: slot.fan_requirement(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChassisSnapshot {
    pub timestamp: String,
    pub fan_failure: bool,
    pub psu_failure: bool,
    pub fan_command: u8,
    pub slots: Vec<SlotSnapshot>,
}

impl ChassisSnapshot {
    /// Relaxed reads: fields may come from different passes of the loops.
    pub fn capture(slots: &SlotRegistry, chassis: &ChassisState) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            fan_failure: chassis.fan_failure(),
            psu_failure: chassis.psu_failure(),
            fan_command: chassis.previous_fan_command(),
            slots: slots.iter().map(SlotSnapshot::from).collect(),
        }
    }
}
