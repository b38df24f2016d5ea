//! Slot records and the registry that owns them.
//!
//! Cross-loop fields are atomics: each is written by one loop (or by the
//! power-command path) and read best-effort by everything else. The only lock
//! is the per-slot power lock, which serializes read-then-write sequences on
//! the power-enable line.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

/// 1-based bay number.
pub type SlotId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotState {
    HardPowerOff,
    Initialization,
    Probation,
    Healthy,
    Fail,
}

impl SlotState {
    fn as_u8(self) -> u8 {
        match self {
            SlotState::HardPowerOff => 0,
            SlotState::Initialization => 1,
            SlotState::Probation => 2,
            SlotState::Healthy => 3,
            SlotState::Fail => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Initialization,
            2 => SlotState::Probation,
            3 => SlotState::Healthy,
            4 => SlotState::Fail,
            _ => SlotState::HardPowerOff,
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SlotType {
    #[default]
    Unknown,
    Compute,
    Jbod,
}

impl SlotType {
    fn as_u8(self) -> u8 {
        match self {
            SlotType::Unknown => 0,
            SlotType::Compute => 1,
            SlotType::Jbod => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotType::Compute,
            2 => SlotType::Jbod,
            _ => SlotType::Unknown,
        }
    }
}

/// One physical bay.
pub struct Slot {
    id: SlotId,
    state: AtomicU8,
    slot_type: AtomicU8,
    fail_count: AtomicU32,
    power_fail_count: AtomicU32,
    fan_requirement: AtomicU8,
    power_lock: Mutex<()>,
}

impl Slot {
    pub fn new(id: SlotId, initial_requirement: u8) -> Self {
        Self {
            id,
            state: AtomicU8::new(SlotState::HardPowerOff.as_u8()),
            slot_type: AtomicU8::new(SlotType::Unknown.as_u8()),
            fail_count: AtomicU32::new(0),
            power_fail_count: AtomicU32::new(0),
            fan_requirement: AtomicU8::new(initial_requirement),
            power_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Store a new state, logging real transitions.
    pub fn set_state(&self, next: SlotState) {
        let prev = SlotState::from_u8(self.state.swap(next.as_u8(), Ordering::Relaxed));
        if prev != next {
            info!("Slot {}: {} -> {}", self.id, prev, next);
        }
    }

    /// Move to `next` only if the slot is still in `from`. Returns whether
    /// the store happened.
    pub fn transition(&self, from: SlotState, next: SlotState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from.as_u8(), next.as_u8(), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok();
        if swapped && from != next {
            info!("Slot {}: {} -> {}", self.id, from, next);
        }
        swapped
    }

    pub fn slot_type(&self) -> SlotType {
        SlotType::from_u8(self.slot_type.load(Ordering::Relaxed))
    }

    pub fn set_slot_type(&self, slot_type: SlotType) {
        self.slot_type.store(slot_type.as_u8(), Ordering::Relaxed);
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::Relaxed)
    }

    pub fn set_fail_count(&self, count: u32) {
        self.fail_count.store(count, Ordering::Relaxed);
    }

    pub fn power_fail_count(&self) -> u32 {
        self.power_fail_count.load(Ordering::Relaxed)
    }

    /// Count one more pass spent in HardPowerOff; returns the new value.
    pub fn bump_power_fail_count(&self) -> u32 {
        self.power_fail_count.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub fn reset_power_fail_count(&self) {
        self.power_fail_count.store(0, Ordering::Relaxed);
    }

    pub fn fan_requirement(&self) -> u8 {
        self.fan_requirement.load(Ordering::Relaxed)
    }

    pub fn set_fan_requirement(&self, pwm: u8) {
        self.fan_requirement.store(pwm, Ordering::Relaxed);
    }

    /// Acquire the power lock. Hold the guard across the whole
    /// probe-then-command sequence on the power-enable line.
    pub async fn lock_power(&self) -> MutexGuard<'_, ()> {
        self.power_lock.lock().await
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("slot_type", &self.slot_type())
            .field("fail_count", &self.fail_count())
            .field("power_fail_count", &self.power_fail_count())
            .field("fan_requirement", &self.fan_requirement())
            .finish()
    }
}

/// Arena of slots, addressed by 1-based bay number. Created once at start.
#[derive(Debug)]
pub struct SlotRegistry {
    slots: Vec<Slot>,
}

impl SlotRegistry {
    pub fn new(population: usize, initial_requirement: u8) -> Self {
        let slots = (1..=population)
            .map(|id| Slot::new(id, initial_requirement))
            .collect();
        Self { slots }
    }

    pub fn population(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        id.checked_sub(1).and_then(|idx| self.slots.get(idx))
    }

    /// Slots in ascending bay order.
    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Highest per-slot fan requirement, or `None` for an empty chassis.
    pub fn max_fan_requirement(&self) -> Option<u8> {
        self.slots.iter().map(Slot::fan_requirement).max()
    }
}
