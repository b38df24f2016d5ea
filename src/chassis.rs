//! Shared chassis state: the per-slot registry and the chassis-wide aggregate flags.

pub mod aggregate;
pub mod slot;
pub mod snapshot;

pub use aggregate::{AggregateHealth, ChassisState, ShutdownSignal};
pub use slot::{Slot, SlotId, SlotRegistry, SlotState, SlotType};
pub use snapshot::{ChassisSnapshot, SlotSnapshot};
