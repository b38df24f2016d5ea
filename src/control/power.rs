//! Power-enable line handling. Every read-then-write on the line holds the
//! slot's power lock for the whole sequence.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chassis::{Slot, SlotId, SlotState};
use crate::control::health::{self, SlotContext, Trigger};
use crate::gateway::{Command, DeviceFault, DeviceGateway, Endpoint};

#[derive(Debug, Error, PartialEq)]
pub enum PowerError {
    #[error("slot {slot}: power-enable probe failed: {fault}")]
    ProbeFailed { slot: SlotId, fault: DeviceFault },
    #[error("slot {slot}: power-enable command failed: {fault}")]
    CommandFailed { slot: SlotId, fault: DeviceFault },
}

/// Whether a power command touched the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerChange {
    Applied,
    AlreadyInState,
}

async fn read_power_enable(slot: &Slot, gateway: &dyn DeviceGateway) -> Result<bool, DeviceFault> {
    gateway
        .execute(Endpoint::PowerEnable(slot.id()), Command::ReadPowerEnable)
        .await
        .and_then(|payload| payload.into_power_enable())
}

fn power_trigger(reading: &Result<bool, DeviceFault>) -> Trigger {
    match reading {
        Ok(true) => Trigger::PowerOn,
        Ok(false) => Trigger::PowerOff,
        Err(_) => Trigger::PowerUnknown,
    }
}

async fn set_power_enable(
    slot: &Slot,
    gateway: &dyn DeviceGateway,
    on: bool,
) -> Result<(), PowerError> {
    gateway
        .execute(Endpoint::PowerEnable(slot.id()), Command::SetPowerEnable(on))
        .await
        .map(|_| ())
        .map_err(|fault| PowerError::CommandFailed { slot: slot.id(), fault })
}

/// Turn the slot on if the line reads OFF. A powered slot re-enters the
/// lifecycle at Initialization.
pub async fn power_on(slot: &Slot, gateway: &dyn DeviceGateway) -> Result<PowerChange, PowerError> {
    let _guard = slot.lock_power().await;

    let on = read_power_enable(slot, gateway)
        .await
        .map_err(|fault| PowerError::ProbeFailed { slot: slot.id(), fault })?;

    let change = if on {
        debug!("Slot {}: power-on requested but line already ON", slot.id());
        PowerChange::AlreadyInState
    } else {
        set_power_enable(slot, gateway, true).await?;
        info!("Slot {}: power-enable ON", slot.id());
        PowerChange::Applied
    };

    if slot.state() == SlotState::HardPowerOff {
        slot.set_state(SlotState::Initialization);
    }
    slot.reset_power_fail_count();
    Ok(change)
}

/// Turn the slot off if the line reads ON, then hold the lock for the settle
/// delay so the hot-swap controller can discharge.
pub async fn power_off(
    slot: &Slot,
    gateway: &dyn DeviceGateway,
    settle: Duration,
) -> Result<PowerChange, PowerError> {
    let _guard = slot.lock_power().await;

    let on = read_power_enable(slot, gateway)
        .await
        .map_err(|fault| PowerError::ProbeFailed { slot: slot.id(), fault })?;

    let change = if on {
        set_power_enable(slot, gateway, false).await?;
        info!("Slot {}: power-enable OFF, settling for {:?}", slot.id(), settle);
        tokio::time::sleep(settle).await;
        PowerChange::Applied
    } else {
        debug!("Slot {}: power-off requested but line already OFF", slot.id());
        PowerChange::AlreadyInState
    };

    slot.set_state(SlotState::HardPowerOff);
    slot.reset_power_fail_count();
    Ok(change)
}

/// Outcome of a locked power-enable check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerReading {
    On,
    Off,
    /// Probe failed; the slot was left where it was.
    Unknown,
    /// The slot left the expected state while we waited for the lock.
    Superseded,
}

/// Read the line under the lock and apply the resulting power trigger, unless
/// the slot left `expected` while we waited for the lock.
pub async fn check_power_enable(
    slot: &Slot,
    gateway: &dyn DeviceGateway,
    expected: SlotState,
    max_fail_count: u32,
) -> PowerReading {
    let _guard = slot.lock_power().await;

    if slot.state() != expected {
        debug!(
            "Slot {}: moved to {} while waiting for power lock; skipping check",
            slot.id(),
            slot.state()
        );
        return PowerReading::Superseded;
    }

    let reading = read_power_enable(slot, gateway).await;
    if let Err(fault) = &reading {
        warn!("Slot {}: power-enable probe failed: {}", slot.id(), fault);
    }

    let ctx = SlotContext {
        slot_type: slot.slot_type(),
        fail_count: slot.fail_count(),
        max_fail_count,
    };
    let decision = health::decide(expected, power_trigger(&reading), &ctx);
    slot.set_fail_count(decision.fail_count);
    slot.set_state(decision.state);

    match reading {
        Ok(true) => PowerReading::On,
        Ok(false) => PowerReading::Off,
        Err(_) => PowerReading::Unknown,
    }
}

/// Startup consistency check: a slot whose line reads ON starts its
/// lifecycle at Initialization, everything else stays in HardPowerOff.
pub async fn reconcile_at_startup(
    slot: &Slot,
    gateway: &dyn DeviceGateway,
    max_fail_count: u32,
) -> PowerReading {
    let reading = check_power_enable(slot, gateway, SlotState::HardPowerOff, max_fail_count).await;
    debug!("Slot {}: power-enable at startup: {:?}", slot.id(), reading);
    reading
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SimulatedChassis;

    #[tokio::test]
    async fn test_power_on_applies_only_when_off() {
        let sim = SimulatedChassis::new(2, 6, 6);
        sim.set_powered(1, false);
        let slot = Slot::new(1, 20);

        assert_eq!(power_on(&slot, &sim).await, Ok(PowerChange::Applied));
        assert_eq!(slot.state(), SlotState::Initialization);
        assert_eq!(power_on(&slot, &sim).await, Ok(PowerChange::AlreadyInState));
        assert_eq!(sim.count_commands(|c| matches!(c, Command::SetPowerEnable(true))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_settles_and_resets_counter() {
        let sim = SimulatedChassis::new(2, 6, 6);
        let slot = Slot::new(1, 20);
        slot.set_state(SlotState::Healthy);
        slot.bump_power_fail_count();

        let start = tokio::time::Instant::now();
        let change = power_off(&slot, &sim, Duration::from_secs(2)).await;
        assert_eq!(change, Ok(PowerChange::Applied));
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(slot.state(), SlotState::HardPowerOff);
        assert_eq!(slot.power_fail_count(), 0);
        assert!(!sim.is_powered(1));
    }

    #[tokio::test]
    async fn test_power_probe_failure_is_reported() {
        let sim = SimulatedChassis::new(1, 6, 6);
        sim.set_power_probe_fails(1, true);
        let slot = Slot::new(1, 20);
        assert!(matches!(
            power_on(&slot, &sim).await,
            Err(PowerError::ProbeFailed { slot: 1, .. })
        ));
        assert_eq!(slot.state(), SlotState::HardPowerOff);
    }

    #[tokio::test]
    async fn test_startup_reconcile() {
        let sim = SimulatedChassis::new(3, 6, 6);
        sim.set_powered(2, false);
        sim.set_power_probe_fails(3, true);
        let slots: Vec<Slot> = (1..=3).map(|id| Slot::new(id, 20)).collect();
        let mut readings = Vec::new();
        for slot in &slots {
            readings.push(reconcile_at_startup(slot, &sim, 2).await);
        }
        assert_eq!(readings, vec![PowerReading::On, PowerReading::Off, PowerReading::Unknown]);
        assert_eq!(slots[0].state(), SlotState::Initialization);
        assert_eq!(slots[1].state(), SlotState::HardPowerOff);
        assert_eq!(slots[2].state(), SlotState::HardPowerOff);
    }

    #[tokio::test]
    async fn test_check_skips_when_state_moved() {
        let sim = SimulatedChassis::new(1, 6, 6);
        let slot = Slot::new(1, 20);
        slot.set_state(SlotState::Initialization);
        let reading = check_power_enable(&slot, &sim, SlotState::HardPowerOff, 2).await;
        assert_eq!(reading, PowerReading::Superseded);
        assert_eq!(sim.count_commands(|c| matches!(c, Command::ReadPowerEnable)), 0);
    }
}
