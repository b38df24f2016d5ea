//! In-process simulated chassis implementing [`DeviceGateway`].
//!
//! Backs `--simulate` runs and the test suite. The most recent commands are
//! recorded so callers can assert on what reached the "hardware".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{Command, Completion, DeviceFault, DeviceGateway, Endpoint, Payload};
use crate::chassis::{SlotId, SlotType};

/// Completion code a real controller returns for a missing device.
const NOT_PRESENT: u8 = 0xcb;
/// Reported duration for an unresponsive controller.
const SIMULATED_TIMEOUT: Duration = Duration::from_secs(5);
/// Oldest entries are dropped past this many recorded commands.
const COMMAND_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct SimSled {
    powered: bool,
    responsive: bool,
    power_probe_fails: bool,
    temperature: f64,
    slot_type: SlotType,
    cached_type: SlotType,
}

impl Default for SimSled {
    fn default() -> Self {
        Self {
            powered: true,
            responsive: true,
            power_probe_fails: false,
            temperature: 25.0,
            slot_type: SlotType::Compute,
            cached_type: SlotType::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
struct SimPsu {
    output_on: bool,
    clearable: bool,
}

#[derive(Debug, Default)]
struct SimState {
    sleds: Vec<SimSled>,
    fan_rpm: Vec<u32>,
    psus: Vec<SimPsu>,
    led_on: bool,
    fan_command: Option<u8>,
    watchdog_pulses: u32,
    console_sweeps: u32,
    latency: Option<Duration>,
    log: VecDeque<(Endpoint, Command)>,
}

pub struct SimulatedChassis {
    state: Mutex<SimState>,
    safe_mode: AtomicBool,
}

impl SimulatedChassis {
    /// Fully populated chassis: every sled powered, responsive, compute, 25 °C.
    pub fn new(population: usize, fan_count: usize, psu_count: usize) -> Self {
        let state = SimState {
            sleds: vec![SimSled::default(); population],
            fan_rpm: vec![6000; fan_count],
            psus: vec![SimPsu { output_on: true, clearable: true }; psu_count],
            ..SimState::default()
        };
        Self {
            state: Mutex::new(state),
            safe_mode: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_sled(&self, slot: SlotId, f: impl FnOnce(&mut SimSled)) {
        let mut state = self.lock();
        if let Some(sled) = slot.checked_sub(1).and_then(|i| state.sleds.get_mut(i)) {
            f(sled);
        }
    }

    pub fn set_powered(&self, slot: SlotId, powered: bool) {
        self.with_sled(slot, |s| s.powered = powered);
    }

    pub fn is_powered(&self, slot: SlotId) -> bool {
        let state = self.lock();
        slot.checked_sub(1)
            .and_then(|i| state.sleds.get(i))
            .map(|s| s.powered)
            .unwrap_or(false)
    }

    /// An unresponsive controller times out on every slot command.
    pub fn set_responsive(&self, slot: SlotId, responsive: bool) {
        self.with_sled(slot, |s| s.responsive = responsive);
    }

    pub fn set_power_probe_fails(&self, slot: SlotId, fails: bool) {
        self.with_sled(slot, |s| s.power_probe_fails = fails);
    }

    pub fn set_temperature(&self, slot: SlotId, celsius: f64) {
        self.with_sled(slot, |s| s.temperature = celsius);
    }

    pub fn set_slot_type(&self, slot: SlotId, slot_type: SlotType) {
        self.with_sled(slot, |s| s.slot_type = slot_type);
    }

    /// Physically pull or reseat a sled. Reseating brings the line up without
    /// any power command.
    pub fn set_present(&self, slot: SlotId, present: bool) {
        self.with_sled(slot, |s| {
            s.powered = present;
            s.responsive = present;
        });
    }

    pub fn set_fan_rpm(&self, fan: usize, rpm: u32) {
        if let Some(r) = self.lock().fan_rpm.get_mut(fan) {
            *r = rpm;
        }
    }

    pub fn set_psu_output(&self, psu: usize, output_on: bool, clearable: bool) {
        if let Some(p) = self.lock().psus.get_mut(psu) {
            p.output_on = output_on;
            p.clearable = clearable;
        }
    }

    pub fn set_safe_mode(&self, safe_mode: bool) {
        self.safe_mode.store(safe_mode, Ordering::SeqCst);
    }

    /// Delay every answer by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn led_on(&self) -> bool {
        self.lock().led_on
    }

    pub fn fan_command(&self) -> Option<u8> {
        self.lock().fan_command
    }

    pub fn watchdog_pulses(&self) -> u32 {
        self.lock().watchdog_pulses
    }

    pub fn console_sweeps(&self) -> u32 {
        self.lock().console_sweeps
    }

    pub fn commands(&self) -> Vec<(Endpoint, Command)> {
        self.lock().log.iter().copied().collect()
    }

    pub fn count_commands(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.lock().log.iter().filter(|(_, c)| pred(c)).count()
    }

    fn answer(state: &mut SimState, endpoint: Endpoint, command: Command) -> Completion {
        match endpoint {
            Endpoint::PowerEnable(slot) => {
                let sled = sled_mut(state, slot)?;
                match command {
                    Command::ReadPowerEnable if sled.power_probe_fails => {
                        Err(DeviceFault::DeviceError(0xff))
                    }
                    Command::ReadPowerEnable => Ok(Payload::PowerEnable(sled.powered)),
                    Command::SetPowerEnable(on) => {
                        sled.powered = on;
                        sled.responsive = on;
                        Ok(Payload::Empty)
                    }
                    _ => Err(DeviceFault::NotSupported),
                }
            }
            Endpoint::Slot(slot) => {
                let sled = sled_mut(state, slot)?;
                if !(sled.powered && sled.responsive) {
                    return Err(DeviceFault::Timeout(SIMULATED_TIMEOUT));
                }
                match command {
                    Command::Identify => Ok(Payload::Identity { slot_type: sled.slot_type }),
                    Command::Reinitialize => {
                        sled.cached_type = sled.slot_type;
                        Ok(Payload::Identity { slot_type: sled.slot_type })
                    }
                    Command::ReadTemperature if sled.slot_type == SlotType::Jbod => {
                        Err(DeviceFault::NotSupported)
                    }
                    Command::ReadTemperature => Ok(Payload::Temperature(sled.temperature)),
                    _ => Err(DeviceFault::NotSupported),
                }
            }
            Endpoint::Fan(fan) => match command {
                Command::ReadFanSpeed => state
                    .fan_rpm
                    .get(fan)
                    .map(|&rpm| Payload::FanSpeed { rpm })
                    .ok_or(DeviceFault::DeviceError(NOT_PRESENT)),
                _ => Err(DeviceFault::NotSupported),
            },
            Endpoint::FanGroup => match command {
                Command::SetFanSpeed(pwm) => {
                    state.fan_command = Some(pwm);
                    Ok(Payload::Empty)
                }
                _ => Err(DeviceFault::NotSupported),
            },
            Endpoint::Psu(psu) => {
                let unit = state.psus.get_mut(psu).ok_or(DeviceFault::DeviceError(NOT_PRESENT))?;
                match command {
                    Command::ReadPsuStatus => Ok(Payload::PsuStatus { output_on: unit.output_on }),
                    Command::ClearPsuFaults => {
                        if unit.clearable {
                            unit.output_on = true;
                        }
                        Ok(Payload::Empty)
                    }
                    _ => Err(DeviceFault::NotSupported),
                }
            }
            Endpoint::AttentionLed => match command {
                Command::ReadAttentionLed => Ok(Payload::LedState(state.led_on)),
                Command::SetAttentionLed(on) => {
                    state.led_on = on;
                    Ok(Payload::Empty)
                }
                _ => Err(DeviceFault::NotSupported),
            },
            Endpoint::Watchdog => match command {
                Command::PulseWatchdog => {
                    state.watchdog_pulses += 1;
                    Ok(Payload::Empty)
                }
                _ => Err(DeviceFault::NotSupported),
            },
            Endpoint::SerialConsoles => match command {
                Command::CloseIdleSessions { .. } => {
                    state.console_sweeps += 1;
                    Ok(Payload::Empty)
                }
                _ => Err(DeviceFault::NotSupported),
            },
        }
    }
}

fn sled_mut(state: &mut SimState, slot: SlotId) -> Result<&mut SimSled, DeviceFault> {
    slot.checked_sub(1)
        .and_then(|i| state.sleds.get_mut(i))
        .ok_or(DeviceFault::DeviceError(NOT_PRESENT))
}

#[async_trait]
impl DeviceGateway for SimulatedChassis {
    async fn execute(&self, endpoint: Endpoint, command: Command) -> Completion {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if state.log.len() == COMMAND_LOG_CAPACITY {
            state.log.pop_front();
        }
        state.log.push_back((endpoint, command));
        let completion = Self::answer(&mut state, endpoint, command);
        trace!("sim: {} {} -> {:?}", endpoint, command.name(), completion);
        completion
    }

    fn safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    fn slot_type(&self, slot: SlotId) -> SlotType {
        let state = self.lock();
        slot.checked_sub(1)
            .and_then(|i| state.sleds.get(i))
            .map(|s| s.cached_type)
            .unwrap_or_default()
    }
}
