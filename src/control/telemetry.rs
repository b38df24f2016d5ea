//! Telemetry loop: sweeps every slot once per pass, probes it according to its
//! health state, and keeps the per-slot fan requirement table current.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::curve::interpolate_pwm;
use super::health::{self, Trigger};
use super::power::{check_power_enable, PowerReading};
use super::{panic_message, ControlContext, PassOutcome};
use crate::chassis::{Slot, SlotState, SlotType};
use crate::gateway::{Command, Endpoint, Payload};

pub struct TelemetryLoop {
    ctx: Arc<ControlContext>,
}

impl TelemetryLoop {
    pub fn new(ctx: Arc<ControlContext>) -> Self {
        Self { ctx }
    }

    /// Run passes until shutdown. A panicking pass is logged and the sweep
    /// restarts from the first slot.
    pub async fn run(&self) {
        info!(
            "Telemetry loop starting ({} slots, period {:?})",
            self.ctx.slots.population(),
            self.ctx.get_period()
        );

        let mut consecutive_faults: u32 = 0;
        while !self.ctx.chassis.shutdown.is_set() {
            match AssertUnwindSafe(self.run_pass()).catch_unwind().await {
                Ok(PassOutcome::Completed) => {
                    if consecutive_faults > 0 {
                        debug!(
                            "Telemetry loop recovered after {} faulted passes",
                            consecutive_faults
                        );
                        consecutive_faults = 0;
                    }
                }
                Ok(PassOutcome::Interrupted) => break,
                Err(panic) => {
                    consecutive_faults += 1;
                    error!(
                        "Telemetry pass aborted (count: {}): {}",
                        consecutive_faults,
                        panic_message(&*panic)
                    );
                }
            }
        }

        info!("Telemetry loop stopped");
    }

    /// One sweep over all slots in ascending order, spreading the probes
    /// evenly across the get period.
    pub async fn run_pass(&self) -> PassOutcome {
        let ctx = &self.ctx;
        let population = ctx.slots.population();
        if population == 0 {
            if ctx.chassis.shutdown.sleep(ctx.get_period()).await {
                return PassOutcome::Completed;
            }
            return PassOutcome::Interrupted;
        }

        let spacing = ctx.get_period() / population as u32;
        let mut previous_work = Duration::ZERO;

        for slot in ctx.slots.iter() {
            if ctx.chassis.shutdown.is_set() {
                return PassOutcome::Interrupted;
            }

            slot.set_slot_type(ctx.gateway.slot_type(slot.id()));

            if !ctx.chassis.shutdown.sleep(spacing.saturating_sub(previous_work)).await {
                return PassOutcome::Interrupted;
            }

            let started = Instant::now();
            self.probe_slot(slot)
                .instrument(info_span!("slot", id = slot.id()))
                .await;
            previous_work = started.elapsed();
        }

        PassOutcome::Completed
    }

    /// Apply exactly one sub-logic, chosen by the state the slot is in now.
    pub async fn probe_slot(&self, slot: &Slot) {
        if self.ctx.gateway.safe_mode() {
            debug!("Gateway in safe mode; skipping probes");
            return;
        }

        match slot.state() {
            SlotState::HardPowerOff => self.recheck_power_off(slot).await,
            SlotState::Fail => self.recover_failed(slot).await,
            SlotState::Initialization => self.reinitialize(slot).await,
            state @ (SlotState::Probation | SlotState::Healthy) => {
                self.probe_health(slot, state).await
            }
        }
    }

    /// Count passes spent powered off; past `max_retries * population`,
    /// re-probe the line under the lock so a sled swapped back in without a
    /// clean OFF->ON edge is picked up again.
    async fn recheck_power_off(&self, slot: &Slot) {
        let ctx = &self.ctx;
        let passes = slot.bump_power_fail_count();
        let limit = u64::from(ctx.control.max_retries) * ctx.slots.population() as u64;
        if u64::from(passes) <= limit {
            return;
        }

        debug!("Re-checking power-enable after {} passes in HardPowerOff", passes);
        let reading = check_power_enable(
            slot,
            ctx.gateway.as_ref(),
            SlotState::HardPowerOff,
            ctx.control.max_fail_count,
        )
        .await;
        slot.reset_power_fail_count();
        debug!("Power-enable re-check: {:?}", reading);
    }

    async fn recover_failed(&self, slot: &Slot) {
        let slot_ctx = self.ctx.slot_context(slot);
        if health::retry_budget_exhausted(&slot_ctx) {
            info!(
                "Slot {}: {} failures exceed limit {}; forcing reinitialization",
                slot.id(),
                slot_ctx.fail_count,
                slot_ctx.max_fail_count
            );
            if !slot.transition(SlotState::Fail, SlotState::Initialization) {
                debug!(
                    "Slot {}: left Fail before forced reinitialization (now {})",
                    slot.id(),
                    slot.state()
                );
            }
            return;
        }

        let trigger = match self.execute_on_slot(slot, Command::Identify).await {
            Ok(_) => Trigger::LivenessOk,
            Err(()) => Trigger::LivenessFailed,
        };
        self.apply(slot, SlotState::Fail, trigger);
    }

    async fn reinitialize(&self, slot: &Slot) {
        let ctx = &self.ctx;
        let reading = check_power_enable(
            slot,
            ctx.gateway.as_ref(),
            SlotState::Initialization,
            ctx.control.max_fail_count,
        )
        .await;
        match reading {
            PowerReading::On | PowerReading::Unknown => {}
            PowerReading::Off | PowerReading::Superseded => return,
        }

        let trigger = match self.execute_on_slot(slot, Command::Reinitialize).await {
            Ok(payload) => {
                let slot_type = payload.slot_type();
                if slot_type != SlotType::Unknown {
                    slot.set_slot_type(slot_type);
                }
                Trigger::ReinitSucceeded
            }
            Err(()) => Trigger::ReinitFailed,
        };
        self.apply(slot, SlotState::Initialization, trigger);
    }

    async fn probe_health(&self, slot: &Slot, state: SlotState) {
        if slot.slot_type() == SlotType::Jbod {
            let trigger = match self.execute_on_slot(slot, Command::Identify).await {
                Ok(_) => Trigger::LivenessOk,
                Err(()) => Trigger::LivenessFailed,
            };
            self.apply(slot, state, trigger);
            return;
        }

        let reading = self
            .execute_on_slot(slot, Command::ReadTemperature)
            .await
            .and_then(|payload| {
                payload.into_temperature().map_err(|fault| {
                    warn!("Slot {}: {}", slot.id(), fault);
                })
            });

        let trigger = match reading {
            Ok(celsius) => {
                let pwm = interpolate_pwm(celsius, &self.ctx.thermal);
                debug!("Slot {}: inlet {:.1}°C -> {}%", slot.id(), celsius, pwm);
                slot.set_fan_requirement(pwm);
                Trigger::ThermalOk
            }
            Err(()) => Trigger::ThermalFailed,
        };
        self.apply(slot, state, trigger);
    }

    /// Issue a command to the slot's controller; faults are logged here.
    async fn execute_on_slot(&self, slot: &Slot, command: Command) -> Result<Payload, ()> {
        self.ctx
            .gateway
            .execute(Endpoint::Slot(slot.id()), command)
            .await
            .map_err(|fault| {
                warn!("Slot {}: {} failed: {}", slot.id(), command.name(), fault);
            })
    }

    /// Apply a trigger, unless a power command moved the slot while the probe
    /// was in flight. The state store is a compare-and-swap against `from`.
    fn apply(&self, slot: &Slot, from: SlotState, trigger: Trigger) {
        let decision = health::decide(from, trigger, &self.ctx.slot_context(slot));
        if !slot.transition(from, decision.state) {
            debug!(
                "Slot {}: left {} during probe (now {}); dropping {:?}",
                slot.id(),
                from,
                slot.state(),
                trigger
            );
            return;
        }
        slot.set_fail_count(decision.fail_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChassisConfig;
    use crate::gateway::SimulatedChassis;

    fn setup(population: usize) -> (Arc<SimulatedChassis>, TelemetryLoop) {
        let mut config = ChassisConfig::default();
        config.chassis.population = population;
        config.control.get_period_ms = 1_000;
        let sim = Arc::new(SimulatedChassis::new(population, 6, 6));
        let ctx = Arc::new(ControlContext::new(&config, sim.clone()));
        (sim, TelemetryLoop::new(ctx))
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialization_reinitializes_and_caches_type() {
        let (sim, telemetry) = setup(1);
        sim.set_slot_type(1, SlotType::Jbod);
        let slot = telemetry.ctx.slots.get(1).unwrap();
        slot.set_state(SlotState::Initialization);
        slot.set_fail_count(3);

        telemetry.probe_slot(slot).await;
        assert_eq!(slot.state(), SlotState::Probation);
        assert_eq!(slot.fail_count(), 0);
        assert_eq!(slot.slot_type(), SlotType::Jbod);
        assert_eq!(telemetry.ctx.gateway.slot_type(1), SlotType::Jbod);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialization_with_line_off_drops_to_power_off() {
        let (sim, telemetry) = setup(1);
        sim.set_powered(1, false);
        let slot = telemetry.ctx.slots.get(1).unwrap();
        slot.set_state(SlotState::Initialization);

        telemetry.probe_slot(slot).await;
        assert_eq!(slot.state(), SlotState::HardPowerOff);
        assert_eq!(sim.count_commands(|c| matches!(c, Command::Reinitialize)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thermal_probe_sets_requirement() {
        let (sim, telemetry) = setup(1);
        sim.set_temperature(1, 75.0);
        let slot = telemetry.ctx.slots.get(1).unwrap();
        slot.set_state(SlotState::Probation);

        telemetry.probe_slot(slot).await;
        assert_eq!(slot.state(), SlotState::Healthy);
        assert_eq!(slot.fan_requirement(), 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_keeps_last_requirement() {
        let (sim, telemetry) = setup(1);
        let slot = telemetry.ctx.slots.get(1).unwrap();
        slot.set_state(SlotState::Healthy);
        slot.set_fan_requirement(70);
        sim.set_responsive(1, false);

        telemetry.probe_slot(slot).await;
        assert_eq!(slot.state(), SlotState::Fail);
        assert_eq!(slot.fan_requirement(), 70);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jbod_skips_thermal_probe() {
        let (sim, telemetry) = setup(1);
        sim.set_slot_type(1, SlotType::Jbod);
        let slot = telemetry.ctx.slots.get(1).unwrap();
        slot.set_slot_type(SlotType::Jbod);
        slot.set_state(SlotState::Probation);

        telemetry.probe_slot(slot).await;
        assert_eq!(slot.state(), SlotState::Healthy);
        assert_eq!(sim.count_commands(|c| matches!(c, Command::ReadTemperature)), 0);
        assert_eq!(sim.count_commands(|c| matches!(c, Command::Identify)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_recovers_on_liveness() {
        let (_sim, telemetry) = setup(1);
        let slot = telemetry.ctx.slots.get(1).unwrap();
        slot.set_state(SlotState::Fail);
        slot.set_fail_count(1);

        telemetry.probe_slot(slot).await;
        assert_eq!(slot.state(), SlotState::Probation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_skips_probe() {
        let (sim, telemetry) = setup(1);
        let slot = telemetry.ctx.slots.get(1).unwrap();
        slot.set_state(SlotState::Fail);
        slot.set_fail_count(3);

        telemetry.probe_slot(slot).await;
        assert_eq!(slot.state(), SlotState::Initialization);
        assert!(sim.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_safe_mode_skips_slot() {
        let (sim, telemetry) = setup(1);
        sim.set_safe_mode(true);
        let slot = telemetry.ctx.slots.get(1).unwrap();
        slot.set_state(SlotState::Healthy);

        telemetry.probe_slot(slot).await;
        assert_eq!(slot.state(), SlotState::Healthy);
        assert!(sim.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_is_dropped_once_slot_was_powered_off() {
        let (_sim, telemetry) = setup(1);
        let slot = telemetry.ctx.slots.get(1).unwrap();
        slot.set_state(SlotState::HardPowerOff);

        telemetry.apply(slot, SlotState::Healthy, Trigger::ThermalFailed);
        assert_eq!(slot.state(), SlotState::HardPowerOff);

        slot.set_state(SlotState::Fail);
        slot.set_fail_count(1);
        telemetry.apply(slot, SlotState::Healthy, Trigger::ThermalOk);
        assert_eq!(slot.state(), SlotState::Fail);
        assert_eq!(slot.fail_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inverted_pwm_bounds_keep_the_pass_running() {
        let mut config = ChassisConfig::default();
        config.chassis.population = 2;
        config.control.get_period_ms = 1_000;
        config.thermal.min_pwm = 60;
        config.thermal.max_pwm = 40;
        let sim = Arc::new(SimulatedChassis::new(2, 6, 6));
        let telemetry = TelemetryLoop::new(Arc::new(ControlContext::new(&config, sim.clone())));
        for slot in telemetry.ctx.slots.iter() {
            slot.set_state(SlotState::Healthy);
        }

        let outcome = AssertUnwindSafe(telemetry.run_pass()).catch_unwind().await;
        assert!(matches!(outcome, Ok(PassOutcome::Completed)));
        assert_eq!(sim.count_commands(|c| matches!(c, Command::ReadTemperature)), 2);
        for slot in telemetry.ctx.slots.iter() {
            assert_eq!(slot.state(), SlotState::Healthy);
            assert!((40..=60).contains(&slot.fan_requirement()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_spreads_probes_over_period() {
        let (_sim, telemetry) = setup(4);
        for slot in telemetry.ctx.slots.iter() {
            slot.set_state(SlotState::Healthy);
        }
        let start = Instant::now();
        assert_eq!(telemetry.run_pass().await, PassOutcome::Completed);
        // 4 slots at 250 ms spacing, gateway answers instantly.
        assert_eq!(start.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_shortens_next_spacing() {
        let (sim, telemetry) = setup(4);
        sim.set_latency(Some(Duration::from_millis(100)));
        for slot in telemetry.ctx.slots.iter() {
            slot.set_state(SlotState::Healthy);
        }
        let start = Instant::now();
        telemetry.run_pass().await;
        // 250 + 3 * (250 - 100) spacing, plus 4 * 100 of probe work.
        assert_eq!(start.elapsed(), Duration::from_millis(1_100));
    }
}
