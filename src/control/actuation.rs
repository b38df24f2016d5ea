//! Actuation loop: turns the requirement table into one chassis fan command
//! per period, then runs the housekeeping duties (console sessions, watchdog,
//! PSU faults, attention LED).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use super::curve::{compute_fan_command, FanDecision, FanInputs};
use super::{panic_message, ControlContext, PassOutcome};
use crate::chassis::snapshot::ChassisSnapshot;
use crate::gateway::{Command, Endpoint};

pub struct ActuationLoop {
    ctx: Arc<ControlContext>,
}

impl ActuationLoop {
    pub fn new(ctx: Arc<ControlContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) {
        info!("Actuation loop starting (period {:?})", self.ctx.set_period());

        let mut consecutive_faults: u32 = 0;
        while !self.ctx.chassis.shutdown.is_set() {
            match AssertUnwindSafe(self.run_pass()).catch_unwind().await {
                Ok(PassOutcome::Completed) => {
                    if consecutive_faults > 0 {
                        debug!(
                            "Actuation loop recovered after {} faulted passes",
                            consecutive_faults
                        );
                        consecutive_faults = 0;
                    }
                }
                Ok(PassOutcome::Interrupted) => break,
                Err(panic) => {
                    consecutive_faults += 1;
                    error!(
                        "Actuation pass aborted (count: {}): {}",
                        consecutive_faults,
                        panic_message(&*panic)
                    );
                }
            }
        }

        info!("Actuation loop stopped");
    }

    /// Sleep one set period, then actuate.
    pub async fn run_pass(&self) -> PassOutcome {
        if !self.ctx.chassis.shutdown.sleep(self.ctx.set_period()).await {
            return PassOutcome::Interrupted;
        }
        self.actuate().await;
        PassOutcome::Completed
    }

    /// One round of actuation without the leading sleep.
    pub async fn actuate(&self) {
        self.update_fans().await;
        self.close_idle_consoles().await;
        self.pulse_watchdog().await;
        self.sweep_psus().await;
        self.update_attention_led().await;

        let snapshot = ChassisSnapshot::capture(&self.ctx.slots, &self.ctx.chassis);
        match serde_json::to_string(&snapshot) {
            Ok(json) => debug!("Chassis snapshot: {}", json),
            Err(e) => debug!("Failed to serialize chassis snapshot: {}", e),
        }
    }

    async fn update_fans(&self) -> FanDecision {
        let ctx = &self.ctx;
        let thermal = &ctx.thermal;

        let inputs = FanInputs {
            required: ctx.slots.max_fan_requirement().unwrap_or(thermal.min_pwm),
            safe_mode: ctx.gateway.safe_mode(),
            total_fans: ctx.fan_count,
            working_fans: self.count_working_fans().await,
            previous_command: ctx.chassis.previous_fan_command(),
        };
        let decision = compute_fan_command(&inputs, thermal);

        if decision.fan_failure != ctx.chassis.fan_failure() {
            if decision.fan_failure {
                warn!(
                    "Fan failure: {} of {} fan units working",
                    inputs.working_fans, inputs.total_fans
                );
            } else {
                info!("All {} fan units working again", inputs.total_fans);
            }
        }
        ctx.chassis.set_fan_failure(decision.fan_failure);

        match ctx
            .gateway
            .execute(Endpoint::FanGroup, Command::SetFanSpeed(decision.command))
            .await
        {
            Ok(_) => debug!(
                "Fan command {}% (required {}%, safe mode {})",
                decision.command, inputs.required, inputs.safe_mode
            ),
            Err(fault) => warn!("Failed to set fan speed to {}%: {}", decision.command, fault),
        }
        ctx.chassis.set_previous_fan_command(decision.command);
        decision
    }

    /// A fan unit works when its speed probe succeeds and reports a nonzero speed.
    async fn count_working_fans(&self) -> usize {
        let mut working = 0;
        for fan in 0..self.ctx.fan_count {
            match self
                .ctx
                .gateway
                .execute(Endpoint::Fan(fan), Command::ReadFanSpeed)
                .await
                .and_then(|payload| payload.into_fan_rpm())
            {
                Ok(0) => debug!("Fan {} reports 0 RPM", fan),
                Ok(_) => working += 1,
                Err(fault) => debug!("Fan {} speed probe failed: {}", fan, fault),
            }
        }
        working
    }

    async fn close_idle_consoles(&self) {
        let idle = Duration::from_secs(self.ctx.control.serial_idle_timeout_secs);
        if let Err(fault) = self
            .ctx
            .gateway
            .execute(Endpoint::SerialConsoles, Command::CloseIdleSessions { idle })
            .await
        {
            debug!("Serial console housekeeping failed: {}", fault);
        }
    }

    async fn pulse_watchdog(&self) {
        if let Err(fault) = self
            .ctx
            .gateway
            .execute(Endpoint::Watchdog, Command::PulseWatchdog)
            .await
        {
            warn!("Watchdog pulse failed: {}", fault);
        }
    }

    /// Probe every PSU; try to clear faults on any whose output is not ON.
    async fn sweep_psus(&self) {
        let ctx = &self.ctx;
        let mut healthy = 0;

        for psu in 0..ctx.psu_count {
            let status = ctx
                .gateway
                .execute(Endpoint::Psu(psu), Command::ReadPsuStatus)
                .await
                .and_then(|payload| payload.into_psu_output_on());
            match status {
                Ok(true) => healthy += 1,
                Ok(false) => {
                    warn!("PSU {} output not ON; clearing faults", psu);
                    if let Err(fault) = ctx
                        .gateway
                        .execute(Endpoint::Psu(psu), Command::ClearPsuFaults)
                        .await
                    {
                        warn!("PSU {} clear-fault failed: {}", psu, fault);
                    }
                }
                Err(fault) => warn!("PSU {} status probe failed: {}", psu, fault),
            }
        }

        let failed = healthy != ctx.psu_count;
        if failed != ctx.chassis.psu_failure() {
            if failed {
                warn!("PSU failure: {} of {} healthy", healthy, ctx.psu_count);
            } else {
                info!("All {} PSUs healthy again", ctx.psu_count);
            }
        }
        ctx.chassis.set_psu_failure(failed);
    }

    /// Write the LED only when the probed state differs from the desired one.
    async fn update_attention_led(&self) {
        let ctx = &self.ctx;
        let desired = (ctx.chassis.fan_failure() && ctx.thermal.fan_monitoring_enabled)
            || ctx.chassis.psu_failure();

        match ctx
            .gateway
            .execute(Endpoint::AttentionLed, Command::ReadAttentionLed)
            .await
            .and_then(|payload| payload.into_led_state())
        {
            Ok(current) if current == desired => return,
            Ok(_) => {}
            Err(fault) => debug!("Attention LED probe failed ({}); writing desired state", fault),
        }

        match ctx
            .gateway
            .execute(Endpoint::AttentionLed, Command::SetAttentionLed(desired))
            .await
        {
            Ok(_) => info!("Attention LED {}", if desired { "ON" } else { "OFF" }),
            Err(fault) => warn!("Failed to set attention LED: {}", fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chassis::SlotState;
    use crate::config::ChassisConfig;
    use crate::gateway::SimulatedChassis;

    fn setup() -> (Arc<SimulatedChassis>, ActuationLoop) {
        let mut config = ChassisConfig::default();
        config.chassis.population = 2;
        config.chassis.fan_count = 6;
        config.chassis.psu_count = 2;
        let sim = Arc::new(SimulatedChassis::new(2, 6, 2));
        let ctx = Arc::new(ControlContext::new(&config, sim.clone()));
        (sim, ActuationLoop::new(ctx))
    }

    #[tokio::test]
    async fn test_fan_command_follows_hottest_slot() {
        let (sim, actuation) = setup();
        actuation.ctx.slots.get(2).unwrap().set_fan_requirement(60);
        actuation.actuate().await;
        assert_eq!(sim.fan_command(), Some(60));
        assert_eq!(actuation.ctx.chassis.previous_fan_command(), 60);
        assert!(!actuation.ctx.chassis.fan_failure());
    }

    #[tokio::test]
    async fn test_one_fan_down_scales_command() {
        let (sim, actuation) = setup();
        sim.set_fan_rpm(3, 0);
        actuation.ctx.slots.get(1).unwrap().set_fan_requirement(50);
        let decision = actuation.update_fans().await;
        assert_eq!(decision, FanDecision { command: 60, fan_failure: true });
        assert!(actuation.ctx.chassis.fan_failure());
    }

    #[tokio::test]
    async fn test_safe_mode_forces_max() {
        let (sim, actuation) = setup();
        sim.set_safe_mode(true);
        actuation.actuate().await;
        assert_eq!(sim.fan_command(), Some(100));
    }

    #[tokio::test]
    async fn test_psu_fault_is_cleared_and_flagged() {
        let (sim, actuation) = setup();
        sim.set_psu_output(1, false, false);
        actuation.actuate().await;
        assert!(actuation.ctx.chassis.psu_failure());
        assert!(sim.led_on());
        assert_eq!(sim.count_commands(|c| matches!(c, Command::ClearPsuFaults)), 1);

        // A clearable fault recovers on the next sweep's probe.
        sim.set_psu_output(1, false, true);
        actuation.actuate().await;
        actuation.actuate().await;
        assert!(!actuation.ctx.chassis.psu_failure());
        assert!(!sim.led_on());
    }

    #[tokio::test]
    async fn test_led_written_only_on_change() {
        let (sim, actuation) = setup();
        actuation.actuate().await;
        actuation.actuate().await;
        assert_eq!(sim.count_commands(|c| matches!(c, Command::SetAttentionLed(_))), 0);

        sim.set_fan_rpm(0, 0);
        actuation.actuate().await;
        actuation.actuate().await;
        assert!(sim.led_on());
        assert_eq!(sim.count_commands(|c| matches!(c, Command::SetAttentionLed(_))), 1);
    }

    #[tokio::test]
    async fn test_fan_failure_ignored_for_led_when_monitoring_disabled() {
        let mut config = ChassisConfig::default();
        config.chassis.population = 1;
        config.chassis.psu_count = 1;
        config.thermal.fan_monitoring_enabled = false;
        let sim = Arc::new(SimulatedChassis::new(1, 6, 1));
        let actuation = ActuationLoop::new(Arc::new(ControlContext::new(&config, sim.clone())));

        sim.set_fan_rpm(0, 0);
        actuation.actuate().await;
        assert!(actuation.ctx.chassis.fan_failure());
        assert!(!sim.led_on());
    }

    #[tokio::test]
    async fn test_housekeeping_runs_every_pass() {
        let (sim, actuation) = setup();
        actuation.actuate().await;
        actuation.actuate().await;
        assert_eq!(sim.watchdog_pulses(), 2);
        assert_eq!(sim.console_sweeps(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_waits_set_period() {
        let (sim, actuation) = setup();
        let start = tokio::time::Instant::now();
        assert_eq!(actuation.run_pass().await, PassOutcome::Completed);
        assert_eq!(start.elapsed(), Duration::from_millis(30_000));
        assert_eq!(sim.watchdog_pulses(), 1);
        assert_eq!(actuation.ctx.slots.get(1).unwrap().state(), SlotState::HardPowerOff);
    }
}
