//! Chassis service: owns the shared control state, runs the two loops, and
//! exposes the operations the management API layer calls.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chassis::{AggregateHealth, Slot, SlotId, SlotState};
use crate::config::ChassisConfig;
use crate::control::power::{self, PowerChange, PowerError, PowerReading};
use crate::control::{ActuationLoop, ControlContext, TelemetryLoop};
use crate::gateway::DeviceGateway;

pub use crate::chassis::{ChassisSnapshot, SlotSnapshot};

#[derive(Debug, Error, PartialEq)]
pub enum ServiceError {
    #[error("no such slot {slot} (chassis has {population})")]
    NoSuchSlot { slot: SlotId, population: usize },
    #[error(transparent)]
    Power(#[from] PowerError),
    #[error("control loops already started")]
    AlreadyStarted,
}

pub struct ChassisService {
    ctx: Arc<ControlContext>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChassisService {
    pub fn new(config: &ChassisConfig, gateway: Arc<dyn DeviceGateway>) -> Self {
        Self {
            ctx: Arc::new(ControlContext::new(config, gateway)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<ControlContext> {
        &self.ctx
    }

    fn slot(&self, id: SlotId) -> Result<&Slot, ServiceError> {
        self.ctx.slots.get(id).ok_or(ServiceError::NoSuchSlot {
            slot: id,
            population: self.ctx.slots.population(),
        })
    }

    /// Probe every power-enable line once so slots already powered start
    /// their lifecycle at Initialization.
    pub async fn reconcile(&self) {
        let mut powered = 0;
        for slot in self.ctx.slots.iter() {
            let reading = power::reconcile_at_startup(
                slot,
                self.ctx.gateway.as_ref(),
                self.ctx.control.max_fail_count,
            )
            .await;
            if reading == PowerReading::On {
                powered += 1;
            }
        }
        info!(
            "Startup reconcile: {} of {} slots powered",
            powered,
            self.ctx.slots.population()
        );
    }

    /// Reconcile, then spawn the telemetry and actuation loops.
    pub async fn start(&self) -> Result<(), ServiceError> {
        if !self.lock_tasks().is_empty() {
            return Err(ServiceError::AlreadyStarted);
        }

        self.reconcile().await;

        let telemetry = TelemetryLoop::new(Arc::clone(&self.ctx));
        let actuation = ActuationLoop::new(Arc::clone(&self.ctx));
        let handles = vec![
            tokio::spawn(async move { telemetry.run().await }),
            tokio::spawn(async move { actuation.run().await }),
        ];

        let mut tasks = self.lock_tasks();
        if !tasks.is_empty() {
            for handle in handles {
                handle.abort();
            }
            return Err(ServiceError::AlreadyStarted);
        }
        *tasks = handles;
        info!("Chassis service started");
        Ok(())
    }

    /// Raise the shutdown flag and wait for both loops to return.
    pub async fn shutdown(&self) {
        self.ctx.chassis.shutdown.trigger();

        let handles: Vec<_> = self.lock_tasks().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Control loop task failed: {}", e);
            }
        }
        info!("Chassis service stopped");
    }

    /// One telemetry sweep (no spacing) followed by one actuation round.
    /// Used by `--test`.
    pub async fn run_single_pass(&self) -> ChassisSnapshot {
        self.reconcile().await;
        let telemetry = TelemetryLoop::new(Arc::clone(&self.ctx));
        for slot in self.ctx.slots.iter() {
            telemetry.probe_slot(slot).await;
        }
        ActuationLoop::new(Arc::clone(&self.ctx)).actuate().await;
        self.snapshot()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn query_state(&self, slot: SlotId) -> Result<SlotState, ServiceError> {
        Ok(self.slot(slot)?.state())
    }

    pub fn query_requirement(&self, slot: SlotId) -> Result<u8, ServiceError> {
        Ok(self.slot(slot)?.fan_requirement())
    }

    pub async fn power_on(&self, slot: SlotId) -> Result<PowerChange, ServiceError> {
        let slot = self.slot(slot)?;
        power::power_on(slot, self.ctx.gateway.as_ref())
            .await
            .map_err(|e| {
                warn!("{}", e);
                e.into()
            })
    }

    pub async fn power_off(&self, slot: SlotId) -> Result<PowerChange, ServiceError> {
        let slot = self.slot(slot)?;
        power::power_off(slot, self.ctx.gateway.as_ref(), self.ctx.power_off_settle())
            .await
            .map_err(|e| {
                warn!("{}", e);
                e.into()
            })
    }

    pub fn aggregate_health(&self) -> AggregateHealth {
        self.ctx.chassis.health()
    }

    pub fn snapshot(&self) -> ChassisSnapshot {
        ChassisSnapshot::capture(&self.ctx.slots, &self.ctx.chassis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SimulatedChassis;

    fn service(population: usize) -> (Arc<SimulatedChassis>, ChassisService) {
        let mut config = ChassisConfig::default();
        config.chassis.population = population;
        let sim = Arc::new(SimulatedChassis::new(population, 6, 6));
        let service = ChassisService::new(&config, sim.clone());
        (sim, service)
    }

    #[tokio::test]
    async fn test_unknown_slot_is_rejected() {
        let (_sim, service) = service(2);
        assert_eq!(
            service.query_state(3),
            Err(ServiceError::NoSuchSlot { slot: 3, population: 2 })
        );
        assert!(matches!(service.power_on(0).await, Err(ServiceError::NoSuchSlot { .. })));
    }

    #[tokio::test]
    async fn test_single_pass_brings_powered_slots_to_probation() {
        let (sim, service) = service(3);
        sim.set_powered(3, false);
        let snapshot = service.run_single_pass().await;

        // Reconcile moves powered slots to Initialization; the sweep reinitializes them.
        assert_eq!(service.query_state(1), Ok(SlotState::Probation));
        assert_eq!(service.query_state(3), Ok(SlotState::HardPowerOff));
        assert_eq!(snapshot.slots.len(), 3);
        assert_eq!(snapshot.fan_command, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails_and_shutdown_joins() {
        let (_sim, service) = service(2);
        service.start().await.unwrap();
        assert_eq!(service.start().await, Err(ServiceError::AlreadyStarted));
        service.shutdown().await;
        assert!(service.lock_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_power_commands_through_service() {
        let (sim, service) = service(1);
        sim.set_powered(1, false);
        assert_eq!(service.power_on(1).await, Ok(PowerChange::Applied));
        assert_eq!(service.query_state(1), Ok(SlotState::Initialization));
        assert!(sim.is_powered(1));
    }
}
