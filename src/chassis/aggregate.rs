//! Chassis-wide flags shared by both control loops and the external API.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;

/// Cooperative stop flag with a wakeup for sleeping loops.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Sleep for `duration` unless shutdown is requested first.
    /// Returns `false` when woken by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent trigger is not lost.
        notified.as_mut().enable();

        if self.is_set() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_set(),
            _ = notified => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregateHealth {
    pub fan_failure: bool,
    pub psu_failure: bool,
}

/// Process-wide aggregate state, lives as long as the service.
#[derive(Debug, Default)]
pub struct ChassisState {
    pub shutdown: ShutdownSignal,
    fan_failure: AtomicBool,
    psu_failure: AtomicBool,
    previous_fan_command: AtomicU8,
}

impl ChassisState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fan_failure(&self) -> bool {
        self.fan_failure.load(Ordering::Relaxed)
    }

    pub fn set_fan_failure(&self, failed: bool) {
        self.fan_failure.store(failed, Ordering::Relaxed);
    }

    pub fn psu_failure(&self) -> bool {
        self.psu_failure.load(Ordering::Relaxed)
    }

    pub fn set_psu_failure(&self, failed: bool) {
        self.psu_failure.store(failed, Ordering::Relaxed);
    }

    /// Last chassis-wide PWM issued; 0 before the first command.
    pub fn previous_fan_command(&self) -> u8 {
        self.previous_fan_command.load(Ordering::Relaxed)
    }

    pub fn set_previous_fan_command(&self, pwm: u8) {
        self.previous_fan_command.store(pwm, Ordering::Relaxed);
    }

    pub fn health(&self) -> AggregateHealth {
        AggregateHealth {
            fan_failure: self.fan_failure(),
            psu_failure: self.psu_failure(),
        }
    }
}
