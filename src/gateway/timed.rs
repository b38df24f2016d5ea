//! Bounded-time wrapper: no gateway call may outlive the configured timeout.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Command, Completion, DeviceFault, DeviceGateway, Endpoint};
use crate::chassis::{SlotId, SlotType};

pub struct TimedGateway<G> {
    inner: G,
    timeout: Duration,
}

impl<G: DeviceGateway> TimedGateway<G> {
    pub fn new(inner: G, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

#[async_trait]
impl<G: DeviceGateway> DeviceGateway for TimedGateway<G> {
    async fn execute(&self, endpoint: Endpoint, command: Command) -> Completion {
        match tokio::time::timeout(self.timeout, self.inner.execute(endpoint, command)).await {
            Ok(completion) => completion,
            Err(_) => {
                debug!("{} {} timed out after {:?}", endpoint, command.name(), self.timeout);
                Err(DeviceFault::Timeout(self.timeout))
            }
        }
    }

    fn safe_mode(&self) -> bool {
        self.inner.safe_mode()
    }

    fn slot_type(&self, slot: SlotId) -> SlotType {
        self.inner.slot_type(slot)
    }
}
