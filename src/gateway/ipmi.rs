//! ipmitool-backed DeviceGateway. Every byte it sends comes from the active
//! chassis profile; this binary contains zero hardcoded command hex values.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Command, Completion, DeviceFault, DeviceGateway, Endpoint, Payload};
use crate::chassis::{SlotId, SlotType};
use crate::config::types::GatewaySettings;
use crate::profiles::interpolator::{interpolate_command, translate_speed, Placeholders};
use crate::profiles::loader::{load_profile, validate_profile};
use crate::profiles::types::{ChassisProfile, IpmiProtocol, LifecycleCommand, Metadata, RawCommand};
use crate::system::executor::{self, Bridge, RawCommandError};
use crate::system::parser::{self, Decoded};

/// IPMI completion codes with a dedicated meaning.
const CC_TIMEOUT: u8 = 0xc3;
const CC_INVALID_COMMAND: u8 = 0xc1;
const CC_NOT_SUPPORTED_IN_STATE: u8 = 0xd5;
/// "Unspecified error", reported for transport failures.
const CC_UNSPECIFIED: u8 = 0xff;

/// Reads answered during dry runs: a cool, powered, fully working chassis.
const DRY_RUN_TEMPERATURE: f64 = 25.0;
const DRY_RUN_FAN_RPM: u32 = 6000;

pub struct IpmitoolGateway {
    metadata: Metadata,
    ipmi: IpmiProtocol,
    dry_run: bool,
    safe_mode_threshold: u32,
    consecutive_failures: AtomicU32,
    type_cache: Mutex<HashMap<SlotId, SlotType>>,
    initialized: AtomicBool,
}

impl IpmitoolGateway {
    pub fn new(profile: ChassisProfile, settings: &GatewaySettings) -> Result<Self> {
        let ipmi = validate_profile(&profile)?.clone();
        Ok(Self {
            metadata: profile.metadata,
            ipmi,
            dry_run: settings.dry_run,
            safe_mode_threshold: settings.safe_mode_threshold,
            consecutive_failures: AtomicU32::new(0),
            type_cache: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn from_profile_path(path: &Path, settings: &GatewaySettings) -> Result<Self> {
        let profile = load_profile(path)?;
        info!("Chassis profile loaded from {:?}", path);
        Self::new(profile, settings)
    }

    pub fn hardware_name(&self) -> String {
        let model = self
            .metadata
            .model_family
            .as_ref()
            .and_then(|f| f.first())
            .map(|s| s.as_str())
            .unwrap_or("Unknown");
        format!("{} {}", self.metadata.vendor, model)
    }

    /// `ipmitool mc info` against the chassis BMC.
    pub async fn check_connectivity(&self) -> Result<()> {
        if self.dry_run {
            info!("[DRY RUN] Skipping BMC connectivity check");
            return Ok(());
        }
        let info = executor::run_ipmitool_mc_info().await?;
        let version = info
            .lines()
            .find(|line| line.contains("IPMI Version"))
            .and_then(|line| line.split(':').nth(1))
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        info!("BMC reachable ({}, IPMI {})", self.hardware_name(), version);
        Ok(())
    }

    /// Run the profile's initialization commands. A failing critical command
    /// aborts startup.
    pub async fn run_initialization(&self) -> Result<()> {
        let commands = &self.ipmi.lifecycle.initialization;
        info!("Running {} initialization commands...", commands.len());
        for cmd in commands {
            match self.run_lifecycle_command(cmd).await {
                Ok(()) => info!("  Init command succeeded: {}", cmd.name),
                Err(e) if cmd.critical => {
                    return Err(anyhow!("Critical init command failed: {} - {}", cmd.name, e));
                }
                Err(e) => warn!("Non-critical init command failed: {} - {}", cmd.name, e),
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("IPMI initialization complete");
        Ok(())
    }

    /// Run the profile's reset_to_factory commands, returning fans to BMC
    /// control. Every command is attempted even if an earlier one fails.
    pub async fn run_reset_to_factory(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            debug!("Gateway never initialized, skipping reset_to_factory");
            return Ok(());
        }

        let commands = &self.ipmi.lifecycle.reset_to_factory;
        info!("Running {} reset_to_factory commands...", commands.len());
        let mut critical_failures = 0;
        for cmd in commands {
            match self.run_lifecycle_command(cmd).await {
                Ok(()) => info!("  Reset command succeeded: {}", cmd.name),
                Err(e) => {
                    error!("Reset command failed: {} - {}", cmd.name, e);
                    if cmd.critical {
                        critical_failures += 1;
                    }
                }
            }
        }

        if critical_failures > 0 {
            return Err(anyhow!("{} critical reset command(s) failed", critical_failures));
        }
        info!("Reset to factory complete - fans returned to BMC auto-control");
        Ok(())
    }

    async fn run_lifecycle_command(&self, cmd: &LifecycleCommand) -> Result<()> {
        info!("  {} -> {}", cmd.name, cmd.bytes);
        if self.dry_run {
            info!("  [DRY RUN] Would execute: ipmitool raw {}", cmd.bytes);
            return Ok(());
        }
        executor::run_ipmitool_raw(None, &cmd.bytes).await?;
        Ok(())
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<SlotId, SlotType>> {
        self.type_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn profile_command(&self, command: Command) -> Result<&RawCommand, DeviceFault> {
        self.ipmi.commands.get(command.name()).ok_or(DeviceFault::NotSupported)
    }

    fn bridge_for(&self, endpoint: Endpoint) -> Result<Option<Bridge>, DeviceFault> {
        let (slot, bridge) = match (endpoint, self.ipmi.slot_bridge) {
            (Endpoint::Slot(slot), Some(bridge)) => (slot, bridge),
            _ => return Ok(None),
        };
        let offset = slot.saturating_sub(1).saturating_mul(usize::from(bridge.stride));
        let address = usize::from(bridge.base_address)
            .checked_add(offset)
            .and_then(|a| u8::try_from(a).ok())
            .ok_or_else(|| {
                warn!("Slot {} has no IPMB address under the profile's slot_bridge", slot);
                DeviceFault::NotSupported
            })?;
        Ok(Some(Bridge { channel: bridge.channel, address }))
    }

    fn placeholders(
        &self,
        endpoint: Endpoint,
        command: Command,
    ) -> Result<Placeholders, DeviceFault> {
        let index = match endpoint {
            Endpoint::PowerEnable(slot) => Some(slot),
            Endpoint::Fan(i) | Endpoint::Psu(i) => Some(i),
            _ => None,
        };
        let index = index
            .map(|i| u8::try_from(i).map_err(|_| DeviceFault::NotSupported))
            .transpose()?;

        let mut values = Placeholders { index, ..Placeholders::default() };
        match command {
            Command::SetFanSpeed(pwm) => {
                values.speed = Some(translate_speed(pwm, &self.ipmi.speed_translation));
            }
            Command::SetPowerEnable(on) | Command::SetAttentionLed(on) => values.state = Some(on),
            Command::CloseIdleSessions { idle } => values.idle = Some(idle),
            _ => {}
        }
        Ok(values)
    }

    /// Resolve the bridge target and the final raw byte string for one call.
    pub fn render(
        &self,
        endpoint: Endpoint,
        command: Command,
    ) -> Result<(Option<Bridge>, String), DeviceFault> {
        let raw = self.profile_command(command)?;
        let bridge = self.bridge_for(endpoint)?;
        let values = self.placeholders(endpoint, command)?;
        let bytes = interpolate_command(&raw.bytes, &values).map_err(|e| {
            warn!("{} {}: {}", endpoint, command.name(), e);
            DeviceFault::NotSupported
        })?;
        Ok((bridge, bytes))
    }

    fn slot_type_for(&self, byte: u8) -> SlotType {
        self.ipmi
            .slot_types
            .iter()
            .find(|(key, _)| parser::parse_hex_byte(key).ok() == Some(byte))
            .map(|(_, slot_type)| *slot_type)
            .unwrap_or_default()
    }

    fn decode(&self, command: Command, response: &[u8]) -> Completion {
        let rule = match self.profile_command(command)?.response {
            Some(rule) => rule,
            None => {
                return match command {
                    Command::Identify | Command::Reinitialize => {
                        Ok(Payload::Identity { slot_type: SlotType::Unknown })
                    }
                    Command::ReadTemperature
                    | Command::ReadPowerEnable
                    | Command::ReadFanSpeed
                    | Command::ReadPsuStatus
                    | Command::ReadAttentionLed => Err(DeviceFault::UnexpectedPayload(format!(
                        "profile has no response rule for {}",
                        command.name()
                    ))),
                    _ => Ok(Payload::Empty),
                };
            }
        };

        let decoded = parser::decode_response(response, &rule)
            .map_err(|e| DeviceFault::UnexpectedPayload(e.to_string()))?;
        let number = |d: Decoded| {
            d.as_number()
                .map_err(|e| DeviceFault::UnexpectedPayload(e.to_string()))
        };
        let flag = |d: Decoded| {
            d.as_flag()
                .map_err(|e| DeviceFault::UnexpectedPayload(e.to_string()))
        };

        Ok(match command {
            Command::ReadTemperature => Payload::Temperature(number(decoded)?),
            Command::ReadPowerEnable => Payload::PowerEnable(flag(decoded)?),
            Command::Identify | Command::Reinitialize => {
                let byte = number(decoded)?.clamp(0.0, 255.0) as u8;
                Payload::Identity { slot_type: self.slot_type_for(byte) }
            }
            Command::ReadFanSpeed => Payload::FanSpeed { rpm: number(decoded)?.max(0.0) as u32 },
            Command::ReadPsuStatus => Payload::PsuStatus { output_on: flag(decoded)? },
            Command::ReadAttentionLed => Payload::LedState(flag(decoded)?),
            _ => Payload::Empty,
        })
    }

    fn dry_run_payload(command: Command) -> Payload {
        match command {
            Command::ReadTemperature => Payload::Temperature(DRY_RUN_TEMPERATURE),
            Command::ReadPowerEnable => Payload::PowerEnable(true),
            Command::Identify | Command::Reinitialize => Payload::Identity {
                slot_type: SlotType::Unknown,
            },
            Command::ReadFanSpeed => Payload::FanSpeed { rpm: DRY_RUN_FAN_RPM },
            Command::ReadPsuStatus => Payload::PsuStatus { output_on: true },
            Command::ReadAttentionLed => Payload::LedState(false),
            _ => Payload::Empty,
        }
    }

    fn fault_for_completion(code: u8, elapsed: Duration) -> DeviceFault {
        match code {
            CC_TIMEOUT => DeviceFault::Timeout(elapsed),
            CC_INVALID_COMMAND | CC_NOT_SUPPORTED_IN_STATE => DeviceFault::NotSupported,
            other => DeviceFault::DeviceError(other),
        }
    }

    fn update_type_cache(&self, endpoint: Endpoint, command: Command, completion: &Completion) {
        let slot = match endpoint {
            Endpoint::Slot(slot) => slot,
            _ => return,
        };
        match (command, completion) {
            (Command::Identify | Command::Reinitialize, Ok(payload)) => {
                let slot_type = payload.slot_type();
                if slot_type != SlotType::Unknown {
                    self.lock_cache().insert(slot, slot_type);
                }
            }
            // A failed session re-establish leaves nothing worth caching.
            (Command::Reinitialize, Err(_)) => {
                self.lock_cache().remove(&slot);
            }
            _ => {}
        }
    }

    fn record_transport_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if self.safe_mode_threshold > 0 && previous >= self.safe_mode_threshold {
            info!("IPMI transport recovered after {} failures; leaving safe mode", previous);
        }
    }

    fn record_transport_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if failures == self.safe_mode_threshold {
            error!(
                "{} consecutive IPMI transport failures; entering safe mode (max cooling, probing suspended)",
                failures
            );
        }
    }
}

/// Settles the safe-mode counter when dropped: a call that never reached the
/// BMC (including one cancelled by a timeout) counts as a transport failure.
struct TransportAttempt<'a> {
    gateway: &'a IpmitoolGateway,
    reached_bmc: bool,
}

impl<'a> TransportAttempt<'a> {
    fn new(gateway: &'a IpmitoolGateway) -> Self {
        Self { gateway, reached_bmc: false }
    }
}

impl Drop for TransportAttempt<'_> {
    fn drop(&mut self) {
        if self.reached_bmc {
            self.gateway.record_transport_success();
        } else {
            self.gateway.record_transport_failure();
        }
    }
}

#[async_trait]
impl DeviceGateway for IpmitoolGateway {
    async fn execute(&self, endpoint: Endpoint, command: Command) -> Completion {
        let (bridge, bytes) = self.render(endpoint, command)?;

        if self.dry_run {
            info!(
                "[DRY RUN] Would execute: ipmitool {}",
                executor::raw_args(bridge, &bytes).join(" ")
            );
            let completion = Ok(Self::dry_run_payload(command));
            self.update_type_cache(endpoint, command, &completion);
            return completion;
        }

        let started = Instant::now();
        let mut attempt = TransportAttempt::new(self);
        let result = executor::run_ipmitool_raw(bridge, &bytes).await;

        let completion = match result {
            Ok(stdout) => {
                attempt.reached_bmc = true;
                parser::parse_raw_response(&stdout)
                    .map_err(|e| DeviceFault::UnexpectedPayload(e.to_string()))
                    .and_then(|response| self.decode(command, &response))
            }
            Err(RawCommandError::Completion { code, stderr }) => {
                attempt.reached_bmc = true;
                debug!("{} {}: {}", endpoint, command.name(), stderr);
                Err(Self::fault_for_completion(code, started.elapsed()))
            }
            Err(RawCommandError::Transport(reason)) => {
                warn!("{} {}: {}", endpoint, command.name(), reason);
                Err(DeviceFault::DeviceError(CC_UNSPECIFIED))
            }
        };
        drop(attempt);

        self.update_type_cache(endpoint, command, &completion);
        completion
    }

    fn safe_mode(&self) -> bool {
        self.safe_mode_threshold > 0
            && self.consecutive_failures.load(Ordering::SeqCst) >= self.safe_mode_threshold
    }

    fn slot_type(&self, slot: SlotId) -> SlotType {
        self.lock_cache().get(&slot).copied().unwrap_or_default()
    }
}
