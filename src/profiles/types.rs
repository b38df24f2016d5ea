//! Serde structs for chassis profiles.
//! A profile holds every raw IPMI byte sequence the gateway sends; the binary
//! itself contains no hardcoded command bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chassis::SlotType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChassisProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Protocols>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub schema_version: String,
    pub vendor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_family: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protocols {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipmi: Option<IpmiProtocol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpmiProtocol {
    /// How slot controllers are reached behind the chassis BMC. Without it,
    /// slot commands go to the BMC directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_bridge: Option<SlotBridge>,
    pub speed_translation: SpeedTranslation,
    /// Keyed by gateway command name ("read_temperature", "set_fan_speed", ...).
    pub commands: BTreeMap<String, RawCommand>,
    /// Identity byte (as written in the profile, e.g. "0x01") to sled type.
    #[serde(default)]
    pub slot_types: BTreeMap<String, SlotType>,
    pub lifecycle: Lifecycle,
}

/// `ipmitool -b <channel> -t <base_address + (slot - 1) * stride>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBridge {
    pub channel: u8,
    pub base_address: u8,
    pub stride: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpeedTranslation {
    /// 0-100% scaled onto `[output_min, output_max]`.
    ByteScale {
        #[serde(default)]
        output_min: u8,
        #[serde(default = "default_output_max")]
        output_max: u8,
    },
    /// Percentage written as a hex byte.
    DecimalHex,
    /// Percentage written as a decimal integer.
    Integer,
}

fn default_output_max() -> u8 {
    255
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCommand {
    /// e.g. "0x30 0x30 0x02 0xff {{SPEED_HEX}}"
    pub bytes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseDecode>,
}

/// Where in the response bytes the value of interest lives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResponseDecode {
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub kind: DecodeKind,
    /// `Flag` only: bits that must be set for the flag to read true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<u8>,
    /// Numeric kinds only: multiplier applied to the raw value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeKind {
    #[default]
    Byte,
    /// Two bytes, little endian.
    U16Le,
    Flag,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(default)]
    pub initialization: Vec<LifecycleCommand>,
    #[serde(default)]
    pub reset_to_factory: Vec<LifecycleCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleCommand {
    pub name: String,
    pub bytes: String,
    #[serde(default)]
    pub critical: bool,
}
