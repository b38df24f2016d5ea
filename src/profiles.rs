//! Chassis profiles: every raw IPMI command the ipmitool gateway can send.

pub mod interpolator;
pub mod loader;
pub mod merger;
pub mod types;

pub use loader::load_profile;
pub use types::ChassisProfile;
