//! Configuration: JSON file next to the executable, every field defaulted.

pub mod persistence;
pub mod types;

pub use types::ChassisConfig;
