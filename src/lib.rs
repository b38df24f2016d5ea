//! Pankha chassis manager: per-sled health tracking, chassis fan control,
//! PSU and attention-LED supervision for multi-sled rack chassis.
//!
//! Two periodic loops share one [`control::ControlContext`]: the telemetry
//! loop probes each slot's management controller and advances its health
//! state machine, and the actuation loop turns the per-slot fan requirements
//! into a single chassis fan command. All hardware access goes through a
//! [`gateway::DeviceGateway`].

pub mod app;
pub mod chassis;
pub mod config;
pub mod control;
pub mod gateway;
pub mod profiles;
pub mod service;
pub mod system;
