//! Process surface: command-line arguments and log output.

pub mod cli;
pub mod logging;
