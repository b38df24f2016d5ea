//! ipmitool subprocess plumbing and output parsing.

pub mod executor;
pub mod parser;
