//! ipmitool subprocess executor.
//! Spawns ipmitool commands and respects PANKHA_IPMI_HOST for emulator testing.

use anyhow::{anyhow, Context};
use thiserror::Error;
use tracing::{debug, trace};

use super::parser::parse_completion_code;

/// Target of an IPMB-bridged request: `-b <channel> -t <address>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bridge {
    pub channel: u8,
    pub address: u8,
}

#[derive(Debug, Error)]
pub enum RawCommandError {
    /// The BMC answered with a non-zero completion code.
    #[error("completion code {code:#04x}: {stderr}")]
    Completion { code: u8, stderr: String },
    /// ipmitool could not be run or never reached the BMC.
    #[error("ipmitool transport failure: {0}")]
    Transport(String),
}

/// Build an ipmitool Command with the correct interface flags.
/// If PANKHA_IPMI_HOST is set, routes via LAN to a remote BMC/emulator.
/// Otherwise, uses the local /dev/ipmi0 interface.
pub fn build_ipmitool_command() -> std::process::Command {
    let mut cmd = std::process::Command::new("ipmitool");

    if let Ok(host) = std::env::var("PANKHA_IPMI_HOST") {
        let port = std::env::var("PANKHA_IPMI_PORT").unwrap_or_else(|_| "623".to_string());
        let user = std::env::var("PANKHA_IPMI_USER").unwrap_or_else(|_| "admin".to_string());
        let pass = std::env::var("PANKHA_IPMI_PASS").unwrap_or_else(|_| "password".to_string());
        debug!("IPMI routing to emulator: {}:{}", host, port);
        cmd.args(["-I", "lanplus", "-H", &host, "-p", &port, "-U", &user, "-P", &pass]);
    } else {
        cmd.args(["-I", "open"]);
    }

    cmd
}

/// Arguments after the interface flags, for logging and dry runs.
pub fn raw_args(bridge: Option<Bridge>, bytes: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(bridge) = bridge {
        args.push("-b".to_string());
        args.push(bridge.channel.to_string());
        args.push("-t".to_string());
        args.push(format!("0x{:02x}", bridge.address));
    }
    args.push("raw".to_string());
    args.extend(bytes.split_whitespace().map(str::to_string));
    args
}

/// Execute `ipmitool [-b ch -t addr] raw <bytes>` and return stdout.
/// The child is killed if the returned future is dropped (caller timeout).
pub async fn run_ipmitool_raw(
    bridge: Option<Bridge>,
    bytes: &str,
) -> Result<String, RawCommandError> {
    let mut cmd = build_ipmitool_command();
    cmd.args(raw_args(bridge, bytes));

    trace!("Executing: ipmitool {:?}", cmd.get_args().collect::<Vec<_>>());

    let output = tokio::process::Command::from(cmd)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RawCommandError::Transport(format!("failed to execute ipmitool: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(match parse_completion_code(&stderr) {
            Some(code) => RawCommandError::Completion { code, stderr },
            None => RawCommandError::Transport(stderr),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Execute `ipmitool mc info` to verify BMC connectivity.
pub async fn run_ipmitool_mc_info() -> anyhow::Result<String> {
    let mut cmd = build_ipmitool_command();
    cmd.args(["mc", "info"]);

    debug!("Executing: ipmitool mc info");

    let output = tokio::process::Command::from(cmd)
        .kill_on_drop(true)
        .output()
        .await
        .context("Failed to execute ipmitool mc info")?;

    if !output.status.success() {
        return Err(anyhow!("ipmitool mc info failed: {}", String::from_utf8_lossy(&output.stderr)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_args_with_bridge() {
        let bridge = Bridge { channel: 7, address: 0x86 };
        assert_eq!(
            raw_args(Some(bridge), "0x04 0x2d  0x01"),
            vec!["-b", "7", "-t", "0x86", "raw", "0x04", "0x2d", "0x01"]
        );
        assert_eq!(raw_args(None, "0x06 0x22"), vec!["raw", "0x06", "0x22"]);
    }
}
