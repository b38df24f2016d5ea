//! Command-line argument definitions (clap) and help text.

use clap::Parser;

pub const HELP_TEXT: &str = "
Pankha Chassis Manager
Usage: pankha-chassis [OPTIONS]

Options:
  -h, --help                      Print help
  -V, --version                   Print version
Configuration:
      --config-file <PATH>        Config file (default: config.json next to the executable)
  -c, --config                    Show the effective configuration and exit
      --init-config               Write a default config file and exit
Hardware:
      --simulate                  Use the in-process simulated chassis instead of ipmitool
      --dry-run                   Log ipmitool commands instead of executing them
      --profile <PATH>            Chassis profile (overrides gateway.profile)
Debug:
      --test                      Run one telemetry and one actuation pass, print the snapshot
      --log-level <LOG_LEVEL>     Set log level (TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL)
";

#[derive(Parser, Debug)]
#[command(name = "pankha-chassis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pankha Chassis Manager", long_about = None)]
pub struct Args {
    // === Configuration ===
    /// Config file (default: config.json next to the executable)
    #[arg(long = "config-file", value_name = "PATH", help_heading = "Configuration")]
    pub config_file: Option<String>,

    /// Show the effective configuration and exit
    #[arg(short = 'c', long, help_heading = "Configuration")]
    pub config: bool,

    /// Write a default config file and exit
    #[arg(long = "init-config", help_heading = "Configuration")]
    pub init_config: bool,

    // === Hardware ===
    /// Use the in-process simulated chassis instead of ipmitool
    #[arg(long, help_heading = "Hardware")]
    pub simulate: bool,

    /// Log ipmitool commands instead of executing them
    #[arg(long = "dry-run", help_heading = "Hardware")]
    pub dry_run: bool,

    /// Chassis profile (overrides gateway.profile)
    #[arg(long, value_name = "PATH", help_heading = "Hardware")]
    pub profile: Option<String>,

    // === Debug ===
    /// Run one telemetry and one actuation pass, print the snapshot
    #[arg(long, help_heading = "Debug")]
    pub test: bool,

    /// Set log level (TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL)
    #[arg(long = "log-level", help_heading = "Debug")]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_parse() {
        let args = Args::try_parse_from([
            "pankha-chassis",
            "--config-file",
            "/etc/pankha/chassis.json",
            "--simulate",
            "--test",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.config_file.as_deref(), Some("/etc/pankha/chassis.json"));
        assert!(args.simulate && args.test);
        assert!(!args.dry_run && !args.config);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_short_config_flag() {
        let args = Args::try_parse_from(["pankha-chassis", "-c"]).unwrap();
        assert!(args.config);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(Args::try_parse_from(["pankha-chassis", "--start"]).is_err());
    }
}
