//! Pankha chassis manager entry point: CLI dispatch, signal handlers, async runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use pankha_chassis::app::cli::{Args, HELP_TEXT};
use pankha_chassis::app::logging::{filter_for_level, init_tracing, reload_level};
use pankha_chassis::config::persistence::{config_path, load_config, save_config};
use pankha_chassis::config::types::GatewayBackend;
use pankha_chassis::config::ChassisConfig;
use pankha_chassis::gateway::{DeviceGateway, IpmitoolGateway, SimulatedChassis, TimedGateway};
use pankha_chassis::profiles::loader::resolve_profile_path;
use pankha_chassis::service::ChassisService;

type IpmiBackend = Arc<TimedGateway<IpmitoolGateway>>;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse arguments with custom error handling
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            if err.kind() == clap::error::ErrorKind::DisplayHelp {
                print!("{}", HELP_TEXT);
                std::process::exit(0);
            }
            // Custom version output with architecture (green)
            if err.kind() == clap::error::ErrorKind::DisplayVersion {
                println!(
                    "\x1b[32mpankha-chassis {} ({})\x1b[0m",
                    env!("CARGO_PKG_VERSION"),
                    std::env::consts::ARCH
                );
                std::process::exit(0);
            }

            eprintln!("{}", err);
            eprintln!();
            print!("{}", HELP_TEXT);
            eprintln!("\nFor more information, try '--help'.");
            std::process::exit(1);
        }
    };

    if args.init_config {
        let path = config_path(args.config_file.as_deref())?;
        if path.exists() {
            eprintln!("ERROR: {:?} already exists; remove it first to write fresh defaults.", path);
            std::process::exit(1);
        }
        save_config(&ChassisConfig::default(), &path).await?;
        println!("Default configuration written to {:?}", path);
        return Ok(());
    }

    // Loaded before tracing exists so the config can pick the log format;
    // validation warnings are re-emitted below.
    let config = match load_config(args.config_file.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            std::process::exit(1);
        }
    };

    // Priority: 1. --log-level flag, 2. LOG_LEVEL env, 3. config file, 4. default (info)
    let log_level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| config.logging.log_level.clone());
    let filter = filter_for_level(&log_level).unwrap_or_else(|| {
        eprintln!(
            "Invalid log level '{}'. Using INFO. Valid levels: TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL",
            log_level
        );
        "info"
    });

    init_tracing(filter, config.logging.format);

    if args.config {
        println!("\n{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    info!(
        "Pankha Chassis Manager v{} starting ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    );
    info!(
        "Chassis {} ({}): {} slots, {} fans, {} PSUs",
        config.chassis.id,
        config.chassis.name,
        config.chassis.population,
        config.chassis.fan_count,
        config.chassis.psu_count
    );
    for warning in config.validate()? {
        warn!("Config: {}", warning);
    }

    let (gateway, ipmi) = match build_gateway(&config, &args) {
        Ok(built) => built,
        Err(e) => {
            error!("Failed to set up the device gateway: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Some(ipmi) = &ipmi {
        if let Err(e) = ipmi.inner().check_connectivity().await {
            warn!("BMC connectivity check failed: {:#}", e);
        }
        if let Err(e) = ipmi.inner().run_initialization().await {
            error!("IPMI initialization failed: {:#}", e);
            restore_bmc(ipmi).await;
            std::process::exit(1);
        }
    }

    let service = ChassisService::new(&config, gateway);

    // Test mode: one pass of each loop, then report
    if args.test {
        info!("Running in test mode");
        let snapshot = service.run_single_pass().await;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        if let Some(ipmi) = &ipmi {
            restore_bmc(ipmi).await;
        }
        return Ok(());
    }

    service.start().await?;

    #[cfg(unix)]
    spawn_sighup_reload(args.config_file.clone())?;

    wait_for_shutdown().await?;

    service.shutdown().await;
    if let Some(ipmi) = &ipmi {
        restore_bmc(ipmi).await;
    }

    info!("Chassis manager shutdown complete");
    Ok(())
}

fn build_gateway(
    config: &ChassisConfig,
    args: &Args,
) -> Result<(Arc<dyn DeviceGateway>, Option<IpmiBackend>)> {
    let timeout = Duration::from_millis(config.gateway.command_timeout_ms);

    if args.simulate || config.gateway.backend == GatewayBackend::Simulated {
        info!("Using simulated chassis backend");
        let sim = SimulatedChassis::new(
            config.chassis.population,
            config.chassis.fan_count,
            config.chassis.psu_count,
        );
        let gateway: Arc<dyn DeviceGateway> = Arc::new(TimedGateway::new(sim, timeout));
        return Ok((gateway, None));
    }

    let mut settings = config.gateway.clone();
    settings.dry_run |= args.dry_run;
    if settings.dry_run {
        info!("Dry run: ipmitool commands are logged, not executed");
    }

    #[cfg(target_os = "linux")]
    if !settings.dry_run
        && std::env::var("PANKHA_IPMI_HOST").is_err()
        && unsafe { libc::geteuid() } != 0
    {
        warn!("Not running as root; ipmitool may be unable to open /dev/ipmi0");
    }

    let profile = args.profile.as_deref().unwrap_or(&settings.profile);
    let path = resolve_profile_path(profile)?;
    let backend = IpmitoolGateway::from_profile_path(&path, &settings)?;
    let ipmi = Arc::new(TimedGateway::new(backend, timeout));
    info!("Using ipmitool backend: {}", ipmi.inner().hardware_name());

    let gateway: Arc<dyn DeviceGateway> = ipmi.clone();
    Ok((gateway, Some(ipmi)))
}

/// Return fans to BMC auto-control. Failures are logged; there is nothing
/// left to fall back to.
async fn restore_bmc(ipmi: &IpmiBackend) {
    if let Err(e) = ipmi.inner().run_reset_to_factory().await {
        error!("Failed to restore BMC defaults: {:#}", e);
    }
}

/// Re-read the config's log level on SIGHUP.
#[cfg(unix)]
fn spawn_sighup_reload(config_file: Option<String>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            info!("SIGHUP received, reloading log level configuration");
            match load_config(config_file.as_deref()).await {
                Ok(new_config) => match reload_level(&new_config.logging.log_level) {
                    Ok(filter) => info!("Log level reloaded: {}", filter.to_uppercase()),
                    Err(e) => error!("Failed to reload log level: {}", e),
                },
                Err(e) => error!("Failed to reload config: {:#}", e),
            }
        }
    });
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received (Ctrl+C)"),
            _ = sigterm.recv() => info!("Shutdown signal received (SIGTERM)"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received (Ctrl+C)");
    }

    Ok(())
}
