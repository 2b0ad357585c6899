//! archprovision - Main entry point
//!
//! Logs go to stderr; stdout carries only machine-readable output (JSON
//! events for `install`, JSON documents for the probe commands).

use anyhow::{bail, Context, Result};
use archprovision::cli::{Cli, Commands};
use archprovision::{
    process_guard, DryRunExecutor, Executor, InstallEvent, InstallerConfig, InstallerService,
    SystemExecutor,
};
use log::{debug, error, info};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;

/// Initialize the logger with appropriate settings
fn init_logger() {
    use env_logger::{Builder, Target};

    Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .target(Target::Stderr)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env() // Allows RUST_LOG env var to override
        .init();
}

fn load_config(cli: &Cli) -> Result<InstallerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            InstallerConfig::load_from_file(path)?
        }
        None => InstallerConfig::default(),
    };
    config.validate().context("Invalid configuration")?;

    if cli.dry_run {
        config.mount_root = std::env::temp_dir().join("archprovision-dry-run");
        info!("[DRY RUN] staging target under {}", config.mount_root.display());
    }
    Ok(config)
}

/// The service plus, in dry-run mode, a handle on the recording executor.
fn build_service(
    cli: &Cli,
) -> Result<(InstallerService, Option<Arc<DryRunExecutor<SystemExecutor>>>)> {
    let config = load_config(cli)?;
    let system = SystemExecutor::new(config.command_timeout());
    let dry_run = cli
        .dry_run
        .then(|| Arc::new(DryRunExecutor::new(system.clone())));
    let exec: Arc<dyn Executor> = match &dry_run {
        Some(dry) => Arc::clone(dry) as Arc<dyn Executor>,
        None => Arc::new(system),
    };
    Ok((InstallerService::new(exec, config), dry_run))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

fn run_install(
    service: &InstallerService,
    disk: &str,
    language: Option<&str>,
    keyboard: Option<&str>,
) -> Result<bool> {
    if let Some(language) = language {
        service.set_language(language)?;
    }
    if let Some(keyboard) = keyboard {
        service.set_keyboard(keyboard)?;
    }

    let handle = service.start_install(disk);
    let stdout = std::io::stdout();
    for event in handle.events().iter() {
        let line = serde_json::to_string(&event).context("Failed to serialize event")?;
        let mut out = stdout.lock();
        writeln!(out, "{}", line).context("Failed to write event")?;
        out.flush().context("Failed to flush stdout")?;
        if let InstallEvent::Failed(err) = &event {
            error!("{}", err.message);
        }
    }

    Ok(handle.wait().is_ok())
}

/// Main application entry point
fn main() -> Result<()> {
    init_logger();
    info!("archprovision starting up");

    // Terminate in-flight child processes if we receive SIGINT/SIGTERM
    if let Err(e) = process_guard::init_signal_handlers() {
        log::warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    let cli = Cli::parse_args();

    match &cli.command {
        Commands::Validate { config } => {
            info!("Validating configuration file: {:?}", config);
            let loaded = InstallerConfig::load_from_file(config)?;
            loaded.validate()?;
            println!("✓ Configuration file is valid: {:?}", config);
        }
        Commands::Install {
            disk,
            language,
            keyboard,
        } => {
            if !cli.dry_run && !nix::unistd::geteuid().is_root() {
                bail!("install must run as root (or use --dry-run)");
            }
            let (service, dry_run) = build_service(&cli)?;
            let ok = run_install(&service, disk, language.as_deref(), keyboard.as_deref())?;
            if let Some(dry) = &dry_run {
                info!("[DRY RUN] {} command(s) skipped", dry.skipped().len());
            }
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Disks => print_json(&build_service(&cli)?.0.scan_disks()?)?,
        Commands::BootMode => println!("{}", build_service(&cli)?.0.check_boot_mode()),
        Commands::Gpu => print_json(&build_service(&cli)?.0.detect_nvidia())?,
        Commands::Wifi => print_json(&build_service(&cli)?.0.scan_wifi()?)?,
    }

    Ok(())
}
