use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// archprovision - staged Arch Linux provisioning
#[derive(Parser)]
#[command(name = "archprovision")]
#[command(about = "Partition, bootstrap and make a disk bootable, reporting progress as JSON lines")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Read-only probes (lsblk, parted print, lspci, curl) still execute so
    /// the preview is realistic. Everything else is logged and skipped, and
    /// the target is staged in a scratch directory instead of the mount root.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Installer configuration file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install to a disk, streaming one JSON event per line on stdout
    Install {
        /// Target disk (e.g., /dev/nvme0n1)
        #[arg(short, long)]
        disk: String,

        /// UI language code or locale (e.g., de, pt_BR)
        #[arg(short, long)]
        language: Option<String>,

        /// Console and X11 keyboard layout (e.g., de)
        #[arg(short, long)]
        keyboard: Option<String>,
    },
    /// List installable disks as JSON
    Disks,
    /// Print the firmware boot mode
    BootMode,
    /// Detect an NVIDIA GPU
    Gpu,
    /// Scan for WiFi networks
    Wifi,
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
