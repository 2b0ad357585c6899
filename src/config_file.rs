//! Installer configuration file handling.
//!
//! Everything the pipeline needs besides the target device and the user's
//! language/keyboard settings lives here. Every field has a default, so an
//! empty `{}` JSON file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Filesystem;

/// Packages bootstrapped into every installation
pub const BASE_PACKAGES: &[&str] = &[
    "base",
    "linux",
    "linux-firmware",
    "btrfs-progs",
    "networkmanager",
    "sudo",
    "nano",
];

/// Proprietary driver set installed when an NVIDIA GPU is detected
pub const NVIDIA_PACKAGES: &[&str] = &["nvidia", "nvidia-utils", "nvidia-settings"];

/// Installer configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Working root the target is mounted under for the whole run
    pub mount_root: PathBuf,
    pub root_filesystem: Filesystem,
    pub hostname: String,
    /// Short distribution id used for boot entries and the branding hook
    pub distribution: String,

    pub base_packages: Vec<String>,
    pub nvidia_packages: Vec<String>,

    /// Size of a freshly created EFI System Partition
    pub efi_size_mib: u64,
    /// Smallest free region that makes an alongside install possible
    pub min_free_space_mib: u64,
    /// Smallest disk the installer will accept
    pub min_disk_size_mib: u64,

    /// Endpoint answering with a plain IANA timezone name
    pub geolocation_url: String,
    pub geolocation_timeout_secs: u64,
    pub fallback_timezone: String,

    /// Time budget for one external command
    pub command_timeout_secs: u64,

    /// Seconds the systemd-boot menu waits
    pub boot_menu_timeout_secs: u32,

    /// Directory holding the distribution's os-release, lsb-release and issue
    pub branding_dir: Option<PathBuf>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt"),
            root_filesystem: Filesystem::Btrfs,
            hostname: "archlinux".to_string(),
            distribution: "arch".to_string(),
            base_packages: BASE_PACKAGES.iter().map(|s| s.to_string()).collect(),
            nvidia_packages: NVIDIA_PACKAGES.iter().map(|s| s.to_string()).collect(),
            efi_size_mib: 512,
            min_free_space_mib: 20 * 1024,
            min_disk_size_mib: 16 * 1024,
            geolocation_url: "https://ipapi.co/timezone".to_string(),
            geolocation_timeout_secs: 5,
            fallback_timezone: "UTC".to_string(),
            command_timeout_secs: 60 * 60,
            boot_menu_timeout_secs: 5,
            branding_dir: None,
        }
    }
}

impl InstallerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn geolocation_timeout(&self) -> Duration {
        Duration::from_secs(self.geolocation_timeout_secs)
    }

    /// Path inside the target root, e.g. `target_path("etc/hostname")`.
    pub fn target_path(&self, relative: &str) -> PathBuf {
        self.mount_root.join(relative.trim_start_matches('/'))
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.mount_root.is_absolute() || self.mount_root == Path::new("/") {
            anyhow::bail!(
                "Mount root must be an absolute path other than / (got {:?})",
                self.mount_root
            );
        }

        validate_hostname(&self.hostname)?;

        if self.distribution.is_empty()
            || !self
                .distribution
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            anyhow::bail!("Distribution id must be lowercase letters, digits or '-'");
        }

        if self.base_packages.is_empty() {
            anyhow::bail!("At least one base package is required");
        }

        if self.efi_size_mib < 100 {
            anyhow::bail!("EFI partition must be at least 100 MiB");
        }

        if self.command_timeout_secs == 0 || self.geolocation_timeout_secs == 0 {
            anyhow::bail!("Timeouts must be greater than zero");
        }

        if !is_valid_timezone_name(&self.fallback_timezone) {
            anyhow::bail!("Invalid fallback timezone '{}'", self.fallback_timezone);
        }

        Ok(())
    }
}

/// Hostname rules: 1-63 chars, alphanumeric and '-', not starting/ending with '-'
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > 63 {
        anyhow::bail!("Hostname must be 1-63 characters long");
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        anyhow::bail!("Hostname cannot start or end with '-'");
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        anyhow::bail!("Hostname may only contain letters, digits and '-'");
    }
    Ok(())
}

/// Shape check for an IANA zone name such as `Europe/Berlin` or `UTC`.
///
/// Rejects anything that could escape `/usr/share/zoneinfo`.
pub fn is_valid_timezone_name(tz: &str) -> bool {
    !tz.is_empty()
        && tz.len() <= 64
        && !tz.starts_with('/')
        && !tz.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        && tz
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/_-+".contains(c))
}
