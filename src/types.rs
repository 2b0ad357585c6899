//! Type-safe enums shared across the provisioning pipeline
//!
//! String forms come from `strum` so the CLI, the config file and the log
//! output all agree on spelling.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Firmware boot mode of the machine running the installer.
///
/// Determined once per run; firmware mode cannot change mid-installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum BootMode {
    #[strum(to_string = "UEFI")]
    Uefi,
    #[strum(to_string = "BIOS")]
    Bios,
}

impl BootMode {
    /// Partition table label handed to `parted mklabel`.
    pub fn partition_label(self) -> &'static str {
        match self {
            Self::Uefi => "gpt",
            Self::Bios => "msdos",
        }
    }
}

/// Filesystem used for the root partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    #[default]
    Btrfs,
    Ext4,
}

impl Filesystem {
    /// Whether the root/home/var subvolume layout applies.
    pub fn supports_subvolumes(self) -> bool {
        matches!(self, Self::Btrfs)
    }

    /// The `mkfs.*` program for this filesystem.
    pub fn mkfs_program(self) -> &'static str {
        match self {
            Self::Btrfs => "mkfs.btrfs",
            Self::Ext4 => "mkfs.ext4",
        }
    }

    /// Argument that forces overwriting an existing signature.
    pub fn force_flag(self) -> &'static str {
        match self {
            Self::Btrfs => "-f",
            Self::Ext4 => "-F",
        }
    }
}

/// Layout strategy picked by the partition planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstallStrategy {
    /// Erase the disk and lay out a fresh partition table
    WipeDisk,
    /// Keep the existing OS and install into the trailing free space
    AlongsideExisting,
}

impl InstallStrategy {
    /// Returns true if the strategy destroys existing partitions.
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::WipeDisk)
    }
}

/// Storage class of a disk, as shown in the disk picker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum DiskKind {
    #[strum(to_string = "NVMe")]
    Nvme,
    #[strum(to_string = "SSD")]
    Ssd,
    #[strum(to_string = "HDD")]
    Hdd,
}
