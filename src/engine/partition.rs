//! Partition Planner
//!
//! Picks the layout strategy for the target disk and turns it into an ordered
//! list of [`DiskOp`]s. Planning is pure; [`apply_partition_plan`] is the only
//! function here that touches the disk.
//!
//! # Strategies
//!
//! | Strategy          | Firmware | Operations |
//! |-------------------|----------|------------|
//! | WipeDisk          | UEFI     | Wipe → gpt label → ESP (+esp flag) → root → rescan |
//! | WipeDisk          | BIOS     | Wipe → msdos label → root (+boot flag) → rescan |
//! | AlongsideExisting | any      | root in the largest free region → rescan |
//!
//! The decision is made from one [`DiskProbe`] snapshot. Once
//! [`apply_partition_plan`] starts issuing commands there is no way back.

use crate::command_executor::{CommandSpec, Executor};
use crate::config_file::InstallerConfig;
use crate::error::{InstallError, PlanningError};
use crate::hardware::{self, parse_parted, DeviceHandle, DiskProbe, PartedEntry};
use crate::types::{BootMode, Filesystem, InstallStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest primary partition number on an msdos label.
const MSDOS_PRIMARY_LIMIT: u32 = 4;

// ============================================================================
// Disk operations
// ============================================================================

/// A single partition-table operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskOp {
    /// Erase filesystem and partition-table signatures
    WipeSignatures { disk: String },
    /// Write a fresh partition table
    CreateLabel { disk: String, label: String },
    /// `parted mkpart`; `name` is the GPT name or the msdos partition type
    CreatePartition {
        disk: String,
        name: String,
        fs_hint: String,
        start: String,
        end: String,
    },
    SetFlag { disk: String, number: u32, flag: String },
    /// Make the kernel re-read the table and wait for udev
    Rescan { disk: String },
}

impl DiskOp {
    /// Commands that carry out this operation, in order.
    pub fn commands(&self) -> Vec<CommandSpec> {
        match self {
            Self::WipeSignatures { disk } => {
                vec![CommandSpec::privileged("wipefs").args(["--all", "--force", disk.as_str()])]
            }
            Self::CreateLabel { disk, label } => {
                vec![CommandSpec::privileged("parted").args(["-s", disk.as_str(), "mklabel", label.as_str()])]
            }
            Self::CreatePartition {
                disk,
                name,
                fs_hint,
                start,
                end,
            } => vec![CommandSpec::privileged("parted").args([
                "-s",
                "-a",
                "optimal",
                disk.as_str(),
                "mkpart",
                name.as_str(),
                fs_hint.as_str(),
                start.as_str(),
                end.as_str(),
            ])],
            Self::SetFlag { disk, number, flag } => vec![CommandSpec::privileged("parted")
                .args(["-s", disk.as_str(), "set"])
                .arg(number.to_string())
                .args([flag.as_str(), "on"])],
            Self::Rescan { disk } => vec![
                CommandSpec::privileged("partprobe").arg(disk.as_str()),
                CommandSpec::privileged("udevadm").arg("settle"),
            ],
        }
    }

    pub fn is_destructive(&self) -> bool {
        !matches!(self, Self::Rescan { .. })
    }
}

impl fmt::Display for DiskOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WipeSignatures { disk } => write!(f, "WipeSignatures({})", disk),
            Self::CreateLabel { disk, label } => write!(f, "CreateLabel({}, {})", disk, label),
            Self::CreatePartition {
                disk,
                name,
                start,
                end,
                ..
            } => write!(f, "CreatePartition({}, {}, {}..{})", disk, name, start, end),
            Self::SetFlag { disk, number, flag } => {
                write!(f, "SetFlag({}#{}, {})", disk, number, flag)
            }
            Self::Rescan { disk } => write!(f, "Rescan({})", disk),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Result of planning: which partitions the later stages work with, and the
/// operations that create them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub disk: String,
    pub strategy: InstallStrategy,
    pub boot_mode: BootMode,
    pub root_partition: String,
    /// ESP created by this plan; the stager formats it
    pub efi_partition: Option<String>,
    /// ESP that already existed and is reused as-is (alongside on UEFI)
    pub existing_efi_partition: Option<String>,
    #[serde(skip)]
    pub ops: Vec<DiskOp>,
    /// Where the alongside partition begins; used to find it after rescan
    #[serde(skip)]
    pub new_partition_start_mib: Option<u64>,
}

impl PartitionPlan {
    /// The ESP to mount at `/boot`, new or reused.
    pub fn boot_partition(&self) -> Option<&str> {
        self.efi_partition
            .as_deref()
            .or(self.existing_efi_partition.as_deref())
    }

    pub fn is_destructive(&self) -> bool {
        self.ops.iter().any(DiskOp::is_destructive)
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Partition Plan: {} ({})", self.strategy, self.boot_mode),
            format!("  Target: {}", self.disk),
            format!("  Root: {}", self.root_partition),
            format!("  ESP: {}", self.boot_partition().unwrap_or("none")),
            format!("  Operations ({}):", self.ops.len()),
        ];
        for (i, op) in self.ops.iter().enumerate() {
            lines.push(format!("    {}. {}", i + 1, op));
        }
        lines.join("\n")
    }
}

/// Alongside only when a foreign OS and usable free space were both
/// positively detected. Unreadable probes count as "not detected".
pub fn choose_strategy(probe: &DiskProbe) -> InstallStrategy {
    match (probe.foreign_fs, probe.free_space) {
        (Some(true), Some(true)) => InstallStrategy::AlongsideExisting,
        _ => InstallStrategy::WipeDisk,
    }
}

/// Partition device path: `/dev/sda` + 2 → `/dev/sda2`,
/// `/dev/nvme0n1` + 2 → `/dev/nvme0n1p2`.
pub fn partition_path(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

/// Free region the alongside partition is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlongsideSlot {
    pub start_mib: u64,
    /// `None` when the region runs to the end of the disk
    pub end_mib: Option<u64>,
    pub size_mib: u64,
    /// Number parted will give the new partition
    pub number: u32,
}

impl AlongsideSlot {
    fn start(&self) -> String {
        format!("{}MiB", self.start_mib)
    }

    fn end(&self) -> String {
        match self.end_mib {
            Some(end) => format!("{}MiB", end),
            None => "100%".to_string(),
        }
    }
}

/// Lowest partition number not in use. parted fills gaps on GPT, and an
/// msdos primary partition must fit in 1..=4.
pub fn next_partition_number(used: &[u32], msdos: bool) -> Option<u32> {
    let limit = if msdos { MSDOS_PRIMARY_LIMIT } else { u32::MAX };
    (1..=limit).find(|n| !used.contains(n))
}

/// Place the alongside partition in the largest free region of `table`,
/// the same region the free-space probe measured.
pub fn alongside_slot(table: &str) -> Option<AlongsideSlot> {
    let region = hardware::largest_free_region(table)?;
    let partitions: Vec<PartedEntry> = parse_parted(table).into_iter().filter(|e| !e.free).collect();

    // parted reports free regions with sub-MiB fractions; stay inside them
    let start_mib = (region.start_mib.ceil() as u64).max(1);
    let end_floor = region.end_mib.floor() as u64;
    if end_floor <= start_mib {
        return None;
    }
    let trailing = !partitions.iter().any(|p| p.start_mib >= region.end_mib);
    let end_mib = if trailing { None } else { Some(end_floor) };

    let used: Vec<u32> = partitions.iter().map(|p| p.number).collect();
    let msdos = table_label(Some(table)).as_deref() == Some("msdos");
    let number = next_partition_number(&used, msdos)?;

    Some(AlongsideSlot {
        start_mib,
        end_mib,
        size_mib: end_floor - start_mib,
        number,
    })
}

/// Partition table label from the disk line of a parted listing.
fn table_label(table: Option<&str>) -> Option<String> {
    table?
        .lines()
        .find(|l| l.starts_with("/dev/"))
        .and_then(|l| l.split(':').nth(5))
        .map(str::to_string)
}

fn fs_hint(fs: Filesystem) -> String {
    fs.to_string()
}

/// Build the partition plan for `disk` from one probe snapshot.
pub fn plan_partitions(
    disk: &DeviceHandle,
    boot_mode: BootMode,
    probe: &DiskProbe,
    config: &InstallerConfig,
) -> Result<PartitionPlan, PlanningError> {
    if !disk.path.starts_with("/dev/") {
        return Err(PlanningError::InvalidDevicePath(disk.path.clone()));
    }
    let minimum_bytes = config.min_disk_size_mib * 1024 * 1024;
    if disk.size_bytes < minimum_bytes {
        return Err(PlanningError::DiskTooSmall {
            device: disk.path.clone(),
            size_bytes: disk.size_bytes,
            minimum_bytes,
        });
    }

    let strategy = choose_strategy(probe);
    log::info!(
        "Strategy for {}: {} (foreign fs: {:?}, free space: {:?})",
        disk.path,
        strategy,
        probe.foreign_fs,
        probe.free_space
    );

    let plan = match strategy {
        InstallStrategy::WipeDisk => plan_wipe(disk, boot_mode, config),
        InstallStrategy::AlongsideExisting => plan_alongside(disk, boot_mode, probe, config)?,
    };
    log::info!("{}", plan.summary());
    Ok(plan)
}

/// Fresh table: ESP + root on UEFI, a single bootable root on BIOS.
fn plan_wipe(disk: &DeviceHandle, boot_mode: BootMode, config: &InstallerConfig) -> PartitionPlan {
    let path = disk.path.clone();
    let fs = fs_hint(config.root_filesystem);
    let mut ops = vec![
        DiskOp::WipeSignatures { disk: path.clone() },
        DiskOp::CreateLabel {
            disk: path.clone(),
            label: boot_mode.partition_label().to_string(),
        },
    ];

    let (root_number, efi_partition) = match boot_mode {
        BootMode::Uefi => {
            let esp_end = format!("{}MiB", 1 + config.efi_size_mib);
            ops.push(DiskOp::CreatePartition {
                disk: path.clone(),
                name: "ESP".to_string(),
                fs_hint: "fat32".to_string(),
                start: "1MiB".to_string(),
                end: esp_end.clone(),
            });
            ops.push(DiskOp::SetFlag {
                disk: path.clone(),
                number: 1,
                flag: "esp".to_string(),
            });
            ops.push(DiskOp::CreatePartition {
                disk: path.clone(),
                name: "root".to_string(),
                fs_hint: fs,
                start: esp_end,
                end: "100%".to_string(),
            });
            (2, Some(partition_path(&path, 1)))
        }
        BootMode::Bios => {
            ops.push(DiskOp::CreatePartition {
                disk: path.clone(),
                name: "primary".to_string(),
                fs_hint: fs,
                start: "1MiB".to_string(),
                end: "100%".to_string(),
            });
            ops.push(DiskOp::SetFlag {
                disk: path.clone(),
                number: 1,
                flag: "boot".to_string(),
            });
            (1, None)
        }
    };
    ops.push(DiskOp::Rescan { disk: path.clone() });

    PartitionPlan {
        root_partition: partition_path(&path, root_number),
        disk: path,
        strategy: InstallStrategy::WipeDisk,
        boot_mode,
        efi_partition,
        existing_efi_partition: None,
        ops,
        new_partition_start_mib: None,
    }
}

/// One new partition in the largest free region; an existing ESP is reused.
fn plan_alongside(
    disk: &DeviceHandle,
    boot_mode: BootMode,
    probe: &DiskProbe,
    config: &InstallerConfig,
) -> Result<PartitionPlan, PlanningError> {
    let path = disk.path.clone();

    let existing_efi_partition = match boot_mode {
        BootMode::Uefi => match disk.efi_partition() {
            Some(esp) => Some(esp.path.clone()),
            None => return Err(PlanningError::MissingEfiPartition(path)),
        },
        BootMode::Bios => None,
    };

    let table = probe.table.as_deref().unwrap_or_default();
    let label = table_label(Some(table));
    let insufficient = |largest_mib: u64| PlanningError::InsufficientFreeSpace {
        device: path.clone(),
        largest_mib,
        required_mib: config.min_free_space_mib,
    };
    let region = hardware::largest_free_region(table).ok_or_else(|| insufficient(0))?;
    let slot = match alongside_slot(table) {
        Some(slot) if slot.size_mib >= config.min_free_space_mib => slot,
        Some(slot) => return Err(insufficient(slot.size_mib)),
        None if region.size_mib >= config.min_free_space_mib as f64 => {
            return Err(PlanningError::NoPartitionNumber(path.clone()));
        }
        None => return Err(insufficient(region.size_mib as u64)),
    };
    let name = match label.as_deref() {
        Some("msdos") => "primary",
        _ => "root",
    };

    let ops = vec![
        DiskOp::CreatePartition {
            disk: path.clone(),
            name: name.to_string(),
            fs_hint: fs_hint(config.root_filesystem),
            start: slot.start(),
            end: slot.end(),
        },
        DiskOp::Rescan { disk: path.clone() },
    ];

    Ok(PartitionPlan {
        root_partition: partition_path(&path, slot.number),
        disk: path,
        strategy: InstallStrategy::AlongsideExisting,
        boot_mode,
        efi_partition: None,
        existing_efi_partition,
        ops,
        new_partition_start_mib: Some(slot.start_mib),
    })
}

/// Number of the partition parted actually created at `start_mib`.
/// Alignment may move the start forward by less than a MiB.
pub fn find_created_partition(table: &str, start_mib: u64) -> Option<u32> {
    let start = start_mib as f64;
    parse_parted(table)
        .into_iter()
        .find(|e| !e.free && e.start_mib >= start - 0.5 && e.start_mib < start + 1.0)
        .map(|e| e.number)
}

/// Issue the plan's commands in order, stopping at the first failure.
///
/// An alongside plan re-reads the table after the rescan and points
/// `root_partition` at the partition parted really created.
pub fn apply_partition_plan(exec: &dyn Executor, plan: &mut PartitionPlan) -> Result<(), InstallError> {
    for op in &plan.ops {
        log::info!("Partition step: {}", op);
        for spec in op.commands() {
            exec.execute(&spec)?;
        }
    }

    let Some(start_mib) = plan.new_partition_start_mib else {
        return Ok(());
    };
    let created = hardware::read_partition_table(exec, &plan.disk)
        .map(|table| find_created_partition(&table, start_mib));
    match created {
        Ok(Some(number)) => {
            let actual = partition_path(&plan.disk, number);
            if actual != plan.root_partition {
                log::warn!(
                    "parted created {} instead of the expected {}",
                    actual,
                    plan.root_partition
                );
                plan.root_partition = actual;
            }
        }
        Ok(None) => log::warn!(
            "No partition starts at {} MiB on {} after rescan, keeping {}",
            start_mib,
            plan.disk,
            plan.root_partition
        ),
        Err(e) => log::warn!("Could not re-read the partition table: {}", e),
    }
    Ok(())
}
