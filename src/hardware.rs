//! Device Inspector: read-only probes of firmware and hardware state
//!
//! Nothing in this module mutates a device. Probes shell out to `lsblk`,
//! `parted`, `lspci` and `nvidia-smi` through the [`Executor`], and parse
//! their machine-readable output with pure functions so the parsing can be
//! tested against captured fixtures.
//!
//! # Failure Policy
//!
//! - Disk listing failures are errors: the planner cannot work without them.
//! - Foreign-filesystem and free-space probes report `None` when unreadable;
//!   the planner treats `None` as "not detected".
//! - GPU detection never fails; a broken probe means "no GPU".

use crate::command_executor::{CommandSpec, Executor};
use crate::error::{CommandError, InstallError, PlanningError};
use crate::types::{BootMode, DiskKind};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::thread;

/// Exposed by the kernel only when booted through UEFI.
pub const EFI_FIRMWARE_PATH: &str = "/sys/firmware/efi";

/// GPT partition type GUID of an EFI System Partition.
pub const ESP_PARTITION_TYPE: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

const LSBLK_COLUMNS: &str = "NAME,SIZE,MODEL,TRAN,ROTA,TYPE,FSTYPE,MOUNTPOINT,PARTTYPE";

// ============================================================================
// Firmware
// ============================================================================

/// Detect the firmware boot mode of this machine.
pub fn detect_boot_mode() -> BootMode {
    detect_boot_mode_at(Path::new(EFI_FIRMWARE_PATH))
}

/// Detect boot mode from an explicit firmware interface path.
pub fn detect_boot_mode_at(efi_path: &Path) -> BootMode {
    if efi_path.exists() {
        log::info!("UEFI firmware detected ({} exists)", efi_path.display());
        BootMode::Uefi
    } else {
        log::info!("BIOS firmware detected ({} not found)", efi_path.display());
        BootMode::Bios
    }
}

// ============================================================================
// Disk topology
// ============================================================================

/// A partition on a [`DeviceHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub path: String,
    pub size_bytes: u64,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    /// GPT type GUID or MBR type code
    pub part_type: Option<String>,
}

impl PartitionInfo {
    /// True for an EFI System Partition. A known partition type decides;
    /// vfat only counts when the type is unknown.
    pub fn is_efi_system(&self) -> bool {
        match self.part_type.as_deref() {
            Some(t) => t.eq_ignore_ascii_case(ESP_PARTITION_TYPE),
            None => self.fstype.as_deref() == Some("vfat"),
        }
    }

    /// True if the partition carries a Windows (NTFS) filesystem.
    pub fn is_foreign(&self) -> bool {
        self.fstype
            .as_deref()
            .is_some_and(|fs| fs.eq_ignore_ascii_case("ntfs"))
    }
}

/// Snapshot of one installable disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub path: String,
    pub size_bytes: u64,
    pub model: String,
    pub transport: Option<String>,
    pub rotational: Option<bool>,
    pub kind: DiskKind,
    pub partitions: Vec<PartitionInfo>,
}

impl DeviceHandle {
    /// An existing EFI System Partition, if the disk has one.
    pub fn efi_partition(&self) -> Option<&PartitionInfo> {
        self.partitions.iter().find(|p| p.is_efi_system())
    }

    pub fn has_foreign_filesystem(&self) -> bool {
        self.partitions.iter().any(PartitionInfo::is_foreign)
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(rename = "blockdevices")]
    block_devices: Vec<LsblkDevice>,
}

/// One entry of `lsblk --json`. Old lsblk versions print numbers and
/// booleans as strings, so those fields go through lenient deserializers.
#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    size: u64,
    model: Option<String>,
    tran: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    rota: Option<bool>,
    #[serde(rename = "type")]
    device_type: String,
    fstype: Option<String>,
    mountpoint: Option<String>,
    parttype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Bool(bool),
    Number(u64),
    Text(String),
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    use serde::de::Error;
    match Option::<Lenient>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Lenient::Number(n)) => Ok(n),
        Some(Lenient::Text(s)) => s.trim().parse().map_err(D::Error::custom),
        Some(Lenient::Bool(_)) => Err(D::Error::custom("expected a size, got a boolean")),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    Ok(match Option::<Lenient>::deserialize(deserializer)? {
        Some(Lenient::Bool(b)) => Some(b),
        Some(Lenient::Number(n)) => Some(n != 0),
        Some(Lenient::Text(s)) => match s.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        None => None,
    })
}

/// Classify a disk: transport first, then the rotational flag, then the
/// model string as a last resort.
pub fn classify_disk(transport: Option<&str>, rotational: Option<bool>, model: &str) -> DiskKind {
    if transport.is_some_and(|t| t.eq_ignore_ascii_case("nvme")) {
        return DiskKind::Nvme;
    }
    match rotational {
        Some(true) => DiskKind::Hdd,
        Some(false) => DiskKind::Ssd,
        None => {
            let model = model.to_ascii_lowercase();
            if model.contains("nvme") {
                DiskKind::Nvme
            } else if model.contains("ssd") {
                DiskKind::Ssd
            } else {
                DiskKind::Hdd
            }
        }
    }
}

fn to_handle(dev: LsblkDevice) -> DeviceHandle {
    let model = dev.model.unwrap_or_default().trim().to_string();
    let kind = classify_disk(dev.tran.as_deref(), dev.rota, &model);
    let partitions = dev
        .children
        .into_iter()
        .filter(|c| c.device_type == "part")
        .map(|c| PartitionInfo {
            path: c.name,
            size_bytes: c.size,
            fstype: c.fstype.filter(|s| !s.is_empty()),
            mountpoint: c.mountpoint.filter(|s| !s.is_empty()),
            part_type: c.parttype.filter(|s| !s.is_empty()),
        })
        .collect();
    DeviceHandle {
        path: dev.name,
        size_bytes: dev.size,
        model,
        transport: dev.tran,
        rotational: dev.rota,
        kind,
        partitions,
    }
}

/// Parse `lsblk --json --bytes --paths` output into every `disk` entry.
pub fn parse_lsblk(json: &str) -> Result<Vec<DeviceHandle>, PlanningError> {
    let output: LsblkOutput =
        serde_json::from_str(json).map_err(|e| PlanningError::Unparseable {
            what: "lsblk output".to_string(),
            reason: e.to_string(),
        })?;
    Ok(output
        .block_devices
        .into_iter()
        .filter(|d| d.device_type == "disk")
        .map(to_handle)
        .collect())
}

/// Parse lsblk output and keep only disks an installation can target:
/// no optical, loop or USB devices.
pub fn parse_installable_disks(json: &str) -> Result<Vec<DeviceHandle>, PlanningError> {
    Ok(parse_lsblk(json)?
        .into_iter()
        .filter(|d| {
            !d.transport
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("usb"))
        })
        .collect())
}

fn lsblk_spec() -> CommandSpec {
    CommandSpec::new("lsblk")
        .args(["--json", "--bytes", "--paths", "--output", LSBLK_COLUMNS])
        .read_only()
}

/// Enumerate installable disks.
pub fn list_disks(exec: &dyn Executor) -> Result<Vec<DeviceHandle>, InstallError> {
    let out = exec.execute(&lsblk_spec())?;
    let disks = parse_installable_disks(&out.stdout)?;
    log::info!("Found {} installable disk(s)", disks.len());
    Ok(disks)
}

/// Fresh snapshot of a single device.
pub fn inspect_disk(exec: &dyn Executor, device: &str) -> Result<DeviceHandle, InstallError> {
    let out = exec.execute(&lsblk_spec().arg(device))?;
    parse_lsblk(&out.stdout)?
        .into_iter()
        .next()
        .ok_or_else(|| PlanningError::DeviceNotFound(device.to_string()).into())
}

/// True if any partition on `device` has an NTFS signature.
pub fn detect_foreign_filesystem(exec: &dyn Executor, device: &str) -> Result<bool, InstallError> {
    Ok(inspect_disk(exec, device)?.has_foreign_filesystem())
}

// ============================================================================
// Partition table (parted machine output)
// ============================================================================

/// One line of `parted --machine ... unit MiB print [free]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartedEntry {
    pub number: u32,
    pub start_mib: f64,
    pub end_mib: f64,
    pub size_mib: f64,
    /// True for unallocated regions reported by `print free`
    pub free: bool,
}

fn parse_mib(field: &str) -> Option<f64> {
    field.trim().trim_end_matches("MiB").parse().ok()
}

/// Parse partition and free-space lines, skipping the `BYT;` header and the
/// disk description line.
pub fn parse_parted(output: &str) -> Vec<PartedEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_end_matches(';');
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 5 {
                return None;
            }
            let number = fields[0].parse().ok()?;
            Some(PartedEntry {
                number,
                start_mib: parse_mib(fields[1])?,
                end_mib: parse_mib(fields[2])?,
                size_mib: parse_mib(fields[3])?,
                free: fields[4] == "free",
            })
        })
        .collect()
}

/// Largest unallocated region, if parted reported any. The alongside
/// partition is planned into exactly this region.
pub fn largest_free_region(output: &str) -> Option<PartedEntry> {
    parse_parted(output)
        .into_iter()
        .filter(|e| e.free)
        .reduce(|best, e| if e.size_mib > best.size_mib { e } else { best })
}

/// Size of [`largest_free_region`] in MiB.
pub fn largest_free_region_mib(output: &str) -> Option<f64> {
    largest_free_region(output).map(|e| e.size_mib)
}

/// Raw `parted --machine ... print free` listing of `device`.
pub fn read_partition_table(exec: &dyn Executor, device: &str) -> Result<String, InstallError> {
    let out = exec.execute(
        &CommandSpec::privileged("parted")
            .args(["-s", "-m", device, "unit", "MiB", "print", "free"])
            .read_only(),
    )?;
    Ok(out.stdout)
}

/// True if a parted listing has a free region of at least `min_free_mib`.
pub fn has_usable_free_space(table: &str, min_free_mib: u64) -> bool {
    largest_free_region_mib(table).is_some_and(|mib| mib >= min_free_mib as f64)
}

/// True if the partition table of `device` has a free region of at least
/// `min_free_mib`.
pub fn detect_free_space(
    exec: &dyn Executor,
    device: &str,
    min_free_mib: u64,
) -> Result<bool, InstallError> {
    let table = read_partition_table(exec, device)?;
    Ok(has_usable_free_space(&table, min_free_mib))
}

/// Consistent snapshot of the strategy inputs for one disk.
///
/// `None` means the probe could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskProbe {
    pub foreign_fs: Option<bool>,
    pub free_space: Option<bool>,
    /// The parted listing the free-space answer was derived from
    #[serde(skip)]
    pub table: Option<String>,
}

/// Run both strategy probes concurrently and collect one snapshot.
pub fn probe_disk(exec: &dyn Executor, device: &str, min_free_mib: u64) -> DiskProbe {
    let (foreign, table) = thread::scope(|s| {
        let foreign = s.spawn(|| detect_foreign_filesystem(exec, device));
        let table = s.spawn(|| read_partition_table(exec, device));
        (foreign.join(), table.join())
    });

    let table = settle("partition table", table);
    let free_space = table.as_deref().map(|t| {
        let usable = has_usable_free_space(t, min_free_mib);
        log::info!(
            "Largest free region on {}: {:.0} MiB (usable: {})",
            device,
            largest_free_region_mib(t).unwrap_or(0.0),
            usable
        );
        usable
    });

    DiskProbe {
        foreign_fs: settle("foreign filesystem", foreign),
        free_space,
        table,
    }
}

fn settle<T>(what: &str, joined: thread::Result<Result<T, InstallError>>) -> Option<T> {
    match joined {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::warn!("{} probe failed, treating as unknown: {}", what, e);
            None
        }
        Err(_) => {
            log::warn!("{} probe panicked, treating as unknown", what);
            None
        }
    }
}

// ============================================================================
// GPU
// ============================================================================

/// Result of NVIDIA GPU detection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuReport {
    pub present: bool,
    pub models: Vec<String>,
}

/// Split one `lspci -mm` line into its quoted fields.
fn lspci_fields(line: &str) -> Vec<String> {
    line.split('"')
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, f)| f.to_string())
        .collect()
}

/// NVIDIA display controllers from `lspci -mm` output.
pub fn parse_lspci_nvidia(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let fields = lspci_fields(line);
            let (class, vendor, device) = (fields.first()?, fields.get(1)?, fields.get(2)?);
            let display = ["VGA", "3D", "Display"].iter().any(|c| class.contains(c));
            (display && vendor.to_ascii_uppercase().contains("NVIDIA")).then(|| device.clone())
        })
        .collect()
}

/// Detect an NVIDIA GPU. Never fails: probe errors mean "absent".
pub fn detect_gpu(exec: &dyn Executor) -> GpuReport {
    let lspci = match exec.execute(&CommandSpec::new("lspci").arg("-mm").read_only()) {
        Ok(out) => out,
        Err(e) => {
            log::warn!("GPU scan failed, assuming no NVIDIA GPU: {}", e);
            return GpuReport::default();
        }
    };

    let models = parse_lspci_nvidia(&lspci.stdout);
    if models.is_empty() {
        log::info!("No NVIDIA GPU found");
        return GpuReport::default();
    }

    let refined = nvidia_smi_models(exec).unwrap_or_default();
    let models = if refined.is_empty() { models } else { refined };
    log::info!("NVIDIA GPU detected: {:?}", models);
    GpuReport {
        present: true,
        models,
    }
}

/// Marketing names from the vendor utility, when it is installed.
fn nvidia_smi_models(exec: &dyn Executor) -> Result<Vec<String>, CommandError> {
    let out = exec.execute(
        &CommandSpec::new("nvidia-smi")
            .args(["--query-gpu=name", "--format=csv,noheader"])
            .read_only(),
    )?;
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}
