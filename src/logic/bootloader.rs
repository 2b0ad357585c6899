//! Bootloader Installer
//!
//! UEFI systems get systemd-boot on the ESP mounted at `/boot`; BIOS systems
//! get GRUB in the MBR of the target disk with os-prober enabled.
//!
//! Detecting and chainloading an existing Windows boot manager is the only
//! recoverable step: if it fails the system still boots, so the failure
//! becomes a warning.

use crate::command_executor::{CommandSpec, Executor};
use crate::config_file::InstallerConfig;
use crate::engine::partition::PartitionPlan;
use crate::error::InstallError;
use crate::logic::{read_target_file, write_target_file};
use crate::types::BootMode;
use std::path::Path;

/// Windows boot manager, relative to the ESP.
pub const WINDOWS_BOOT_MANAGER: &str = "EFI/Microsoft/Boot/bootmgfw.efi";

/// Install the bootloader for `plan.boot_mode`. Returns non-fatal warnings.
pub fn install_bootloader(
    exec: &dyn Executor,
    plan: &PartitionPlan,
    config: &InstallerConfig,
    root: &Path,
) -> Result<Vec<String>, InstallError> {
    match plan.boot_mode {
        BootMode::Uefi => install_systemd_boot(exec, plan, config, root),
        BootMode::Bios => install_grub(exec, plan, root).map(|()| Vec::new()),
    }
}

// ============================================================================
// UEFI: systemd-boot
// ============================================================================

/// Kernel command line for the root partition.
///
/// An empty PARTUUID (dry run, or blkid could not answer) falls back to the
/// device path.
pub fn kernel_options(partuuid: &str, root_device: &str, subvolume: bool) -> String {
    let root = if partuuid.is_empty() {
        root_device.to_string()
    } else {
        format!("PARTUUID={}", partuuid)
    };
    let mut options = format!("root={} rw", root);
    if subvolume {
        options.push_str(" rootflags=subvol=@");
    }
    options
}

pub fn loader_entry(title: &str, options: &str) -> String {
    format!(
        "title   {}\nlinux   /vmlinuz-linux\ninitrd  /initramfs-linux.img\noptions {}\n",
        title, options
    )
}

pub fn loader_conf(default_entry: &str, timeout_secs: u32) -> String {
    format!(
        "default {}.conf\ntimeout {}\nconsole-mode max\neditor no\n",
        default_entry, timeout_secs
    )
}

fn windows_entry() -> String {
    format!("title   Windows Boot Manager\nefi     /{}\n", WINDOWS_BOOT_MANAGER)
}

fn read_partuuid(exec: &dyn Executor, device: &str) -> Result<String, InstallError> {
    let out = exec.execute(
        &CommandSpec::privileged("blkid")
            .args(["-s", "PARTUUID", "-o", "value", device])
            .read_only(),
    )?;
    Ok(out.stdout.trim().to_string())
}

fn install_systemd_boot(
    exec: &dyn Executor,
    plan: &PartitionPlan,
    config: &InstallerConfig,
    root: &Path,
) -> Result<Vec<String>, InstallError> {
    log::info!("Installing systemd-boot");
    exec.execute(&CommandSpec::in_root(root, "bootctl").args(["--esp-path=/boot", "install"]))?;

    let partuuid = read_partuuid(exec, &plan.root_partition)?;
    let options = kernel_options(
        &partuuid,
        &plan.root_partition,
        config.root_filesystem.supports_subvolumes(),
    );

    let loader = root.join("boot/loader");
    let entry_name = config.distribution.as_str();
    write_target_file(
        &loader.join("entries").join(format!("{}.conf", entry_name)),
        &loader_entry(&pretty_name(entry_name), &options),
    )?;

    let mut warnings = Vec::new();
    if let Err(e) = add_windows_entry(root, &loader) {
        log::warn!("Skipping Windows boot entry: {}", e);
        warnings.push(format!("Windows boot entry was not created: {}", e));
    }

    write_target_file(
        &loader.join("loader.conf"),
        &loader_conf(entry_name, config.boot_menu_timeout_secs),
    )?;
    Ok(warnings)
}

/// Chainload entry for an existing Windows installation on the ESP.
fn add_windows_entry(root: &Path, loader: &Path) -> Result<(), InstallError> {
    let manager = root.join("boot").join(WINDOWS_BOOT_MANAGER);
    let present = manager
        .try_exists()
        .map_err(|e| InstallError::io("Failed to probe Windows boot manager", &manager, e))?;
    if !present {
        log::info!("No Windows boot manager on the ESP");
        return Ok(());
    }
    log::info!("Windows boot manager found, adding boot entry");
    write_target_file(&loader.join("entries/windows.conf"), &windows_entry())
}

fn pretty_name(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => format!("{}{} Linux", first.to_ascii_uppercase(), chars.as_str()),
        None => "Linux".to_string(),
    }
}

// ============================================================================
// BIOS: GRUB
// ============================================================================

/// Set `GRUB_DISABLE_OS_PROBER=false`, replacing a commented or existing
/// setting or appending one.
pub fn enable_os_prober(content: &str) -> String {
    const KEY: &str = "GRUB_DISABLE_OS_PROBER";
    let setting = format!("{}=false", KEY);
    let mut replaced = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if !replaced && line.trim_start_matches('#').trim_start().starts_with(KEY) {
                replaced = true;
                setting.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(setting);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn install_grub(exec: &dyn Executor, plan: &PartitionPlan, root: &Path) -> Result<(), InstallError> {
    log::info!("Installing GRUB to {}", plan.disk);
    exec.execute(
        &CommandSpec::in_root(root, "pacman").args(["-S", "--noconfirm", "--needed", "grub", "os-prober"]),
    )?;
    exec.execute(
        &CommandSpec::in_root(root, "grub-install").args(["--target=i386-pc", plan.disk.as_str()]),
    )?;

    let defaults = root.join("etc/default/grub");
    let current = read_target_file(&defaults)?.unwrap_or_default();
    write_target_file(&defaults, &enable_os_prober(&current))?;

    exec.execute(&CommandSpec::in_root(root, "grub-mkconfig").args(["-o", "/boot/grub/grub.cfg"]))?;
    Ok(())
}
