//! Base System Installer
//!
//! Bootstraps the package set into the mounted root and configures the new
//! system: timezone, locale, keyboard, hostname, root account and network.
//!
//! # Failure Policy
//!
//! Everything here is fatal except the NVIDIA driver installation. A driver
//! that fails to install leaves a bootable system with the open source
//! driver, so that failure is logged and returned as a warning.
//!
//! The user's language and keyboard come in as an explicit
//! [`InstallerSettings`] snapshot; this module never reads shared state.

use crate::command_executor::{CommandSpec, Executor};
use crate::config_file::InstallerConfig;
use crate::error::InstallError;
use crate::hardware::GpuReport;
use crate::logic::{read_target_file, write_target_file};
use crate::settings::{InstallerSettings, FALLBACK_LOCALE};
use std::path::Path;

// ============================================================================
// Bootstrap
// ============================================================================

/// `pacstrap`, fstab generation and keyring initialization.
pub fn bootstrap(
    exec: &dyn Executor,
    config: &InstallerConfig,
    root: &Path,
) -> Result<(), InstallError> {
    let root_arg = root.display().to_string();
    log::info!("Bootstrapping {} package(s) into {}", config.base_packages.len(), root_arg);

    exec.execute(
        &CommandSpec::privileged("pacstrap")
            .args(["-K", root_arg.as_str()])
            .args(config.base_packages.iter().map(String::as_str)),
    )?;

    let fstab = exec.execute(&CommandSpec::privileged("genfstab").args(["-U", root_arg.as_str()]))?;
    let fstab_path = root.join("etc/fstab");
    let existing = read_target_file(&fstab_path)?.unwrap_or_default();
    write_target_file(&fstab_path, &format!("{}{}", existing, fstab.stdout))?;

    exec.execute(&CommandSpec::in_root(root, "pacman-key").arg("--init"))?;
    exec.execute(&CommandSpec::in_root(root, "pacman-key").arg("--populate"))?;
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

/// Enable `locales` in a `locale.gen` file, uncommenting existing entries and
/// appending missing ones.
pub fn enable_locales(content: &str, locales: &[&str]) -> String {
    let entries: Vec<String> = locales.iter().map(|l| locale_gen_entry(l)).collect();
    let mut found = vec![false; entries.len()];

    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            let bare = line.trim_start_matches('#').trim();
            match entries.iter().position(|e| e == bare) {
                Some(i) => {
                    found[i] = true;
                    bare.to_string()
                }
                None => line.to_string(),
            }
        })
        .collect();

    for (entry, present) in entries.iter().zip(&found) {
        if !present && !lines.contains(entry) {
            lines.push(entry.clone());
        }
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// `de_DE.UTF-8` → `de_DE.UTF-8 UTF-8`
fn locale_gen_entry(locale: &str) -> String {
    let charset = locale.split_once('.').map(|(_, c)| c).unwrap_or("UTF-8");
    format!("{} {}", locale, charset)
}

pub fn hosts_file(hostname: &str) -> String {
    format!(
        "127.0.0.1\tlocalhost\n::1\t\tlocalhost\n127.0.1.1\t{0}.localdomain\t{0}\n",
        hostname
    )
}

/// Console keymaps whose base name differs from the XKB layout.
const XKB_ALIASES: &[(&str, &str)] = &[("uk", "gb"), ("sv", "se"), ("cf", "ca"), ("la", "latam")];

/// XKB layout for a console keymap: `de-latin1` → `de`, `uk` → `gb`.
pub fn xkb_layout(keymap: &str) -> &str {
    let base = keymap.split('-').next().unwrap_or(keymap);
    XKB_ALIASES
        .iter()
        .find(|(console, _)| *console == base)
        .map_or(base, |(_, xkb)| *xkb)
}

pub fn x11_keyboard_conf(layout: &str) -> String {
    format!(
        "Section \"InputClass\"\n\
         \x20   Identifier \"system-keyboard\"\n\
         \x20   MatchIsKeyboard \"on\"\n\
         \x20   Option \"XkbLayout\" \"{}\"\n\
         EndSection\n",
        layout
    )
}

fn apply_timezone(exec: &dyn Executor, root: &Path, timezone: &str) -> Result<(), InstallError> {
    log::info!("Setting timezone to {}", timezone);
    exec.execute(&CommandSpec::in_root(root, "ln").args([
        "-sf".to_string(),
        format!("/usr/share/zoneinfo/{}", timezone),
        "/etc/localtime".to_string(),
    ]))?;
    exec.execute(&CommandSpec::in_root(root, "hwclock").arg("--systohc"))?;
    Ok(())
}

fn apply_locale(
    exec: &dyn Executor,
    root: &Path,
    settings: &InstallerSettings,
) -> Result<(), InstallError> {
    log::info!("Configuring locale {}", settings.locale);
    let locale_gen = root.join("etc/locale.gen");
    let current = read_target_file(&locale_gen)?.unwrap_or_default();
    let locales = [settings.locale.as_str(), FALLBACK_LOCALE];
    write_target_file(&locale_gen, &enable_locales(&current, &locales))?;
    write_target_file(
        &root.join("etc/locale.conf"),
        &format!("LANG={}\n", settings.locale),
    )?;
    exec.execute(&CommandSpec::in_root(root, "locale-gen"))?;
    Ok(())
}

fn apply_keyboard(root: &Path, layout: &str) -> Result<(), InstallError> {
    log::info!("Configuring keyboard layout {}", layout);
    write_target_file(&root.join("etc/vconsole.conf"), &format!("KEYMAP={}\n", layout))?;
    write_target_file(
        &root.join("etc/X11/xorg.conf.d/00-keyboard.conf"),
        &x11_keyboard_conf(xkb_layout(layout)),
    )
}

/// Configure the bootstrapped system.
pub fn configure(
    exec: &dyn Executor,
    config: &InstallerConfig,
    settings: &InstallerSettings,
    timezone: &str,
    root: &Path,
) -> Result<(), InstallError> {
    apply_timezone(exec, root, timezone)?;
    apply_locale(exec, root, settings)?;
    apply_keyboard(root, &settings.keyboard_layout)?;

    write_target_file(&root.join("etc/hostname"), &format!("{}\n", config.hostname))?;
    write_target_file(&root.join("etc/hosts"), &hosts_file(&config.hostname))?;

    exec.execute(&CommandSpec::in_root(root, "passwd").args(["-d", "root"]))?;
    exec.execute(&CommandSpec::in_root(root, "systemctl").args(["enable", "NetworkManager"]))?;
    Ok(())
}

/// Install the proprietary driver when an NVIDIA GPU was detected.
///
/// Returns a warning instead of an error when the installation fails.
pub fn install_gpu_drivers(
    exec: &dyn Executor,
    config: &InstallerConfig,
    gpu: &GpuReport,
    root: &Path,
) -> Option<String> {
    if !gpu.present || config.nvidia_packages.is_empty() {
        return None;
    }
    log::info!("Installing NVIDIA driver for {:?}", gpu.models);
    let spec = CommandSpec::in_root(root, "pacman")
        .args(["-S", "--noconfirm", "--needed"])
        .args(config.nvidia_packages.iter().map(String::as_str));
    match exec.execute(&spec) {
        Ok(_) => None,
        Err(e) => {
            log::warn!("NVIDIA driver installation failed, continuing: {}", e);
            Some(format!("NVIDIA driver installation failed: {}", e.command))
        }
    }
}
